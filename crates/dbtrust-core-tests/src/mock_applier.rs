// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! A hand-written `RoleApplier` double for rotation-coordinator tests.
//!
//! Mirrors the shape of a real connection-pool/role manager without talking
//! to an actual database: it records every call it receives and lets tests
//! inject failures at any of the three mutating steps.

use async_trait::async_trait;
use dbtrust_core::{CredentialSet, RoleApplier, RotationEvent};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Mutex;

/// Failures to inject at each phase, one-shot (consumed on first trigger).
#[derive(Debug, Default, Clone, Copy)]
pub struct InjectedFailures {
    pub create_roles: bool,
    pub update_pool: bool,
    pub drop_roles: bool,
}

#[derive(Debug, Default)]
struct Recorded {
    create_roles_versions: Vec<u64>,
    update_pool_versions: Vec<u64>,
    drop_roles_versions: Vec<u64>,
    audited_events: Vec<RotationEvent>,
}

/// Records every `RoleApplier` call it receives; tests assert against the
/// recorded call log instead of a live database.
#[derive(Default)]
pub struct MockRoleApplier {
    inject: InjectedFailures,
    create_calls: AtomicU32,
    update_calls: AtomicU32,
    drop_calls: AtomicU32,
    recorded: Mutex<Recorded>,
}

impl MockRoleApplier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_injected_failures(inject: InjectedFailures) -> Self {
        Self {
            inject,
            ..Self::default()
        }
    }

    pub fn create_roles_call_count(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn update_pool_call_count(&self) -> u32 {
        self.update_calls.load(Ordering::SeqCst)
    }

    pub fn drop_roles_call_count(&self) -> u32 {
        self.drop_calls.load(Ordering::SeqCst)
    }

    pub async fn created_versions(&self) -> Vec<u64> {
        self.recorded.lock().await.create_roles_versions.clone()
    }

    pub async fn updated_versions(&self) -> Vec<u64> {
        self.recorded.lock().await.update_pool_versions.clone()
    }

    pub async fn dropped_versions(&self) -> Vec<u64> {
        self.recorded.lock().await.drop_roles_versions.clone()
    }

    pub async fn audited_events(&self) -> Vec<RotationEvent> {
        self.recorded.lock().await.audited_events.clone()
    }
}

#[async_trait]
impl RoleApplier for MockRoleApplier {
    async fn create_roles(
        &self,
        new_set: &CredentialSet,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.recorded.lock().await.create_roles_versions.push(new_set.version);
        if self.inject.create_roles {
            return Err("mock create_roles failure".into());
        }
        Ok(())
    }

    async fn update_pool(
        &self,
        new_set: &CredentialSet,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        self.recorded.lock().await.update_pool_versions.push(new_set.version);
        if self.inject.update_pool {
            return Err("mock update_pool failure".into());
        }
        Ok(())
    }

    async fn drop_roles(
        &self,
        old_set: &CredentialSet,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.drop_calls.fetch_add(1, Ordering::SeqCst);
        self.recorded.lock().await.drop_roles_versions.push(old_set.version);
        if self.inject.drop_roles {
            return Err("mock drop_roles failure".into());
        }
        Ok(())
    }

    async fn audit_rotation(&self, event: &RotationEvent) {
        self.recorded.lock().await.audited_events.push(event.clone());
    }
}
