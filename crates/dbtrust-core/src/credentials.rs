// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Credential manager: generates, loads, and exposes the current versioned
//! credential set; owns the generation policy.

use crate::envelope::generate_password;
use crate::error::{Error, Result};
use crate::store::CredentialStore;
use crate::types::{CredentialSet, DBRole, EncryptionMethod, RoleCredential};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

/// Generates, persists, and exposes the current `CredentialSet`.
pub struct CredentialManager {
    store: CredentialStore,
    current: RwLock<CredentialSet>,
    rotation_interval: Duration,
    password_length: usize,
    encryption_method: EncryptionMethod,
    rotation_signal: AtomicBool,
}

impl CredentialManager {
    /// `initialize()`: load the persisted set, or generate version 1 and
    /// persist it if none exists. Any other load failure propagates.
    pub async fn initialize(
        store: CredentialStore,
        rotation_interval: Duration,
        password_length: usize,
        encryption_method: EncryptionMethod,
    ) -> Result<Self> {
        let current = match store.load().await {
            Ok(credset) => credset,
            Err(Error::CredentialsNotFound(_)) => {
                let fresh = Self::generate_set(1, None, rotation_interval, password_length, encryption_method);
                store.save(&fresh).await?;
                fresh
            }
            Err(err) => return Err(err),
        };

        Ok(Self {
            store,
            current: RwLock::new(current),
            rotation_interval,
            password_length,
            encryption_method,
            rotation_signal: AtomicBool::new(false),
        })
    }

    /// `generate(version)`: a fresh `CredentialSet` with every role stamped
    /// `active` and shared timestamps.
    pub fn generate(&self, version: u64, previous: Option<Box<CredentialSet>>) -> CredentialSet {
        Self::generate_set(
            version,
            previous,
            self.rotation_interval,
            self.password_length,
            self.encryption_method,
        )
    }

    fn generate_set(
        version: u64,
        previous: Option<Box<CredentialSet>>,
        rotation_interval: Duration,
        password_length: usize,
        encryption_method: EncryptionMethod,
    ) -> CredentialSet {
        let generated_at = Utc::now();
        let expires_at = generated_at
            + ChronoDuration::from_std(rotation_interval).unwrap_or_else(|_| ChronoDuration::days(7));
        let effective_len = password_length.max(32);

        let make_cred = |username: &str| {
            RoleCredential::new(
                username.to_string(),
                generate_password(effective_len),
                generated_at,
                expires_at,
            )
        };

        let mut roles = HashMap::new();
        for role in DBRole::JOB_ROLES {
            roles.insert(role, make_cred(role.username()));
        }

        CredentialSet {
            version,
            generated_at,
            expires_at,
            encryption_method,
            superuser: make_cred(DBRole::Superuser.username()),
            admin: make_cred(DBRole::Admin.username()),
            roles,
            previous,
        }
    }

    /// Returns the in-memory current set under a read lock.
    pub async fn current(&self) -> CredentialSet {
        self.current.read().await.clone()
    }

    /// Resolves a single role's credential from the current set.
    pub async fn get_role(&self, role: DBRole) -> Result<RoleCredential> {
        let current = self.current.read().await;
        current
            .get(role)
            .cloned()
            .ok_or_else(|| Error::RoleNotFound(role.to_string()))
    }

    /// Admin plus the five job roles; never the superuser.
    pub async fn all_roles(&self) -> HashMap<DBRole, RoleCredential> {
        self.current.read().await.all_roles()
    }

    /// True iff the current set has expired.
    pub async fn needs_rotation(&self) -> bool {
        Utc::now() > self.current.read().await.expires_at
    }

    /// Non-blocking trigger; subsequent triggers before the signal is
    /// drained are coalesced into a single pending rotation.
    pub fn trigger_rotation(&self) {
        self.rotation_signal.store(true, Ordering::SeqCst);
    }

    /// Drains the manual-trigger signal, returning whether it was set.
    pub fn take_rotation_trigger(&self) -> bool {
        self.rotation_signal.swap(false, Ordering::SeqCst)
    }

    /// Publishes a new current set. Only the rotation coordinator calls this.
    pub(crate) async fn publish(&self, new_set: CredentialSet) -> Result<()> {
        self.store.save(&new_set).await?;
        *self.current.write().await = new_set;
        Ok(())
    }

    pub(crate) fn store(&self) -> &CredentialStore {
        &self.store
    }
}

/// Diagnostic rendering that never includes passwords, per the redaction
/// contract the data model enforces at the type level. Kept as a free
/// function so call sites that only have a borrowed `CredentialSet` (not
/// through a manager) can still redact consistently.
pub fn redacted_summary(credset: &CredentialSet) -> String {
    format!("{:?}", credset)
}
