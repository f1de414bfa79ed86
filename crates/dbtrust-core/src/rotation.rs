// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Rotation coordinator: drives the multi-phase rotation state machine,
//! invoking external appliers at each phase.
//!
//! `idle -> preparing -> transitioning -> finalizing -> complete`, with any
//! intermediate state able to fall to `failed` on a fatal error.

use crate::credentials::CredentialManager;
use crate::error::{Error, Result};
use crate::types::{CredentialStatus, DBRole, DualCredentialSet, RotationEvent, RotationState};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Capability the coordinator invokes at each rotation phase. Implementors
/// are the caller's connection to the actual database/pool.
#[async_trait]
pub trait RoleApplier: Send + Sync {
    /// Must be idempotent: creating an already-present role is success.
    async fn create_roles(
        &self,
        new_set: &crate::types::CredentialSet,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Atomically switches the shared connection pool to the new passwords;
    /// must return only after new connections are being issued with them.
    async fn update_pool(
        &self,
        new_set: &crate::types::CredentialSet,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Deletes the old database roles. May fail without failing the rotation.
    async fn drop_roles(
        &self,
        old_set: &crate::types::CredentialSet,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Emits the `complete`/`failed` event to the audit chain. Best-effort:
    /// failures here are logged, not propagated.
    async fn audit_rotation(&self, event: &RotationEvent);
}

/// Bounded history of rotation events. Capped at 100 entries; the oldest is
/// dropped (and logged at debug) once the cap is exceeded.
pub struct RotationHistory {
    events: VecDeque<RotationEvent>,
    capacity: usize,
}

impl RotationHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, event: RotationEvent) {
        if self.events.len() >= self.capacity {
            if let Some(dropped) = self.events.pop_front() {
                tracing::debug!(
                    "rotation history at capacity ({}), dropping oldest event from {}",
                    self.capacity,
                    dropped.timestamp
                );
            }
        }
        self.events.push_back(event);
    }

    pub fn iter(&self) -> impl Iterator<Item = &RotationEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn last(&self) -> Option<&RotationEvent> {
        self.events.back()
    }
}

impl Default for RotationHistory {
    fn default() -> Self {
        Self::new(100)
    }
}

struct TransitionalView {
    active: crate::types::CredentialSet,
    retiring: crate::types::CredentialSet,
}

/// Drives the rotation state machine against a `CredentialManager` and an
/// external `RoleApplier`.
pub struct RotationCoordinator<A: RoleApplier> {
    manager: Arc<CredentialManager>,
    applier: Arc<A>,
    state: Mutex<RotationState>,
    history: Mutex<RotationHistory>,
    transitional: RwLock<Option<TransitionalView>>,
    grace_period: Duration,
}

impl<A: RoleApplier> RotationCoordinator<A> {
    pub fn new(manager: Arc<CredentialManager>, applier: Arc<A>, grace_period: Duration) -> Self {
        Self {
            manager,
            applier,
            state: Mutex::new(RotationState::Idle),
            history: Mutex::new(RotationHistory::default()),
            transitional: RwLock::new(None),
            grace_period,
        }
    }

    pub async fn state(&self) -> RotationState {
        *self.state.lock().await
    }

    pub async fn history_snapshot(&self) -> Vec<RotationEvent> {
        self.history.lock().await.iter().cloned().collect()
    }

    /// Returns the password for `role`, consulting the dual view during a
    /// grace window and falling back to the manager's current set otherwise.
    pub async fn get_password(&self, role: DBRole) -> Option<String> {
        let transitional = self.transitional.read().await;
        if let Some(view) = transitional.as_ref() {
            let dual = DualCredentialSet {
                active: &view.active,
                retiring: &view.retiring,
            };
            return dual.get_password(role).map(|s| s.to_string());
        }
        drop(transitional);
        self.manager.get_role(role).await.ok().map(|c| c.password)
    }

    /// Always appends to the in-memory history. Only emits to the audit
    /// chain on `complete`/`failed` (spec.md §3, §6) — intermediate
    /// `preparing`/finalizing-warning events are history-only.
    async fn record(&self, event: RotationEvent) {
        if matches!(event.state, RotationState::Complete | RotationState::Failed) {
            self.applier.audit_rotation(&event).await;
        }
        self.history.lock().await.push(event);
    }

    /// The only public driver. Rejects reentrant callers while a rotation is
    /// already `preparing|transitioning|finalizing`.
    pub async fn rotate(&self, cancellation: &CancellationToken) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if state.is_in_flight() {
                return Err(Error::RotationInProgress(format!("{:?}", *state)));
            }
            *state = RotationState::Preparing;
        }

        let started = Instant::now();
        let old_set = self.manager.current().await;
        let new_version = old_set.version + 1;

        // Preparing: generate new set with previous pointer, record event.
        let new_set = self.manager.generate(new_version, Some(Box::new(old_set.clone())));
        self.record(RotationEvent {
            timestamp: Utc::now(),
            state: RotationState::Preparing,
            old_version: old_set.version,
            new_version,
            message: Some("generated candidate credential set".to_string()),
            error: None,
            duration_ms: None,
        })
        .await;

        *self.state.lock().await = RotationState::Transitioning;

        if let Err(err) = self.applier.create_roles(&new_set).await {
            return self.fail(old_set.version, new_version, started, format!("create_roles: {err}")).await;
        }

        let mut old_retiring = old_set.clone();
        old_retiring.mark_all(CredentialStatus::Retiring);

        if let Err(err) = self.applier.update_pool(&new_set).await {
            return self.fail(old_set.version, new_version, started, format!("update_pool: {err}")).await;
        }

        *self.transitional.write().await = Some(TransitionalView {
            active: new_set.clone(),
            retiring: old_retiring.clone(),
        });

        // Grace: sleep, respecting cancellation.
        let cancelled = tokio::select! {
            _ = cancellation.cancelled() => true,
            _ = sleep(self.grace_period) => false,
        };

        if cancelled {
            self.transitional.write().await.take();
            return self
                .fail(old_set.version, new_version, started, "rotation cancelled during grace period".to_string())
                .await
                .map_err(|_| Error::Cancelled("grace period cancelled".to_string()));
        }

        *self.state.lock().await = RotationState::Finalizing;

        if let Err(err) = self.applier.drop_roles(&old_retiring).await {
            self.record(RotationEvent {
                timestamp: Utc::now(),
                state: RotationState::Finalizing,
                old_version: old_set.version,
                new_version,
                message: Some("drop_roles failed, old roles left in place, will retry later".to_string()),
                error: Some(err.to_string()),
                duration_ms: None,
            })
            .await;
        }

        // Commit.
        let mut final_set = new_set;
        let mut expired_old = old_retiring;
        expired_old.mark_all(CredentialStatus::Expired);
        final_set.previous = None;

        self.manager.publish(final_set).await?;
        self.transitional.write().await.take();
        *self.state.lock().await = RotationState::Complete;

        let duration_ms = started.elapsed().as_millis() as u64;
        self.record(RotationEvent {
            timestamp: Utc::now(),
            state: RotationState::Complete,
            old_version: old_set.version,
            new_version,
            message: Some("rotation complete".to_string()),
            error: None,
            duration_ms: Some(duration_ms),
        })
        .await;

        Ok(())
    }

    async fn fail(&self, old_version: u64, new_version: u64, started: Instant, error: String) -> Result<()> {
        self.transitional.write().await.take();
        *self.state.lock().await = RotationState::Failed;
        let duration_ms = started.elapsed().as_millis() as u64;
        self.record(RotationEvent {
            timestamp: Utc::now(),
            state: RotationState::Failed,
            old_version,
            new_version,
            message: None,
            error: Some(error.clone()),
            duration_ms: Some(duration_ms),
        })
        .await;
        Err(Error::ApplierFailed {
            step: "rotate",
            source: Box::new(std::io::Error::new(std::io::ErrorKind::Other, error)),
        })
    }
}

/// Ticks at `rotation_interval / 10` and fires `rotate()` whenever
/// `manager.needs_rotation()` or the manual-trigger signal is set. A
/// rotate-in-progress call is a no-op at the scheduler level.
pub struct RotationScheduler {
    shutdown: CancellationToken,
}

impl RotationScheduler {
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Runs until the shutdown token is cancelled. Intended to be spawned as
    /// a background task on the parallel-threads runtime.
    pub async fn run<A: RoleApplier>(
        &self,
        manager: Arc<CredentialManager>,
        coordinator: Arc<RotationCoordinator<A>>,
        rotation_interval: Duration,
    ) {
        let tick = (rotation_interval / 10).max(Duration::from_secs(1));
        let mut interval = tokio::time::interval(tick);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = interval.tick() => {
                    let due = manager.needs_rotation().await || manager.take_rotation_trigger();
                    if !due {
                        continue;
                    }
                    if coordinator.state().await.is_in_flight() {
                        continue;
                    }
                    if let Err(err) = coordinator.rotate(&self.shutdown).await {
                        tracing::warn!("scheduled rotation failed: {err}");
                    }
                }
            }
        }
    }
}

impl Default for RotationScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::CipherEnvelope;
    use crate::store::CredentialStore;
    use crate::types::{CredentialSet, EncryptionMethod};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;
    use tokio::sync::Mutex as TokioMutex;

    #[derive(Default)]
    struct StubApplier {
        create_calls: AtomicU32,
        update_calls: AtomicU32,
        drop_calls: AtomicU32,
        fail_create: bool,
        fail_drop: bool,
        last_create_version: TokioMutex<Option<u64>>,
        last_update_version: TokioMutex<Option<u64>>,
        last_drop_version: TokioMutex<Option<u64>>,
        audited: TokioMutex<Vec<RotationEvent>>,
    }

    #[async_trait]
    impl RoleApplier for StubApplier {
        async fn create_roles(
            &self,
            new_set: &CredentialSet,
        ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_create_version.lock().await = Some(new_set.version);
            if self.fail_create {
                return Err("stub create_roles failure".into());
            }
            Ok(())
        }

        async fn update_pool(
            &self,
            new_set: &CredentialSet,
        ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.update_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_update_version.lock().await = Some(new_set.version);
            Ok(())
        }

        async fn drop_roles(
            &self,
            old_set: &CredentialSet,
        ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.drop_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_drop_version.lock().await = Some(old_set.version);
            if self.fail_drop {
                return Err("stub drop_roles failure".into());
            }
            Ok(())
        }

        async fn audit_rotation(&self, event: &RotationEvent) {
            self.audited.lock().await.push(event.clone());
        }
    }

    async fn manager_in(dir: &TempDir) -> Arc<CredentialManager> {
        let identity_key: Vec<u8> = (0u8..64).collect();
        let envelope = CipherEnvelope::new(identity_key, EncryptionMethod::Hybrid).unwrap();
        let store = CredentialStore::new(dir.path().join("db.enc"), envelope);
        Arc::new(
            CredentialManager::initialize(store, Duration::from_secs(7 * 24 * 60 * 60), 64, EncryptionMethod::Hybrid)
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn happy_path_rotation_bumps_version_and_calls_applier_in_order() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir).await;
        let applier = Arc::new(StubApplier::default());
        let coordinator = RotationCoordinator::new(manager.clone(), applier.clone(), Duration::from_millis(10));

        coordinator.rotate(&CancellationToken::new()).await.unwrap();

        assert_eq!(manager.current().await.version, 2);
        assert_eq!(applier.create_calls.load(Ordering::SeqCst), 1);
        assert_eq!(applier.update_calls.load(Ordering::SeqCst), 1);
        assert_eq!(applier.drop_calls.load(Ordering::SeqCst), 1);
        assert_eq!(*applier.last_create_version.lock().await, Some(2));
        assert_eq!(*applier.last_update_version.lock().await, Some(1));
        assert_eq!(*applier.last_drop_version.lock().await, Some(1));

        let audited = applier.audited.lock().await;
        assert!(audited.iter().any(|e| e.state == RotationState::Complete && e.duration_ms.unwrap_or(0) > 0));
        assert_eq!(coordinator.state().await, RotationState::Complete);
    }

    #[tokio::test]
    async fn create_roles_failure_leaves_old_set_current() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir).await;
        let applier = Arc::new(StubApplier {
            fail_create: true,
            ..Default::default()
        });
        let coordinator = RotationCoordinator::new(manager.clone(), applier.clone(), Duration::from_millis(10));

        let result = coordinator.rotate(&CancellationToken::new()).await;
        assert!(result.is_err());
        assert_eq!(manager.current().await.version, 1);
        assert_eq!(coordinator.state().await, RotationState::Failed);

        let audited = applier.audited.lock().await;
        assert!(audited.iter().any(|e| e.state == RotationState::Failed && e.error.is_some()));
    }

    #[tokio::test]
    async fn drop_roles_failure_is_non_fatal() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir).await;
        let applier = Arc::new(StubApplier {
            fail_drop: true,
            ..Default::default()
        });
        let coordinator = RotationCoordinator::new(manager.clone(), applier.clone(), Duration::from_millis(10));

        coordinator.rotate(&CancellationToken::new()).await.unwrap();
        assert_eq!(manager.current().await.version, 2);
        assert_eq!(coordinator.state().await, RotationState::Complete);

        let history = coordinator.history_snapshot().await;
        assert!(history.iter().any(|e| e.error.is_some()));

        // The drop_roles warning reaches history but not the audit chain.
        let audited = applier.audited.lock().await;
        assert!(!audited.iter().any(|e| e.state == RotationState::Finalizing));
    }

    #[tokio::test]
    async fn only_complete_and_failed_events_reach_the_audit_chain() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir).await;
        let applier = Arc::new(StubApplier::default());
        let coordinator = RotationCoordinator::new(manager.clone(), applier.clone(), Duration::from_millis(10));

        coordinator.rotate(&CancellationToken::new()).await.unwrap();

        let history = coordinator.history_snapshot().await;
        assert!(history.iter().any(|e| e.state == RotationState::Preparing));

        let audited = applier.audited.lock().await;
        assert!(audited.iter().all(|e| matches!(e.state, RotationState::Complete | RotationState::Failed)));
        assert!(!audited.iter().any(|e| e.state == RotationState::Preparing));
    }

    #[tokio::test]
    async fn cancellation_during_grace_fails_rotation_and_preserves_old_set() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir).await;
        let applier = Arc::new(StubApplier::default());
        let coordinator = RotationCoordinator::new(manager.clone(), applier.clone(), Duration::from_secs(30));

        let token = CancellationToken::new();
        let token_clone = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token_clone.cancel();
        });

        let result = coordinator.rotate(&token).await;
        assert!(result.is_err());
        assert_eq!(manager.current().await.version, 1);
        assert_eq!(coordinator.state().await, RotationState::Failed);
    }

    #[tokio::test]
    async fn reentrant_rotate_is_rejected_while_in_flight() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir).await;
        let applier = Arc::new(StubApplier::default());
        let coordinator = Arc::new(RotationCoordinator::new(manager.clone(), applier.clone(), Duration::from_millis(200)));

        *coordinator.state.lock().await = RotationState::Transitioning;
        let result = coordinator.rotate(&CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::RotationInProgress(_))));
    }

    #[test]
    fn rotation_history_caps_at_capacity() {
        let mut history = RotationHistory::new(3);
        for i in 0..5u64 {
            history.push(RotationEvent {
                timestamp: Utc::now(),
                state: RotationState::Complete,
                old_version: i,
                new_version: i + 1,
                message: None,
                error: None,
                duration_ms: None,
            });
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.last().unwrap().old_version, 4);
    }
}
