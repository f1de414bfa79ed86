// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Trust-and-secrets core for a managed-database node.
//!
//! This crate provides:
//! - A method-tagged cipher envelope for credential-at-rest encryption (§4.A)
//! - A sealed, atomically-replaced credential store (§4.B)
//! - A credential manager owning the generation policy and the in-memory
//!   current credential set (§4.C)
//! - A multi-phase rotation state machine driven by an external `RoleApplier`
//!   capability (§4.D)
//! - An X.509 bundle generator for mTLS between the node and its database
//!   (§4.E)
//! - An append-only, hash-chained audit log (§4.F)
//!
//! Container/orchestrator lifecycle, the CRUD repositories over domain
//! entities, process configuration loading, the CLI surface, and logging
//! transport are all external collaborators this crate only consumes
//! interfaces from — they are not implemented here.

pub mod audit;
pub mod certs;
pub mod config;
pub mod credentials;
pub mod envelope;
pub mod error;
pub mod rotation;
pub mod store;
pub mod types;

pub use audit::{AuditBackend, AuditChain, InMemoryAuditBackend};
#[cfg(feature = "sqlite")]
pub use audit::SqliteAuditBackend;
pub use certs::CertificateBundle;
pub use config::{CertificateConfig, TrustConfig};
pub use credentials::CredentialManager;
pub use envelope::{generate_password, CipherEnvelope};
pub use error::{Error, Result};
pub use rotation::{RoleApplier, RotationCoordinator, RotationHistory, RotationScheduler};
pub use store::CredentialStore;
pub use types::{
    AuditEntry, AuditFilter, AuditFlags, CredentialSet, CredentialStatus, DBRole, DualCredentialSet,
    EncryptionMethod, NewAuditEntry, RoleCredential, RotationEvent, RotationState,
};

/// Test utilities shared by this crate's own unit tests and by
/// `dbtrust-core-tests`' integration fixtures.
pub mod test_utils {
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static TEST_LOG_COUNTER: AtomicUsize = AtomicUsize::new(0);
    static TEST_LOG_DIR: OnceLock<PathBuf> = OnceLock::new();

    /// A deterministic 64-byte identity key for tests (`[0, 1, ..., 63]`),
    /// matching the bootstrap scenario in the testable-properties section.
    pub fn test_identity_key() -> Vec<u8> {
        (0u8..64).collect()
    }

    /// Path for a test log file, namespaced per test to avoid collisions
    /// when tests run concurrently.
    pub fn test_log_path(test_name: &str) -> PathBuf {
        let counter = TEST_LOG_COUNTER.fetch_add(1, Ordering::SeqCst);
        let log_dir = TEST_LOG_DIR.get_or_init(|| std::env::temp_dir().join("dbtrust-core-test-logs"));

        std::fs::create_dir_all(log_dir).ok();
        log_dir.join(format!("test-{test_name}-{counter}.log"))
    }
}
