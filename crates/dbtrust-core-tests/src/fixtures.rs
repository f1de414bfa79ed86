// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Test fixtures for the trust-and-secrets core

use dbtrust_core::{
    CertificateConfig, CipherEnvelope, CredentialManager, CredentialStore, EncryptionMethod,
    TrustConfig,
};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

/// A temp-dir-backed `TrustConfig` plus the paths derived from it, kept
/// alive for the duration of a test.
pub struct TestTrustFixture {
    pub temp_dir: TempDir,
    pub config: TrustConfig,
}

impl TestTrustFixture {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let config = TrustConfig {
            data_dir: Some(temp_dir.path().to_path_buf()),
            ..Default::default()
        };
        Self { temp_dir, config }
    }

    pub fn encrypted_path(&self) -> PathBuf {
        self.config.resolved_encrypted_path().unwrap()
    }

    pub fn certs_dir(&self) -> PathBuf {
        self.config.certs_dir().unwrap()
    }

    /// A deterministic identity key for this fixture (`[0, 1, ..., 63]`).
    pub fn identity_key(&self) -> Vec<u8> {
        dbtrust_core::test_utils::test_identity_key()
    }

    pub fn cipher_envelope(&self) -> CipherEnvelope {
        CipherEnvelope::new(self.identity_key(), self.config.encryption_method).unwrap()
    }

    pub fn credential_store(&self) -> CredentialStore {
        CredentialStore::new(self.encrypted_path(), self.cipher_envelope())
    }

    /// Builds and initializes a `CredentialManager` against this fixture's
    /// store, generating version 1 if none is persisted yet.
    pub async fn credential_manager(&self) -> CredentialManager {
        CredentialManager::initialize(
            self.credential_store(),
            self.config.rotation_interval,
            self.config.effective_password_length(),
            self.config.encryption_method,
        )
        .await
        .unwrap()
    }

    /// Builds a manager with a short rotation interval/grace period, useful
    /// for exercising `needs_rotation()`/the scheduler without long sleeps.
    pub async fn fast_rotating_manager(&self, rotation_interval: Duration) -> CredentialManager {
        CredentialManager::initialize(
            self.credential_store(),
            rotation_interval,
            self.config.effective_password_length(),
            self.config.encryption_method,
        )
        .await
        .unwrap()
    }
}

impl Default for TestTrustFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// A `CertificateConfig` with short-lived, fully populated SANs suitable for
/// exercising certificate generation/rotation in tests.
pub fn sample_certificate_config() -> CertificateConfig {
    CertificateConfig {
        ca_common_name: "bibd-test-ca".to_string(),
        server_common_name: "bibd-test-server".to_string(),
        client_common_name: "bibd-test-client".to_string(),
        valid_duration: Duration::from_secs(24 * 60 * 60),
        dns_names: vec!["localhost".to_string(), "db.internal".to_string()],
        ip_addresses: vec!["127.0.0.1".to_string()],
        organization: "Schelling Point Labs Test Suite".to_string(),
        rotation_threshold: Duration::from_secs(60 * 60),
    }
}

/// Method-tagged encryption methods to exercise in round-trip-style tests.
pub fn all_encryption_methods() -> [EncryptionMethod; 3] {
    [
        EncryptionMethod::X25519SecretBox,
        EncryptionMethod::HkdfAesGcm,
        EncryptionMethod::Hybrid,
    ]
}
