// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the trust-and-secrets core

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur across the envelope, store, credential manager,
/// rotation coordinator, certificate generator, and audit chain.
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid identity key length: need at least 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("unsupported encryption method: {0}")]
    UnsupportedMethod(String),

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("credentials not found at {0}")]
    CredentialsNotFound(PathBuf),

    #[error("credential store corrupted at {0}")]
    CorruptedCredentials(PathBuf),

    #[error("role not found: {0}")]
    RoleNotFound(String),

    #[error("rotation already in progress (state: {0})")]
    RotationInProgress(String),

    #[error("password generation failed: {0}")]
    GenerationFailed(String),

    #[error("role applier failed during {step}: {source}")]
    ApplierFailed {
        step: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("rotation cancelled: {0}")]
    Cancelled(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("audit backend error: {0}")]
    Audit(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True for errors the spec marks as recoverable by an operator restore,
    /// as opposed to configuration/startup-abort errors.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::DecryptionFailed | Error::CorruptedCredentials(_) | Error::CredentialsNotFound(_)
        )
    }
}
