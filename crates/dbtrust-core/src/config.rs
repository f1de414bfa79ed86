// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Configuration for the trust-and-secrets core

use crate::types::EncryptionMethod;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration section for this crate.
///
/// Precedence for `data_dir`: explicit `data_dir` > `BIBD_HOME` env var >
/// `base_config_dir` (set by an embedding process) > `dirs::data_dir()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TrustConfig {
    /// Custom data directory. If unset, falls back to environment/platform defaults.
    pub data_dir: Option<PathBuf>,

    /// Encryption method used for the credential envelope.
    #[serde(default)]
    pub encryption_method: EncryptionMethod,

    /// Wall-clock period between planned credential rotations.
    #[serde(with = "humantime_serde", default = "default_rotation_interval")]
    pub rotation_interval: Duration,

    /// How long old and new credentials are both accepted during a rotation.
    #[serde(with = "humantime_serde", default = "default_grace_period")]
    pub rotation_grace_period: Duration,

    /// Path to the encrypted credential file, relative to `data_dir` unless absolute.
    #[serde(default = "default_encrypted_path")]
    pub encrypted_path: PathBuf,

    /// Length in hex characters of generated passwords. Floored to 32.
    #[serde(default = "default_password_length")]
    pub password_length: usize,

    /// Certificate generation settings.
    #[serde(default)]
    pub certificate: CertificateConfig,

    /// Base configuration directory set by an embedding process.
    #[serde(skip)]
    pub base_config_dir: Option<PathBuf>,

    /// Override for `BIBD_HOME`, used only in tests to avoid environment leakage.
    #[serde(skip)]
    pub bibd_home_override: Option<PathBuf>,
}

/// Certificate bundle generation configuration (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CertificateConfig {
    pub ca_common_name: String,
    pub server_common_name: String,
    pub client_common_name: String,
    #[serde(with = "humantime_serde", default = "default_cert_validity")]
    pub valid_duration: Duration,
    #[serde(default)]
    pub dns_names: Vec<String>,
    #[serde(default)]
    pub ip_addresses: Vec<String>,
    pub organization: String,
    #[serde(with = "humantime_serde", default = "default_cert_rotation_threshold")]
    pub rotation_threshold: Duration,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            ca_common_name: "bibd-ca".to_string(),
            server_common_name: "bibd-server".to_string(),
            client_common_name: "bibd-client".to_string(),
            valid_duration: default_cert_validity(),
            dns_names: vec!["localhost".to_string()],
            ip_addresses: vec!["127.0.0.1".to_string()],
            organization: "Schelling Point Labs".to_string(),
            rotation_threshold: default_cert_rotation_threshold(),
        }
    }
}

fn default_rotation_interval() -> Duration {
    Duration::from_secs(7 * 24 * 60 * 60)
}

fn default_grace_period() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_encrypted_path() -> PathBuf {
    PathBuf::from("secrets/db.enc")
}

fn default_password_length() -> usize {
    64
}

fn default_cert_validity() -> Duration {
    Duration::from_secs(365 * 24 * 60 * 60)
}

fn default_cert_rotation_threshold() -> Duration {
    Duration::from_secs(30 * 24 * 60 * 60)
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            encryption_method: EncryptionMethod::default(),
            rotation_interval: default_rotation_interval(),
            rotation_grace_period: default_grace_period(),
            encrypted_path: default_encrypted_path(),
            password_length: default_password_length(),
            certificate: CertificateConfig::default(),
            base_config_dir: None,
            bibd_home_override: None,
        }
    }
}

impl TrustConfig {
    pub fn with_base_config_dir(mut self, base_dir: PathBuf) -> Self {
        self.base_config_dir = Some(base_dir);
        self
    }

    /// Resolve the data directory.
    /// Precedence: `data_dir` > `BIBD_HOME` (or test override) > `base_config_dir` > `dirs::data_dir()`.
    pub fn data_dir(&self) -> crate::error::Result<PathBuf> {
        if let Some(custom) = &self.data_dir {
            return Ok(custom.clone());
        }

        if let Some(bibd_home) = &self.bibd_home_override {
            return Ok(bibd_home.clone());
        }
        if let Ok(bibd_home) = std::env::var("BIBD_HOME") {
            return Ok(PathBuf::from(bibd_home));
        }

        if let Some(base_dir) = &self.base_config_dir {
            return Ok(base_dir.clone());
        }

        let base_dir = dirs::data_dir()
            .ok_or_else(|| crate::Error::Config("could not determine data directory".to_string()))?;
        Ok(base_dir.join("bibd"))
    }

    /// Resolve the absolute path of the encrypted credential file.
    pub fn resolved_encrypted_path(&self) -> crate::error::Result<PathBuf> {
        if self.encrypted_path.is_absolute() {
            return Ok(self.encrypted_path.clone());
        }
        Ok(self.data_dir()?.join(&self.encrypted_path))
    }

    /// Resolve the certificate bundle directory (`<data_dir>/certs`).
    pub fn certs_dir(&self) -> crate::error::Result<PathBuf> {
        Ok(self.data_dir()?.join("certs"))
    }

    /// Resolve `password_length`, floored to 32.
    pub fn effective_password_length(&self) -> usize {
        self.password_length.max(32)
    }
}

/// Minimal `humantime`-compatible serde shim so duration fields can be
/// configured as "7d"/"5m" strings without pulling in the full crate surface
/// beyond what this module needs.
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        humantime::format_duration(*value).to_string().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
