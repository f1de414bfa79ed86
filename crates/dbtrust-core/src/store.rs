// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Sealed credential store: durable persistence of the encrypted credential
//! set with atomic replacement and optional backup/shred.

use crate::envelope::CipherEnvelope;
use crate::error::{Error, Result};
use crate::types::CredentialSet;
use std::path::{Path, PathBuf};
use tokio::fs as async_fs;
use tokio::sync::RwLock;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Persists exactly one logical `CredentialSet` record at a configured path.
///
/// A single in-process reader/writer lock guards the file operations;
/// cross-process serialization is the caller's responsibility.
pub struct CredentialStore {
    path: PathBuf,
    envelope: CipherEnvelope,
    lock: RwLock<()>,
}

impl CredentialStore {
    pub fn new(path: PathBuf, envelope: CipherEnvelope) -> Self {
        Self {
            path,
            envelope,
            lock: RwLock::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `save(credset)`: serialize, encrypt, write to `<path>.tmp` with mode
    /// `0600`, rename atomically over `<path>`. The containing directory is
    /// created with mode `0700`. On any failure after the tmp file exists, it
    /// is removed.
    pub async fn save(&self, credset: &CredentialSet) -> Result<()> {
        let _guard = self.lock.write().await;

        if let Some(dir) = self.path.parent() {
            create_dir_with_mode(dir, 0o700).await?;
        }

        let plaintext = serde_json::to_vec(credset)?;
        let ciphertext = self.envelope.encrypt(&plaintext)?;

        let tmp_path = self.path.with_extension("tmp");
        let result = self.write_and_rename(&tmp_path, &ciphertext).await;
        if result.is_err() && tmp_path.exists() {
            let _ = async_fs::remove_file(&tmp_path).await;
        }
        result
    }

    async fn write_and_rename(&self, tmp_path: &Path, ciphertext: &[u8]) -> Result<()> {
        async_fs::write(tmp_path, ciphertext).await?;

        #[cfg(unix)]
        {
            let metadata = async_fs::metadata(tmp_path).await?;
            let mut permissions = metadata.permissions();
            permissions.set_mode(0o600);
            async_fs::set_permissions(tmp_path, permissions).await?;
        }

        async_fs::rename(tmp_path, &self.path).await?;
        Ok(())
    }

    /// `load() → credset | NotFound`. An empty file is treated as corrupted.
    pub async fn load(&self) -> Result<CredentialSet> {
        let _guard = self.lock.read().await;

        if !self.path.exists() {
            return Err(Error::CredentialsNotFound(self.path.clone()));
        }

        let ciphertext = async_fs::read(&self.path).await?;
        if ciphertext.is_empty() {
            return Err(Error::CorruptedCredentials(self.path.clone()));
        }

        let plaintext = self
            .envelope
            .decrypt(&ciphertext)
            .map_err(|_| Error::DecryptionFailed)?;

        serde_json::from_slice(&plaintext).map_err(|_| Error::CorruptedCredentials(self.path.clone()))
    }

    /// Copy current ciphertext to `<path>.backup`. No-op if the primary file
    /// is absent.
    pub async fn backup(&self) -> Result<()> {
        let _guard = self.lock.read().await;
        if !self.path.exists() {
            return Ok(());
        }
        let backup_path = self.backup_path();
        async_fs::copy(&self.path, &backup_path).await?;

        #[cfg(unix)]
        {
            let metadata = async_fs::metadata(&backup_path).await?;
            let mut permissions = metadata.permissions();
            permissions.set_mode(0o600);
            async_fs::set_permissions(&backup_path, permissions).await?;
        }

        Ok(())
    }

    /// Copy `<path>.backup` back over `<path>`.
    pub async fn restore(&self) -> Result<()> {
        let _guard = self.lock.write().await;
        let backup_path = self.backup_path();
        if !backup_path.exists() {
            return Err(Error::CredentialsNotFound(backup_path));
        }
        async_fs::copy(&backup_path, &self.path).await?;
        Ok(())
    }

    /// Overwrite the file with zeros of exact size, fsync, then unlink.
    /// Best-effort: this is not a cryptographic shred on journaling or
    /// copy-on-write filesystems.
    pub async fn secure_delete(&self) -> Result<()> {
        let _guard = self.lock.write().await;
        if !self.path.exists() {
            return Ok(());
        }

        let len = async_fs::metadata(&self.path).await?.len();
        let zeros = vec![0u8; len as usize];
        let file = async_fs::OpenOptions::new().write(true).open(&self.path).await?;
        {
            use tokio::io::AsyncWriteExt;
            let mut file = file;
            file.write_all(&zeros).await?;
            file.sync_all().await?;
        }
        async_fs::remove_file(&self.path).await?;
        Ok(())
    }

    fn backup_path(&self) -> PathBuf {
        let mut backup = self.path.clone().into_os_string();
        backup.push(".backup");
        PathBuf::from(backup)
    }
}

async fn create_dir_with_mode(path: &Path, mode: u32) -> Result<()> {
    if !path.exists() {
        async_fs::create_dir_all(path).await?;
    }

    #[cfg(unix)]
    {
        let metadata = async_fs::metadata(path).await?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(mode);
        async_fs::set_permissions(path, permissions).await?;
    }
    #[cfg(not(unix))]
    {
        let _ = mode;
    }

    Ok(())
}
