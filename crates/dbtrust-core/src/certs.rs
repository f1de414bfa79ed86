// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! X.509 bundle generator: mints a self-contained CA + server + client
//! certificate bundle for mTLS and detects when it must be reissued.

use crate::config::CertificateConfig;
use crate::error::{Error, Result};
use rand::{RngCore, rngs::OsRng};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SerialNumber, PKCS_ECDSA_P256_SHA256,
};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use time::OffsetDateTime;
use tokio::fs as async_fs;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Six PEM-encoded artifacts making up an mTLS trust bundle.
#[derive(Debug, Clone)]
pub struct CertificateBundle {
    pub ca_cert: String,
    pub ca_key: String,
    pub server_cert: String,
    pub server_key: String,
    pub client_cert: String,
    pub client_key: String,
}

const FILE_NAMES: [(&str, u32); 6] = [
    ("ca.crt", 0o644),
    ("ca.key", 0o600),
    ("server.crt", 0o644),
    ("server.key", 0o600),
    ("client.crt", 0o644),
    ("client.key", 0o600),
];

fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    // Top bit clear keeps the integer positive when DER-decoded as signed.
    bytes[0] &= 0x7F;
    SerialNumber::from_slice(&bytes)
}

/// Produce three P-256 keypairs: a CA, a server cert it signs, and a client
/// cert it signs.
pub fn generate(config: &CertificateConfig) -> Result<CertificateBundle> {
    let now = OffsetDateTime::now_utc();
    let not_after = now + time::Duration::seconds(config.valid_duration.as_secs() as i64);

    let ca_key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
        .map_err(|e| Error::Certificate(format!("CA key generation failed: {e}")))?;
    let mut ca_params = CertificateParams::new(Vec::<String>::new())
        .map_err(|e| Error::Certificate(format!("CA params failed: {e}")))?;
    ca_params.distinguished_name = distinguished_name(&config.ca_common_name, &config.organization);
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Constrained(1));
    ca_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    ca_params.serial_number = Some(random_serial());
    ca_params.not_before = now;
    ca_params.not_after = not_after;
    let ca_cert = ca_params
        .self_signed(&ca_key_pair)
        .map_err(|e| Error::Certificate(format!("CA self-sign failed: {e}")))?;

    let server_key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
        .map_err(|e| Error::Certificate(format!("server key generation failed: {e}")))?;
    let mut server_params = CertificateParams::new(server_san_list(config)?)
        .map_err(|e| Error::Certificate(format!("server params failed: {e}")))?;
    server_params.distinguished_name =
        distinguished_name(&config.server_common_name, &config.organization);
    server_params.is_ca = IsCa::NoCa;
    server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    server_params.serial_number = Some(random_serial());
    server_params.not_before = now;
    server_params.not_after = not_after;
    let server_cert = server_params
        .signed_by(&server_key_pair, &ca_cert, &ca_key_pair)
        .map_err(|e| Error::Certificate(format!("server sign failed: {e}")))?;

    let client_key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
        .map_err(|e| Error::Certificate(format!("client key generation failed: {e}")))?;
    let mut client_params = CertificateParams::new(Vec::<String>::new())
        .map_err(|e| Error::Certificate(format!("client params failed: {e}")))?;
    client_params.distinguished_name =
        distinguished_name(&config.client_common_name, &config.organization);
    client_params.is_ca = IsCa::NoCa;
    client_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    client_params.serial_number = Some(random_serial());
    client_params.not_before = now;
    client_params.not_after = not_after;
    let client_cert = client_params
        .signed_by(&client_key_pair, &ca_cert, &ca_key_pair)
        .map_err(|e| Error::Certificate(format!("client sign failed: {e}")))?;

    Ok(CertificateBundle {
        ca_cert: ca_cert.pem(),
        ca_key: ca_key_pair.serialize_pem(),
        server_cert: server_cert.pem(),
        server_key: server_key_pair.serialize_pem(),
        client_cert: client_cert.pem(),
        client_key: client_key_pair.serialize_pem(),
    })
}

fn distinguished_name(common_name: &str, organization: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, organization);
    dn
}

fn server_san_list(config: &CertificateConfig) -> Result<Vec<String>> {
    // rcgen::CertificateParams::new takes subject alt names as plain strings
    // and classifies each as DNS or IP; pass both lists through verbatim.
    let mut sans = config.dns_names.clone();
    sans.extend(config.ip_addresses.iter().cloned());
    if sans.is_empty() {
        return Err(Error::Certificate("no SANs configured for server certificate".to_string()));
    }
    for ip in &config.ip_addresses {
        IpAddr::from_str(ip)
            .map_err(|e| Error::Certificate(format!("invalid IP SAN {ip}: {e}")))?;
    }
    Ok(sans)
}

/// Write all six files: `0644` for certs, `0600` for keys. The directory is
/// created with `0700`.
pub async fn save_to_dir(dir: &Path, bundle: &CertificateBundle) -> Result<()> {
    if !dir.exists() {
        async_fs::create_dir_all(dir).await?;
    }
    #[cfg(unix)]
    {
        let metadata = async_fs::metadata(dir).await?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(0o700);
        async_fs::set_permissions(dir, permissions).await?;
    }

    let contents = [
        &bundle.ca_cert,
        &bundle.ca_key,
        &bundle.server_cert,
        &bundle.server_key,
        &bundle.client_cert,
        &bundle.client_key,
    ];

    for ((name, mode), content) in FILE_NAMES.iter().zip(contents.iter()) {
        let path = dir.join(name);
        async_fs::write(&path, content.as_bytes()).await?;
        #[cfg(unix)]
        {
            let metadata = async_fs::metadata(&path).await?;
            let mut permissions = metadata.permissions();
            permissions.set_mode(*mode);
            async_fs::set_permissions(&path, permissions).await?;
        }
    }

    Ok(())
}

/// Requires all six files to be present.
pub async fn load_from_dir(dir: &Path) -> Result<CertificateBundle> {
    async fn read(path: PathBuf) -> Result<String> {
        async_fs::read_to_string(&path)
            .await
            .map_err(|_| Error::Certificate(format!("missing certificate file: {}", path.display())))
    }

    Ok(CertificateBundle {
        ca_cert: read(dir.join("ca.crt")).await?,
        ca_key: read(dir.join("ca.key")).await?,
        server_cert: read(dir.join("server.crt")).await?,
        server_key: read(dir.join("server.key")).await?,
        client_cert: read(dir.join("client.crt")).await?,
        client_key: read(dir.join("client.key")).await?,
    })
}

/// Fail-closed toward regeneration: an unreadable or malformed server cert
/// counts as needing rotation.
pub async fn needs_rotation(dir: &Path, threshold: Duration) -> bool {
    let server_cert_path = dir.join("server.crt");
    let pem = match async_fs::read_to_string(&server_cert_path).await {
        Ok(pem) => pem,
        Err(_) => return true,
    };

    let (_, pem) = match x509_parser::pem::parse_x509_pem(pem.as_bytes()) {
        Ok(parsed) => parsed,
        Err(_) => return true,
    };

    let cert = match pem.parse_x509() {
        Ok(cert) => cert,
        Err(_) => return true,
    };

    match cert.validity().time_to_expiration() {
        Some(remaining) => remaining.whole_seconds() < threshold.as_secs() as i64,
        None => true,
    }
}

/// If a bundle already exists at `dir`, moves it aside to
/// `dir/backup-<unix-epoch>/` before generating and saving a fresh one.
pub async fn rotate(dir: &Path, config: &CertificateConfig) -> Result<CertificateBundle> {
    if dir.join("server.crt").exists() {
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::Certificate(format!("clock error: {e}")))?
            .as_secs();
        let backup_dir = dir.join(format!("backup-{epoch}"));
        async_fs::create_dir_all(&backup_dir).await?;
        for (name, _) in FILE_NAMES {
            let src = dir.join(name);
            if src.exists() {
                async_fs::rename(&src, backup_dir.join(name)).await?;
            }
        }
    }

    let bundle = generate(config)?;
    save_to_dir(dir, &bundle).await?;
    Ok(bundle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config() -> CertificateConfig {
        CertificateConfig {
            ca_common_name: "bibd-ca".to_string(),
            server_common_name: "bibd-server".to_string(),
            client_common_name: "bibd-client".to_string(),
            valid_duration: Duration::from_secs(365 * 24 * 60 * 60),
            dns_names: vec!["localhost".to_string()],
            ip_addresses: vec!["127.0.0.1".to_string()],
            organization: "Schelling Point Labs".to_string(),
            rotation_threshold: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }

    #[test]
    fn generated_bundle_has_all_six_pem_blocks() {
        let bundle = generate(&test_config()).unwrap();
        for pem in [
            &bundle.ca_cert,
            &bundle.server_cert,
            &bundle.client_cert,
        ] {
            assert!(pem.contains("BEGIN CERTIFICATE"));
        }
        for pem in [&bundle.ca_key, &bundle.server_key, &bundle.client_key] {
            assert!(pem.contains("PRIVATE KEY"));
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let bundle = generate(&test_config()).unwrap();
        save_to_dir(dir.path(), &bundle).await.unwrap();

        let loaded = load_from_dir(dir.path()).await.unwrap();
        assert_eq!(loaded.server_cert, bundle.server_cert);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn key_files_are_mode_0600() {
        let dir = TempDir::new().unwrap();
        let bundle = generate(&test_config()).unwrap();
        save_to_dir(dir.path(), &bundle).await.unwrap();

        for name in ["ca.key", "server.key", "client.key"] {
            let metadata = std::fs::metadata(dir.path().join(name)).unwrap();
            assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn missing_bundle_needs_rotation() {
        let dir = TempDir::new().unwrap();
        assert!(needs_rotation(dir.path(), Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn fresh_bundle_does_not_need_rotation() {
        let dir = TempDir::new().unwrap();
        let config = test_config();
        let bundle = generate(&config).unwrap();
        save_to_dir(dir.path(), &bundle).await.unwrap();
        assert!(!needs_rotation(dir.path(), config.rotation_threshold).await);
    }

    #[tokio::test]
    async fn rotate_preserves_old_bundle_under_backup_dir() {
        let dir = TempDir::new().unwrap();
        let config = test_config();
        let first = generate(&config).unwrap();
        save_to_dir(dir.path(), &first).await.unwrap();

        let second = rotate(dir.path(), &config).await.unwrap();
        assert_ne!(first.server_cert, second.server_cert);

        let mut backup_dirs = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("backup-"));
        assert!(backup_dirs.next().is_some());
    }
}
