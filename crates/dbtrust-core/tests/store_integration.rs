// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! End-to-end scenario 3 (Persistence) plus backup/restore across a fresh
//! `CredentialStore` built from the shared fixture.

use chrono::Utc;
use dbtrust_core::{CredentialSet, DBRole, RoleCredential};
use dbtrust_core_tests::TestTrustFixture;
use std::collections::HashMap;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

fn credset_with_scrape_password(password: &str) -> CredentialSet {
    let now = Utc::now();
    let expires = now + chrono::Duration::days(7);
    let mut roles = HashMap::new();
    roles.insert(
        DBRole::Scrape,
        RoleCredential::new("bibd_scrape".into(), password.into(), now, expires),
    );

    CredentialSet {
        version: 1,
        generated_at: now,
        expires_at: expires,
        encryption_method: dbtrust_core::EncryptionMethod::Hybrid,
        superuser: RoleCredential::new("bibd_superuser".into(), "super-pass".into(), now, expires),
        admin: RoleCredential::new("bibd_admin".into(), "admin-pass".into(), now, expires),
        roles,
        previous: None,
    }
}

#[tokio::test]
async fn save_reload_and_file_mode() {
    let fixture = TestTrustFixture::new();
    let store = fixture.credential_store();

    store.save(&credset_with_scrape_password("scrape-password")).await.unwrap();
    let loaded = store.load().await.unwrap();

    assert_eq!(
        loaded.roles.get(&DBRole::Scrape).unwrap().password,
        "scrape-password"
    );

    #[cfg(unix)]
    {
        let metadata = std::fs::metadata(store.path()).unwrap();
        assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
    }
}

#[tokio::test]
async fn backup_and_restore_recovers_prior_generation() {
    let fixture = TestTrustFixture::new();
    let store = fixture.credential_store();

    store.save(&credset_with_scrape_password("gen-one")).await.unwrap();
    store.backup().await.unwrap();
    store.save(&credset_with_scrape_password("gen-two")).await.unwrap();

    store.restore().await.unwrap();
    let restored = store.load().await.unwrap();
    assert_eq!(restored.roles.get(&DBRole::Scrape).unwrap().password, "gen-one");
}

#[tokio::test]
async fn secure_delete_leaves_no_loadable_file() {
    let fixture = TestTrustFixture::new();
    let store = fixture.credential_store();

    store.save(&credset_with_scrape_password("to-be-shredded")).await.unwrap();
    store.secure_delete().await.unwrap();

    assert!(!store.path().exists());
    assert!(store.load().await.is_err());
}
