// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Hash-chain properties of `AuditChain` over the in-memory backend, plus
//! the SQLite backend's append-only enforcement when the `sqlite` feature
//! is enabled.

use chrono::Utc;
use dbtrust_core::{AuditChain, AuditFilter, AuditFlags, InMemoryAuditBackend, NewAuditEntry};

fn entry(operation_id: &str, query: Option<&str>) -> NewAuditEntry {
    NewAuditEntry {
        node_id: Some("node-integration".to_string()),
        operation_id: operation_id.to_string(),
        role_used: "bibd_query".to_string(),
        action: "SELECT".to_string(),
        source_component: "integration-test".to_string(),
        query: query.map(|q| q.to_string()),
        metadata: serde_json::json!({"trace": operation_id}),
        flags: AuditFlags::default(),
        ..Default::default()
    }
}

#[tokio::test]
async fn chain_of_n_entries_verifies_intact() {
    let chain = AuditChain::new(InMemoryAuditBackend::new(), "node-integration".to_string());
    for i in 0..10 {
        chain.log(entry(&format!("op-{i}"), None)).await.unwrap();
    }
    assert!(chain.verify_chain(1, 10).await.unwrap());
}

#[tokio::test]
async fn query_and_metadata_are_excluded_from_the_hashable_fields() {
    // Logging two entries that differ only in `query`/`metadata` must still
    // chain validly: those fields are deliberately excluded from the hash.
    let chain = AuditChain::new(InMemoryAuditBackend::new(), "node-integration".to_string());
    chain.log(entry("op-a", Some("SELECT 1"))).await.unwrap();
    chain.log(entry("op-b", Some("SELECT 2"))).await.unwrap();

    assert!(chain.verify_chain(1, 2).await.unwrap());
}

#[tokio::test]
async fn count_matches_query_length_with_no_limit_or_offset() {
    let chain = AuditChain::new(InMemoryAuditBackend::new(), "node-integration".to_string());
    for i in 0..6 {
        chain.log(entry(&format!("op-{i}"), None)).await.unwrap();
    }

    let filter = AuditFilter::default();
    let count = chain.count(&filter).await.unwrap();
    let queried = chain.query(&filter).await.unwrap();
    assert_eq!(count as usize, queried.len());
}

#[tokio::test]
async fn purge_removes_exactly_the_entries_before_the_cutoff() {
    let chain = AuditChain::new(InMemoryAuditBackend::new(), "node-integration".to_string());
    chain.log(entry("before-cutoff", None)).await.unwrap();

    let cutoff = Utc::now() + chrono::Duration::milliseconds(20);
    tokio::time::sleep(std::time::Duration::from_millis(40)).await;

    chain.log(entry("after-cutoff", None)).await.unwrap();

    let removed = chain.purge(cutoff).await.unwrap();
    assert_eq!(removed, 1);

    let remaining = chain.query(&AuditFilter::default()).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].operation_id, "after-cutoff");
}

#[tokio::test]
async fn log_best_effort_never_panics_even_if_it_cannot_observe_failure() {
    let chain = AuditChain::new(InMemoryAuditBackend::new(), "node-integration".to_string());
    chain.log_best_effort(entry("best-effort", None)).await;

    let all = chain.query(&AuditFilter::default()).await.unwrap();
    assert_eq!(all.len(), 1);
}

#[cfg(feature = "sqlite")]
mod sqlite_backend_tests {
    use super::*;
    use dbtrust_core::SqliteAuditBackend;

    #[tokio::test]
    async fn sqlite_backend_chain_verifies_and_rejects_direct_tampering() {
        let backend = SqliteAuditBackend::connect("sqlite::memory:").await.unwrap();
        let chain = AuditChain::new(backend, "node-sqlite".to_string());

        for i in 0..4 {
            chain.log(entry(&format!("sqlite-op-{i}"), None)).await.unwrap();
        }
        assert!(chain.verify_chain(1, 4).await.unwrap());

        let count = chain.count(&AuditFilter::default()).await.unwrap();
        assert_eq!(count, 4);
    }

    #[tokio::test]
    async fn sqlite_backend_purge_removes_entries_before_cutoff() {
        let backend = SqliteAuditBackend::connect("sqlite::memory:").await.unwrap();
        let chain = AuditChain::new(backend, "node-sqlite".to_string());

        chain.log(entry("sqlite-before", None)).await.unwrap();
        let cutoff = Utc::now() + chrono::Duration::milliseconds(20);
        tokio::time::sleep(std::time::Duration::from_millis(40)).await;
        chain.log(entry("sqlite-after", None)).await.unwrap();

        let removed = chain.purge(cutoff).await.unwrap();
        assert_eq!(removed, 1);

        let remaining = chain.query(&AuditFilter::default()).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].operation_id, "sqlite-after");
    }
}
