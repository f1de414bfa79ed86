// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core types for the credential envelope, rotation, and audit subsystems

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// The closed set of database roles this core manages credentials for.
///
/// `Superuser` is present only on emergency paths; `Admin` can impersonate
/// the rest; the other five are least-privileged job roles.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum DBRole {
    Superuser,
    Admin,
    Scrape,
    Query,
    Transform,
    Audit,
    Readonly,
}

impl DBRole {
    /// The five least-privileged job roles that `CredentialSet::roles` carries.
    pub const JOB_ROLES: [DBRole; 5] = [
        DBRole::Scrape,
        DBRole::Query,
        DBRole::Transform,
        DBRole::Audit,
        DBRole::Readonly,
    ];

    /// Stable username for this role. Usernames never change across rotations.
    pub fn username(&self) -> &'static str {
        match self {
            DBRole::Superuser => "bibd_superuser",
            DBRole::Admin => "bibd_admin",
            DBRole::Scrape => "bibd_scrape",
            DBRole::Query => "bibd_query",
            DBRole::Transform => "bibd_transform",
            DBRole::Audit => "bibd_audit",
            DBRole::Readonly => "bibd_readonly",
        }
    }
}

impl fmt::Display for DBRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.username())
    }
}

/// Lifecycle status of a single role's credential within a `CredentialSet`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Active,
    Retiring,
    Expired,
}

/// A single role's username/password pair plus its lifecycle metadata.
///
/// Invariant: `created_at <= expires_at`. `password` is a hex-encoded
/// uniformly random byte string; its decoded length is `password_length / 2`
/// bytes. `username` is stable across rotations for a given role.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoleCredential {
    pub username: String,
    pub password: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: CredentialStatus,
}

impl RoleCredential {
    pub fn new(username: String, password: String, created_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        Self {
            username,
            password,
            created_at,
            expires_at,
            status: CredentialStatus::Active,
        }
    }
}

/// `Debug` never renders the password, mirroring `CredentialSet`'s diagnostic
/// redaction rule (spec.md §4.C) so that walking into a `RoleCredential` via a
/// derived `Debug` elsewhere in the tree cannot leak it either.
impl fmt::Debug for RoleCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoleCredential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .field("status", &self.status)
            .finish()
    }
}

/// The cipher method tag carried as the leading byte of every envelope.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EncryptionMethod {
    #[serde(rename = "x25519_secretbox")]
    X25519SecretBox,
    #[serde(rename = "hkdf_aesgcm")]
    HkdfAesGcm,
    #[serde(rename = "hybrid")]
    Hybrid,
}

impl EncryptionMethod {
    /// Leading tag byte for this method, as specified bit-exact in spec.md §3.
    pub const fn tag(&self) -> u8 {
        match self {
            EncryptionMethod::X25519SecretBox => b'x',
            EncryptionMethod::HkdfAesGcm => b'h',
            EncryptionMethod::Hybrid => b'H',
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'x' => Some(EncryptionMethod::X25519SecretBox),
            b'h' => Some(EncryptionMethod::HkdfAesGcm),
            b'H' => Some(EncryptionMethod::Hybrid),
            _ => None,
        }
    }
}

impl Default for EncryptionMethod {
    fn default() -> Self {
        EncryptionMethod::Hybrid
    }
}

/// A versioned set of role passwords, the unit the rotation coordinator
/// replaces atomically and the sealed store persists.
#[derive(Clone, Serialize, Deserialize)]
pub struct CredentialSet {
    pub version: u64,
    pub generated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub encryption_method: EncryptionMethod,
    pub superuser: RoleCredential,
    pub admin: RoleCredential,
    pub roles: HashMap<DBRole, RoleCredential>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub previous: Option<Box<CredentialSet>>,
}

impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CredentialSet{{version={}, roles={}, generated={}, expires={}}}",
            self.version,
            self.roles.len(),
            self.generated_at.to_rfc3339(),
            self.expires_at.to_rfc3339()
        )
    }
}

impl CredentialSet {
    /// Look up a credential by role. `Superuser` and `Admin` resolve to their
    /// dedicated fields; the remaining roles resolve from `roles`.
    pub fn get(&self, role: DBRole) -> Option<&RoleCredential> {
        match role {
            DBRole::Superuser => Some(&self.superuser),
            DBRole::Admin => Some(&self.admin),
            other => self.roles.get(&other),
        }
    }

    fn get_mut(&mut self, role: DBRole) -> Option<&mut RoleCredential> {
        match role {
            DBRole::Superuser => Some(&mut self.superuser),
            DBRole::Admin => Some(&mut self.admin),
            other => self.roles.get_mut(&other),
        }
    }

    /// Mark every credential in this set (all roles, including admin and
    /// superuser) with the given status.
    pub fn mark_all(&mut self, status: CredentialStatus) {
        self.superuser.status = status;
        self.admin.status = status;
        for cred in self.roles.values_mut() {
            cred.status = status;
        }
    }

    /// Admin plus the five job-role entries; the superuser is intentionally
    /// never returned by this accessor (spec.md §4.C `all_roles`).
    pub fn all_roles(&self) -> HashMap<DBRole, RoleCredential> {
        let mut out = self.roles.clone();
        out.insert(DBRole::Admin, self.admin.clone());
        out
    }
}

/// A read-only composition of an active and a retiring `CredentialSet`, live
/// only during a rotation's grace window (spec.md §4.D).
pub struct DualCredentialSet<'a> {
    pub active: &'a CredentialSet,
    pub retiring: &'a CredentialSet,
}

impl<'a> DualCredentialSet<'a> {
    /// Returns the active password if the role is active in `active`; falls
    /// back to the retiring set's password if it's still `Retiring` there.
    pub fn get_password(&self, role: DBRole) -> Option<&str> {
        if let Some(cred) = self.active.get(role) {
            if cred.status == CredentialStatus::Active {
                return Some(cred.password.as_str());
            }
        }
        if let Some(cred) = self.retiring.get(role) {
            if cred.status == CredentialStatus::Retiring {
                return Some(cred.password.as_str());
            }
        }
        None
    }
}

/// State of the rotation coordinator's state machine (spec.md §4.D).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RotationState {
    Idle,
    Preparing,
    Transitioning,
    Finalizing,
    Complete,
    Failed,
}

impl RotationState {
    /// States that mark a rotation as already in flight; `rotate()` rejects
    /// reentrant callers while in one of these.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            RotationState::Preparing | RotationState::Transitioning | RotationState::Finalizing
        )
    }
}

/// One entry in the rotation coordinator's history, and the payload emitted
/// to the audit chain on `complete`/`failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationEvent {
    pub timestamp: DateTime<Utc>,
    pub state: RotationState,
    pub old_version: u64,
    pub new_version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Per-entry flags the audit chain tracks alongside the hash-chain fields.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditFlags {
    #[serde(default)]
    pub break_glass: bool,
    #[serde(default)]
    pub rate_limited: bool,
    #[serde(default)]
    pub suspicious: bool,
    #[serde(default)]
    pub alert_triggered: bool,
}

/// One row of the append-only, hash-chained audit log (spec.md §3, §4.F).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub node_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub operation_id: String,
    pub role_used: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_hash: Option<String>,
    pub rows_affected: i64,
    pub duration_ms: i64,
    pub source_component: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    pub entry_hash: String,
    #[serde(default)]
    pub flags: AuditFlags,
}

/// Fields used to build a new entry before it has an id or a computed hash.
#[derive(Debug, Clone, Default)]
pub struct NewAuditEntry {
    pub node_id: Option<String>,
    pub job_id: Option<String>,
    pub operation_id: String,
    pub role_used: String,
    pub action: String,
    pub table: Option<String>,
    pub query: Option<String>,
    pub query_hash: Option<String>,
    pub rows_affected: i64,
    pub duration_ms: i64,
    pub source_component: String,
    pub actor: Option<String>,
    pub metadata: serde_json::Value,
    pub flags: AuditFlags,
}

/// Filter dimensions for `AuditChain::query`/`count` (spec.md §4.F).
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub node_id: Option<String>,
    pub job_id: Option<String>,
    pub operation_id: Option<String>,
    pub action: Option<String>,
    pub table: Option<String>,
    pub role_used: Option<String>,
    pub actor: Option<String>,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    pub suspicious: Option<bool>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}
