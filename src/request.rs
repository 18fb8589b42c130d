//! Request data model — the row shape persisted by the store.
//!
//! A request moves through the lifecycle below. `denied`, `completed` and
//! `failed` are terminal; every transition is performed by the store's
//! compare-and-swap so concurrent events resolve to a single winner.
//!
//! ```text
//! pending ── approve ──▶ approved ── all-secrets-present ──▶ executing ──▶ completed | failed
//!    │                     │                                                    ▲
//!    │                     └── missing-secret ──▶ awaiting_secrets ─────────────┘
//!    └── deny ──▶ denied       ▲           │
//!                              └── secret-supplied ──┘
//! ```

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metadata::SkillMetadata;

/// Lifecycle state of an execution request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    Approved,
    AwaitingSecrets,
    Executing,
    Completed,
    Failed,
    Denied,
}

impl RequestState {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Denied)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::AwaitingSecrets => "awaiting_secrets",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Denied => "denied",
        };
        f.write_str(s)
    }
}

/// Duration of a code-level trust grant.
///
/// `Once` is a per-invocation decision and is never written to the trust
/// table — the store rejects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustScope {
    #[serde(rename = "once")]
    Once,
    #[serde(rename = "24h")]
    Day,
    #[serde(rename = "forever")]
    Forever,
}

impl TrustScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Once => "once",
            Self::Day => "24h",
            Self::Forever => "forever",
        }
    }

    /// Parses a scope from a button payload segment. Unknown strings are `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "once" => Some(Self::Once),
            "24h" => Some(Self::Day),
            "forever" => Some(Self::Forever),
            _ => None,
        }
    }
}

impl fmt::Display for TrustScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted trust grant, keyed by `(source locator, fingerprint)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustRecord {
    pub scope: TrustScope,
    pub granted_at: DateTime<Utc>,
    /// Absolute expiry; `None` means the grant never expires.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl TrustRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(exp) if now >= exp)
    }
}

/// Captured output of a sandbox run.
///
/// `success` means exit code 0 and no timeout. A timed-out run carries the
/// sentinel exit code [`TIMEOUT_EXIT_CODE`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Exit code reported for a run killed by the wall-clock timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Why a request ended in the `failed` state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// The sandbox subprocess could not be launched.
    Launch { message: String },
    /// The subprocess exceeded its wall-clock timeout.
    Timeout,
    /// The subprocess exited with a nonzero status.
    NonZero,
    /// Any unexpected internal condition.
    Internal { message: String },
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Launch { message } => write!(f, "sandbox launch failed: {message}"),
            Self::Timeout => f.write_str("sandbox timeout"),
            Self::NonZero => f.write_str("nonzero exit"),
            Self::Internal { message } => write!(f, "internal error: {message}"),
        }
    }
}

/// One execution request, as persisted in the `requests` tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Opaque identifier: 128 bits of entropy, lowercase hex.
    pub id: String,
    /// Identifier the submitting agent used.
    pub skill_id: String,
    /// Logical name declared in the code's metadata header.
    pub skill_name: String,
    /// Where the code was fetched from (audit/display only — execution
    /// always uses the stored bytes).
    pub source: String,
    /// SHA-256 hex over the stored code bytes.
    pub fingerprint: String,
    /// Declared secret names, in declaration order.
    pub secrets: Vec<String>,
    /// Invocation arguments, passed to the sandbox as environment.
    pub args: BTreeMap<String, String>,
    /// Declared network allow-list; empty means no network.
    pub network: Vec<String>,
    /// Declared wall-clock timeout in seconds.
    pub timeout_secs: u64,
    pub state: RequestState,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    /// Weak reference to the operator prompt message; lookup only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_handle: Option<String>,
}

impl Request {
    /// Builds a fresh `pending` request from an ingress submission and the
    /// parsed metadata header.
    ///
    /// Declared secrets are the union of the header's `@secrets` lines and
    /// the names supplied in the submission, header order first.
    pub fn new(
        skill_id: &str,
        source: &str,
        fingerprint: &str,
        meta: &SkillMetadata,
        submitted_secrets: &[String],
        args: BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut secrets = meta.secrets.clone();
        for name in submitted_secrets {
            if !secrets.iter().any(|s| s == name) {
                secrets.push(name.clone());
            }
        }
        Self {
            id: fresh_id(),
            skill_id: skill_id.to_string(),
            skill_name: meta.skill.clone(),
            source: source.to_string(),
            fingerprint: fingerprint.to_string(),
            secrets,
            args,
            network: meta.network.clone(),
            timeout_secs: meta.timeout_secs,
            state: RequestState::Pending,
            created_at: now,
            approved_at: None,
            executed_at: None,
            result: None,
            failure: None,
            chat_handle: None,
        }
    }

    /// Short fingerprint prefix shown in operator prompts.
    pub fn fingerprint_prefix(&self) -> &str {
        &self.fingerprint[..self.fingerprint.len().min(12)]
    }
}

/// Generates a fresh opaque request id (UUIDv4 as 32 hex chars).
pub fn fresh_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// SHA-256 hex fingerprint over code bytes.
pub fn fingerprint(code: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(code))
}
