//! Sled-backed request store — the single owner of durable state.
//!
//! Trees:
//!   requests  — request id → serde_json `Request` row
//!   trust     — "source\nfingerprint" → serde_json `TrustRecord`
//!   secrets   — secret name → raw value bytes
//!   codes     — request id → raw code bytes (exactly what was fingerprinted)
//!
//! Lifecycle state is mutated only through [`RequestStore::transition`] and
//! [`RequestStore::set_result`], both implemented as compare-and-swap loops
//! so concurrent callers resolve to a single winner. Every acknowledged
//! write is flushed before returning.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::request::{
    ExecutionResult, FailureKind, Request, RequestState, TrustRecord, TrustScope,
};

const TREE_REQUESTS: &str = "requests";
const TREE_TRUST: &str = "trust";
const TREE_SECRETS: &str = "secrets";
const TREE_CODES: &str = "codes";

/// Seconds in a `24h` trust grant.
const DAY_SECS: i64 = 86_400;

#[derive(Debug)]
pub enum StoreError {
    /// No row for the given id.
    NotFound,
    /// `create` with an id that already exists.
    DuplicateId,
    /// `transition` found the row in a different state than `from`.
    WrongState { actual: RequestState },
    /// `add_trust` with the non-persistable `once` scope.
    ScopeNotPersistable,
    /// A secret name that the vault refuses (empty).
    InvalidName,
    /// Row bytes did not decode.
    Corrupt(String),
    Backend(sled::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => f.write_str("request not found"),
            Self::DuplicateId => f.write_str("duplicate request id"),
            Self::WrongState { actual } => write!(f, "request is in state {actual}"),
            Self::ScopeNotPersistable => f.write_str("trust scope 'once' is not persisted"),
            Self::InvalidName => f.write_str("secret name must be non-empty"),
            Self::Corrupt(e) => write!(f, "corrupt row: {e}"),
            Self::Backend(e) => write!(f, "store backend error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sled::Error> for StoreError {
    fn from(e: sled::Error) -> Self {
        Self::Backend(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Corrupt(e.to_string())
    }
}

pub struct RequestStore {
    db: sled::Db,
    requests: sled::Tree,
    trust: sled::Tree,
    secrets: sled::Tree,
    codes: sled::Tree,
}

impl RequestStore {
    /// Opens or creates the store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path.as_ref())?;
        let store = Self {
            requests: db.open_tree(TREE_REQUESTS)?,
            trust: db.open_tree(TREE_TRUST)?,
            secrets: db.open_tree(TREE_SECRETS)?,
            codes: db.open_tree(TREE_CODES)?,
            db,
        };
        info!("Request store opened at {}", path.as_ref().display());
        Ok(store)
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // ── Request rows ──────────────────────────────────────

    /// Inserts a fresh request. The row must be in state `pending`.
    pub fn create(&self, request: &Request) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(request)?;
        match self
            .requests
            .compare_and_swap(request.id.as_bytes(), None as Option<&[u8]>, Some(bytes))?
        {
            Ok(()) => {
                self.flush()?;
                debug!("Created request {} ({})", request.id, request.skill_name);
                Ok(())
            }
            Err(_) => Err(StoreError::DuplicateId),
        }
    }

    pub fn get(&self, id: &str) -> Result<Option<Request>, StoreError> {
        match self.requests.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Compare-and-set on lifecycle state: moves `id` from `from` to `to`,
    /// stamping the matching timestamp. Rejects with [`StoreError::WrongState`]
    /// when the row is not currently in `from`.
    ///
    /// This is the sole legal lifecycle mutator outside of [`Self::set_result`].
    pub fn transition(
        &self,
        id: &str,
        from: RequestState,
        to: RequestState,
        ts: DateTime<Utc>,
    ) -> Result<Request, StoreError> {
        loop {
            let cur = self
                .requests
                .get(id.as_bytes())?
                .ok_or(StoreError::NotFound)?;
            let mut row: Request = serde_json::from_slice(&cur)?;
            if row.state != from {
                return Err(StoreError::WrongState { actual: row.state });
            }
            row.state = to;
            match to {
                RequestState::Approved => row.approved_at = Some(ts),
                RequestState::Executing => row.executed_at = Some(ts),
                _ => {}
            }
            let new = serde_json::to_vec(&row)?;
            match self
                .requests
                .compare_and_swap(id.as_bytes(), Some(&cur[..]), Some(new))?
            {
                Ok(()) => {
                    self.flush()?;
                    debug!("Request {id}: {from} → {to}");
                    return Ok(row);
                }
                // Lost the race; re-read and re-check the precondition
                Err(_) => continue,
            }
        }
    }

    /// Records a terminal outcome atomically with the state transition.
    ///
    /// Accepts any non-terminal current state (fatal internal errors may
    /// fail a request from anywhere in the lifecycle).
    pub fn set_result(
        &self,
        id: &str,
        terminal: RequestState,
        result: Option<ExecutionResult>,
        failure: Option<FailureKind>,
        ts: DateTime<Utc>,
    ) -> Result<Request, StoreError> {
        debug_assert!(terminal.is_terminal());
        loop {
            let cur = self
                .requests
                .get(id.as_bytes())?
                .ok_or(StoreError::NotFound)?;
            let mut row: Request = serde_json::from_slice(&cur)?;
            if row.state.is_terminal() {
                return Err(StoreError::WrongState { actual: row.state });
            }
            row.state = terminal;
            row.result = result.clone();
            row.failure = failure.clone();
            if row.executed_at.is_none() {
                row.executed_at = Some(ts);
            }
            let new = serde_json::to_vec(&row)?;
            match self
                .requests
                .compare_and_swap(id.as_bytes(), Some(&cur[..]), Some(new))?
            {
                Ok(()) => {
                    self.flush()?;
                    debug!("Request {id}: terminal {terminal}");
                    return Ok(row);
                }
                Err(_) => continue,
            }
        }
    }

    /// Attaches the operator prompt's chat handle. Idempotent.
    pub fn attach_chat_handle(&self, id: &str, handle: &str) -> Result<(), StoreError> {
        loop {
            let cur = self
                .requests
                .get(id.as_bytes())?
                .ok_or(StoreError::NotFound)?;
            let mut row: Request = serde_json::from_slice(&cur)?;
            if row.chat_handle.as_deref() == Some(handle) {
                return Ok(());
            }
            row.chat_handle = Some(handle.to_string());
            let new = serde_json::to_vec(&row)?;
            match self
                .requests
                .compare_and_swap(id.as_bytes(), Some(&cur[..]), Some(new))?
            {
                Ok(()) => return self.flush(),
                Err(_) => continue,
            }
        }
    }

    /// All request rows, newest first. Queryable history for status
    /// commands and the janitor.
    pub fn list_requests(&self) -> Result<Vec<Request>, StoreError> {
        let mut rows = Vec::new();
        for item in self.requests.iter() {
            let (_, bytes) = item?;
            rows.push(serde_json::from_slice::<Request>(&bytes)?);
        }
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    // ── Trust table ───────────────────────────────────────

    fn trust_key(source: &str, fingerprint: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(source.len() + 1 + fingerprint.len());
        key.extend_from_slice(source.as_bytes());
        key.push(b'\n');
        key.extend_from_slice(fingerprint.as_bytes());
        key
    }

    /// Upserts a trust grant. `24h` gets an absolute expiry of `now + 86 400 s`,
    /// `forever` gets none. `once` is a per-invocation decision and is refused.
    pub fn add_trust(
        &self,
        source: &str,
        fingerprint: &str,
        scope: TrustScope,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let expires_at = match scope {
            TrustScope::Once => return Err(StoreError::ScopeNotPersistable),
            TrustScope::Day => Some(now + Duration::seconds(DAY_SECS)),
            TrustScope::Forever => None,
        };
        let record = TrustRecord {
            scope,
            granted_at: now,
            expires_at,
        };
        self.trust.insert(
            Self::trust_key(source, fingerprint),
            serde_json::to_vec(&record)?,
        )?;
        self.flush()?;
        info!("Trust granted for {} ({scope})", &fingerprint[..12.min(fingerprint.len())]);
        Ok(())
    }

    /// Returns the trust record iff it has not expired. Expired rows are
    /// deleted on the way out so no caller can observe a stale grant.
    pub fn lookup_trust(
        &self,
        source: &str,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TrustRecord>, StoreError> {
        let key = Self::trust_key(source, fingerprint);
        match self.trust.get(&key)? {
            None => Ok(None),
            Some(bytes) => {
                let record: TrustRecord = serde_json::from_slice(&bytes)?;
                if record.is_expired(now) {
                    self.trust.remove(&key)?;
                    self.flush()?;
                    Ok(None)
                } else {
                    Ok(Some(record))
                }
            }
        }
    }

    /// Deletes every expired trust row. Returns the number removed.
    pub fn sweep_expired_trust(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut removed = 0;
        for item in self.trust.iter() {
            let (key, bytes) = item?;
            let record: TrustRecord = serde_json::from_slice(&bytes)?;
            if record.is_expired(now) {
                self.trust.remove(&key)?;
                removed += 1;
            }
        }
        if removed > 0 {
            self.flush()?;
        }
        Ok(removed)
    }

    // ── Code bytes ────────────────────────────────────────

    /// Pins the exact bytes that were fingerprinted; execution and the
    /// code-view page read these back, never a re-fetch.
    pub fn store_code(&self, id: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.codes.insert(id.as_bytes(), bytes)?;
        self.flush()
    }

    pub fn load_code(&self, id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.codes.get(id.as_bytes())?.map(|b| b.to_vec()))
    }

    // ── Secret table ──────────────────────────────────────

    pub fn put_secret(&self, name: &str, value: &[u8]) -> Result<(), StoreError> {
        self.secrets.insert(name.as_bytes(), value)?;
        self.flush()
    }

    pub fn get_secret(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.secrets.get(name.as_bytes())?.map(|b| b.to_vec()))
    }

    pub fn delete_secret(&self, name: &str) -> Result<(), StoreError> {
        self.secrets.remove(name.as_bytes())?;
        self.flush()
    }

    pub fn list_secret_names(&self) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        for item in self.secrets.iter() {
            let (key, _) = item?;
            if let Ok(name) = String::from_utf8(key.to_vec()) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    // ── Retention ─────────────────────────────────────────

    /// Removes terminal requests (and their pinned code) created before
    /// `cutoff`. Returns the number of rows reaped.
    pub fn reap_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut reaped = 0;
        for item in self.requests.iter() {
            let (key, bytes) = item?;
            let row: Request = serde_json::from_slice(&bytes)?;
            if row.state.is_terminal() && row.created_at < cutoff {
                self.requests.remove(&key)?;
                self.codes.remove(&key)?;
                reaped += 1;
            }
        }
        if reaped > 0 {
            self.flush()?;
        }
        Ok(reaped)
    }
}
