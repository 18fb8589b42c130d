//! Trust cache — policy facade over the store's trust table.
//!
//! Holds no data of its own. A present record only shortens the operator
//! prompt (lightweight offer set); every invocation still needs an explicit
//! per-invocation approval.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::request::{TrustRecord, TrustScope};
use crate::store::{RequestStore, StoreError};

#[derive(Clone)]
pub struct TrustCache {
    store: Arc<RequestStore>,
}

impl TrustCache {
    pub fn new(store: Arc<RequestStore>) -> Self {
        Self { store }
    }

    /// Persists a grant. `once` never reaches the table — callers treat it
    /// as the per-invocation decision it is.
    pub fn grant(
        &self,
        source: &str,
        fingerprint: &str,
        scope: TrustScope,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.store.add_trust(source, fingerprint, scope, now)
    }

    /// The only read path. Expired rows are lazily deleted by the store so
    /// an expired grant is indistinguishable from no grant.
    pub fn lookup(
        &self,
        source: &str,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TrustRecord>, StoreError> {
        self.store.lookup_trust(source, fingerprint, now)
    }
}
