//! Background janitor — periodic expiry sweep.
//!
//! Hourly by default: deletes expired trust rows (bounded GC independent of
//! lazy lookup deletion) and, when a retention horizon is configured, reaps
//! terminal requests and their pinned code. Runs concurrently with
//! everything else; all mutation goes through the store's own operations.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::JanitorConfig;
use crate::store::RequestStore;

pub fn spawn(store: Arc<RequestStore>, config: JanitorConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(config.sweep_interval_secs.max(1)));
        // Consume the immediate first tick so startup does not race tests
        // and restarts do not double-sweep.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            sweep(&store, &config);
        }
    })
}

/// One sweep pass. Extracted so tests can drive it without the timer.
pub fn sweep(store: &RequestStore, config: &JanitorConfig) {
    let now = Utc::now();
    match store.sweep_expired_trust(now) {
        Ok(0) => {}
        Ok(n) => info!("Janitor removed {n} expired trust record(s)"),
        Err(e) => warn!("Janitor trust sweep failed: {e}"),
    }
    if let Some(hours) = config.retention_hours {
        let cutoff = now - chrono::Duration::hours(hours as i64);
        match store.reap_terminal_before(cutoff) {
            Ok(0) => {}
            Ok(n) => info!("Janitor reaped {n} terminal request(s)"),
            Err(e) => warn!("Janitor retention sweep failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::SkillMetadata;
    use crate::request::{Request, RequestState, TrustScope};
    use chrono::Duration as ChronoDuration;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn store() -> (Arc<RequestStore>, TempDir) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(RequestStore::open(tmp.path().join("db")).unwrap());
        (store, tmp)
    }

    fn request_created_at(created_at: chrono::DateTime<Utc>) -> Request {
        let meta = SkillMetadata {
            skill: "hello".to_string(),
            description: None,
            secrets: vec![],
            network: vec![],
            timeout_secs: 30,
        };
        let mut req = Request::new(
            "hello",
            "data:,x",
            "fp",
            &meta,
            &[],
            BTreeMap::new(),
            created_at,
        );
        req.created_at = created_at;
        req
    }

    #[test]
    fn test_sweep_removes_expired_trust_only() {
        let (store, _tmp) = store();
        let past = Utc::now() - ChronoDuration::days(2);
        store
            .add_trust("src", "stale", TrustScope::Day, past)
            .unwrap();
        store
            .add_trust("src", "keep", TrustScope::Forever, past)
            .unwrap();

        sweep(&store, &JanitorConfig::default());

        assert!(store
            .lookup_trust("src", "keep", Utc::now())
            .unwrap()
            .is_some());
        assert!(store
            .lookup_trust("src", "stale", Utc::now())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_retention_disabled_keeps_everything() {
        let (store, _tmp) = store();
        let old = request_created_at(Utc::now() - ChronoDuration::days(365));
        store.create(&old).unwrap();
        store
            .set_result(&old.id, RequestState::Failed, None, None, Utc::now())
            .unwrap();

        sweep(&store, &JanitorConfig::default());
        assert!(store.get(&old.id).unwrap().is_some());
    }

    #[test]
    fn test_retention_reaps_old_terminal_rows() {
        let (store, _tmp) = store();
        let old = request_created_at(Utc::now() - ChronoDuration::days(30));
        store.create(&old).unwrap();
        store.store_code(&old.id, b"code").unwrap();
        store
            .set_result(&old.id, RequestState::Completed, None, None, Utc::now())
            .unwrap();

        let pending = request_created_at(Utc::now() - ChronoDuration::days(30));
        store.create(&pending).unwrap();

        let config = JanitorConfig {
            sweep_interval_secs: 3600,
            retention_hours: Some(24 * 7),
        };
        sweep(&store, &config);

        assert!(store.get(&old.id).unwrap().is_none());
        assert!(store.load_code(&old.id).unwrap().is_none());
        // A pending row is never reaped, however old
        assert!(store.get(&pending.id).unwrap().is_some());
    }
}
