/// Per-client request quota over a window anchored at the client's first request.
///
/// The limiter owns the in-memory record map, its durable JSON copy, and the background
/// sweep that evicts expired records. All state transitions for a client happen under a
/// single lock, so two concurrent requests can never both take the last unit of quota.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use concierge_common::error::CommonError;
use concierge_common::store::JsonFile;

use crate::config::RateLimitConfig;

/// Quota bookkeeping for one client. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRecord {
    pub count: u32,
    pub first_request: i64,
    pub last_request: i64,
}

impl ClientRecord {
    fn fresh(now: i64) -> Self {
        Self {
            count: 1,
            first_request: now,
            last_request: now,
        }
    }

    fn expired(&self, now: i64, window_ms: i64) -> bool {
        now.saturating_sub(self.first_request) > window_ms
    }
}

/// Result of a quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub limit: u32,
    /// Epoch milliseconds at which the window closes; `None` when no window is open.
    pub reset_at: Option<i64>,
}

impl RateDecision {
    pub fn reset_at_utc(&self) -> Option<DateTime<Utc>> {
        self.reset_at
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("rate-limit state not persisted: {0}")]
    Store(#[from] CommonError),
}

#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

struct Inner {
    max_requests: u32,
    window_ms: i64,
    persist_every: u32,
    sweep_interval: Duration,
    records: Mutex<HashMap<String, ClientRecord>>,
    store: JsonFile,
    /// Serializes snapshot-and-write so an older snapshot never lands after a newer one.
    write_lock: Mutex<()>,
    /// Background writes spawned from the request path.
    writes: TaskTracker,
    cancel: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self::with_records(config, HashMap::new())
    }

    fn with_records(config: &RateLimitConfig, records: HashMap<String, ClientRecord>) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_requests: config.max_requests,
                window_ms: i64::try_from(config.window.as_millis()).unwrap_or(i64::MAX),
                persist_every: config.persist_every.max(1),
                sweep_interval: config.sweep_interval,
                records: Mutex::new(records),
                store: JsonFile::new(&config.state_path),
                write_lock: Mutex::new(()),
                writes: TaskTracker::new(),
                cancel: CancellationToken::new(),
                sweeper: Mutex::new(None),
            }),
        }
    }

    /// Restore the limiter from its state file.
    ///
    /// A missing file starts empty. An unreadable or corrupt file is logged and also starts
    /// empty; the next persist overwrites it.
    pub async fn load(config: &RateLimitConfig) -> Self {
        let store = JsonFile::new(&config.state_path);
        let records = match store.load::<HashMap<String, ClientRecord>>().await {
            Ok(Some(records)) => {
                info!(
                    path = %config.state_path.display(),
                    clients = records.len(),
                    "rate-limit state loaded"
                );
                records
            }
            Ok(None) => {
                info!(path = %config.state_path.display(), "no rate-limit state yet, starting empty");
                HashMap::new()
            }
            Err(e) => {
                warn!(error = %e, "rate-limit state unreadable, starting empty");
                HashMap::new()
            }
        };
        Self::with_records(config, records)
    }

    pub async fn check_and_record(&self, identifier: &str) -> RateDecision {
        self.check_and_record_at(identifier, now_ms()).await
    }

    /// Count one request from `identifier` at `now` (epoch ms) and decide whether it may proceed.
    ///
    /// Only in-memory bookkeeping happens before the decision is returned; any durable write
    /// it triggers runs in the background.
    pub async fn check_and_record_at(&self, identifier: &str, now: i64) -> RateDecision {
        let inner = &self.inner;
        let fresh = ClientRecord::fresh(now);
        let (decision, persist) = {
            let mut records = inner.records.lock().await;
            match records.get_mut(identifier) {
                Some(record) if !record.expired(now, inner.window_ms) => {
                    if record.count >= inner.max_requests {
                        (self.decision(false, record), false)
                    } else {
                        record.count += 1;
                        record.last_request = now;
                        let persist = record.count % inner.persist_every == 0;
                        (self.decision(true, record), persist)
                    }
                }
                Some(record) => {
                    *record = fresh;
                    (self.decision(true, &fresh), true)
                }
                None => {
                    records.insert(identifier.to_string(), fresh);
                    (self.decision(true, &fresh), true)
                }
            }
        };

        if !decision.allowed {
            warn!(identifier, reset_at = ?decision.reset_at, "request quota exhausted");
        }
        if persist {
            self.persist_in_background();
        }
        decision
    }

    fn persist_in_background(&self) {
        let limiter = self.clone();
        self.inner.writes.spawn(async move {
            if let Err(e) = limiter.persist().await {
                warn!(error = %e, "keeping in-memory rate-limit state");
            }
        });
    }

    /// Wait for every background write spawned so far.
    pub async fn flush_pending(&self) {
        let writes = &self.inner.writes;
        writes.close();
        writes.wait().await;
        writes.reopen();
    }

    pub async fn status(&self, identifier: &str) -> RateDecision {
        self.status_at(identifier, now_ms()).await
    }

    /// Read-only view of a client's quota. Never mutates or persists.
    pub async fn status_at(&self, identifier: &str, now: i64) -> RateDecision {
        let records = self.inner.records.lock().await;
        match records.get(identifier) {
            Some(record) if !record.expired(now, self.inner.window_ms) => {
                self.decision(record.count < self.inner.max_requests, record)
            }
            _ => RateDecision {
                allowed: true,
                remaining: self.inner.max_requests,
                limit: self.inner.max_requests,
                reset_at: None,
            },
        }
    }

    fn decision(&self, allowed: bool, record: &ClientRecord) -> RateDecision {
        RateDecision {
            allowed,
            remaining: self.inner.max_requests.saturating_sub(record.count),
            limit: self.inner.max_requests,
            reset_at: Some(record.first_request.saturating_add(self.inner.window_ms)),
        }
    }

    /// Drop every record whose window has fully elapsed, then persist once.
    pub async fn sweep_at(&self, now: i64) -> usize {
        let removed = {
            let mut records = self.inner.records.lock().await;
            let before = records.len();
            records.retain(|_, r| !r.expired(now, self.inner.window_ms));
            before - records.len()
        };
        info!(removed, "rate-limit sweep finished");
        if let Err(e) = self.persist().await {
            warn!(error = %e, "keeping in-memory rate-limit state");
        }
        removed
    }

    /// Write the whole record map to the state file.
    pub async fn persist(&self) -> Result<(), PersistError> {
        let _guard = self.inner.write_lock.lock().await;
        let snapshot = self.inner.records.lock().await.clone();
        self.inner.store.save(&snapshot).await?;
        debug!(clients = snapshot.len(), "rate-limit state persisted");
        Ok(())
    }

    #[cfg(test)]
    pub async fn tracked_clients(&self) -> usize {
        self.inner.records.lock().await.len()
    }

    /// Start the periodic sweep. Calling it again while a sweep task is running is a no-op.
    pub async fn start_sweeper(&self) {
        let mut slot = self.inner.sweeper.lock().await;
        if slot.is_some() {
            return;
        }

        let limiter = self.clone();
        let cancel = self.inner.cancel.child_token();
        let every = self.inner.sweep_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        limiter.sweep_at(now_ms()).await;
                    }
                }
            }
            debug!("rate-limit sweeper stopped");
        }));
        info!(interval_secs = every.as_secs(), "rate-limit sweeper started");
    }

    /// Stop the sweeper, let in-flight writes land, and flush state one last time.
    pub async fn shutdown(&self) -> Result<(), PersistError> {
        self.inner.cancel.cancel();
        if let Some(handle) = self.inner.sweeper.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "rate-limit sweeper did not stop cleanly");
            }
        }
        self.flush_pending().await;
        self.persist().await?;
        info!("rate-limit state flushed");
        Ok(())
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Derive the throttling key for a caller: its address plus a short digest of the
/// client-supplied user agent.
pub fn client_identifier(addr: &str, user_agent: Option<&str>) -> String {
    let digest = Sha256::digest(user_agent.unwrap_or_default().as_bytes());
    let hex = format!("{digest:x}");
    format!("{addr}:{}", &hex[..16])
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tokio::task::JoinSet;

    use super::*;

    const HOUR_MS: i64 = 60 * 60 * 1000;
    const T0: i64 = 1_760_000_000_000;

    fn config(state_path: &Path) -> RateLimitConfig {
        RateLimitConfig {
            state_path: state_path.to_path_buf(),
            max_requests: 30,
            window: Duration::from_secs(12 * 60 * 60),
            persist_every: 5,
            sweep_interval: Duration::from_secs(3600),
        }
    }

    fn on_disk(path: &Path) -> HashMap<String, ClientRecord> {
        serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_quota_then_denial_with_reset_time() {
        let dir = tempfile::tempdir().unwrap();
        let limiter = RateLimiter::new(&config(&dir.path().join("state.json")));

        for i in 0..30u32 {
            let d = limiter.check_and_record_at("client", T0 + i as i64 * 1000).await;
            assert!(d.allowed, "request {} should pass", i + 1);
            assert_eq!(d.remaining, 29 - i);
            assert_eq!(d.reset_at, Some(T0 + 12 * HOUR_MS));
        }

        let denied = limiter.check_and_record_at("client", T0 + 6 * HOUR_MS).await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reset_at, Some(T0 + 12 * HOUR_MS));
        assert_eq!(
            denied.reset_at_utc().unwrap().timestamp_millis(),
            T0 + 12 * HOUR_MS
        );

        // Other clients are unaffected.
        assert!(limiter.check_and_record_at("other", T0 + 6 * HOUR_MS).await.allowed);
    }

    #[tokio::test]
    async fn test_denial_leaves_record_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir.path().join("state.json"));
        cfg.max_requests = 2;
        let limiter = RateLimiter::new(&cfg);

        limiter.check_and_record_at("c", T0).await;
        limiter.check_and_record_at("c", T0 + 10).await;
        let before = limiter.inner.records.lock().await.get("c").copied();

        assert!(!limiter.check_and_record_at("c", T0 + 20).await.allowed);
        assert!(!limiter.check_and_record_at("c", T0 + 30).await.allowed);
        let after = limiter.inner.records.lock().await.get("c").copied();
        assert_eq!(before, after);
        assert_eq!(after.unwrap().last_request, T0 + 10);
    }

    #[tokio::test]
    async fn test_window_expiry_resets_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let limiter = RateLimiter::new(&config(&path));

        for i in 0..30 {
            limiter.check_and_record_at("c", T0 + i).await;
        }
        // Exactly at the boundary the window is still open.
        assert!(!limiter.check_and_record_at("c", T0 + 12 * HOUR_MS).await.allowed);

        let later = T0 + 12 * HOUR_MS + 1;
        let d = limiter.check_and_record_at("c", later).await;
        assert!(d.allowed);
        assert_eq!(d.remaining, 29);
        assert_eq!(d.reset_at, Some(later + 12 * HOUR_MS));
        assert_eq!(limiter.inner.records.lock().await["c"].count, 1);

        limiter.flush_pending().await;
        let stored = on_disk(&path)["c"];
        assert_eq!(stored.count, 1);
        assert_eq!(stored.first_request, later);
    }

    #[tokio::test]
    async fn test_status_is_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let limiter = RateLimiter::new(&config(&path));

        let fresh = limiter.status_at("nobody", T0).await;
        assert!(fresh.allowed);
        assert_eq!(fresh.remaining, 30);
        assert_eq!(fresh.reset_at, None);
        assert_eq!(limiter.tracked_clients().await, 0);
        assert!(!path.exists());

        limiter.check_and_record_at("c", T0).await;
        limiter.check_and_record_at("c", T0 + 1).await;
        let status = limiter.status_at("c", T0 + 2).await;
        assert_eq!(status.remaining, 28);
        assert_eq!(status.reset_at, Some(T0 + 12 * HOUR_MS));
        assert_eq!(limiter.status_at("c", T0 + 3).await, status);

        let expired = limiter.status_at("c", T0 + 13 * HOUR_MS).await;
        assert_eq!(expired.remaining, 30);
        assert_eq!(expired.reset_at, None);
    }

    #[tokio::test]
    async fn test_persistence_cadence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let limiter = RateLimiter::new(&config(&path));

        limiter.check_and_record_at("c", T0).await;
        limiter.flush_pending().await;
        assert_eq!(on_disk(&path)["c"].count, 1);

        for i in 1..4 {
            limiter.check_and_record_at("c", T0 + i).await;
        }
        limiter.flush_pending().await;
        assert_eq!(on_disk(&path)["c"].count, 1, "increments 2-4 stay in memory");

        limiter.check_and_record_at("c", T0 + 4).await;
        limiter.flush_pending().await;
        assert_eq!(on_disk(&path)["c"].count, 5);
    }

    #[tokio::test]
    async fn test_decision_does_not_wait_for_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let limiter = RateLimiter::new(&config(&path));

        let write_guard = limiter.inner.write_lock.lock().await;
        let d = tokio::time::timeout(
            Duration::from_secs(1),
            limiter.check_and_record_at("new", T0),
        )
        .await
        .expect("decision returned while a write was in progress");
        assert!(d.allowed);
        assert!(!path.exists());

        drop(write_guard);
        limiter.flush_pending().await;
        assert_eq!(on_disk(&path)["new"].count, 1);
    }

    #[tokio::test]
    async fn test_oversized_window_still_limits() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir.path().join("state.json"));
        cfg.max_requests = 2;
        cfg.window = Duration::from_secs(u64::MAX);
        let limiter = RateLimiter::new(&cfg);

        assert!(limiter.check_and_record_at("c", T0).await.allowed);
        assert!(limiter.check_and_record_at("c", T0 + 1).await.allowed);
        let denied = limiter.check_and_record_at("c", T0 + 365 * 24 * HOUR_MS).await;
        assert!(!denied.allowed);
        assert_eq!(denied.reset_at, Some(i64::MAX));
    }

    #[tokio::test]
    async fn test_restart_reproduces_decisions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut cfg = config(&path);
        cfg.max_requests = 10;

        let before = RateLimiter::new(&cfg);
        for i in 0..7 {
            before.check_and_record_at("a", T0 + i).await;
        }
        for i in 0..10 {
            before.check_and_record_at("b", T0 + i).await;
        }
        before.shutdown().await.unwrap();

        let after = RateLimiter::load(&cfg).await;
        assert_eq!(after.tracked_clients().await, 2);
        for id in ["a", "b", "c"] {
            assert_eq!(
                before.status_at(id, T0 + 100).await,
                after.status_at(id, T0 + 100).await
            );
            assert_eq!(
                before.check_and_record_at(id, T0 + 200).await,
                after.check_and_record_at(id, T0 + 200).await
            );
        }
    }

    #[tokio::test]
    async fn test_corrupt_state_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"not json at all").unwrap();

        let limiter = RateLimiter::load(&config(&path)).await;
        assert_eq!(limiter.tracked_clients().await, 0);
        assert!(limiter.check_and_record_at("c", T0).await.allowed);
        limiter.flush_pending().await;
        assert_eq!(on_disk(&path)["c"].count, 1);
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let limiter = RateLimiter::new(&config(&path));

        limiter.check_and_record_at("old", T0).await;
        limiter.check_and_record_at("new", T0 + 6 * HOUR_MS).await;
        limiter.flush_pending().await;

        let removed = limiter.sweep_at(T0 + 13 * HOUR_MS).await;
        assert_eq!(removed, 1);
        assert_eq!(limiter.tracked_clients().await, 1);

        let stored = on_disk(&path);
        assert!(stored.contains_key("new"));
        assert!(!stored.contains_key("old"));
    }

    #[tokio::test]
    async fn test_sweeper_runs_in_background_and_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut cfg = config(&path);
        cfg.window = Duration::from_millis(20);
        cfg.sweep_interval = Duration::from_millis(30);
        let limiter = RateLimiter::new(&cfg);

        limiter.check_and_record("c").await;
        limiter.start_sweeper().await;
        limiter.start_sweeper().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(limiter.tracked_clients().await, 0);

        limiter.shutdown().await.unwrap();
        assert!(limiter.inner.sweeper.lock().await.is_none());
        assert!(on_disk(&path).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_never_exceed_quota() {
        let dir = tempfile::tempdir().unwrap();
        let limiter = RateLimiter::new(&config(&dir.path().join("state.json")));

        let mut tasks = JoinSet::new();
        for _ in 0..100 {
            let limiter = limiter.clone();
            tasks.spawn(async move { limiter.check_and_record_at("shared", T0).await });
        }

        let mut allowed = 0;
        let mut remaining_seen = Vec::new();
        while let Some(result) = tasks.join_next().await {
            let d = result.unwrap();
            if d.allowed {
                allowed += 1;
                remaining_seen.push(d.remaining);
            } else {
                assert_eq!(d.remaining, 0);
            }
        }
        assert_eq!(allowed, 30);
        remaining_seen.sort_unstable();
        assert_eq!(remaining_seen, (0..30).collect::<Vec<u32>>());
    }

    #[test]
    fn test_client_identifier() {
        let a = client_identifier("203.0.113.7", Some("Mozilla/5.0"));
        assert_eq!(a, client_identifier("203.0.113.7", Some("Mozilla/5.0")));
        assert!(a.starts_with("203.0.113.7:"));
        assert_eq!(a.len(), "203.0.113.7:".len() + 16);
        assert_ne!(a, client_identifier("203.0.113.7", Some("curl/8.0")));
        assert_ne!(a, client_identifier("203.0.113.8", Some("Mozilla/5.0")));
        assert_eq!(
            client_identifier("::1", None),
            client_identifier("::1", Some(""))
        );
    }
}
