//! In-memory row cache with TTL and stale-while-revalidate clocks.
//!
//! Each entry carries two deadlines: after `stale_at` the rows are still
//! served but flagged stale, after `expires_at` the entry is gone. Expired
//! entries are evicted lazily on read and by a periodic sweep, so sources that
//! stop being read do not pin memory.
//!
//! The store is a single map behind one `RwLock`. Entries are small and
//! row sets are shared through `Arc`, so lock hold times are short.
//!
//! ```rust,ignore
//! use livesource_rs::cache::MemoryCache;
//! use std::time::Duration;
//!
//! let cache = MemoryCache::with_sweeper(Duration::from_secs(60));
//! cache.set_with_stale("tasks", rows, Duration::from_secs(30), Duration::from_secs(60));
//!
//! if let Some(hit) = cache.get("tasks") {
//!     if hit.stale {
//!         // schedule a refresh
//!     }
//! }
//! cache.stop();
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::source::Row;

/// Default interval between background sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A cached row set with its two clocks.
///
/// Invariant: `stale_at <= expires_at`.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    rows: Arc<Vec<Row>>,
    stored_at: Instant,
    stale_at: Instant,
    expires_at: Instant,
}

impl CacheEntry {
    fn new(rows: Arc<Vec<Row>>, stale_after: Duration, expire_after: Duration) -> Self {
        let now = Instant::now();
        let expires_at = now + expire_after;
        let stale_at = (now + stale_after).min(expires_at);
        Self {
            rows,
            stored_at: now,
            stale_at,
            expires_at,
        }
    }

    /// Check if the entry is past its expiry.
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Check if the entry is stale but still usable.
    pub fn is_stale(&self, now: Instant) -> bool {
        now >= self.stale_at && now < self.expires_at
    }

    /// When the entry turns stale.
    pub fn stale_at(&self) -> Instant {
        self.stale_at
    }

    /// When the entry expires.
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }
}

/// Result of a cache hit.
#[derive(Debug, Clone)]
pub struct CacheHit {
    /// The cached rows.
    pub rows: Arc<Vec<Row>>,
    /// Whether the rows are past their fresh window.
    pub stale: bool,
    /// Time since the rows were stored.
    pub age: Duration,
}

/// Thread-safe in-memory cache keyed by source name.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
    /// Stop signal for the sweep task. Taken on the first `stop()`.
    sweeper: Mutex<Option<oneshot::Sender<()>>>,
}

impl MemoryCache {
    /// Create an empty cache with no background sweep.
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            sweeper: Mutex::new(None),
        }
    }

    /// Create an empty cache and start the periodic sweep.
    ///
    /// The sweep needs a Tokio runtime; outside one the cache still works and
    /// relies on lazy eviction only.
    pub fn with_sweeper(interval: Duration) -> Self {
        let cache = Self::new();
        cache.start_sweeper(interval);
        cache
    }

    /// Look up rows by key.
    ///
    /// An entry past its expiry is evicted and reported as a miss.
    pub fn get(&self, key: &str) -> Option<CacheHit> {
        let now = Instant::now();
        {
            let entries = self.read();
            let entry = entries.get(key)?;
            if !entry.is_expired(now) {
                return Some(CacheHit {
                    rows: Arc::clone(&entry.rows),
                    stale: entry.is_stale(now),
                    age: now.saturating_duration_since(entry.stored_at),
                });
            }
        }

        // Re-check under the write lock: a writer may have refreshed the entry.
        let mut entries = self.write();
        if entries.get(key).is_some_and(|e| e.is_expired(Instant::now())) {
            entries.remove(key);
        }
        None
    }

    /// Store rows with a single TTL and no staleness window.
    pub fn set(&self, key: impl Into<String>, rows: impl Into<Arc<Vec<Row>>>, ttl: Duration) {
        self.set_with_stale(key, rows, ttl, ttl);
    }

    /// Store rows that turn stale after `stale_after` and expire after `expire_after`.
    ///
    /// A `stale_after` longer than `expire_after` is clamped.
    pub fn set_with_stale(
        &self,
        key: impl Into<String>,
        rows: impl Into<Arc<Vec<Row>>>,
        stale_after: Duration,
        expire_after: Duration,
    ) {
        let entry = CacheEntry::new(rows.into(), stale_after, expire_after);
        self.write().insert(key.into(), entry);
    }

    /// Remove one entry. Returns `true` if it was present.
    pub fn invalidate(&self, key: &str) -> bool {
        self.write().remove(key).is_some()
    }

    /// Remove every entry.
    pub fn invalidate_all(&self) {
        self.write().clear();
    }

    /// Number of live (non-expired) entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.read().values().filter(|e| !e.is_expired(now)).count()
    }

    /// Check if the cache holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict every expired entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        sweep_expired(&self.entries)
    }

    /// Start the periodic sweep if it is not already running.
    pub fn start_sweeper(&self, interval: Duration) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("no tokio runtime; cache sweep disabled");
            return;
        };

        let mut slot = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let entries = Arc::clone(&self.entries);
        handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = sweep_expired(&entries);
                        if removed > 0 {
                            tracing::debug!(removed, "cache sweep evicted expired entries");
                        }
                    }
                    // Fires on an explicit stop and when the cache is dropped.
                    _ = &mut stop_rx => break,
                }
            }
            tracing::debug!("cache sweeper stopped");
        });
        *slot = Some(stop_tx);
        tracing::info!(interval_ms = interval.as_millis() as u64, "cache sweeper started");
    }

    /// Stop the periodic sweep. Safe to call any number of times.
    pub fn stop(&self) {
        let sender = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }

    /// Check if the periodic sweep is running.
    pub fn is_sweeping(&self) -> bool {
        self.sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for MemoryCache {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sweep_expired(entries: &RwLock<HashMap<String, CacheEntry>>) -> usize {
    let now = Instant::now();
    let mut entries = entries.write().unwrap_or_else(PoisonError::into_inner);
    let before = entries.len();
    entries.retain(|_, entry| !entry.is_expired(now));
    before - entries.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(n: usize) -> Vec<Row> {
        (0..n)
            .map(|i| {
                let mut row = Row::new();
                row.insert("id".into(), json!(i));
                row
            })
            .collect()
    }

    #[test]
    fn test_new_cache_is_empty() {
        let cache = MemoryCache::new();
        assert!(cache.is_empty());
        assert!(cache.get("missing").is_none());
    }

    #[test]
    fn test_set_and_get_fresh() {
        let cache = MemoryCache::new();
        cache.set("a", rows(2), Duration::from_secs(60));

        let hit = cache.get("a").unwrap();
        assert_eq!(hit.rows.len(), 2);
        assert!(!hit.stale);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_stale_clamped_to_expiry() {
        let entry = CacheEntry::new(Arc::new(rows(1)), Duration::from_secs(10), Duration::from_secs(1));
        assert!(entry.stale_at() <= entry.expires_at());
    }

    #[test]
    fn test_zero_ttl_is_immediately_expired() {
        let cache = MemoryCache::new();
        cache.set("a", rows(1), Duration::ZERO);
        assert!(cache.get("a").is_none());
        assert_eq!(cache.read().len(), 0, "expired entry should be evicted on read");
    }

    #[test]
    fn test_invalidate_returns_presence() {
        let cache = MemoryCache::new();
        cache.set("a", rows(1), Duration::from_secs(60));
        assert!(cache.invalidate("a"));
        assert!(!cache.invalidate("a"));
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let cache = MemoryCache::new();
        cache.set("gone", rows(1), Duration::ZERO);
        cache.set("kept", rows(1), Duration::from_secs(60));

        assert_eq!(cache.sweep(), 1);
        assert!(cache.get("kept").is_some());
    }

    #[test]
    fn test_stop_without_runtime_is_noop() {
        let cache = MemoryCache::with_sweeper(Duration::from_millis(10));
        assert!(!cache.is_sweeping());
        cache.stop();
        cache.stop();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let cache = MemoryCache::with_sweeper(Duration::from_millis(10));
        assert!(cache.is_sweeping());
        cache.stop();
        cache.stop();
        assert!(!cache.is_sweeping());
    }
}
