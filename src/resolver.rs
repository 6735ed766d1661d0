//! Name-based access to a document's sources, with caching.
//!
//! The [`Resolver`] owns every source of a document session and the shared
//! [`MemoryCache`]. A fetch consults the cache first; on a miss the source is
//! called and the result stored under the source name. Sources declared with
//! the `stale-while-revalidate` strategy serve stale rows immediately and
//! refresh in the background, one refresh per source at a time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::{MemoryCache, DEFAULT_SWEEP_INTERVAL};
use crate::config::{CachePolicy, CacheStrategy, RuntimeOptions, SourceConfig};
use crate::error::{ErrorPayload, Result, SourceError};
use crate::source::{build_source, Action, Row, Source};

/// Rows plus the error that replaced them, for the rendering layer.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// The rows; empty when `error` is set.
    pub rows: Arc<Vec<Row>>,
    /// What went wrong, if anything.
    pub error: Option<ErrorPayload>,
}

impl FetchOutcome {
    /// Check if the fetch succeeded.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Cache state of one source, for display next to its data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheInfo {
    /// Rows are currently cached.
    pub cached: bool,
    /// Cached rows are past their fresh window.
    pub stale: bool,
    /// A background refresh is in flight.
    pub refreshing: bool,
    /// Time since the rows were stored.
    pub age: Option<Duration>,
    /// Time until the entry expires.
    pub expires_in: Option<Duration>,
}

struct Registered {
    name: String,
    source: Arc<dyn Source>,
    policy: Option<CachePolicy>,
    manual: bool,
    refreshing: AtomicBool,
    /// Bumped on every write and invalidation; a load that straddles a bump
    /// must not store what it fetched.
    generation: AtomicU64,
    /// Result of the last explicit run, served to manual sources without a cache.
    last_run: Mutex<Option<Arc<Vec<Row>>>>,
}

impl Registered {
    /// Call the source and store the (limited) rows.
    async fn load(&self, cache: &MemoryCache) -> Result<Arc<Vec<Row>>> {
        let started = Instant::now();
        let generation = self.generation.load(Ordering::Acquire);
        let rows = self.source.fetch().await?;
        let fetched = rows.len();

        let rows = match &self.policy {
            Some(policy) => Arc::new(apply_limits(rows, policy)),
            None => Arc::new(rows),
        };
        if rows.len() < fetched {
            debug!(source = %self.name, fetched, kept = rows.len(), "rows truncated to cache limits");
        }

        if self.generation.load(Ordering::Acquire) != generation {
            debug!(source = %self.name, "discarding rows fetched before invalidation");
            return Ok(rows);
        }

        if let Some(policy) = &self.policy {
            match policy.strategy {
                CacheStrategy::Simple => cache.set(self.name.clone(), Arc::clone(&rows), policy.ttl),
                CacheStrategy::StaleWhileRevalidate => cache.set_with_stale(
                    self.name.clone(),
                    Arc::clone(&rows),
                    policy.stale_after(),
                    policy.ttl,
                ),
            }
            // A write may have landed between the check and the store.
            if self.generation.load(Ordering::Acquire) != generation {
                cache.invalidate(&self.name);
            }
        }
        if self.manual {
            *self.last_run.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&rows));
        }

        debug!(
            source = %self.name,
            rows = rows.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "source fetched"
        );
        Ok(rows)
    }

    fn last_run(&self) -> Arc<Vec<Row>> {
        self.last_run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_default()
    }
}

/// Clears the refresh flag when a background refresh ends, however it ends.
struct RefreshGuard(Arc<Registered>);

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        self.0.refreshing.store(false, Ordering::Release);
    }
}

/// Resolves once the resolver is closed or dropped.
async fn closed(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}

/// Apply `max_rows`, then drop rows from the end until the JSON array fits `max_bytes`.
pub fn apply_limits(mut rows: Vec<Row>, policy: &CachePolicy) -> Vec<Row> {
    if let Some(max_rows) = policy.max_rows {
        rows.truncate(max_rows);
    }
    let Some(max_bytes) = policy.max_bytes else {
        return rows;
    };

    let sizes: Vec<usize> = rows
        .iter()
        .map(|row| serde_json::to_vec(row).map_or(0, |bytes| bytes.len()))
        .collect();
    // `[` + rows joined by `,` + `]`
    let mut total = 2 + sizes.iter().sum::<usize>() + sizes.len().saturating_sub(1);
    while total > max_bytes && !rows.is_empty() {
        rows.pop();
        total -= sizes[rows.len()] + usize::from(!rows.is_empty());
    }
    rows
}

/// Owns a session's sources and their cache.
pub struct Resolver {
    sources: HashMap<String, Arc<Registered>>,
    cache: Arc<MemoryCache>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.sources.keys().collect();
        names.sort();
        f.debug_struct("Resolver")
            .field("sources", &names)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolver {
    /// Create an empty resolver with a periodically swept cache.
    pub fn new() -> Self {
        Self::with_cache(MemoryCache::with_sweeper(DEFAULT_SWEEP_INTERVAL))
    }

    /// Create an empty resolver around an existing cache.
    pub fn with_cache(cache: MemoryCache) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            sources: HashMap::new(),
            cache: Arc::new(cache),
            shutdown,
            closed: AtomicBool::new(false),
        }
    }

    /// Build every declared source. Any configuration or security error aborts the load.
    pub fn from_configs<I, K>(configs: I, options: &RuntimeOptions) -> Result<Self>
    where
        I: IntoIterator<Item = (K, SourceConfig)>,
        K: Into<String>,
    {
        let mut resolver = Self::new();
        for (name, config) in configs {
            let name = name.into();
            let source = build_source(&name, &config, options)?;
            resolver.register(name, source, &config);
        }
        info!(sources = resolver.sources.len(), "resolver ready");
        Ok(resolver)
    }

    /// Add an already-built source. Replaces any source of the same name.
    pub fn register(&mut self, name: impl Into<String>, source: Arc<dyn Source>, config: &SourceConfig) {
        let name = name.into();
        let registered = Registered {
            name: name.clone(),
            source,
            policy: config.cache_policy(),
            manual: config.manual,
            refreshing: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            last_run: Mutex::new(None),
        };
        self.cache.invalidate(&name);
        self.sources.insert(name, Arc::new(registered));
    }

    /// Names of all registered sources, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.sources.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// The source registered under `name`.
    pub fn source(&self, name: &str) -> Option<Arc<dyn Source>> {
        self.sources.get(name).map(|r| Arc::clone(&r.source))
    }

    /// The shared cache.
    pub fn cache(&self) -> &MemoryCache {
        &self.cache
    }

    fn lookup(&self, name: &str) -> Result<&Arc<Registered>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SourceError::transient(name, "resolver is closed"));
        }
        self.sources
            .get(name)
            .ok_or_else(|| SourceError::UnknownSource(name.to_string()))
    }

    /// Rows for `name`, from the cache when possible.
    ///
    /// Manual sources are never executed here: they return their last result
    /// (or nothing) until [`run`](Self::run) is called.
    pub async fn fetch(&self, name: &str) -> Result<Arc<Vec<Row>>> {
        let registered = self.lookup(name)?;

        if registered.policy.is_some() {
            if let Some(hit) = self.cache.get(name) {
                debug!(source = %name, stale = hit.stale, age_ms = hit.age.as_millis() as u64, "cache hit");
                if hit.stale && !registered.manual {
                    self.spawn_refresh(registered);
                }
                return Ok(hit.rows);
            }
        }

        if registered.manual {
            return Ok(registered.last_run());
        }
        registered.load(&self.cache).await
    }

    /// Like [`fetch`](Self::fetch), but a failure becomes an empty row set with
    /// an error payload.
    pub async fn fetch_outcome(&self, name: &str) -> FetchOutcome {
        match self.fetch(name).await {
            Ok(rows) => FetchOutcome { rows, error: None },
            Err(e) => {
                warn!(source = %name, error = %e, "fetch failed");
                FetchOutcome {
                    rows: Arc::new(Vec::new()),
                    error: Some(e.to_payload()),
                }
            }
        }
    }

    /// Execute the source now, bypassing the cache, and store the result.
    pub async fn run(&self, name: &str) -> Result<Arc<Vec<Row>>> {
        let registered = self.lookup(name)?;
        registered.load(&self.cache).await
    }

    /// Apply a write action, then drop the cached rows.
    pub async fn write(&self, name: &str, action: &Action) -> Result<()> {
        let registered = self.lookup(name)?;
        if registered.source.is_readonly() {
            return Err(SourceError::unsupported(
                name,
                format!("write {:?} to a readonly source", action.name),
            ));
        }
        registered.source.write_item(&action.name, &action.row).await?;
        registered.generation.fetch_add(1, Ordering::AcqRel);
        self.cache.invalidate(name);
        debug!(source = %name, action = %action.name, "write applied");
        Ok(())
    }

    /// Drop the cached rows of one source.
    pub fn invalidate(&self, name: &str) -> bool {
        if let Some(registered) = self.sources.get(name) {
            registered.generation.fetch_add(1, Ordering::AcqRel);
        }
        self.cache.invalidate(name)
    }

    /// Cache state of `name`.
    pub fn cache_info(&self, name: &str) -> Result<CacheInfo> {
        let registered = self.lookup(name)?;
        let refreshing = registered.refreshing.load(Ordering::Acquire);
        let (Some(policy), Some(hit)) = (&registered.policy, self.cache.get(name)) else {
            return Ok(CacheInfo {
                refreshing,
                ..CacheInfo::default()
            });
        };
        Ok(CacheInfo {
            cached: true,
            stale: hit.stale,
            refreshing,
            age: Some(hit.age),
            expires_in: Some(policy.ttl.saturating_sub(hit.age)),
        })
    }

    /// Start a background refresh unless one is already running for this source.
    fn spawn_refresh(&self, registered: &Arc<Registered>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if registered.refreshing.swap(true, Ordering::AcqRel) {
            return;
        }

        let guard = RefreshGuard(Arc::clone(registered));
        let cache = Arc::clone(&self.cache);
        let shutdown = self.shutdown.subscribe();
        debug!(source = %registered.name, "background refresh started");

        handle.spawn(async move {
            let registered = Arc::clone(&guard.0);
            tokio::select! {
                result = registered.load(&cache) => {
                    if let Err(e) = result {
                        // The stale entry stays in place until it expires.
                        warn!(source = %registered.name, error = %e, "background refresh failed");
                    }
                }
                _ = closed(shutdown) => {
                    debug!(source = %registered.name, "background refresh cancelled");
                }
            }
            drop(guard);
        });
    }

    /// Cancel background refreshes, close every source and stop the cache sweep.
    ///
    /// Safe to call more than once; later calls do nothing.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.send_replace(true);

        let mut first_error = None;
        for registered in self.sources.values() {
            if let Err(e) = registered.source.close().await {
                warn!(source = %registered.name, error = %e, "failed to close source");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        self.cache.stop();
        self.cache.invalidate_all();
        info!(sources = self.sources.len(), "resolver closed");

        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}
