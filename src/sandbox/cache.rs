//! Shared engine, compiled-module cache and epoch ticker.
//!
//! Every sandbox module runs on one [`SandboxRuntime`]: a wasmtime engine
//! with epoch interruption and fuel metering enabled, a background thread
//! that advances the epoch, and a cache of compiled modules keyed by
//! canonical path so two sources pointing at the same file compile it once.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::Duration;

use tracing::{debug, info};
use wasmtime::{Engine, Module};

use crate::error::{Result, SourceError};

/// A thread-safe cache for compiled WASM modules.
#[derive(Debug, Default)]
pub struct ModuleCache {
    cache: RwLock<HashMap<PathBuf, Arc<Module>>>,
}

impl ModuleCache {
    /// Create a new empty module cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a cached module or compile it if not present.
    ///
    /// A missing or invalid module is a configuration error of `source_name`.
    pub fn get_or_compile(&self, engine: &Engine, source_name: &str, path: &Path) -> Result<Arc<Module>> {
        let canonical = std::fs::canonicalize(path).map_err(|e| {
            SourceError::config(source_name, format!("sandbox module {}: {e}", path.display()))
        })?;

        if let Some(module) = self.cache.read().unwrap_or_else(PoisonError::into_inner).get(&canonical) {
            return Ok(Arc::clone(module));
        }

        // Compile outside the lock.
        let bytes = std::fs::read(&canonical)?;
        let module = Module::new(engine, &bytes).map_err(|e| {
            SourceError::config(source_name, format!("failed to compile {}: {e}", path.display()))
        })?;
        let module = Arc::new(module);
        debug!(path = %canonical.display(), "compiled sandbox module");

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        // Another thread may have compiled it meanwhile.
        let module = cache.entry(canonical).or_insert(module);
        Ok(Arc::clone(module))
    }

    /// Check if a module is cached.
    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        std::fs::canonicalize(path).is_ok_and(|canonical| {
            self.cache
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .contains_key(&canonical)
        })
    }

    /// Drop a compiled module, e.g. after the file was rebuilt.
    pub fn remove(&self, path: impl AsRef<Path>) -> bool {
        std::fs::canonicalize(path).is_ok_and(|canonical| {
            self.cache
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&canonical)
                .is_some()
        })
    }

    /// Clear all cached modules.
    pub fn clear(&self) {
        self.cache.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Get the number of cached modules.
    pub fn len(&self) -> usize {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A shared engine that can be reused across sandbox instances.
#[derive(Clone)]
pub struct SharedEngine {
    engine: Arc<Engine>,
}

impl std::fmt::Debug for SharedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedEngine")
            .field("engine", &"<wasmtime::Engine>")
            .finish()
    }
}

impl SharedEngine {
    /// Create an engine with epoch interruption and fuel metering.
    pub fn new() -> Result<Self> {
        let mut config = wasmtime::Config::new();
        config.epoch_interruption(true);
        config.consume_fuel(true);
        let engine = Engine::new(&config).map_err(SourceError::Sandbox)?;
        Ok(Self {
            engine: Arc::new(engine),
        })
    }

    /// Get a reference to the underlying engine.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}

impl std::ops::Deref for SharedEngine {
    type Target = Engine;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}

/// Engine, module cache and the thread that drives epoch deadlines.
#[derive(Debug)]
pub struct SandboxRuntime {
    engine: SharedEngine,
    modules: ModuleCache,
    tick: Duration,
    stop: Arc<AtomicBool>,
}

static SHARED_RUNTIME: OnceLock<Arc<SandboxRuntime>> = OnceLock::new();

impl SandboxRuntime {
    /// Create a runtime whose epoch advances every `tick`.
    pub fn new(tick: Duration) -> Result<Self> {
        let tick = tick.max(Duration::from_millis(1));
        let engine = SharedEngine::new()?;
        let stop = Arc::new(AtomicBool::new(false));

        let ticker_engine = engine.engine().clone();
        let ticker_stop = Arc::clone(&stop);
        std::thread::Builder::new()
            .name("sandbox-epoch".into())
            .spawn(move || {
                while !ticker_stop.load(Ordering::Relaxed) {
                    std::thread::sleep(tick);
                    ticker_engine.increment_epoch();
                }
            })?;
        info!(tick_ms = tick.as_millis() as u64, "sandbox runtime started");

        Ok(Self {
            engine,
            modules: ModuleCache::new(),
            tick,
            stop,
        })
    }

    /// The process-wide runtime. The first caller's `tick` wins.
    pub fn shared(tick: Duration) -> Result<Arc<Self>> {
        if let Some(runtime) = SHARED_RUNTIME.get() {
            return Ok(Arc::clone(runtime));
        }
        let runtime = Arc::new(Self::new(tick)?);
        // A losing racer's runtime is dropped, which stops its ticker.
        Ok(Arc::clone(SHARED_RUNTIME.get_or_init(|| runtime)))
    }

    /// The engine every module of this runtime is compiled for.
    pub fn engine(&self) -> &Engine {
        self.engine.engine()
    }

    /// Compiled modules.
    pub fn modules(&self) -> &ModuleCache {
        &self.modules
    }

    /// Epoch tick interval.
    pub fn tick(&self) -> Duration {
        self.tick
    }
}

impl Drop for SandboxRuntime {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_MODULE: &str = "(module)";

    #[test]
    fn test_module_cache_new() {
        let cache = ModuleCache::new();
        assert!(cache.is_empty());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_module_cache_reuses_compiled_module() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.wat");
        std::fs::write(&path, EMPTY_MODULE).unwrap();

        let engine = SharedEngine::new().unwrap();
        let cache = ModuleCache::new();
        let first = cache.get_or_compile(&engine, "m", &path).unwrap();
        let second = cache.get_or_compile(&engine, "m", &path).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(cache.contains(&path));

        assert!(cache.remove(&path));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_missing_module_is_config_error() {
        let engine = SharedEngine::new().unwrap();
        let err = ModuleCache::new()
            .get_or_compile(&engine, "m", Path::new("/definitely/not/here.wasm"))
            .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_invalid_module_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.wasm");
        std::fs::write(&path, b"\0asm garbage").unwrap();

        let engine = SharedEngine::new().unwrap();
        let err = ModuleCache::new().get_or_compile(&engine, "m", &path).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_shared_runtime_is_shared() {
        let a = SandboxRuntime::shared(Duration::from_millis(10)).unwrap();
        let b = SandboxRuntime::shared(Duration::from_millis(50)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.tick(), b.tick());
    }
}
