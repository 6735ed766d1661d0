//! Sandbox host: runs an untrusted WebAssembly module as a data source.
//!
//! # Module ABI
//!
//! Mandatory exports:
//!
//! - `memory`
//! - `fetch() -> i32`: pointer to a JSON document in linear memory
//! - `result_length() -> i32` (alias `get_result_len`): its length in bytes
//!
//! Optional exports:
//!
//! - `free_result()`: called after the host copied the result
//! - `write(action_ptr, action_len, data_ptr, data_len) -> i32`: status, 0 on success
//! - `error() -> i32` / `error_length() -> i32` (aliases `get_error`,
//!   `get_error_len`): message for a non-zero status
//! - `alloc(len) -> i32` / `dealloc(ptr, len)`: guest buffers for write payloads
//! - `_initialize()`: reactor setup, called once after instantiation
//!
//! Without `alloc`, the action name is copied to [`ACTION_OFFSET`] and the
//! JSON row to [`DATA_OFFSET`]. The module must leave those regions unused.
//!
//! The guest sees its declared environment variables and nothing else: no
//! preopened directories, no arguments, no sockets. Calls into one module are
//! serialized; its memory is shared mutable state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};
use wasmtime::{Instance, Linker, Memory, Module, Store, Trap, TypedFunc, WasmParams, WasmResults};
use wasmtime_wasi::pipe::MemoryOutputPipe;
use wasmtime_wasi::preview1;
use wasmtime_wasi::{I32Exit, WasiCtxBuilder};

use crate::config::{RuntimeOptions, SourceConfig, SourceKind};
use crate::error::{Result, SourceError};
use crate::sandbox::cache::SandboxRuntime;
use crate::sandbox::config::SandboxConfig;
use crate::sandbox::limits::{HostState, StoreLimiterExt};
use crate::source::format::parse_json_rows;
use crate::source::{required, Row, Source};

/// Where the action name is written when the module has no `alloc` export.
pub const ACTION_OFFSET: u32 = 1024;

/// Where the JSON row is written when the module has no `alloc` export.
pub const DATA_OFFSET: u32 = 2048;

const MAX_ACTION_LEN: usize = (DATA_OFFSET - ACTION_OFFSET) as usize;

struct Exports {
    fetch: TypedFunc<(), i32>,
    result_length: TypedFunc<(), i32>,
    free_result: Option<TypedFunc<(), ()>>,
    write: Option<TypedFunc<(i32, i32, i32, i32), i32>>,
    error: Option<TypedFunc<(), i32>>,
    error_length: Option<TypedFunc<(), i32>>,
    alloc: Option<TypedFunc<i32, i32>>,
    dealloc: Option<TypedFunc<(i32, i32), ()>>,
}

/// Find the first of `names` that is exported and check its signature.
fn lookup<P, R>(
    store: &mut Store<HostState>,
    instance: &Instance,
    source_name: &str,
    names: &[&str],
) -> Result<Option<TypedFunc<P, R>>>
where
    P: WasmParams,
    R: WasmResults,
{
    for name in names {
        if let Some(func) = instance.get_func(&mut *store, name) {
            let typed = func.typed::<P, R>(&*store).map_err(|e| {
                SourceError::config(source_name, format!("export {name:?} has the wrong signature: {e}"))
            })?;
            return Ok(Some(typed));
        }
    }
    Ok(None)
}

fn require<T>(export: Option<T>, source_name: &str, name: &str) -> Result<T> {
    export.ok_or_else(|| SourceError::config(source_name, format!("module does not export {name:?}")))
}

/// One instantiated module with its own store and linear memory.
///
/// Not reentrant; [`SandboxSource`] serializes access.
pub struct SandboxModule {
    name: String,
    store: Store<HostState>,
    memory: Memory,
    exports: Exports,
    config: SandboxConfig,
    deadline_ticks: u64,
    stderr: MemoryOutputPipe,
    stderr_seen: usize,
    path: Option<PathBuf>,
    _runtime: Arc<SandboxRuntime>,
}

impl std::fmt::Debug for SandboxModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxModule")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("supports_write", &self.supports_write())
            .finish_non_exhaustive()
    }
}

impl SandboxModule {
    /// Load a module file through the shared runtime's module cache.
    pub fn load(
        name: &str,
        path: &Path,
        config: &SandboxConfig,
        env: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let runtime = SandboxRuntime::shared(config.epoch_tick_interval)?;
        let module = runtime.modules().get_or_compile(runtime.engine(), name, path)?;
        let mut loaded = Self::instantiate(name, &module, config, env, runtime)?;
        loaded.path = Some(path.to_path_buf());
        Ok(loaded)
    }

    /// Compile and instantiate a module from binary or text format.
    pub fn from_bytes(
        name: &str,
        bytes: impl AsRef<[u8]>,
        config: &SandboxConfig,
        env: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let runtime = SandboxRuntime::shared(config.epoch_tick_interval)?;
        let module = Module::new(runtime.engine(), bytes.as_ref())
            .map_err(|e| SourceError::config(name, format!("failed to compile module: {e}")))?;
        Self::instantiate(name, &module, config, env, runtime)
    }

    fn instantiate(
        name: &str,
        module: &Module,
        config: &SandboxConfig,
        env: &BTreeMap<String, String>,
        runtime: Arc<SandboxRuntime>,
    ) -> Result<Self> {
        let stderr = MemoryOutputPipe::new(config.capture_stderr_bytes);
        let mut wasi = WasiCtxBuilder::new();
        wasi.stderr(stderr.clone());
        for (key, value) in env {
            wasi.env(key, value);
        }

        let mut store = Store::new(runtime.engine(), HostState::new(config.max_memory, wasi.build_p1()));
        store.configure_limiter();
        store.epoch_deadline_trap();

        let mut linker = Linker::new(runtime.engine());
        preview1::add_to_linker_sync(&mut linker, |state: &mut HostState| &mut state.wasi)
            .map_err(SourceError::Sandbox)?;

        let deadline_ticks = config.deadline_ticks(runtime.tick());
        Self::arm(&mut store, config, deadline_ticks).map_err(SourceError::Sandbox)?;

        let instance = linker.instantiate(&mut store, module).map_err(|e| {
            if store.data().limiter.limit_exceeded() {
                SourceError::config(name, "memory limit exceeded during instantiation")
            } else {
                SourceError::config(name, format!("failed to instantiate module: {e}"))
            }
        })?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| SourceError::config(name, "module does not export \"memory\""))?;

        let exports = Exports {
            fetch: require(lookup(&mut store, &instance, name, &["fetch"])?, name, "fetch")?,
            result_length: require(
                lookup(&mut store, &instance, name, &["result_length", "get_result_len"])?,
                name,
                "result_length",
            )?,
            free_result: lookup(&mut store, &instance, name, &["free_result"])?,
            write: lookup(&mut store, &instance, name, &["write"])?,
            error: lookup(&mut store, &instance, name, &["error", "get_error"])?,
            error_length: lookup(&mut store, &instance, name, &["error_length", "get_error_len"])?,
            alloc: lookup(&mut store, &instance, name, &["alloc"])?,
            dealloc: lookup(&mut store, &instance, name, &["dealloc"])?,
        };

        let mut loaded = Self {
            name: name.to_string(),
            store,
            memory,
            exports,
            config: config.clone(),
            deadline_ticks,
            stderr,
            stderr_seen: 0,
            path: None,
            _runtime: runtime,
        };

        if let Some(init) = lookup::<(), ()>(&mut loaded.store, &instance, name, &["_initialize"])? {
            init.call(&mut loaded.store, ())
                .map_err(|e| loaded.call_error("_initialize", e))?;
        }
        loaded.drain_stderr();

        info!(
            source = %name,
            writable = loaded.supports_write(),
            allocator = loaded.exports.alloc.is_some(),
            "sandbox module loaded"
        );
        Ok(loaded)
    }

    /// Reset fuel, the epoch deadline and the limiter flag for a new call.
    fn arm(store: &mut Store<HostState>, config: &SandboxConfig, deadline_ticks: u64) -> anyhow::Result<()> {
        store.set_fuel(config.max_fuel.unwrap_or(u64::MAX))?;
        store.set_epoch_deadline(deadline_ticks);
        store.data_mut().limiter.reset();
        Ok(())
    }

    fn prepare_call(&mut self) -> Result<()> {
        Self::arm(&mut self.store, &self.config, self.deadline_ticks).map_err(SourceError::Sandbox)
    }

    /// Whether the module exports `write`.
    pub fn supports_write(&self) -> bool {
        self.exports.write.is_some()
    }

    /// The per-call timeout.
    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Call `fetch` and copy the result out of guest memory.
    pub fn fetch(&mut self) -> Result<Vec<u8>> {
        self.prepare_call()?;
        let started = Instant::now();

        let ptr = self
            .exports
            .fetch
            .call(&mut self.store, ())
            .map_err(|e| self.call_error("fetch", e))?;
        let len = self
            .exports
            .result_length
            .call(&mut self.store, ())
            .map_err(|e| self.call_error("result_length", e))?;
        let bytes = self.read_memory(ptr, len)?;

        if let Some(free) = &self.exports.free_result {
            if let Err(e) = free.call(&mut self.store, ()) {
                warn!(source = %self.name, error = %e, "free_result failed");
            }
        }
        self.drain_stderr();

        debug!(
            source = %self.name,
            bytes = bytes.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sandbox fetch"
        );
        Ok(bytes)
    }

    /// Call `write` with an action name and a JSON payload.
    pub fn write(&mut self, action: &str, payload: &[u8]) -> Result<()> {
        let Some(write) = self.exports.write.clone() else {
            return Err(SourceError::unsupported(&self.name, "write (module does not export \"write\")"));
        };
        self.prepare_call()?;

        let action_len = self.guest_len(action.len())?;
        let data_len = self.guest_len(payload.len())?;

        let (action_ptr, data_ptr, allocated) = match self.exports.alloc.clone() {
            Some(alloc) => {
                let action_ptr = self.guest_alloc(&alloc, action_len)?;
                let data_ptr = self.guest_alloc(&alloc, data_len)?;
                (action_ptr, data_ptr, true)
            }
            None => {
                if action.len() > MAX_ACTION_LEN {
                    return Err(SourceError::parse(
                        &self.name,
                        format!("action name longer than {MAX_ACTION_LEN} bytes"),
                    ));
                }
                (ACTION_OFFSET as i32, DATA_OFFSET as i32, false)
            }
        };

        self.write_memory(action_ptr, action.as_bytes())?;
        self.write_memory(data_ptr, payload)?;

        let status = write
            .call(&mut self.store, (action_ptr, action_len, data_ptr, data_len))
            .map_err(|e| self.call_error("write", e));

        if allocated {
            if let Some(dealloc) = self.exports.dealloc.clone() {
                for (ptr, len) in [(action_ptr, action_len), (data_ptr, data_len)] {
                    if let Err(e) = dealloc.call(&mut self.store, (ptr, len)) {
                        warn!(source = %self.name, error = %e, "dealloc failed");
                    }
                }
            }
        }
        self.drain_stderr();

        match status? {
            0 => {
                debug!(source = %self.name, action, "sandbox write");
                Ok(())
            }
            status => {
                let message = self.error_message(status);
                Err(SourceError::transient(&self.name, format!("module write failed: {message}")))
            }
        }
    }

    fn guest_len(&self, len: usize) -> Result<i32> {
        i32::try_from(len).map_err(|_| SourceError::parse(&self.name, "payload too large for a 32-bit module"))
    }

    fn guest_alloc(&mut self, alloc: &TypedFunc<i32, i32>, len: i32) -> Result<i32> {
        let ptr = alloc
            .call(&mut self.store, len)
            .map_err(|e| self.call_error("alloc", e))?;
        if ptr == 0 && len > 0 {
            return Err(SourceError::transient(&self.name, "module allocation failed"));
        }
        Ok(ptr)
    }

    /// Message from the `error` exports, or the bare status.
    fn error_message(&mut self, status: i32) -> String {
        let (Some(error), Some(error_length)) = (self.exports.error.clone(), self.exports.error_length.clone())
        else {
            return format!("status {status}");
        };
        let message = error
            .call(&mut self.store, ())
            .and_then(|ptr| Ok((ptr, error_length.call(&mut self.store, ())?)))
            .ok()
            .and_then(|(ptr, len)| self.read_memory(ptr, len).ok())
            .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_string())
            .filter(|message| !message.is_empty());
        message.unwrap_or_else(|| format!("status {status}"))
    }

    fn read_memory(&self, ptr: i32, len: i32) -> Result<Vec<u8>> {
        let len = usize::try_from(len)
            .map_err(|_| SourceError::transient(&self.name, format!("module returned negative length {len}")))?;
        let start = ptr as u32 as usize;
        let data = self.memory.data(&self.store);
        start
            .checked_add(len)
            .and_then(|end| data.get(start..end))
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                SourceError::transient(
                    &self.name,
                    format!("result [{start}, +{len}) is outside module memory ({} bytes)", data.len()),
                )
            })
    }

    fn write_memory(&mut self, ptr: i32, bytes: &[u8]) -> Result<()> {
        let offset = ptr as u32 as usize;
        self.memory.write(&mut self.store, offset, bytes).map_err(|_| {
            SourceError::transient(
                &self.name,
                format!("{} bytes at offset {offset} do not fit in module memory", bytes.len()),
            )
        })
    }

    fn call_error(&self, export: &str, err: anyhow::Error) -> SourceError {
        if let Some(trap) = err.downcast_ref::<Trap>() {
            match trap {
                Trap::Interrupt => {
                    warn!(source = %self.name, export, "sandbox call timed out");
                    return SourceError::Timeout {
                        source_name: self.name.clone(),
                        timeout: self.config.timeout,
                    };
                }
                Trap::OutOfFuel => {
                    return SourceError::transient(&self.name, format!("{export}: fuel exhausted"));
                }
                _ => {}
            }
        }
        if let Some(exit) = err.downcast_ref::<I32Exit>() {
            return SourceError::transient(&self.name, format!("{export}: module exited with status {}", exit.0));
        }
        if self.store.data().limiter.limit_exceeded() {
            return SourceError::transient(&self.name, format!("{export}: memory limit exceeded"));
        }
        SourceError::transient(&self.name, format!("{export} trapped: {err:#}"))
    }

    /// Log guest stderr written since the last call.
    fn drain_stderr(&mut self) {
        let contents = self.stderr.contents();
        if contents.len() > self.stderr_seen {
            let text = String::from_utf8_lossy(&contents[self.stderr_seen..]);
            debug!(source = %self.name, stderr = %text.trim_end(), "sandbox stderr");
            self.stderr_seen = contents.len();
        }
    }
}

/// A [`Source`] backed by a sandbox module.
#[derive(Debug, Clone)]
pub struct SandboxSource {
    name: String,
    module: Arc<Mutex<Option<SandboxModule>>>,
    readonly: bool,
}

impl SandboxSource {
    /// Load the module at `path`. A declared `timeout` overrides the sandbox default.
    pub fn new(name: &str, config: &SourceConfig, options: &RuntimeOptions) -> Result<Self> {
        let path = options.resolve_path(required(name, "path", &config.path)?);
        let mut limits = options.sandbox.clone();
        limits.timeout = config.timeout_or(limits.timeout);

        let module = SandboxModule::load(name, &path, &limits, &config.env)?;
        Ok(Self::from_module(module, config.readonly))
    }

    /// Wrap an already-instantiated module.
    ///
    /// A module without a `write` export is always readonly.
    pub fn from_module(module: SandboxModule, readonly: Option<bool>) -> Self {
        let readonly = readonly.unwrap_or(false) || !module.supports_write();
        Self {
            name: module.name.clone(),
            module: Arc::new(Mutex::new(Some(module))),
            readonly,
        }
    }

    /// Run `f` against the module on the blocking pool, one call at a time.
    async fn with_module<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut SandboxModule) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let module = Arc::clone(&self.module);
        let name = self.name.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = module.lock().unwrap_or_else(PoisonError::into_inner);
            let module = guard
                .as_mut()
                .ok_or_else(|| SourceError::transient(&name, "source is closed"))?;
            f(module)
        })
        .await
        .map_err(|e| SourceError::transient(&self.name, format!("sandbox task failed: {e}")))?
    }
}

#[async_trait]
impl Source for SandboxSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Sandbox
    }

    async fn fetch(&self) -> Result<Vec<Row>> {
        let bytes = self.with_module(SandboxModule::fetch).await?;
        parse_json_rows(&self.name, &String::from_utf8_lossy(&bytes))
    }

    async fn write_item(&self, action: &str, row: &Row) -> Result<()> {
        if self.readonly {
            return Err(SourceError::unsupported(&self.name, format!("write {action:?} to a readonly source")));
        }
        let payload = serde_json::to_vec(row)
            .map_err(|e| SourceError::parse(&self.name, format!("failed to encode row: {e}")))?;
        let action = action.to_string();
        self.with_module(move |module| module.write(&action, &payload)).await
    }

    fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Waits on the blocking pool for any in-flight guest call to finish.
    async fn close(&self) -> Result<()> {
        let module = Arc::clone(&self.module);
        let released = tokio::task::spawn_blocking(move || {
            module.lock().unwrap_or_else(PoisonError::into_inner).take().is_some()
        })
        .await
        .map_err(|e| SourceError::transient(&self.name, format!("sandbox task failed: {e}")))?;
        if released {
            debug!(source = %self.name, "sandbox module released");
        }
        Ok(())
    }
}
