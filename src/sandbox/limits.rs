//! Resource limiting and per-store state for sandbox modules.

use wasmtime::{ResourceLimiter, Store};
use wasmtime_wasi::preview1::WasiP1Ctx;

/// Table growth ceiling; data-source modules need very few indirect slots.
const MAX_TABLE_ELEMENTS: usize = 10_000;

/// Resource limiter that enforces memory and table size limits.
#[derive(Debug)]
pub struct SandboxLimiter {
    max_memory: u64,
    peak_memory: u64,
    limit_exceeded: bool,
}

impl SandboxLimiter {
    /// Create a limiter with the given memory ceiling in bytes.
    pub fn new(max_memory: u64) -> Self {
        Self {
            max_memory,
            peak_memory: 0,
            limit_exceeded: false,
        }
    }

    /// Whether the guest has tried to grow past a limit.
    pub fn limit_exceeded(&self) -> bool {
        self.limit_exceeded
    }

    /// Clear the exceeded flag before a new call.
    pub fn reset(&mut self) {
        self.limit_exceeded = false;
    }

    /// Largest memory size granted so far.
    pub fn peak_memory(&self) -> u64 {
        self.peak_memory
    }

    /// The configured ceiling.
    pub fn max_memory(&self) -> u64 {
        self.max_memory
    }
}

impl ResourceLimiter for SandboxLimiter {
    fn memory_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        let desired = desired as u64;
        if desired > self.max_memory {
            self.limit_exceeded = true;
            return Ok(false);
        }
        self.peak_memory = self.peak_memory.max(desired);
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        if desired > MAX_TABLE_ELEMENTS {
            self.limit_exceeded = true;
            return Ok(false);
        }
        Ok(true)
    }
}

/// State owned by each module's store.
pub struct HostState {
    /// Memory and table limiter.
    pub limiter: SandboxLimiter,
    /// WASI preview1 context: environment only, no preopens, no sockets.
    pub wasi: WasiP1Ctx,
}

impl HostState {
    /// Create store state with the given memory ceiling.
    pub fn new(max_memory: u64, wasi: WasiP1Ctx) -> Self {
        Self {
            limiter: SandboxLimiter::new(max_memory),
            wasi,
        }
    }
}

/// Extension trait to attach the limiter to a store.
pub trait StoreLimiterExt {
    /// Enforce the store's [`SandboxLimiter`].
    fn configure_limiter(&mut self);
}

impl StoreLimiterExt for Store<HostState> {
    fn configure_limiter(&mut self) {
        self.limiter(|state| &mut state.limiter);
    }
}
