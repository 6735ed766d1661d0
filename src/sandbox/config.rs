//! Per-module resource limits.

use std::time::Duration;

/// Limits applied to every sandbox module instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxConfig {
    /// Maximum time for a single `fetch` or `write` call.
    pub timeout: Duration,
    /// Maximum linear memory in bytes.
    pub max_memory: u64,
    /// Fuel budget per call. `None` leaves instruction count unbounded.
    pub max_fuel: Option<u64>,
    /// Epoch tick interval used to enforce `timeout`.
    pub epoch_tick_interval: Duration,
    /// Guest stderr kept in memory for logging.
    pub capture_stderr_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_memory: 64 * 1024 * 1024, // 64MB
            max_fuel: None,
            epoch_tick_interval: Duration::from_millis(10),
            capture_stderr_bytes: 64 * 1024,
        }
    }
}

impl SandboxConfig {
    /// Start from the defaults and override individual limits.
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder {
            config: Self::default(),
        }
    }

    /// Number of `tick`-long epochs that make up `timeout`, at least one.
    pub fn deadline_ticks(&self, tick: Duration) -> u64 {
        let tick = tick.as_nanos().max(1);
        let ticks = self.timeout.as_nanos().div_ceil(tick);
        u64::try_from(ticks).unwrap_or(u64::MAX).max(1)
    }
}

/// Builder for [`SandboxConfig`].
#[derive(Debug, Clone)]
#[must_use]
pub struct SandboxConfigBuilder {
    config: SandboxConfig,
}

impl SandboxConfigBuilder {
    /// Per-call wall-clock limit.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Linear memory ceiling in bytes.
    pub fn max_memory(mut self, bytes: u64) -> Self {
        self.config.max_memory = bytes;
        self
    }

    /// Instruction budget per call.
    pub fn max_fuel(mut self, fuel: u64) -> Self {
        self.config.max_fuel = Some(fuel);
        self
    }

    /// How often the epoch ticker advances; the timeout resolves to whole ticks.
    pub fn epoch_tick_interval(mut self, interval: Duration) -> Self {
        self.config.epoch_tick_interval = interval;
        self
    }

    /// Bytes of guest stderr kept in memory for debug logging.
    pub fn capture_stderr_bytes(mut self, bytes: usize) -> Self {
        self.config.capture_stderr_bytes = bytes;
        self
    }

    /// Finish the builder.
    pub fn build(self) -> SandboxConfig {
        self.config
    }
}
