//! WebAssembly sandbox host for untrusted data-source modules.

pub mod cache;
pub mod config;
pub mod host;
pub mod limits;

pub use cache::SandboxRuntime;
pub use config::SandboxConfig;
pub use host::{SandboxModule, SandboxSource, ACTION_OFFSET, DATA_OFFSET};
