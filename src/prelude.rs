//! Prelude module for convenient imports.

pub use crate::cache::MemoryCache;
pub use crate::config::{CacheStrategy, OutputFormat, RuntimeOptions, SourceConfig, SourceKind};
pub use crate::error::{ErrorKind, Result, SourceError};
pub use crate::resolver::{FetchOutcome, Resolver};
pub use crate::sandbox::SandboxConfig;
pub use crate::security::SecurityPolicy;
pub use crate::source::{build_source, Action, Row, Source};
