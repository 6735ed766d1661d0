//! # livesource
//!
//! The data-source runtime behind live documents.
//!
//! A document declares named sources (SQLite tables, REST endpoints, local
//! commands, JSON/CSV/markdown files, or WebAssembly modules). This crate
//! turns each declaration into a [`Source`] with one contract
//! (`fetch`, `write_item`, `is_readonly`, `close`) and puts a
//! [`Resolver`] with a TTL / stale-while-revalidate cache in front of them.
//!
//! ## Example
//!
//! ```rust,ignore
//! use livesource_rs::prelude::*;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let users = SourceConfig::builder(SourceKind::Rest)
//!         .url("https://api.example.com/users")
//!         .cache(Duration::from_secs(300), CacheStrategy::StaleWhileRevalidate)
//!         .build();
//!
//!     let resolver = Resolver::from_configs([("users", users)], &RuntimeOptions::default())?;
//!     let outcome = resolver.fetch_outcome("users").await;
//!     println!("{} rows", outcome.rows.len());
//!
//!     resolver.close().await
//! }
//! ```
//!
//! ## Security Model
//!
//! 1. **Exec gate**: `exec` sources cannot be built unless
//!    [`SecurityPolicy::allow_exec`] is set. The flag lives on
//!    [`RuntimeOptions`] and is never read from a declaration.
//! 2. **SSRF validation**: REST URLs and every redirect hop are rejected when
//!    they name or resolve to loopback, private, link-local or unspecified
//!    addresses. Addresses are resolved once at validation time; a host that
//!    re-resolves to an internal address later is not caught.
//! 3. **Secrets stay out of command lines**: `${VAR}` expansion applies to a
//!    child's environment, never to the command string.
//! 4. **WebAssembly isolation**: sandbox modules get their declared
//!    environment and nothing else, with memory, fuel and epoch-based time
//!    limits. Calls into one module are serialized.

pub mod cache;
pub mod config;
pub mod error;
pub mod prelude;
pub mod resolver;
pub mod sandbox;
pub mod security;
pub mod source;

// Re-export main types at crate root for convenience
pub use cache::{CacheHit, MemoryCache};
pub use config::{CacheStrategy, OutputFormat, RuntimeOptions, SourceConfig, SourceKind};
pub use error::{ErrorKind, ErrorPayload, Result, SourceError};
pub use resolver::{CacheInfo, FetchOutcome, Resolver};
pub use sandbox::{SandboxConfig, SandboxModule, SandboxSource};
pub use security::SecurityPolicy;
pub use source::{build_source, Action, Row, Source};
