//! The source contract and its implementations.
//!
//! A [`Source`] turns a declarative [`SourceConfig`] into rows. Every kind
//! implements the same four operations; the [`Resolver`](crate::resolver::Resolver)
//! layers caching on top.
//!
//! Sources are built once per document session with [`build_source`], which
//! applies the security gates at construction time.

pub mod exec;
pub mod file;
pub mod format;
pub mod markdown;
pub mod rest;
pub mod sql;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{RuntimeOptions, SourceConfig, SourceKind};
use crate::error::{Result, SourceError};
use crate::sandbox::SandboxSource;

pub use exec::ExecSource;
pub use file::{CsvFileSource, JsonFileSource};
pub use markdown::MarkdownSource;
pub use rest::RestSource;
pub use sql::SqlSource;

/// One record: column name to JSON value, in column order.
pub type Row = serde_json::Map<String, Value>;

/// A named write operation and its values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Operation name, e.g. `add`, `update`, `delete`, `toggle`.
    pub name: String,
    /// New values; `id` identifies the target row where relevant.
    #[serde(default)]
    pub row: Row,
}

impl Action {
    /// Create an action.
    pub fn new(name: impl Into<String>, row: Row) -> Self {
        Self {
            name: name.into(),
            row,
        }
    }
}

/// A named, configured provider of rows.
///
/// `fetch` is a fresh snapshot on every call and must not rely on state from
/// earlier calls. Implementations enforce their own per-call timeouts;
/// dropping the returned future cancels the call.
#[async_trait]
pub trait Source: Send + Sync {
    /// The declared source name.
    fn name(&self) -> &str;

    /// The backend kind.
    fn kind(&self) -> SourceKind;

    /// Fetch the current rows.
    async fn fetch(&self) -> Result<Vec<Row>>;

    /// Apply a write action.
    ///
    /// Readonly sources fail with [`SourceError::UnsupportedOperation`].
    async fn write_item(&self, action: &str, row: &Row) -> Result<()> {
        let _ = row;
        Err(SourceError::unsupported(self.name(), format!("write {action:?}")))
    }

    /// Whether writes are rejected.
    fn is_readonly(&self) -> bool {
        true
    }

    /// Release native resources. Idempotent.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Build a source from its declaration.
///
/// `exec` sources are refused unless `options.security.allow_exec` is set.
/// Remote URLs are validated against SSRF rules here, once.
pub fn build_source(name: &str, config: &SourceConfig, options: &RuntimeOptions) -> Result<Arc<dyn Source>> {
    let source: Arc<dyn Source> = match config.kind {
        SourceKind::Exec => Arc::new(ExecSource::new(name, config, options)?),
        SourceKind::Rest => Arc::new(RestSource::new(name, config, &options.security)?),
        SourceKind::Json => Arc::new(JsonFileSource::new(name, config, options)?),
        SourceKind::Csv => Arc::new(CsvFileSource::new(name, config, options)?),
        SourceKind::MarkdownFile => Arc::new(MarkdownSource::new(name, config, options)?),
        SourceKind::Sql => Arc::new(SqlSource::new(name, config, options)?),
        SourceKind::Sandbox => Arc::new(SandboxSource::new(name, config, options)?),
    };

    tracing::info!(
        source = %name,
        kind = %config.kind,
        readonly = source.is_readonly(),
        "source built"
    );
    Ok(source)
}

/// Return a required string field, or a configuration error naming it.
pub(crate) fn required<'a>(source_name: &str, field: &str, value: &'a Option<String>) -> Result<&'a str> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(SourceError::config(source_name, format!("{field} is required"))),
    }
}

/// Expand `${VAR}` and `$VAR` against the process environment, then `local`.
///
/// Unknown variables expand to the empty string.
pub(crate) fn expand_env(value: &str, local: &BTreeMap<String, String>) -> String {
    shellexpand::env_with_context_no_errors(value, |var: &str| {
        Some(
            std::env::var(var)
                .ok()
                .or_else(|| local.get(var).cloned())
                .unwrap_or_default(),
        )
    })
    .into_owned()
}
