//! Source declarations and runtime options.
//!
//! A [`SourceConfig`] is the immutable descriptor a document declares for each
//! named source. It is deserialized by the document loader (or assembled with
//! [`SourceConfig::builder`]) and never mutated afterwards.
//!
//! [`RuntimeOptions`] carries process-level decisions (whether local commands
//! may run, where relative paths resolve, sandbox limits). It is deliberately
//! not deserializable: nothing in a document can switch security flags on.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::sandbox::config::SandboxConfig;
use crate::security::SecurityPolicy;

/// Default timeout for exec sources.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for every other source kind.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// The backend a source talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// SQLite table or query.
    Sql,
    /// HTTP(S) endpoint returning JSON.
    Rest,
    /// Local command whose stdout is parsed.
    Exec,
    /// JSON file on disk.
    Json,
    /// CSV file on disk.
    Csv,
    /// A section of a markdown file.
    #[serde(alias = "markdown")]
    MarkdownFile,
    /// WebAssembly module run in the sandbox host.
    #[serde(alias = "wasm")]
    Sandbox,
}

impl SourceKind {
    /// The declaration keyword for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Sql => "sql",
            SourceKind::Rest => "rest",
            SourceKind::Exec => "exec",
            SourceKind::Json => "json",
            SourceKind::Csv => "csv",
            SourceKind::MarkdownFile => "markdown-file",
            SourceKind::Sandbox => "sandbox",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How exec output is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// A JSON array, a single object, or newline-delimited objects.
    #[default]
    Json,
    /// One row per non-empty line: `{line, index}`.
    Lines,
    /// Header line followed by delimited records.
    Csv,
}

/// Cache strategy for a source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheStrategy {
    /// Serve until the TTL elapses, then refetch inline.
    #[default]
    Simple,
    /// Serve stale rows during the second half of the TTL while refreshing in the background.
    StaleWhileRevalidate,
}

/// Cache block of a source declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CacheConfig {
    /// TTL as a duration string (`"30s"`, `"5m"`). Absent disables caching.
    #[serde(default)]
    pub ttl: Option<String>,
    /// Refresh strategy.
    #[serde(default)]
    pub strategy: CacheStrategy,
    /// Keep at most this many rows.
    #[serde(default)]
    pub max_rows: Option<usize>,
    /// Drop rows from the end until the serialized size fits.
    #[serde(default)]
    pub max_bytes: Option<usize>,
}

/// Resolved cache policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    /// Time until the entry is fully expired.
    pub ttl: Duration,
    /// Refresh strategy.
    pub strategy: CacheStrategy,
    /// Row limit.
    pub max_rows: Option<usize>,
    /// Serialized size limit.
    pub max_bytes: Option<usize>,
}

impl CachePolicy {
    /// Time after which a stored entry is reported stale.
    ///
    /// Stale-while-revalidate entries are fresh for the first half of the TTL.
    pub fn stale_after(&self) -> Duration {
        match self.strategy {
            CacheStrategy::Simple => self.ttl,
            CacheStrategy::StaleWhileRevalidate => self.ttl / 2,
        }
    }
}

/// Immutable descriptor of a declared source.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SourceConfig {
    /// Backend kind.
    #[serde(rename = "type", alias = "kind")]
    pub kind: SourceKind,
    /// SQLite database path for `sql`.
    #[serde(default, alias = "db")]
    pub connection: Option<String>,
    /// Command line for `exec`.
    #[serde(default, alias = "cmd")]
    pub command: Option<String>,
    /// File path for `json`, `csv`, `markdown-file` and `sandbox`.
    #[serde(default, alias = "file")]
    pub path: Option<String>,
    /// Endpoint for `rest`.
    #[serde(default, alias = "from")]
    pub url: Option<String>,
    /// Output format for `exec`.
    #[serde(default)]
    pub format: Option<OutputFormat>,
    /// CSV delimiter (single character).
    #[serde(default)]
    pub delimiter: Option<String>,
    /// Environment variables passed to the child process or sandbox module.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Per-call timeout as a duration string.
    #[serde(default)]
    pub timeout: Option<String>,
    /// Whether writes are rejected.
    #[serde(default)]
    pub readonly: Option<bool>,
    /// Fetch only on explicit request.
    #[serde(default)]
    pub manual: bool,
    /// Cache settings; absent disables caching.
    #[serde(default)]
    pub cache: Option<CacheConfig>,
    /// HTTP method for `rest`.
    #[serde(default)]
    pub method: Option<String>,
    /// HTTP headers for `rest`; values are `${VAR}`-expanded.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Query parameters for `rest`; values are `${VAR}`-expanded.
    #[serde(default)]
    pub query_params: BTreeMap<String, String>,
    /// Dot-path to the array of rows in a `rest` response.
    #[serde(default)]
    pub result_path: Option<String>,
    /// Table name for `sql`.
    #[serde(default)]
    pub table: Option<String>,
    /// Custom read query for `sql`.
    #[serde(default)]
    pub query: Option<String>,
    /// Section anchor for `markdown-file`.
    #[serde(default)]
    pub anchor: Option<String>,
    /// Whether a `csv` file starts with a header row.
    #[serde(default)]
    pub has_header: Option<bool>,
}

impl SourceConfig {
    /// Create a new builder for a source of the given kind.
    pub fn builder(kind: SourceKind) -> SourceConfigBuilder {
        SourceConfigBuilder::new(kind)
    }

    /// The declared timeout, or `default` when absent or unparseable.
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout
            .as_deref()
            .and_then(parse_duration)
            .unwrap_or(default)
    }

    /// Whether writes are rejected, falling back to `default`.
    pub fn readonly_or(&self, default: bool) -> bool {
        self.readonly.unwrap_or(default)
    }

    /// The CSV delimiter as a byte, defaulting to a comma.
    pub fn delimiter_byte(&self) -> u8 {
        self.delimiter
            .as_deref()
            .and_then(|d| d.bytes().next())
            .unwrap_or(b',')
    }

    /// The resolved cache policy, or `None` if caching is disabled.
    pub fn cache_policy(&self) -> Option<CachePolicy> {
        let cache = self.cache.as_ref()?;
        let ttl = parse_duration(cache.ttl.as_deref()?)?;
        if ttl.is_zero() {
            return None;
        }
        Some(CachePolicy {
            ttl,
            strategy: cache.strategy,
            max_rows: cache.max_rows.filter(|n| *n > 0),
            max_bytes: cache.max_bytes.filter(|n| *n > 0),
        })
    }
}

/// Parse a duration string such as `"30s"`, `"5m"` or `"250ms"`.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    humantime::parse_duration(raw).ok()
}

/// Builder for creating SourceConfig instances.
#[derive(Debug, Clone)]
pub struct SourceConfigBuilder {
    config: SourceConfig,
}

impl SourceConfigBuilder {
    fn new(kind: SourceKind) -> Self {
        Self {
            config: SourceConfig {
                kind,
                connection: None,
                command: None,
                path: None,
                url: None,
                format: None,
                delimiter: None,
                env: BTreeMap::new(),
                timeout: None,
                readonly: None,
                manual: false,
                cache: None,
                method: None,
                headers: BTreeMap::new(),
                query_params: BTreeMap::new(),
                result_path: None,
                table: None,
                query: None,
                anchor: None,
                has_header: None,
            },
        }
    }

    /// Set the database path.
    pub fn connection(mut self, connection: impl Into<String>) -> Self {
        self.config.connection = Some(connection.into());
        self
    }

    /// Set the command line.
    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.config.command = Some(command.into());
        self
    }

    /// Set the file or module path.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.config.path = Some(path.into());
        self
    }

    /// Set the endpoint URL.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.url = Some(url.into());
        self
    }

    /// Set the exec output format.
    pub fn format(mut self, format: OutputFormat) -> Self {
        self.config.format = Some(format);
        self
    }

    /// Set the CSV delimiter.
    pub fn delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.config.delimiter = Some(delimiter.into());
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env.insert(key.into(), value.into());
        self
    }

    /// Set the per-call timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(humantime::format_duration(timeout).to_string());
        self
    }

    /// Set the readonly flag.
    pub fn readonly(mut self, readonly: bool) -> Self {
        self.config.readonly = Some(readonly);
        self
    }

    /// Require explicit runs.
    pub fn manual(mut self, manual: bool) -> Self {
        self.config.manual = manual;
        self
    }

    /// Enable caching.
    pub fn cache(mut self, ttl: Duration, strategy: CacheStrategy) -> Self {
        self.config.cache = Some(CacheConfig {
            ttl: Some(humantime::format_duration(ttl).to_string()),
            strategy,
            max_rows: None,
            max_bytes: None,
        });
        self
    }

    /// Set the HTTP method.
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.config.method = Some(method.into());
        self
    }

    /// Add an HTTP header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.headers.insert(key.into(), value.into());
        self
    }

    /// Add a query parameter.
    pub fn query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.query_params.insert(key.into(), value.into());
        self
    }

    /// Set the result path.
    pub fn result_path(mut self, path: impl Into<String>) -> Self {
        self.config.result_path = Some(path.into());
        self
    }

    /// Set the table name.
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.config.table = Some(table.into());
        self
    }

    /// Set a custom read query.
    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.config.query = Some(query.into());
        self
    }

    /// Set the markdown anchor.
    pub fn anchor(mut self, anchor: impl Into<String>) -> Self {
        self.config.anchor = Some(anchor.into());
        self
    }

    /// Declare whether a CSV file has a header row.
    pub fn has_header(mut self, has_header: bool) -> Self {
        self.config.has_header = Some(has_header);
        self
    }

    /// Build the SourceConfig.
    pub fn build(self) -> SourceConfig {
        self.config
    }
}

/// Process-level options threaded through source construction.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Security switches.
    pub security: SecurityPolicy,
    /// Directory relative paths resolve against.
    pub base_dir: PathBuf,
    /// Limits applied to sandbox modules.
    pub sandbox: SandboxConfig,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            security: SecurityPolicy::default(),
            base_dir: PathBuf::from("."),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl RuntimeOptions {
    /// Allow or forbid `exec` sources.
    pub fn allow_exec(mut self, allow: bool) -> Self {
        self.security.allow_exec = allow;
        self
    }

    /// Set the base directory.
    pub fn base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = dir.into();
        self
    }

    /// Set the sandbox limits.
    pub fn sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Disable SSRF validation. For automated tests against local servers only.
    pub fn dangerously_bypass_ssrf_for_tests(mut self) -> Self {
        self.security.bypass_ssrf = true;
        self
    }

    /// Resolve a declared path against the base directory.
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_declaration() {
        let config: SourceConfig = serde_json::from_value(serde_json::json!({
            "type": "exec",
            "cmd": "./tasks.sh --json",
            "format": "lines",
            "env": {"TOKEN": "${API_TOKEN}"},
            "timeout": "5s",
            "manual": true,
            "cache": {"ttl": "5m", "strategy": "stale-while-revalidate"}
        }))
        .unwrap();

        assert_eq!(config.kind, SourceKind::Exec);
        assert_eq!(config.command.as_deref(), Some("./tasks.sh --json"));
        assert_eq!(config.format, Some(OutputFormat::Lines));
        assert_eq!(config.timeout_or(DEFAULT_EXEC_TIMEOUT), Duration::from_secs(5));
        assert!(config.manual);

        let policy = config.cache_policy().unwrap();
        assert_eq!(policy.ttl, Duration::from_secs(300));
        assert_eq!(policy.stale_after(), Duration::from_secs(150));
    }

    #[test]
    fn test_kind_aliases() {
        let md: SourceConfig =
            serde_json::from_value(serde_json::json!({"type": "markdown", "file": "x.md"})).unwrap();
        assert_eq!(md.kind, SourceKind::MarkdownFile);

        let wasm: SourceConfig =
            serde_json::from_value(serde_json::json!({"type": "wasm", "path": "q.wasm"})).unwrap();
        assert_eq!(wasm.kind, SourceKind::Sandbox);

        let unknown = serde_json::from_value::<SourceConfig>(serde_json::json!({"type": "ftp"}));
        assert!(unknown.is_err());
    }

    #[test]
    fn test_cache_disabled_without_ttl() {
        let config = SourceConfig::builder(SourceKind::Rest).build();
        assert!(config.cache_policy().is_none());

        let mut config = SourceConfig::builder(SourceKind::Rest).build();
        config.cache = Some(CacheConfig {
            ttl: Some("not a duration".into()),
            ..Default::default()
        });
        assert!(config.cache_policy().is_none());
    }

    #[test]
    fn test_builder() {
        let config = SourceConfig::builder(SourceKind::Exec)
            .command("echo hi")
            .timeout(Duration::from_millis(1500))
            .cache(Duration::from_secs(60), CacheStrategy::Simple)
            .delimiter(";")
            .build();

        assert_eq!(config.timeout_or(DEFAULT_EXEC_TIMEOUT), Duration::from_millis(1500));
        assert_eq!(config.delimiter_byte(), b';');
        assert_eq!(config.cache_policy().unwrap().stale_after(), Duration::from_secs(60));
    }

    #[test]
    fn test_bad_timeout_falls_back() {
        let mut config = SourceConfig::builder(SourceKind::Exec).build();
        config.timeout = Some("soon".into());
        assert_eq!(config.timeout_or(DEFAULT_EXEC_TIMEOUT), DEFAULT_EXEC_TIMEOUT);
    }

    #[test]
    fn test_runtime_defaults_are_locked_down() {
        let options = RuntimeOptions::default();
        assert!(!options.security.allow_exec);
        assert!(!options.security.bypass_ssrf);
        assert!(options.allow_exec(true).security.allow_exec);
    }

    #[test]
    fn test_resolve_path() {
        let options = RuntimeOptions::default().base_dir("/site");
        assert_eq!(options.resolve_path("data.json"), PathBuf::from("/site/data.json"));
        assert_eq!(options.resolve_path("/abs/data.json"), PathBuf::from("/abs/data.json"));
    }
}
