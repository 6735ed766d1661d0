//! Error types for data sources.

use serde::Serialize;
use thiserror::Error;

/// Maximum number of stderr bytes kept in an error for diagnostics.
const MAX_STDERR_BYTES: usize = 2048;

/// Errors that can occur while building, fetching from, or writing to a source.
#[derive(Error, Debug)]
pub enum SourceError {
    /// The source declaration is invalid or incomplete.
    #[error("source {source_name:?}: configuration error: {reason}")]
    Config {
        /// Name of the offending source.
        source_name: String,
        /// What is wrong with the declaration.
        reason: String,
    },

    /// The request was blocked by the security validator.
    #[error("source {source_name:?}: blocked: {reason}")]
    Security {
        /// Name of the offending source.
        source_name: String,
        /// Why the request was blocked.
        reason: String,
    },

    /// A process or network failure. Safe to retry on the next fetch.
    #[error("source {source_name:?}: {reason}")]
    Transient {
        /// Name of the failing source.
        source_name: String,
        /// Description of the failure, including stderr when available.
        reason: String,
    },

    /// Output did not match the declared format.
    #[error("source {source_name:?}: parse error: {reason}")]
    Parse {
        /// Name of the failing source.
        source_name: String,
        /// Description of the mismatch.
        reason: String,
    },

    /// The operation is not supported by this source (e.g. a write to a readonly source).
    #[error("source {source_name:?}: unsupported operation: {operation}")]
    UnsupportedOperation {
        /// Name of the source.
        source_name: String,
        /// The rejected operation.
        operation: String,
    },

    /// A non-success HTTP response.
    #[error("source {source_name:?}: HTTP {status}: {body}")]
    Http {
        /// Name of the source.
        source_name: String,
        /// Response status code.
        status: u16,
        /// Leading bytes of the response body.
        body: String,
    },

    /// The call exceeded its configured timeout.
    #[error("source {source_name:?}: timed out after {timeout:?}")]
    Timeout {
        /// Name of the source.
        source_name: String,
        /// The configured limit.
        timeout: std::time::Duration,
    },

    /// No source is registered under this name.
    #[error("unknown source {0:?}")]
    UnknownSource(String),

    /// Failed to initialize the Wasm runtime.
    #[error("failed to initialize sandbox runtime: {0}")]
    Sandbox(#[source] anyhow::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The coarse taxonomy callers act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad declaration; fatal at load, never retried.
    Config,
    /// Blocked by policy; never retried.
    Security,
    /// Process, network or I/O failure; retry on the next fetch.
    Transient,
    /// Output did not match the declared format; treated as transient.
    Parse,
    /// The source cannot perform the requested operation.
    Unsupported,
}

impl SourceError {
    /// Shorthand for a [`SourceError::Config`].
    pub fn config(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        SourceError::Config {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`SourceError::Security`].
    pub fn security(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        SourceError::Security {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`SourceError::Transient`].
    pub fn transient(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        SourceError::Transient {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`SourceError::Parse`].
    pub fn parse(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        SourceError::Parse {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`SourceError::UnsupportedOperation`].
    pub fn unsupported(source_name: impl Into<String>, operation: impl Into<String>) -> Self {
        SourceError::UnsupportedOperation {
            source_name: source_name.into(),
            operation: operation.into(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SourceError::Config { .. } | SourceError::UnknownSource(_) | SourceError::Sandbox(_) => {
                ErrorKind::Config
            }
            SourceError::Security { .. } => ErrorKind::Security,
            SourceError::Parse { .. } => ErrorKind::Parse,
            SourceError::UnsupportedOperation { .. } => ErrorKind::Unsupported,
            SourceError::Transient { .. }
            | SourceError::Http { .. }
            | SourceError::Timeout { .. }
            | SourceError::Io(_) => ErrorKind::Transient,
        }
    }

    /// Check if a later invocation of the same source might succeed.
    ///
    /// HTTP responses are retryable only for 5xx and 429.
    pub fn is_retryable(&self) -> bool {
        match self {
            SourceError::Http { status, .. } => *status >= 500 || *status == 429,
            _ => matches!(self.kind(), ErrorKind::Transient | ErrorKind::Parse),
        }
    }

    /// Check if this error was raised by the security validator.
    pub fn is_security(&self) -> bool {
        matches!(self, SourceError::Security { .. })
    }

    /// Check if this error represents a bad declaration.
    pub fn is_config(&self) -> bool {
        self.kind() == ErrorKind::Config
    }

    /// Check if this error represents a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SourceError::Timeout { .. })
    }

    /// A short message suitable for showing to a document reader.
    pub fn user_message(&self) -> String {
        match self {
            SourceError::Http { status, .. } => match *status {
                401 => "Authentication required.".to_string(),
                403 => "Access denied.".to_string(),
                404 => "Resource not found.".to_string(),
                429 => "Too many requests. Please slow down.".to_string(),
                s if s >= 500 => "Server error. Please try again later.".to_string(),
                s => format!("Request failed (HTTP {s})."),
            },
            SourceError::Timeout { .. } => "Request timed out. Please try again.".to_string(),
            SourceError::Security { reason, .. } => format!("Blocked: {reason}"),
            SourceError::Config { reason, .. } => format!("Invalid source: {reason}"),
            SourceError::Parse { .. } => "Source returned data in an unexpected format.".to_string(),
            SourceError::UnsupportedOperation { .. } => {
                "This source does not support that operation.".to_string()
            }
            SourceError::UnknownSource(name) => format!("Unknown source {name:?}."),
            _ => "Failed to load data. Please try again.".to_string(),
        }
    }

    /// Build the structured payload handed to the rendering layer.
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            kind: self.kind(),
            message: self.user_message(),
            detail: self.to_string(),
            retryable: self.is_retryable(),
        }
    }
}

/// Structured error object that accompanies an empty row set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorPayload {
    /// Error classification.
    pub kind: ErrorKind,
    /// Human-readable summary.
    pub message: String,
    /// Full error text for diagnostics.
    pub detail: String,
    /// Whether a later fetch may succeed.
    pub retryable: bool,
}

/// Result type alias for source operations.
pub type Result<T> = std::result::Result<T, SourceError>;

/// Trim process stderr down to something worth putting in an error message.
///
/// Keeps the tail of the output, since the last lines usually carry the
/// actual failure, and cuts on a character boundary.
pub fn summarize_stderr(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= MAX_STDERR_BYTES {
        return text.to_string();
    }

    let mut start = text.len() - MAX_STDERR_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}
