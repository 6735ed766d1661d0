//! Read-only JSON and CSV file sources.
//!
//! Files are re-read on every fetch so edits on disk show up without a reload.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::config::{RuntimeOptions, SourceConfig, SourceKind};
use crate::error::{Result, SourceError};
use crate::source::format::{extract_rows, parse_csv};
use crate::source::{required, Row, Source};

async fn read_file(source_name: &str, path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path).await.map_err(|e| {
        SourceError::transient(source_name, format!("failed to read {}: {e}", path.display()))
    })?;
    debug!(source = %source_name, path = %path.display(), bytes = bytes.len(), "file read");
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Rows from a JSON file: an array, a single object, or a `data`/`results` wrapper.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    name: String,
    path: PathBuf,
}

impl JsonFileSource {
    /// Build a JSON file source. The path resolves against the base directory.
    pub fn new(name: &str, config: &SourceConfig, options: &RuntimeOptions) -> Result<Self> {
        let path = options.resolve_path(required(name, "path", &config.path)?);
        Ok(Self {
            name: name.to_string(),
            path,
        })
    }

    /// The resolved file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Source for JsonFileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Json
    }

    async fn fetch(&self) -> Result<Vec<Row>> {
        let text = read_file(&self.name, &self.path).await?;
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let value = serde_json::from_str(text)
            .map_err(|e| SourceError::parse(&self.name, format!("invalid JSON in {}: {e}", self.path.display())))?;
        extract_rows(&self.name, value, None)
    }
}

/// Rows from a delimited text file. All values are strings.
#[derive(Debug, Clone)]
pub struct CsvFileSource {
    name: String,
    path: PathBuf,
    delimiter: u8,
    has_header: bool,
}

impl CsvFileSource {
    /// Build a CSV file source. The path resolves against the base directory.
    pub fn new(name: &str, config: &SourceConfig, options: &RuntimeOptions) -> Result<Self> {
        let path = options.resolve_path(required(name, "path", &config.path)?);
        Ok(Self {
            name: name.to_string(),
            path,
            delimiter: config.delimiter_byte(),
            has_header: config.has_header.unwrap_or(true),
        })
    }
}

#[async_trait]
impl Source for CsvFileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Csv
    }

    async fn fetch(&self) -> Result<Vec<Row>> {
        let text = read_file(&self.name, &self.path).await?;
        parse_csv(&self.name, &text, self.delimiter, self.has_header)
    }
}
