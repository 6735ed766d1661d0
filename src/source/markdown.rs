//! Rows stored in a section of a markdown file.
//!
//! A section starts at the heading whose anchor matches and runs to the next
//! heading of the same or higher level. Its body is read as one of:
//!
//! - a task list: `- [ ] text` / `- [x] text` → `{id, text, done}`
//! - a bullet list: `- text` → `{id, text}`
//! - a table: header row, separator, data rows → `{id, <header>: cell, ...}`
//!
//! Items keep a stable `id`: an explicit `<!-- id:abc123 -->` trailer when
//! present, otherwise an FNV-1a hash of the item text.
//!
//! Writes rewrite the file in place. If the file changed on disk since the
//! last fetch, the write goes to a `name.conflict-<timestamp>.md` copy instead
//! and the call fails.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::SystemTime;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::{RuntimeOptions, SourceConfig, SourceKind};
use crate::error::{Result, SourceError};
use crate::source::{required, Row, Source};

static HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(#{1,6})[ \t]+(.+?)[ \t]*$").expect("valid regex"));
static NEXT_HEADING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^(#{1,6})[ \t]").expect("valid regex"));
static EXPLICIT_ANCHOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{#([^}]+)\}\s*$").expect("valid regex"));

static TASK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\s*)-\s+\[([ xX])\]\s+(.+?)(?:\s*<!--\s*id:(\w+)\s*-->)?\s*$").expect("valid regex")
});
static BULLET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\s*)-\s+(.+?)(?:\s*<!--\s*id:(\w+)\s*-->)?\s*$").expect("valid regex")
});
static TABLE_ROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\|(.+)\|(?:\s*<!--\s*id:(\w+)\s*-->)?").expect("valid regex")
});
static SEPARATOR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*\|[\s\-:|]+\|").expect("valid regex"));

static DETECT_TASK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*-\s+\[[ xX]\]\s+").expect("valid regex"));
static DETECT_TABLE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*\|.+\|").expect("valid regex"));
static DETECT_BULLET: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*-\s+[^\[]").expect("valid regex"));

/// Deterministic 8-hex-digit ID for an item without an explicit one (FNV-1a, 32 bit).
pub fn content_id(text: &str) -> String {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in text.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    format!("{hash:08x}")
}

/// GitHub-style heading slug: `"My Task List"` → `"my-task-list"`.
pub fn slugify(text: &str) -> String {
    text.to_lowercase()
        .replace(' ', "-")
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .collect()
}

fn new_item_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

/// Parse the rows of the section identified by `anchor`.
///
/// A missing section yields no rows.
pub fn parse_section(content: &str, anchor: &str) -> Vec<Row> {
    match find_section(content, anchor.trim_start_matches('#')) {
        Some((start, end)) => parse_body(&content[start..end]),
        None => Vec::new(),
    }
}

/// Byte range of a section body: from the end of its heading line to the
/// next heading of the same or higher level.
fn find_section(content: &str, anchor: &str) -> Option<(usize, usize)> {
    let headings: Vec<_> = HEADING.captures_iter(content).collect();

    let explicit = headings.iter().find(|caps| {
        EXPLICIT_ANCHOR
            .captures(&caps[2])
            .is_some_and(|a| a[1].trim() == anchor)
    });
    let heading = explicit.or_else(|| {
        headings
            .iter()
            .filter(|caps| !EXPLICIT_ANCHOR.is_match(&caps[2]))
            .find(|caps| slugify(caps[2].trim()) == anchor)
    })?;

    let level = heading[1].len();
    let start = heading.get(0)?.end();
    let end = NEXT_HEADING
        .captures_iter(&content[start..])
        .find(|caps| caps[1].len() <= level)
        .and_then(|caps| caps.get(0))
        .map_or(content.len(), |m| start + m.start());
    Some((start, end))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Task,
    Bullet,
    Table,
    Empty,
}

fn detect_layout(body: &str) -> Layout {
    for line in body.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if DETECT_TASK.is_match(line) {
            return Layout::Task;
        }
        if DETECT_TABLE.is_match(line) {
            return Layout::Table;
        }
        if DETECT_BULLET.is_match(line) {
            return Layout::Bullet;
        }
    }
    Layout::Empty
}

struct TaskItem<'a> {
    indent: &'a str,
    done: bool,
    text: &'a str,
    explicit_id: Option<&'a str>,
}

fn parse_task(line: &str) -> Option<TaskItem<'_>> {
    let caps = TASK.captures(line)?;
    Some(TaskItem {
        indent: caps.get(1).map_or("", |m| m.as_str()),
        done: &caps[2] != " ",
        text: caps.get(3)?.as_str().trim(),
        explicit_id: caps.get(4).map(|m| m.as_str()),
    })
}

struct BulletItem<'a> {
    indent: &'a str,
    text: &'a str,
    explicit_id: Option<&'a str>,
}

fn parse_bullet(line: &str) -> Option<BulletItem<'_>> {
    let caps = BULLET.captures(line)?;
    let text = caps.get(2)?.as_str().trim();
    if text.starts_with("[ ]") || text.starts_with("[x]") || text.starts_with("[X]") {
        return None;
    }
    Some(BulletItem {
        indent: caps.get(1).map_or("", |m| m.as_str()),
        text,
        explicit_id: caps.get(3).map(|m| m.as_str()),
    })
}

fn parse_table_row(line: &str) -> Option<(Vec<String>, Option<&str>)> {
    let caps = TABLE_ROW.captures(line)?;
    let cells = caps[1]
        .split('|')
        .map(str::trim)
        .map(str::to_string)
        .collect();
    Some((cells, caps.get(2).map(|m| m.as_str())))
}

fn id_comment(id: Option<&str>) -> String {
    id.map(|id| format!(" <!-- id:{id} -->")).unwrap_or_default()
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// One addressable item: its line index in the body and its ID.
struct ItemLine {
    index: usize,
    id: String,
    explicit: bool,
}

/// Table structure within a section body.
struct Table {
    headers: Vec<String>,
    /// Line indices of data rows.
    rows: Vec<usize>,
}

fn scan_table(lines: &[&str]) -> Table {
    let mut headers: Option<Vec<String>> = None;
    let mut separator_seen = false;
    let mut rows = Vec::new();
    for (index, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if SEPARATOR.is_match(trimmed) {
            separator_seen = true;
            continue;
        }
        if TABLE_ROW.is_match(trimmed) {
            if headers.is_none() {
                headers = parse_table_row(trimmed).map(|(cells, _)| cells);
            } else if separator_seen {
                rows.push(index);
            }
        }
    }
    Table {
        headers: headers.unwrap_or_default(),
        rows,
    }
}

fn item_lines(lines: &[&str], layout: Layout) -> Vec<ItemLine> {
    let item = |index: usize, explicit: Option<&str>, text: &str| ItemLine {
        index,
        id: explicit.map_or_else(|| content_id(text), str::to_string),
        explicit: explicit.is_some(),
    };
    match layout {
        Layout::Task => lines
            .iter()
            .enumerate()
            .filter_map(|(i, l)| parse_task(l).map(|t| item(i, t.explicit_id, t.text)))
            .collect(),
        Layout::Bullet => lines
            .iter()
            .enumerate()
            .filter_map(|(i, l)| parse_bullet(l).map(|b| item(i, b.explicit_id, b.text)))
            .collect(),
        Layout::Table => scan_table(lines)
            .rows
            .into_iter()
            .filter_map(|i| {
                let (cells, explicit) = parse_table_row(lines[i].trim())?;
                Some(item(i, explicit, &cells.join("|")))
            })
            .collect(),
        Layout::Empty => Vec::new(),
    }
}

fn parse_body(body: &str) -> Vec<Row> {
    let lines: Vec<&str> = body.lines().collect();
    let layout = detect_layout(body);
    let table = (layout == Layout::Table).then(|| scan_table(&lines));

    item_lines(&lines, layout)
        .into_iter()
        .filter_map(|item| {
            let line = lines[item.index];
            let mut row = Row::new();
            row.insert("id".into(), Value::String(item.id));
            match layout {
                Layout::Task => {
                    let task = parse_task(line)?;
                    row.insert("text".into(), Value::String(task.text.to_string()));
                    row.insert("done".into(), Value::Bool(task.done));
                }
                Layout::Bullet => {
                    let bullet = parse_bullet(line)?;
                    row.insert("text".into(), Value::String(bullet.text.to_string()));
                }
                Layout::Table => {
                    let headers = &table.as_ref()?.headers;
                    let (cells, _) = parse_table_row(line.trim())?;
                    for (header, cell) in headers.iter().zip(cells) {
                        row.insert(header.clone(), Value::String(cell));
                    }
                }
                Layout::Empty => return None,
            }
            Some(row)
        })
        .collect()
}

/// Why an edit could not be applied to a section body.
#[derive(Debug)]
enum EditError {
    Unsupported(String),
    NotFound(String),
    Invalid(String),
}

impl EditError {
    fn into_source_error(self, source_name: &str) -> SourceError {
        match self {
            EditError::Unsupported(op) => SourceError::unsupported(source_name, op),
            EditError::NotFound(reason) => SourceError::transient(source_name, reason),
            EditError::Invalid(reason) => SourceError::parse(source_name, reason),
        }
    }
}

fn required_id(row: &Row, action: &str) -> std::result::Result<String, EditError> {
    match row.get("id") {
        Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(EditError::Invalid(format!("{action} requires an \"id\" field"))),
    }
}

/// Apply a write action to a section body and return the new body.
fn apply_action(body: &str, action: &str, row: &Row) -> std::result::Result<String, EditError> {
    let layout = detect_layout(body);
    let mut lines: Vec<String> = body.split('\n').map(str::to_string).collect();

    match action {
        "add" => {
            let line = render_new_item(body, layout, row)?;
            let trimmed = body.trim_end_matches(['\n', '\r']);
            let tail = &body[trimmed.len()..];
            let tail = if tail.is_empty() { "\n" } else { tail };
            Ok(format!("{trimmed}\n{line}{tail}"))
        }
        "toggle" | "delete" | "update" => {
            if action == "toggle" && layout != Layout::Task {
                return Err(EditError::Unsupported("toggle on a section that is not a task list".into()));
            }
            let id = required_id(row, action)?;
            let borrowed: Vec<&str> = lines.iter().map(String::as_str).collect();
            let item = item_lines(&borrowed, layout)
                .into_iter()
                .find(|item| item.id == id)
                .ok_or_else(|| EditError::NotFound(format!("item with id {id:?} not found")))?;
            let headers = (layout == Layout::Table).then(|| scan_table(&borrowed).headers);

            match action {
                "toggle" => {
                    let line = &lines[item.index];
                    lines[item.index] = if line.contains("[ ]") {
                        line.replacen("[ ]", "[x]", 1)
                    } else if line.contains("[x]") {
                        line.replacen("[x]", "[ ]", 1)
                    } else {
                        line.replacen("[X]", "[ ]", 1)
                    };
                }
                "delete" => {
                    lines.remove(item.index);
                }
                _ => {
                    let updated = render_update(&lines[item.index], layout, headers.as_deref(), &item, row)?;
                    lines[item.index] = updated;
                }
            }
            Ok(lines.join("\n"))
        }
        other => Err(EditError::Unsupported(format!("unknown action {other:?}"))),
    }
}

fn render_new_item(body: &str, layout: Layout, row: &Row) -> std::result::Result<String, EditError> {
    let id = new_item_id();
    let text = row.get("text").map(cell_text).unwrap_or_default();
    let done = row.get("done").and_then(Value::as_bool).unwrap_or(false);

    let layout = match layout {
        Layout::Empty if row.contains_key("done") => Layout::Task,
        Layout::Empty => Layout::Bullet,
        other => other,
    };
    match layout {
        Layout::Task => Ok(format!(
            "- [{}] {text} <!-- id:{id} -->",
            if done { 'x' } else { ' ' }
        )),
        Layout::Bullet => Ok(format!("- {text} <!-- id:{id} -->")),
        Layout::Table => {
            let lines: Vec<&str> = body.lines().collect();
            let headers = scan_table(&lines).headers;
            if headers.is_empty() {
                return Err(EditError::Invalid("cannot add to a table without headers".into()));
            }
            let cells: Vec<String> = headers
                .iter()
                .map(|h| row.get(h).map(cell_text).unwrap_or_default())
                .collect();
            Ok(format!("| {} | <!-- id:{id} -->", cells.join(" | ")))
        }
        Layout::Empty => Err(EditError::Invalid("section has no list or table".into())),
    }
}

fn render_update(
    line: &str,
    layout: Layout,
    headers: Option<&[String]>,
    item: &ItemLine,
    row: &Row,
) -> std::result::Result<String, EditError> {
    let explicit = item.explicit.then_some(item.id.as_str());
    let malformed = || EditError::Invalid(format!("item {:?} could not be parsed", item.id));

    match layout {
        Layout::Task => {
            let task = parse_task(line).ok_or_else(malformed)?;
            let text = row.get("text").map(cell_text).unwrap_or_else(|| task.text.to_string());
            let done = row.get("done").and_then(Value::as_bool).unwrap_or(task.done);
            Ok(format!(
                "{}- [{}] {text}{}",
                task.indent,
                if done { 'x' } else { ' ' },
                id_comment(explicit)
            ))
        }
        Layout::Bullet => {
            let bullet = parse_bullet(line).ok_or_else(malformed)?;
            let text = row.get("text").map(cell_text).unwrap_or_else(|| bullet.text.to_string());
            Ok(format!("{}- {text}{}", bullet.indent, id_comment(explicit)))
        }
        Layout::Table => {
            let (mut cells, _) = parse_table_row(line.trim()).ok_or_else(malformed)?;
            for (j, header) in headers.unwrap_or_default().iter().enumerate() {
                if let (Some(value), Some(cell)) = (row.get(header), cells.get_mut(j)) {
                    *cell = cell_text(value);
                }
            }
            Ok(format!("| {} |{}", cells.join(" | "), id_comment(explicit)))
        }
        Layout::Empty => Err(malformed()),
    }
}

/// A section of a markdown file exposed as rows.
#[derive(Debug)]
pub struct MarkdownSource {
    name: String,
    path: PathBuf,
    anchor: String,
    readonly: bool,
    /// Modification time observed by the last fetch or write.
    last_mtime: Mutex<Option<SystemTime>>,
}

impl MarkdownSource {
    /// Build a markdown source. Both `path` and `anchor` are required.
    ///
    /// Sources are readonly unless the declaration sets `readonly: false`.
    pub fn new(name: &str, config: &SourceConfig, options: &RuntimeOptions) -> Result<Self> {
        let path = options.resolve_path(required(name, "path", &config.path)?);
        let anchor = required(name, "anchor", &config.anchor)?
            .trim_start_matches('#')
            .to_string();
        Ok(Self {
            name: name.to_string(),
            path,
            anchor,
            readonly: config.readonly_or(true),
            last_mtime: Mutex::new(None),
        })
    }

    /// The resolved file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The section anchor, without the leading `#`.
    pub fn anchor(&self) -> &str {
        &self.anchor
    }

    async fn mtime(&self) -> Result<SystemTime> {
        let metadata = tokio::fs::metadata(&self.path).await.map_err(|e| {
            SourceError::transient(&self.name, format!("failed to stat {}: {e}", self.path.display()))
        })?;
        Ok(metadata.modified()?)
    }

    async fn read(&self) -> Result<String> {
        tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            SourceError::transient(&self.name, format!("failed to read {}: {e}", self.path.display()))
        })
    }

    fn conflict_path(&self) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let file_name = match self.path.extension() {
            Some(ext) => format!("{stem}.conflict-{timestamp}.{}", ext.to_string_lossy()),
            None => format!("{stem}.conflict-{timestamp}"),
        };
        self.path.with_file_name(file_name)
    }

    fn edit(&self, content: &str, action: &str, row: &Row) -> Result<String> {
        let (start, end) = find_section(content, &self.anchor).ok_or_else(|| {
            SourceError::transient(&self.name, format!("section #{} not found", self.anchor))
        })?;
        let body = apply_action(&content[start..end], action, row)
            .map_err(|e| e.into_source_error(&self.name))?;
        Ok(format!("{}{body}{}", &content[..start], &content[end..]))
    }
}

#[async_trait]
impl Source for MarkdownSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::MarkdownFile
    }

    async fn fetch(&self) -> Result<Vec<Row>> {
        let mut last_mtime = self.last_mtime.lock().await;
        let mtime = self.mtime().await?;
        let content = self.read().await?;
        *last_mtime = Some(mtime);

        let rows = parse_section(&content, &self.anchor);
        debug!(source = %self.name, anchor = %self.anchor, rows = rows.len(), "markdown section read");
        Ok(rows)
    }

    async fn write_item(&self, action: &str, row: &Row) -> Result<()> {
        if self.readonly {
            return Err(SourceError::unsupported(&self.name, format!("write {action:?} to a readonly source")));
        }

        let mut last_mtime = self.last_mtime.lock().await;
        let current = self.mtime().await?;
        let content = self.read().await?;

        if last_mtime.is_some_and(|seen| seen != current) {
            let conflict_path = self.conflict_path();
            let conflicted = self.edit(&content, action, row).unwrap_or_else(|_| content.clone());
            tokio::fs::write(&conflict_path, conflicted).await.map_err(|e| {
                SourceError::transient(&self.name, format!("failed to write conflict copy: {e}"))
            })?;
            warn!(
                source = %self.name,
                conflict = %conflict_path.display(),
                "markdown file modified externally; write diverted"
            );
            return Err(SourceError::transient(
                &self.name,
                format!(
                    "file was modified externally; your changes were saved to {}",
                    conflict_path.display()
                ),
            ));
        }

        let updated = self.edit(&content, action, row)?;
        tokio::fs::write(&self.path, updated).await.map_err(|e| {
            SourceError::transient(&self.name, format!("failed to write {}: {e}", self.path.display()))
        })?;
        *last_mtime = Some(self.mtime().await?);
        debug!(source = %self.name, action, "markdown item written");
        Ok(())
    }

    fn is_readonly(&self) -> bool {
        self.readonly
    }
}
