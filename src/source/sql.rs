//! SQLite table source.
//!
//! The connection lives behind `Arc<Mutex<..>>` and every statement runs on
//! the blocking pool via `tokio::task::spawn_blocking`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::{RuntimeOptions, SourceConfig, SourceKind};
use crate::error::{Result, SourceError};
use crate::source::{required, Row, Source};

/// Check that a table or column name is safe to splice into SQL.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 64 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Columns that a write may set: valid identifiers not starting with `_`.
fn writable_fields(row: &Row) -> Vec<(String, SqlValue)> {
    row.iter()
        .filter(|(key, _)| key.as_str() != "id" && !key.starts_with('_') && is_valid_identifier(key))
        .map(|(key, value)| (key.clone(), to_sql(value)))
        .collect()
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

fn sql_type(value: &SqlValue) -> &'static str {
    match value {
        SqlValue::Integer(_) => "INTEGER",
        SqlValue::Real(_) => "REAL",
        _ => "TEXT",
    }
}

fn row_id(row: &Row, action: &str, source_name: &str) -> Result<SqlValue> {
    match row.get("id") {
        Some(Value::Number(n)) => Ok(to_sql(&Value::Number(n.clone()))),
        Some(Value::String(s)) if !s.is_empty() => Ok(s
            .parse::<i64>()
            .map_or_else(|_| SqlValue::Text(s.clone()), SqlValue::Integer)),
        _ => Err(SourceError::parse(source_name, format!("{action} requires an \"id\" field"))),
    }
}

fn table_columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns)
}

/// Create the table on first insert, and add any columns the row introduces.
fn ensure_table(conn: &Connection, table: &str, fields: &[(String, SqlValue)]) -> rusqlite::Result<()> {
    let existing = table_columns(conn, table)?;
    if existing.is_empty() {
        let mut defs = vec!["id INTEGER PRIMARY KEY AUTOINCREMENT".to_string()];
        defs.extend(fields.iter().map(|(col, value)| format!("{col} {}", sql_type(value))));
        defs.push("created_at DATETIME DEFAULT CURRENT_TIMESTAMP".to_string());
        conn.execute(&format!("CREATE TABLE IF NOT EXISTS {table} ({})", defs.join(", ")), [])?;
        info!(table, "created table");
        return Ok(());
    }

    for (col, value) in fields {
        if !existing.iter().any(|c| c.eq_ignore_ascii_case(col)) {
            conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {col} {}", sql_type(value)), [])?;
            debug!(table, column = %col, "added column");
        }
    }
    Ok(())
}

/// Rows from a SQLite table or a custom query.
#[derive(Debug)]
pub struct SqlSource {
    name: String,
    path: PathBuf,
    table: Option<String>,
    query: Option<String>,
    readonly: bool,
    /// `None` once closed.
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqlSource {
    /// Open (or create) the database at `connection`.
    ///
    /// A `table` is required unless a custom `query` is given; writes always
    /// need a table.
    pub fn new(name: &str, config: &SourceConfig, options: &RuntimeOptions) -> Result<Self> {
        let path = options.resolve_path(required(name, "connection", &config.connection)?);
        let query = config.query.clone().filter(|q| !q.trim().is_empty());
        let table = match config.table.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            Some(table) if !is_valid_identifier(table) => {
                return Err(SourceError::config(name, format!("invalid table name {table:?}")))
            }
            Some(table) => Some(table.to_string()),
            None if query.is_some() => None,
            None => return Err(SourceError::config(name, "table is required")),
        };

        let conn = Connection::open(&path).map_err(|e| {
            SourceError::config(name, format!("failed to open database {}: {e}", path.display()))
        })?;
        info!(source = %name, path = %path.display(), "opened database");

        Ok(Self {
            name: name.to_string(),
            path,
            readonly: config.readonly_or(table.is_none()),
            table,
            query,
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// The database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the connection on the blocking pool.
    async fn execute<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let name = self.name.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            let conn = guard
                .as_ref()
                .ok_or_else(|| SourceError::transient(&name, "source is closed"))?;
            f(conn).map_err(|e| SourceError::transient(&name, format!("database error: {e}")))
        })
        .await
        .map_err(|e| SourceError::transient(&self.name, format!("database task failed: {e}")))?
    }

    fn writable_table(&self, action: &str) -> Result<String> {
        if self.readonly {
            return Err(SourceError::unsupported(&self.name, format!("write {action:?} to a readonly source")));
        }
        self.table
            .clone()
            .ok_or_else(|| SourceError::unsupported(&self.name, format!("write {action:?} without a table")))
    }
}

#[async_trait]
impl Source for SqlSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Sql
    }

    async fn fetch(&self) -> Result<Vec<Row>> {
        let table = self.table.clone();
        let query = self.query.clone();
        let rows = self
            .execute(move |conn| {
                let sql = match (query, table) {
                    (Some(query), _) => query,
                    (None, Some(table)) => {
                        let columns = table_columns(conn, &table)?;
                        if columns.is_empty() {
                            return Ok(Vec::new());
                        }
                        if columns.iter().any(|c| c == "created_at") {
                            format!("SELECT * FROM {table} ORDER BY created_at DESC, id DESC")
                        } else {
                            format!("SELECT * FROM {table}")
                        }
                    }
                    (None, None) => return Ok(Vec::new()),
                };

                let mut stmt = conn.prepare(&sql)?;
                let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
                let rows = stmt
                    .query_map([], |record| {
                        let mut row = Row::new();
                        for (i, column) in columns.iter().enumerate() {
                            row.insert(column.clone(), to_json(record.get_ref(i)?));
                        }
                        Ok(row)
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        debug!(source = %self.name, rows = rows.len(), "query finished");
        Ok(rows)
    }

    async fn write_item(&self, action: &str, row: &Row) -> Result<()> {
        let table = self.writable_table(action)?;
        let fields = writable_fields(row);

        match action {
            "add" => {
                if fields.is_empty() {
                    return Err(SourceError::parse(&self.name, "add requires at least one field"));
                }
                self.execute(move |conn| {
                    ensure_table(conn, &table, &fields)?;
                    let columns: Vec<&str> = fields.iter().map(|(c, _)| c.as_str()).collect();
                    let placeholders = vec!["?"; fields.len()].join(", ");
                    let sql = format!("INSERT INTO {table} ({}) VALUES ({placeholders})", columns.join(", "));
                    conn.execute(&sql, params_from_iter(fields.iter().map(|(_, v)| v)))?;
                    Ok(())
                })
                .await
            }
            "update" => {
                let id = row_id(row, action, &self.name)?;
                if fields.is_empty() {
                    return Err(SourceError::parse(&self.name, "update requires at least one field"));
                }
                let changed = self
                    .execute(move |conn| {
                        ensure_table(conn, &table, &fields)?;
                        let sets: Vec<String> = fields.iter().map(|(c, _)| format!("{c} = ?")).collect();
                        let sql = format!("UPDATE {table} SET {} WHERE id = ?", sets.join(", "));
                        let params = fields.iter().map(|(_, v)| v).chain(std::iter::once(&id));
                        conn.execute(&sql, params_from_iter(params))
                    })
                    .await?;
                if changed == 0 {
                    return Err(SourceError::transient(&self.name, "item not found"));
                }
                Ok(())
            }
            "delete" => {
                let id = row_id(row, action, &self.name)?;
                self.execute(move |conn| {
                    conn.execute(&format!("DELETE FROM {table} WHERE id = ?"), [&id])?;
                    Ok(())
                })
                .await
            }
            other => Err(SourceError::unsupported(&self.name, format!("unknown action {other:?}"))),
        }
    }

    fn is_readonly(&self) -> bool {
        self.readonly
    }

    async fn close(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(conn) = conn {
            conn.close()
                .map_err(|(_, e)| SourceError::transient(&self.name, format!("failed to close database: {e}")))?;
            debug!(source = %self.name, "database closed");
        }
        Ok(())
    }
}
