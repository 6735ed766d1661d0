//! Output decoders shared by every source kind.
//!
//! All decoders produce [`Row`]s: ordered maps of column name to JSON value.

use serde_json::Value;

use crate::config::OutputFormat;
use crate::error::{Result, SourceError};
use crate::source::Row;

/// Decode raw output according to a declared format.
pub fn parse_output(source_name: &str, format: OutputFormat, delimiter: u8, raw: &[u8]) -> Result<Vec<Row>> {
    let text = String::from_utf8_lossy(raw);
    match format {
        OutputFormat::Json => parse_json_rows(source_name, &text),
        OutputFormat::Lines => Ok(parse_lines(&text)),
        OutputFormat::Csv => parse_csv(source_name, &text, delimiter, true),
    }
}

/// Decode JSON output.
///
/// Accepts, in order: a top-level array of objects, a single object, or
/// newline-delimited objects. Blank output is zero rows.
pub fn parse_json_rows(source_name: &str, text: &str) -> Result<Vec<Row>> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }

    match serde_json::from_str::<Value>(text) {
        Ok(Value::Array(items)) => return array_to_rows(source_name, items),
        Ok(Value::Object(row)) => return Ok(vec![row]),
        _ => {}
    }

    let mut rows = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(row)) => rows.push(row),
            Ok(_) => {
                return Err(SourceError::parse(
                    source_name,
                    format!("line {}: expected a JSON object", lineno + 1),
                ))
            }
            Err(e) => {
                return Err(SourceError::parse(
                    source_name,
                    format!("invalid JSON output at line {}: {e}", lineno + 1),
                ))
            }
        }
    }
    Ok(rows)
}

/// Convert an already-decoded JSON value into rows.
///
/// `null` is zero rows, an object is one row, an array must hold objects.
pub fn value_to_rows(source_name: &str, value: Value) -> Result<Vec<Row>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Object(row) => Ok(vec![row]),
        Value::Array(items) => array_to_rows(source_name, items),
        other => Err(SourceError::parse(
            source_name,
            format!("expected an array or object, got {}", json_type(&other)),
        )),
    }
}

fn array_to_rows(source_name: &str, items: Vec<Value>) -> Result<Vec<Row>> {
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Object(row) => Ok(row),
            other => Err(SourceError::parse(
                source_name,
                format!("element {i} is {}, expected an object", json_type(&other)),
            )),
        })
        .collect()
}

/// Unwrap the rows of a JSON document that may be wrapped in an envelope.
///
/// With `result_path` set, the dot-separated path is followed and must land on
/// an array or object. Without it, the objects of a `data` or `results` array
/// on a top-level object are used if there are any; otherwise the object
/// itself is the single row.
pub fn extract_rows(source_name: &str, value: Value, result_path: Option<&str>) -> Result<Vec<Row>> {
    if let Some(path) = result_path.filter(|p| !p.is_empty()) {
        let mut current = &value;
        for segment in path.split('.') {
            current = match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            }
            .ok_or_else(|| {
                SourceError::parse(source_name, format!("result path {path:?} not found in response"))
            })?;
        }
        return value_to_rows(source_name, current.clone());
    }

    if let Value::Object(map) = &value {
        for wrapper in ["data", "results"] {
            if let Some(Value::Array(items)) = map.get(wrapper) {
                let rows: Vec<Row> = items.iter().filter_map(|i| i.as_object().cloned()).collect();
                if !rows.is_empty() {
                    return Ok(rows);
                }
            }
        }
    }
    value_to_rows(source_name, value)
}

/// One row per non-blank line: `{line, index}`.
///
/// Blank lines are skipped and do not consume an index.
pub fn parse_lines(text: &str) -> Vec<Row> {
    text.lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(index, line)| {
            let mut row = Row::new();
            row.insert("line".into(), Value::String(line.to_string()));
            row.insert("index".into(), Value::from(index));
            row
        })
        .collect()
}

/// Decode delimited text into string-valued rows.
///
/// With `has_header`, the first record names the columns; otherwise columns
/// are `col1..colN`. Quoted fields may contain the delimiter, newlines and
/// doubled quotes. Cells missing from a short record are omitted.
pub fn parse_csv(source_name: &str, text: &str, delimiter: u8, has_header: bool) -> Result<Vec<Row>> {
    let records = split_records(source_name, text, delimiter as char)?;
    let mut records = records.into_iter();

    let header: Vec<String> = if has_header {
        match records.next() {
            Some(first) => first
                .into_iter()
                .enumerate()
                .map(|(i, h)| if h.is_empty() { format!("col{}", i + 1) } else { h })
                .collect(),
            None => return Ok(Vec::new()),
        }
    } else {
        Vec::new()
    };

    Ok(records
        .map(|record| {
            let mut row = Row::new();
            for (i, cell) in record.into_iter().enumerate() {
                let column = if has_header {
                    match header.get(i) {
                        Some(h) => h.clone(),
                        None => continue,
                    }
                } else {
                    format!("col{}", i + 1)
                };
                row.insert(column, Value::String(cell));
            }
            row
        })
        .collect())
}

fn split_records(source_name: &str, text: &str, delimiter: char) -> Result<Vec<Vec<String>>> {
    let mut records = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut quoted = false;
    let mut chars = text.chars().peekable();

    fn finish_field(record: &mut Vec<String>, field: &mut String, quoted: bool) {
        let value = std::mem::take(field);
        record.push(if quoted { value } else { value.trim().to_string() });
    }

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = false;
                }
            } else {
                field.push(c);
            }
            continue;
        }

        match c {
            '"' if field.trim().is_empty() => {
                field.clear();
                in_quotes = true;
                quoted = true;
            }
            '\r' => {}
            '\n' => {
                finish_field(&mut record, &mut field, quoted);
                quoted = false;
                let done = std::mem::take(&mut record);
                if !(done.len() == 1 && done[0].is_empty()) {
                    records.push(done);
                }
            }
            c if c == delimiter => {
                finish_field(&mut record, &mut field, quoted);
                quoted = false;
            }
            c => field.push(c),
        }
    }

    if in_quotes {
        return Err(SourceError::parse(source_name, "unterminated quoted CSV field"));
    }
    if !field.is_empty() || !record.is_empty() || quoted {
        finish_field(&mut record, &mut field, quoted);
        if !(record.len() == 1 && record[0].is_empty() && !quoted) {
            records.push(record);
        }
    }
    Ok(records)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
