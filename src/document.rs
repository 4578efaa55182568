//! Whole-document path for local files, JSON payloads and inline documents.
//!
//! No chunking here: the payload is parsed as one unit and the requested
//! window is sliced out of the materialised rows.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{LoadError, TableResult};
use crate::format::TableFormat;
use crate::rows::{ParseState, TableRow};

/// Keys under which an object payload may hold its row array, in priority order.
pub const ROW_ARRAY_KEYS: &[&str] = &["rows", "data", "items", "records", "results"];

/// Parse a complete CSV document with the same header-then-data rules as
/// the chunked path.
pub async fn parse_csv_document(bytes: &[u8]) -> TableResult<Vec<TableRow>> {
    let mut state = ParseState::new();
    let mut rows = state.feed(bytes, u64::MAX).await?;
    rows.extend(state.finish().await?);
    Ok(rows)
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Parse a JSON payload: a top-level array of objects, or an object holding
/// that array under one of [`ROW_ARRAY_KEYS`].
///
/// Columns are the union of keys in first-seen order, so every row carries
/// the same key set; absent keys become empty strings.
pub fn parse_json_rows(bytes: &[u8]) -> TableResult<Vec<TableRow>> {
    let value: Value = serde_json::from_slice(bytes).map_err(|e| {
        LoadError::parse_failed(format!("invalid JSON at line {}", e.line()))
            .with("step", "json")
            .with("lines", e.line())
            .with_source(e)
    })?;

    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => ROW_ARRAY_KEYS
            .iter()
            .find_map(|key| match map.remove(*key) {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            })
            .ok_or_else(|| {
                LoadError::parse_failed(format!(
                    "JSON object has no row array under any of: {}",
                    ROW_ARRAY_KEYS.join(", ")
                ))
                .with("step", "json")
            })?,
        _ => {
            return Err(
                LoadError::parse_failed("JSON payload must be an array or an object")
                    .with("step", "json"),
            )
        }
    };

    let mut objects = Vec::with_capacity(items.len());
    for (idx, item) in items.into_iter().enumerate() {
        match item {
            Value::Object(map) => objects.push(map),
            _ => {
                return Err(LoadError::parse_failed("JSON rows must be objects")
                    .with("step", "json")
                    .with("row", idx))
            }
        }
    }

    let mut seen = HashSet::new();
    let mut names = Vec::new();
    for key in objects.iter().flat_map(|obj| obj.keys()) {
        if seen.insert(key.as_str()) {
            names.push(key.clone());
        }
    }
    let columns: Arc<[String]> = names.into();

    Ok(objects
        .iter()
        .map(|obj| {
            let values = columns
                .iter()
                .map(|c| obj.get(c).map(render).unwrap_or_default())
                .collect();
            TableRow::from_fields(columns.clone(), values)
        })
        .collect())
}

pub async fn parse_document(format: TableFormat, bytes: &[u8]) -> TableResult<Vec<TableRow>> {
    match format {
        TableFormat::Csv => parse_csv_document(bytes).await,
        TableFormat::Json => parse_json_rows(bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ReasonCode;

    #[test]
    fn top_level_array() {
        let rows = parse_json_rows(br#"[{"a":"1","b":2},{"b":null,"c":true}]"#).unwrap();
        assert_eq!(rows[0].columns(), ["a", "b", "c"]);
        assert_eq!(rows[0].values(), ["1", "2", ""]);
        assert_eq!(rows[1].values(), ["", "", "true"]);
    }

    #[test]
    fn wrapped_array_under_known_key() {
        let rows = parse_json_rows(br#"{"total":2,"data":[{"x":1},{"x":{"y":[1]}}]}"#).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get("x"), Some(r#"{"y":[1]}"#));
    }

    #[test]
    fn rejects_unknown_shapes() {
        let err = parse_json_rows(br#"{"payload":[]}"#).unwrap_err();
        assert_eq!(err.reason(), ReasonCode::ParseFailed);

        let err = parse_json_rows(br#"[{"a":1}, 3]"#).unwrap_err();
        assert_eq!(err.context_value("row"), Some("1"));

        let err = parse_json_rows(b"[{\"a\":\n").unwrap_err();
        assert_eq!(err.reason(), ReasonCode::ParseFailed);
    }

    #[tokio::test]
    async fn csv_document_parses_in_one_pass() {
        let rows = parse_csv_document(b"a,b\n1,\"x\ny\"\n3,4").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("b"), Some("x\ny"));
        assert_eq!(rows[1].get("a"), Some("3"));
    }
}
