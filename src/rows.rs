//! Header-keyed rows and the per-operation parse state.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use csv_async::{AsyncReaderBuilder, ByteRecord};
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::error::{LoadError, TableResult};
use crate::split;

/// Parser errors reported in a `PARSE_FAILED` error, at most.
const MAX_REPORTED_ERRORS: usize = 3;

/// One row: values keyed by the table's shared, ordered header.
///
/// Every row produced by one load shares the same header, so the key set
/// is identical across rows by construction.
#[derive(Clone, PartialEq, Eq)]
pub struct TableRow {
    columns: Arc<[String]>,
    values: Vec<String>,
}

impl TableRow {
    /// Map `fields` onto `columns` by position: missing trailing values are
    /// empty, extra values are dropped.
    pub fn from_fields(columns: Arc<[String]>, fields: Vec<String>) -> Self {
        let width = columns.len();
        let mut values: Vec<String> = fields.into_iter().take(width).collect();
        values.resize(width, String::new());
        Self { columns, values }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|idx| self.values[idx].as_str())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().map(String::as_str))
    }
}

impl fmt::Debug for TableRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl Serialize for TableRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (k, v) in self.iter() {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// Normalise raw header cells: trim, drop a leading BOM, name blank cells
/// `column_<n>` and suffix duplicates so every key is unique.
pub fn build_header(cells: Vec<String>) -> Arc<[String]> {
    let mut seen = HashSet::new();
    let mut names = Vec::with_capacity(cells.len());
    for (idx, cell) in cells.into_iter().enumerate() {
        let trimmed = if idx == 0 {
            cell.trim_start_matches('\u{feff}').trim().to_string()
        } else {
            cell.trim().to_string()
        };
        let base = if trimmed.is_empty() {
            format!("column_{}", idx + 1)
        } else {
            trimmed
        };
        let mut name = base.clone();
        let mut n = 2;
        while !seen.insert(name.clone()) {
            name = format!("{base}_{n}");
            n += 1;
        }
        names.push(name);
    }
    names.into()
}

#[derive(Default)]
struct ParseFailures {
    lines: Vec<u64>,
    messages: Vec<String>,
    total: usize,
}

impl ParseFailures {
    /// Whether the next failure will still be reported in detail.
    fn has_room(&self) -> bool {
        self.messages.len() < MAX_REPORTED_ERRORS
    }

    fn push(&mut self, line: Option<u64>, message: String) {
        self.total += 1;
        if !self.has_room() {
            return;
        }
        match line {
            Some(line) => {
                self.lines.push(line);
                self.messages.push(format!("line {line}: {message}"));
            }
            None => self.messages.push(message),
        }
    }

    fn into_error(self) -> Option<LoadError> {
        if self.total == 0 {
            return None;
        }
        let lines: Vec<String> = self.lines.iter().map(u64::to_string).collect();
        let mut err = LoadError::parse_failed(format!(
            "{} record(s) could not be parsed: {}",
            self.total,
            self.messages.join("; ")
        ))
        .with("step", "parse");
        if !lines.is_empty() {
            err = err.with("lines", lines.join(","));
        }
        Some(err)
    }
}

/// Mutable state for one load: the header once seen, and text carried over
/// from the previous chunk. Never shared between operations.
#[derive(Debug, Default)]
pub struct ParseState {
    header: Option<Arc<[String]>>,
    carry: Vec<u8>,
    lines_consumed: u64,
    /// Last parsed byte was `\r`; a leading `\n` next time closes that CRLF.
    after_cr: bool,
}

impl ParseState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(&self) -> Option<&[String]> {
        self.header.as_deref()
    }

    pub fn carry(&self) -> &[u8] {
        &self.carry
    }

    /// Line number (1-based) of the first line not yet parsed.
    pub fn next_line(&self) -> u64 {
        self.lines_consumed + 1
    }

    /// Parse complete records in `text`.
    ///
    /// The first non-blank record ever seen becomes the header; every record
    /// after it, in this call or later ones, is a data row. Records whose
    /// fields are all blank are skipped. Any undecodable record fails the
    /// whole call so a partial row set never escapes.
    pub async fn assemble(&mut self, text: &[u8]) -> TableResult<Vec<TableRow>> {
        let mut rdr = AsyncReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .create_reader(text);

        let mut record = ByteRecord::new();
        let mut rows = Vec::new();
        let mut failures = ParseFailures::default();

        loop {
            match rdr.read_byte_record(&mut record).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    failures.push(None, e.to_string());
                    break;
                }
            }

            let fields = match decode_fields(&record) {
                Ok(fields) => fields,
                Err(message) => {
                    let line = failures.has_room().then(|| self.line_of(text, &record));
                    failures.push(line, message);
                    continue;
                }
            };
            if fields.iter().all(|f| f.trim().is_empty()) {
                continue;
            }

            match &self.header {
                None => self.header = Some(build_header(fields)),
                Some(header) => rows.push(TableRow::from_fields(header.clone(), fields)),
            }
        }

        self.lines_consumed += split::count_line_breaks(text, self.after_cr);
        if let Some(&last) = text.last() {
            self.after_cr = last == b'\r';
        }

        match failures.into_error() {
            Some(err) => Err(err),
            None => Ok(rows),
        }
    }

    /// Physical line (1-based, across calls) on which `record` starts.
    fn line_of(&self, text: &[u8], record: &ByteRecord) -> u64 {
        let mut start = record
            .position()
            .map_or(0, |p| p.byte() as usize)
            .min(text.len());
        // blank lines the reader skipped on its way to this record
        while matches!(text.get(start), Some(b'\n' | b'\r')) {
            start += 1;
        }
        self.lines_consumed + 1 + split::count_line_breaks(&text[..start], self.after_cr)
    }

    /// Append `chunk` to the carried text, parse everything up to the last
    /// record boundary and carry the rest forward.
    pub async fn feed(&mut self, chunk: &[u8], max_record_bytes: u64) -> TableResult<Vec<TableRow>> {
        let mut buffer = std::mem::take(&mut self.carry);
        buffer.extend_from_slice(chunk);

        let rows = match split::find_safe_split(&buffer) {
            Some(idx) => {
                let rest = buffer.split_off(idx + 1);
                let rows = self.assemble(&buffer).await?;
                self.carry = rest;
                rows
            }
            None => {
                self.carry = buffer;
                Vec::new()
            }
        };

        if self.carry.len() as u64 > max_record_bytes {
            return Err(LoadError::parse_failed(format!(
                "record exceeds {max_record_bytes} bytes without a line break"
            ))
            .with("step", "parse")
            .with("row", self.next_line()));
        }
        Ok(rows)
    }

    /// Parse whatever is still carried once the stream is exhausted.
    pub async fn finish(&mut self) -> TableResult<Vec<TableRow>> {
        let carry = std::mem::take(&mut self.carry);
        if carry.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        if split::scan(&carry).open_quote {
            return Err(LoadError::parse_failed("unterminated quoted field at end of input")
                .with("step", "parse")
                .with("row", self.next_line()));
        }
        self.assemble(&carry).await
    }
}

fn decode_fields(record: &ByteRecord) -> Result<Vec<String>, String> {
    record
        .iter()
        .enumerate()
        .map(|(idx, field)| {
            std::str::from_utf8(field)
                .map(str::to_string)
                .map_err(|e| format!("field {} is not valid UTF-8 ({e})", idx + 1))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(row: &TableRow) -> Vec<(String, String)> {
        row.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn first_line_is_header_and_rows_map_by_position() {
        let mut state = ParseState::new();
        let rows = state.assemble(b" a , b ,c\n1,2,3\n4\n5,6,7,8\n").await.unwrap();
        assert_eq!(state.header().unwrap(), &["a", "b", "c"]);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].get("c"), Some("3"));
        assert_eq!(
            pairs(&rows[1]),
            vec![
                ("a".into(), "4".into()),
                ("b".into(), String::new()),
                ("c".into(), String::new())
            ]
        );
        assert_eq!(rows[2].values(), &["5", "6", "7"]);
    }

    #[tokio::test]
    async fn blank_lines_and_empty_records_are_skipped() {
        let mut state = ParseState::new();
        let rows = state.assemble(b"\n\na,b\n\n , \n1,2\n,\n").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("b"), Some("2"));
    }

    #[tokio::test]
    async fn header_survives_later_header_shaped_lines() {
        let mut state = ParseState::new();
        state.assemble(b"a,b\n1,2\n").await.unwrap();
        let rows = state.assemble(b"x,y\n3,4\n").await.unwrap();
        assert_eq!(state.header().unwrap(), &["a", "b"]);
        assert_eq!(rows[0].get("a"), Some("x"));
        assert_eq!(rows[1].get("b"), Some("4"));
    }

    #[test]
    fn header_names_are_normalised() {
        let header = build_header(vec![
            "\u{feff}id".into(),
            " ".into(),
            "name".into(),
            "name".into(),
        ]);
        assert_eq!(&*header, &["id", "column_2", "name", "name_2"]);
    }

    #[tokio::test]
    async fn invalid_utf8_fails_with_line_numbers() {
        let mut state = ParseState::new();
        let err = state
            .assemble(b"a,b\n1,2\n3,\xff\xfe\n")
            .await
            .unwrap_err();
        assert_eq!(err.reason(), crate::ReasonCode::ParseFailed);
        assert_eq!(err.context_value("lines"), Some("3"));
    }

    #[tokio::test]
    async fn line_numbers_follow_cr_and_crlf_terminators() {
        let mut state = ParseState::new();
        let err = state.assemble(b"a,b\r1,2\r3,\xff\r").await.unwrap_err();
        assert_eq!(err.context_value("lines"), Some("3"));

        let mut state = ParseState::new();
        let err = state
            .assemble(b"a\r\n\r\n1\r\n\xff\r\n")
            .await
            .unwrap_err();
        assert_eq!(err.context_value("lines"), Some("4"));
    }

    #[tokio::test]
    async fn line_numbers_span_a_crlf_split_between_calls() {
        let mut state = ParseState::new();
        state.assemble(b"a\r\n1\r").await.unwrap();
        let err = state.assemble(b"\n\xff\n").await.unwrap_err();
        assert_eq!(err.context_value("lines"), Some("3"));
        assert!(err.message().contains("line 3: field 1"));
    }

    #[tokio::test]
    async fn line_numbers_count_newlines_inside_quotes() {
        let mut state = ParseState::new();
        let err = state
            .assemble(b"a,b\n\"x\ny\",1\n2,\xff\n")
            .await
            .unwrap_err();
        assert_eq!(err.context_value("lines"), Some("4"));
    }

    #[tokio::test]
    async fn parse_errors_are_capped() {
        let mut state = ParseState::new();
        let err = state
            .assemble(b"a\n\xff\n\xff\n\xff\n\xff\n\xff\n")
            .await
            .unwrap_err();
        assert!(err.message().starts_with("5 record(s)"));
        assert_eq!(err.context_value("lines"), Some("2,3,4"));
    }

    #[tokio::test]
    async fn feed_carries_partial_quoted_record() {
        let mut state = ParseState::new();
        let rows = state.feed(b"a,b\n1,\"x\n", 1024).await.unwrap();
        assert!(rows.is_empty());
        assert_eq!(state.carry(), b"1,\"x\n");

        let rows = state.feed(b"y\"\n2,", 1024).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("b"), Some("x\ny"));

        let rows = state.finish().await.unwrap();
        assert_eq!(rows[0].get("a"), Some("2"));
        assert_eq!(rows[0].get("b"), Some(""));
    }

    #[tokio::test]
    async fn unterminated_quote_at_eof_fails() {
        let mut state = ParseState::new();
        state.feed(b"a,b\n1,\"never closed", 1024).await.unwrap();
        let err = state.finish().await.unwrap_err();
        assert_eq!(err.reason(), crate::ReasonCode::ParseFailed);
        assert_eq!(err.context_value("row"), Some("2"));
    }

    #[tokio::test]
    async fn oversized_record_fails() {
        let mut state = ParseState::new();
        let err = state.feed(b"a\n\"0123456789abcdef", 8).await.unwrap_err();
        assert_eq!(err.reason(), crate::ReasonCode::ParseFailed);
    }
}
