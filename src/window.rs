//! Window Controller: drives the fetcher, splitter and row assembler until
//! the requested row window is covered or the resource is exhausted.
//!
//! The loop is an explicit state machine:
//!
//! ```text
//! Probing -> Fetching -> { Fetching, Done, Failed }
//! ```
//!
//! Each byte window is fully parsed before the next one is requested, since
//! the carried text must be applied in file order. A transient failure deep
//! into a scan retries the same window; it never restarts from byte 0.

use std::borrow::Cow;

use serde::Serialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::codec::Transcoder;
use crate::config::LoaderConfig;
use crate::error::{LoadError, TableResult};
use crate::fetch::{ProbeInfo, RangeFetcher, RangeOutcome};
use crate::format::charset_from_content_type;
use crate::rows::{ParseState, TableRow};
use crate::source::path_basename;
use crate::transport::ByteWindow;

/// Read-only counters surfaced with every remote load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub scanned_rows: u64,
    pub returned_rows: u64,
    pub bytes_fetched_total: u64,
    pub range_request_count: u32,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub used_range: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl Diagnostics {
    pub fn add_warning(&mut self, message: &str) {
        match &mut self.warning {
            Some(existing) => {
                existing.push_str("; ");
                existing.push_str(message);
            }
            None => self.warning = Some(message.to_string()),
        }
    }
}

/// Requested row slice `[offset, offset + count)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowWindow {
    pub offset: u64,
    pub count: u64,
}

impl RowWindow {
    /// `count` has a floor of 1.
    pub fn new(offset: u64, count: u64) -> Self {
        Self {
            offset,
            count: count.max(1),
        }
    }

    /// Rows that must be scanned to cover the window.
    pub fn target(&self) -> u64 {
        self.offset.saturating_add(self.count)
    }

    pub fn contains(&self, index: u64) -> bool {
        index >= self.offset && index < self.target()
    }

    /// Take the window out of a fully materialised row list.
    pub fn slice(&self, rows: Vec<TableRow>) -> Vec<TableRow> {
        let offset = usize::try_from(self.offset).unwrap_or(usize::MAX);
        let count = usize::try_from(self.count).unwrap_or(usize::MAX);
        rows.into_iter().skip(offset).take(count).collect()
    }
}

/// Limits of one scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanLimits {
    pub chunk_size: u64,
    pub max_content_length: Option<u64>,
    pub max_record_bytes: u64,
}

impl ScanLimits {
    pub fn from_config(config: &LoaderConfig) -> Self {
        Self {
            chunk_size: config.chunk_size(),
            max_content_length: config.max_content_length,
            max_record_bytes: config.max_record_bytes,
        }
    }
}

#[derive(Debug)]
pub struct ScanOutput {
    pub rows: Vec<TableRow>,
    pub diagnostics: Diagnostics,
}

enum ScanState {
    Probing,
    Fetching { window: ByteWindow },
    Done { exhausted: bool },
    Failed(LoadError),
}

/// One ranged CSV scan. Owns its parse state and counters; nothing is shared
/// with other scans.
pub struct WindowScan<'a> {
    fetcher: &'a RangeFetcher,
    url: &'a Url,
    request: RowWindow,
    limits: ScanLimits,
    // Some when the caller already ran the HEAD probe.
    prior_probe: Option<Option<ProbeInfo>>,
    parse: ParseState,
    transcoder: Option<Transcoder>,
    bytes_ingested: u64,
    rows: Vec<TableRow>,
    diag: Diagnostics,
}

impl<'a> WindowScan<'a> {
    pub fn new(
        fetcher: &'a RangeFetcher,
        url: &'a Url,
        request: RowWindow,
        limits: ScanLimits,
    ) -> Self {
        Self {
            fetcher,
            url,
            request,
            limits,
            prior_probe: None,
            parse: ParseState::new(),
            transcoder: None,
            bytes_ingested: 0,
            rows: Vec::new(),
            diag: Diagnostics::default(),
        }
    }

    /// Reuse a probe result instead of issuing another HEAD.
    #[must_use]
    pub fn with_probe(mut self, probe: Option<ProbeInfo>) -> Self {
        self.prior_probe = Some(probe);
        self
    }

    pub async fn run(mut self) -> TableResult<ScanOutput> {
        let mut state = ScanState::Probing;
        loop {
            state = match state {
                ScanState::Probing => self.probe().await,
                ScanState::Fetching { window } => self.fetch(window).await,
                ScanState::Done { exhausted } => match self.finish(exhausted).await {
                    Ok(()) => break,
                    Err(e) => ScanState::Failed(e),
                },
                ScanState::Failed(err) => {
                    self.diag.returned_rows = self.rows.len() as u64;
                    warn!(
                        reason = %err.reason(),
                        scanned_rows = self.diag.scanned_rows,
                        "windowed load failed"
                    );
                    let err = self.with_location(err);
                    return Err(err.with_diagnostics(self.diag));
                }
            };
        }

        self.diag.returned_rows = self.rows.len() as u64;
        info!(
            scanned_rows = self.diag.scanned_rows,
            returned_rows = self.diag.returned_rows,
            bytes_fetched = self.diag.bytes_fetched_total,
            range_requests = self.diag.range_request_count,
            used_range = self.diag.used_range,
            "windowed load complete"
        );
        Ok(ScanOutput {
            rows: self.rows,
            diagnostics: self.diag,
        })
    }

    fn with_location(&self, err: LoadError) -> LoadError {
        err.with("host", self.url.host_str().unwrap_or("?"))
            .with("path", path_basename(self.url))
    }

    fn note_content_type(&mut self, content_type: Option<String>) {
        if self.diag.content_type.is_some() {
            return;
        }
        if let Some(ct) = content_type {
            // Charset can only be switched before any byte was decoded.
            if self.bytes_ingested == 0 {
                self.transcoder = charset_from_content_type(&ct).and_then(Transcoder::for_label);
            }
            self.diag.content_type = Some(ct);
        }
    }

    /// `TOO_LARGE` once the resource size is known and above the limit,
    /// whichever response revealed it.
    fn over_size_limit(&self, step: &'static str) -> Option<LoadError> {
        let max = self.limits.max_content_length?;
        let len = self.diag.content_length?;
        (len > max).then(|| {
            LoadError::too_large(format!("resource is {len} bytes, limit is {max}"))
                .with("step", step)
                .with("content_length", len)
        })
    }

    async fn probe(&mut self) -> ScanState {
        let probe = match self.prior_probe.take() {
            Some(probe) => probe,
            None => self.fetcher.probe(self.url).await,
        };
        if let Some(info) = probe {
            self.diag.content_length = info.content_length;
            self.note_content_type(info.content_type);
        }

        if let Some(err) = self.over_size_limit("probe") {
            return ScanState::Failed(err);
        }

        ScanState::Fetching {
            window: ByteWindow::first(self.limits.chunk_size),
        }
    }

    async fn fetch(&mut self, window: ByteWindow) -> ScanState {
        let outcome = match self
            .fetcher
            .fetch_range(self.url, window, self.diag.content_length, &mut self.diag)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => return ScanState::Failed(e),
        };

        match outcome {
            RangeOutcome::EndOfStream => {
                self.diag.used_range = true;
                debug!(byte_start = window.start, "range not satisfiable, end of stream");
                ScanState::Done { exhausted: true }
            }
            RangeOutcome::WholeBody { body, content_type } => {
                self.diag.used_range = false;
                self.diag
                    .add_warning("server ignored Range; the whole body was parsed as one chunk");
                warn!(bytes = body.len(), host = ?self.url.host_str(), "range ignored by server, using full body");
                self.note_content_type(content_type);
                if self.diag.content_length.is_none() {
                    self.diag.content_length = Some(body.len() as u64);
                }
                if let Some(err) = self.over_size_limit("range") {
                    return ScanState::Failed(err);
                }
                match self.ingest(&body, window).await {
                    Ok(()) => ScanState::Done { exhausted: true },
                    Err(e) => ScanState::Failed(e),
                }
            }
            RangeOutcome::Partial {
                body,
                total_length,
                content_type,
            } => {
                self.diag.used_range = true;
                if self.diag.content_length.is_none() {
                    self.diag.content_length = total_length;
                }
                if let Some(err) = self.over_size_limit("range") {
                    return ScanState::Failed(err);
                }
                self.note_content_type(content_type);
                if body.is_empty() {
                    return ScanState::Done { exhausted: true };
                }
                if let Err(e) = self.ingest(&body, window).await {
                    return ScanState::Failed(e);
                }

                let exhausted = (body.len() as u64) < window.len()
                    || total_length.is_some_and(|total| window.end + 1 >= total);
                if exhausted {
                    ScanState::Done { exhausted: true }
                } else if self.diag.scanned_rows >= self.request.target() {
                    ScanState::Done { exhausted: false }
                } else {
                    ScanState::Fetching {
                        window: window.next(),
                    }
                }
            }
        }
    }

    async fn ingest(&mut self, body: &[u8], window: ByteWindow) -> TableResult<()> {
        self.bytes_ingested += body.len() as u64;
        let text: Cow<'_, [u8]> = match &mut self.transcoder {
            Some(t) => Cow::Owned(t.transcode(body, false)),
            None => Cow::Borrowed(body),
        };
        let rows = self
            .parse
            .feed(&text, self.limits.max_record_bytes)
            .await
            .map_err(|e| e.with("byte_start", window.start).with("byte_end", window.end))?;
        debug!(
            byte_start = window.start,
            byte_end = window.end,
            rows = rows.len(),
            carry = self.parse.carry().len(),
            "chunk parsed"
        );
        self.accept(rows);
        Ok(())
    }

    async fn finish(&mut self, exhausted: bool) -> TableResult<()> {
        if !exhausted {
            return Ok(());
        }
        if let Some(t) = &mut self.transcoder {
            let tail = t.transcode(&[], true);
            if !tail.is_empty() {
                let rows = self.parse.feed(&tail, self.limits.max_record_bytes).await?;
                self.accept(rows);
            }
        }
        let rows = self.parse.finish().await?;
        self.accept(rows);
        Ok(())
    }

    fn accept(&mut self, rows: Vec<TableRow>) {
        for row in rows {
            if self.request.contains(self.diag.scanned_rows) {
                self.rows.push(row);
            }
            self.diag.scanned_rows += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Injected, MemoryTransport};
    use crate::ReasonCode;
    use std::sync::Arc;

    const SCENARIO: &[u8] = b"a,b\n1,2\n3,\"x\ny\"\n5,6\n";

    fn limits(chunk_size: u64) -> ScanLimits {
        ScanLimits {
            chunk_size,
            max_content_length: None,
            max_record_bytes: 1024,
        }
    }

    async fn scan(
        transport: MemoryTransport,
        chunk_size: u64,
        offset: u64,
        count: u64,
    ) -> (TableResult<ScanOutput>, Arc<MemoryTransport>) {
        let transport = Arc::new(transport);
        let fetcher = RangeFetcher::new(transport.clone(), &LoaderConfig::default());
        let url = Url::parse("https://data.example.com/tables/plans.csv").unwrap();
        let out = WindowScan::new(&fetcher, &url, RowWindow::new(offset, count), limits(chunk_size))
            .run()
            .await;
        (out, transport)
    }

    fn values(rows: &[TableRow]) -> Vec<Vec<String>> {
        rows.iter().map(|r| r.values().to_vec()).collect()
    }

    #[tokio::test]
    async fn scenario_is_stable_for_every_chunk_size() {
        for chunk in 1..=(SCENARIO.len() as u64 + 2) {
            let (out, _) = scan(MemoryTransport::new(SCENARIO), chunk, 1, 2).await;
            let out = out.unwrap();
            assert_eq!(
                values(&out.rows),
                vec![vec!["3".to_string(), "x\ny".to_string()], vec!["5".into(), "6".into()]],
                "chunk size {chunk}"
            );
            // data rows only; the header line is not a scanned row
            assert_eq!(out.diagnostics.scanned_rows, 3, "chunk size {chunk}");
            assert_eq!(out.diagnostics.returned_rows, 2);
            assert!(out.diagnostics.used_range);
        }
    }

    #[tokio::test]
    async fn stops_once_target_is_scanned() {
        let mut csv = b"id\n".to_vec();
        for i in 0..100 {
            csv.extend_from_slice(format!("{i}\n").as_bytes());
        }
        let (out, transport) = scan(MemoryTransport::new(csv.clone()), 16, 0, 3).await;
        let out = out.unwrap();
        assert_eq!(values(&out.rows), vec![vec!["0"], vec!["1"], vec!["2"]]);
        // First window holds "id\n0\n1\n2\n3\n4\n5\n": one request is enough.
        assert_eq!(transport.get_windows().len(), 1);
        assert!(out.diagnostics.bytes_fetched_total < csv.len() as u64);
    }

    #[tokio::test]
    async fn offset_beyond_end_returns_nothing() {
        let (out, _) = scan(MemoryTransport::new(SCENARIO), 5, 10, 5).await;
        let out = out.unwrap();
        assert!(out.rows.is_empty());
        assert_eq!(out.diagnostics.scanned_rows, 3);
    }

    #[tokio::test]
    async fn final_line_without_newline_is_parsed() {
        let (out, _) = scan(MemoryTransport::new(&b"a,b\n1,2\n3,4"[..]), 4, 0, 10).await;
        let out = out.unwrap();
        assert_eq!(values(&out.rows), vec![vec!["1", "2"], vec!["3", "4"]]);
    }

    #[tokio::test]
    async fn header_is_kept_when_later_chunk_starts_with_header_shaped_line() {
        let (out, _) = scan(MemoryTransport::new(&b"a,b\n1,2\nc,d\n3,4\n"[..]), 8, 0, 10).await;
        let out = out.unwrap();
        assert_eq!(out.rows[1].get("a"), Some("c"));
        assert_eq!(out.rows[1].get("b"), Some("d"));
        assert!(out.rows.iter().all(|r| r.columns() == ["a", "b"]));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_resumes_from_the_failed_window() {
        let transport = MemoryTransport::new(SCENARIO).fail_get(2, Injected::Status(503));
        let (out, transport) = scan(transport, 4, 0, 10).await;
        let out = out.unwrap();
        assert_eq!(out.diagnostics.scanned_rows, 3);

        let windows: Vec<ByteWindow> = transport.get_windows().into_iter().flatten().collect();
        assert_eq!(windows[1], ByteWindow { start: 4, end: 7 });
        assert_eq!(windows[2], ByteWindow { start: 8, end: 11 });
        assert_eq!(windows[3], ByteWindow { start: 8, end: 11 });
        assert_eq!(windows.iter().filter(|w| w.start == 0).count(), 1);
        let starts: Vec<u64> = windows.iter().map(|w| w.start).collect();
        assert!(starts.windows(2).all(|p| p[0] <= p[1]));
    }

    #[tokio::test]
    async fn parse_failure_carries_diagnostics() {
        let (out, _) = scan(MemoryTransport::new(&b"a,b\n1,\"open\n"[..]), 64, 0, 10).await;
        let err = out.unwrap_err();
        assert_eq!(err.reason(), ReasonCode::ParseFailed);
        assert_eq!(err.context_value("host"), Some("data.example.com"));
        let diag = err.diagnostics().unwrap();
        assert_eq!(diag.bytes_fetched_total, 12);
        assert_eq!(diag.range_request_count, 1);
    }

    #[tokio::test]
    async fn known_size_above_limit_is_too_large() {
        let transport = Arc::new(MemoryTransport::new(SCENARIO));
        let fetcher = RangeFetcher::new(transport.clone(), &LoaderConfig::default());
        let url = Url::parse("https://data.example.com/plans.csv").unwrap();
        let mut lim = limits(8);
        lim.max_content_length = Some(10);
        let err = WindowScan::new(&fetcher, &url, RowWindow::new(0, 1), lim)
            .run()
            .await
            .unwrap_err();
        assert_eq!(err.reason(), ReasonCode::TooLarge);
        assert!(transport.get_windows().is_empty());
    }

    #[tokio::test]
    async fn size_from_content_range_is_checked_without_head() {
        let body = b"id,name\n".repeat(600);
        let transport = Arc::new(MemoryTransport::new(body).without_head());
        let fetcher = RangeFetcher::new(transport.clone(), &LoaderConfig::default());
        let url = Url::parse("https://data.example.com/plans.csv").unwrap();
        let mut lim = limits(64);
        lim.max_content_length = Some(1024);
        let err = WindowScan::new(&fetcher, &url, RowWindow::new(0, 1), lim)
            .run()
            .await
            .unwrap_err();
        assert_eq!(err.reason(), ReasonCode::TooLarge);
        assert_eq!(err.context_value("step"), Some("range"));
        assert_eq!(err.context_value("content_length"), Some("4800"));
        assert_eq!(transport.get_windows().len(), 1);
    }

    #[tokio::test]
    async fn whole_body_fallback_is_checked_against_limit() {
        let body = b"id,name\n".repeat(600);
        let transport = Arc::new(MemoryTransport::new(body).without_head().ignoring_range());
        let fetcher = RangeFetcher::new(transport.clone(), &LoaderConfig::default());
        let url = Url::parse("https://data.example.com/plans.csv").unwrap();
        let mut lim = limits(64);
        lim.max_content_length = Some(1024);
        let err = WindowScan::new(&fetcher, &url, RowWindow::new(0, 1), lim)
            .run()
            .await
            .unwrap_err();
        assert_eq!(err.reason(), ReasonCode::TooLarge);
        assert_eq!(err.diagnostics().unwrap().content_length, Some(4800));
    }

    #[tokio::test]
    async fn non_utf8_charset_is_transcoded_across_chunks() {
        let text = "name,city\nZoë,Malmö\n";
        let encoded: Vec<u8> = text.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        let transport =
            MemoryTransport::new(encoded).with_content_type("text/csv; charset=utf-16le");
        let (out, _) = scan(transport, 3, 0, 5).await;
        let out = out.unwrap();
        assert_eq!(out.rows[0].get("name"), Some("Zoë"));
        assert_eq!(out.rows[0].get("city"), Some("Malmö"));
    }

    #[test]
    fn row_window_bounds() {
        let w = RowWindow::new(5, 0);
        assert_eq!(w.count, 1);
        assert!(w.contains(5));
        assert!(!w.contains(6));
        assert_eq!(RowWindow::new(u64::MAX, 3).target(), u64::MAX);
    }
}
