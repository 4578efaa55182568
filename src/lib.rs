//! Windowed loading of large remote tables.
//!
//! - Remote CSV: HTTP byte-range requests, chunk by chunk, stopping as soon
//!   as the requested row window `[offset, offset + count)` is covered.
//! - Remote JSON, local files and inline JSON: read whole, then sliced.
//!
//! Data shape:
//! - `LoadResult { format, rows, diagnostics }`
//! - `TableRow`: column name -> string value, same columns for every row of a load
//!
//! Errors are `LoadError`: a `ReasonCode` with an HTTP-style status plus a
//! structured context map (host, path basename, step, byte range, row).
#![cfg_attr(docsrs, feature(doc_cfg))]
//
mod codec;
pub mod config;
pub mod document;
mod error;
pub mod fetch;
mod format;
pub mod io;
mod rows;
mod source;
pub mod split;
pub mod transport;
pub mod window;

pub use crate::codec::Transcoder;
pub use crate::config::{LoaderConfig, RetryPolicy};
pub use crate::error::{LoadError, ReasonCode, TableResult};
pub use crate::format::{
    charset_from_content_type, format_from_content_type, format_from_name, resolve_format,
    TableFormat,
};
pub use crate::rows::{ParseState, TableRow};
pub use crate::source::{path_basename, Source, SourceCatalog};
pub use crate::transport::{HttpTransport, MemoryTransport, Transport};
pub use crate::window::{Diagnostics, RowWindow};

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, info_span, Instrument};
use url::Url;

use crate::fetch::{ProbeInfo, RangeFetcher};
use crate::io::Compression;
use crate::window::{ScanLimits, WindowScan};

/// A remote resource read whole rather than range-scanned.
struct RemoteDocument<'a> {
    url: &'a Url,
    format: TableFormat,
    compression: Compression,
    probe: Option<ProbeInfo>,
}

/// Rows of one window plus what it took to get them.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadResult {
    pub format: TableFormat,
    pub rows: Vec<TableRow>,
    /// Absent for inline documents, where nothing was fetched or read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<Diagnostics>,
    pub request_id: String,
}

impl LoadResult {
    fn materialized(
        format: TableFormat,
        all_rows: Vec<TableRow>,
        request: RowWindow,
        diagnostics: Option<Diagnostics>,
        request_id: &str,
    ) -> Self {
        let total = all_rows.len() as u64;
        let rows = request.slice(all_rows);
        let diagnostics = diagnostics.map(|mut d| {
            d.scanned_rows = total;
            d.returned_rows = rows.len() as u64;
            d
        });
        Self {
            format,
            rows,
            diagnostics,
            request_id: request_id.to_string(),
        }
    }
}

/// Loads row windows using one configuration and one transport.
///
/// Cheap to share: every call owns its parse state and counters, so
/// concurrent loads do not interact.
pub struct TableLoader {
    config: LoaderConfig,
    fetcher: RangeFetcher,
}

impl TableLoader {
    /// Loader over HTTP (reqwest).
    pub fn new(config: LoaderConfig) -> TableResult<Self> {
        let transport = HttpTransport::new()?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    pub fn with_transport(config: LoaderConfig, transport: Arc<dyn Transport>) -> Self {
        let fetcher = RangeFetcher::new(transport, &config);
        Self { config, fetcher }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Load rows `[offset, offset + count)` of `source`.
    ///
    /// `count` is clamped to `[1, max_window_rows]`.
    pub async fn load(&self, source: &Source, offset: u64, count: u64) -> TableResult<LoadResult> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let request = RowWindow::new(offset, self.config.clamp_count(count));
        let span = info_span!(
            "load_table_window",
            request_id = %request_id,
            source = %source.label(),
            offset = request.offset,
            count = request.count,
        );

        async {
            match source {
                Source::Remote(url) => self.load_remote(url, request, &request_id).await,
                Source::Local(path) => self.load_local(path, request, &request_id).await,
                Source::Inline(text) => document::parse_json_rows(text.as_bytes()).map(|rows| {
                    LoadResult::materialized(TableFormat::Json, rows, request, None, &request_id)
                }),
            }
        }
        .instrument(span)
        .await
        .map_err(|e| e.with_request_id(request_id.clone()))
    }

    /// Resolve `table` through `catalog`, then [`TableLoader::load`] it.
    pub async fn load_named(
        &self,
        catalog: &SourceCatalog,
        table: &str,
        offset: u64,
        count: u64,
    ) -> TableResult<LoadResult> {
        let source = catalog.resolve(table)?;
        self.load(&source, offset, count).await
    }

    async fn load_remote(
        &self,
        url: &Url,
        request: RowWindow,
        request_id: &str,
    ) -> TableResult<LoadResult> {
        let (compression, stem) = Compression::split_name(url.path());

        // HEAD only when the path suffix leaves the format open; the CSV scan
        // reuses whatever it learned. A compressed resource must name its
        // format, since its content type describes the compression.
        let probe = match format_from_name(stem) {
            None if !compression.is_compressed() => Some(self.fetcher.probe(url).await),
            _ => None,
        };
        let probed_type = probe
            .as_ref()
            .and_then(|p| p.as_ref())
            .and_then(|info| info.content_type.as_deref());

        let format = match compression {
            Compression::None => resolve_format(url, probed_type),
            _ => format_from_name(stem),
        };
        let format = format.ok_or_else(|| {
            LoadError::unsupported_format("could not tell CSV from JSON by path or content type")
                .with("step", "resolve")
                .with("host", url.host_str().unwrap_or("?"))
                .with("path", path_basename(url))
                .with("content_type", probed_type.unwrap_or("none"))
        })?;

        match format {
            TableFormat::Csv if !compression.is_compressed() => {
                let mut scan =
                    WindowScan::new(&self.fetcher, url, request, ScanLimits::from_config(&self.config));
                if let Some(probe) = probe {
                    scan = scan.with_probe(probe);
                }
                let out = scan.run().await?;
                Ok(LoadResult {
                    format,
                    rows: out.rows,
                    diagnostics: Some(out.diagnostics),
                    request_id: request_id.to_string(),
                })
            }
            _ => {
                let doc = RemoteDocument {
                    url,
                    format,
                    compression,
                    probe: probe.flatten(),
                };
                self.load_remote_document(doc, request, request_id).await
            }
        }
    }

    /// Whole-document path: remote JSON and any compressed resource. Compressed
    /// bytes cannot be cut at record boundaries, so they are never range-scanned.
    async fn load_remote_document(
        &self,
        doc: RemoteDocument<'_>,
        request: RowWindow,
        request_id: &str,
    ) -> TableResult<LoadResult> {
        let url = doc.url;
        let mut diag = Diagnostics::default();
        if let Some(info) = doc.probe {
            diag.content_type = info.content_type;
            diag.content_length = info.content_length;
        }

        let located = |err: LoadError, diag: &Diagnostics| {
            err.with("host", url.host_str().unwrap_or("?"))
                .with("path", path_basename(url))
                .with_diagnostics(diag.clone())
        };

        if let (Some(max), Some(len)) = (self.config.max_content_length, diag.content_length) {
            if len > max {
                let err = LoadError::too_large(format!("resource is {len} bytes, limit is {max}"))
                    .with("step", "probe")
                    .with("content_length", len);
                return Err(located(err, &diag));
            }
        }

        // Without a HEAD the resource size is only learned from the GET, so
        // the content-length limit also caps the body.
        let cap = self
            .config
            .max_content_length
            .map_or(self.config.max_document_bytes, |max| {
                max.min(self.config.max_document_bytes)
            });
        let (head, body) = match self.fetcher.fetch_document(url, cap, &mut diag).await {
            Ok(fetched) => fetched,
            Err(err) => return Err(located(err, &diag)),
        };
        if diag.content_type.is_none() {
            diag.content_type = head.content_type;
        }
        if diag.content_length.is_none() {
            diag.content_length = Some(head.content_length.unwrap_or(body.len() as u64));
        }

        let body = if doc.compression.is_compressed() {
            let charset = diag
                .content_type
                .as_deref()
                .and_then(charset_from_content_type)
                .and_then(|label| encoding_rs::Encoding::for_label(label.as_bytes()))
                .unwrap_or(encoding_rs::UTF_8);
            let decoded = io::decode_body(
                body,
                doc.compression,
                charset,
                self.config.max_document_bytes,
                path_basename(url),
            )
            .await;
            match decoded {
                Ok(decoded) => bytes::Bytes::from(decoded),
                Err(err) => return Err(located(err, &diag)),
            }
        } else {
            body
        };

        let rows = match document::parse_document(doc.format, &body).await {
            Ok(rows) => rows,
            Err(err) => return Err(located(err, &diag)),
        };
        let result = LoadResult::materialized(doc.format, rows, request, Some(diag), request_id);
        info!(
            scanned_rows = result.diagnostics.as_ref().map_or(0, |d| d.scanned_rows),
            returned_rows = result.rows.len(),
            "document load complete"
        );
        Ok(result)
    }

    async fn load_local(
        &self,
        path: &Path,
        request: RowWindow,
        request_id: &str,
    ) -> TableResult<LoadResult> {
        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        let (_, stem) = Compression::split_name(name);
        let format = format_from_name(stem).ok_or_else(|| {
            LoadError::unsupported_format("local file is neither .csv nor .json")
                .with("step", "resolve")
                .with("path", name)
        })?;

        let bytes = io::read_local(
            path,
            self.config.local_encoding(),
            self.config.max_document_bytes,
        )
        .await?;

        let diag = Diagnostics {
            content_type: Some(format.mime().to_string()),
            content_length: Some(bytes.len() as u64),
            bytes_fetched_total: bytes.len() as u64,
            ..Diagnostics::default()
        };
        let rows = document::parse_document(format, &bytes)
            .await
            .map_err(|e| e.with("path", name).with_diagnostics(diag.clone()))?;

        let result = LoadResult::materialized(format, rows, request, Some(diag), request_id);
        info!(returned_rows = result.rows.len(), "local load complete");
        Ok(result)
    }
}

/// One-shot load with configuration taken from `TABLE_WINDOW_*` variables.
///
/// An unusable environment is reported as `NOT_CONFIGURED`.
pub async fn load_table_window(source: &Source, offset: u64, count: u64) -> TableResult<LoadResult> {
    let config = LoaderConfig::from_env().map_err(|e| {
        LoadError::not_configured(format!("invalid loader configuration: {e:#}"))
            .with("step", "config")
    })?;
    TableLoader::new(config)?.load(source, offset, count).await
}
