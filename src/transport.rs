//! HTTP transport seam.
//!
//! The fetcher talks to a [`Transport`] rather than to reqwest directly so the
//! retry and range logic can be exercised against [`MemoryTransport`]. The
//! transport reports raw status and headers; classification, retries and
//! timeouts live in [`crate::fetch`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE};
use thiserror::Error;
use url::Url;

use crate::error::{LoadError, TableResult};

/// Inclusive byte range `start..=end`, as sent in a `Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteWindow {
    pub start: u64,
    pub end: u64,
}

impl ByteWindow {
    /// First window of `size` bytes (`size` must be non-zero).
    pub fn first(size: u64) -> Self {
        Self {
            start: 0,
            end: size.max(1) - 1,
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// The adjacent window of the same size.
    pub fn next(&self) -> Self {
        let len = self.len();
        Self {
            start: self.end + 1,
            end: self.end + len,
        }
    }

    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// Status line and the headers the loader cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub content_range: Option<String>,
}

impl ResponseHead {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Total resource size from `Content-Range: bytes a-b/total`.
    pub fn total_length(&self) -> Option<u64> {
        let value = self.content_range.as_deref()?;
        let (_, total) = value.rsplit_once('/')?;
        total.trim().parse().ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("network error: {0}")]
    Network(String),
}

pub type BodyStream = BoxStream<'static, Result<Bytes, TransportError>>;

pub struct TransportResponse {
    pub head: ResponseHead,
    pub body: BodyStream,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn head(&self, url: &Url) -> Result<ResponseHead, TransportError>;

    /// GET `url`, restricted to `range` when given.
    async fn get(
        &self,
        url: &Url,
        range: Option<ByteWindow>,
    ) -> Result<TransportResponse, TransportError>;
}

/// reqwest-backed transport. Timeouts are applied per attempt by the fetcher;
/// only the connect timeout is set on the client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> TableResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("table_window/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                LoadError::not_configured("failed to build HTTP client").with_source(e)
            })?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn classify_reqwest(e: reqwest::Error) -> TransportError {
    // Drop the URL: it may carry signed query parameters.
    let e = e.without_url();
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Network(e.to_string())
    }
}

fn header_str(resp: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn head_of(resp: &reqwest::Response) -> ResponseHead {
    ResponseHead {
        status: resp.status().as_u16(),
        content_type: header_str(resp, CONTENT_TYPE),
        content_length: header_str(resp, CONTENT_LENGTH).and_then(|v| v.trim().parse().ok()),
        content_range: header_str(resp, CONTENT_RANGE),
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn head(&self, url: &Url) -> Result<ResponseHead, TransportError> {
        let resp = self
            .client
            .head(url.clone())
            .send()
            .await
            .map_err(classify_reqwest)?;
        Ok(head_of(&resp))
    }

    async fn get(
        &self,
        url: &Url,
        range: Option<ByteWindow>,
    ) -> Result<TransportResponse, TransportError> {
        let mut req = self.client.get(url.clone());
        if let Some(window) = range {
            req = req.header(RANGE, window.header_value());
        }
        let resp = req.send().await.map_err(classify_reqwest)?;
        let head = head_of(&resp);
        let body = resp.bytes_stream().map_err(classify_reqwest).boxed();
        Ok(TransportResponse { head, body })
    }
}

/// Failure injected into a [`MemoryTransport`] GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Injected {
    Status(u16),
    NetworkError,
    /// Never answer; only a timeout gets the caller out.
    Stall,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedRequest {
    Head,
    Get(Option<ByteWindow>),
}

/// In-memory resource served with HTTP range semantics.
///
/// Useful for tests and for serving already-buffered payloads through the
/// same code path as remote ones. Behaviour switches (`ignoring_range`,
/// `without_length`, ...) mimic the server quirks the loader must cope with.
pub struct MemoryTransport {
    data: Bytes,
    content_type: Option<String>,
    honor_range: bool,
    advertise_length: bool,
    head_supported: bool,
    overshoot: usize,
    declared_length: Option<u64>,
    piece_size: usize,
    failures: Mutex<HashMap<usize, Injected>>,
    log: Mutex<Vec<RecordedRequest>>,
}

impl MemoryTransport {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            content_type: None,
            honor_range: true,
            advertise_length: true,
            head_supported: true,
            overshoot: 0,
            declared_length: None,
            piece_size: 8 * 1024,
            failures: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Answer every GET with `200` and the whole body.
    #[must_use]
    pub fn ignoring_range(mut self) -> Self {
        self.honor_range = false;
        self
    }

    /// Omit `Content-Length` from full (`200`) responses and HEAD.
    #[must_use]
    pub fn without_length(mut self) -> Self {
        self.advertise_length = false;
        self
    }

    /// Answer HEAD with `405`.
    #[must_use]
    pub fn without_head(mut self) -> Self {
        self.head_supported = false;
        self
    }

    /// Send `extra` bytes past the end of every `206` window while
    /// `Content-Range` still names the requested range.
    #[must_use]
    pub fn over_sending(mut self, extra: usize) -> Self {
        self.overshoot = extra;
        self
    }

    /// Report `len` as `Content-Length` on full (`200`) responses and HEAD,
    /// whatever the body really holds.
    #[must_use]
    pub fn declaring_length(mut self, len: u64) -> Self {
        self.declared_length = Some(len);
        self
    }

    /// Inject `failure` into the GET with the given 0-based ordinal.
    #[must_use]
    pub fn fail_get(self, ordinal: usize, failure: Injected) -> Self {
        self.lock_failures().insert(ordinal, failure);
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.lock_log().clone()
    }

    /// Windows requested by GETs so far, in order (`None` for unranged GETs).
    pub fn get_windows(&self) -> Vec<Option<ByteWindow>> {
        self.lock_log()
            .iter()
            .filter_map(|r| match r {
                RecordedRequest::Get(w) => Some(*w),
                RecordedRequest::Head => None,
            })
            .collect()
    }

    fn lock_log(&self) -> std::sync::MutexGuard<'_, Vec<RecordedRequest>> {
        self.log.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_failures(&self) -> std::sync::MutexGuard<'_, HashMap<usize, Injected>> {
        self.failures.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn full_length(&self) -> Option<u64> {
        self.declared_length
            .or_else(|| self.advertise_length.then_some(self.data.len() as u64))
    }

    fn body_of(&self, body: Bytes) -> BodyStream {
        let pieces: Vec<Result<Bytes, TransportError>> = (0..body.len())
            .step_by(self.piece_size)
            .map(|at| Ok(body.slice(at..(at + self.piece_size).min(body.len()))))
            .collect();
        stream::iter(pieces).boxed()
    }

    fn respond(&self, head: ResponseHead, body: Bytes) -> TransportResponse {
        TransportResponse {
            head,
            body: self.body_of(body),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn head(&self, _url: &Url) -> Result<ResponseHead, TransportError> {
        self.lock_log().push(RecordedRequest::Head);
        if !self.head_supported {
            return Ok(ResponseHead {
                status: 405,
                ..Default::default()
            });
        }
        Ok(ResponseHead {
            status: 200,
            content_type: self.content_type.clone(),
            content_length: self.full_length(),
            content_range: None,
        })
    }

    async fn get(
        &self,
        _url: &Url,
        range: Option<ByteWindow>,
    ) -> Result<TransportResponse, TransportError> {
        let ordinal = {
            let mut log = self.lock_log();
            log.push(RecordedRequest::Get(range));
            log.iter()
                .filter(|r| matches!(r, RecordedRequest::Get(_)))
                .count()
                - 1
        };

        let injected = self.lock_failures().remove(&ordinal);
        match injected {
            Some(Injected::Status(status)) => {
                return Ok(self.respond(
                    ResponseHead {
                        status,
                        ..Default::default()
                    },
                    Bytes::new(),
                ))
            }
            Some(Injected::NetworkError) => {
                return Err(TransportError::Network("connection reset".to_string()))
            }
            Some(Injected::Stall) => futures::future::pending::<()>().await,
            None => {}
        }

        let total = self.data.len() as u64;
        match range {
            Some(window) if self.honor_range => {
                if window.start >= total {
                    return Ok(self.respond(
                        ResponseHead {
                            status: 416,
                            content_range: Some(format!("bytes */{total}")),
                            ..Default::default()
                        },
                        Bytes::new(),
                    ));
                }
                let end = window.end.min(total - 1);
                let sent_end = (end as usize).saturating_add(self.overshoot).min(total as usize - 1);
                let body = self.data.slice(window.start as usize..=sent_end);
                Ok(self.respond(
                    ResponseHead {
                        status: 206,
                        content_type: self.content_type.clone(),
                        content_length: Some(body.len() as u64),
                        content_range: Some(format!("bytes {}-{}/{}", window.start, end, total)),
                    },
                    body,
                ))
            }
            _ => Ok(self.respond(
                ResponseHead {
                    status: 200,
                    content_type: self.content_type.clone(),
                    content_length: self.full_length(),
                    content_range: None,
                },
                self.data.clone(),
            )),
        }
    }
}
