//! Range Fetcher: HEAD probe, ranged GETs and whole-document GETs with
//! per-attempt timeouts and bounded retries.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tracing::{debug, warn};
use url::Url;

use crate::config::{LoaderConfig, RetryPolicy};
use crate::error::{LoadError, TableResult};
use crate::source::path_basename;
use crate::transport::{BodyStream, ByteWindow, ResponseHead, Transport, TransportError};
use crate::window::Diagnostics;

/// What a best-effort HEAD learned. Absent entirely when the probe failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeInfo {
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
}

/// Classified answer to one ranged GET.
#[derive(Debug)]
pub enum RangeOutcome {
    /// `206`: the next chunk.
    Partial {
        body: Bytes,
        total_length: Option<u64>,
        content_type: Option<String>,
    },
    /// `416`: the window starts past the end of the resource.
    EndOfStream,
    /// `200` with a known size under the fallback ceiling: the whole resource.
    WholeBody {
        body: Bytes,
        content_type: Option<String>,
    },
}

/// Statuses worth another attempt.
pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 502..=504)
}

enum BodyPlan {
    Skip,
    /// Read at most `cap` bytes; past that, fail with `overflow` or truncate when `None`.
    Read {
        cap: u64,
        overflow: Option<LoadError>,
    },
}

enum AttemptError {
    Transport(TransportError),
    Fatal(LoadError),
}

enum Failure {
    Status(u16),
    Transport(TransportError),
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Status(status) => write!(f, "HTTP {status}"),
            Failure::Transport(e) => write!(f, "{e}"),
        }
    }
}

struct Exchange {
    head: ResponseHead,
    body: Option<Bytes>,
}

fn with_url(err: LoadError, url: &Url) -> LoadError {
    err.with("host", url.host_str().unwrap_or("?"))
        .with("path", path_basename(url))
}

fn with_window(err: LoadError, window: Option<ByteWindow>) -> LoadError {
    match window {
        Some(w) => err.with("byte_start", w.start).with("byte_end", w.end),
        None => err,
    }
}

async fn read_body(
    mut body: BodyStream,
    cap: u64,
    overflow: Option<LoadError>,
) -> Result<Bytes, AttemptError> {
    let mut buf = BytesMut::new();
    while let Some(piece) = body.next().await {
        let piece = piece.map_err(AttemptError::Transport)?;
        let room = cap.saturating_sub(buf.len() as u64);
        if piece.len() as u64 > room {
            match overflow {
                Some(err) => return Err(AttemptError::Fatal(err)),
                None => {
                    buf.extend_from_slice(&piece[..room as usize]);
                    break;
                }
            }
        }
        buf.extend_from_slice(&piece);
    }
    Ok(buf.freeze())
}

/// Issues the HTTP requests of one load. Holds no per-operation state: all
/// counters go to the caller's [`Diagnostics`].
#[derive(Clone)]
pub struct RangeFetcher {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    head_timeout: Duration,
    range_timeout: Duration,
    document_timeout: Duration,
    fallback_ceiling: u64,
}

impl RangeFetcher {
    pub fn new(transport: Arc<dyn Transport>, config: &LoaderConfig) -> Self {
        Self {
            transport,
            retry: config.retry.clone(),
            head_timeout: config.head_timeout,
            range_timeout: config.range_timeout,
            document_timeout: config.document_timeout,
            fallback_ceiling: config.range_fallback_ceiling,
        }
    }

    /// Best-effort HEAD. Any failure (network, timeout, non-2xx) is `None`.
    pub async fn probe(&self, url: &Url) -> Option<ProbeInfo> {
        match tokio::time::timeout(self.head_timeout, self.transport.head(url)).await {
            Ok(Ok(head)) if head.is_success() => Some(ProbeInfo {
                content_type: head.content_type,
                content_length: head.content_length,
            }),
            Ok(Ok(head)) => {
                debug!(status = head.status, host = ?url.host_str(), "HEAD probe answered non-2xx");
                None
            }
            Ok(Err(e)) => {
                debug!(error = %e, host = ?url.host_str(), "HEAD probe failed");
                None
            }
            Err(_) => {
                debug!(host = ?url.host_str(), "HEAD probe timed out");
                None
            }
        }
    }

    /// Fetch one byte window.
    ///
    /// `known_length` (usually from the probe) lets a `200` fallback be
    /// accepted when the response itself carries no `Content-Length`.
    pub async fn fetch_range(
        &self,
        url: &Url,
        window: ByteWindow,
        known_length: Option<u64>,
        diag: &mut Diagnostics,
    ) -> TableResult<RangeOutcome> {
        let ceiling = self.fallback_ceiling;
        let exchange = self
            .exchange(url, Some(window), self.range_timeout, diag, |head| {
                Ok(match head.status {
                    206 => BodyPlan::Read {
                        cap: window.len(),
                        overflow: None,
                    },
                    200 if window.start == 0 => match head.content_length.or(known_length) {
                        Some(len) if len <= ceiling => BodyPlan::Read {
                            cap: ceiling,
                            overflow: Some(LoadError::range_unsupported(format!(
                                "server ignored Range and sent more than {ceiling} bytes"
                            ))),
                        },
                        _ => BodyPlan::Skip,
                    },
                    _ => BodyPlan::Skip,
                })
            })
            .await?;

        let head = exchange.head;
        match (head.status, exchange.body) {
            (206, Some(body)) => Ok(RangeOutcome::Partial {
                total_length: head.total_length(),
                content_type: head.content_type,
                body,
            }),
            (416, _) => Ok(RangeOutcome::EndOfStream),
            (200, Some(body)) => Ok(RangeOutcome::WholeBody {
                body,
                content_type: head.content_type,
            }),
            (200, None) => {
                let err = if window.start > 0 {
                    LoadError::range_unsupported(
                        "server stopped honoring Range part way through the scan",
                    )
                } else {
                    match head.content_length.or(known_length) {
                        Some(len) => LoadError::range_unsupported(format!(
                            "server ignored Range and the full body ({len} bytes) exceeds the {ceiling} byte ceiling"
                        ))
                        .with("content_length", len),
                        None => LoadError::range_unsupported(
                            "server ignored Range and did not declare the body size",
                        ),
                    }
                };
                Err(with_window(with_url(err.with("step", "range"), url), Some(window)))
            }
            (status, _) => Err(with_window(
                with_url(
                    LoadError::fetch_failed(format!("unexpected HTTP {status} for byte range"))
                        .with("step", "range")
                        .with("status", status),
                    url,
                ),
                Some(window),
            )),
        }
    }

    /// Fetch a whole resource without `Range`, capped at `max_bytes`.
    pub async fn fetch_document(
        &self,
        url: &Url,
        max_bytes: u64,
        diag: &mut Diagnostics,
    ) -> TableResult<(ResponseHead, Bytes)> {
        let exchange = self
            .exchange(url, None, self.document_timeout, diag, |head| {
                if !head.is_success() {
                    return Ok(BodyPlan::Skip);
                }
                if let Some(len) = head.content_length.filter(|len| *len > max_bytes) {
                    return Err(LoadError::too_large(format!(
                        "document is {len} bytes, limit is {max_bytes}"
                    ))
                    .with("content_length", len));
                }
                Ok(BodyPlan::Read {
                    cap: max_bytes,
                    overflow: Some(LoadError::too_large(format!(
                        "document exceeds the {max_bytes} byte limit"
                    ))),
                })
            })
            .await
            .map_err(|e| e.with("step", "document"))?;

        match exchange.body {
            Some(body) if exchange.head.is_success() => Ok((exchange.head, body)),
            _ => Err(with_url(
                LoadError::fetch_failed(format!(
                    "unexpected HTTP {} for document",
                    exchange.head.status
                ))
                .with("step", "document")
                .with("status", exchange.head.status),
                url,
            )),
        }
    }

    async fn attempt_once<P>(
        &self,
        url: &Url,
        range: Option<ByteWindow>,
        plan: &P,
    ) -> Result<Exchange, AttemptError>
    where
        P: Fn(&ResponseHead) -> TableResult<BodyPlan>,
    {
        let resp = self
            .transport
            .get(url, range)
            .await
            .map_err(AttemptError::Transport)?;
        if is_transient_status(resp.head.status) {
            return Ok(Exchange {
                head: resp.head,
                body: None,
            });
        }
        let body = match plan(&resp.head).map_err(AttemptError::Fatal)? {
            BodyPlan::Skip => None,
            BodyPlan::Read { cap, overflow } => Some(read_body(resp.body, cap, overflow).await?),
        };
        Ok(Exchange {
            head: resp.head,
            body,
        })
    }

    /// Run attempts until one yields a non-transient answer or the budget
    /// runs out. Transient: `502`/`503`/`504`, network errors, timeouts.
    async fn exchange<P>(
        &self,
        url: &Url,
        range: Option<ByteWindow>,
        timeout: Duration,
        diag: &mut Diagnostics,
        plan: P,
    ) -> TableResult<Exchange>
    where
        P: Fn(&ResponseHead) -> TableResult<BodyPlan>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_failure = None;

        for attempt in 1..=max_attempts {
            if range.is_some() {
                diag.range_request_count += 1;
            }
            let failure =
                match tokio::time::timeout(timeout, self.attempt_once(url, range, &plan)).await {
                    Ok(Ok(exchange)) if is_transient_status(exchange.head.status) => {
                        Failure::Status(exchange.head.status)
                    }
                    Ok(Ok(exchange)) => {
                        if let Some(body) = &exchange.body {
                            diag.bytes_fetched_total += body.len() as u64;
                        }
                        return Ok(exchange);
                    }
                    Ok(Err(AttemptError::Fatal(e))) => {
                        return Err(with_window(with_url(e, url), range))
                    }
                    Ok(Err(AttemptError::Transport(e))) => Failure::Transport(e),
                    Err(_elapsed) => Failure::Transport(TransportError::Timeout),
                };

            if attempt < max_attempts {
                let delay = self.retry.delay_after(attempt);
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    host = ?url.host_str(),
                    byte_start = ?range.map(|w| w.start),
                    failure = %failure,
                    "transient fetch failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            last_failure = Some(failure);
        }

        let mut err = LoadError::fetch_failed(match &last_failure {
            Some(failure) => format!("gave up after {max_attempts} attempt(s): {failure}"),
            None => format!("gave up after {max_attempts} attempt(s)"),
        })
        .with("step", if range.is_some() { "range" } else { "document" })
        .with("attempts", max_attempts);
        match last_failure {
            Some(Failure::Status(status)) => err = err.with("status", status),
            Some(Failure::Transport(e)) => err = err.with_source(e),
            None => {}
        }
        Err(with_window(with_url(err, url), range))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Injected, MemoryTransport};
    use crate::ReasonCode;
    use tokio::time::Instant;

    fn fetcher_for(transport: MemoryTransport) -> (RangeFetcher, Arc<MemoryTransport>) {
        let transport = Arc::new(transport);
        let fetcher = RangeFetcher::new(transport.clone(), &LoaderConfig::default());
        (fetcher, transport)
    }

    fn url() -> Url {
        Url::parse("https://files.example.com/exports/plans.csv?sig=secret").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_statuses_with_backoff() {
        let (fetcher, transport) = fetcher_for(
            MemoryTransport::new(&b"a,b\n1,2\n"[..])
                .fail_get(0, Injected::Status(503))
                .fail_get(1, Injected::Status(502)),
        );
        let mut diag = Diagnostics::default();
        let started = Instant::now();
        let outcome = fetcher
            .fetch_range(&url(), ByteWindow::first(64), None, &mut diag)
            .await
            .unwrap();

        assert!(matches!(outcome, RangeOutcome::Partial { ref body, .. } if body.len() == 8));
        assert_eq!(started.elapsed(), Duration::from_millis(1000));
        assert_eq!(diag.range_request_count, 3);
        assert_eq!(diag.bytes_fetched_total, 8);
        assert_eq!(transport.get_windows().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_is_fetch_failed() {
        let (fetcher, transport) = fetcher_for(
            MemoryTransport::new(&b"a,b\n1,2\n"[..])
                .fail_get(0, Injected::Status(503))
                .fail_get(1, Injected::Status(503))
                .fail_get(2, Injected::Status(503)),
        );
        let mut diag = Diagnostics::default();
        let started = Instant::now();
        let err = fetcher
            .fetch_range(&url(), ByteWindow::first(64), None, &mut diag)
            .await
            .unwrap_err();

        assert_eq!(err.reason(), ReasonCode::FetchFailed);
        assert_eq!(err.context_value("status"), Some("503"));
        assert_eq!(err.context_value("host"), Some("files.example.com"));
        assert_eq!(err.context_value("path"), Some("plans.csv"));
        assert!(!err.describe().contains("secret"));
        // Two backoffs between three attempts; no sleep after the last one.
        assert_eq!(started.elapsed(), Duration::from_millis(1000));
        assert_eq!(transport.get_windows().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_request_times_out_and_is_retried() {
        let (fetcher, _transport) = fetcher_for(
            MemoryTransport::new(&b"a,b\n1,2\n"[..]).fail_get(0, Injected::Stall),
        );
        let mut diag = Diagnostics::default();
        let started = Instant::now();
        let outcome = fetcher
            .fetch_range(&url(), ByteWindow::first(64), None, &mut diag)
            .await
            .unwrap();
        assert!(matches!(outcome, RangeOutcome::Partial { .. }));
        assert_eq!(
            started.elapsed(),
            Duration::from_secs(15) + Duration::from_millis(250)
        );
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let (fetcher, transport) =
            fetcher_for(MemoryTransport::new(&b"x"[..]).fail_get(0, Injected::Status(404)));
        let mut diag = Diagnostics::default();
        let err = fetcher
            .fetch_range(&url(), ByteWindow::first(64), None, &mut diag)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), ReasonCode::FetchFailed);
        assert_eq!(err.context_value("status"), Some("404"));
        assert_eq!(transport.get_windows().len(), 1);
    }

    #[tokio::test]
    async fn range_past_end_is_end_of_stream() {
        let (fetcher, _) = fetcher_for(MemoryTransport::new(&b"abc"[..]));
        let mut diag = Diagnostics::default();
        let outcome = fetcher
            .fetch_range(&url(), ByteWindow { start: 3, end: 10 }, None, &mut diag)
            .await
            .unwrap();
        assert!(matches!(outcome, RangeOutcome::EndOfStream));
    }

    #[tokio::test]
    async fn ignored_range_with_small_known_size_is_accepted() {
        let (fetcher, _) = fetcher_for(MemoryTransport::new(&b"a,b\n1,2\n"[..]).ignoring_range());
        let mut diag = Diagnostics::default();
        let outcome = fetcher
            .fetch_range(&url(), ByteWindow::first(4), None, &mut diag)
            .await
            .unwrap();
        assert!(matches!(outcome, RangeOutcome::WholeBody { ref body, .. } if body.len() == 8));
    }

    #[tokio::test]
    async fn ignored_range_with_unknown_size_is_rejected() {
        let (fetcher, _) = fetcher_for(
            MemoryTransport::new(&b"a,b\n1,2\n"[..])
                .ignoring_range()
                .without_length(),
        );
        let mut diag = Diagnostics::default();
        let err = fetcher
            .fetch_range(&url(), ByteWindow::first(4), None, &mut diag)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), ReasonCode::RangeUnsupported);
        assert_eq!(diag.bytes_fetched_total, 0);

        // A probed length makes the same answer acceptable.
        let outcome = fetcher
            .fetch_range(&url(), ByteWindow::first(4), Some(8), &mut diag)
            .await
            .unwrap();
        assert!(matches!(outcome, RangeOutcome::WholeBody { .. }));
    }

    #[tokio::test]
    async fn oversized_partial_body_is_truncated_to_window() {
        let (fetcher, _) = fetcher_for(MemoryTransport::new(vec![b'x'; 100]).over_sending(25));
        let mut diag = Diagnostics::default();
        let outcome = fetcher
            .fetch_range(&url(), ByteWindow { start: 0, end: 9 }, None, &mut diag)
            .await
            .unwrap();
        match outcome {
            RangeOutcome::Partial {
                body, total_length, ..
            } => {
                assert_eq!(body.len(), 10);
                assert_eq!(total_length, Some(100));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(diag.bytes_fetched_total, 10);
    }

    #[tokio::test]
    async fn fallback_body_is_capped_when_length_is_understated() {
        let config = LoaderConfig {
            range_fallback_ceiling: 1024,
            ..LoaderConfig::default()
        };
        let transport = MemoryTransport::new(vec![b'x'; 20 * 1024])
            .ignoring_range()
            .declaring_length(100);
        let fetcher = RangeFetcher::new(Arc::new(transport), &config);
        let mut diag = Diagnostics::default();
        let err = fetcher
            .fetch_range(&url(), ByteWindow::first(64), None, &mut diag)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), ReasonCode::RangeUnsupported);
        assert_eq!(err.context_value("byte_start"), Some("0"));
        assert_eq!(diag.bytes_fetched_total, 0);
    }

    #[tokio::test]
    async fn probe_failure_is_absent_not_error() {
        let (fetcher, _) = fetcher_for(MemoryTransport::new(&b"x"[..]).without_head());
        assert_eq!(fetcher.probe(&url()).await, None);

        let (fetcher, _) =
            fetcher_for(MemoryTransport::new(&b"x"[..]).with_content_type("text/csv"));
        let probe = fetcher.probe(&url()).await.unwrap();
        assert_eq!(probe.content_type.as_deref(), Some("text/csv"));
        assert_eq!(probe.content_length, Some(1));
    }

    #[tokio::test]
    async fn document_over_limit_is_too_large() {
        let (fetcher, _) = fetcher_for(MemoryTransport::new(vec![b'['; 64]));
        let mut diag = Diagnostics::default();
        let err = fetcher
            .fetch_document(&url(), 32, &mut diag)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), ReasonCode::TooLarge);

        let (fetcher, _) = fetcher_for(MemoryTransport::new(vec![b'['; 64]).without_length());
        let err = fetcher
            .fetch_document(&url(), 32, &mut diag)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), ReasonCode::TooLarge);
    }
}
