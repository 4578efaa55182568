//! Tagged load errors.
//!
//! Every failure surfaced to a caller is a [`LoadError`]: a machine-readable
//! [`ReasonCode`], an HTTP-style status derived from it, a short message and a
//! structured context map. Context values are already scrubbed (host and path
//! basename only) so the error can be logged or returned to an API client as is.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::window::Diagnostics;

/// Machine-readable reason attached to every [`LoadError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReasonCode {
    /// No source is configured for the requested table.
    NotConfigured,
    /// The configured source is not a usable URL or path.
    UrlInvalid,
    /// The remote server failed, or kept failing after the retry budget.
    FetchFailed,
    /// The payload could not be parsed into rows.
    ParseFailed,
    /// The server ignored `Range` and the full body is too large or of unknown size.
    RangeUnsupported,
    /// Neither the name nor the content type identifies CSV or JSON.
    UnsupportedFormat,
    /// The resource exceeds a configured size limit.
    TooLarge,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::NotConfigured => "NOT_CONFIGURED",
            ReasonCode::UrlInvalid => "URL_INVALID",
            ReasonCode::FetchFailed => "FETCH_FAILED",
            ReasonCode::ParseFailed => "PARSE_FAILED",
            ReasonCode::RangeUnsupported => "RANGE_UNSUPPORTED",
            ReasonCode::UnsupportedFormat => "UNSUPPORTED_FORMAT",
            ReasonCode::TooLarge => "TOO_LARGE",
        }
    }

    /// HTTP-style status a service boundary should answer with.
    pub fn status(self) -> u16 {
        match self {
            ReasonCode::NotConfigured => 500,
            ReasonCode::UrlInvalid => 400,
            ReasonCode::FetchFailed => 502,
            ReasonCode::ParseFailed => 422,
            ReasonCode::RangeUnsupported => 502,
            ReasonCode::UnsupportedFormat => 415,
            ReasonCode::TooLarge => 413,
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error returned by every load operation.
#[derive(Debug, Error)]
#[error("{reason}: {message}")]
pub struct LoadError {
    reason: ReasonCode,
    message: String,
    context: BTreeMap<&'static str, String>,
    request_id: Option<String>,
    diagnostics: Option<Box<Diagnostics>>,
    #[source]
    source: Option<BoxError>,
}

impl LoadError {
    pub fn new(reason: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            context: BTreeMap::new(),
            request_id: None,
            diagnostics: None,
            source: None,
        }
    }

    pub fn not_configured(message: impl Into<String>) -> Self {
        Self::new(ReasonCode::NotConfigured, message)
    }

    pub fn url_invalid(message: impl Into<String>) -> Self {
        Self::new(ReasonCode::UrlInvalid, message)
    }

    pub fn fetch_failed(message: impl Into<String>) -> Self {
        Self::new(ReasonCode::FetchFailed, message)
    }

    pub fn parse_failed(message: impl Into<String>) -> Self {
        Self::new(ReasonCode::ParseFailed, message)
    }

    pub fn range_unsupported(message: impl Into<String>) -> Self {
        Self::new(ReasonCode::RangeUnsupported, message)
    }

    pub fn unsupported_format(message: impl Into<String>) -> Self {
        Self::new(ReasonCode::UnsupportedFormat, message)
    }

    pub fn too_large(message: impl Into<String>) -> Self {
        Self::new(ReasonCode::TooLarge, message)
    }

    /// Attach one context entry; later values for the same key win.
    #[must_use]
    pub fn with(mut self, key: &'static str, value: impl ToString) -> Self {
        self.context.insert(key, value.to_string());
        self
    }

    #[must_use]
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    #[must_use]
    pub fn with_diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = Some(Box::new(diagnostics));
        self
    }

    pub fn reason(&self) -> ReasonCode {
        self.reason
    }

    pub fn status(&self) -> u16 {
        self.reason.status()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &BTreeMap<&'static str, String> {
        &self.context
    }

    pub fn context_value(&self, key: &str) -> Option<&str> {
        self.context.get(key).map(String::as_str)
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn diagnostics(&self) -> Option<&Diagnostics> {
        self.diagnostics.as_deref()
    }

    /// Message plus context, formatted for logs and API bodies.
    pub fn describe(&self) -> String {
        let mut out = format!("{} ({}): {}", self.reason, self.status(), self.message);
        if !self.context.is_empty() {
            let pairs: Vec<String> = self
                .context
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            out.push_str(&format!(" [{}]", pairs.join(", ")));
        }
        if let Some(id) = &self.request_id {
            out.push_str(&format!(" request_id={id}"));
        }
        out
    }
}

pub type TableResult<T> = std::result::Result<T, LoadError>;
