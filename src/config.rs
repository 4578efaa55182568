//! Loader configuration from defaults and environment variables.

use std::time::Duration;

use anyhow::{Context, Result};

pub const MIN_CHUNK_SIZE: u64 = 64 * 1024;
pub const MAX_CHUNK_SIZE: u64 = 8 * 1024 * 1024;
pub const DEFAULT_CHUNK_SIZE: u64 = 2 * 1024 * 1024;
/// Largest body accepted when a server answers a ranged GET with a full `200`.
pub const DEFAULT_RANGE_FALLBACK_CEILING: u64 = 5 * 1024 * 1024;

const ENV_PREFIX: &str = "TABLE_WINDOW_";

/// Retry budget for one request (one byte window, one document, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay after the n-th failed attempt; the last entry repeats.
    pub backoff: Vec<Duration>,
}

impl RetryPolicy {
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        let idx = failed_attempt.saturating_sub(1) as usize;
        self.backoff
            .get(idx)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: vec![Duration::from_millis(250), Duration::from_millis(750)],
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Bytes per ranged request; clamped by [`LoaderConfig::chunk_size`].
    pub chunk_size: u64,
    pub retry: RetryPolicy,
    pub head_timeout: Duration,
    pub range_timeout: Duration,
    pub document_timeout: Duration,
    pub range_fallback_ceiling: u64,
    /// Remote sizes above this fail with `TOO_LARGE`: before any GET when HEAD
    /// declares it, otherwise as soon as a response reveals it.
    pub max_content_length: Option<u64>,
    /// Cap for whole-document loads (remote JSON, compressed remote tables and
    /// local files), applied after decompression.
    pub max_document_bytes: u64,
    pub max_window_rows: u64,
    /// Longest text carried between chunks before the record is rejected.
    pub max_record_bytes: u64,
    /// Charset label for local files; UTF-8 when unset.
    pub local_charset: Option<String>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry: RetryPolicy::default(),
            head_timeout: Duration::from_secs(10),
            range_timeout: Duration::from_secs(15),
            document_timeout: Duration::from_secs(30),
            range_fallback_ceiling: DEFAULT_RANGE_FALLBACK_CEILING,
            max_content_length: None,
            max_document_bytes: 32 * 1024 * 1024,
            max_window_rows: 10_000,
            max_record_bytes: MAX_CHUNK_SIZE,
            local_charset: None,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{name}"))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env_var(name)
        .map(|v| {
            v.trim()
                .parse::<T>()
                .with_context(|| format!("Invalid {ENV_PREFIX}{name}"))
        })
        .transpose()
}

fn env_millis(name: &str) -> Result<Option<Duration>> {
    Ok(env_parse::<u64>(name)?.map(Duration::from_millis))
}

impl LoaderConfig {
    /// Defaults overridden by `TABLE_WINDOW_*` variables.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(v) = env_parse("CHUNK_SIZE")? {
            cfg.chunk_size = v;
        }
        if let Some(v) = env_parse::<u32>("MAX_ATTEMPTS")? {
            cfg.retry.max_attempts = v.max(1);
        }
        if let Some(list) = env_var("BACKOFF_MS") {
            cfg.retry.backoff = list
                .split(',')
                .map(|ms| {
                    ms.trim()
                        .parse::<u64>()
                        .map(Duration::from_millis)
                        .with_context(|| format!("Invalid {ENV_PREFIX}BACKOFF_MS entry '{ms}'"))
                })
                .collect::<Result<_>>()?;
        }
        if let Some(v) = env_millis("HEAD_TIMEOUT_MS")? {
            cfg.head_timeout = v;
        }
        if let Some(v) = env_millis("RANGE_TIMEOUT_MS")? {
            cfg.range_timeout = v;
        }
        if let Some(v) = env_millis("DOCUMENT_TIMEOUT_MS")? {
            cfg.document_timeout = v;
        }
        if let Some(v) = env_parse("RANGE_FALLBACK_CEILING")? {
            cfg.range_fallback_ceiling = v;
        }
        if let Some(v) = env_parse("MAX_CONTENT_LENGTH")? {
            cfg.max_content_length = Some(v);
        }
        if let Some(v) = env_parse("MAX_DOCUMENT_BYTES")? {
            cfg.max_document_bytes = v;
        }
        if let Some(v) = env_parse::<u64>("MAX_WINDOW_ROWS")? {
            cfg.max_window_rows = v.max(1);
        }
        if let Some(v) = env_parse("MAX_RECORD_BYTES")? {
            cfg.max_record_bytes = v;
        }
        if let Some(label) = env_var("LOCAL_CHARSET") {
            encoding_rs::Encoding::for_label(label.trim().as_bytes())
                .with_context(|| format!("Unknown {ENV_PREFIX}LOCAL_CHARSET '{label}'"))?;
            cfg.local_charset = Some(label.trim().to_string());
        }
        Ok(cfg)
    }

    /// Effective chunk size, clamped to `[MIN_CHUNK_SIZE, MAX_CHUNK_SIZE]`.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
    }

    /// Encoding for local files, falling back to UTF-8 for unknown labels.
    pub fn local_encoding(&self) -> &'static encoding_rs::Encoding {
        self.local_charset
            .as_deref()
            .and_then(|l| encoding_rs::Encoding::for_label(l.as_bytes()))
            .unwrap_or(encoding_rs::UTF_8)
    }

    /// Clamp a requested row count to `[1, max_window_rows]`.
    pub fn clamp_count(&self, count: u64) -> u64 {
        count.clamp(1, self.max_window_rows.max(1))
    }
}
