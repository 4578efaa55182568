//! Where a table comes from.

use std::collections::HashMap;
use std::path::PathBuf;

use url::Url;

use crate::error::{LoadError, TableResult};

const SOURCE_ENV_PREFIX: &str = "TABLE_WINDOW_SOURCE_";

/// A resolved table source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// `http`/`https` resource, loaded with range requests when it is CSV.
    Remote(Url),
    /// Local file, read whole.
    Local(PathBuf),
    /// JSON document held in memory.
    Inline(String),
}

impl Source {
    /// Interpret a configured source string.
    ///
    /// `http(s)://` becomes [`Source::Remote`], any other `scheme://` is
    /// rejected, text starting with `[` or `{` is an inline JSON document and
    /// everything else is a local path.
    pub fn parse(spec: &str) -> TableResult<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(LoadError::not_configured("table source is empty"));
        }
        if spec.starts_with('[') || spec.starts_with('{') {
            return Ok(Source::Inline(spec.to_string()));
        }
        if let Some((scheme, _)) = spec.split_once("://") {
            let scheme = scheme.to_ascii_lowercase();
            if scheme != "http" && scheme != "https" {
                return Err(LoadError::url_invalid(format!(
                    "unsupported scheme '{scheme}'"
                )));
            }
            let url = Url::parse(spec).map_err(|e| {
                LoadError::url_invalid("source URL could not be parsed").with_source(e)
            })?;
            if url.host_str().is_none() {
                return Err(LoadError::url_invalid("source URL has no host"));
            }
            return Ok(Source::Remote(url));
        }
        Ok(Source::Local(PathBuf::from(spec)))
    }

    /// Short, credential-free label for logs and error context.
    pub fn label(&self) -> String {
        match self {
            Source::Remote(url) => format!(
                "{}/{}",
                url.host_str().unwrap_or("?"),
                path_basename(url)
            ),
            Source::Local(path) => path
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string(),
            Source::Inline(_) => "inline".to_string(),
        }
    }
}

/// Last non-empty path segment of `url`, without query or fragment.
pub fn path_basename(url: &Url) -> &str {
    url.path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .unwrap_or("")
}

/// Named table sources, typically read from the environment.
#[derive(Debug, Clone, Default)]
pub struct SourceCatalog {
    entries: HashMap<String, String>,
}

impl SourceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect `TABLE_WINDOW_SOURCE_<NAME>=<url|path>` variables; names are
    /// matched case-insensitively.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let entries = vars
            .into_iter()
            .filter_map(|(key, value)| {
                let name = key.strip_prefix(SOURCE_ENV_PREFIX)?;
                Some((name.to_ascii_lowercase(), value))
            })
            .collect();
        Self { entries }
    }

    #[must_use]
    pub fn with(mut self, name: &str, spec: impl Into<String>) -> Self {
        self.entries.insert(name.to_ascii_lowercase(), spec.into());
        self
    }

    pub fn resolve(&self, name: &str) -> TableResult<Source> {
        let spec = self
            .entries
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| {
                LoadError::not_configured(format!("no source configured for table '{name}'"))
                    .with("table", name)
            })?;
        Source::parse(spec).map_err(|e| e.with("table", name))
    }
}
