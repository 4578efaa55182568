//! CSV vs JSON resolution.

use serde::Serialize;
use url::Url;

/// Payload format of a table source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TableFormat {
    Csv,
    Json,
}

impl TableFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            TableFormat::Csv => "csv",
            TableFormat::Json => "json",
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            TableFormat::Csv => "text/csv",
            TableFormat::Json => "application/json",
        }
    }
}

/// Format from a file or path name suffix (`.csv`, `.json`), case-insensitive.
///
/// Compression suffixes are not looked through: `rows.csv.gz` resolves to
/// nothing here, and callers that can decompress split them off first.
pub fn format_from_name(name: &str) -> Option<TableFormat> {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".csv") {
        Some(TableFormat::Csv)
    } else if lower.ends_with(".json") {
        Some(TableFormat::Json)
    } else {
        None
    }
}

/// Format from a `Content-Type` value; parameters such as `charset` are ignored.
pub fn format_from_content_type(content_type: &str) -> Option<TableFormat> {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "text/csv" | "application/csv" | "text/plain" => Some(TableFormat::Csv),
        "application/json" => Some(TableFormat::Json),
        other if other.ends_with("+json") => Some(TableFormat::Json),
        _ => None,
    }
}

/// `charset=` parameter of a `Content-Type` value, if any.
pub fn charset_from_content_type(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"'))
    })
}

/// Decide the format of a remote table.
///
/// The URL path suffix wins; the probed content type is consulted only when
/// the path says nothing. `None` means no signal resolved the format.
pub fn resolve_format(url: &Url, probed_content_type: Option<&str>) -> Option<TableFormat> {
    format_from_name(url.path()).or_else(|| probed_content_type.and_then(format_from_content_type))
}
