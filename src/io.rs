use crate::error::{LoadError, TableResult};
use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use bytes::Bytes;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;

use crate::codec::Transcoder;

/// Compression wrapped around a whole document, told by its name suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Zstd,
}

impl Compression {
    /// Split a trailing `.gz` / `.zst` (any case) off `name`, returning the
    /// compression and the remaining stem.
    pub fn split_name(name: &str) -> (Compression, &str) {
        let lower = name.to_ascii_lowercase();
        let (compression, suffix) = if lower.ends_with(".gz") {
            (Compression::Gzip, 3)
        } else if lower.ends_with(".zst") {
            (Compression::Zstd, 4)
        } else {
            return (Compression::None, name);
        };
        (compression, &name[..name.len() - suffix])
    }

    pub fn is_compressed(self) -> bool {
        self != Compression::None
    }
}

/// Wrap a raw reader with decompression and, when the charset is not UTF-8,
/// transcoding to UTF-8.
pub fn build_reader<R>(
    raw: R,
    compression: Compression,
    charset: &'static encoding_rs::Encoding,
) -> Box<dyn AsyncRead + Unpin + Send>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buf = BufReader::with_capacity(1 << 20, raw);
    let decompressed: Box<dyn AsyncRead + Unpin + Send> = match compression {
        Compression::Gzip => Box::new(GzipDecoder::new(buf)),
        Compression::Zstd => Box::new(ZstdDecoder::new(buf)),
        Compression::None => Box::new(buf),
    };

    if charset == encoding_rs::UTF_8 {
        decompressed
    } else {
        let framed = FramedRead::new(decompressed, Transcoder::new(charset));
        Box::new(StreamReader::new(framed))
    }
}

fn io_error(err: std::io::Error, name: &str, step: &'static str) -> LoadError {
    let base = match err.kind() {
        std::io::ErrorKind::NotFound => LoadError::not_configured("source file not found"),
        std::io::ErrorKind::InvalidData => LoadError::parse_failed("source could not be decoded"),
        _ => LoadError::fetch_failed("source could not be read"),
    };
    base.with("path", name).with("step", step).with_source(err)
}

async fn read_capped(
    reader: Box<dyn AsyncRead + Unpin + Send>,
    max_bytes: u64,
    name: &str,
    step: &'static str,
) -> TableResult<Vec<u8>> {
    let mut buf = Vec::new();
    reader
        .take(max_bytes.saturating_add(1))
        .read_to_end(&mut buf)
        .await
        .map_err(|e| io_error(e, name, step))?;
    if buf.len() as u64 > max_bytes {
        return Err(LoadError::too_large(format!(
            "decoded document exceeds the {max_bytes} byte limit"
        ))
        .with("path", name)
        .with("step", step));
    }
    Ok(buf)
}

/// Read a whole local file, decompressed and transcoded, refusing anything
/// larger than `max_bytes` after decoding.
pub async fn read_local(
    path: &Path,
    charset: &'static encoding_rs::Encoding,
    max_bytes: u64,
) -> TableResult<Vec<u8>> {
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    let file = File::open(path)
        .await
        .map_err(|e| io_error(e, name, "local"))?;
    let (compression, _) = Compression::split_name(name);
    read_capped(build_reader(file, compression, charset), max_bytes, name, "local").await
}

/// Decompress and transcode a fetched document body, with the same
/// post-decoding cap as local files.
pub async fn decode_body(
    body: Bytes,
    compression: Compression,
    charset: &'static encoding_rs::Encoding,
    max_bytes: u64,
    name: &str,
) -> TableResult<Vec<u8>> {
    let raw = std::io::Cursor::new(body);
    read_capped(build_reader(raw, compression, charset), max_bytes, name, "decode").await
}
