use bytes::{Buf, BytesMut};
use std::io;
use tokio_util::codec::Decoder;

/// Stateful charset-to-UTF-8 transcoder.
///
/// Keeps the decoder state between calls so a multi-byte sequence split
/// across two chunks decodes correctly once the second chunk arrives.
pub struct Transcoder {
    decoder: encoding_rs::Decoder,
    finished: bool,
}

impl Transcoder {
    pub fn new(encoding: &'static encoding_rs::Encoding) -> Self {
        Self {
            decoder: encoding.new_decoder_without_bom_handling(),
            finished: false,
        }
    }

    /// Transcoder for a `charset=` label, or `None` when the label is unknown
    /// or already UTF-8 (no work to do).
    pub fn for_label(label: &str) -> Option<Self> {
        let encoding = encoding_rs::Encoding::for_label(label.trim().as_bytes())?;
        (encoding != encoding_rs::UTF_8).then(|| Self::new(encoding))
    }

    pub fn encoding(&self) -> &'static encoding_rs::Encoding {
        self.decoder.encoding()
    }

    /// Decode all of `src`; with `last` set, flush any buffered partial sequence.
    pub fn transcode(&mut self, src: &[u8], last: bool) -> Vec<u8> {
        if self.finished {
            return Vec::new();
        }
        self.finished = last;
        let capacity = self
            .decoder
            .max_utf8_buffer_length(src.len())
            .unwrap_or_else(|| src.len() * 3 + 16);
        let mut out = vec![0u8; capacity];
        let mut read_total = 0usize;
        let mut written_total = 0usize;

        loop {
            let (result, read, written, _had_errors) =
                self.decoder
                    .decode_to_utf8(&src[read_total..], &mut out[written_total..], last);
            read_total += read;
            written_total += written;
            match result {
                encoding_rs::CoderResult::InputEmpty => break,
                encoding_rs::CoderResult::OutputFull => {
                    let grow = out.len().max(16);
                    out.resize(out.len() + grow, 0);
                }
            }
        }

        out.truncate(written_total);
        out
    }
}

impl Decoder for Transcoder {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let out = self.transcode(&src[..], false);
        src.advance(src.len());
        if out.is_empty() {
            return Ok(None);
        }
        Ok(Some(BytesMut::from(&out[..])))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let out = self.transcode(&buf[..], true);
        buf.clear();
        if out.is_empty() {
            Ok(None)
        } else {
            Ok(Some(BytesMut::from(&out[..])))
        }
    }
}
