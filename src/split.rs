//! Quote-aware record boundary search.
//!
//! A chunk boundary can land anywhere, including inside a quoted field that
//! itself holds a literal newline. Only terminators outside quotes are safe
//! places to cut a buffer into "parse now" and "carry forward".

use memchr::{memchr2_iter, memchr3_iter};

const QUOTE: u8 = b'"';

/// Outcome of scanning a buffer for record boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitScan {
    /// Index of the last `\n` or `\r` outside a quoted field.
    pub last_terminator: Option<usize>,
    /// Whether the buffer ends inside an open quoted field.
    pub open_quote: bool,
}

/// Scan `text` left to right, tracking quote state.
///
/// A quote toggles the state unless the next byte is also a quote, in which
/// case the pair is a literal quote and the state is unchanged. Only `"`,
/// `\n` and `\r` matter, so the scan is byte based and safe on UTF-8 input
/// cut at any byte.
pub fn scan(text: &[u8]) -> SplitScan {
    let mut in_quotes = false;
    let mut last_terminator = None;
    let mut skip_until = 0usize;

    for i in memchr3_iter(QUOTE, b'\n', b'\r', text) {
        if i < skip_until {
            continue;
        }
        match text[i] {
            QUOTE => {
                if text.get(i + 1) == Some(&QUOTE) {
                    skip_until = i + 2;
                } else {
                    in_quotes = !in_quotes;
                }
            }
            _ if !in_quotes => last_terminator = Some(i),
            _ => {}
        }
    }

    SplitScan {
        last_terminator,
        open_quote: in_quotes,
    }
}

/// Index of the last line terminator outside quotes, or `None`.
pub fn find_safe_split(text: &[u8]) -> Option<usize> {
    scan(text).last_terminator
}

/// Split `text` into a prefix ending on a record boundary and the remainder.
///
/// When no safe boundary exists the prefix is empty and everything carries.
pub fn split_at_safe_boundary(text: &[u8]) -> (&[u8], &[u8]) {
    match find_safe_split(text) {
        Some(idx) => text.split_at(idx + 1),
        None => (&text[..0], text),
    }
}

/// Physical line breaks in `text`: `\n`, `\r\n` and bare `\r` count once each.
///
/// `after_cr` says the byte just before `text` was a `\r`, so a leading `\n`
/// completes that break instead of starting a new one. Quotes are not
/// tracked; a newline inside a quoted field still ends a physical line.
pub fn count_line_breaks(text: &[u8], after_cr: bool) -> u64 {
    memchr2_iter(b'\n', b'\r', text)
        .filter(|&i| {
            text[i] == b'\r'
                || match i {
                    0 => !after_cr,
                    _ => text[i - 1] != b'\r',
                }
        })
        .count() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_last_plain_newline() {
        assert_eq!(find_safe_split(b"a,b\n1,2\n3,4"), Some(7));
        assert_eq!(find_safe_split(b"a,b"), None);
        assert_eq!(find_safe_split(b""), None);
    }

    #[test]
    fn ignores_newlines_inside_quotes() {
        let text = b"a,b\n1,\"x\ny";
        assert_eq!(find_safe_split(text), Some(3));
        assert!(scan(text).open_quote);

        let closed = b"a,b\n1,\"x\ny\"\n";
        assert_eq!(find_safe_split(closed), Some(closed.len() - 1));
        assert!(!scan(closed).open_quote);
    }

    #[test]
    fn doubled_quotes_do_not_toggle() {
        // "he said ""hi""\n" stays inside the field until the final quote
        let text = b"1,\"he said \"\"hi\n\"\"\"\n2,3";
        let idx = find_safe_split(text).unwrap();
        assert_eq!(&text[..=idx], b"1,\"he said \"\"hi\n\"\"\"\n");
    }

    #[test]
    fn whole_chunk_inside_quoted_field_carries() {
        let text = b"\"line one\nline two\nline three";
        let (prefix, carry) = split_at_safe_boundary(text);
        assert!(prefix.is_empty());
        assert_eq!(carry, text);
    }

    #[test]
    fn carriage_returns_are_terminators() {
        assert_eq!(find_safe_split(b"a\r\nb\r"), Some(4));
        let (prefix, carry) = split_at_safe_boundary(b"a,b\r\n1,2\r\n3");
        assert_eq!(prefix, b"a,b\r\n1,2\r\n");
        assert_eq!(carry, b"3");
    }

    #[test]
    fn line_breaks_count_crlf_once() {
        assert_eq!(count_line_breaks(b"a\nb\r\nc\rd", false), 3);
        assert_eq!(count_line_breaks(b"\"x\ny\"\r\n", false), 2);
        assert_eq!(count_line_breaks(b"\n1\n", true), 1);
        assert_eq!(count_line_breaks(b"\n1\n", false), 2);
        assert_eq!(count_line_breaks(b"", true), 0);
    }
}
