//! HTTP byte-range response decoding
//!
//! `Content-Range` parsing and an incremental decoder for
//! `multipart/byteranges` bodies. Both report malformed input as mirror
//! errors, never as panics.

use anyhow::Result;
use bytes::{Buf, Bytes, BytesMut};
use tracing::trace;

use crate::error::TorrentError;

/// Parsed `Content-Range: bytes <start>-<end>/<total>` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    /// Inclusive
    pub end: u64,
    /// `None` for `/*`
    pub total: Option<u64>,
}

impl ContentRange {
    /// Number of bytes covered
    pub fn length(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Parse a `Content-Range` header value.
///
/// Unsatisfied ranges (`bytes */<total>`), inverted ranges and ranges whose
/// length does not fit a `u64` are errors.
pub fn parse_content_range(value: &str, url: &str) -> Result<ContentRange> {
    let malformed = || TorrentError::malformed_response(format!("Unparseable Content-Range: {}", value), url);

    let rest = value.trim().strip_prefix("bytes").ok_or_else(malformed)?.trim_start();
    let (range, total) = rest.split_once('/').ok_or_else(malformed)?;
    let (start, end) = range.split_once('-').ok_or_else(malformed)?;
    let start: u64 = start.trim().parse().map_err(|_| malformed())?;
    let end: u64 = end.trim().parse().map_err(|_| malformed())?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse::<u64>().map_err(|_| malformed())?),
    };
    if end < start || end == u64::MAX || total.is_some_and(|t| end >= t) {
        return Err(malformed().into());
    }
    Ok(ContentRange { start, end, total })
}

/// Extract the boundary of a `multipart/byteranges` content type
pub fn multipart_boundary(content_type: &str) -> Option<String> {
    let mut params = content_type.split(';');
    let mime = params.next()?.trim();
    if !mime.eq_ignore_ascii_case("multipart/byteranges") {
        return None;
    }
    params.find_map(|p| {
        let (key, value) = p.trim().split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("boundary")
            .then(|| value.trim().trim_matches('"').to_string())
    })
}

/// A run of body bytes and the resource offset of its first byte
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub offset: u64,
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Looking for the next `--boundary`
    Delimiter,
    /// Reading part headers
    Headers,
    /// Inside a part body
    Body { offset: u64, remaining: u64 },
    /// Closing delimiter seen
    Done,
}

/// Incremental `multipart/byteranges` decoder
///
/// Feed body chunks with [`push`](Self::push), drain parts with
/// [`next_segment`](Self::next_segment), and call [`finish`](Self::finish)
/// at end of body to detect truncation.
#[derive(Debug)]
pub struct MultipartDecoder {
    delimiter: Vec<u8>,
    buffer: BytesMut,
    state: State,
    url: String,
}

const MAX_HEADER_BYTES: usize = 16 * 1024;

impl MultipartDecoder {
    pub fn new(boundary: &str, url: impl Into<String>) -> Self {
        Self {
            delimiter: format!("--{}", boundary).into_bytes(),
            buffer: BytesMut::new(),
            state: State::Delimiter,
            url: url.into(),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Next decoded segment, or `None` when more input is needed
    pub fn next_segment(&mut self) -> Result<Option<Segment>> {
        loop {
            match self.state {
                State::Done => {
                    self.buffer.clear();
                    return Ok(None);
                }
                State::Delimiter => {
                    let Some(at) = find(&self.buffer, &self.delimiter) else {
                        // Keep a tail long enough to hold a split delimiter.
                        let keep = self.delimiter.len();
                        if self.buffer.len() > keep {
                            self.buffer.advance(self.buffer.len() - keep);
                        }
                        return Ok(None);
                    };
                    let after = at + self.delimiter.len();
                    if self.buffer.len() < after + 2 {
                        return Ok(None);
                    }
                    let marker = [self.buffer[after], self.buffer[after + 1]];
                    match &marker {
                        b"--" => {
                            trace!("Closing multipart delimiter from {}", self.url);
                            self.state = State::Done;
                        }
                        b"\r\n" => {
                            self.buffer.advance(after + 2);
                            self.state = State::Headers;
                        }
                        _ => {
                            // Boundary text appearing inside a preamble line; skip it.
                            self.buffer.advance(after);
                        }
                    }
                }
                State::Headers => {
                    let Some(at) = find(&self.buffer, b"\r\n\r\n") else {
                        if self.buffer.len() > MAX_HEADER_BYTES {
                            return Err(self.malformed("Multipart part headers too long"));
                        }
                        return Ok(None);
                    };
                    let headers = String::from_utf8_lossy(&self.buffer[..at]).to_string();
                    self.buffer.advance(at + 4);
                    let range = headers
                        .lines()
                        .filter_map(|line| line.split_once(':'))
                        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-range"))
                        .map(|(_, value)| value.trim().to_string())
                        .ok_or_else(|| self.malformed("Multipart part without Content-Range"))?;
                    let range = parse_content_range(&range, &self.url)?;
                    trace!("Multipart part {}-{} from {}", range.start, range.end, self.url);
                    self.state = State::Body {
                        offset: range.start,
                        remaining: range.length(),
                    };
                }
                State::Body { offset, remaining } => {
                    if remaining == 0 {
                        self.state = State::Delimiter;
                        continue;
                    }
                    if self.buffer.is_empty() {
                        return Ok(None);
                    }
                    let n = (remaining.min(self.buffer.len() as u64)) as usize;
                    let data = self.buffer.split_to(n).freeze();
                    self.state = State::Body {
                        offset: offset + n as u64,
                        remaining: remaining - n as u64,
                    };
                    return Ok(Some(Segment { offset, data }));
                }
            }
        }
    }

    /// End of body: anything short of the closing delimiter is truncation
    pub fn finish(&mut self) -> Result<()> {
        if self.state == State::Done {
            return Ok(());
        }
        Err(self.malformed("Truncated multipart/byteranges body"))
    }

    fn malformed(&self, message: &str) -> anyhow::Error {
        TorrentError::malformed_response(message, self.url.clone()).into()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "http://m/f";

    fn body() -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(b"preamble\r\n--XYZ\r\nContent-Type: application/octet-stream\r\n");
        body.extend_from_slice(b"Content-Range: bytes 0-3/100\r\n\r\n");
        body.extend_from_slice(b"abcd");
        body.extend_from_slice(b"\r\n--XYZ\r\ncontent-range: bytes 50-55/100\r\n\r\n");
        body.extend_from_slice(b"ef\r\ngh");
        body.extend_from_slice(b"\r\n--XYZ--\r\n");
        body
    }

    fn decode(chunks: &[&[u8]]) -> Result<Vec<(u64, Vec<u8>)>> {
        let mut decoder = MultipartDecoder::new("XYZ", URL);
        let mut out: Vec<(u64, Vec<u8>)> = Vec::new();
        for chunk in chunks {
            decoder.push(chunk);
            while let Some(segment) = decoder.next_segment()? {
                match out.last_mut() {
                    Some((offset, data)) if *offset + data.len() as u64 == segment.offset => {
                        data.extend_from_slice(&segment.data)
                    }
                    _ => out.push((segment.offset, segment.data.to_vec())),
                }
            }
        }
        decoder.finish()?;
        Ok(out)
    }

    #[test]
    fn test_parse_content_range() {
        let range = parse_content_range("bytes 200-1000/67589", URL).unwrap();
        assert_eq!(range, ContentRange { start: 200, end: 1000, total: Some(67589) });
        assert_eq!(range.length(), 801);

        let range = parse_content_range("bytes 0-0/*", URL).unwrap();
        assert_eq!(range.total, None);
    }

    #[test]
    fn test_parse_content_range_rejects_garbage() {
        let values = [
            "bytes */100",
            "items 0-1/2",
            "bytes 5-1/10",
            "bytes 0-10/10",
            "bytes a-b/c",
            "bytes 0-18446744073709551615/*",
        ];
        for value in values {
            let err = parse_content_range(value, URL).unwrap_err();
            let err = err.downcast_ref::<TorrentError>().unwrap();
            assert!(err.is_mirror_error(), "{}", value);
        }
    }

    #[test]
    fn test_multipart_boundary() {
        assert_eq!(
            multipart_boundary("multipart/byteranges; boundary=3d6b6a416f9b5").as_deref(),
            Some("3d6b6a416f9b5")
        );
        assert_eq!(
            multipart_boundary("Multipart/Byteranges; charset=x; boundary=\"q r\"").as_deref(),
            Some("q r")
        );
        assert_eq!(multipart_boundary("application/octet-stream"), None);
    }

    #[test]
    fn test_decode_whole_body() {
        let body = body();
        let parts = decode(&[&body]).unwrap();
        assert_eq!(parts, vec![(0, b"abcd".to_vec()), (50, b"ef\r\ngh".to_vec())]);
    }

    #[test]
    fn test_decode_byte_by_byte() {
        let body = body();
        let chunks: Vec<&[u8]> = body.chunks(1).collect();
        let parts = decode(&chunks).unwrap();
        assert_eq!(parts, vec![(0, b"abcd".to_vec()), (50, b"ef\r\ngh".to_vec())]);
    }

    #[test]
    fn test_truncated_body_is_malformed() {
        let body = body();
        let err = decode(&[&body[..body.len() - 12]]).unwrap_err();
        assert!(err.to_string().contains("Truncated"));
    }

    #[test]
    fn test_part_without_range_is_malformed() {
        let err = decode(&[b"--XYZ\r\nContent-Type: text/plain\r\n\r\nxx\r\n--XYZ--"]).unwrap_err();
        assert!(err.to_string().contains("Content-Range"));
    }
}
