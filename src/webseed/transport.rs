//! HTTP transport for mirror requests
//!
//! The engine talks to mirrors through [`MirrorTransport`], so tests and
//! embedders can serve content without a network. [`SegmentReader`] turns
//! any response (plain, single range or `multipart/byteranges`) into a
//! stream of positioned [`Segment`]s.

use std::collections::VecDeque;
use std::ops::Range;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, trace};

use crate::error::TorrentError;
use crate::webseed::multipart::{multipart_boundary, parse_content_range, MultipartDecoder, Segment};

/// What a probe learned about a mirror
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReport {
    /// The server answered a range request with 206
    pub ranges: bool,
    /// Full size of the probed resource, when reported
    pub length: Option<u64>,
}

/// Response body, read chunk by chunk
#[async_trait]
pub trait BodyStream: Send {
    /// Next chunk, or `None` at end of body
    async fn next_chunk(&mut self) -> Result<Option<Bytes>>;
}

/// Status, the headers the engine cares about, and the body
pub struct MirrorResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub content_range: Option<String>,
    pub body: Box<dyn BodyStream>,
}

impl std::fmt::Debug for MirrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorResponse")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .field("content_range", &self.content_range)
            .finish_non_exhaustive()
    }
}

/// Issues probe and fetch requests against mirror URLs
#[async_trait]
pub trait MirrorTransport: Send + Sync {
    /// Request the first byte of `url` to learn range support and size
    async fn probe(&self, url: &str) -> Result<ProbeReport>;

    /// GET `url`, restricted to `ranges` (resource-relative, half-open)
    /// unless the slice is empty
    async fn fetch(&self, url: &str, ranges: &[Range<u64>]) -> Result<MirrorResponse>;
}

/// Body served from memory
#[derive(Debug, Default)]
pub struct MemoryBody {
    chunks: VecDeque<Bytes>,
}

impl MemoryBody {
    pub fn new(chunks: impl IntoIterator<Item = Bytes>) -> Self {
        Self {
            chunks: chunks.into_iter().collect(),
        }
    }
}

#[async_trait]
impl BodyStream for MemoryBody {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        Ok(self.chunks.pop_front())
    }
}

/// `Range` header value for half-open byte ranges, `None` for a full GET
pub fn range_header(ranges: &[Range<u64>]) -> Option<String> {
    let specs: Vec<String> = ranges
        .iter()
        .filter(|r| r.start < r.end)
        .map(|r| format!("{}-{}", r.start, r.end - 1))
        .collect();
    if specs.is_empty() {
        return None;
    }
    Some(format!("bytes={}", specs.join(",")))
}

/// Interpret the answer to a `Range: bytes=0-0` probe
pub fn interpret_probe(
    status: u16,
    content_range: Option<&str>,
    content_length: Option<u64>,
    url: &str,
) -> Result<ProbeReport> {
    match status {
        206 => {
            let header = content_range.ok_or_else(|| {
                TorrentError::malformed_response("206 response without Content-Range", url)
            })?;
            let range = parse_content_range(header, url)?;
            Ok(ProbeReport {
                ranges: true,
                length: range.total,
            })
        }
        200 => Ok(ProbeReport {
            ranges: false,
            length: content_length,
        }),
        _ => Err(TorrentError::mirror_error_with_status(format!("Probe failed with HTTP {}", status), url, status).into()),
    }
}

enum Framing {
    /// Contiguous body starting at `offset`
    Plain { offset: u64 },
    Multipart(MultipartDecoder),
}

/// Positioned segments of a mirror response
pub struct SegmentReader {
    body: Box<dyn BodyStream>,
    framing: Framing,
    finished: bool,
    url: String,
}

impl SegmentReader {
    /// Pick the framing from the response status and headers
    pub fn new(response: MirrorResponse, url: &str) -> Result<Self> {
        let framing = match response.status {
            200 => {
                trace!("Full body from {}", url);
                Framing::Plain { offset: 0 }
            }
            206 => match response.content_type.as_deref().and_then(multipart_boundary) {
                Some(boundary) => {
                    trace!("Multipart body from {} (boundary {})", url, boundary);
                    Framing::Multipart(MultipartDecoder::new(&boundary, url))
                }
                None => {
                    let header = response.content_range.as_deref().ok_or_else(|| {
                        TorrentError::malformed_response("206 response without Content-Range", url)
                    })?;
                    let range = parse_content_range(header, url)?;
                    trace!("Single range {}-{} from {}", range.start, range.end, url);
                    Framing::Plain { offset: range.start }
                }
            },
            status => {
                debug!("Mirror {} answered HTTP {}", url, status);
                return Err(
                    TorrentError::mirror_error_with_status(format!("Unexpected HTTP {}", status), url, status).into(),
                );
            }
        };
        Ok(Self {
            body: response.body,
            framing,
            finished: false,
            url: url.to_string(),
        })
    }

    /// Next segment of the body, `None` once it is exhausted
    pub async fn next_segment(&mut self) -> Result<Option<Segment>> {
        loop {
            match &mut self.framing {
                Framing::Plain { offset } => {
                    if self.finished {
                        return Ok(None);
                    }
                    match self.body.next_chunk().await? {
                        Some(data) if data.is_empty() => continue,
                        Some(data) => {
                            let next = offset.checked_add(data.len() as u64).ok_or_else(|| {
                                TorrentError::malformed_response("Body runs past the largest offset", &self.url)
                            })?;
                            let segment = Segment { offset: *offset, data };
                            *offset = next;
                            return Ok(Some(segment));
                        }
                        None => {
                            self.finished = true;
                            return Ok(None);
                        }
                    }
                }
                Framing::Multipart(decoder) => {
                    if let Some(segment) = decoder.next_segment()? {
                        return Ok(Some(segment));
                    }
                    if self.finished {
                        return Ok(None);
                    }
                    match self.body.next_chunk().await? {
                        Some(data) => decoder.push(&data),
                        None => {
                            self.finished = true;
                            decoder.finish()?;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(feature = "download")]
pub use http::HttpTransport;

#[cfg(feature = "download")]
mod http {
    use std::ops::Range;

    use anyhow::Result;
    use async_trait::async_trait;
    use bytes::Bytes;
    use reqwest::header::{CONTENT_RANGE, CONTENT_TYPE, RANGE};
    use tracing::debug;

    use super::{interpret_probe, range_header, BodyStream, MirrorResponse, MirrorTransport, ProbeReport};
    use crate::config::WebSeedConfig;
    use crate::error::TorrentError;

    /// [`MirrorTransport`] backed by a shared `reqwest` client
    #[derive(Debug, Clone)]
    pub struct HttpTransport {
        client: reqwest::Client,
    }

    impl HttpTransport {
        pub fn new(config: &WebSeedConfig) -> Result<Self> {
            let client = reqwest::Client::builder()
                .connect_timeout(config.socket_timeout())
                .user_agent(concat!("torrent-webseed/", env!("CARGO_PKG_VERSION")))
                .build()
                .map_err(TorrentError::from)?;
            Ok(Self { client })
        }
    }

    struct ReqwestBody(reqwest::Response);

    #[async_trait]
    impl BodyStream for ReqwestBody {
        async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
            Ok(self.0.chunk().await.map_err(TorrentError::from)?)
        }
    }

    fn header(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    #[async_trait]
    impl MirrorTransport for HttpTransport {
        async fn probe(&self, url: &str) -> Result<ProbeReport> {
            debug!("Probing {}", url);
            let response = self
                .client
                .get(url)
                .header(RANGE, "bytes=0-0")
                .send()
                .await
                .map_err(|e| TorrentError::from(e).with_url(url))?;
            let content_range = header(&response, CONTENT_RANGE);
            interpret_probe(
                response.status().as_u16(),
                content_range.as_deref(),
                response.content_length(),
                url,
            )
        }

        async fn fetch(&self, url: &str, ranges: &[Range<u64>]) -> Result<MirrorResponse> {
            let mut request = self.client.get(url);
            if let Some(value) = range_header(ranges) {
                debug!("GET {} ({})", url, value);
                request = request.header(RANGE, value);
            } else {
                debug!("GET {}", url);
            }
            let response = request
                .send()
                .await
                .map_err(|e| TorrentError::from(e).with_url(url))?;
            Ok(MirrorResponse {
                status: response.status().as_u16(),
                content_type: header(&response, CONTENT_TYPE),
                content_range: header(&response, CONTENT_RANGE),
                body: Box::new(ReqwestBody(response)),
            })
        }
    }
}
