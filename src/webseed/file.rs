//! Files still needing mirror download

use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::time::Instant;
use url::Url;

use crate::error::TorrentError;
use crate::pieces::{FileSpan, PieceSet};
use crate::torrent::TorrentInfo;

/// Index of a file in the torrent's file list
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId(pub usize);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file#{}", self.0)
    }
}

/// A file with pieces left to fetch from mirrors
///
/// `remaining` is the source of truth; [`WebFile::bounds`] is derived from it
/// on demand.
#[derive(Debug)]
pub struct WebFile {
    pub id: FileId,
    /// Path below the original torrent name, for reporting
    pub path: String,
    /// Torrent offset of the first byte
    pub offset: u64,
    pub length: u64,
    /// Pieces overlapping the file
    pub pieces: Range<u32>,
    /// Pieces still wanted from this file
    pub remaining: PieceSet,
    /// Bytes written for this file, shared with its running tasks
    pub downloaded: Arc<AtomicU64>,
    /// Held back after a local storage failure
    pub retry_after: Option<Instant>,
}

impl WebFile {
    pub fn new(span: &FileSpan, path: String, remaining: PieceSet) -> Self {
        Self {
            id: FileId(span.index),
            path,
            offset: span.offset,
            length: span.length,
            pieces: span.pieces.clone(),
            remaining,
            downloaded: Arc::new(AtomicU64::new(0)),
            retry_after: None,
        }
    }

    /// `[first, last + 1)` of the remaining pieces
    pub fn bounds(&self) -> Option<(u32, u32)> {
        Some((self.remaining.first()?, self.remaining.last()? + 1))
    }

    /// Torrent byte range `[start, end)` of the file
    pub fn bytes(&self) -> Range<u64> {
        self.offset..self.offset + self.length
    }

    /// Torrent byte ranges of the remaining pieces inside `[start, end)`,
    /// clipped to the file
    pub fn wanted_bytes(&self, start: u32, end: u32, piece_length: u64) -> Vec<Range<u64>> {
        let file = self.bytes();
        self.remaining
            .runs_within(start, end)
            .map(|(s, e)| {
                let a = (u64::from(s) * piece_length).max(file.start);
                let b = (u64::from(e) * piece_length).min(file.end);
                a..b
            })
            .filter(|r| r.start < r.end)
            .collect()
    }

    /// Held back and the deadline has not passed
    pub fn held_back(&self, now: Instant) -> bool {
        self.retry_after.is_some_and(|at| at > now)
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }
}

/// URL of file `index` on `mirror`, following BEP 19.
///
/// Single-file torrents use the mirror URL as-is, unless it ends in `/`, in
/// which case the torrent name is appended. Multi-file torrents append the
/// torrent name and the file's path, each segment percent-encoded.
pub fn file_url(mirror: &str, info: &TorrentInfo, index: usize) -> Result<String> {
    let parsed = Url::parse(mirror).map_err(|e| {
        TorrentError::validation_error_with_field(format!("Invalid mirror URL '{}': {}", mirror, e), "url")
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(TorrentError::validation_error_with_field(
            format!("Unsupported mirror scheme: {}", parsed.scheme()),
            "url",
        )
        .into());
    }
    let file = info.files.get(index).ok_or_else(|| {
        TorrentError::validation_error_with_field(format!("File index {} out of range", index), "index")
    })?;

    if !info.is_multi_file() {
        if mirror.ends_with('/') {
            return Ok(format!("{}{}", mirror, urlencoding::encode(&info.name)));
        }
        return Ok(mirror.to_string());
    }

    let mut url = mirror.to_string();
    if !url.ends_with('/') {
        url.push('/');
    }
    url.push_str(&urlencoding::encode(&info.name));
    for segment in &file.path {
        url.push('/');
        url.push_str(&urlencoding::encode(segment));
    }
    Ok(url)
}
