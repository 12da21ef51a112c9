//! Byte-range to piece mapping
//!
//! Pure helpers translating file offsets into piece indices. Nothing in here
//! holds state, so they can be called under any lock.

use std::ops::Range;

use crate::pieces::PieceSet;
use crate::torrent::TorrentFile;

/// Piece indices touched by `length` bytes starting at torrent offset `offset`.
///
/// `start = floor(offset / piece_length)`, `end = ceil((offset + length) / piece_length)`.
/// A zero-length span yields an empty range.
pub fn piece_range(offset: u64, length: u64, piece_length: u64) -> Range<u32> {
    let start = (offset / piece_length) as u32;
    if length == 0 {
        return start..start;
    }
    let stop = offset + length;
    let mut end = stop / piece_length;
    if stop % piece_length > 0 {
        end += 1;
    }
    start..end as u32
}

/// Torrent byte range `[start, end)` covered by piece `index`
pub fn piece_bytes(index: u32, piece_length: u64, total_size: u64) -> Range<u64> {
    let start = u64::from(index) * piece_length;
    let end = (start + piece_length).min(total_size);
    start.min(total_size)..end
}

/// Placement of one file inside the torrent byte stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpan {
    /// Index in the torrent's file list
    pub index: usize,
    /// Torrent offset of the first byte
    pub offset: u64,
    /// File length in bytes
    pub length: u64,
    /// Pieces overlapping the file, empty for zero-length files
    pub pieces: Range<u32>,
}

impl FileSpan {
    /// Torrent byte range `[offset, offset + length)`
    pub fn bytes(&self) -> Range<u64> {
        self.offset..self.offset + self.length
    }
}

/// Walk the file list in declared order accumulating the running offset
pub fn file_spans(files: &[TorrentFile], piece_length: u64) -> Vec<FileSpan> {
    let mut offset = 0u64;
    files
        .iter()
        .enumerate()
        .map(|(index, file)| {
            let span = FileSpan {
                index,
                offset,
                length: file.length,
                pieces: piece_range(offset, file.length, piece_length),
            };
            offset += file.length;
            span
        })
        .collect()
}

/// Union of the piece ranges of every selected file.
///
/// Zero-length files contribute nothing, selected or not. A selection slice
/// shorter than the file list treats the missing entries as unselected.
pub fn pending_bitmap(files: &[TorrentFile], selection: &[bool], piece_length: u64) -> PieceSet {
    let mut pending = PieceSet::new();
    for span in file_spans(files, piece_length) {
        if selection.get(span.index).copied().unwrap_or(false) {
            pending.add_range(span.pieces.start, span.pieces.end);
        }
    }
    pending
}
