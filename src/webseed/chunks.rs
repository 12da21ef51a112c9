//! Per-piece delivered-byte tracking
//!
//! A piece straddling two files is fetched by two different tasks, so
//! completeness can only be judged by the union of what every task delivered.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::trace;

use crate::pieces::{piece_bytes, PieceSet};

/// Delivered byte intervals of partially received pieces
#[derive(Debug)]
pub struct ChunkTracker {
    piece_length: u64,
    total_size: u64,
    /// piece -> sorted, merged `[start, end)` intervals relative to the piece
    partial: Mutex<HashMap<u32, Vec<(u64, u64)>>>,
}

impl ChunkTracker {
    pub fn new(piece_length: u64, total_size: u64) -> Self {
        Self {
            piece_length,
            total_size,
            partial: Mutex::new(HashMap::new()),
        }
    }

    /// Record torrent bytes `[offset, offset + length)` as written.
    ///
    /// Returns the pieces this delivery completed, ascending.
    pub fn record(&self, offset: u64, length: u64) -> Vec<u32> {
        let end = (offset + length).min(self.total_size);
        if offset >= end {
            return Vec::new();
        }
        let mut done = Vec::new();
        let mut partial = self.partial.lock().unwrap_or_else(|e| e.into_inner());

        let first = (offset / self.piece_length) as u32;
        let last = ((end - 1) / self.piece_length) as u32;
        for piece in first..=last {
            let span = piece_bytes(piece, self.piece_length, self.total_size);
            let a = offset.max(span.start) - span.start;
            let b = end.min(span.end) - span.start;
            let size = span.end - span.start;

            let intervals = partial.entry(piece).or_default();
            insert_interval(intervals, a, b);
            if intervals.len() == 1 && intervals[0] == (0, size) {
                partial.remove(&piece);
                trace!("Piece {} fully delivered", piece);
                done.push(piece);
            }
        }
        done
    }

    /// Drop partial progress of pieces that were completed elsewhere or are
    /// no longer wanted
    pub fn prune(&self, pending: &PieceSet, completed: &PieceSet) {
        let mut partial = self.partial.lock().unwrap_or_else(|e| e.into_inner());
        let before = partial.len();
        partial.retain(|&piece, _| pending.contains(piece) && !completed.contains(piece));
        if partial.len() < before {
            trace!("Dropped partial progress of {} pieces", before - partial.len());
        }
    }

    /// Forget all partial progress
    pub fn clear(&self) {
        self.partial.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Number of pieces with some but not all bytes delivered
    pub fn partial_count(&self) -> usize {
        self.partial.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

fn insert_interval(intervals: &mut Vec<(u64, u64)>, start: u64, end: u64) {
    let mut start = start;
    let mut end = end;
    intervals.retain(|&(s, e)| {
        if e < start || s > end {
            true
        } else {
            start = start.min(s);
            end = end.max(e);
            false
        }
    });
    let at = intervals.partition_point(|&(s, _)| s < start);
    intervals.insert(at, (start, end));
}
