//! Piece sink abstraction
//!
//! The engine never touches storage directly. Everything it needs from the
//! owner of the completion state goes through [`PieceSink`]: the live
//! selection and completion bitmap, the chunk writer and the "piece fully
//! delivered" notification.

use async_trait::async_trait;
use anyhow::Result;

use crate::pieces::PieceSet;

/// Point-in-time view of the selection flags and completion bitmap
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PieceSnapshot {
    /// Wanted flag per file, in declared order
    pub selection: Vec<bool>,
    /// Pieces confirmed fully written
    pub completed: PieceSet,
}

/// Destination of mirror-fetched bytes
#[async_trait]
pub trait PieceSink: Send + Sync {
    /// Current selection and completion state
    async fn snapshot(&self) -> PieceSnapshot;

    /// Check whether `index` is already complete
    async fn is_piece_complete(&self, index: u32) -> bool;

    /// Write `data` at torrent offset `offset`
    ///
    /// Called concurrently from several tasks on disjoint regions, and
    /// possibly concurrently with the peer path.
    async fn write_chunk(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Every byte of piece `index` has been written
    ///
    /// Implementations verify the piece (or trust it) and mark it complete.
    async fn piece_delivered(&self, index: u32) -> Result<()>;
}
