//! Piece bookkeeping module
//!
//! Byte-range to piece mapping and the compact piece bitmap set.

pub mod bitmap;
pub mod range;

pub use bitmap::PieceSet;
pub use range::{file_spans, pending_bitmap, piece_bytes, piece_range, FileSpan};
