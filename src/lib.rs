//! torrent-webseed
//!
//! Storage and HTTP web-seed core of a BitTorrent client: piece/file byte
//! mapping, piece bitmaps, a per-torrent storage backend and an engine that
//! fetches missing pieces from HTTP mirrors.

pub mod torrent;
pub mod pieces;
pub mod storage;
pub mod webseed;
pub mod config;
pub mod cli;
pub mod error;

pub use error::TorrentError;
pub use config::WebSeedConfig;

pub use torrent::{TorrentParser, TorrentInfo, TorrentFile};
pub use pieces::{PieceSet, FileSpan, file_spans, pending_bitmap, piece_bytes, piece_range};
pub use storage::{ExternalStorage, FileStorage, FileProgress, ReadResult, TorrentStorage};
pub use webseed::{
    MirrorStats, FileStats, MirrorState, MirrorTransport, PieceSink, PieceSnapshot,
    ProbeReport, WebSeedEngine, WebSeedRegistry,
};
#[cfg(feature = "download")]
pub use webseed::HttpTransport;
pub use cli::{CliArgs, Config, ProgressDisplay, DownloadStats};
