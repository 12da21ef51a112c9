//! Torrent metadata module
//!
//! Torrent layout description and .torrent metainfo parsing.

pub mod parser;
pub mod info;

pub use parser::TorrentParser;
pub use info::{TorrentInfo, TorrentFile};
