//! Storage module
//!
//! Per-torrent storage backend: selection and completion bookkeeping plus
//! piece I/O against a local directory or an external provider.

pub mod backend;
pub mod file;
pub mod torrent;

// Re-export backend types
pub use backend::ExternalStorage;

// Re-export file storage types
pub use file::FileStorage;

// Re-export torrent storage types
pub use torrent::{FileProgress, ReadResult, TorrentStorage};
