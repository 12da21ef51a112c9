//! External storage provider abstraction
//!
//! The storage backend normally reads and writes a local directory tree.
//! An application may instead inject an [`ExternalStorage`] provider, in which
//! case every file operation is delegated to it, keyed by the torrent's
//! content identifier (hex info hash) and the file's relative path.

use async_trait::async_trait;
use bytes::Bytes;
use anyhow::Result;

/// Storage provider substituting for local filesystem access
///
/// Paths are `/`-separated and relative to the download directory, including
/// the torrent root component (e.g. `album/cd1/01.flac`).
#[async_trait]
pub trait ExternalStorage: Send + Sync {
    // ==================== Data ====================

    /// Read up to `length` bytes of `path` starting at `offset`
    ///
    /// A missing file or a read past its current end returns fewer bytes than
    /// requested (possibly none). Only genuine provider failures are errors.
    async fn read_file_at(&self, id: &str, path: &str, length: usize, offset: u64) -> Result<Bytes>;

    /// Write `data` into `path` at `offset`, creating the file if needed
    ///
    /// Returns the number of bytes written. Must tolerate concurrent calls
    /// on disjoint regions of the same file.
    async fn write_file_at(&self, id: &str, path: &str, data: &[u8], offset: u64) -> Result<usize>;

    // ==================== Files ====================

    /// Materialize an empty file at `path`
    ///
    /// Zero-length files never receive piece I/O, so this is the only way they
    /// come into existence.
    async fn create_zero_length_file(&self, id: &str, path: &str) -> Result<()>;

    /// Delete `path` if it exists
    async fn remove(&self, id: &str, path: &str) -> Result<()>;

    /// Rename `from` to `to` (used when the torrent root is renamed)
    async fn rename(&self, id: &str, from: &str, to: &str) -> Result<()>;
}
