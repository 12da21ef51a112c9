//! File storage module
//!
//! Local filesystem I/O for a single file of the torrent tree. Every path is
//! relative to the download directory and `/`-separated.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, error, trace};

use crate::error::TorrentError;

/// Local directory tree holding torrent data
#[derive(Debug, Clone)]
pub struct FileStorage {
    /// Base download directory
    base_path: PathBuf,
}

impl FileStorage {
    /// Create a file storage rooted at `base_path`
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Get the base path
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Absolute path of a relative torrent path
    pub fn full_path(&self, rel: &str) -> PathBuf {
        rel.split('/')
            .filter(|c| !c.is_empty())
            .fold(self.base_path.clone(), |path, component| path.join(component))
    }

    /// Read up to `length` bytes at `offset`.
    ///
    /// A file that does not exist yet, or is shorter than `offset + length`,
    /// yields a short (possibly empty) buffer rather than an error.
    pub async fn read_at(&self, rel: &str, length: usize, offset: u64) -> Result<Bytes> {
        let file_path = self.full_path(rel);
        trace!("Reading {} bytes from {} at offset {}", length, file_path.display(), offset);

        let mut file_handle = match fs::File::open(&file_path).await {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                trace!("File {} does not exist yet, short read", file_path.display());
                return Ok(Bytes::new());
            }
            Err(e) => {
                error!("Failed to open file '{}': {}", file_path.display(), e);
                return Err(TorrentError::storage_error_full(
                    "Failed to open file for reading",
                    file_path.display().to_string(),
                    e.to_string(),
                )
                .into());
            }
        };

        file_handle.seek(std::io::SeekFrom::Start(offset)).await
            .map_err(|e| {
                error!("Failed to seek in file '{}': {}", file_path.display(), e);
                TorrentError::storage_error_full("Failed to seek in file", file_path.display().to_string(), e.to_string())
            })?;

        let mut buffer = BytesMut::zeroed(length);
        let mut filled = 0;
        while filled < length {
            let n = file_handle.read(&mut buffer[filled..]).await
                .map_err(|e| {
                    error!("Failed to read from file '{}': {}", file_path.display(), e);
                    TorrentError::storage_error_full("Failed to read from file", file_path.display().to_string(), e.to_string())
                })?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buffer.truncate(filled);
        Ok(buffer.freeze())
    }

    /// Write `data` at `offset`, creating the file and its parent directories as needed
    pub async fn write_at(&self, rel: &str, data: &[u8], offset: u64) -> Result<usize> {
        let file_path = self.full_path(rel);
        trace!("Writing {} bytes to {} at offset {}", data.len(), file_path.display(), offset);

        self.ensure_parent(&file_path).await?;

        let mut file_handle = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&file_path)
            .await
            .map_err(|e| {
                error!("Failed to open file '{}': {}", file_path.display(), e);
                TorrentError::storage_error_full("Failed to open file for writing", file_path.display().to_string(), e.to_string())
            })?;

        file_handle.seek(std::io::SeekFrom::Start(offset)).await
            .map_err(|e| {
                error!("Failed to seek in file '{}': {}", file_path.display(), e);
                TorrentError::storage_error_full("Failed to seek in file", file_path.display().to_string(), e.to_string())
            })?;
        file_handle.write_all(data).await
            .map_err(|e| {
                error!("Failed to write to file '{}': {}", file_path.display(), e);
                TorrentError::storage_error_full("Failed to write to file", file_path.display().to_string(), e.to_string())
            })?;
        file_handle.flush().await
            .map_err(|e| {
                error!("Failed to flush file '{}': {}", file_path.display(), e);
                TorrentError::storage_error_full("Failed to flush file", file_path.display().to_string(), e.to_string())
            })?;

        Ok(data.len())
    }

    /// Create an empty file, leaving an existing one untouched
    pub async fn create_zero_length_file(&self, rel: &str) -> Result<()> {
        let file_path = self.full_path(rel);
        debug!("Creating zero-length file: {}", file_path.display());
        self.ensure_parent(&file_path).await?;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&file_path)
            .await
            .map_err(|e| {
                error!("Failed to create file '{}': {}", file_path.display(), e);
                TorrentError::storage_error_full("Failed to create file", file_path.display().to_string(), e.to_string())
            })?;
        Ok(())
    }

    /// Delete a file; a missing file is not an error
    pub async fn remove(&self, rel: &str) -> Result<()> {
        let file_path = self.full_path(rel);
        match fs::remove_file(&file_path).await {
            Ok(()) => {
                debug!("Removed file: {}", file_path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => {
                error!("Failed to remove file '{}': {}", file_path.display(), e);
                Err(TorrentError::storage_error_full("Failed to remove file", file_path.display().to_string(), e.to_string()).into())
            }
        }
    }

    /// Rename a file or directory; a missing source is not an error
    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from_path = self.full_path(from);
        let to_path = self.full_path(to);
        if !fs::try_exists(&from_path).await.unwrap_or(false) {
            debug!("Nothing to rename at {}", from_path.display());
            return Ok(());
        }
        self.ensure_parent(&to_path).await?;
        fs::rename(&from_path, &to_path).await
            .map_err(|e| {
                error!("Failed to rename '{}' to '{}': {}", from_path.display(), to_path.display(), e);
                TorrentError::storage_error_full("Failed to rename", from_path.display().to_string(), e.to_string())
            })?;
        debug!("Renamed {} to {}", from_path.display(), to_path.display());
        Ok(())
    }

    async fn ensure_parent(&self, file_path: &Path) -> Result<()> {
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent).await
                .map_err(|e| {
                    error!("Failed to create directory '{}': {}", parent.display(), e);
                    TorrentError::storage_error_full("Failed to create directory", parent.display().to_string(), e.to_string())
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_read_missing_file_is_short() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path());
        let data = storage.read_at("nope/file.bin", 16, 0).await.unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn test_write_creates_parents_and_reads_back() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path());
        storage.write_at("root/sub/a.bin", b"world", 5).await.unwrap();
        storage.write_at("root/sub/a.bin", b"hello", 0).await.unwrap();

        let data = storage.read_at("root/sub/a.bin", 10, 0).await.unwrap();
        assert_eq!(&data[..], b"helloworld");

        // Past the end of the file is a short read
        let data = storage.read_at("root/sub/a.bin", 10, 8).await.unwrap();
        assert_eq!(&data[..], b"ld");
    }

    #[tokio::test]
    async fn test_rename_and_remove() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path());
        storage.create_zero_length_file("old/empty").await.unwrap();
        storage.rename("old", "new").await.unwrap();
        assert!(storage.full_path("new/empty").exists());

        storage.remove("new/empty").await.unwrap();
        assert!(!storage.full_path("new/empty").exists());
        storage.remove("new/empty").await.unwrap();
    }
}
