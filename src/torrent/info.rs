//! Torrent information structures
//!
//! Immutable description of a torrent's layout, shared read-only by the
//! storage backend and the web-seed engine.

use sha1::{Digest, Sha1};
use anyhow::Result;

use crate::pieces::{self, FileSpan};

/// Represents a file in the torrent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    /// Path components below the torrent root (empty for single-file torrents)
    pub path: Vec<String>,
    /// File size in bytes
    pub length: u64,
}

impl TorrentFile {
    /// Create a file entry from a `/`-separated path
    pub fn new(path: &str, length: u64) -> Self {
        Self {
            path: path.split('/').filter(|c| !c.is_empty()).map(str::to_string).collect(),
            length,
        }
    }
}

/// High-level torrent information
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    /// SHA1 hash of info dictionary
    pub info_hash: [u8; 20],
    /// Torrent name, also the root directory of multi-file torrents
    pub name: String,
    /// Size of each piece in bytes
    pub piece_length: u64,
    /// List of piece hashes (each is a 20-byte SHA1 hash)
    pub pieces: Vec<[u8; 20]>,
    /// Files in declared order; single-file torrents hold one entry with an empty path
    pub files: Vec<TorrentFile>,
    /// True when the metainfo carried a `files` list
    pub multi_file: bool,
    /// BEP 19 `url-list` web seeds
    pub url_list: Vec<String>,
    /// BEP 17 `httpseeds`
    pub http_seeds: Vec<String>,
}

impl TorrentInfo {
    /// Build a descriptor from a file list, without piece hashes.
    ///
    /// Piece count is derived from the total size. Used when the metainfo
    /// comes from somewhere other than a .torrent file.
    pub fn from_files(name: impl Into<String>, piece_length: u64, files: Vec<TorrentFile>) -> Self {
        let total: u64 = files.iter().map(|f| f.length).sum();
        let count = total.div_ceil(piece_length.max(1)) as usize;
        let multi_file = files.len() != 1 || !files[0].path.is_empty();
        Self {
            info_hash: [0u8; 20],
            name: name.into(),
            piece_length,
            pieces: vec![[0u8; 20]; count],
            files,
            multi_file,
            url_list: Vec::new(),
            http_seeds: Vec::new(),
        }
    }

    /// Calculate total size of all files in torrent
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    /// Get number of pieces in torrent
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Length of piece `index`; the last piece may be short
    pub fn piece_length_at(&self, index: u32) -> u64 {
        self.piece_range(index as usize)
            .map_or(0, |(start, end)| end - start)
    }

    /// Check if this is a multi-file torrent
    pub fn is_multi_file(&self) -> bool {
        self.multi_file
    }

    /// Placement of every file in the torrent byte stream
    pub fn file_spans(&self) -> Vec<FileSpan> {
        pieces::file_spans(&self.files, self.piece_length)
    }

    /// Path of file `index` relative to the download directory, `/`-separated.
    ///
    /// `root` replaces the torrent name as the top-level component.
    pub fn relative_path(&self, index: usize, root: &str) -> Option<String> {
        let file = self.files.get(index)?;
        let mut parts = Vec::with_capacity(file.path.len() + 1);
        parts.push(root);
        parts.extend(file.path.iter().map(String::as_str));
        Some(parts.join("/"))
    }

    /// BEP 19 (`url-list`) web seeds, deduplicated.
    ///
    /// BEP 17 `httpseeds` are piece-addressed servers that do not serve the
    /// file tree, so they are only kept in `http_seeds` for reporting.
    pub fn web_seeds(&self) -> Vec<String> {
        let mut seeds: Vec<String> = Vec::with_capacity(self.url_list.len());
        for seed in &self.url_list {
            if !seeds.contains(seed) {
                seeds.push(seed.clone());
            }
        }
        seeds
    }

    /// Get info hash as a hex string
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// Generate info hash from info dictionary bytes
    pub fn generate_info_hash(info_dict_bytes: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(info_dict_bytes);
        let result = hasher.finalize();
        result.into()
    }

    /// Parse piece hashes from concatenated bytes in torrent file
    pub fn parse_piece_hashes(pieces_bytes: &[u8]) -> Result<Vec<[u8; 20]>> {
        if pieces_bytes.len() % 20 != 0 {
            return Err(anyhow::anyhow!(
                "Pieces field length must be a multiple of 20, got {}",
                pieces_bytes.len()
            ));
        }

        let mut pieces = Vec::new();
        for chunk in pieces_bytes.chunks_exact(20) {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            pieces.push(hash);
        }

        Ok(pieces)
    }

    /// Get byte range for a specific piece
    pub fn piece_range(&self, index: usize) -> Option<(u64, u64)> {
        if index >= self.pieces.len() {
            return None;
        }
        let range = pieces::piece_bytes(index as u32, self.piece_length, self.total_size());
        Some((range.start, range.end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_torrent_file_new_splits_path() {
        let file = TorrentFile::new("folder/sub/file.txt", 1024);
        assert_eq!(file.path, vec!["folder", "sub", "file.txt"]);
        assert_eq!(file.length, 1024);
    }

    #[test]
    fn test_from_files_piece_count() {
        let info = TorrentInfo::from_files(
            "multi",
            1024,
            vec![TorrentFile::new("a", 1000), TorrentFile::new("b", 1049)],
        );
        assert_eq!(info.total_size(), 2049);
        assert_eq!(info.piece_count(), 3);
        assert!(info.is_multi_file());
        assert_eq!(info.piece_length_at(2), 1);
        assert_eq!(info.piece_length_at(3), 0);
    }

    #[test]
    fn test_single_file_relative_path() {
        let info = TorrentInfo::from_files("movie.mkv", 1024, vec![TorrentFile::new("", 4096)]);
        assert!(!info.is_multi_file());
        assert_eq!(info.relative_path(0, &info.name).as_deref(), Some("movie.mkv"));
    }

    #[test]
    fn test_multi_file_relative_path_with_root() {
        let info = TorrentInfo::from_files("album", 1024, vec![TorrentFile::new("cd1/01.flac", 10)]);
        assert_eq!(info.relative_path(0, "renamed").as_deref(), Some("renamed/cd1/01.flac"));
        assert_eq!(info.relative_path(1, "renamed"), None);
    }

    #[test]
    fn test_web_seeds_exclude_http_seeds() {
        let mut info = TorrentInfo::from_files("x", 1024, vec![TorrentFile::new("", 1)]);
        info.url_list = vec!["http://a/".to_string(), "http://c/".to_string(), "http://a/".to_string()];
        info.http_seeds = vec!["http://b/announce".to_string()];
        assert_eq!(info.web_seeds(), vec!["http://a/", "http://c/"]);
        assert_eq!(info.http_seeds.len(), 1);
    }

    #[test]
    fn test_parse_piece_hashes_invalid() {
        let hashes = vec![1u8; 21];
        assert!(TorrentInfo::parse_piece_hashes(&hashes).is_err());
    }

    #[test]
    fn test_piece_range() {
        let info = TorrentInfo::from_files("test", 1024, vec![TorrentFile::new("", 1500)]);
        assert_eq!(info.piece_range(0), Some((0, 1024)));
        assert_eq!(info.piece_range(1), Some((1024, 1500)));
        assert_eq!(info.piece_range(2), None);
    }
}
