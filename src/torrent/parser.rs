//! Torrent file parser
//!
//! Decodes .torrent metainfo into a [`TorrentInfo`], including the web seed
//! lists (`url-list`, `httpseeds`).

use std::collections::HashMap;

use anyhow::Result;
use serde_bencode::value::Value;
use tracing::{debug, error, info, trace};

use crate::error::TorrentError;
use crate::torrent::info::{TorrentFile, TorrentInfo};

/// Parser for .torrent files
pub struct TorrentParser;

impl TorrentParser {
    /// Parse a .torrent file from bytes
    pub fn parse_bytes(data: &[u8]) -> Result<TorrentInfo> {
        info!("Parsing torrent file from {} bytes", data.len());
        trace!("Torrent data (first 100 bytes): {:?}", &data[..data.len().min(100)]);

        let root = match serde_bencode::from_bytes::<Value>(data).map_err(TorrentError::from)? {
            Value::Dict(d) => d,
            _ => return Err(TorrentError::parse_error("Root must be a dictionary").into()),
        };

        let info_value = root
            .get(b"info".as_ref())
            .ok_or_else(|| TorrentError::parse_error("Missing info dictionary"))?;
        let info_dict = match info_value {
            Value::Dict(d) => d,
            _ => return Err(TorrentError::parse_error("Info must be a dictionary").into()),
        };

        // Keys are re-emitted sorted, which is the canonical form the hash is defined over.
        let info_bytes = serde_bencode::to_bytes(info_value).map_err(TorrentError::from)?;
        let info_hash = TorrentInfo::generate_info_hash(&info_bytes);

        let name = get_string(info_dict, b"name")
            .ok_or_else(|| TorrentError::parse_error("Missing name field"))?;

        let piece_length = match info_dict.get(b"piece length".as_ref()) {
            Some(Value::Int(n)) if *n > 0 => *n as u64,
            _ => return Err(TorrentError::parse_error("Missing or invalid piece length").into()),
        };

        let pieces_bytes = match info_dict.get(b"pieces".as_ref()) {
            Some(Value::Bytes(b)) => b.as_slice(),
            _ => return Err(TorrentError::parse_error("Missing pieces field").into()),
        };
        let pieces = TorrentInfo::parse_piece_hashes(pieces_bytes)?;

        let (files, multi_file) = Self::parse_files(info_dict)?;

        let url_list = get_string_list(&root, b"url-list");
        let http_seeds = get_string_list(&root, b"httpseeds");
        debug!("Found {} url-list and {} httpseeds entries", url_list.len(), http_seeds.len());

        info!("Successfully parsed torrent: {} ({} files, {} pieces)", name, files.len(), pieces.len());
        Ok(TorrentInfo {
            info_hash,
            name,
            piece_length,
            pieces,
            files,
            multi_file,
            url_list,
            http_seeds,
        })
    }

    /// Parse a .torrent file from a file path
    pub fn parse_file(path: &std::path::Path) -> Result<TorrentInfo> {
        info!("Loading torrent file from: {}", path.display());

        let data = std::fs::read(path)
            .map_err(|e| {
                error!("Failed to read torrent file '{}': {}", path.display(), e);
                TorrentError::storage_error_full("Failed to read torrent file", path.display().to_string(), e.to_string())
            })?;

        debug!("Read {} bytes from torrent file", data.len());
        Self::parse_bytes(&data)
    }

    fn parse_files(info_dict: &HashMap<Vec<u8>, Value>) -> Result<(Vec<TorrentFile>, bool)> {
        if let Some(Value::Int(len)) = info_dict.get(b"length".as_ref()) {
            if *len < 0 {
                return Err(TorrentError::parse_error("Negative length field").into());
            }
            return Ok((vec![TorrentFile { path: Vec::new(), length: *len as u64 }], false));
        }

        let list = match info_dict.get(b"files".as_ref()) {
            Some(Value::List(l)) => l,
            _ => return Err(TorrentError::parse_error("Neither length nor files found in info dict").into()),
        };

        let mut files = Vec::with_capacity(list.len());
        for entry in list {
            let dict = match entry {
                Value::Dict(d) => d,
                _ => return Err(TorrentError::parse_error("File entry must be a dictionary").into()),
            };
            let length = match dict.get(b"length".as_ref()) {
                Some(Value::Int(n)) if *n >= 0 => *n as u64,
                _ => return Err(TorrentError::parse_error("Missing file length").into()),
            };
            let path = match dict.get(b"path".as_ref()) {
                Some(Value::List(parts)) => parts
                    .iter()
                    .filter_map(|p| match p {
                        Value::Bytes(b) => Some(String::from_utf8_lossy(b).to_string()),
                        _ => None,
                    })
                    .collect::<Vec<_>>(),
                _ => return Err(TorrentError::parse_error("Missing file path").into()),
            };
            if path.is_empty() {
                return Err(TorrentError::parse_error("Empty file path").into());
            }
            files.push(TorrentFile { path, length });
        }

        Ok((files, true))
    }
}

fn get_string(dict: &HashMap<Vec<u8>, Value>, key: &[u8]) -> Option<String> {
    match dict.get(key) {
        Some(Value::Bytes(b)) => Some(String::from_utf8_lossy(b).to_string()),
        _ => None,
    }
}

/// `url-list` may be a single string or a list of strings
fn get_string_list(dict: &HashMap<Vec<u8>, Value>, key: &[u8]) -> Vec<String> {
    match dict.get(key) {
        Some(Value::Bytes(b)) if !b.is_empty() => vec![String::from_utf8_lossy(b).to_string()],
        Some(Value::List(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::Bytes(b) if !b.is_empty() => Some(String::from_utf8_lossy(b).to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}
