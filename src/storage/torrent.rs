//! Torrent storage backend
//!
//! Owns the per-torrent selection flags and completion bitmap, and maps
//! torrent-global byte offsets onto the files of the torrent. File data lives
//! either in a local directory tree or behind an injected [`ExternalStorage`]
//! provider keyed by the hex info hash.
//!
//! Completion state is written by both the peer path and the web-seed path;
//! every mutation happens under the one state lock, while file I/O runs
//! outside it.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, trace, warn};

use crate::error::TorrentError;
use crate::pieces::{pending_bitmap, piece_bytes, FileSpan, PieceSet};
use crate::storage::backend::ExternalStorage;
use crate::storage::file::FileStorage;
use crate::torrent::TorrentInfo;
use crate::webseed::sink::{PieceSink, PieceSnapshot};

/// Outcome of [`TorrentStorage::read_at`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResult {
    /// Bytes read, possibly fewer than requested
    pub data: Bytes,
    /// The read reached the last byte of the last file
    pub end_of_stream: bool,
}

/// Per-file progress derived from the completion bitmap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileProgress {
    /// Path relative to the download directory
    pub path: String,
    pub length: u64,
    pub selected: bool,
    /// Bytes of this file covered by completed pieces
    pub bytes_completed: u64,
}

#[derive(Debug)]
struct StorageState {
    selection: Vec<bool>,
    completed: PieceSet,
    /// Root directory override; `None` keeps the torrent name
    root: Option<String>,
    /// Set on the transition to `pending ⊆ completed`, cleared when that stops holding
    torrent_completed: bool,
}

/// Storage backend for one torrent
pub struct TorrentStorage {
    info: Arc<TorrentInfo>,
    spans: Vec<FileSpan>,
    local: FileStorage,
    external: Option<Arc<dyn ExternalStorage>>,
    /// Content identifier passed to the external provider
    id: String,
    state: Mutex<StorageState>,
    completed_tx: watch::Sender<bool>,
}

impl TorrentStorage {
    /// Create a storage backend writing below `base_path`, every file selected
    pub fn new(info: Arc<TorrentInfo>, base_path: impl Into<PathBuf>) -> Self {
        let local = FileStorage::new(base_path);
        info!("Creating storage for torrent: {}", info.name);
        info!("Base path: {}", local.base_path().display());
        Self::build(info, local, None)
    }

    /// Create a storage backend delegating all file access to `provider`
    pub fn with_external(info: Arc<TorrentInfo>, provider: Arc<dyn ExternalStorage>) -> Self {
        info!("Creating external storage for torrent: {} ({})", info.name, info.info_hash_hex());
        Self::build(info, FileStorage::new(PathBuf::new()), Some(provider))
    }

    fn build(info: Arc<TorrentInfo>, local: FileStorage, external: Option<Arc<dyn ExternalStorage>>) -> Self {
        let spans = info.file_spans();
        let (completed_tx, _) = watch::channel(false);
        let state = StorageState {
            selection: vec![true; info.files.len()],
            completed: PieceSet::new(),
            root: None,
            torrent_completed: false,
        };
        debug!("Storage tracks {} files over {} pieces", spans.len(), info.piece_count());
        Self {
            id: info.info_hash_hex(),
            info,
            spans,
            local,
            external,
            state: Mutex::new(state),
            completed_tx,
        }
    }

    /// Get the torrent info
    pub fn info(&self) -> &Arc<TorrentInfo> {
        &self.info
    }

    /// Content identifier (hex info hash)
    pub fn id(&self) -> &str {
        &self.id
    }

    // ==================== Piece oracle ====================

    /// Get total piece count
    pub fn num_pieces(&self) -> u32 {
        self.info.piece_count() as u32
    }

    /// Length of piece `index` in bytes
    pub fn piece_length(&self, index: u32) -> u64 {
        self.info.piece_length_at(index)
    }

    /// Check whether piece `index` is marked complete
    pub async fn is_piece_complete(&self, index: u32) -> bool {
        self.state.lock().await.completed.contains(index)
    }

    /// Copy of the completion bitmap
    pub async fn completed_pieces(&self) -> PieceSet {
        self.state.lock().await.completed.clone()
    }

    /// Pieces spanned by the selected files
    pub async fn pending_pieces(&self) -> PieceSet {
        let state = self.state.lock().await;
        pending_bitmap(&self.info.files, &state.selection, self.info.piece_length)
    }

    /// Check if every selected piece is complete
    pub async fn is_complete(&self) -> bool {
        self.state.lock().await.torrent_completed
    }

    /// Watch the "torrent completed" signal
    pub fn subscribe_completed(&self) -> watch::Receiver<bool> {
        self.completed_tx.subscribe()
    }

    // ==================== Data ====================

    /// Read up to `length` bytes at torrent offset `offset`.
    ///
    /// Stops at the first missing or short file. `end_of_stream` is only set
    /// when the read reaches the end of the last file.
    pub async fn read_at(&self, offset: u64, length: usize) -> Result<ReadResult> {
        let total = self.info.total_size();
        let end = offset.saturating_add(length as u64).min(total);
        let root = self.display_name().await;
        trace!("Reading {} bytes at offset {}", length, offset);

        let mut buffer = BytesMut::with_capacity(end.saturating_sub(offset) as usize);
        let mut cursor = offset;
        for span in &self.spans {
            if cursor >= end {
                break;
            }
            let span_end = span.offset + span.length;
            if span.length == 0 || span_end <= cursor {
                continue;
            }
            let want = (end.min(span_end) - cursor) as usize;
            let rel = self.file_path(span.index, &root);
            let chunk = self.read_file(&rel, want, cursor - span.offset).await?;
            buffer.extend_from_slice(&chunk);
            cursor += chunk.len() as u64;
            if chunk.len() < want {
                trace!("Short read from {}: {} of {} bytes", rel, chunk.len(), want);
                break;
            }
        }

        Ok(ReadResult {
            data: buffer.freeze(),
            end_of_stream: cursor >= total,
        })
    }

    /// Write `data` at torrent offset `offset`, split across file boundaries.
    ///
    /// A failure aborts the remaining write; nothing is marked complete here.
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize> {
        let total = self.info.total_size();
        let end = offset.saturating_add(data.len() as u64);
        if end > total {
            error!("Write of {} bytes at offset {} exceeds torrent size {}", data.len(), offset, total);
            return Err(TorrentError::validation_error_with_field(
                format!("Write past end of torrent ({} > {})", end, total),
                "offset",
            )
            .into());
        }
        let root = self.display_name().await;
        trace!("Writing {} bytes at offset {}", data.len(), offset);

        let mut cursor = offset;
        let mut written = 0usize;
        for span in &self.spans {
            if cursor >= end {
                break;
            }
            let span_end = span.offset + span.length;
            if span.length == 0 || span_end <= cursor {
                continue;
            }
            let n = (end.min(span_end) - cursor) as usize;
            let rel = self.file_path(span.index, &root);
            self.write_file(&rel, &data[written..written + n], cursor - span.offset).await?;
            written += n;
            cursor += n as u64;
        }

        Ok(written)
    }

    // ==================== Completion ====================

    /// Mark piece `index` complete.
    ///
    /// Returns `true` when this call completed the torrent: the selected
    /// zero-length files were created and the completion signal was sent.
    pub async fn mark_complete(&self, index: u32) -> Result<bool> {
        self.check_piece(index)?;
        let materialize = {
            let mut state = self.state.lock().await;
            if !state.completed.contains(index) {
                trace!("Piece {} complete", index);
            }
            state.completed.add(index);
            self.reconcile(&mut state)
        };
        self.finish(materialize).await
    }

    /// Clear piece `index`, e.g. after failed verification
    pub async fn mark_incomplete(&self, index: u32) -> Result<()> {
        self.check_piece(index)?;
        let materialize = {
            let mut state = self.state.lock().await;
            state.completed.remove(index);
            debug!("Piece {} marked incomplete", index);
            self.reconcile(&mut state)
        };
        self.finish(materialize).await.map(|_| ())
    }

    /// Re-evaluate completion without touching any piece.
    ///
    /// A selection made only of zero-length files spans no piece, so no
    /// `mark_complete` call would ever complete it.
    pub async fn check_completion(&self) -> Result<bool> {
        let materialize = {
            let mut state = self.state.lock().await;
            self.reconcile(&mut state)
        };
        self.finish(materialize).await
    }

    /// Drop every completed piece, for a full re-verification
    pub async fn clear_completed(&self) {
        let mut state = self.state.lock().await;
        info!("Clearing completion state for {}", self.info.name);
        state.completed.clear();
        if state.torrent_completed {
            state.torrent_completed = false;
            self.completed_tx.send_replace(false);
        }
    }

    /// Re-check `pending ⊆ completed` under the lock.
    ///
    /// Returns the root and zero-length files to create when the torrent just
    /// transitioned to complete.
    fn reconcile(&self, state: &mut StorageState) -> Option<(String, Vec<usize>)> {
        let pending = pending_bitmap(&self.info.files, &state.selection, self.info.piece_length);
        let complete = pending.is_subset(&state.completed);
        match (state.torrent_completed, complete) {
            (true, false) => {
                debug!("Torrent {} no longer complete", self.info.name);
                state.torrent_completed = false;
                self.completed_tx.send_replace(false);
                None
            }
            (false, true) => {
                state.torrent_completed = true;
                let root = state.root.clone().unwrap_or_else(|| self.info.name.clone());
                let empty = self
                    .spans
                    .iter()
                    .filter(|s| s.length == 0 && state.selection[s.index])
                    .map(|s| s.index)
                    .collect();
                Some((root, empty))
            }
            _ => None,
        }
    }

    /// Create the zero-length files, then emit the signal
    async fn finish(&self, materialize: Option<(String, Vec<usize>)>) -> Result<bool> {
        let Some((root, empty)) = materialize else {
            return Ok(false);
        };

        for index in empty {
            let rel = self.file_path(index, &root);
            let created = match &self.external {
                Some(provider) => provider.create_zero_length_file(&self.id, &rel).await,
                None => self.local.create_zero_length_file(&rel).await,
            };
            if let Err(e) = created {
                error!("Failed to create zero-length file {}: {}", rel, e);
                self.state.lock().await.torrent_completed = false;
                return Err(e);
            }
        }

        let state = self.state.lock().await;
        if !state.torrent_completed {
            // Lost a race with mark_incomplete while creating files.
            return Ok(false);
        }
        self.completed_tx.send_replace(true);
        info!("Torrent completed: {}", self.info.name);
        Ok(true)
    }

    // ==================== Selection ====================

    /// Select or deselect file `index`
    pub async fn set_selected(&self, index: usize, wanted: bool) -> Result<()> {
        if index >= self.info.files.len() {
            return Err(TorrentError::validation_error_with_field(
                format!("File index {} out of range", index),
                "index",
            )
            .into());
        }
        let materialize = {
            let mut state = self.state.lock().await;
            state.selection[index] = wanted;
            debug!("File {} selected: {}", index, wanted);
            self.reconcile(&mut state)
        };
        self.finish(materialize).await.map(|_| ())
    }

    /// Select or deselect every file
    pub async fn select_all(&self, wanted: bool) -> Result<()> {
        let materialize = {
            let mut state = self.state.lock().await;
            state.selection.iter_mut().for_each(|s| *s = wanted);
            self.reconcile(&mut state)
        };
        self.finish(materialize).await.map(|_| ())
    }

    /// Apply `wanted` to every file whose relative path matches `pattern`.
    ///
    /// `*` matches any run of characters, `?` a single one; case-insensitive.
    /// Returns the number of files matched.
    pub async fn select_matching(&self, pattern: &str, wanted: bool) -> Result<usize> {
        let materialize;
        let mut matched = 0;
        {
            let mut state = self.state.lock().await;
            let root = state.root.clone().unwrap_or_else(|| self.info.name.clone());
            for index in 0..self.info.files.len() {
                let path = self.file_path(index, &root);
                if wildcard_match(pattern, &path) {
                    state.selection[index] = wanted;
                    matched += 1;
                }
            }
            materialize = self.reconcile(&mut state);
        }
        info!("Pattern '{}' matched {} files (selected: {})", pattern, matched, wanted);
        self.finish(materialize).await?;
        Ok(matched)
    }

    /// Current selection flags
    pub async fn selection(&self) -> Vec<bool> {
        self.state.lock().await.selection.clone()
    }

    // ==================== Naming ====================

    /// Root directory name: the override if set, else the torrent name
    pub async fn display_name(&self) -> String {
        let state = self.state.lock().await;
        state.root.clone().unwrap_or_else(|| self.info.name.clone())
    }

    /// Override the root directory name without touching existing data
    ///
    /// An empty name restores the torrent name.
    pub async fn set_display_name(&self, name: impl Into<String>) {
        let name = name.into();
        let mut state = self.state.lock().await;
        state.root = if name.is_empty() { None } else { Some(name) };
    }

    /// Rename the on-disk root and record it as the override
    pub async fn rename_root(&self, new_name: &str) -> Result<()> {
        if new_name.is_empty() || new_name.contains('/') {
            return Err(TorrentError::validation_error_with_field("Invalid root name", "name").into());
        }
        let old = self.display_name().await;
        if old == new_name {
            return Ok(());
        }
        info!("Renaming torrent root '{}' to '{}'", old, new_name);
        match &self.external {
            Some(provider) => provider.rename(&self.id, &old, new_name).await?,
            None => self.local.rename(&old, new_name).await?,
        }
        self.set_display_name(new_name).await;
        Ok(())
    }

    // ==================== Housekeeping ====================

    /// Delete every unselected file sharing no piece with a selected file,
    /// and forget its pieces. Returns the number of files removed.
    pub async fn delete_unselected(&self) -> Result<usize> {
        let (root, victims) = {
            let mut state = self.state.lock().await;
            let pending = pending_bitmap(&self.info.files, &state.selection, self.info.piece_length);
            let victims: Vec<FileSpan> = self
                .spans
                .iter()
                .filter(|s| !state.selection[s.index])
                .filter(|s| !pending.intersects_range(s.pieces.start, s.pieces.end))
                .cloned()
                .collect();
            for span in &victims {
                state.completed.remove_range(span.pieces.start, span.pieces.end);
            }
            let root = state.root.clone().unwrap_or_else(|| self.info.name.clone());
            (root, victims)
        };

        for span in &victims {
            let rel = self.file_path(span.index, &root);
            match &self.external {
                Some(provider) => provider.remove(&self.id, &rel).await?,
                None => self.local.remove(&rel).await?,
            }
        }
        if !victims.is_empty() {
            info!("Deleted {} unselected files", victims.len());
        }
        Ok(victims.len())
    }

    /// Per-file progress, exact to the byte
    pub async fn file_progress(&self) -> Vec<FileProgress> {
        let state = self.state.lock().await;
        let root = state.root.clone().unwrap_or_else(|| self.info.name.clone());
        let total = self.info.total_size();
        self.spans
            .iter()
            .map(|span| {
                let bytes_completed = state
                    .completed
                    .runs_within(span.pieces.start, span.pieces.end)
                    .map(|(s, e)| {
                        let start = piece_bytes(s, self.info.piece_length, total).start.max(span.offset);
                        let end = piece_bytes(e - 1, self.info.piece_length, total)
                            .end
                            .min(span.offset + span.length);
                        end.saturating_sub(start)
                    })
                    .sum();
                FileProgress {
                    path: self.file_path(span.index, &root),
                    length: span.length,
                    selected: state.selection[span.index],
                    bytes_completed,
                }
            })
            .collect()
    }

    // ==================== Internals ====================

    fn check_piece(&self, index: u32) -> Result<()> {
        if index >= self.num_pieces() {
            warn!("Invalid piece index: {}", index);
            return Err(TorrentError::validation_error_with_field("Invalid piece index", "piece_index").into());
        }
        Ok(())
    }

    fn file_path(&self, index: usize, root: &str) -> String {
        self.info.relative_path(index, root).unwrap_or_default()
    }

    async fn read_file(&self, rel: &str, length: usize, offset: u64) -> Result<Bytes> {
        match &self.external {
            Some(provider) => provider.read_file_at(&self.id, rel, length, offset).await,
            None => self.local.read_at(rel, length, offset).await,
        }
    }

    async fn write_file(&self, rel: &str, data: &[u8], offset: u64) -> Result<()> {
        let n = match &self.external {
            Some(provider) => provider.write_file_at(&self.id, rel, data, offset).await?,
            None => self.local.write_at(rel, data, offset).await?,
        };
        if n != data.len() {
            error!("Short write to {}: {} of {} bytes", rel, n, data.len());
            return Err(TorrentError::storage_error_with_path(
                format!("Short write ({} of {} bytes)", n, data.len()),
                rel,
            )
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl PieceSink for TorrentStorage {
    async fn snapshot(&self) -> PieceSnapshot {
        let state = self.state.lock().await;
        PieceSnapshot {
            selection: state.selection.clone(),
            completed: state.completed.clone(),
        }
    }

    async fn is_piece_complete(&self, index: u32) -> bool {
        TorrentStorage::is_piece_complete(self, index).await
    }

    async fn write_chunk(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.write_at(offset, data).await.map(|_| ())
    }

    async fn piece_delivered(&self, index: u32) -> Result<()> {
        self.mark_complete(index).await.map(|_| ())
    }
}

/// Case-insensitive glob match supporting `*` and `?`
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.to_lowercase().chars().collect();
    let t: Vec<char> = text.to_lowercase().chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if let Some((star, matched)) = backtrack {
            pi = star + 1;
            ti = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}
