//! Web-seed scheduling decisions
//!
//! The [`Planner`] owns the web-file, task and mirror tables of one torrent.
//! It performs no I/O: the engine feeds it selection/completion snapshots,
//! probe results and task outcomes, and asks it for one action at a time
//! with [`Planner::plan`] until it answers [`PlanOutcome::Wait`] or
//! [`PlanOutcome::Idle`].
//!
//! Byte regions of active tasks are disjoint by construction: a file with no
//! task gets one covering its whole remaining range, and further tasks are
//! only created by cutting the tail off an existing one.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::WebSeedConfig;
use crate::pieces::{pending_bitmap, PieceSet};
use crate::torrent::TorrentInfo;
use crate::webseed::file::{FileId, WebFile};
use crate::webseed::mirror::{Mirror, MirrorEvent, MirrorId, MirrorState};
use crate::webseed::sink::PieceSnapshot;
use crate::webseed::transport::ProbeReport;

/// Identifier of a download task, unique per planner
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

#[derive(Debug)]
struct WindowState {
    /// Exclusive end piece
    end: u32,
    /// Torrent byte offset up to which the task has claimed its region
    claimed: u64,
}

/// Live piece window of a task, shared between the planner and the task.
///
/// The task claims bytes before writing them; the planner only ever moves
/// `end` down, and never below what has been claimed.
#[derive(Debug, Clone)]
pub struct TaskWindow {
    start: u32,
    piece_length: u64,
    state: Arc<Mutex<WindowState>>,
}

impl TaskWindow {
    fn new(start: u32, end: u32, piece_length: u64, claimed: u64) -> Self {
        Self {
            start,
            piece_length,
            state: Arc::new(Mutex::new(WindowState { end, claimed })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WindowState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.lock().end
    }

    pub fn claimed(&self) -> u64 {
        self.lock().claimed
    }

    /// Live end of the window in torrent bytes
    pub fn end_bytes(&self) -> u64 {
        u64::from(self.end()) * self.piece_length
    }

    /// Claim torrent bytes `[offset, offset + length)` for writing.
    ///
    /// Returns how many bytes from `offset` lie inside the live window; zero
    /// once `offset` is at or past its end.
    pub fn claim(&self, offset: u64, length: u64) -> u64 {
        let mut state = self.lock();
        let limit = u64::from(state.end) * self.piece_length;
        if offset >= limit {
            return 0;
        }
        let allowed = length.min(limit - offset);
        state.claimed = state.claimed.max(offset + allowed);
        allowed
    }

    /// First piece not touched by a claim
    fn unclaimed_from(&self, state: &WindowState) -> u32 {
        (state.claimed.div_ceil(self.piece_length) as u32).max(self.start)
    }
}

/// A task in the active-task table
#[derive(Debug)]
struct DownloadTask {
    mirror: MirrorId,
    file: FileId,
    window: TaskWindow,
    /// Remaining pieces of the file inside the window at dispatch
    pieces: PieceSet,
    cancel: CancellationToken,
}

/// Everything a freshly dispatched task needs to run outside the lock
#[derive(Debug, Clone)]
pub struct TaskJob {
    pub id: TaskId,
    pub mirror: MirrorId,
    pub mirror_url: String,
    pub ranges_supported: bool,
    pub file: FileId,
    /// Torrent byte range of the file
    pub file_bytes: Range<u64>,
    /// Torrent byte ranges to fetch, ascending
    pub wanted: Vec<Range<u64>>,
    pub window: TaskWindow,
    pub cancel: CancellationToken,
    pub mirror_downloaded: Arc<AtomicU64>,
    pub file_downloaded: Arc<AtomicU64>,
}

/// A probe to run outside the lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeJob {
    pub mirror: MirrorId,
    pub mirror_url: String,
    /// File whose URL is probed
    pub target: FileId,
}

/// One planning decision
#[derive(Debug)]
pub enum PlanOutcome {
    /// A task was added to the table and must be started
    Dispatched(TaskJob),
    /// A mirror was moved to `Probing` and must be probed
    Probe(ProbeJob),
    /// Nothing to do before the deadline
    Wait(Instant),
    /// Nothing to do until the next event
    Idle,
}

/// How a task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Reached the end of its window
    Completed,
    Cancelled,
    /// Network or protocol failure, blamed on the mirror
    MirrorFailed(String),
    /// Local write failure, blamed on nobody
    StorageFailed(String),
}

/// Reporting view of a mirror
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorStats {
    pub url: String,
    pub state: MirrorState,
    pub active_tasks: usize,
    pub downloaded: u64,
    pub last_error: Option<String>,
}

/// Reporting view of a web file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStats {
    pub path: String,
    pub downloaded: u64,
    pub remaining_pieces: u64,
    pub active_tasks: usize,
}

/// Scheduling state of one torrent's web seeding
#[derive(Debug)]
pub struct Planner {
    info: Arc<TorrentInfo>,
    config: WebSeedConfig,
    mirrors: Vec<Mirror>,
    files: BTreeMap<FileId, WebFile>,
    tasks: BTreeMap<TaskId, DownloadTask>,
    next_task: u64,
    /// Bytes already downloaded per file, kept across rescans that drop the file
    file_counters: BTreeMap<FileId, Arc<AtomicU64>>,
    /// Pieces whose bytes inside a file were all written by a completed task,
    /// while the piece itself still waits for a neighbouring file
    delivered: BTreeMap<FileId, PieceSet>,
}

impl Planner {
    pub fn new(info: Arc<TorrentInfo>, config: WebSeedConfig, mirrors: &[String]) -> Self {
        Self {
            info,
            config,
            mirrors: mirrors.iter().map(Mirror::new).collect(),
            files: BTreeMap::new(),
            tasks: BTreeMap::new(),
            next_task: 0,
            file_counters: BTreeMap::new(),
            delivered: BTreeMap::new(),
        }
    }

    /// Forget every file, task and probe result; mirrors start unprobed again
    pub fn reset(&mut self) {
        self.cancel_all();
        self.files.clear();
        self.delivered.clear();
        self.mirrors = self.mirrors.iter().map(|m| Mirror::new(m.url.clone())).collect();
    }

    /// Add a mirror, ignoring duplicates
    pub fn add_mirror(&mut self, url: &str) -> Option<MirrorId> {
        if self.mirrors.iter().any(|m| m.url == url) {
            return None;
        }
        self.mirrors.push(Mirror::new(url));
        Some(MirrorId(self.mirrors.len() - 1))
    }

    pub fn active_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn has_files(&self) -> bool {
        !self.files.is_empty()
    }

    pub fn mirror(&self, id: MirrorId) -> Option<&Mirror> {
        self.mirrors.get(id.0)
    }

    /// First non-empty file: the probe target
    pub fn probe_target(&self) -> Option<(FileId, u64)> {
        self.info
            .files
            .iter()
            .enumerate()
            .find(|(_, f)| f.length > 0)
            .map(|(i, f)| (FileId(i), f.length))
    }

    // ==================== Scanning ====================

    /// Recompute the web-file set from a fresh snapshot.
    ///
    /// Remaining pieces are `candidate − completed`, where the candidate is
    /// the whole piece range of a selected file, or the part of an unselected
    /// file's range shared with selected files. Pieces this file already
    /// delivered its part of are left out too. Files left with nothing are
    /// dropped and their tasks cancelled; surviving tasks have their window
    /// clamped to the file's new bounds. Returns the cancelled tasks.
    pub fn rescan(&mut self, snapshot: &PieceSnapshot) -> Vec<TaskId> {
        let mut cancelled = self.scan(snapshot);

        // Delivered pieces that never completed (the sink rejected them, or
        // they were marked incomplete again) would otherwise stall forever.
        if self.files.is_empty() && self.tasks.is_empty() && !self.delivered.is_empty() {
            warn!(
                "{} files have delivered pieces that never completed, refetching",
                self.delivered.len()
            );
            self.delivered.clear();
            cancelled.extend(self.scan(snapshot));
        }
        cancelled
    }

    fn scan(&mut self, snapshot: &PieceSnapshot) -> Vec<TaskId> {
        let piece_length = self.info.piece_length;
        let pending = pending_bitmap(&self.info.files, &snapshot.selection, piece_length);
        let mut cancelled = Vec::new();

        for span in self.info.file_spans() {
            if span.length == 0 {
                continue;
            }
            let id = FileId(span.index);
            let selected = snapshot.selection.get(span.index).copied().unwrap_or(false);
            let candidate = if selected {
                Some(PieceSet::from_range(span.pieces.start, span.pieces.end))
            } else if pending.intersects_range(span.pieces.start, span.pieces.end) {
                Some(PieceSet::from_range(span.pieces.start, span.pieces.end).intersection(&pending))
            } else {
                None
            };
            let mut remaining = candidate.map(|c| c.difference(&snapshot.completed)).unwrap_or_default();
            if let Some(delivered) = self.delivered.get_mut(&id) {
                delivered.subtract(&snapshot.completed);
                if delivered.is_empty() {
                    self.delivered.remove(&id);
                } else {
                    remaining.subtract(delivered);
                }
            }

            if remaining.is_empty() {
                if self.files.remove(&id).is_some() {
                    debug!("File {} has nothing left to fetch", id);
                    cancelled.extend(self.cancel_file_tasks(id));
                }
                continue;
            }

            let Some(last) = remaining.last() else { continue };
            let upper = last + 1;
            match self.files.get_mut(&id) {
                Some(file) => file.remaining = remaining,
                None => {
                    let path = self.info.relative_path(span.index, &self.info.name).unwrap_or_default();
                    let mut file = WebFile::new(&span, path, remaining);
                    file.downloaded = self.file_counters.entry(id).or_default().clone();
                    trace!("Tracking {} ({} pieces left)", file.path, file.remaining.len());
                    self.files.insert(id, file);
                }
            }

            for task in self.tasks.values().filter(|t| t.file == id) {
                let mut window = task.window.lock();
                if window.end > upper {
                    window.end = upper;
                }
            }
        }

        if !cancelled.is_empty() {
            info!("Rescan cancelled {} tasks", cancelled.len());
        }
        cancelled
    }

    // ==================== Planning ====================

    /// Decide the next action. Performs at most one dispatch, split or probe.
    pub fn plan(&mut self, now: Instant) -> PlanOutcome {
        if self.tasks.len() >= self.config.max_active_tasks {
            trace!("At task ceiling ({})", self.tasks.len());
            return PlanOutcome::Idle;
        }
        if self.files.is_empty() {
            return PlanOutcome::Idle;
        }

        if let Some(probe) = self.start_probe(|m| matches!(m.state(), MirrorState::Unprobed)) {
            return PlanOutcome::Probe(probe);
        }

        for file in self.files.values_mut() {
            if file.retry_after.is_some_and(|at| at <= now) {
                file.retry_after = None;
            }
        }

        let idle_file = self
            .files
            .values()
            .find(|f| !f.held_back(now) && !self.tasks.values().any(|t| t.file == f.id))
            .map(|f| f.id);

        if let Some(file) = idle_file {
            if let Some(job) = self.dispatch(file) {
                return PlanOutcome::Dispatched(job);
            }
        } else if let Some(job) = self.split() {
            return PlanOutcome::Dispatched(job);
        }

        if let Some(probe) = self.start_probe(|m| m.probe_due(now)) {
            return PlanOutcome::Probe(probe);
        }

        if self.tasks.is_empty() {
            let deadline = self
                .mirrors
                .iter()
                .filter_map(Mirror::quarantined_until)
                .chain(self.files.values().filter_map(|f| f.retry_after))
                .filter(|&at| at > now)
                .min();
            if let Some(at) = deadline {
                debug!("Nothing schedulable, waking in {:?}", at - now);
                return PlanOutcome::Wait(at);
            }
        }
        PlanOutcome::Idle
    }

    fn start_probe(&mut self, due: impl Fn(&Mirror) -> bool) -> Option<ProbeJob> {
        let (target, _) = self.probe_target()?;
        let (index, mirror) = self.mirrors.iter_mut().enumerate().find(|(_, m)| due(m))?;
        mirror.transition(MirrorEvent::ProbeStarted);
        Some(ProbeJob {
            mirror: MirrorId(index),
            mirror_url: mirror.url.clone(),
            target,
        })
    }

    /// Start one task covering the whole remaining range of `file`
    fn dispatch(&mut self, file: FileId) -> Option<TaskJob> {
        let per_mirror = self.config.max_tasks_per_mirror;
        let mirror = self
            .mirrors
            .iter()
            .position(|m| m.usable_now() && m.active < per_mirror)
            .map(MirrorId)?;
        let (start, end) = self.files.get(&file)?.bounds()?;
        let url = &self.mirrors[mirror.0].url;
        debug!("Dispatching {} pieces [{}, {}) to {}", file, start, end, url);
        Some(self.add_task(mirror, file, start, end))
    }

    /// Cut the tail off the least-split task and hand it to a free mirror
    fn split(&mut self) -> Option<TaskJob> {
        let per_mirror = self.config.max_tasks_per_mirror;
        let mirror = self
            .mirrors
            .iter()
            .enumerate()
            .filter(|(_, m)| m.supports_ranges() && m.active < per_mirror)
            .min_by_key(|(_, m)| m.active)
            .map(|(i, _)| MirrorId(i))?;

        let piece_length = self.info.piece_length;
        let threshold = self.config.split_threshold_pieces(piece_length);
        let max_parts = self.config.max_splits_per_file.min(self.config.max_active_tasks) as u32;

        let mut per_file: BTreeMap<FileId, usize> = BTreeMap::new();
        for task in self.tasks.values() {
            *per_file.entry(task.file).or_default() += 1;
        }

        // Least-split first, then the largest remaining span.
        let mut candidates: Vec<(usize, u32, TaskId)> = self
            .tasks
            .iter()
            .filter_map(|(&id, task)| {
                let count = per_file.get(&task.file).copied().unwrap_or(0);
                if count >= self.config.max_splits_per_file {
                    return None;
                }
                let floor = self.files.get(&task.file)?.remaining.first()?;
                let state = task.window.lock();
                let base = task.window.unclaimed_from(&state).max(floor);
                Some((count, state.end.saturating_sub(base), id))
            })
            .collect();
        candidates.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)).then(a.2.cmp(&b.2)));

        for (_, _, id) in candidates {
            let Some(task) = self.tasks.get(&id) else { continue };
            let file = task.file;
            let Some(floor) = self.files.get(&file).and_then(|f| f.remaining.first()) else { continue };

            // Cut under the window lock so the task cannot claim past it meanwhile.
            let (cut, end) = {
                let mut state = task.window.lock();
                let base = task.window.unclaimed_from(&state).max(floor);
                let span = state.end.saturating_sub(base);
                if span < 2 * threshold {
                    continue;
                }
                let mut parts = max_parts.max(2);
                while parts > 2 && span / parts < threshold {
                    parts -= 1;
                }
                let grab = span / parts;
                if grab < threshold {
                    continue;
                }
                let cut = base + grab;
                let old_end = state.end;
                state.end = cut;
                (cut, old_end)
            };

            let url = &self.mirrors[mirror.0].url;
            debug!("Splitting {} at piece {}: new task [{}, {}) on {}", id, cut, cut, end, url);
            return Some(self.add_task(mirror, file, cut, end));
        }
        None
    }

    fn add_task(&mut self, mirror: MirrorId, file: FileId, start: u32, end: u32) -> TaskJob {
        let piece_length = self.info.piece_length;
        let id = TaskId(self.next_task);
        self.next_task += 1;

        let web_file = &self.files[&file];
        let file_bytes = web_file.bytes();
        let claimed = (u64::from(start) * piece_length).max(file_bytes.start);
        let window = TaskWindow::new(start, end, piece_length, claimed);
        let cancel = CancellationToken::new();
        let wanted = web_file.wanted_bytes(start, end, piece_length);
        let pieces = PieceSet::from_range(start, end).intersection(&web_file.remaining);
        let file_downloaded = web_file.downloaded.clone();

        let source = &mut self.mirrors[mirror.0];
        source.active += 1;

        self.tasks.insert(
            id,
            DownloadTask {
                mirror,
                file,
                window: window.clone(),
                pieces,
                cancel: cancel.clone(),
            },
        );

        TaskJob {
            id,
            mirror,
            mirror_url: source.url.clone(),
            ranges_supported: source.supports_ranges(),
            file,
            file_bytes,
            wanted,
            window,
            cancel,
            mirror_downloaded: source.downloaded.clone(),
            file_downloaded,
        }
    }

    // ==================== Events ====================

    /// Apply a probe result.
    ///
    /// A reported size that contradicts the probe target's length is treated
    /// as a mirror fault.
    pub fn record_probe(
        &mut self,
        mirror: MirrorId,
        result: Result<ProbeReport, String>,
        now: Instant,
    ) {
        let expected = self.probe_target().map(|(_, len)| len);
        let until = now + self.config.quarantine();
        let Some(source) = self.mirrors.get_mut(mirror.0) else {
            warn!("Probe result for unknown {}", mirror);
            return;
        };
        let event = match result {
            Ok(report) => match (report.length, expected) {
                (Some(reported), Some(expected)) if reported != expected => MirrorEvent::Failed {
                    until,
                    error: format!("Size mismatch: mirror reports {} bytes, expected {}", reported, expected),
                },
                _ => MirrorEvent::ProbeSucceeded {
                    ranges: report.ranges,
                    length: report.length,
                },
            },
            Err(error) => MirrorEvent::Failed { until, error },
        };
        source.transition(event);
    }

    /// Remove a finished task from the table and account for its outcome.
    ///
    /// Unknown ids (tasks already cancelled by a rescan) are ignored.
    pub fn task_finished(&mut self, id: TaskId, outcome: TaskOutcome, now: Instant) {
        let Some(task) = self.tasks.remove(&id) else {
            trace!("{} already removed", id);
            return;
        };
        let until = now + self.config.quarantine();
        if let Some(mirror) = self.mirrors.get_mut(task.mirror.0) {
            mirror.active = mirror.active.saturating_sub(1);
            if let TaskOutcome::MirrorFailed(error) = &outcome {
                mirror.transition(MirrorEvent::Failed { until, error: error.clone() });
            }
        }
        match outcome {
            TaskOutcome::Completed => {
                let mut pieces = task.pieces;
                pieces.remove_range(task.window.end(), u32::MAX);
                trace!("{} delivered {} pieces of {}", id, pieces.len(), task.file);
                let delivered = self.delivered.entry(task.file).or_default();
                for (start, end) in pieces.runs() {
                    delivered.add_range(start, end);
                }
            }
            TaskOutcome::StorageFailed(error) => {
                if let Some(file) = self.files.get_mut(&task.file) {
                    warn!("Holding back {} after storage failure: {}", file.path, error);
                    file.retry_after = Some(until);
                }
            }
            outcome => trace!("{} finished: {:?}", id, outcome),
        }
    }

    fn cancel_file_tasks(&mut self, file: FileId) -> Vec<TaskId> {
        let ids: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|(_, t)| t.file == file)
            .map(|(&id, _)| id)
            .collect();
        for id in &ids {
            self.cancel_task(*id);
        }
        ids
    }

    fn cancel_task(&mut self, id: TaskId) {
        if let Some(task) = self.tasks.remove(&id) {
            task.cancel.cancel();
            if let Some(mirror) = self.mirrors.get_mut(task.mirror.0) {
                mirror.active = mirror.active.saturating_sub(1);
            }
            debug!("Cancelled {}", id);
        }
    }

    /// Cancel and remove every task
    pub fn cancel_all(&mut self) {
        let ids: Vec<TaskId> = self.tasks.keys().copied().collect();
        for id in ids {
            self.cancel_task(id);
        }
    }

    // ==================== Reporting ====================

    pub fn mirror_stats(&self) -> Vec<MirrorStats> {
        self.mirrors
            .iter()
            .map(|m| MirrorStats {
                url: m.url.clone(),
                state: m.state(),
                active_tasks: m.active,
                downloaded: m.downloaded_bytes(),
                last_error: m.last_error.clone(),
            })
            .collect()
    }

    pub fn file_stats(&self) -> Vec<FileStats> {
        self.files
            .values()
            .map(|f| FileStats {
                path: f.path.clone(),
                downloaded: f.downloaded_bytes(),
                remaining_pieces: f.remaining.len(),
                active_tasks: self.tasks.values().filter(|t| t.file == f.id).count(),
            })
            .collect()
    }

    /// Piece windows `(file, start, end)` of the active tasks
    pub fn task_windows(&self) -> Vec<(FileId, u32, u32)> {
        self.tasks
            .values()
            .map(|t| (t.file, t.window.start(), t.window.end()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::TorrentFile;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::time::Duration;

    const PIECE: u64 = 16384;

    fn planner(files: Vec<TorrentFile>, mirrors: &[&str], config: WebSeedConfig) -> Planner {
        let info = Arc::new(TorrentInfo::from_files("t", PIECE, files));
        let mirrors: Vec<String> = mirrors.iter().map(|m| m.to_string()).collect();
        Planner::new(info, config, &mirrors)
    }

    fn all_selected(p: &Planner) -> PieceSnapshot {
        PieceSnapshot {
            selection: vec![true; p.info.files.len()],
            completed: PieceSet::new(),
        }
    }

    fn ready(p: &mut Planner, now: Instant) {
        for i in 0..p.mirrors.len() {
            p.mirrors[i].transition(MirrorEvent::ProbeStarted);
            p.record_probe(MirrorId(i), Ok(ProbeReport { ranges: true, length: None }), now);
        }
    }

    fn assert_invariants(p: &Planner) {
        assert!(p.tasks.len() <= p.config.max_active_tasks);
        for (i, mirror) in p.mirrors.iter().enumerate() {
            let count = p.tasks.values().filter(|t| t.mirror == MirrorId(i)).count();
            assert_eq!(mirror.active, count);
            assert!(count <= p.config.max_tasks_per_mirror);
        }
        let windows = p.task_windows();
        for (i, a) in windows.iter().enumerate() {
            for b in windows.iter().skip(i + 1) {
                if a.0 == b.0 {
                    assert!(a.2 <= b.1 || b.2 <= a.1, "overlapping windows {:?} {:?}", a, b);
                }
            }
        }
    }

    #[test]
    fn test_single_task_covers_whole_file() {
        let mut p = planner(vec![TorrentFile::new("a", 3 * PIECE)], &["http://m/"], WebSeedConfig::default());
        let now = Instant::now();
        p.rescan(&all_selected(&p));

        let probe = match p.plan(now) {
            PlanOutcome::Probe(job) => job,
            other => panic!("expected probe, got {:?}", other),
        };
        assert_eq!(probe.target, FileId(0));
        p.record_probe(probe.mirror, Ok(ProbeReport { ranges: true, length: Some(3 * PIECE) }), now);

        let job = match p.plan(now) {
            PlanOutcome::Dispatched(job) => job,
            other => panic!("expected dispatch, got {:?}", other),
        };
        assert_eq!((job.window.start(), job.window.end()), (0, 3));
        assert_eq!(job.wanted, vec![0..3 * PIECE]);
        assert!(matches!(p.plan(now), PlanOutcome::Idle));

        // All pieces complete: the file disappears and its task is cancelled
        let mut snapshot = all_selected(&p);
        snapshot.completed.add_range(0, 3);
        let cancelled = p.rescan(&snapshot);
        assert_eq!(cancelled, vec![job.id]);
        assert!(job.cancel.is_cancelled());
        assert!(!p.has_files());
        assert_eq!(p.active_tasks(), 0);
    }

    #[test]
    fn test_split_converges_to_two_halves() {
        let config = WebSeedConfig {
            split_threshold: 5 * PIECE,
            ..Default::default()
        };
        let mut p = planner(vec![TorrentFile::new("a", 10 * PIECE)], &["http://a/", "http://b/"], config);
        let now = Instant::now();
        p.rescan(&all_selected(&p));
        ready(&mut p, now);

        let mut jobs = Vec::new();
        while let PlanOutcome::Dispatched(job) = p.plan(now) {
            jobs.push(job);
            assert_invariants(&p);
        }
        assert_eq!(jobs.len(), 2);
        let mut windows = p.task_windows();
        windows.sort();
        assert_eq!(windows, vec![(FileId(0), 0, 5), (FileId(0), 5, 10)]);
        assert_eq!(jobs[1].wanted, vec![5 * PIECE..10 * PIECE]);
    }

    #[test]
    fn test_split_respects_claimed_bytes() {
        let config = WebSeedConfig {
            split_threshold: 2 * PIECE,
            max_splits_per_file: 2,
            ..Default::default()
        };
        let mut p = planner(vec![TorrentFile::new("a", 10 * PIECE)], &["http://a/"], config);
        let now = Instant::now();
        p.rescan(&all_selected(&p));
        ready(&mut p, now);

        let first = match p.plan(now) {
            PlanOutcome::Dispatched(job) => job,
            other => panic!("expected dispatch, got {:?}", other),
        };
        // The task has written into piece 4
        assert_eq!(first.window.claim(0, 4 * PIECE + 10), 4 * PIECE + 10);

        let second = match p.plan(now) {
            PlanOutcome::Dispatched(job) => job,
            other => panic!("expected split, got {:?}", other),
        };
        // Pieces [5, 10) are unclaimed: the old task keeps two of them
        assert_eq!(first.window.end(), 7);
        assert_eq!((second.window.start(), second.window.end()), (7, 10));
        assert_eq!(first.window.claim(7 * PIECE, 10), 0);
    }

    #[test]
    fn test_failed_probe_quarantines_mirror() {
        let mut p = planner(
            vec![TorrentFile::new("a", 3 * PIECE)],
            &["http://bad/", "http://good/"],
            WebSeedConfig::default(),
        );
        let now = Instant::now();
        p.rescan(&all_selected(&p));

        let bad = match p.plan(now) {
            PlanOutcome::Probe(job) => job,
            other => panic!("expected probe, got {:?}", other),
        };
        let good = match p.plan(now) {
            PlanOutcome::Probe(job) => job,
            other => panic!("expected probe, got {:?}", other),
        };
        assert!(matches!(p.plan(now), PlanOutcome::Idle));

        p.record_probe(bad.mirror, Err("Mirror error: Not Found (status: 404)".to_string()), now);
        p.record_probe(good.mirror, Ok(ProbeReport { ranges: true, length: None }), now);

        let job = match p.plan(now) {
            PlanOutcome::Dispatched(job) => job,
            other => panic!("expected dispatch, got {:?}", other),
        };
        assert_eq!(job.mirror, good.mirror);
        assert!(matches!(p.plan(now), PlanOutcome::Idle));

        let stats = p.mirror_stats();
        assert!(stats[0].last_error.as_deref().unwrap_or_default().contains("404"));

        // After the cool-down the bad mirror is probed again
        let later = now + p.config.quarantine();
        match p.plan(later) {
            PlanOutcome::Probe(job) => assert_eq!(job.mirror, bad.mirror),
            other => panic!("expected re-probe, got {:?}", other),
        }
    }

    #[test]
    fn test_size_mismatch_quarantines() {
        let mut p = planner(vec![TorrentFile::new("a", 3 * PIECE)], &["http://m/"], WebSeedConfig::default());
        let now = Instant::now();
        p.rescan(&all_selected(&p));
        let probe = match p.plan(now) {
            PlanOutcome::Probe(job) => job,
            other => panic!("expected probe, got {:?}", other),
        };
        p.record_probe(probe.mirror, Ok(ProbeReport { ranges: true, length: Some(1) }), now);
        assert!(p.mirror(probe.mirror).is_some_and(|m| m.quarantined_until().is_some()));

        // No task can run: the planner asks to be woken after the cool-down
        match p.plan(now) {
            PlanOutcome::Wait(at) => assert_eq!(at, now + p.config.quarantine()),
            other => panic!("expected wait, got {:?}", other),
        }
    }

    #[test]
    fn test_mirror_failure_moves_work_elsewhere() {
        let mut p = planner(
            vec![TorrentFile::new("a", 3 * PIECE)],
            &["http://a/", "http://b/"],
            WebSeedConfig::default(),
        );
        let now = Instant::now();
        p.rescan(&all_selected(&p));
        ready(&mut p, now);

        let job = match p.plan(now) {
            PlanOutcome::Dispatched(job) => job,
            other => panic!("expected dispatch, got {:?}", other),
        };
        assert_eq!(job.mirror, MirrorId(0));
        p.task_finished(job.id, TaskOutcome::MirrorFailed("connection reset".to_string()), now);

        let retry = match p.plan(now) {
            PlanOutcome::Dispatched(job) => job,
            other => panic!("expected dispatch, got {:?}", other),
        };
        assert_eq!(retry.mirror, MirrorId(1));
    }

    #[test]
    fn test_storage_failure_holds_file_back() {
        let mut p = planner(vec![TorrentFile::new("a", 3 * PIECE)], &["http://a/"], WebSeedConfig::default());
        let now = Instant::now();
        p.rescan(&all_selected(&p));
        ready(&mut p, now);

        let job = match p.plan(now) {
            PlanOutcome::Dispatched(job) => job,
            other => panic!("expected dispatch, got {:?}", other),
        };
        p.task_finished(job.id, TaskOutcome::StorageFailed("disk full".to_string()), now);
        assert!(p.mirror(MirrorId(0)).is_some_and(|m| m.usable_now()));

        let until = now + p.config.quarantine();
        match p.plan(now) {
            PlanOutcome::Wait(at) => assert_eq!(at, until),
            other => panic!("expected wait, got {:?}", other),
        }
        assert!(matches!(p.plan(until), PlanOutcome::Dispatched(_)));
    }

    #[test]
    fn test_unselected_file_sharing_piece_is_fetched() {
        // "a" ends mid-piece 1, which "b" also needs
        let files = vec![TorrentFile::new("a", PIECE + 100), TorrentFile::new("b", 2 * PIECE)];
        let mut p = planner(files, &["http://m/"], WebSeedConfig::default());
        let snapshot = PieceSnapshot {
            selection: vec![false, true],
            completed: PieceSet::new(),
        };
        p.rescan(&snapshot);

        let stats = p.file_stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].path, "t/a");
        assert_eq!(stats[0].remaining_pieces, 1);
        assert_eq!(p.files[&FileId(0)].wanted_bytes(0, 2, PIECE), vec![PIECE..PIECE + 100]);
    }

    #[test]
    fn test_rescan_clamps_windows() {
        let mut p = planner(vec![TorrentFile::new("a", 8 * PIECE)], &["http://m/"], WebSeedConfig::default());
        let now = Instant::now();
        p.rescan(&all_selected(&p));
        ready(&mut p, now);
        let job = match p.plan(now) {
            PlanOutcome::Dispatched(job) => job,
            other => panic!("expected dispatch, got {:?}", other),
        };

        // Peers delivered the tail
        let mut snapshot = all_selected(&p);
        snapshot.completed.add_range(5, 8);
        assert!(p.rescan(&snapshot).is_empty());
        assert_eq!(job.window.end(), 5);
        assert!(!job.cancel.is_cancelled());
    }

    #[test]
    fn test_zero_length_and_unselected_files_ignored() {
        let files = vec![
            TorrentFile::new("empty", 0),
            TorrentFile::new("a", PIECE),
            TorrentFile::new("b", PIECE),
        ];
        let mut p = planner(files, &["http://m/"], WebSeedConfig::default());
        let snapshot = PieceSnapshot {
            selection: vec![true, true, false],
            completed: PieceSet::new(),
        };
        p.rescan(&snapshot);
        let stats = p.file_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].path, "t/a");
        assert_eq!(p.probe_target(), Some((FileId(1), PIECE)));
    }

    #[test]
    fn test_completed_task_does_not_refetch_shared_piece() {
        // Piece 1 straddles "a" and "b"
        let files = vec![TorrentFile::new("a", PIECE + 100), TorrentFile::new("b", 2 * PIECE)];
        let config = WebSeedConfig {
            max_tasks_per_mirror: 1,
            ..Default::default()
        };
        let mut p = planner(files, &["http://m/"], config);
        let now = Instant::now();
        let mut snapshot = all_selected(&p);
        p.rescan(&snapshot);
        ready(&mut p, now);

        let a = match p.plan(now) {
            PlanOutcome::Dispatched(job) => job,
            other => panic!("expected dispatch, got {:?}", other),
        };
        assert_eq!(a.file, FileId(0));
        snapshot.completed.add(0);
        p.task_finished(a.id, TaskOutcome::Completed, now);
        p.rescan(&snapshot);

        // Only "b" is left; its task is the one that finishes piece 1
        let b = match p.plan(now) {
            PlanOutcome::Dispatched(job) => job,
            other => panic!("expected dispatch, got {:?}", other),
        };
        assert_eq!(b.file, FileId(1));
        assert_eq!(p.file_stats().len(), 1);

        snapshot.completed.add_range(1, 4);
        p.task_finished(b.id, TaskOutcome::Completed, now);
        p.rescan(&snapshot);
        assert!(!p.has_files());
        assert!(p.delivered.is_empty());
    }

    #[test]
    fn test_delivered_piece_that_never_completes_is_refetched() {
        let mut p = planner(vec![TorrentFile::new("a", 2 * PIECE)], &["http://m/"], WebSeedConfig::default());
        let now = Instant::now();
        let snapshot = all_selected(&p);
        p.rescan(&snapshot);
        ready(&mut p, now);

        let job = match p.plan(now) {
            PlanOutcome::Dispatched(job) => job,
            other => panic!("expected dispatch, got {:?}", other),
        };
        // Task finished but the sink never marked anything complete
        p.task_finished(job.id, TaskOutcome::Completed, now);
        p.rescan(&snapshot);
        assert!(p.has_files());
        assert!(matches!(p.plan(now), PlanOutcome::Dispatched(_)));
    }

    #[test]
    fn test_random_event_sequences_keep_invariants() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..50 {
            let file_count = rng.gen_range(1..5);
            let files: Vec<TorrentFile> = (0..file_count)
                .map(|i| TorrentFile::new(&format!("f{}", i), rng.gen_range(1..40) * PIECE / 2))
                .collect();
            let mirror_count = rng.gen_range(1..4);
            let mirrors: Vec<String> = (0..mirror_count).map(|i| format!("http://m{}/", i)).collect();
            let mirror_refs: Vec<&str> = mirrors.iter().map(String::as_str).collect();
            let config = WebSeedConfig {
                split_threshold: rng.gen_range(1..4) * PIECE,
                ..Default::default()
            };
            let mut p = planner(files, &mirror_refs, config);
            let mut snapshot = all_selected(&p);
            let piece_count = p.info.piece_count() as u32;
            let mut now = Instant::now();

            for _ in 0..200 {
                p.rescan(&snapshot);
                match p.plan(now) {
                    PlanOutcome::Probe(job) => {
                        let result = if rng.gen_bool(0.2) {
                            Err("refused".to_string())
                        } else {
                            Ok(ProbeReport { ranges: rng.gen_bool(0.8), length: None })
                        };
                        p.record_probe(job.mirror, result, now);
                    }
                    PlanOutcome::Dispatched(job) => {
                        // Let the task make some progress
                        let window = &job.window;
                        let end = window.end_bytes().min(job.file_bytes.end);
                        let claimed = window.claimed();
                        if end > claimed {
                            let step = rng.gen_range(0..=(end - claimed));
                            window.claim(claimed, step);
                        }
                    }
                    PlanOutcome::Wait(at) => now = at,
                    PlanOutcome::Idle => {
                        let ids: Vec<TaskId> = p.tasks.keys().copied().collect();
                        if ids.is_empty() {
                            now += Duration::from_secs(1);
                        } else {
                            let id = ids[rng.gen_range(0..ids.len())];
                            let outcome = match rng.gen_range(0..4) {
                                0 => TaskOutcome::MirrorFailed("reset".to_string()),
                                1 => TaskOutcome::StorageFailed("disk".to_string()),
                                2 => TaskOutcome::Cancelled,
                                _ => TaskOutcome::Completed,
                            };
                            p.task_finished(id, outcome, now);
                        }
                    }
                }
                if piece_count > 0 && rng.gen_bool(0.1) {
                    // Peer path completes a piece
                    snapshot.completed.add(rng.gen_range(0..piece_count));
                }
                assert_invariants(&p);
            }
        }
    }
}
