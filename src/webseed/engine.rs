//! Web-seed engine
//!
//! One engine per torrent. A driver task owns the scheduling loop: it feeds
//! the [`Planner`] fresh snapshots from the [`PieceSink`], spawns the probes
//! and download tasks the planner asks for, and applies their results as they
//! finish. Tasks write straight into the sink and report completed pieces as
//! soon as every byte of a piece has been delivered.

use std::future::Future;
use std::ops::Range;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{Mutex, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::config::WebSeedConfig;
use crate::error::TorrentError;
use crate::pieces::pending_bitmap;
use crate::torrent::TorrentInfo;
use crate::webseed::chunks::ChunkTracker;
use crate::webseed::file::file_url;
use crate::webseed::mirror::MirrorId;
use crate::webseed::planner::{
    FileStats, MirrorStats, PlanOutcome, Planner, ProbeJob, TaskId, TaskJob, TaskOutcome,
};
use crate::webseed::sink::PieceSink;
use crate::webseed::transport::{MirrorTransport, ProbeReport, SegmentReader};

/// More ranges than this are fetched as one covering range
const MAX_REQUEST_RANGES: usize = 32;

/// Completion of a spawned probe or task
#[derive(Debug)]
enum EngineEvent {
    TaskFinished { task: TaskId, outcome: TaskOutcome },
    ProbeFinished { mirror: MirrorId, result: Result<ProbeReport, String> },
}

struct Shared {
    info: Arc<TorrentInfo>,
    sink: Arc<dyn PieceSink>,
    transport: Arc<dyn MirrorTransport>,
    config: WebSeedConfig,
    planner: Mutex<Planner>,
    tracker: ChunkTracker,
    wake: Notify,
}

struct Running {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// Downloads a torrent's missing pieces from HTTP mirrors
pub struct WebSeedEngine {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl WebSeedEngine {
    /// Create an engine for `info`. Mirror URLs that do not parse as
    /// http(s) URLs are dropped with a warning.
    pub fn new(
        info: Arc<TorrentInfo>,
        sink: Arc<dyn PieceSink>,
        transport: Arc<dyn MirrorTransport>,
        config: WebSeedConfig,
        mirrors: &[String],
    ) -> Self {
        let mut accepted: Vec<String> = Vec::new();
        for mirror in mirrors {
            if !is_valid_mirror(mirror) {
                warn!("Ignoring invalid mirror URL: {}", mirror);
            } else if !accepted.contains(mirror) {
                accepted.push(mirror.clone());
            }
        }
        info!("Web seeding {} from {} mirrors", info.name, accepted.len());

        let tracker = ChunkTracker::new(info.piece_length, info.total_size());
        let planner = Planner::new(info.clone(), config.clone(), &accepted);
        Self {
            shared: Arc::new(Shared {
                info,
                sink,
                transport,
                config,
                planner: Mutex::new(planner),
                tracker,
                wake: Notify::new(),
            }),
            running: Mutex::new(None),
        }
    }

    /// Add a mirror. Returns `false` for a URL already known.
    pub async fn add_mirror(&self, url: &str) -> Result<bool> {
        if !is_valid_mirror(url) {
            let message = format!("Invalid mirror URL: {}", url);
            return Err(TorrentError::validation_error_with_field(message, "url").into());
        }
        let added = self.shared.planner.lock().await.add_mirror(url).is_some();
        if added {
            info!("Added mirror {}", url);
            self.shared.wake.notify_one();
        }
        Ok(added)
    }

    /// Start the driver. Starting a running engine does nothing.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            debug!("Web seeding already running for {}", self.shared.info.name);
            return;
        }
        self.shared.planner.lock().await.reset();
        self.shared.tracker.clear();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(drive(self.shared.clone(), shutdown.clone()));
        *running = Some(Running { shutdown, handle });
    }

    /// Stop the driver and wait for every task and probe to wind down.
    /// Stopping a stopped engine does nothing.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        running.shutdown.cancel();
        if let Err(e) = running.handle.await {
            error!("Web-seed driver for {} failed: {}", self.shared.info.name, e);
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.as_ref().is_some_and(|r| !r.handle.is_finished())
    }

    /// Re-read selection and completion from the sink
    pub fn rescan(&self) {
        self.shared.wake.notify_one();
    }

    pub async fn mirror_stats(&self) -> Vec<MirrorStats> {
        self.shared.planner.lock().await.mirror_stats()
    }

    pub async fn file_stats(&self) -> Vec<FileStats> {
        self.shared.planner.lock().await.file_stats()
    }
}

fn is_valid_mirror(url: &str) -> bool {
    Url::parse(url).is_ok_and(|u| matches!(u.scheme(), "http" | "https"))
}

// ==================== Driver ====================

async fn drive(shared: Arc<Shared>, shutdown: CancellationToken) {
    info!("Web seeding started for {}", shared.info.name);
    let mut running: JoinSet<EngineEvent> = JoinSet::new();

    loop {
        let wake_at = replan(&shared, &mut running, &shutdown).await;
        let deadline = async move {
            match wake_at {
                Some(at) => sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = shared.wake.notified() => trace!("Rescan requested"),
            Some(joined) = running.join_next(), if !running.is_empty() => match joined {
                Ok(event) => apply(&shared, event).await,
                Err(e) => error!("Web-seed task panicked: {}", e),
            },
            _ = deadline => trace!("Wait deadline reached"),
        }
    }

    shared.planner.lock().await.cancel_all();
    while running.join_next().await.is_some() {}
    info!("Web seeding stopped for {}", shared.info.name);
}

/// Rescan, then act on plans until the planner has nothing more to start.
/// Returns when the driver should wake up on its own.
async fn replan(
    shared: &Arc<Shared>,
    running: &mut JoinSet<EngineEvent>,
    shutdown: &CancellationToken,
) -> Option<Instant> {
    let snapshot = shared.sink.snapshot().await;
    let pending = pending_bitmap(&shared.info.files, &snapshot.selection, shared.info.piece_length);
    shared.tracker.prune(&pending, &snapshot.completed);

    let mut planner = shared.planner.lock().await;
    planner.rescan(&snapshot);

    loop {
        match planner.plan(Instant::now()) {
            PlanOutcome::Dispatched(job) => {
                let shared = shared.clone();
                let task = job.id;
                let work = async move {
                    let outcome = run_task(&shared, job).await;
                    EngineEvent::TaskFinished { task, outcome }
                };
                spawn_guarded(running, work, move |error| EngineEvent::TaskFinished {
                    task,
                    outcome: TaskOutcome::MirrorFailed(error),
                });
            }
            PlanOutcome::Probe(job) => {
                let shared = shared.clone();
                let shutdown = shutdown.clone();
                let mirror = job.mirror;
                let work = async move {
                    let result = tokio::select! {
                        _ = shutdown.cancelled() => Err("Probe cancelled".to_string()),
                        result = probe(&shared, &job) => result.map_err(|e| e.to_string()),
                    };
                    EngineEvent::ProbeFinished { mirror, result }
                };
                spawn_guarded(running, work, move |error| EngineEvent::ProbeFinished {
                    mirror,
                    result: Err(error),
                });
            }
            PlanOutcome::Wait(at) => return Some(at),
            PlanOutcome::Idle => return None,
        }
    }
}

/// Run `work` on a task of its own. A panic inside it becomes the event
/// built by `on_panic`, so the planner always hears back.
fn spawn_guarded<F, P>(running: &mut JoinSet<EngineEvent>, work: F, on_panic: P)
where
    F: Future<Output = EngineEvent> + Send + 'static,
    P: FnOnce(String) -> EngineEvent + Send + 'static,
{
    running.spawn(async move {
        match tokio::spawn(work).await {
            Ok(event) => event,
            Err(e) => {
                error!("Web-seed worker failed: {}", e);
                on_panic(format!("Worker failed: {}", e))
            }
        }
    });
}

async fn apply(shared: &Shared, event: EngineEvent) {
    let mut planner = shared.planner.lock().await;
    let now = Instant::now();
    match event {
        EngineEvent::TaskFinished { task, outcome } => planner.task_finished(task, outcome, now),
        EngineEvent::ProbeFinished { mirror, result } => planner.record_probe(mirror, result, now),
    }
}

async fn probe(shared: &Shared, job: &ProbeJob) -> Result<ProbeReport> {
    let url = file_url(&job.mirror_url, &shared.info, job.target.0)?;
    timeout(shared.config.socket_timeout(), shared.transport.probe(&url))
        .await
        .map_err(|_| TorrentError::mirror_error("Probe timed out", &url))?
}

// ==================== Tasks ====================

async fn run_task(shared: &Shared, job: TaskJob) -> TaskOutcome {
    let cancel = job.cancel.clone();
    tokio::select! {
        _ = cancel.cancelled() => {
            debug!("{} cancelled", job.id);
            TaskOutcome::Cancelled
        }
        result = fetch_window(shared, &job) => match result {
            Ok(()) => {
                debug!("{} finished window [{}, {})", job.id, job.window.start(), job.window.end());
                TaskOutcome::Completed
            }
            Err(e) => {
                let storage = e.downcast_ref::<TorrentError>().is_some_and(TorrentError::is_storage_error);
                warn!("{} on {} failed: {}", job.id, job.mirror_url, e);
                if storage {
                    TaskOutcome::StorageFailed(e.to_string())
                } else {
                    TaskOutcome::MirrorFailed(e.to_string())
                }
            }
        },
    }
}

/// Stream the task's wanted bytes into the sink until the live window ends
async fn fetch_window(shared: &Shared, job: &TaskJob) -> Result<()> {
    let url = file_url(&job.mirror_url, &shared.info, job.file.0)?;
    let ranges = if job.ranges_supported {
        request_ranges(&job.wanted, job.file_bytes.start)
    } else {
        Vec::new()
    };
    let read_timeout = shared.config.socket_timeout();

    let response = timeout(read_timeout, shared.transport.fetch(&url, &ranges))
        .await
        .map_err(|_| TorrentError::mirror_error("Connect timed out", &url))??;
    let mut reader = SegmentReader::new(response, &url)?;

    loop {
        if !outstanding(job) {
            return Ok(());
        }
        let segment = timeout(read_timeout, reader.next_segment())
            .await
            .map_err(|_| TorrentError::mirror_error("Read timed out", &url))??;
        let Some(segment) = segment else {
            if outstanding(job) {
                return Err(TorrentError::mirror_error("Premature end of body", &url).into());
            }
            return Ok(());
        };

        let start = job
            .file_bytes
            .start
            .checked_add(segment.offset)
            .filter(|&start| start < job.file_bytes.end)
            .ok_or_else(|| {
                let message = format!("Segment at offset {} is outside the file", segment.offset);
                TorrentError::malformed_response(message, &url)
            })?;
        let end = start.saturating_add(segment.data.len() as u64).min(job.file_bytes.end);
        for wanted in &job.wanted {
            let (a, b) = (wanted.start.max(start), wanted.end.min(end));
            if a >= b {
                continue;
            }
            let data = &segment.data[(a - start) as usize..(b - start) as usize];
            if !deliver(shared, job, a, data).await? {
                return Ok(());
            }
        }
    }
}

/// Write `data` at torrent offset `offset` in `read_buffer` pieces, claiming
/// each before writing. Returns `false` once the window has ended.
async fn deliver(shared: &Shared, job: &TaskJob, offset: u64, data: &[u8]) -> Result<bool> {
    let mut offset = offset;
    for chunk in data.chunks(shared.config.read_buffer.max(1)) {
        let allowed = job.window.claim(offset, chunk.len() as u64) as usize;
        if allowed == 0 {
            return Ok(false);
        }
        shared
            .sink
            .write_chunk(offset, &chunk[..allowed])
            .await
            .map_err(|e| as_storage_error(e, job))?;
        job.mirror_downloaded.fetch_add(allowed as u64, Ordering::Relaxed);
        job.file_downloaded.fetch_add(allowed as u64, Ordering::Relaxed);

        for piece in shared.tracker.record(offset, allowed as u64) {
            if shared.sink.is_piece_complete(piece).await {
                trace!("Piece {} already complete", piece);
                continue;
            }
            shared
                .sink
                .piece_delivered(piece)
                .await
                .map_err(|e| as_storage_error(e, job))?;
        }

        if allowed < chunk.len() {
            return Ok(false);
        }
        offset += allowed as u64;
    }
    Ok(true)
}

/// Any wanted byte left between the claim mark and the live window end
fn outstanding(job: &TaskJob) -> bool {
    let claimed = job.window.claimed();
    let limit = job.window.end_bytes().min(job.file_bytes.end);
    job.wanted.iter().any(|r| r.end > claimed && r.start < limit)
}

/// File-relative request ranges for torrent ranges `wanted`
fn request_ranges(wanted: &[Range<u64>], file_start: u64) -> Vec<Range<u64>> {
    let relative: Vec<Range<u64>> = wanted.iter().map(|r| r.start - file_start..r.end - file_start).collect();
    match (relative.first(), relative.last()) {
        (Some(first), Some(last)) if relative.len() > MAX_REQUEST_RANGES => vec![first.start..last.end],
        _ => relative,
    }
}

/// Sink failures are local: they must never count against the mirror
fn as_storage_error(err: anyhow::Error, job: &TaskJob) -> anyhow::Error {
    let error = match err.downcast::<TorrentError>() {
        Ok(e) if e.is_storage_error() => e,
        Ok(e) => TorrentError::storage_error(e.to_string()),
        Err(e) => TorrentError::storage_error(e.to_string()),
    };
    error.with_context(format!("{} writing {}", job.id, job.file)).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::TorrentStorage;
    use crate::torrent::TorrentFile;
    use crate::webseed::mirror::MirrorState;
    use crate::webseed::transport::{MemoryBody, MirrorResponse};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    const PIECE: u64 = 16384;

    /// Serves fixed content per URL, honouring single and multiple ranges
    #[derive(Default)]
    struct MemoryTransport {
        files: HashMap<String, Vec<u8>>,
        ranges: bool,
        requests: StdMutex<Vec<(String, Vec<Range<u64>>)>>,
    }

    impl MemoryTransport {
        fn with(mut self, url: &str, data: Vec<u8>) -> Self {
            self.files.insert(url.to_string(), data);
            self
        }
    }

    #[async_trait]
    impl MirrorTransport for MemoryTransport {
        async fn probe(&self, url: &str) -> Result<ProbeReport> {
            match self.files.get(url) {
                Some(data) => Ok(ProbeReport { ranges: self.ranges, length: Some(data.len() as u64) }),
                None => Err(TorrentError::mirror_error_with_status("Not Found", url, 404).into()),
            }
        }

        async fn fetch(&self, url: &str, ranges: &[Range<u64>]) -> Result<MirrorResponse> {
            self.requests.lock().unwrap().push((url.to_string(), ranges.to_vec()));
            let Some(data) = self.files.get(url) else {
                return Ok(MirrorResponse {
                    status: 404,
                    content_type: None,
                    content_range: None,
                    body: Box::new(MemoryBody::default()),
                });
            };
            let total = data.len();
            let chunked = |bytes: &[u8]| -> Vec<Bytes> { bytes.chunks(1000).map(Bytes::copy_from_slice).collect() };

            if !self.ranges || ranges.is_empty() {
                return Ok(MirrorResponse {
                    status: 200,
                    content_type: None,
                    content_range: None,
                    body: Box::new(MemoryBody::new(chunked(data.as_slice()))),
                });
            }
            if let [range] = ranges {
                let (a, b) = (range.start as usize, range.end as usize);
                return Ok(MirrorResponse {
                    status: 206,
                    content_type: None,
                    content_range: Some(format!("bytes {}-{}/{}", a, b - 1, total)),
                    body: Box::new(MemoryBody::new(chunked(&data[a..b]))),
                });
            }
            let mut body = Vec::new();
            for range in ranges {
                let (a, b) = (range.start as usize, range.end as usize);
                body.extend_from_slice(format!("--SEP\r\nContent-Range: bytes {}-{}/{}\r\n\r\n", a, b - 1, total).as_bytes());
                body.extend_from_slice(&data[a..b]);
                body.extend_from_slice(b"\r\n");
            }
            body.extend_from_slice(b"--SEP--\r\n");
            Ok(MirrorResponse {
                status: 206,
                content_type: Some("multipart/byteranges; boundary=SEP".to_string()),
                content_range: None,
                body: Box::new(MemoryBody::new(chunked(body.as_slice()))),
            })
        }
    }

    fn content(len: u64, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    async fn wait_complete(storage: &TorrentStorage) {
        let mut completed = storage.subscribe_completed();
        timeout(Duration::from_secs(10), completed.wait_for(|done| *done))
            .await
            .expect("torrent did not complete")
            .unwrap();
    }

    #[tokio::test]
    async fn test_single_file_from_one_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let data = content(3 * PIECE + 500, 7);
        let info = Arc::new(TorrentInfo::from_files("movie.bin", PIECE, vec![TorrentFile::new("", data.len() as u64)]));
        let storage = Arc::new(TorrentStorage::new(info.clone(), dir.path()));
        let transport = Arc::new(MemoryTransport { ranges: true, ..Default::default() }.with("http://m/movie.bin", data.clone()));

        let engine = WebSeedEngine::new(
            info.clone(),
            storage.clone(),
            transport.clone(),
            WebSeedConfig::default(),
            &["http://m/movie.bin".to_string()],
        );
        engine.start().await;
        wait_complete(&storage).await;

        let read = storage.read_at(0, data.len()).await.unwrap();
        assert_eq!(read.data.as_ref(), data.as_slice());
        assert!(read.end_of_stream);

        let stats = engine.mirror_stats().await;
        assert_eq!(stats[0].downloaded, data.len() as u64);
        engine.stop().await;
        assert!(!engine.is_running().await);
    }

    #[tokio::test]
    async fn test_multi_file_with_unselected_neighbour() {
        let dir = tempfile::tempdir().unwrap();
        // "a" ends inside piece 1, which "b" needs
        let a = content(PIECE + 300, 1);
        let b = content(2 * PIECE, 2);
        let info = Arc::new(TorrentInfo::from_files(
            "album",
            PIECE,
            vec![TorrentFile::new("a.bin", a.len() as u64), TorrentFile::new("b.bin", b.len() as u64)],
        ));
        let storage = Arc::new(TorrentStorage::new(info.clone(), dir.path()));
        storage.set_selected(0, false).await.unwrap();

        let transport = Arc::new(
            MemoryTransport { ranges: true, ..Default::default() }
                .with("http://m/album/a.bin", a.clone())
                .with("http://m/album/b.bin", b.clone()),
        );
        let engine = WebSeedEngine::new(
            info.clone(),
            storage.clone(),
            transport.clone(),
            WebSeedConfig::default(),
            &["http://m/".to_string()],
        );
        engine.start().await;
        wait_complete(&storage).await;
        engine.stop().await;

        // Only the shared tail of "a" was requested
        let requests = transport.requests.lock().unwrap().clone();
        let a_requests: Vec<_> = requests.iter().filter(|(u, _)| u.ends_with("a.bin")).collect();
        assert!(!a_requests.is_empty());
        assert!(a_requests.iter().all(|(_, r)| r == &vec![PIECE..PIECE + 300]));

        let read = storage.read_at(a.len() as u64, b.len()).await.unwrap();
        assert_eq!(read.data.as_ref(), b.as_slice());
        assert!(!storage.is_piece_complete(0).await);
    }

    #[tokio::test]
    async fn test_missing_mirror_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let data = content(2 * PIECE, 3);
        let info = Arc::new(TorrentInfo::from_files("f.bin", PIECE, vec![TorrentFile::new("", data.len() as u64)]));
        let storage = Arc::new(TorrentStorage::new(info.clone(), dir.path()));
        let transport = Arc::new(MemoryTransport::default().with("http://good/f.bin", data.clone()));

        let engine = WebSeedEngine::new(
            info.clone(),
            storage.clone(),
            transport,
            WebSeedConfig::default(),
            &["http://bad/f.bin".to_string(), "http://good/f.bin".to_string(), "ftp://x/".to_string()],
        );
        engine.start().await;
        wait_complete(&storage).await;
        engine.stop().await;

        let stats = engine.mirror_stats().await;
        assert_eq!(stats.len(), 2);
        assert!(matches!(stats[0].state, MirrorState::Quarantined { .. }));
        assert!(stats[0].last_error.as_deref().unwrap_or_default().contains("404"));
        assert_eq!(stats[1].downloaded, data.len() as u64);
    }

    #[tokio::test]
    async fn test_gapped_remaining_uses_multipart() {
        let dir = tempfile::tempdir().unwrap();
        let data = content(6 * PIECE, 9);
        let info = Arc::new(TorrentInfo::from_files("g.bin", PIECE, vec![TorrentFile::new("", data.len() as u64)]));
        let storage = Arc::new(TorrentStorage::new(info.clone(), dir.path()));
        // Pieces 1, 2 and 4 arrived from peers
        storage.write_at(PIECE, &data[PIECE as usize..3 * PIECE as usize]).await.unwrap();
        storage.write_at(4 * PIECE, &data[4 * PIECE as usize..5 * PIECE as usize]).await.unwrap();
        for piece in [1, 2, 4] {
            storage.mark_complete(piece).await.unwrap();
        }

        let transport = Arc::new(MemoryTransport { ranges: true, ..Default::default() }.with("http://m/g.bin", data.clone()));
        let engine = WebSeedEngine::new(
            info.clone(),
            storage.clone(),
            transport.clone(),
            WebSeedConfig::default(),
            &["http://m/g.bin".to_string()],
        );
        engine.start().await;
        wait_complete(&storage).await;
        engine.stop().await;

        let requests = transport.requests.lock().unwrap().clone();
        assert_eq!(requests[0].1, vec![0..PIECE, 3 * PIECE..4 * PIECE, 5 * PIECE..6 * PIECE]);
        let read = storage.read_at(0, data.len()).await.unwrap();
        assert_eq!(read.data.as_ref(), data.as_slice());
    }

    /// Lets one host misbehave on fetch; every other host probes slowly so
    /// the misbehaving one is dispatched first
    struct HostileTransport {
        inner: MemoryTransport,
        host: &'static str,
        /// `None` makes the fetch panic
        content_range: Option<String>,
    }

    #[async_trait]
    impl MirrorTransport for HostileTransport {
        async fn probe(&self, url: &str) -> Result<ProbeReport> {
            if !url.starts_with(self.host) {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            self.inner.probe(url).await
        }

        async fn fetch(&self, url: &str, ranges: &[Range<u64>]) -> Result<MirrorResponse> {
            if !url.starts_with(self.host) {
                return self.inner.fetch(url, ranges).await;
            }
            let Some(content_range) = &self.content_range else {
                panic!("connection state corrupted");
            };
            Ok(MirrorResponse {
                status: 206,
                content_type: None,
                content_range: Some(content_range.clone()),
                body: Box::new(MemoryBody::new(vec![Bytes::from_static(b"0123456789")])),
            })
        }
    }

    /// Download a two-piece file from `http://bad/` then `http://good/`,
    /// returning the mirror reports once the torrent completed
    async fn download_past_bad_mirror(content_range: Option<String>) -> Vec<MirrorStats> {
        let dir = tempfile::tempdir().unwrap();
        let data = content(2 * PIECE, 5);
        let info = Arc::new(TorrentInfo::from_files("h.bin", PIECE, vec![TorrentFile::new("", data.len() as u64)]));
        let storage = Arc::new(TorrentStorage::new(info.clone(), dir.path()));
        let inner = MemoryTransport { ranges: true, ..Default::default() }
            .with("http://bad/h.bin", data.clone())
            .with("http://good/h.bin", data.clone());
        let transport = Arc::new(HostileTransport { inner, host: "http://bad/", content_range });

        let config = WebSeedConfig { max_tasks_per_mirror: 1, ..Default::default() };
        let engine = WebSeedEngine::new(
            info,
            storage.clone(),
            transport,
            config,
            &["http://bad/h.bin".to_string(), "http://good/h.bin".to_string()],
        );
        engine.start().await;
        wait_complete(&storage).await;
        engine.stop().await;

        let read = storage.read_at(0, data.len()).await.unwrap();
        assert_eq!(read.data.as_ref(), data.as_slice());
        engine.mirror_stats().await
    }

    #[tokio::test]
    async fn test_overflowing_content_range_quarantines_mirror() {
        let header = "bytes 18446744073709551600-18446744073709551615/*".to_string();
        let stats = download_past_bad_mirror(Some(header)).await;
        assert!(matches!(stats[0].state, MirrorState::Quarantined { .. }));
        assert_eq!(stats[0].active_tasks, 0);
        assert!(stats[0].last_error.as_deref().unwrap_or_default().contains("Content-Range"));
        assert_eq!(stats[1].downloaded, 2 * PIECE);
    }

    #[tokio::test]
    async fn test_segment_outside_file_quarantines_mirror() {
        let stats = download_past_bad_mirror(Some("bytes 1000000000-1000000009/*".to_string())).await;
        assert!(matches!(stats[0].state, MirrorState::Quarantined { .. }));
        assert_eq!(stats[0].downloaded, 0);
        assert!(stats[0].last_error.as_deref().unwrap_or_default().contains("outside the file"));
        assert_eq!(stats[1].downloaded, 2 * PIECE);
    }

    #[tokio::test]
    async fn test_panicking_task_releases_mirror() {
        let stats = download_past_bad_mirror(None).await;
        assert!(matches!(stats[0].state, MirrorState::Quarantined { .. }));
        assert_eq!(stats[0].active_tasks, 0);
        assert!(stats[0].last_error.as_deref().unwrap_or_default().contains("Worker failed"));
        assert_eq!(stats[1].downloaded, 2 * PIECE);
    }

    #[tokio::test]
    async fn test_sink_errors_are_storage_errors() {
        let sink_error = TorrentError::mirror_error("disk gone", "http://m/");
        let info = Arc::new(TorrentInfo::from_files("f.bin", PIECE, vec![TorrentFile::new("", PIECE)]));
        let mut planner = Planner::new(info, WebSeedConfig::default(), &["http://m/f.bin".to_string()]);
        let snapshot = crate::webseed::sink::PieceSnapshot {
            selection: vec![true],
            completed: crate::pieces::PieceSet::new(),
        };
        planner.rescan(&snapshot);
        let now = Instant::now();
        let PlanOutcome::Probe(probe) = planner.plan(now) else { panic!("expected a probe") };
        planner.record_probe(probe.mirror, Ok(ProbeReport { ranges: true, length: Some(PIECE) }), now);
        let PlanOutcome::Dispatched(job) = planner.plan(now) else { panic!("expected a task") };

        let err = as_storage_error(sink_error.into(), &job);
        let err = err.downcast_ref::<TorrentError>().unwrap();
        assert!(err.is_storage_error());
        assert!(err.to_string().contains(&job.id.to_string()));
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let info = Arc::new(TorrentInfo::from_files("f.bin", PIECE, vec![TorrentFile::new("", PIECE)]));
        let storage = Arc::new(TorrentStorage::new(info.clone(), dir.path()));
        let engine = WebSeedEngine::new(
            info,
            storage,
            Arc::new(MemoryTransport::default()),
            WebSeedConfig::default(),
            &[],
        );
        engine.stop().await;
        engine.start().await;
        engine.start().await;
        assert!(engine.is_running().await);
        engine.stop().await;
        engine.stop().await;
        assert!(!engine.is_running().await);
    }

    #[test]
    fn test_request_ranges_relative_and_capped() {
        assert_eq!(request_ranges(&[100..200, 300..400], 100), vec![0..100, 200..300]);
        let many: Vec<Range<u64>> = (0..40).map(|i| i * 10..i * 10 + 5).collect();
        assert_eq!(request_ranges(&many, 0), vec![0..395]);
    }
}
