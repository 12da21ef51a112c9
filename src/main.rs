//! torrent-webseed - Main entry point
//!
//! Downloads a torrent's content from its HTTP web seeds.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use torrent_webseed::{
    CliArgs, Config, DownloadStats, HttpTransport, ProgressDisplay, TorrentError, TorrentInfo,
    TorrentParser, TorrentStorage, WebSeedConfig, WebSeedRegistry,
};
use tracing::{debug, error, info, trace, warn};

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        match panic_info.location() {
            Some(location) => error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            ),
            None => error!("PANIC occurred at an unknown location"),
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    // Set up panic handler
    setup_panic_handler();

    // Parse CLI arguments
    let args = CliArgs::parse_args();

    // Initialize logging
    init_logging(&args);
    info!("torrent-webseed starting");
    debug!("CLI arguments: {:?}", args);

    // Load torrent file
    let torrent_info = load_torrent_file(&args.torrent_file)
        .context("Failed to load torrent file")?;

    let webseed = match &args.config {
        Some(path) => WebSeedConfig::load(path).context("Failed to load web seed configuration")?,
        None => WebSeedConfig::default(),
    };

    // Create configuration
    let config = Config::from_args(&args, torrent_info.clone(), webseed);

    // Validate configuration
    config.validate()
        .context("Invalid configuration")?;

    // Display torrent information
    display_torrent_info(&torrent_info, &config)?;

    let info = Arc::new(torrent_info);
    let storage = Arc::new(TorrentStorage::new(info.clone(), config.output_dir.clone()));
    apply_selection(&storage, &config).await?;

    let transport = Arc::new(HttpTransport::new(&config.webseed)?);
    let registry = WebSeedRegistry::new(transport, config.webseed.clone());
    let id = storage.id().to_string();
    registry.register(&id, storage.clone(), &config.mirrors).await?;

    let mut progress = ProgressDisplay::new(config.is_quiet());
    progress.print_status("Starting web seeding...")?;

    registry.start_web_seeding(&id).await?;
    let download_result = run_download(&registry, &id, &storage, &mut progress).await;
    registry.stop_web_seeding(&id).await?;

    let mirrors = registry.mirror_stats(&id).await?;
    match download_result {
        Ok(true) => {
            info!("Download completed successfully");
            let stats = DownloadStats::from_mirrors(&mirrors, 1.0, 0.0);
            progress.print_complete(&stats, selected_size(&storage).await)?;
            progress.print_mirrors(&mirrors)?;
        }
        Ok(false) => {
            warn!("Download interrupted");
            progress.print_status("Interrupted")?;
            progress.print_mirrors(&mirrors)?;
        }
        Err(e) => {
            error!("Download failed: {}", e);
            progress.print_error(&format!("Download failed: {}", e))?;
            return Err(e);
        }
    }

    registry.unregister(&id).await;
    info!("torrent-webseed finished");
    Ok(())
}

/// Initialize logging based on verbosity settings
fn init_logging(args: &CliArgs) {
    let level = args.log_level();

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.is_verbose() {
        subscriber.pretty().init();
        debug!("Using pretty log format (verbose mode)");
    } else {
        subscriber.compact().init();
    }

    debug!("Logging initialized with level: {:?}", level);
}

/// Load and parse the torrent file
fn load_torrent_file(path: &Path) -> Result<TorrentInfo> {
    info!("Loading torrent file: {}", path.display());
    debug!("Torrent file path: {}", path.canonicalize().unwrap_or_else(|_| path.to_path_buf()).display());

    let torrent_data = std::fs::read(path)
        .map_err(|e| {
            error!("Failed to read torrent file '{}': {}", path.display(), e);
            anyhow::anyhow!("Failed to read torrent file: {}", e)
        })
        .context("Failed to read torrent file")?;

    debug!("Torrent file size: {} bytes", torrent_data.len());

    let info = TorrentParser::parse_bytes(&torrent_data)
        .map_err(|e| {
            error!("Failed to parse torrent file '{}': {}", path.display(), e);
            anyhow::Error::from(TorrentError::parse_error_with_source("Failed to parse torrent file", e.to_string()))
        })
        .context("Failed to parse torrent file")?;

    info!("Successfully loaded torrent file: {}", info.name);
    Ok(info)
}

/// Display torrent information
fn display_torrent_info(torrent_info: &TorrentInfo, config: &Config) -> Result<()> {
    if config.is_quiet() {
        return Ok(());
    }

    println!("Torrent Information:");
    println!("  Name: {}", torrent_info.name);
    println!("  Size: {} ({})",
        torrent_info.total_size(),
        DownloadStats::format_bytes(torrent_info.total_size())
    );
    println!("  Files: {}", torrent_info.files.len());
    println!("  Pieces: {}", torrent_info.piece_count());
    println!("  Piece length: {}",
        DownloadStats::format_bytes(torrent_info.piece_length)
    );
    println!("  Info hash: {}", torrent_info.info_hash_hex());
    println!();
    println!("Configuration:");
    println!("  Output directory: {}", config.output_dir.display());
    println!("  Mirrors:");
    for mirror in config.all_mirrors() {
        println!("    {}", mirror);
    }
    if !torrent_info.http_seeds.is_empty() {
        println!("  HTTP seeds (BEP 17, unused): {}", torrent_info.http_seeds.len());
    }
    if config.has_selection() {
        println!("  Selection: {}", config.select.join(", "));
    }
    println!("  Max tasks: {} ({} per mirror)", config.webseed.max_active_tasks, config.webseed.max_tasks_per_mirror);
    println!();

    Ok(())
}

/// Restrict the download to the files matching the selection patterns
async fn apply_selection(storage: &TorrentStorage, config: &Config) -> Result<()> {
    if !config.has_selection() {
        return Ok(());
    }

    storage.select_all(false).await?;
    let mut matched = 0;
    for pattern in &config.select {
        let count = storage.select_matching(pattern, true).await?;
        debug!("Pattern '{}' selected {} files", pattern, count);
        matched += count;
    }

    if matched == 0 {
        return Err(TorrentError::validation_error_with_field("No file matches the selection patterns", "select").into());
    }
    info!("Selected {} of {} files", matched, storage.info().files.len());
    Ok(())
}

/// Bytes of the selected files
async fn selected_size(storage: &TorrentStorage) -> u64 {
    storage
        .file_progress()
        .await
        .iter()
        .filter(|f| f.selected)
        .map(|f| f.length)
        .sum()
}

/// Drive the progress display until the torrent completes.
///
/// Returns `false` when interrupted by Ctrl-C.
async fn run_download(
    registry: &WebSeedRegistry,
    id: &str,
    storage: &TorrentStorage,
    progress: &mut ProgressDisplay,
) -> Result<bool> {
    let mut completed = storage.subscribe_completed();
    let total = selected_size(storage).await;
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    let mut last_downloaded = 0u64;
    let mut last_time = std::time::Instant::now();
    let mut loop_count = 0u64;

    loop {
        if *completed.borrow_and_update() {
            info!("Download complete!");
            return Ok(true);
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, stopping");
                return Ok(false);
            }
            changed = completed.changed() => {
                changed.context("Storage dropped the completion signal")?;
                continue;
            }
            _ = ticker.tick() => {}
        }

        loop_count += 1;
        trace!("Progress loop iteration {}", loop_count);

        let mirrors = registry.mirror_stats(id).await?;
        let files = storage.file_progress().await;
        let done: u64 = files.iter().filter(|f| f.selected).map(|f| f.bytes_completed).sum();
        let progress_value = if total == 0 { 1.0 } else { done as f64 / total as f64 };

        let now = std::time::Instant::now();
        let elapsed = now.duration_since(last_time).as_secs_f64();
        let downloaded: u64 = mirrors.iter().map(|m| m.downloaded).sum();
        let download_speed = if elapsed > 0.0 {
            downloaded.saturating_sub(last_downloaded) as f64 / elapsed
        } else {
            0.0
        };
        last_downloaded = downloaded;
        last_time = now;

        for mirror in &mirrors {
            if let Some(error) = &mirror.last_error {
                trace!("Mirror {} last error: {}", mirror.url, error);
            }
        }

        let stats = DownloadStats::from_mirrors(&mirrors, progress_value, download_speed);
        progress.update(&stats, total)?;
    }
}
