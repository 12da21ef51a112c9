//! Progress display module
//!
//! Handles displaying download progress in the CLI.

use std::io::{self, Write};
use std::time::{Duration, Instant};

use crate::webseed::{MirrorState, MirrorStats};

/// Download statistics for progress display
#[derive(Debug, Clone, Default)]
pub struct DownloadStats {
    /// Total bytes fetched from mirrors
    pub downloaded: u64,
    /// Download speed in bytes per second
    pub download_speed: f64,
    /// Running download tasks
    pub active_tasks: usize,
    /// Mirrors currently usable
    pub mirrors_ready: usize,
    /// Mirrors known
    pub mirrors_total: usize,
    /// Download progress (0.0 to 1.0)
    pub progress: f64,
}

impl DownloadStats {
    /// Create new download stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Summarize mirror reports
    pub fn from_mirrors(mirrors: &[MirrorStats], progress: f64, download_speed: f64) -> Self {
        Self {
            downloaded: mirrors.iter().map(|m| m.downloaded).sum(),
            download_speed,
            active_tasks: mirrors.iter().map(|m| m.active_tasks).sum(),
            mirrors_ready: mirrors
                .iter()
                .filter(|m| matches!(m.state, MirrorState::Ready { .. }))
                .count(),
            mirrors_total: mirrors.len(),
            progress,
        }
    }

    /// Format bytes to human readable string
    pub fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_index = 0;

        while size >= 1024.0 && unit_index < UNITS.len() - 1 {
            size /= 1024.0;
            unit_index += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_index])
    }

    /// Format speed to human readable string
    pub fn format_speed(bytes_per_sec: f64) -> String {
        format!("{}/s", Self::format_bytes(bytes_per_sec as u64))
    }

    /// Format duration to human readable string
    pub fn format_duration(duration: Duration) -> String {
        let total_secs = duration.as_secs();
        let hours = total_secs / 3600;
        let minutes = (total_secs % 3600) / 60;
        let seconds = total_secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, minutes, seconds)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, seconds)
        } else {
            format!("{}s", seconds)
        }
    }

    /// Calculate ETA based on download speed and remaining bytes
    pub fn calculate_eta(downloaded: u64, total: u64, speed: f64) -> Option<Duration> {
        if speed <= 0.0 || downloaded >= total {
            return None;
        }

        let remaining = total.saturating_sub(downloaded) as f64;
        let eta_secs = remaining / speed;
        Some(Duration::from_secs_f64(eta_secs))
    }
}

/// Progress display for CLI
pub struct ProgressDisplay {
    /// Start time of the download
    start_time: Instant,
    /// Last update time
    last_update: Instant,
    /// Update interval
    update_interval: Duration,
    /// Quiet mode (no progress output)
    quiet: bool,
}

impl ProgressDisplay {
    /// Create a new progress display
    pub fn new(quiet: bool) -> Self {
        Self::with_interval(quiet, Duration::from_millis(500))
    }

    /// Create a progress display with custom update interval
    pub fn with_interval(quiet: bool, interval: Duration) -> Self {
        Self {
            start_time: Instant::now(),
            last_update: Instant::now(),
            update_interval: interval,
            quiet,
        }
    }

    /// Update the progress display
    pub fn update(&mut self, stats: &DownloadStats, total: u64) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }

        // Check if enough time has passed since last update
        if self.last_update.elapsed() < self.update_interval {
            return Ok(());
        }

        self.last_update = Instant::now();

        self.print_progress(stats, total)?;
        io::stdout().flush()?;

        Ok(())
    }

    /// Render the one-line progress bar
    pub fn progress_line(stats: &DownloadStats, total: u64) -> String {
        let progress_percent = (stats.progress * 100.0).clamp(0.0, 100.0);

        let bar_width: usize = 40;
        let filled = (progress_percent / 100.0 * bar_width as f64) as usize;
        let empty = bar_width.saturating_sub(filled);
        let bar: String = "=".repeat(filled) + &" ".repeat(empty);

        let done = (stats.progress.clamp(0.0, 1.0) * total as f64) as u64;
        let eta = DownloadStats::calculate_eta(done, total, stats.download_speed);
        let eta_str = eta
            .map(DownloadStats::format_duration)
            .unwrap_or_else(|| "∞".to_string());

        format!(
            "[{}] {:.1}% | {} / {} | ↓ {} | Tasks: {} | Mirrors: {}/{} | ETA: {}",
            bar,
            progress_percent,
            DownloadStats::format_bytes(done),
            DownloadStats::format_bytes(total),
            DownloadStats::format_speed(stats.download_speed),
            stats.active_tasks,
            stats.mirrors_ready,
            stats.mirrors_total,
            eta_str,
        )
    }

    /// Print progress bar
    pub fn print_progress(&mut self, stats: &DownloadStats, total: u64) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }

        // Clear the current line
        print!("\r\x1b[2K{}", Self::progress_line(stats, total));

        Ok(())
    }

    /// Print per-mirror totals and last errors
    pub fn print_mirrors(&self, mirrors: &[MirrorStats]) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }

        println!();
        println!("Mirrors:");
        for mirror in mirrors {
            println!("  {} - {}", mirror.url, DownloadStats::format_bytes(mirror.downloaded));
            if let Some(error) = &mirror.last_error {
                println!("    last error: {}", error);
            }
        }

        Ok(())
    }

    /// Print completion message
    pub fn print_complete(&self, stats: &DownloadStats, total: u64) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }

        // Clear the progress line
        print!("\r\x1b[2K");
        io::stdout().flush()?;

        println!();
        println!("Download Complete!");
        println!("  Selected size: {}", DownloadStats::format_bytes(total));
        println!("  Fetched from mirrors: {}", DownloadStats::format_bytes(stats.downloaded));
        println!("  Elapsed Time: {}", DownloadStats::format_duration(self.start_time.elapsed()));

        Ok(())
    }

    /// Print a status message
    pub fn print_status(&self, message: &str) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }

        println!("\r\x1b[2K{}", message);
        Ok(())
    }

    /// Print an error message
    pub fn print_error(&self, message: &str) -> io::Result<()> {
        eprintln!("\r\x1b[2KError: {}", message);
        Ok(())
    }

    /// Get the elapsed time since start
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Check if quiet mode is enabled
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}
