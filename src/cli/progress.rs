//! Progress display module
//!
//! Renders download snapshots for the CLI.

use std::io::{self, Write};
use std::time::{Duration, Instant};

use crate::download::{DownloadStatus, PState, StateSnapshot};

/// Figures shown for one download
#[derive(Debug, Clone, Default)]
pub struct DownloadStats {
    pub name: String,
    pub info_hash: String,
    pub status: DownloadStatus,
    /// Size of the wanted content
    pub total: u64,
    pub uploaded: u64,
    /// Download speed in bytes per second
    pub download_speed: f64,
    /// Upload speed in bytes per second
    pub upload_speed: f64,
    pub peers: usize,
    /// Download progress (0.0 to 1.0)
    pub progress: f64,
    pub ratio: f64,
}

impl DownloadStats {
    pub fn from_snapshot(snapshot: &StateSnapshot, total: u64) -> Self {
        Self {
            name: snapshot.name.clone(),
            info_hash: snapshot.info_hash.clone(),
            status: snapshot.status,
            total,
            uploaded: snapshot.seeding.total_up,
            download_speed: snapshot.down_rate,
            upload_speed: snapshot.up_rate,
            peers: snapshot.peer_count,
            progress: snapshot.progress,
            ratio: snapshot.seeding.ratio,
        }
    }

    /// Verified bytes, derived from progress
    pub fn downloaded(&self) -> u64 {
        (self.total as f64 * self.progress.clamp(0.0, 1.0)) as u64
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
        Some(Duration::from_secs_f64(remaining / speed))
    }

    fn status_label(&self) -> &'static str {
        match self.status {
            DownloadStatus::Created => "created",
            DownloadStatus::Hashchecking => "checking",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Seeding => "seeding",
            DownloadStatus::Stopped => "stopped",
            DownloadStatus::StoppedOnError => "error",
        }
    }

    /// One status line
    pub fn render(&self) -> String {
        let bar_width: usize = 30;
        let filled = ((self.progress.clamp(0.0, 1.0) * bar_width as f64) as usize).min(bar_width);
        let bar = "=".repeat(filled) + &" ".repeat(bar_width - filled);
        let eta = Self::calculate_eta(self.downloaded(), self.total, self.download_speed)
            .map(Self::format_duration)
            .unwrap_or_else(|| "-".to_string());
        format!(
            "{} {:<11} [{}] {:.1}% | {} | ↓ {} | ↑ {} | peers {} | ratio {:.2} | ETA {}",
            &self.info_hash[..self.info_hash.len().min(8)],
            self.status_label(),
            bar,
            self.progress * 100.0,
            Self::format_bytes(self.total),
            Self::format_speed(self.download_speed),
            Self::format_speed(self.upload_speed),
            self.peers,
            self.ratio,
            eta,
        )
    }
}

/// Progress display for CLI
pub struct ProgressDisplay {
    start_time: Instant,
    last_update: Option<Instant>,
    update_interval: Duration,
    quiet: bool,
}

impl ProgressDisplay {
    pub fn new(quiet: bool) -> Self {
        Self::with_interval(quiet, Duration::from_secs(2))
    }

    pub fn with_interval(quiet: bool, interval: Duration) -> Self {
        Self {
            start_time: Instant::now(),
            last_update: None,
            update_interval: interval,
            quiet,
        }
    }

    /// Print one line per download, at most once per interval
    pub fn update(&mut self, stats: &[DownloadStats]) -> io::Result<()> {
        if self.quiet || stats.is_empty() {
            return Ok(());
        }
        if self.last_update.is_some_and(|at| at.elapsed() < self.update_interval) {
            return Ok(());
        }
        self.last_update = Some(Instant::now());

        let mut out = io::stdout().lock();
        for s in stats {
            writeln!(out, "{}", s.render())?;
        }
        out.flush()
    }

    /// Print completion message
    pub fn print_complete(&self, stats: &DownloadStats) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        println!(
            "Completed {} ({}) after {}",
            stats.name,
            DownloadStats::format_bytes(stats.total),
            DownloadStats::format_duration(self.start_time.elapsed())
        );
        Ok(())
    }

    /// Table of stored downloads for `--list`
    pub fn print_list(&self, states: &[PState]) -> io::Result<()> {
        let mut out = io::stdout().lock();
        if states.is_empty() {
            writeln!(out, "No downloads")?;
            return Ok(());
        }
        for s in states {
            writeln!(
                out,
                "{}  {:<14} {:>6.1}%  up {}  {}",
                s.info_hash,
                format!("{:?}", s.status),
                s.progress * 100.0,
                DownloadStats::format_bytes(s.seeding.total_up),
                s.name
            )?;
        }
        Ok(())
    }

    /// Print a status message
    pub fn print_status(&self, message: &str) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        println!("{}", message);
        Ok(())
    }

    /// Print an error message
    pub fn print_error(&self, message: &str) -> io::Result<()> {
        eprintln!("Error: {}", message);
        Ok(())
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(DownloadStats::format_bytes(0), "0.00 B");
        assert_eq!(DownloadStats::format_bytes(1024), "1.00 KB");
        assert_eq!(DownloadStats::format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(DownloadStats::format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(DownloadStats::format_speed(1024.0), "1.00 KB/s");
        assert_eq!(DownloadStats::format_speed(1024.0 * 1024.0), "1.00 MB/s");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(DownloadStats::format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(DownloadStats::format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(DownloadStats::format_duration(Duration::from_secs(3661)), "1h 1m 1s");
    }

    #[test]
    fn test_calculate_eta() {
        assert_eq!(DownloadStats::calculate_eta(50, 100, 10.0), Some(Duration::from_secs(5)));
        assert_eq!(DownloadStats::calculate_eta(100, 100, 10.0), None);
        assert_eq!(DownloadStats::calculate_eta(50, 100, 0.0), None);
    }

    #[test]
    fn test_render_from_snapshot() {
        let snapshot = StateSnapshot {
            info_hash: "0123456789abcdef".into(),
            name: "movie.mkv".into(),
            status: DownloadStatus::Downloading,
            progress: 0.5,
            down_rate: 1024.0,
            peer_count: 3,
            ..StateSnapshot::default()
        };
        let stats = DownloadStats::from_snapshot(&snapshot, 4096);
        assert_eq!(stats.downloaded(), 2048);
        let line = stats.render();
        assert!(line.starts_with("01234567 downloading"));
        assert!(line.contains("50.0%"));
        assert!(line.contains("peers 3"));
        assert!(line.contains("ETA 2s"));
    }

    #[test]
    fn test_progress_display_quiet() {
        let mut display = ProgressDisplay::new(true);
        assert!(display.is_quiet());
        assert!(display.update(&[DownloadStats::default()]).is_ok());
    }
}
