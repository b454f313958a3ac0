//! Download progress reporting

use std::time::{Duration, Instant};

/// Receives `(path, bytes written so far, total)` while a blob is written.
///
/// The object store calls it at least once per chunk and once more when the
/// blob is complete, with `written == total`.
pub trait ProgressSink {
    fn update(&mut self, path: &str, written: u64, total: Option<u64>);
}

impl<F> ProgressSink for F
where
    F: FnMut(&str, u64, Option<u64>),
{
    fn update(&mut self, path: &str, written: u64, total: Option<u64>) {
        self(path, written, total)
    }
}

/// Discards all updates
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn update(&mut self, _path: &str, _written: u64, _total: Option<u64>) {}
}

/// Transient state of the current sync session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadStatus {
    /// Path currently being fetched
    pub path: String,
    pub written: u64,
    pub total: Option<u64>,
    /// Bytes written across the whole session
    pub session_bytes: u64,
}

impl DownloadStatus {
    pub fn is_complete(&self) -> bool {
        self.total == Some(self.written)
    }

    pub fn percent(&self) -> Option<u64> {
        match self.total {
            Some(0) => Some(100),
            Some(t) => Some(self.written.saturating_mul(100) / t),
            None => None,
        }
    }
}

/// How a [`ProgressReporter`] shows updates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStyle {
    /// `tracing` events only
    Log,
    /// A refreshing status line on stderr
    Terminal,
}

/// Tracks [`DownloadStatus`] and reports it at most once per interval,
/// plus once when each file completes.
pub struct ProgressReporter {
    style: ProgressStyle,
    status: Option<DownloadStatus>,
    session_bytes: u64,
    completed_files: u64,
    interval: Duration,
    last_emit: Option<Instant>,
}

impl ProgressReporter {
    pub fn new(style: ProgressStyle) -> Self {
        Self {
            style,
            status: None,
            session_bytes: 0,
            completed_files: 0,
            interval: Duration::from_millis(500),
            last_emit: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn status(&self) -> Option<&DownloadStatus> {
        self.status.as_ref()
    }

    pub fn session_bytes(&self) -> u64 {
        self.session_bytes
    }

    pub fn completed_files(&self) -> u64 {
        self.completed_files
    }

    fn emit(&self, status: &DownloadStatus, done: bool) {
        match self.style {
            ProgressStyle::Log => {
                if done {
                    tracing::info!(
                        "fetched {} ({} bytes, {} this session)",
                        status.path,
                        status.written,
                        status.session_bytes
                    );
                } else {
                    tracing::debug!(
                        "fetching {}: {}/{} bytes",
                        status.path,
                        status.written,
                        status
                            .total
                            .map(|t| t.to_string())
                            .unwrap_or_else(|| "?".to_string())
                    );
                }
            }
            ProgressStyle::Terminal => {
                let pct = status
                    .percent()
                    .map(|p| format!("{:>3}%", p))
                    .unwrap_or_else(|| "  ?%".to_string());
                eprint!(
                    "\r{} {} {} (session {})",
                    pct,
                    status.path,
                    format_size(status.written),
                    format_size(status.session_bytes)
                );
                if done {
                    eprintln!();
                }
            }
        }
    }
}

impl ProgressSink for ProgressReporter {
    fn update(&mut self, path: &str, written: u64, total: Option<u64>) {
        let (previous, was_complete) = match &self.status {
            Some(s) if s.path == path => (s.written, s.is_complete()),
            _ => (0, false),
        };
        self.session_bytes += written.saturating_sub(previous);

        let status = DownloadStatus {
            path: path.to_string(),
            written,
            total,
            session_bytes: self.session_bytes,
        };
        let done = status.is_complete() && !was_complete;
        let due = self
            .last_emit
            .map(|t| t.elapsed() >= self.interval)
            .unwrap_or(true);

        if done {
            self.completed_files += 1;
        }
        if done || due {
            self.emit(&status, done);
            self.last_emit = Some(Instant::now());
        }
        self.status = Some(status);
    }
}

/// Human-readable byte count
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
