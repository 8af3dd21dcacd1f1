//! Transfer progress observers

use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;

/// Receives progress updates, decoupled from the transport
pub trait ProgressObserver: Send + Sync {
    /// Called once before streaming with the starting offset
    fn start(&self, file: &str, offset: u64, total: Option<u64>) {
        let _ = (file, offset, total);
    }

    /// Bytes present on disk so far, out of the expected total
    fn progress(&self, bytes: u64, total: Option<u64>);

    fn finish(&self, bytes: u64) {
        let _ = bytes;
    }
}

/// Discards every update
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn progress(&self, _bytes: u64, _total: Option<u64>) {}
}

/// Terminal progress bar
pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        if let Ok(style) = ProgressStyle::default_bar().template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}",
        ) {
            bar.set_style(style.progress_chars("#>-"));
        }
        Self { bar }
    }
}

impl Default for BarProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressObserver for BarProgress {
    fn start(&self, file: &str, offset: u64, total: Option<u64>) {
        self.bar.set_message(file.to_string());
        if let Some(total) = total {
            self.bar.set_length(total);
        }
        self.bar.set_position(offset);
    }

    fn progress(&self, bytes: u64, _total: Option<u64>) {
        self.bar.set_position(bytes);
    }

    fn finish(&self, bytes: u64) {
        self.bar.set_position(bytes);
        self.bar.finish();
    }
}

/// Logs progress through `tracing` every `step` bytes
pub struct LogProgress {
    step: u64,
    last: Mutex<u64>,
}

impl LogProgress {
    pub fn new(step: u64) -> Self {
        Self {
            step: step.max(1),
            last: Mutex::new(0),
        }
    }
}

impl ProgressObserver for LogProgress {
    fn start(&self, file: &str, offset: u64, total: Option<u64>) {
        if let Ok(mut last) = self.last.lock() {
            *last = offset;
        }
        tracing::info!(file = %file, offset = offset, total = ?total, "Download started");
    }

    fn progress(&self, bytes: u64, total: Option<u64>) {
        let Ok(mut last) = self.last.lock() else {
            return;
        };
        if bytes.saturating_sub(*last) >= self.step {
            *last = bytes;
            tracing::info!(bytes = bytes, total = ?total, "Download progress");
        }
    }

    fn finish(&self, bytes: u64) {
        tracing::info!(bytes = bytes, "Download finished");
    }
}
