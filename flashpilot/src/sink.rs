//! Progress and status reporting.

use log::{debug, error, info, warn};

/// Status category shown next to a status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCategory {
    /// Neutral information.
    Info,
    /// A phase is in progress.
    Working,
    /// The update finished successfully.
    Success,
    /// The update failed.
    Error,
}

/// Log entry level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Diagnostic detail.
    Debug,
    /// Informational.
    Info,
    /// Something suspicious that does not stop the update.
    Warn,
    /// A failure.
    Error,
}

/// Receives state, log and percentage events. Fire-and-forget.
pub trait ProgressSink: Send + Sync {
    /// A new status line.
    fn on_status(&self, text: &str, category: StatusCategory);

    /// A log entry.
    fn on_log(&self, text: &str, level: LogLevel);

    /// Percentage (0-100) of the image currently being written.
    fn on_progress(&self, percent: u8);
}

/// Sink forwarding every event to the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn on_status(&self, text: &str, category: StatusCategory) {
        match category {
            StatusCategory::Error => error!("{text}"),
            _ => info!("{text}"),
        }
    }

    fn on_log(&self, text: &str, level: LogLevel) {
        match level {
            LogLevel::Debug => debug!("{text}"),
            LogLevel::Info => info!("{text}"),
            LogLevel::Warn => warn!("{text}"),
            LogLevel::Error => error!("{text}"),
        }
    }

    fn on_progress(&self, percent: u8) {
        debug!("progress {percent}%");
    }
}

/// Converts `(image_index, written, total)` reports into per-image
/// percentages that never go backwards.
#[derive(Debug, Default)]
pub(crate) struct ImageProgress {
    image: Option<usize>,
    last: Option<u8>,
}

impl ImageProgress {
    /// Percentage to publish, or `None` if it would repeat or regress.
    pub(crate) fn update(&mut self, image: usize, written: usize, total: usize) -> Option<u8> {
        if self.image != Some(image) {
            self.image = Some(image);
            self.last = None;
        }

        let percent = percent_of(written, total);
        match self.last {
            Some(last) if percent <= last => None,
            _ => {
                self.last = Some(percent);
                Some(percent)
            },
        }
    }

    /// Final 100% for the last image, unless it was already published.
    pub(crate) fn finish(&mut self) -> Option<u8> {
        match self.last {
            Some(100) => None,
            _ => {
                self.last = Some(100);
                Some(100)
            },
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn percent_of(written: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    let clamped = written.min(total) as u128;
    // Bounded by 100 after the clamp
    (clamped * 100 / total as u128) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_of() {
        assert_eq!(percent_of(0, 200), 0);
        assert_eq!(percent_of(50, 200), 25);
        assert_eq!(percent_of(200, 200), 100);
        assert_eq!(percent_of(300, 200), 100);
        assert_eq!(percent_of(0, 0), 100);
    }

    #[test]
    fn test_progress_never_regresses_within_image() {
        let mut p = ImageProgress::default();
        assert_eq!(p.update(0, 10, 100), Some(10));
        assert_eq!(p.update(0, 5, 100), None);
        assert_eq!(p.update(0, 10, 100), None);
        assert_eq!(p.update(0, 60, 100), Some(60));
    }

    #[test]
    fn test_progress_restarts_for_next_image() {
        let mut p = ImageProgress::default();
        assert_eq!(p.update(0, 100, 100), Some(100));
        assert_eq!(p.update(1, 0, 100), Some(0));
        assert_eq!(p.update(1, 40, 100), Some(40));
    }

    #[test]
    fn test_finish_publishes_100_once() {
        let mut p = ImageProgress::default();
        p.update(0, 90, 100);
        assert_eq!(p.finish(), Some(100));
        assert_eq!(p.finish(), None);

        let mut done = ImageProgress::default();
        done.update(0, 100, 100);
        assert_eq!(done.finish(), None);
    }
}
