//! Terminal presentation of update progress.

use {
    console::style,
    flashpilot::{LogLevel, ProgressSink, StatusCategory},
    indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle},
};

/// Prints status lines to stderr and drives a progress bar while flashing.
pub struct ConsoleSink {
    bar: ProgressBar,
    quiet: bool,
    fancy: bool,
}

impl ConsoleSink {
    /// `fancy` enables emoji markers and the animated bar.
    pub fn new(quiet: bool, fancy: bool) -> Self {
        let bar = ProgressBar::with_draw_target(Some(100), ProgressDrawTarget::hidden());
        #[allow(clippy::unwrap_used)] // Static template string
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        Self { bar, quiet, fancy }
    }

    fn print(&self, line: &str) {
        self.bar.suspend(|| eprintln!("{line}"));
    }
}

fn marker(category: StatusCategory, fancy: bool) -> String {
    let (emoji, plain) = match category {
        StatusCategory::Info => ("ℹ", "-"),
        StatusCategory::Working => ("⏳", ">"),
        StatusCategory::Success => ("🎉", "+"),
        StatusCategory::Error => ("✗", "!"),
    };
    let symbol = if fancy { emoji } else { plain };
    match category {
        StatusCategory::Info => style(symbol).blue().to_string(),
        StatusCategory::Working => style(symbol).yellow().to_string(),
        StatusCategory::Success => style(symbol).green().bold().to_string(),
        StatusCategory::Error => style(symbol).red().bold().to_string(),
    }
}

impl ProgressSink for ConsoleSink {
    fn on_status(&self, text: &str, category: StatusCategory) {
        if matches!(category, StatusCategory::Success | StatusCategory::Error) {
            self.bar.finish_and_clear();
        }
        if self.quiet && category != StatusCategory::Error {
            return;
        }
        self.print(&format!("{} {text}", marker(category, self.fancy)));
    }

    fn on_log(&self, text: &str, level: LogLevel) {
        match level {
            LogLevel::Debug => {},
            LogLevel::Info if self.quiet => {},
            LogLevel::Info => self.print(&format!("  {}", style(text).dim())),
            LogLevel::Warn => self.print(&format!("{} {text}", style("warning:").yellow().bold())),
            LogLevel::Error => self.print(&format!("{} {text}", style("error:").red().bold())),
        }
    }

    fn on_progress(&self, percent: u8) {
        if self.fancy && !self.quiet && self.bar.is_hidden() {
            self.bar.set_draw_target(ProgressDrawTarget::stderr());
        }
        self.bar.set_position(u64::from(percent));
    }
}
