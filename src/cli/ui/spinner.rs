use std::future::Future;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

/// Spinner shown on stderr while a scan window or connect is running.
#[derive(Debug)]
pub(crate) struct Spinner {
    enabled: bool,
}

impl Spinner {
    pub(crate) fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Awaits `operation`, ticking a spinner with elapsed time when enabled.
    pub(crate) async fn run<Fut, T>(&self, message: &str, operation: Fut) -> T
    where
        Fut: Future<Output = T>,
    {
        if !self.enabled {
            return operation.await;
        }

        let spinner = ProgressBar::new_spinner()
            .with_style(spinner_style())
            .with_message(message.to_string());
        spinner.enable_steady_tick(Duration::from_millis(90));
        let output = operation.await;
        spinner.finish_and_clear();
        output
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.cyan.bold} {msg} {elapsed:.dim}")
        .unwrap_or_else(|_error| ProgressStyle::default_spinner())
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
}
