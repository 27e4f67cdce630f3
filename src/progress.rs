//! Terminal feedback while waiting on the provider.

use std::sync::Mutex;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

/// Shows the user that a long wait is in progress.
pub trait WaitIndicator: Send + Sync {
    /// Begins displaying `message`.
    fn start(&self, message: &str);
    /// Stops the current indication, leaving `message` behind as a success.
    fn finish(&self, message: &str);
    /// Stops the current indication, leaving `message` behind as a failure.
    fn fail(&self, message: &str);
}

/// Indicator that prints nothing. Used for JSON output and in tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct SilentIndicator;

impl WaitIndicator for SilentIndicator {
    fn start(&self, _message: &str) {}

    fn finish(&self, _message: &str) {}

    fn fail(&self, _message: &str) {}
}

/// Spinner drawn on stderr via `indicatif`.
#[derive(Debug, Default)]
pub struct SpinnerIndicator {
    bar: Mutex<Option<ProgressBar>>,
}

impl SpinnerIndicator {
    /// Creates an idle spinner.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn style() -> ProgressStyle {
        ProgressStyle::with_template("{spinner:.cyan} {msg} ({elapsed})")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
    }

    fn stop(&self, mark: &str, message: &str) -> bool {
        if let Ok(mut slot) = self.bar.lock()
            && let Some(bar) = slot.take()
        {
            bar.finish_with_message(status_line(mark, message));
            return true;
        }
        false
    }
}

const SUCCESS_MARK: &str = "✓";
const FAILURE_MARK: &str = "✗";

fn status_line(mark: &str, message: &str) -> String {
    format!("{mark} {message}")
}

impl WaitIndicator for SpinnerIndicator {
    fn start(&self, message: &str) {
        let bar = ProgressBar::new_spinner();
        bar.set_style(Self::style());
        bar.set_message(message.to_owned());
        bar.enable_steady_tick(Duration::from_millis(80));
        if let Ok(mut slot) = self.bar.lock()
            && let Some(previous) = slot.replace(bar)
        {
            previous.finish_and_clear();
        }
    }

    fn finish(&self, message: &str) {
        self.stop(SUCCESS_MARK, message);
    }

    fn fail(&self, message: &str) {
        self.stop(FAILURE_MARK, message);
    }
}
