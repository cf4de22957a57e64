//! Throttled progress display using indicatif.
//!
//! Each pipeline stage owns one [`Bar`] for the duration of its run. The
//! bar accepts a free-form status (anything `Display`) and repaints at most
//! 20 times per second regardless of how often stages push updates, so
//! per-file update rates never translate into terminal spam.
//!
//! When progress is disabled all methods are no-ops.

use std::fmt::Display;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Maximum stderr repaint rate (20 Hz = one redraw per 50 ms).
const REDRAW_HZ: u8 = 20;

/// Spinner tick interval.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// A progress spinner on stderr, or a no-op when disabled.
pub struct Bar {
    bar: Option<ProgressBar>,
}

impl Bar {
    /// Create a spinner-style bar.
    ///
    /// With `enabled == false` every method on the returned bar does
    /// nothing, which lets stages drive progress unconditionally.
    #[must_use]
    pub fn spinner(enabled: bool) -> Self {
        if !enabled {
            return Self { bar: None };
        }

        let bar = ProgressBar::new_spinner();
        bar.set_draw_target(ProgressDrawTarget::stderr_with_hz(REDRAW_HZ));
        bar.set_style(
            ProgressStyle::with_template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(TICK_INTERVAL);
        Self { bar: Some(bar) }
    }

    /// Update the status message shown next to the spinner.
    pub fn describe(&self, status: &dyn Display) {
        if let Some(bar) = &self.bar {
            bar.set_message(status.to_string());
        }
    }

    /// Clear the spinner and print a final one-line summary to stderr.
    pub fn finish(&self, status: &dyn Display) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
            eprintln!("✔ {status}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_bar_is_noop() {
        let bar = Bar::spinner(false);
        bar.describe(&"status");
        bar.finish(&"done");
    }
}
