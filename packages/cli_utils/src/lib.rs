#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Shared CLI utilities for the occurrence map tools.
//!
//! Provides an `indicatif` bar driven by pipeline [`Progress`] updates,
//! plus [`init_logger`] which sets up `indicatif-log-bridge` so that
//! `log::info!` and friends are suspended while progress bars redraw.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use occurrence_map_pipeline_models::{Progress, StageName};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub use indicatif::MultiProgress;

/// A 0–100 bar that mirrors a load's overall percentage.
#[derive(Clone)]
pub struct LoadProgressBar {
    bar: ProgressBar,
}

impl LoadProgressBar {
    /// Adds a bar to `multi`.
    #[must_use]
    pub fn new(multi: &MultiProgress, message: &str) -> Self {
        let bar = multi.add(ProgressBar::new(100));
        bar.enable_steady_tick(Duration::from_millis(100));
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {msg} {wide_bar:.cyan/dim} {percent}% [{elapsed_precise}]",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-"),
        );
        bar.set_message(message.to_string());

        Self { bar }
    }

    /// A bar that never draws.
    #[must_use]
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    /// Moves the bar to `progress`, finishing it on a terminal stage.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn update(&self, progress: &Progress) {
        self.bar
            .set_position(progress.percentage.clamp(0.0, 100.0).round() as u64);
        let line = format_progress(progress);

        match progress.stage {
            StageName::Completed => self.bar.finish_with_message(line),
            StageName::Error => self.bar.abandon_with_message(line),
            _ => self.bar.set_message(line),
        }
    }

    /// Current position, 0–100.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.bar.is_finished()
    }

    pub fn finish_and_clear(&self) {
        self.bar.finish_and_clear();
    }

    /// Feeds every update from `updates` into the bar until a terminal stage
    /// arrives or the channel closes.
    pub fn follow(self, mut updates: broadcast::Receiver<Progress>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(progress) => {
                        self.update(&progress);
                        if progress.stage.is_terminal() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::debug!("progress bar skipped {skipped} updates");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

/// One-line summary of a progress update, e.g.
/// `parsing-data: Parsing 1000 records (250/1000, 800 items/s, ETA 2s)`.
#[must_use]
pub fn format_progress(progress: &Progress) -> String {
    let mut details = Vec::new();
    if progress.total > 0 {
        details.push(format!("{}/{}", progress.current, progress.total));
    }
    if let Some(throughput) = progress.throughput
        && throughput > 0.0
    {
        details.push(format!("{throughput:.0} items/s"));
    }
    if let Some(eta_ms) = progress.eta_ms {
        details.push(format!("ETA {}s", eta_ms.div_ceil(1_000)));
    }

    if details.is_empty() {
        format!("{}: {}", progress.stage, progress.message)
    } else {
        format!(
            "{}: {} ({})",
            progress.stage,
            progress.message,
            details.join(", ")
        )
    }
}

/// Initializes the global logger wrapped in `indicatif-log-bridge` so that
/// `log::info!` and friends are suspended while progress bars redraw.
///
/// Returns the [`MultiProgress`] that all progress bars must be added to.
#[must_use]
pub fn init_logger() -> MultiProgress {
    let multi = MultiProgress::new();

    // Build the pretty-env-logger logger manually so we can wrap it.
    let logger = pretty_env_logger::formatted_builder()
        .parse_env("RUST_LOG")
        .build();
    let level = logger.filter();

    indicatif_log_bridge::LogWrapper::new(multi.clone(), logger)
        .try_init()
        .ok(); // Ignore error if logger was already set (e.g., in tests)

    log::set_max_level(level);

    multi
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(stage: StageName, percentage: f64) -> Progress {
        Progress {
            stage,
            percentage,
            message: "Parsing 1000 records".to_string(),
            current: 250,
            total: 1_000,
            eta_ms: Some(1_200),
            throughput: Some(812.4),
        }
    }

    #[test]
    fn formats_details() {
        assert_eq!(
            format_progress(&progress(StageName::ParsingData, 25.0)),
            "parsing-data: Parsing 1000 records (250/1000, 812 items/s, ETA 2s)"
        );
    }

    #[test]
    fn formats_bare_message() {
        let p = Progress {
            total: 0,
            eta_ms: None,
            throughput: None,
            ..progress(StageName::Finalizing, 95.0)
        };
        assert_eq!(format_progress(&p), "finalizing: Parsing 1000 records");
    }

    #[test]
    fn update_tracks_percentage() {
        let bar = LoadProgressBar::hidden();
        bar.update(&progress(StageName::ParsingData, 27.6));
        assert_eq!(bar.position(), 28);
        assert!(!bar.is_finished());
    }

    #[tokio::test]
    async fn follow_stops_on_completion() {
        let (tx, rx) = broadcast::channel(8);
        let bar = LoadProgressBar::hidden();
        let handle = bar.clone().follow(rx);

        tx.send(progress(StageName::ParsingData, 30.0)).unwrap();
        tx.send(progress(StageName::Completed, 100.0)).unwrap();
        handle.await.unwrap();

        assert_eq!(bar.position(), 100);
        assert!(bar.is_finished());
    }
}
