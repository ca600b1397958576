//! Progress publication and stage timing for one coordinator.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use occurrence_map_pipeline_models::{Progress, StageName, StageTiming};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

/// Overall percentage range a stage maps its own 0–1 progress into.
#[must_use]
pub const fn stage_range(stage: StageName) -> (f64, f64) {
    match stage {
        StageName::Initialization => (0.0, 5.0),
        StageName::FetchingData => (5.0, 20.0),
        StageName::ParsingData => (20.0, 40.0),
        StageName::ProcessingCoordinates => (40.0, 60.0),
        StageName::ApplyingFilters => (60.0, 80.0),
        StageName::DecimatingData => (80.0, 95.0),
        StageName::Finalizing => (95.0, 100.0),
        StageName::Completed | StageName::Error => (100.0, 100.0),
    }
}

pub fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Default)]
struct RunState {
    started: Option<Instant>,
    timings: Vec<StageTiming>,
    stage: Option<(StageName, Instant)>,
    message: String,
    stage_items: u64,
    closed_items: u64,
    last_percentage: f64,
    cancelled: bool,
}

impl RunState {
    /// Closes the open stage, if any, recording its duration and items.
    fn close_stage(&mut self, now: Instant) {
        if let Some((_, entered)) = self.stage.take() {
            if let Some(timing) = self.timings.last_mut() {
                timing.duration_ms = Some(millis(now - entered));
                timing.items_processed = self.stage_items;
            }
            self.closed_items += self.stage_items;
            self.stage_items = 0;
        }
    }
}

/// Owns the observable state of a coordinator: current progress, the
/// progress broadcast, the error slot, and the stage-timing log.
pub struct ProgressTracker {
    updates: broadcast::Sender<Progress>,
    current: watch::Sender<Option<Progress>>,
    error: watch::Sender<Option<String>>,
    run: Mutex<RunState>,
}

impl ProgressTracker {
    pub fn new(capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(capacity.max(1));
        let (current, _) = watch::channel(None);
        let (error, _) = watch::channel(None);

        Self {
            updates,
            current,
            error,
            run: Mutex::new(RunState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Progress> {
        self.updates.subscribe()
    }

    pub fn current(&self) -> Option<Progress> {
        self.current.borrow().clone()
    }

    pub fn error(&self) -> Option<String> {
        self.error.borrow().clone()
    }

    /// Starts a new run: clears timings, progress, and error.
    pub fn reset(&self) {
        *self.lock() = RunState {
            started: Some(Instant::now()),
            ..RunState::default()
        };
        self.current.send_replace(None);
        self.error.send_replace(None);
    }

    /// Clears progress and ignores further updates until the next
    /// [`Self::reset`].
    pub fn cancel(&self) {
        let mut run = self.lock();
        run.cancelled = true;
        run.stage = None;
        drop(run);
        self.current.send_replace(None);
    }

    /// Closes the current stage and opens `stage` at the start of its range.
    pub fn enter(&self, stage: StageName, message: impl Into<String>, total: u64) {
        let now = Instant::now();
        let mut run = self.lock();
        if run.cancelled {
            return;
        }
        let started = *run.started.get_or_insert(now);

        run.close_stage(now);
        run.timings.push(StageTiming {
            stage,
            started_at: Utc::now(),
            offset_ms: millis(now - started),
            duration_ms: None,
            items_processed: 0,
        });
        run.stage = Some((stage, now));
        run.message = message.into();

        log::info!("[{stage}] {}", run.message);

        let progress = build(&mut run, stage, 0.0, 0, total, now);
        drop(run);
        self.publish(progress);
    }

    /// Reports `current` of `total` items done in the open stage.
    #[allow(clippy::cast_precision_loss)]
    pub fn advance(&self, current: u64, total: u64) {
        let fraction = if total == 0 {
            1.0
        } else {
            current as f64 / total as f64
        };
        self.advance_fraction(fraction, current, total);
    }

    /// Reports a 0–1 completion fraction of the open stage.
    pub fn advance_fraction(&self, fraction: f64, current: u64, total: u64) {
        let now = Instant::now();
        let mut run = self.lock();
        if run.cancelled {
            return;
        }
        let Some((stage, _)) = run.stage else {
            return;
        };
        run.stage_items = current;

        log::debug!("[{stage}] {current}/{total}");

        let progress = build(&mut run, stage, fraction, current, total, now);
        drop(run);
        self.publish(progress);
    }

    /// Closes the open stage and publishes `completed` at 100%.
    pub fn complete(&self, message: impl Into<String>) {
        let now = Instant::now();
        let mut run = self.lock();
        if run.cancelled {
            return;
        }
        run.close_stage(now);
        run.message = message.into();
        let progress = build(&mut run, StageName::Completed, 1.0, 0, 0, now);
        drop(run);
        self.publish(progress);
    }

    /// Closes the open stage, sets the error slot, and publishes `error`
    /// at the last reported percentage.
    pub fn fail(&self, message: &str) {
        let now = Instant::now();
        let mut run = self.lock();
        if run.cancelled {
            return;
        }
        run.close_stage(now);
        run.message = message.to_string();
        let progress = build(&mut run, StageName::Error, 0.0, 0, 0, now);
        drop(run);

        self.error.send_replace(Some(message.to_string()));
        self.publish(progress);
    }

    /// Stage timings recorded so far in this run.
    pub fn timings(&self) -> Vec<StageTiming> {
        self.lock().timings.clone()
    }

    /// Milliseconds since the run's first stage.
    pub fn elapsed_ms(&self) -> u64 {
        self.lock()
            .started
            .map_or(0, |started| millis(started.elapsed()))
    }

    fn publish(&self, progress: Progress) {
        // No subscribers is fine.
        self.updates.send(progress.clone()).ok();
        self.current.send_replace(Some(progress));
    }
}

/// Builds a progress snapshot, clamping the percentage so it never moves
/// backwards within a run.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn build(
    run: &mut RunState,
    stage: StageName,
    fraction: f64,
    current: u64,
    total: u64,
    now: Instant,
) -> Progress {
    let (low, high) = stage_range(stage);
    let raw = fraction.clamp(0.0, 1.0).mul_add(high - low, low);
    let percentage = if stage == StageName::Error {
        run.last_percentage
    } else {
        raw.max(run.last_percentage).min(100.0)
    };
    run.last_percentage = percentage;

    let elapsed_ms = run.started.map_or(0, |started| millis(now - started));
    let eta_ms = (percentage > 0.0 && percentage < 100.0)
        .then(|| (elapsed_ms as f64 / percentage * (100.0 - percentage)).round() as u64);
    let items = run.closed_items + run.stage_items;
    let throughput = (elapsed_ms > 0).then(|| items as f64 / elapsed_ms as f64 * 1000.0);

    Progress {
        stage,
        percentage,
        message: run.message.clone(),
        current,
        total,
        eta_ms,
        throughput,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_ranges_tile_zero_to_hundred() {
        let stages = [
            StageName::Initialization,
            StageName::FetchingData,
            StageName::ParsingData,
            StageName::ProcessingCoordinates,
            StageName::ApplyingFilters,
            StageName::DecimatingData,
            StageName::Finalizing,
        ];
        let mut previous_end = 0.0;
        for stage in stages {
            let (low, high) = stage_range(stage);
            assert!((low - previous_end).abs() < f64::EPSILON, "{stage}");
            assert!(high > low);
            previous_end = high;
        }
        assert!((previous_end - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn stage_entries_are_timed_in_order() {
        let tracker = ProgressTracker::new(16);
        tracker.reset();
        tracker.enter(StageName::Initialization, "start", 0);
        tracker.enter(StageName::FetchingData, "fetch", 10);
        tracker.advance(10, 10);
        tracker.complete("done");

        let timings = tracker.timings();
        assert_eq!(timings.len(), 2);
        assert_eq!(timings[0].stage, StageName::Initialization);
        assert_eq!(timings[1].stage, StageName::FetchingData);
        assert!(timings.iter().all(StageTiming::is_closed));
        assert_eq!(timings[1].items_processed, 10);
        assert!(timings[0].offset_ms <= timings[1].offset_ms);

        let current = tracker.current().unwrap();
        assert_eq!(current.stage, StageName::Completed);
        assert!((current.percentage - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn percentage_never_moves_backwards() {
        let tracker = ProgressTracker::new(16);
        let mut rx = tracker.subscribe();
        tracker.reset();
        tracker.enter(StageName::ParsingData, "parse", 100);
        tracker.advance(80, 100);
        // A fallback restarting the stage reports lower progress.
        tracker.advance(10, 100);

        let mut seen = Vec::new();
        while let Ok(progress) = rx.try_recv() {
            seen.push(progress.percentage);
        }
        assert_eq!(seen.len(), 3);
        assert!((seen[1] - 36.0).abs() < 1e-9);
        assert!((seen[2] - 36.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn fail_sets_error_and_keeps_percentage() {
        let tracker = ProgressTracker::new(16);
        tracker.reset();
        tracker.enter(StageName::FetchingData, "fetch", 0);
        tracker.advance_fraction(0.5, 0, 0);
        tracker.fail("network down");

        assert_eq!(tracker.error().as_deref(), Some("network down"));
        let current = tracker.current().unwrap();
        assert_eq!(current.stage, StageName::Error);
        assert!((current.percentage - 12.5).abs() < 1e-9);
        assert_eq!(tracker.timings().len(), 1);
    }

    #[tokio::test]
    async fn cancel_clears_and_silences() {
        let tracker = ProgressTracker::new(16);
        tracker.reset();
        tracker.enter(StageName::FetchingData, "fetch", 0);
        tracker.cancel();
        tracker.advance_fraction(0.5, 0, 0);
        tracker.enter(StageName::ParsingData, "parse", 0);

        assert!(tracker.current().is_none());
        assert_eq!(tracker.timings().len(), 1);

        tracker.reset();
        assert!(tracker.timings().is_empty());
        tracker.enter(StageName::Initialization, "again", 0);
        assert!(tracker.current().is_some());
    }
}
