//! The load state machine.
//!
//! `initialization → fetching-data → parsing-data → processing-coordinates
//! → applying-filters → [decimating-data] → finalizing → completed`, with
//! `error` reachable from every non-terminal stage.

use std::sync::Arc;

use chrono::Utc;
use occurrence_map_occurrence_models::{
    DataPoint, DecimationSettings, LoadRequest, QualityFilters, QualityRating, RawRecord,
};
use occurrence_map_pipeline_models::{LoadMetadata, LoadResult, Progress, StageName};
use occurrence_map_source::{OccurrenceApi, OccurrenceQuery};
use occurrence_map_validation::{RejectionTally, validate_coordinates};
use occurrence_map_worker::{
    ParseSummary, WorkerError, WorkerPayload, WorkerPool, WorkerTask, parse_records,
    run_decimation,
};
use tokio::sync::{broadcast, watch};

use crate::config::PipelineConfig;
use crate::tracker::ProgressTracker;
use crate::{PipelineError, filters};

/// Runs loads against one occurrence API, using a (possibly shared) worker
/// pool for parsing and decimation.
///
/// Progress, error state, and stage timings belong to this instance; run
/// concurrent loads on separate coordinators.
pub struct PipelineCoordinator {
    api: Arc<dyn OccurrenceApi>,
    pool: Arc<WorkerPool>,
    config: PipelineConfig,
    tracker: ProgressTracker,
    cancel: watch::Sender<u64>,
}

impl PipelineCoordinator {
    /// Creates a coordinator that fetches from `api` and offloads work to `pool`.
    #[must_use]
    pub fn new(
        api: Arc<dyn OccurrenceApi>,
        pool: Arc<WorkerPool>,
        config: PipelineConfig,
    ) -> Self {
        let tracker = ProgressTracker::new(config.progress_channel_capacity);
        let (cancel, _) = watch::channel(0);

        Self {
            api,
            pool,
            config,
            tracker,
            cancel,
        }
    }

    /// Receives every progress update published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Progress> {
        self.tracker.subscribe()
    }

    /// Latest progress, or `None` before a load starts or after a cancel.
    #[must_use]
    pub fn progress(&self) -> Option<Progress> {
        self.tracker.current()
    }

    /// Message of the error that ended the last load, if any.
    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.tracker.error()
    }

    /// Abandons the in-flight load.
    ///
    /// Clears progress, terminates every busy worker in the pool, and makes
    /// the pending [`Self::load`] return [`PipelineError::Cancelled`].
    /// Calling it with nothing in flight is harmless.
    pub fn cancel(&self) {
        log::info!("Cancelling load");
        self.cancel.send_modify(|generation| *generation += 1);
        self.tracker.cancel();
        self.pool.cancel_all();
    }

    /// Loads, validates, filters, and optionally decimates occurrences.
    ///
    /// # Errors
    ///
    /// * [`PipelineError::Fetch`] if the occurrence API call fails.
    /// * [`PipelineError::ValidationExhausted`] if no point survives
    ///   coordinate validation or the quality filters.
    /// * [`PipelineError::Worker`] if in-process decimation panics.
    /// * [`PipelineError::Cancelled`] if [`Self::cancel`] is called first.
    pub async fn load(&self, request: LoadRequest) -> Result<LoadResult, PipelineError> {
        let mut cancelled = self.cancel.subscribe();
        self.tracker.reset();

        tokio::select! {
            biased;
            () = wait_for_cancel(&mut cancelled) => Err(PipelineError::Cancelled),
            result = self.run(request) => {
                if let Err(e) = &result {
                    log::error!("Load failed: {e}");
                    self.tracker.fail(&e.to_string());
                }
                result
            }
        }
    }

    async fn run(&self, request: LoadRequest) -> Result<LoadResult, PipelineError> {
        self.tracker.enter(
            StageName::Initialization,
            format!(
                "Loading {} from {} to {}",
                request.taxon, request.date_range.start, request.date_range.end
            ),
            0,
        );

        let records = self.fetch(&request).await?;
        let total_source_records = records.len() as u64;

        let summary = self.parse(records).await;
        let mut rejections = summary.rejections;

        let points = self.process_coordinates(summary.points, &mut rejections).await;
        rejections.log_summary("Validation");
        if points.is_empty() {
            return Err(PipelineError::ValidationExhausted(
                "no valid coordinates after validation".to_string(),
            ));
        }
        let valid_records = points.len() as u64;

        let points = match &request.quality_filters {
            Some(filters) if !filters.is_empty() => self.apply_filters(points, filters).await,
            _ => {
                self.tracker.enter(StageName::ApplyingFilters, "No filters configured", 0);
                points
            }
        };
        if points.is_empty() {
            return Err(PipelineError::ValidationExhausted(
                "no points left after applying quality filters".to_string(),
            ));
        }
        let filtered_records = points.len() as u64;

        let points = match request.decimation {
            Some(settings) if points.len() > settings.target_count => {
                self.decimate(points, settings).await?
            }
            _ => points,
        };

        self.tracker.enter(StageName::Finalizing, "Assembling result", 0);
        let quality_rating = QualityRating::from_valid_ratio(valid_records, total_source_records);
        let final_point_count = points.len() as u64;
        self.tracker.complete(format!("Loaded {final_point_count} points"));

        let metadata = LoadMetadata {
            total_source_records,
            valid_records,
            filtered_records,
            final_point_count,
            elapsed_ms: self.tracker.elapsed_ms(),
            quality_rating,
            stage_timings: self.tracker.timings(),
            rejection_counts: rejections,
        };

        log::info!(
            "Load complete: {total_source_records} fetched, {valid_records} valid, \
             {filtered_records} after filters, {final_point_count} returned ({quality_rating}) in {}ms",
            metadata.elapsed_ms
        );

        Ok(LoadResult {
            request,
            points,
            metadata,
        })
    }

    async fn fetch(&self, request: &LoadRequest) -> Result<Vec<RawRecord>, PipelineError> {
        self.tracker.enter(
            StageName::FetchingData,
            format!("Fetching occurrences from {}", self.api.name()),
            0,
        );

        let query = OccurrenceQuery {
            taxon: request.taxon.clone(),
            date_range: request.date_range,
            limit: request.max_points,
            bounds: request.bounds,
        };
        let page = self.api.fetch(&query).await?;

        let fetched = page.results.len() as u64;
        self.tracker.advance(fetched, fetched);
        log::info!("Fetched {fetched} records ({} available)", page.count);

        Ok(page.results)
    }

    async fn parse(&self, records: Vec<RawRecord>) -> ParseSummary {
        let total = records.len() as u64;
        self.tracker
            .enter(StageName::ParsingData, format!("Parsing {total} records"), total);

        match self.parse_on_pool(&records, total).await {
            Ok(summary) => summary,
            Err(e) => {
                log::warn!("Parsing in-process: {e}");
                parse_records(
                    &records,
                    self.config.fallback_parse_chunk,
                    Utc::now(),
                    |percentage| self.report_percentage(percentage, total),
                )
                .await
            }
        }
    }

    async fn parse_on_pool(
        &self,
        records: &[RawRecord],
        total: u64,
    ) -> Result<ParseSummary, WorkerError> {
        let task = self.pool.dispatch(
            WorkerTask::parse(records.to_vec()),
            self.config.worker_timeout(),
        )?;
        let task_id = task.task_id();

        match task
            .wait(|percentage| self.report_percentage(percentage, total))
            .await?
        {
            WorkerPayload::Parsed(summary) => Ok(summary),
            other => Err(WorkerError::UnexpectedPayload {
                task_id,
                kind: other.kind(),
            }),
        }
    }

    /// Re-checks coordinates of parsed points, tallying rejections.
    async fn process_coordinates(
        &self,
        points: Vec<DataPoint>,
        rejections: &mut RejectionTally,
    ) -> Vec<DataPoint> {
        let total = points.len() as u64;
        self.tracker.enter(
            StageName::ProcessingCoordinates,
            format!("Validating {total} coordinates"),
            total,
        );

        let interval = self.config.coordinate_yield_interval.max(1);
        let mut kept = Vec::with_capacity(points.len());

        for (i, point) in points.into_iter().enumerate() {
            match validate_coordinates(point.latitude, point.longitude) {
                Ok(()) => kept.push(point),
                Err(reason) => {
                    log::trace!("point {} rejected: {reason}", point.id);
                    rejections.record(reason);
                }
            }

            if (i + 1) % interval == 0 {
                self.tracker.advance((i + 1) as u64, total);
                tokio::task::yield_now().await;
            }
        }

        self.tracker.advance(total, total);
        kept
    }

    async fn apply_filters(
        &self,
        points: Vec<DataPoint>,
        filters: &QualityFilters,
    ) -> Vec<DataPoint> {
        let total = points.len() as u64;
        self.tracker.enter(
            StageName::ApplyingFilters,
            format!("Applying quality filters to {total} points"),
            total,
        );

        let interval = self.config.coordinate_yield_interval.max(1);
        let mut kept = Vec::with_capacity(points.len());

        for (i, point) in points.into_iter().enumerate() {
            if filters::passes(&point, filters) {
                kept.push(point);
            }

            if (i + 1) % interval == 0 {
                self.tracker.advance((i + 1) as u64, total);
                tokio::task::yield_now().await;
            }
        }

        self.tracker.advance(total, total);
        log::info!("Quality filters kept {} of {total} points", kept.len());
        kept
    }

    async fn decimate(
        &self,
        points: Vec<DataPoint>,
        settings: DecimationSettings,
    ) -> Result<Vec<DataPoint>, PipelineError> {
        let total = points.len() as u64;
        self.tracker.enter(
            StageName::DecimatingData,
            format!(
                "Reducing {total} points to {} ({})",
                settings.target_count, settings.algorithm
            ),
            total,
        );

        let reduced = match self.decimate_on_pool(&points, settings, total).await {
            Ok(reduced) => reduced,
            Err(e) => {
                log::warn!("Decimating in-process: {e}");
                run_decimation(points, settings.target_count, settings.algorithm).await?
            }
        };

        self.tracker.advance(total, total);
        Ok(reduced)
    }

    async fn decimate_on_pool(
        &self,
        points: &[DataPoint],
        settings: DecimationSettings,
        total: u64,
    ) -> Result<Vec<DataPoint>, WorkerError> {
        let task = self.pool.dispatch(
            WorkerTask::decimate(points.to_vec(), settings.target_count, settings.algorithm),
            self.config.worker_timeout(),
        )?;
        let task_id = task.task_id();

        match task
            .wait(|percentage| self.report_percentage(percentage, total))
            .await?
        {
            WorkerPayload::Decimated { points } => Ok(points),
            other => Err(WorkerError::UnexpectedPayload {
                task_id,
                kind: other.kind(),
            }),
        }
    }

    /// Maps a worker or parser 0–100 percentage onto the open stage.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn report_percentage(&self, percentage: f64, total: u64) {
        let fraction = (percentage / 100.0).clamp(0.0, 1.0);
        let current = (fraction * total as f64).round() as u64;
        self.tracker.advance_fraction(fraction, current, total);
    }
}

async fn wait_for_cancel(rx: &mut watch::Receiver<u64>) {
    if rx.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
}
