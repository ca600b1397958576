//! Chunked record parser shared by pool workers and the in-process
//! fallback.
//!
//! Workers run [`parse_records_blocking`] off the runtime; the fallback
//! runs [`parse_records`] on it. Both feed the same accumulator, so their
//! output cannot drift apart.

use std::ops::ControlFlow;

use chrono::{DateTime, Utc};
use occurrence_map_decimation::decimate;
use occurrence_map_occurrence_models::{
    BoundingBox, DataPoint, DecimationAlgorithm, QualityRating, RawRecord,
};
use occurrence_map_validation::{RejectionTally, validate_at};
use serde::{Deserialize, Serialize};

use crate::WorkerError;

/// Smallest chunk a worker processes between progress reports.
pub const MIN_WORKER_CHUNK: usize = 10;

/// Chunk size used by pool workers: `max(10, ⌊n / 20⌋)`, giving roughly
/// twenty progress reports per batch.
#[must_use]
pub const fn worker_chunk_size(record_count: usize) -> usize {
    let chunk = record_count / 20;
    if chunk < MIN_WORKER_CHUNK {
        MIN_WORKER_CHUNK
    } else {
        chunk
    }
}

/// Outcome of parsing one batch of raw records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseSummary {
    /// Records that passed validation, in input order.
    pub points: Vec<DataPoint>,
    /// Number of records that passed.
    pub valid_count: u64,
    /// Number of records that were rejected.
    pub invalid_count: u64,
    /// Rejections by reason.
    pub rejections: RejectionTally,
    /// Bounding box of the valid points.
    pub bounds: Option<BoundingBox>,
    /// Earliest valid observation date.
    pub earliest: Option<DateTime<Utc>>,
    /// Latest valid observation date.
    pub latest: Option<DateTime<Utc>>,
    /// `valid / (valid + invalid)`, or 0 for an empty batch.
    pub completeness: f64,
    /// Grade derived from `completeness`.
    pub quality: QualityRating,
}

/// Running totals for one batch, fed a chunk at a time.
struct ParseAccumulator {
    now: DateTime<Utc>,
    points: Vec<DataPoint>,
    rejections: RejectionTally,
    bounds: Option<BoundingBox>,
    earliest: Option<DateTime<Utc>>,
    latest: Option<DateTime<Utc>>,
}

impl ParseAccumulator {
    fn new(now: DateTime<Utc>, capacity: usize) -> Self {
        Self {
            now,
            points: Vec::with_capacity(capacity),
            rejections: RejectionTally::new(),
            bounds: None,
            earliest: None,
            latest: None,
        }
    }

    fn push_chunk(&mut self, chunk: &[RawRecord]) {
        for raw in chunk {
            match validate_at(raw, self.now) {
                Ok(point) => {
                    self.bounds = Some(BoundingBox::extend(
                        self.bounds,
                        point.latitude,
                        point.longitude,
                    ));
                    self.earliest = Some(self.earliest.map_or(point.date, |d| d.min(point.date)));
                    self.latest = Some(self.latest.map_or(point.date, |d| d.max(point.date)));
                    self.points.push(point);
                }
                Err(reason) => {
                    log::trace!("record {} rejected: {reason}", raw.id);
                    self.rejections.record(reason);
                }
            }
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn finish(self) -> ParseSummary {
        let valid_count = self.points.len() as u64;
        let invalid_count = self.rejections.total();
        let seen = valid_count + invalid_count;
        let completeness = if seen == 0 {
            0.0
        } else {
            valid_count as f64 / seen as f64
        };

        log::debug!(
            "parsed {seen} records: {valid_count} valid, {invalid_count} invalid (completeness {completeness:.3})"
        );

        ParseSummary {
            points: self.points,
            valid_count,
            invalid_count,
            rejections: self.rejections,
            bounds: self.bounds,
            earliest: self.earliest,
            latest: self.latest,
            completeness,
            quality: QualityRating::from_completeness(completeness),
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn percent(processed: usize, total: usize) -> f64 {
    processed as f64 / total as f64 * 100.0
}

/// Validates `records` in chunks of `chunk_size`, yielding to the
/// scheduler and reporting a 0–100 percentage after every chunk.
///
/// `now` is the validation clock for the whole batch.
pub async fn parse_records<F>(
    records: &[RawRecord],
    chunk_size: usize,
    now: DateTime<Utc>,
    mut on_progress: F,
) -> ParseSummary
where
    F: FnMut(f64) + Send,
{
    let mut acc = ParseAccumulator::new(now, records.len());
    let mut processed = 0usize;

    for chunk in records.chunks(chunk_size.max(1)) {
        acc.push_chunk(chunk);
        processed += chunk.len();
        on_progress(percent(processed, records.len()));
        tokio::task::yield_now().await;
    }

    acc.finish()
}

/// Blocking counterpart of [`parse_records`] for use off the async
/// runtime.
///
/// Stops early and returns `None` once `on_progress` breaks.
pub fn parse_records_blocking<F>(
    records: &[RawRecord],
    chunk_size: usize,
    now: DateTime<Utc>,
    mut on_progress: F,
) -> Option<ParseSummary>
where
    F: FnMut(f64) -> ControlFlow<()>,
{
    let mut acc = ParseAccumulator::new(now, records.len());
    let mut processed = 0usize;

    for chunk in records.chunks(chunk_size.max(1)) {
        acc.push_chunk(chunk);
        processed += chunk.len();
        if on_progress(percent(processed, records.len())).is_break() {
            log::debug!("parse abandoned after {processed} records");
            return None;
        }
    }

    Some(acc.finish())
}

/// Decimates on the blocking thread pool.
///
/// # Errors
///
/// Returns [`WorkerError::Join`] if the decimation panicked.
pub async fn run_decimation(
    points: Vec<DataPoint>,
    target_count: usize,
    algorithm: DecimationAlgorithm,
) -> Result<Vec<DataPoint>, WorkerError> {
    Ok(tokio::task::spawn_blocking(move || decimate(points, target_count, algorithm)).await?)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;
    use occurrence_map_validation::RejectReason;

    use super::*;

    fn raw(id: u64, lat: Option<f64>, lon: Option<f64>, date: &str) -> RawRecord {
        RawRecord {
            id,
            scientific_name: "Lynx rufus".to_string(),
            latitude: lat,
            longitude: lon,
            event_date: Some(date.to_string()),
            country_code: Some("US".to_string()),
            locality: None,
            coordinate_uncertainty_in_meters: Some(10.0),
            issues: vec![],
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn chunk_size_has_floor() {
        assert_eq!(worker_chunk_size(0), 10);
        assert_eq!(worker_chunk_size(150), 10);
        assert_eq!(worker_chunk_size(1_000), 50);
        assert_eq!(worker_chunk_size(10_019), 500);
    }

    #[tokio::test]
    async fn accumulates_bounds_dates_and_rejections() {
        let records = vec![
            raw(1, Some(10.0), Some(20.0), "2020-03-01"),
            raw(2, Some(-5.0), Some(40.0), "2019-07-15"),
            raw(3, Some(0.0), Some(0.0), "2020-01-01"),
            raw(4, Some(12.0), None, "2020-01-01"),
            raw(5, Some(30.0), Some(-10.0), "2023-12-31"),
        ];

        let summary = parse_records(&records, 2, now(), |_| {}).await;

        assert_eq!(summary.valid_count, 3);
        assert_eq!(summary.invalid_count, 2);
        assert_eq!(
            summary.points.iter().map(|p| p.id).collect::<Vec<_>>(),
            vec![1, 2, 5]
        );
        assert_eq!(
            summary.rejections.count(RejectReason::NullIslandCoordinates),
            1
        );
        assert_eq!(summary.rejections.count(RejectReason::MissingField), 1);

        let bounds = summary.bounds.unwrap();
        assert!((bounds.min_lat - -5.0).abs() < f64::EPSILON);
        assert!((bounds.max_lat - 30.0).abs() < f64::EPSILON);
        assert!((bounds.min_lon - -10.0).abs() < f64::EPSILON);
        assert!((bounds.max_lon - 40.0).abs() < f64::EPSILON);
        assert_eq!(
            summary.earliest.unwrap().date_naive().to_string(),
            "2019-07-15"
        );
        assert_eq!(
            summary.latest.unwrap().date_naive().to_string(),
            "2023-12-31"
        );
        assert!((summary.completeness - 0.6).abs() < 1e-9);
        assert_eq!(summary.quality, QualityRating::Fair);
    }

    #[tokio::test]
    async fn reports_progress_per_chunk() {
        let records: Vec<RawRecord> = (0..25)
            .map(|i| raw(i, Some(1.0), Some(1.0), "2020-01-01"))
            .collect();
        let mut reports = Vec::new();

        let summary = parse_records(&records, 10, now(), |pct| reports.push(pct)).await;

        assert_eq!(summary.quality, QualityRating::Excellent);
        assert_eq!(reports.len(), 3);
        assert!((reports[0] - 40.0).abs() < 1e-9);
        assert!((reports[1] - 80.0).abs() < 1e-9);
        assert!((reports[2] - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn blocking_parse_matches_async_parse() {
        let records: Vec<RawRecord> = (0..40)
            .map(|i| {
                let lat = if i % 7 == 0 { None } else { Some(1.0) };
                raw(i, lat, Some(2.0), "2021-06-01")
            })
            .collect();

        let on_runtime = parse_records(&records, 10, now(), |_| {}).await;
        let mut reports = 0;
        let blocking = parse_records_blocking(&records, 10, now(), |_| {
            reports += 1;
            ControlFlow::Continue(())
        })
        .unwrap();

        assert_eq!(blocking, on_runtime);
        assert_eq!(blocking.invalid_count, 6);
        assert_eq!(reports, 4);
    }

    #[test]
    fn blocking_parse_stops_when_told_to() {
        let records: Vec<RawRecord> = (0..100)
            .map(|i| raw(i, Some(1.0), Some(2.0), "2021-06-01"))
            .collect();
        let mut reports = Vec::new();

        let summary = parse_records_blocking(&records, 10, now(), |pct| {
            reports.push(pct);
            if pct >= 30.0 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });

        assert!(summary.is_none());
        assert_eq!(reports.len(), 3);
    }

    #[tokio::test]
    async fn decimation_runs_off_the_runtime() {
        let summary = parse_records(
            &(0..30)
                .map(|i| raw(i, Some(f64::from(u32::try_from(i).unwrap())), Some(2.0), "2021-06-01"))
                .collect::<Vec<_>>(),
            10,
            now(),
            |_| {},
        )
        .await;

        let points = run_decimation(summary.points, 7, DecimationAlgorithm::Random)
            .await
            .unwrap();
        assert_eq!(points.len(), 7);
    }

    #[tokio::test]
    async fn empty_batch_is_fair_and_silent() {
        let mut reports = 0;
        let summary = parse_records(&[], 10, now(), |_| reports += 1).await;
        assert_eq!(summary.valid_count, 0);
        assert!(summary.bounds.is_none());
        assert!(summary.completeness.abs() < f64::EPSILON);
        assert_eq!(summary.quality, QualityRating::Fair);
        assert_eq!(reports, 0);
    }
}
