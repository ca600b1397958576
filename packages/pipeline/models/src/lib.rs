#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Load progress, stage timing, and result types.

use chrono::{DateTime, Utc};
use occurrence_map_occurrence_models::{DataPoint, LoadRequest};
use occurrence_map_validation::RejectionTally;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

pub use occurrence_map_occurrence_models::QualityRating;

/// Stages a load passes through.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum StageName {
    Initialization,
    FetchingData,
    ParsingData,
    ProcessingCoordinates,
    ApplyingFilters,
    DecimatingData,
    Finalizing,
    Completed,
    Error,
}

impl StageName {
    /// Returns `true` for [`Self::Completed`] and [`Self::Error`].
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// Snapshot of an in-flight load, published to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    /// Current stage.
    pub stage: StageName,
    /// Overall completion, 0–100.
    pub percentage: f64,
    /// Human-readable status line.
    pub message: String,
    /// Items processed so far in the current stage.
    pub current: u64,
    /// Items the current stage will process.
    pub total: u64,
    /// Estimated time remaining.
    pub eta_ms: Option<u64>,
    /// Items processed per second across all stages.
    pub throughput: Option<f64>,
}

/// How long one stage took.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTiming {
    /// Stage this entry describes.
    pub stage: StageName,
    /// Wall-clock time the stage was entered.
    pub started_at: DateTime<Utc>,
    /// Milliseconds between the start of the load and entry to this stage.
    pub offset_ms: u64,
    /// Filled when the stage ends.
    pub duration_ms: Option<u64>,
    /// Items the stage reported as processed when it closed.
    pub items_processed: u64,
}

impl StageTiming {
    /// Returns `true` once the stage has been closed.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.duration_ms.is_some()
    }
}

/// Summary statistics of a finished load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadMetadata {
    /// Records returned by the occurrence API.
    pub total_source_records: u64,
    /// Records that passed validation.
    pub valid_records: u64,
    /// Points left after quality filters.
    pub filtered_records: u64,
    /// Points in the result.
    pub final_point_count: u64,
    /// Wall-clock duration of the whole load.
    pub elapsed_ms: u64,
    /// Grade from `valid_records / total_source_records`.
    pub quality_rating: QualityRating,
    /// One entry per stage entered, in order.
    pub stage_timings: Vec<StageTiming>,
    /// Rejections from parsing and coordinate re-validation combined.
    pub rejection_counts: RejectionTally,
}

/// Output of a successful load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadResult {
    /// The request that produced this result.
    pub request: LoadRequest,
    /// Surviving points, in source order unless decimation reordered them.
    pub points: Vec<DataPoint>,
    /// Counts, timings, and quality grade.
    pub metadata: LoadMetadata,
}
