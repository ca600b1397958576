#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Occurrence record, data point, and load request types.
//!
//! A [`RawRecord`] is one species observation exactly as the remote
//! biodiversity API returns it. The validator turns it into a
//! [`DataPoint`], which is what every later pipeline stage works with.
//! [`LoadRequest`] describes one call into the loading pipeline.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Accuracy (in meters) assigned to records that carry no coordinate
/// uncertainty.
pub const DEFAULT_ACCURACY_METERS: f64 = 1000.0;

/// One occurrence record as returned by the occurrence API.
///
/// Field names follow the GBIF occurrence JSON shape. Everything except the
/// id and scientific name may be missing in the source data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRecord {
    /// Numeric occurrence key.
    #[serde(rename = "key")]
    pub id: u64,
    /// Scientific name as recorded by the publisher.
    #[serde(default)]
    pub scientific_name: String,
    /// Latitude (WGS84).
    #[serde(rename = "decimalLatitude", default)]
    pub latitude: Option<f64>,
    /// Longitude (WGS84).
    #[serde(rename = "decimalLongitude", default)]
    pub longitude: Option<f64>,
    /// Event date string (ISO 8601, possibly partial or an interval).
    #[serde(default)]
    pub event_date: Option<String>,
    /// ISO 3166-1 alpha-2 country code.
    #[serde(default)]
    pub country_code: Option<String>,
    /// Free-text locality description.
    #[serde(default)]
    pub locality: Option<String>,
    /// Radius in meters within which the true location lies.
    #[serde(default)]
    pub coordinate_uncertainty_in_meters: Option<f64>,
    /// Data-quality issue codes flagged by the API.
    #[serde(default)]
    pub issues: Vec<String>,
}

/// Descriptive fields carried along with a [`DataPoint`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointMetadata {
    /// Sanitized scientific name.
    pub scientific_name: String,
    /// Sanitized country code.
    pub country_code: Option<String>,
    /// Sanitized locality.
    pub locality: Option<String>,
    /// Issue codes copied from the raw record.
    pub issues: Vec<String>,
}

/// A validated geographic point.
///
/// Coordinates are always finite and in range, and `accuracy` is never
/// negative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPoint {
    /// Occurrence key from the source record.
    pub id: u64,
    /// Latitude (WGS84).
    pub latitude: f64,
    /// Longitude (WGS84).
    pub longitude: f64,
    /// When the observation was made.
    pub date: DateTime<Utc>,
    /// Coordinate uncertainty in meters. Lower is better.
    pub accuracy: f64,
    /// Descriptive metadata.
    pub metadata: PointMetadata,
}

impl DataPoint {
    /// Returns `true` if the point carries the given issue code.
    #[must_use]
    pub fn has_issue(&self, code: &str) -> bool {
        self.metadata.issues.iter().any(|issue| issue == code)
    }
}

/// Inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    /// First day included.
    pub start: NaiveDate,
    /// Last day included.
    pub end: NaiveDate,
}

/// Geographic bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundingBox {
    /// Southern edge.
    pub min_lat: f64,
    /// Northern edge.
    pub max_lat: f64,
    /// Western edge.
    pub min_lon: f64,
    /// Eastern edge.
    pub max_lon: f64,
}

impl BoundingBox {
    /// Grows the box to include the coordinate, or creates one around it.
    #[must_use]
    pub fn extend(current: Option<Self>, latitude: f64, longitude: f64) -> Self {
        match current {
            None => Self {
                min_lat: latitude,
                max_lat: latitude,
                min_lon: longitude,
                max_lon: longitude,
            },
            Some(b) => Self {
                min_lat: b.min_lat.min(latitude),
                max_lat: b.max_lat.max(latitude),
                min_lon: b.min_lon.min(longitude),
                max_lon: b.max_lon.max(longitude),
            },
        }
    }
}

/// Optional data-quality filters applied after coordinate validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityFilters {
    /// Drop points whose accuracy (meters) is worse than this.
    pub min_accuracy: Option<f64>,
    /// Drop points carrying any of these issue codes.
    pub exclude_issue_codes: Option<Vec<String>>,
}

impl QualityFilters {
    /// Returns `true` if no filter is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.min_accuracy.is_none()
            && self
                .exclude_issue_codes
                .as_ref()
                .is_none_or(Vec::is_empty)
    }
}

/// Point-reduction strategy.
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
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DecimationAlgorithm {
    /// Shuffle and truncate.
    Random,
    /// Keep the most accurate points of each grid cell.
    Spatial,
    /// Sample evenly along the date axis.
    Temporal,
}

/// How to reduce an oversized result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecimationSettings {
    /// Which reduction algorithm to use.
    pub algorithm: DecimationAlgorithm,
    /// Maximum number of points to keep.
    pub target_count: usize,
}

/// Coarse data-quality grade for a load.
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
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum QualityRating {
    /// Most records survived validation.
    Excellent,
    /// A clear majority survived.
    Good,
    /// Everything else.
    Fair,
}

impl QualityRating {
    /// Grades a parse completeness ratio `valid / (valid + invalid)`:
    /// at least 0.9 is excellent, at least 0.7 is good.
    #[must_use]
    pub fn from_completeness(ratio: f64) -> Self {
        if ratio >= 0.9 {
            Self::Excellent
        } else if ratio >= 0.7 {
            Self::Good
        } else {
            Self::Fair
        }
    }

    /// Grades the share of source records that became valid points:
    /// above 0.8 is excellent, above 0.6 is good.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_valid_ratio(valid: u64, total: u64) -> Self {
        if total == 0 {
            return Self::Fair;
        }
        let ratio = valid as f64 / total as f64;
        if ratio > 0.8 {
            Self::Excellent
        } else if ratio > 0.6 {
            Self::Good
        } else {
            Self::Fair
        }
    }
}

/// Taxon identifier passed to the occurrence API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum TaxonReference {
    /// Numeric backbone taxon key.
    Key(u64),
    /// Scientific name, matched by the API.
    Name(String),
}

impl std::str::FromStr for TaxonReference {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Ok(trimmed
            .parse::<u64>()
            .map_or_else(|_| Self::Name(trimmed.to_string()), Self::Key))
    }
}

impl std::fmt::Display for TaxonReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Key(key) => write!(f, "taxon {key}"),
            Self::Name(name) => write!(f, "{name}"),
        }
    }
}

/// One call into the loading pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadRequest {
    /// Species to load.
    pub taxon: TaxonReference,
    /// Observation dates to include.
    pub date_range: DateRange,
    /// Upper bound on records fetched from the API.
    pub max_points: Option<u64>,
    /// Restrict the fetch to this box.
    pub bounds: Option<BoundingBox>,
    /// Post-validation quality filters.
    pub quality_filters: Option<QualityFilters>,
    /// Reduction applied when the filtered set is too large.
    pub decimation: Option<DecimationSettings>,
}
