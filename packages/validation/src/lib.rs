#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Occurrence record validation and text sanitization.
//!
//! [`validate`] turns a [`RawRecord`] into a [`DataPoint`] or returns the
//! first [`RejectReason`] it hits. Rejections are plain values so callers
//! can skip the record, tally the reason with a [`RejectionTally`], and
//! keep going. Nothing in this crate performs I/O.

pub mod sanitize;

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike as _, NaiveDate, NaiveDateTime, Utc};
use occurrence_map_occurrence_models::{
    DEFAULT_ACCURACY_METERS, DataPoint, PointMetadata, RawRecord,
};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

pub use sanitize::{MAX_TEXT_LEN, sanitize};

/// Records dated before this year are assumed to be data-entry errors.
pub const MIN_PLAUSIBLE_YEAR: i32 = 1800;

/// Why a record was rejected.
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
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RejectReason {
    /// Latitude, longitude, or event date is missing.
    MissingField,
    /// Latitude or longitude is NaN.
    CoordinateNan,
    /// Latitude outside [-90, 90].
    LatitudeOutOfBounds,
    /// Longitude outside [-180, 180].
    LongitudeOutOfBounds,
    /// Exactly (0, 0).
    NullIslandCoordinates,
    /// Event date does not parse to a calendar date.
    InvalidDate,
    /// Event date is after the validation clock.
    FutureDate,
    /// Event date is before [`MIN_PLAUSIBLE_YEAR`].
    SuspiciouslyOldDate,
}

/// Validates a record against the current wall clock.
///
/// # Errors
///
/// Returns the first [`RejectReason`] the record fails.
pub fn validate(raw: &RawRecord) -> Result<DataPoint, RejectReason> {
    validate_at(raw, Utc::now())
}

/// Validates a record, treating `now` as the latest acceptable date.
///
/// # Errors
///
/// Returns the first [`RejectReason`] the record fails. Checks run in
/// order: field presence, coordinate sanity, null island, date parsing,
/// future dates, implausibly old dates.
pub fn validate_at(raw: &RawRecord, now: DateTime<Utc>) -> Result<DataPoint, RejectReason> {
    let (Some(latitude), Some(longitude), Some(event_date)) =
        (raw.latitude, raw.longitude, raw.event_date.as_deref())
    else {
        return Err(RejectReason::MissingField);
    };

    validate_coordinates(latitude, longitude)?;

    let date = parse_event_date(event_date).ok_or(RejectReason::InvalidDate)?;
    if date > now {
        return Err(RejectReason::FutureDate);
    }
    if date.year() < MIN_PLAUSIBLE_YEAR {
        return Err(RejectReason::SuspiciouslyOldDate);
    }

    let accuracy = raw
        .coordinate_uncertainty_in_meters
        .filter(|v| v.is_finite())
        .unwrap_or(DEFAULT_ACCURACY_METERS)
        .max(0.0);

    Ok(DataPoint {
        id: raw.id,
        latitude,
        longitude,
        date,
        accuracy,
        metadata: PointMetadata {
            scientific_name: sanitize(&raw.scientific_name),
            country_code: sanitize_optional(raw.country_code.as_deref()),
            locality: sanitize_optional(raw.locality.as_deref()),
            issues: raw.issues.clone(),
        },
    })
}

/// Checks that a coordinate pair is a plausible location.
///
/// # Errors
///
/// Returns [`RejectReason::CoordinateNan`], one of the out-of-bounds
/// reasons, or [`RejectReason::NullIslandCoordinates`].
pub fn validate_coordinates(latitude: f64, longitude: f64) -> Result<(), RejectReason> {
    if latitude.is_nan() || longitude.is_nan() {
        return Err(RejectReason::CoordinateNan);
    }
    if !(-90.0..=90.0).contains(&latitude) {
        return Err(RejectReason::LatitudeOutOfBounds);
    }
    if !(-180.0..=180.0).contains(&longitude) {
        return Err(RejectReason::LongitudeOutOfBounds);
    }
    if latitude == 0.0 && longitude == 0.0 {
        return Err(RejectReason::NullIslandCoordinates);
    }
    Ok(())
}

/// Parses an occurrence event date.
///
/// Accepts RFC 3339 timestamps, naive ISO 8601 date-times (UTC assumed),
/// plain dates, and the partial forms `YYYY-MM` and `YYYY`. For ISO
/// intervals (`start/end`) only the start is used.
#[must_use]
pub fn parse_event_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.split('/').next()?.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }

    let date = match s.len() {
        4 => NaiveDate::from_ymd_opt(s.parse().ok()?, 1, 1),
        7 => NaiveDate::parse_from_str(&format!("{s}-01"), "%Y-%m-%d").ok(),
        _ => NaiveDate::parse_from_str(s, "%Y-%m-%d").ok(),
    }?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc())
}

fn sanitize_optional(value: Option<&str>) -> Option<String> {
    value.map(sanitize).filter(|s| !s.is_empty())
}

/// Counts rejections per reason.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RejectionTally {
    counts: BTreeMap<RejectReason, u64>,
}

impl RejectionTally {
    /// Creates an empty tally.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            counts: BTreeMap::new(),
        }
    }

    /// Records one rejection.
    pub fn record(&mut self, reason: RejectReason) {
        *self.counts.entry(reason).or_insert(0) += 1;
    }

    /// Adds every count from `other` into this tally.
    pub fn merge(&mut self, other: &Self) {
        for (reason, count) in &other.counts {
            *self.counts.entry(*reason).or_insert(0) += count;
        }
    }

    /// Number of rejections recorded for `reason`.
    #[must_use]
    pub fn count(&self, reason: RejectReason) -> u64 {
        self.counts.get(&reason).copied().unwrap_or(0)
    }

    /// Total rejections across all reasons.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Returns `true` if nothing was rejected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Iterates `(reason, count)` pairs in reason order.
    pub fn iter(&self) -> impl Iterator<Item = (RejectReason, u64)> + '_ {
        self.counts.iter().map(|(r, c)| (*r, *c))
    }

    /// Logs the tally as a single aggregate line.
    pub fn log_summary(&self, label: &str) {
        if self.is_empty() {
            return;
        }
        let breakdown = self
            .iter()
            .map(|(reason, count)| format!("{reason}={count}"))
            .collect::<Vec<_>>()
            .join(", ");
        log::warn!("{label}: rejected {} records ({breakdown})", self.total());
    }
}
