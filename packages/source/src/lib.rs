#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Occurrence API adapter trait and the GBIF HTTP implementation.
//!
//! The loading pipeline only sees the [`OccurrenceApi`] trait: one call per
//! load that returns every raw record for a taxon, date range, and optional
//! bounding box. Pagination, retries, and HTTP details stay inside the
//! implementation.

pub mod gbif;
pub mod retry;

use async_trait::async_trait;
use occurrence_map_occurrence_models::{BoundingBox, DateRange, RawRecord, TaxonReference};

pub use gbif::{GbifOccurrenceApi, SourceConfig};

/// Errors that can occur while fetching occurrences.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON parsing failed.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// The API answered with an error status or an unusable body.
    #[error("API error: {message}")]
    Api {
        /// Description of what went wrong.
        message: String,
    },
}

/// Parameters for one occurrence fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct OccurrenceQuery {
    /// Species to fetch.
    pub taxon: TaxonReference,
    /// Observation dates to include.
    pub date_range: DateRange,
    /// Maximum number of records to return.
    pub limit: Option<u64>,
    /// Restrict results to this box.
    pub bounds: Option<BoundingBox>,
}

/// Records returned by one fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OccurrencePage {
    /// Total number of matching records the API knows about (may exceed
    /// `results.len()` when a limit applies).
    pub count: u64,
    /// The fetched records.
    pub results: Vec<RawRecord>,
}

/// A remote source of species-occurrence records.
#[async_trait]
pub trait OccurrenceApi: Send + Sync {
    /// Human-readable name of the source (e.g., `"GBIF"`).
    fn name(&self) -> &str;

    /// Fetches all records matching `query`, up to its limit.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if the request fails or the response cannot
    /// be decoded.
    async fn fetch(&self, query: &OccurrenceQuery) -> Result<OccurrencePage, SourceError>;
}
