//! GBIF occurrence-search adapter.
//!
//! Pages through `{api_url}/occurrence/search` with offset pagination
//! until the API reports `endOfRecords`, a page comes back empty, or the
//! record limit is reached.

use std::time::Duration;

use async_trait::async_trait;
use occurrence_map_occurrence_models::{RawRecord, TaxonReference};
use serde::{Deserialize, Serialize};

use crate::retry::{self, RetryPolicy};
use crate::{OccurrenceApi, OccurrencePage, OccurrenceQuery, SourceError};

/// Largest page the GBIF search endpoint serves.
pub const MAX_PAGE_SIZE: u64 = 300;

/// Connection settings for [`GbifOccurrenceApi`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// API base URL, without the `/occurrence/search` suffix.
    pub api_url: String,
    /// Records per request (capped at [`MAX_PAGE_SIZE`]).
    pub page_size: u64,
    /// Record limit when the query carries none.
    pub default_limit: u64,
    /// Per-request timeout.
    pub request_timeout_secs: u64,
    /// Retry behavior for transient failures.
    pub retry: RetryPolicy,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.gbif.org/v1".to_string(),
            page_size: MAX_PAGE_SIZE,
            default_limit: 5_000,
            request_timeout_secs: 120,
            retry: RetryPolicy::default(),
        }
    }
}

/// One page of the GBIF search response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    #[serde(default)]
    count: u64,
    #[serde(default)]
    end_of_records: bool,
    #[serde(default)]
    results: Vec<RawRecord>,
}

/// [`OccurrenceApi`] backed by the public GBIF REST API.
pub struct GbifOccurrenceApi {
    client: reqwest::Client,
    config: SourceConfig,
}

impl GbifOccurrenceApi {
    /// Builds an adapter with its own HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Http`] if the HTTP client cannot be built.
    pub fn new(config: SourceConfig) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("occurrence_map/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self { client, config })
    }

    /// The adapter's configuration.
    #[must_use]
    pub const fn config(&self) -> &SourceConfig {
        &self.config
    }

    fn search_url(&self) -> String {
        format!(
            "{}/occurrence/search",
            self.config.api_url.trim_end_matches('/')
        )
    }
}

/// Query parameters for the page starting at `offset`.
fn search_params(query: &OccurrenceQuery, offset: u64, limit: u64) -> Vec<(&'static str, String)> {
    let mut params = Vec::with_capacity(8);

    match &query.taxon {
        TaxonReference::Key(key) => params.push(("taxonKey", key.to_string())),
        TaxonReference::Name(name) => params.push(("scientificName", name.clone())),
    }

    params.push((
        "eventDate",
        format!("{},{}", query.date_range.start, query.date_range.end),
    ));

    if let Some(bounds) = &query.bounds {
        params.push((
            "decimalLatitude",
            format!("{},{}", bounds.min_lat, bounds.max_lat),
        ));
        params.push((
            "decimalLongitude",
            format!("{},{}", bounds.min_lon, bounds.max_lon),
        ));
    }

    params.push(("hasCoordinate", "true".to_string()));
    params.push(("offset", offset.to_string()));
    params.push(("limit", limit.to_string()));

    params
}

#[async_trait]
impl OccurrenceApi for GbifOccurrenceApi {
    fn name(&self) -> &str {
        "GBIF"
    }

    async fn fetch(&self, query: &OccurrenceQuery) -> Result<OccurrencePage, SourceError> {
        let url = self.search_url();
        let limit = query.limit.unwrap_or(self.config.default_limit);
        let page_size = self.config.page_size.clamp(1, MAX_PAGE_SIZE);

        log::info!(
            "[GBIF] Fetching occurrences for {} ({} to {}, limit {limit})",
            query.taxon,
            query.date_range.start,
            query.date_range.end,
        );

        let mut results: Vec<RawRecord> = Vec::new();
        let mut count = 0u64;
        let mut offset = 0u64;

        while offset < limit {
            let page_limit = page_size.min(limit - offset);
            let params = search_params(query, offset, page_limit);

            let body = retry::send_json(&self.config.retry, || {
                self.client.get(&url).query(&params)
            })
            .await?;
            let page: SearchResponse = serde_json::from_value(body)?;

            let received = page.results.len() as u64;
            count = page.count;
            results.extend(page.results);
            offset += received;

            log::debug!(
                "[GBIF] offset {offset}: {received} records (total: {}, available: {count})",
                results.len()
            );

            if page.end_of_records || received == 0 {
                break;
            }
        }

        results.truncate(usize::try_from(limit).unwrap_or(usize::MAX));

        log::info!(
            "[GBIF] Fetched {} of {count} matching records",
            results.len()
        );

        Ok(OccurrencePage { count, results })
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use occurrence_map_occurrence_models::{BoundingBox, DateRange};

    use super::*;

    fn query(taxon: TaxonReference, bounds: Option<BoundingBox>) -> OccurrenceQuery {
        OccurrenceQuery {
            taxon,
            date_range: DateRange {
                start: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
                end: NaiveDate::from_ymd_opt(2023, 12, 31).unwrap(),
            },
            limit: Some(1_000),
            bounds,
        }
    }

    fn param<'a>(params: &'a [(&'static str, String)], key: &str) -> Option<&'a str> {
        params
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn numeric_taxon_uses_taxon_key() {
        let params = search_params(&query(TaxonReference::Key(2_435_099), None), 300, 200);
        assert_eq!(param(&params, "taxonKey"), Some("2435099"));
        assert_eq!(param(&params, "scientificName"), None);
        assert_eq!(param(&params, "eventDate"), Some("2020-01-01,2023-12-31"));
        assert_eq!(param(&params, "hasCoordinate"), Some("true"));
        assert_eq!(param(&params, "offset"), Some("300"));
        assert_eq!(param(&params, "limit"), Some("200"));
        assert_eq!(param(&params, "decimalLatitude"), None);
    }

    #[test]
    fn named_taxon_and_bounds() {
        let bounds = BoundingBox {
            min_lat: 10.0,
            max_lat: 20.5,
            min_lon: -30.0,
            max_lon: -5.0,
        };
        let params = search_params(
            &query(TaxonReference::Name("Puma concolor".to_string()), Some(bounds)),
            0,
            300,
        );
        assert_eq!(param(&params, "scientificName"), Some("Puma concolor"));
        assert_eq!(param(&params, "taxonKey"), None);
        assert_eq!(param(&params, "decimalLatitude"), Some("10,20.5"));
        assert_eq!(param(&params, "decimalLongitude"), Some("-30,-5"));
    }

    #[test]
    fn deserializes_search_response() {
        let body = serde_json::json!({
            "offset": 0,
            "limit": 2,
            "endOfRecords": false,
            "count": 8123,
            "results": [
                {
                    "key": 4011,
                    "scientificName": "Puma concolor (Linnaeus, 1771)",
                    "decimalLatitude": 34.1,
                    "decimalLongitude": -118.3,
                    "eventDate": "2021-06-01T10:00:00",
                    "countryCode": "US",
                    "coordinateUncertaintyInMeters": 25.0,
                    "issues": ["COORDINATE_ROUNDED"]
                },
                {
                    "key": 4012,
                    "scientificName": "Puma concolor (Linnaeus, 1771)"
                }
            ]
        });

        let page: SearchResponse = serde_json::from_value(body).unwrap();
        assert_eq!(page.count, 8123);
        assert!(!page.end_of_records);
        assert_eq!(page.results.len(), 2);
        assert_eq!(page.results[0].id, 4011);
        assert_eq!(page.results[0].issues, vec!["COORDINATE_ROUNDED"]);
        assert!(page.results[1].latitude.is_none());
    }

    #[test]
    fn search_url_tolerates_trailing_slash() {
        let api = GbifOccurrenceApi::new(SourceConfig {
            api_url: "https://example.org/v1/".to_string(),
            ..SourceConfig::default()
        })
        .unwrap();
        assert_eq!(api.search_url(), "https://example.org/v1/occurrence/search");
        assert_eq!(api.name(), "GBIF");
    }

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config: SourceConfig =
            serde_json::from_value(serde_json::json!({ "page_size": 100 })).unwrap();
        assert_eq!(config.page_size, 100);
        assert_eq!(config.default_limit, 5_000);
        assert_eq!(config.api_url, "https://api.gbif.org/v1");
    }
}
