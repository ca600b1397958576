#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! CLI entry point for the species occurrence loader.
//!
//! Uses `indicatif-log-bridge` (via [`occurrence_map_cli_utils::init_logger`])
//! to route `log` output through `indicatif::MultiProgress` so that log
//! lines and the progress bar never fight for the terminal.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use occurrence_map_cli_utils::LoadProgressBar;
use occurrence_map_occurrence_models::{
    BoundingBox, DateRange, DecimationAlgorithm, DecimationSettings, LoadRequest, QualityFilters,
    TaxonReference,
};
use occurrence_map_pipeline::{AppConfig, PipelineCoordinator, PipelineError};
use occurrence_map_pipeline_models::LoadResult;
use occurrence_map_source::GbifOccurrenceApi;

#[derive(Parser)]
#[command(name = "occurrence_map", about = "Species occurrence loader")]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, validate, filter, and decimate occurrences for one species
    Load {
        /// GBIF taxon key (e.g., 2435099) or scientific name
        #[arg(long)]
        taxon: TaxonReference,
        /// First observation date (YYYY-MM-DD)
        #[arg(long)]
        from: NaiveDate,
        /// Last observation date (YYYY-MM-DD)
        #[arg(long)]
        to: NaiveDate,
        /// Maximum number of records to fetch
        #[arg(long)]
        max_points: Option<u64>,
        /// Bounding box as `minLat,maxLat,minLon,maxLon`
        #[arg(long, value_parser = parse_bbox, allow_hyphen_values = true)]
        bbox: Option<BoundingBox>,
        /// Drop points whose coordinate uncertainty exceeds this many meters
        #[arg(long)]
        min_accuracy: Option<f64>,
        /// Comma-separated issue codes to exclude (e.g., `ZERO_COORDINATE`)
        #[arg(long, value_delimiter = ',')]
        exclude_issues: Vec<String>,
        /// Decimation algorithm: random, spatial, or temporal
        #[arg(long, requires = "target_count")]
        algorithm: Option<DecimationAlgorithm>,
        /// Reduce the result to at most this many points
        #[arg(long)]
        target_count: Option<usize>,
        /// Write the full result as JSON to this file
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print the effective configuration
    Config,
}

#[allow(clippy::too_many_lines)]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let multi = occurrence_map_cli_utils::init_logger();
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Load {
            taxon,
            from,
            to,
            max_points,
            bbox,
            min_accuracy,
            exclude_issues,
            algorithm,
            target_count,
            output,
        } => {
            if from > to {
                return Err(format!("--from {from} is after --to {to}").into());
            }

            let quality_filters = QualityFilters {
                min_accuracy,
                exclude_issue_codes: (!exclude_issues.is_empty()).then_some(exclude_issues),
            };
            let request = LoadRequest {
                taxon,
                date_range: DateRange {
                    start: from,
                    end: to,
                },
                max_points,
                bounds: bbox,
                quality_filters: (!quality_filters.is_empty()).then_some(quality_filters),
                decimation: target_count.map(|target_count| DecimationSettings {
                    algorithm: algorithm.unwrap_or(DecimationAlgorithm::Spatial),
                    target_count,
                }),
            };

            let api = Arc::new(GbifOccurrenceApi::new(config.source.clone())?);
            let pool = Arc::new(config.pipeline.build_pool());
            let coordinator = Arc::new(PipelineCoordinator::new(
                api,
                pool,
                config.pipeline.clone(),
            ));

            let bar = LoadProgressBar::new(&multi, "Loading");
            let reporter = bar.clone().follow(coordinator.subscribe());

            let interrupt = tokio::spawn({
                let coordinator = Arc::clone(&coordinator);
                async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        log::warn!("Interrupted, cancelling load...");
                        coordinator.cancel();
                    }
                }
            });

            let result = coordinator.load(request).await;
            interrupt.abort();

            match result {
                Ok(result) => {
                    reporter.await.ok();
                    log_summary(&result);

                    if let Some(path) = output {
                        std::fs::write(&path, serde_json::to_string_pretty(&result)?)?;
                        log::info!("Wrote {} points to {}", result.points.len(), path.display());
                    }
                }
                Err(PipelineError::Cancelled) => {
                    reporter.abort();
                    bar.finish_and_clear();
                    return Err(PipelineError::Cancelled.into());
                }
                Err(e) => {
                    reporter.await.ok();
                    return Err(e.into());
                }
            }
        }
    }

    Ok(())
}

fn log_summary(result: &LoadResult) {
    let metadata = &result.metadata;

    log::info!(
        "Loaded {} in {:.1}s",
        result.request.taxon,
        std::time::Duration::from_millis(metadata.elapsed_ms).as_secs_f64()
    );
    log::info!("  Source records:  {}", metadata.total_source_records);
    log::info!("  Valid:           {}", metadata.valid_records);
    log::info!("  After filters:   {}", metadata.filtered_records);
    log::info!("  Returned points: {}", metadata.final_point_count);
    log::info!("  Quality:         {}", metadata.quality_rating);

    for (reason, count) in metadata.rejection_counts.iter() {
        log::info!("  Rejected ({reason}): {count}");
    }

    for timing in &metadata.stage_timings {
        log::info!(
            "  {:<24} {:>6}ms  ({} items)",
            timing.stage.as_ref(),
            timing.duration_ms.unwrap_or(0),
            timing.items_processed
        );
    }
}

/// Parses `minLat,maxLat,minLon,maxLon`.
fn parse_bbox(s: &str) -> Result<BoundingBox, String> {
    let values = s
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<f64>()
                .map_err(|e| format!("invalid coordinate {part:?}: {e}"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let [min_lat, max_lat, min_lon, max_lon] = values[..] else {
        return Err(format!(
            "expected 4 comma-separated values, got {}",
            values.len()
        ));
    };

    if !(-90.0..=90.0).contains(&min_lat) || !(-90.0..=90.0).contains(&max_lat) {
        return Err("latitudes must be within [-90, 90]".to_string());
    }
    if !(-180.0..=180.0).contains(&min_lon) || !(-180.0..=180.0).contains(&max_lon) {
        return Err("longitudes must be within [-180, 180]".to_string());
    }
    if min_lat > max_lat || min_lon > max_lon {
        return Err("minimums must not exceed maximums".to_string());
    }

    Ok(BoundingBox {
        min_lat,
        max_lat,
        min_lon,
        max_lon,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bbox() {
        let bbox = parse_bbox("10, 20.5,-30,-5").unwrap();
        assert!((bbox.max_lat - 20.5).abs() < f64::EPSILON);
        assert!((bbox.min_lon - -30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rejects_bad_bbox() {
        assert!(parse_bbox("1,2,3").is_err());
        assert!(parse_bbox("1,2,3,x").is_err());
        assert!(parse_bbox("20,10,0,1").is_err());
        assert!(parse_bbox("0,95,0,1").is_err());
    }

    #[test]
    fn parses_load_command() {
        let cli = Cli::try_parse_from([
            "occurrence_map",
            "load",
            "--taxon",
            "Puma concolor",
            "--from",
            "2020-01-01",
            "--to",
            "2020-12-31",
            "--bbox",
            "-10,10,-20,20",
            "--exclude-issues",
            "ZERO_COORDINATE,COUNTRY_MISMATCH",
            "--algorithm",
            "temporal",
            "--target-count",
            "500",
        ])
        .unwrap();

        match cli.command {
            Commands::Load {
                taxon,
                bbox,
                exclude_issues,
                algorithm,
                target_count,
                ..
            } => {
                assert_eq!(taxon, TaxonReference::Name("Puma concolor".to_string()));
                assert!((bbox.unwrap().min_lat - -10.0).abs() < f64::EPSILON);
                assert_eq!(exclude_issues, vec!["ZERO_COORDINATE", "COUNTRY_MISMATCH"]);
                assert_eq!(algorithm, Some(DecimationAlgorithm::Temporal));
                assert_eq!(target_count, Some(500));
            }
            Commands::Config => panic!("expected load"),
        }
    }

    #[test]
    fn algorithm_requires_target_count() {
        let result = Cli::try_parse_from([
            "occurrence_map",
            "load",
            "--taxon",
            "2435099",
            "--from",
            "2020-01-01",
            "--to",
            "2020-12-31",
            "--algorithm",
            "random",
        ]);
        assert!(result.is_err());
    }
}
