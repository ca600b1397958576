#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Occurrence load pipeline.
//!
//! A [`PipelineCoordinator`] turns one [`LoadRequest`] into a
//! [`LoadResult`]: it fetches raw records through an
//! [`occurrence_map_source::OccurrenceApi`], parses them on the worker pool
//! (or in-process when the pool is busy or fails), re-validates
//! coordinates, applies quality filters, and decimates oversized results.
//! Progress is published to any number of observers while it runs.
//!
//! [`LoadRequest`]: occurrence_map_occurrence_models::LoadRequest
//! [`LoadResult`]: occurrence_map_pipeline_models::LoadResult

pub mod config;
pub mod coordinator;
mod error;
pub mod filters;
mod tracker;

pub use config::{AppConfig, ConfigError, PipelineConfig};
pub use coordinator::PipelineCoordinator;
pub use error::PipelineError;
