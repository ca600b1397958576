use occurrence_map_source::SourceError;
use occurrence_map_worker::WorkerError;

/// Errors that abort a load.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The occurrence API call failed.
    #[error("failed to fetch occurrences: {0}")]
    Fetch(#[from] SourceError),

    /// No points were left to return.
    #[error("{0}")]
    ValidationExhausted(String),

    /// A worker failure that the in-process path could not recover from.
    #[error("worker failure: {0}")]
    Worker(#[from] WorkerError),

    /// The load was cancelled before it finished.
    #[error("load cancelled")]
    Cancelled,
}
