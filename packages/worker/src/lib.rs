#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Background worker pool for CPU-heavy parse and decimation work.
//!
//! The pool owns a fixed number of workers. [`WorkerPool::dispatch`] hands a
//! [`WorkerTask`] to the first idle worker or fails immediately with
//! [`WorkerError::NoAvailableWorker`]; there is no queue, so callers are
//! expected to fall back to running the same [`parser`] logic themselves.
//! Workers talk back exclusively through [`WorkerResult`] messages.

pub mod parser;
pub mod pool;
pub mod protocol;

pub use parser::{
    ParseSummary, parse_records, parse_records_blocking, run_decimation, worker_chunk_size,
};
pub use pool::{DEFAULT_TASK_TIMEOUT, DispatchedTask, MAX_POOL_SIZE, MIN_POOL_SIZE, WorkerPool};
pub use protocol::{TaskId, WorkerPayload, WorkerResult, WorkerTask};

/// Errors surfaced by the worker pool.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Every worker is busy.
    #[error("no available worker")]
    NoAvailableWorker,

    /// The task did not finish before its deadline.
    #[error("worker task {task_id} timed out after {timeout_ms}ms")]
    Timeout {
        /// Task that timed out.
        task_id: TaskId,
        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    /// The worker reported a failure.
    #[error("worker task {task_id} failed: {message}")]
    Task {
        /// Task that failed.
        task_id: TaskId,
        /// Worker-supplied description.
        message: String,
    },

    /// The worker was terminated before it produced a result.
    #[error("worker task {task_id} was cancelled")]
    Cancelled {
        /// Task that was cancelled.
        task_id: TaskId,
    },

    /// The worker completed with a payload of the wrong kind.
    #[error("worker task {task_id} returned an unexpected {kind} payload")]
    UnexpectedPayload {
        /// Task that answered.
        task_id: TaskId,
        /// Kind of payload that arrived.
        kind: &'static str,
    },

    /// Blocking work panicked or was torn down with the runtime.
    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}
