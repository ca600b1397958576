//! Messages exchanged between the coordinator and pool workers.
//!
//! A worker receives exactly one [`WorkerTask`] and answers with zero or
//! more [`WorkerResult::Progress`] messages followed by exactly one
//! terminal [`WorkerResult::Complete`] or [`WorkerResult::Error`].

use occurrence_map_occurrence_models::{DataPoint, DecimationAlgorithm, RawRecord};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::parser::ParseSummary;

/// Identifies one dispatched task.
pub type TaskId = Uuid;

/// Work request sent to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerTask {
    /// Validate raw records into points.
    Parse {
        /// Task identifier.
        task_id: TaskId,
        /// Records to validate.
        raw_records: Vec<RawRecord>,
    },
    /// Reduce a point set.
    Decimate {
        /// Task identifier.
        task_id: TaskId,
        /// Points to reduce.
        points: Vec<DataPoint>,
        /// Maximum number of points to keep.
        target_count: usize,
        /// Reduction algorithm.
        algorithm: DecimationAlgorithm,
    },
}

impl WorkerTask {
    /// Creates a parse task with a fresh id.
    #[must_use]
    pub fn parse(raw_records: Vec<RawRecord>) -> Self {
        Self::Parse {
            task_id: Uuid::new_v4(),
            raw_records,
        }
    }

    /// Creates a decimation task with a fresh id.
    #[must_use]
    pub fn decimate(
        points: Vec<DataPoint>,
        target_count: usize,
        algorithm: DecimationAlgorithm,
    ) -> Self {
        Self::Decimate {
            task_id: Uuid::new_v4(),
            points,
            target_count,
            algorithm,
        }
    }

    /// The task's id.
    #[must_use]
    pub const fn task_id(&self) -> TaskId {
        match self {
            Self::Parse { task_id, .. } | Self::Decimate { task_id, .. } => *task_id,
        }
    }

    /// Short name for log messages.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Parse { .. } => "parse",
            Self::Decimate { .. } => "decimate",
        }
    }
}

/// Result carried by [`WorkerResult::Complete`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerPayload {
    /// Output of a parse task.
    Parsed(ParseSummary),
    /// Output of a decimation task.
    Decimated {
        /// Surviving points.
        points: Vec<DataPoint>,
    },
}

impl WorkerPayload {
    /// Short name for error messages.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Parsed(_) => "parsed",
            Self::Decimated { .. } => "decimated",
        }
    }
}

/// Message sent from a worker back to the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerResult {
    /// Intermediate progress, 0–100.
    Progress {
        /// Task identifier.
        task_id: TaskId,
        /// Percentage of the task completed.
        percentage: f64,
    },
    /// Terminal success.
    Complete {
        /// Task identifier.
        task_id: TaskId,
        /// Task output.
        payload: WorkerPayload,
    },
    /// Terminal failure.
    Error {
        /// Task identifier.
        task_id: TaskId,
        /// Description of the failure.
        message: String,
    },
}

impl WorkerResult {
    /// Returns `true` for [`Self::Complete`] and [`Self::Error`].
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_serializes_with_kind_tag() {
        let task = WorkerTask::decimate(vec![], 10, DecimationAlgorithm::Spatial);
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["kind"], "decimate");
        assert_eq!(json["target_count"], 10);
        assert_eq!(json["algorithm"], "spatial");
        assert_eq!(json["task_id"], task.task_id().to_string());
    }

    #[test]
    fn result_deserializes_from_kind_tag() {
        let id = Uuid::new_v4();
        let json = serde_json::json!({
            "kind": "progress",
            "task_id": id.to_string(),
            "percentage": 42.5,
        });
        let msg: WorkerResult = serde_json::from_value(json).unwrap();
        assert!(!msg.is_terminal());
        match msg {
            WorkerResult::Progress {
                task_id,
                percentage,
            } => {
                assert_eq!(task_id, id);
                assert!((percentage - 42.5).abs() < f64::EPSILON);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn error_is_terminal() {
        let msg = WorkerResult::Error {
            task_id: Uuid::new_v4(),
            message: "boom".to_string(),
        };
        assert!(msg.is_terminal());
    }

    #[test]
    fn parse_tasks_get_distinct_ids() {
        let a = WorkerTask::parse(vec![]);
        let b = WorkerTask::parse(vec![]);
        assert_ne!(a.task_id(), b.task_id());
        assert_eq!(a.kind(), "parse");
    }
}
