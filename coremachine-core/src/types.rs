use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Enumeration of possible statuses for a Job.
///
/// Transitions are monotone: queued -> processing -> one of the terminal
/// states. `CompletedWithErrors` is terminal success with at least one failed
/// task, surfaced verbatim to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::CompletedWithErrors | JobStatus::Failed
        )
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "completed_with_errors" => Ok(JobStatus::CompletedWithErrors),
            "failed" => Ok(JobStatus::Failed),
            invalid => Err(format!("{} is not a valid JobStatus", invalid)),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::CompletedWithErrors => write!(f, "completed_with_errors"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Enumeration of possible statuses for a Task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "task_status", rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TaskStatus::Queued => write!(f, "queued"),
            TaskStatus::Processing => write!(f, "processing"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A Job row: the top-level unit of work, owned by the durable store.
/// In-memory values are short-lived views read once per operation.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    /// 64-hex fingerprint of (job_type, canonical params); the idempotency key.
    pub job_id: String,
    pub job_type: String,
    pub status: JobStatus,
    /// Current 1-indexed stage number.
    pub stage: i32,
    pub total_stages: i32,
    pub parameters: Value,
    /// Mapping of stage number (as string key) to that stage's aggregate.
    pub stage_results: Value,
    pub result_data: Option<Value>,
    pub metadata: Option<Value>,
    pub error_details: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// The aggregate recorded for a given stage, if that stage has completed.
    pub fn stage_result(&self, stage: i32) -> Option<&Value> {
        self.stage_results.get(stage.to_string())
    }
}

/// A Task row: the smallest dispatchable unit, running one handler.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Task {
    /// Deterministic fingerprint of (job_id, stage, task_index).
    pub task_id: String,
    pub parent_job_id: String,
    pub job_type: String,
    pub task_type: String,
    pub stage: i32,
    /// Stable index within the stage, e.g. "chunk_17".
    pub task_index: String,
    pub status: TaskStatus,
    pub parameters: Value,
    pub result_data: Option<Value>,
    pub retry_count: i32,
    pub error_details: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What a JobSpec proposes for one task of a stage. The orchestration layer
/// turns definitions into rows with deterministic ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDefinition {
    pub task_type: String,
    pub task_index: String,
    pub parameters: Value,
}

impl TaskDefinition {
    pub fn new(task_type: &str, task_index: impl Into<String>, parameters: Value) -> Self {
        Self {
            task_type: task_type.to_owned(),
            task_index: task_index.into(),
            parameters,
        }
    }
}

/// The per-stage aggregate written by the last task's completion transaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StageAggregate {
    /// task_index -> result_data (null for failed tasks).
    pub results: serde_json::Map<String, Value>,
    pub completed: u32,
    pub failed: u32,
}

impl StageAggregate {
    pub fn total(&self) -> u32 {
        self.completed + self.failed
    }
}

/// Wire format of a message on the job queue. One message drives the planning
/// and enqueue of one stage of one job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobQueueMessage {
    pub job_id: String,
    pub job_type: String,
    pub stage: u32,
    pub parameters: Value,
    pub correlation_id: String,
}

/// Wire format of a message on the task queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskQueueMessage {
    pub task_id: String,
    pub parent_job_id: String,
    pub job_type: String,
    pub task_type: String,
    pub stage: u32,
    pub task_index: String,
    pub parameters: Value,
    /// Mirror of the queue's attempt bookkeeping, for observability. The
    /// queue table's attempt column is authoritative.
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_status_round_trip() {
        for status in [
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::CompletedWithErrors,
            JobStatus::Failed,
        ] {
            let parsed: JobStatus = status.to_string().parse().expect("failed to parse");
            assert_eq!(parsed, status);
        }
        assert!("cancelled".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::CompletedWithErrors.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
    }

    #[test]
    fn test_queue_message_round_trip() {
        let message = JobQueueMessage {
            job_id: "a".repeat(64),
            job_type: "hello_world".to_owned(),
            stage: 2,
            parameters: json!({"n": 3}),
            correlation_id: "corr-1".to_owned(),
        };
        let encoded = serde_json::to_value(&message).expect("failed to encode");
        let decoded: JobQueueMessage =
            serde_json::from_value(encoded).expect("failed to decode");
        assert_eq!(decoded, message);

        let message = TaskQueueMessage {
            task_id: "b".repeat(64),
            parent_job_id: "a".repeat(64),
            job_type: "hello_world".to_owned(),
            task_type: "greet".to_owned(),
            stage: 1,
            task_index: "0".to_owned(),
            parameters: json!({"k": 0}),
            retry_count: 0,
            timestamp: Utc::now(),
        };
        let encoded = serde_json::to_value(&message).expect("failed to encode");
        let decoded: TaskQueueMessage =
            serde_json::from_value(encoded).expect("failed to decode");
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_stage_result_lookup() {
        let job = Job {
            job_id: "a".repeat(64),
            job_type: "hello_world".to_owned(),
            status: JobStatus::Processing,
            stage: 2,
            total_stages: 2,
            parameters: json!({}),
            stage_results: json!({"1": {"completed": 3, "failed": 0, "results": {}}}),
            result_data: None,
            metadata: None,
            error_details: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(job.stage_result(1).is_some());
        assert!(job.stage_result(2).is_none());
    }
}
