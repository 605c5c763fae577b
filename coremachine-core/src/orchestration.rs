use chrono::Utc;

use crate::error::MachineError;
use crate::ids::task_fingerprint;
use crate::queue::MessageQueue;
use crate::registry::JobSpec;
use crate::repo::{JobTaskRepo, NewTask};
use crate::types::{Job, StageAggregate, TaskQueueMessage};

/// Turns a JobSpec's stage plan into durable task rows and queue messages.
/// Stateless given a JobSpec; all composition patterns (single, fan-out,
/// fan-in, diamond) reduce to "how many definitions did the spec return and
/// what do their parameters reference".
#[derive(Clone)]
pub struct OrchestrationManager {
    repo: JobTaskRepo,
    fan_out_batch_threshold: usize,
}

impl OrchestrationManager {
    pub fn new(repo: JobTaskRepo, fan_out_batch_threshold: usize) -> Self {
        Self {
            repo,
            fan_out_batch_threshold,
        }
    }

    /// Ask the spec for the stage's task set and assign deterministic ids.
    /// Re-running this for the same inputs yields identical ids, which is
    /// what makes a crashed partial enqueue resumable.
    pub fn plan_stage(
        &self,
        spec: &dyn JobSpec,
        job: &Job,
        stage: u32,
        prior: Option<&StageAggregate>,
    ) -> Result<Vec<NewTask>, MachineError> {
        let definitions = spec
            .create_tasks_for_stage(stage, &job.parameters, prior)
            .map_err(|e| MachineError::Spec(e.to_string()))?;

        Ok(definitions
            .into_iter()
            .map(|def| NewTask {
                task_id: task_fingerprint(&job.job_id, stage, &def.task_index),
                parent_job_id: job.job_id.clone(),
                job_type: job.job_type.clone(),
                task_type: def.task_type,
                stage: stage as i32,
                task_index: def.task_index,
                parameters: def.parameters,
            })
            .collect())
    }

    /// Insert-if-absent the stage's task rows. Tasks already in a terminal
    /// state are untouched; rows must exist before any message referring to
    /// them is enqueued.
    pub async fn ensure_stage_tasks(&self, tasks: &[NewTask]) -> Result<(), MachineError> {
        self.repo.bulk_create_tasks(tasks).await?;
        Ok(())
    }

    /// Enqueue a message for every task of the stage still in `queued`.
    /// Returns (count, batched). At or above the threshold the whole set
    /// goes out in one batch insert; below it, individually.
    pub async fn enqueue_stage(
        &self,
        task_queue: &MessageQueue,
        job_id: &str,
        stage: i32,
    ) -> Result<(usize, bool), MachineError> {
        let pending = self.repo.queued_tasks(job_id, stage).await?;
        let messages: Vec<TaskQueueMessage> = pending
            .iter()
            .map(|task| TaskQueueMessage {
                task_id: task.task_id.clone(),
                parent_job_id: task.parent_job_id.clone(),
                job_type: task.job_type.clone(),
                task_type: task.task_type.clone(),
                stage: stage as u32,
                task_index: task.task_index.clone(),
                parameters: task.parameters.clone(),
                retry_count: task.retry_count as u32,
                timestamp: Utc::now(),
            })
            .collect();

        let batched = messages.len() >= self.fan_out_batch_threshold;
        if batched {
            task_queue.send_batch(&messages).await?;
        } else {
            for message in &messages {
                task_queue.send(message).await?;
            }
        }

        Ok((messages.len(), batched))
    }
}
