//! The dispatch kernel: consumes job-queue and task-queue messages, drives
//! the state machine, invokes handlers and queues successors.
//!
//! Each `process_*` call settles at most one delivery, so the worker loops
//! stay trivial and the tests can pump messages deterministically. All
//! message handling is idempotent under at-least-once delivery; the lease is
//! settled exactly once per delivery.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::config::CoreConfig;
use crate::error::{ErrorKind, MachineError, QueueError};
use crate::queue::{Delivery, MessageQueue};
use crate::registry::{HandlerFailure, HandlerRegistry};
use crate::repo::JobTaskRepo;
use crate::state::{AdvanceOutcome, CompletionOutcome, StateManager};
use crate::types::{
    Job, JobQueueMessage, StageAggregate, TaskQueueMessage, TaskStatus,
};
use crate::orchestration::OrchestrationManager;
use crate::BLOB_REF_KEY;

const DB_RETRY_ATTEMPTS: u32 = 3;

/// How a handled message settles its lease.
#[derive(Debug)]
enum Disposition {
    Complete,
    DeadLetter { kind: ErrorKind, error: String },
    Abandon,
}

pub struct CoreMachine {
    repo: JobTaskRepo,
    state: StateManager,
    registry: Arc<HandlerRegistry>,
    orchestration: OrchestrationManager,
    job_queue: MessageQueue,
    task_queue: MessageQueue,
    blobs: Arc<dyn BlobStore>,
    config: CoreConfig,
}

impl CoreMachine {
    pub fn new(
        repo: JobTaskRepo,
        state: StateManager,
        registry: Arc<HandlerRegistry>,
        job_queue: MessageQueue,
        task_queue: MessageQueue,
        blobs: Arc<dyn BlobStore>,
        config: CoreConfig,
    ) -> Self {
        let orchestration =
            OrchestrationManager::new(repo.clone(), config.fan_out_batch_threshold);
        Self {
            repo,
            state,
            registry,
            orchestration,
            job_queue,
            task_queue,
            blobs,
            config,
        }
    }

    pub fn repo(&self) -> &JobTaskRepo {
        &self.repo
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn job_queue(&self) -> &MessageQueue {
        &self.job_queue
    }

    pub fn task_queue(&self) -> &MessageQueue {
        &self.task_queue
    }

    /// Direct submission: validate, create the job row if absent and enqueue
    /// the initial stage message in the same transaction. Identical
    /// submissions are idempotent; the second caller gets the existing row
    /// back with `already_exists = true`.
    pub async fn submit(
        &self,
        job_type: &str,
        parameters: &Value,
    ) -> Result<(Job, bool), MachineError> {
        let spec = self
            .registry
            .job_spec(job_type)
            .ok_or_else(|| MachineError::Spec(format!("unknown job type {}", job_type)))?;

        spec.validate_parameters(parameters)
            .map_err(|e| MachineError::Spec(e.to_string()))?;

        let job_id = crate::ids::job_fingerprint(job_type, parameters);

        let mut tx = self
            .repo
            .pool()
            .begin()
            .await
            .map_err(MachineError::Database)?;

        let inserted = self
            .repo
            .create_job_in(
                &mut *tx,
                &job_id,
                job_type,
                spec.total_stages() as i32,
                parameters,
                None,
            )
            .await?;

        if inserted {
            let message = JobQueueMessage {
                job_id: job_id.clone(),
                job_type: job_type.to_owned(),
                stage: 1,
                parameters: parameters.clone(),
                correlation_id: Uuid::now_v7().to_string(),
            };
            self.job_queue.send_in(&mut *tx, &message).await?;
        }

        tx.commit().await.map_err(MachineError::Database)?;

        let job = self
            .repo
            .get_job(&job_id)
            .await?
            .ok_or_else(|| MachineError::Spec(format!("job {} vanished after submit", job_id)))?;

        metrics::counter!(
            "coremachine_jobs_submitted_total",
            &[("job_type", job_type.to_owned())]
        )
        .increment(1);

        Ok((job, !inserted))
    }

    /// Consume at most one job-queue message. Returns false when the queue
    /// had nothing visible.
    pub async fn process_job_queue(&self) -> Result<bool, MachineError> {
        let Some(delivery) = self.job_queue.receive().await? else {
            return Ok(false);
        };

        let message: JobQueueMessage = match delivery.parse() {
            Ok(message) => message,
            Err(e) => {
                warn!("poison job message {}: {}", delivery.id, e);
                self.job_queue
                    .dead_letter(delivery, ErrorKind::Poison, &e.to_string())
                    .await?;
                return Ok(true);
            }
        };

        let disposition = self
            .with_transient_retry(|| self.handle_job_message(&message))
            .await;

        self.settle(&self.job_queue, delivery, disposition, "job")
            .await?;
        Ok(true)
    }

    /// Consume at most one task-queue message.
    pub async fn process_task_queue(&self) -> Result<bool, MachineError> {
        let Some(delivery) = self.task_queue.receive().await? else {
            return Ok(false);
        };

        let message: TaskQueueMessage = match delivery.parse() {
            Ok(message) => message,
            Err(e) => {
                warn!("poison task message {}: {}", delivery.id, e);
                self.task_queue
                    .dead_letter(delivery, ErrorKind::Poison, &e.to_string())
                    .await?;
                return Ok(true);
            }
        };

        let disposition = self
            .with_transient_retry(|| self.handle_task_message(&message))
            .await;

        self.settle(&self.task_queue, delivery, disposition, "task")
            .await?;
        Ok(true)
    }

    /// The job-message loop body: plan the stage, materialize task rows,
    /// then enqueue. Messages for stages the job has moved past are
    /// duplicates and settle cleanly.
    async fn handle_job_message(
        &self,
        message: &JobQueueMessage,
    ) -> Result<Disposition, MachineError> {
        let stage = message.stage as i32;

        let Some(job) = self.repo.get_job(&message.job_id).await? else {
            return Ok(Disposition::DeadLetter {
                kind: ErrorKind::ResourceMissing,
                error: format!("job not found: {}", message.job_id),
            });
        };

        if job.status.is_terminal() {
            debug!("job {} already terminal, dropping stage message", job.job_id);
            return Ok(Disposition::Complete);
        }

        if job.stage != stage {
            // Past stages are duplicate deliveries; future stages can only
            // come from a bug upstream. Either way the row is authoritative.
            debug!(
                "job {} at stage {}, dropping message for stage {}",
                job.job_id, job.stage, stage
            );
            return Ok(Disposition::Complete);
        }

        let Some(spec) = self.registry.job_spec(&job.job_type) else {
            return Ok(Disposition::DeadLetter {
                kind: ErrorKind::UnknownHandler,
                error: format!("no job spec registered for {}", job.job_type),
            });
        };

        let prior = match prior_aggregate(&job, stage) {
            Ok(prior) => prior,
            Err(e) => {
                return Ok(Disposition::DeadLetter {
                    kind: ErrorKind::Poison,
                    error: format!("corrupt stage_results on job {}: {}", job.job_id, e),
                })
            }
        };

        let tasks = match self
            .orchestration
            .plan_stage(spec.as_ref(), &job, message.stage, prior.as_ref())
        {
            Ok(tasks) => tasks,
            Err(e) => {
                return Ok(Disposition::DeadLetter {
                    kind: ErrorKind::HandlerError,
                    error: format!("stage planning failed: {}", e),
                })
            }
        };

        if stage == 1 {
            self.state.mark_job_processing(&job.job_id).await?;
        }

        if tasks.is_empty() {
            // An empty stage is instantly complete: record an empty
            // aggregate and advance without any task ever existing.
            let mut tx = self
                .repo
                .pool()
                .begin()
                .await
                .map_err(MachineError::Database)?;
            self.state
                .record_stage_aggregate_in(&mut tx, &job.job_id, stage, &StageAggregate::default())
                .await?;
            let outcome = self
                .state
                .advance_stage_in(&mut tx, &job.job_id, stage, spec.as_ref())
                .await?;
            if let AdvanceOutcome::Advanced { next_stage } = &outcome {
                let successor = JobQueueMessage {
                    job_id: job.job_id.clone(),
                    job_type: job.job_type.clone(),
                    stage: *next_stage as u32,
                    parameters: job.parameters.clone(),
                    correlation_id: message.correlation_id.clone(),
                };
                self.job_queue.send_in(&mut *tx, &successor).await?;
            }
            tx.commit().await.map_err(MachineError::Database)?;

            if let AdvanceOutcome::Terminal { status, .. } = outcome {
                self.publish_completion(&job.job_id, &job.job_type, status.to_string());
            }
            return Ok(Disposition::Complete);
        }

        // Rows must exist before any message referring to them; a crash
        // in between is healed by redelivery since both steps are idempotent.
        self.orchestration.ensure_stage_tasks(&tasks).await?;

        let (count, batched) = self
            .orchestration
            .enqueue_stage(&self.task_queue, &job.job_id, stage)
            .await?;

        info!(
            "enqueued {} tasks for job {} stage {} (batched: {})",
            count, job.job_id, stage, batched
        );
        metrics::counter!(
            "coremachine_tasks_enqueued_total",
            &[("job_type", job.job_type.clone())]
        )
        .increment(count as u64);

        Ok(Disposition::Complete)
    }

    /// The task-message loop body: claim, run the handler, record the
    /// completion and, when nominated, drive advancement.
    async fn handle_task_message(
        &self,
        message: &TaskQueueMessage,
    ) -> Result<Disposition, MachineError> {
        let Some(task) = self.repo.get_task(&message.task_id).await? else {
            return Ok(Disposition::DeadLetter {
                kind: ErrorKind::ResourceMissing,
                error: format!("task not found: {}", message.task_id),
            });
        };

        let Some(job) = self.repo.get_job(&task.parent_job_id).await? else {
            return Ok(Disposition::DeadLetter {
                kind: ErrorKind::ResourceMissing,
                error: format!("job not found: {}", task.parent_job_id),
            });
        };

        if !self.repo.mark_task_processing(&task.task_id).await? {
            // Already processing (expired lease, original still running) or
            // terminal (duplicate). Either way this delivery is settled.
            debug!("task {} not claimable, duplicate delivery", task.task_id);
            return Ok(Disposition::Complete);
        }

        // Cooperative cancellation: never start a handler under a terminal
        // parent. In-flight handlers are not interrupted.
        if job.status.is_terminal() {
            let error = json!({
                "error_kind": ErrorKind::ParentCancelled.as_str(),
                "message": format!("parent job is {}", job.status),
            });
            self.finish_task(&job, &task.task_id, task.stage, TaskStatus::Failed, None, Some(&error))
                .await?;
            return Ok(Disposition::Complete);
        }

        let Some(handler) = self.registry.handler(&task.task_type) else {
            let error = json!({
                "error_kind": ErrorKind::UnknownHandler.as_str(),
                "message": format!("no handler registered for {}", task.task_type),
            });
            self.finish_task(&job, &task.task_id, task.stage, TaskStatus::Failed, None, Some(&error))
                .await?;
            return Ok(Disposition::DeadLetter {
                kind: ErrorKind::UnknownHandler,
                error: format!("no handler registered for {}", task.task_type),
            });
        };

        let started = tokio::time::Instant::now();
        let result = handler.execute(&task.parameters).await;
        let elapsed = started.elapsed().as_secs_f64();

        let labels = [("task_type", task.task_type.clone())];
        metrics::histogram!("coremachine_handler_duration_seconds", &labels).record(elapsed);

        match result {
            Ok(result_data) => {
                let result_data = self
                    .offload_oversize_result(&task.parent_job_id, task.stage, &task.task_index, result_data)
                    .await?;
                self.finish_task(
                    &job,
                    &task.task_id,
                    task.stage,
                    TaskStatus::Completed,
                    Some(&result_data),
                    None,
                )
                .await?;
                metrics::counter!("coremachine_tasks_completed_total", &labels).increment(1);
                Ok(Disposition::Complete)
            }
            Err(failure) => {
                if task.retry_count < self.config.max_retries as i32 {
                    let retried = self
                        .repo
                        .retry_task(
                            &task.task_id,
                            task.retry_count + 1,
                            &failure_details(&failure),
                        )
                        .await?;
                    if retried {
                        metrics::counter!("coremachine_tasks_retried_total", &labels)
                            .increment(1);
                        return Ok(Disposition::Abandon);
                    }
                    // Lost the row in the meantime; treat as settled.
                    return Ok(Disposition::Complete);
                }

                self.finish_task(
                    &job,
                    &task.task_id,
                    task.stage,
                    TaskStatus::Failed,
                    None,
                    Some(&failure_details(&failure)),
                )
                .await?;
                metrics::counter!("coremachine_tasks_failed_total", &labels).increment(1);
                Ok(Disposition::DeadLetter {
                    kind: ErrorKind::HandlerError,
                    error: failure.message,
                })
            }
        }
    }

    /// Record the terminal task state and, if this was the stage's last
    /// task, advance the job and enqueue its successor.
    async fn finish_task(
        &self,
        job: &Job,
        task_id: &str,
        stage: i32,
        status: TaskStatus,
        result_data: Option<&Value>,
        error_details: Option<&Value>,
    ) -> Result<(), MachineError> {
        let outcome = self
            .state
            .complete_task(&job.job_id, stage, task_id, status, result_data, error_details)
            .await?;

        match outcome {
            CompletionOutcome::AlreadyFinalized => {
                debug!("task {} already finalized, no-op", task_id);
                Ok(())
            }
            CompletionOutcome::Recorded => Ok(()),
            CompletionOutcome::LastTask { .. } => self.drive_advancement(job, stage).await,
        }
    }

    async fn drive_advancement(&self, job: &Job, completed_stage: i32) -> Result<(), MachineError> {
        let spec = self
            .registry
            .job_spec(&job.job_type)
            .ok_or_else(|| MachineError::Spec(format!("unknown job type {}", job.job_type)))?;

        let mut tx = self
            .repo
            .pool()
            .begin()
            .await
            .map_err(MachineError::Database)?;

        let outcome = self
            .state
            .advance_stage_in(&mut tx, &job.job_id, completed_stage, spec.as_ref())
            .await?;

        if let AdvanceOutcome::Advanced { next_stage } = &outcome {
            let successor = JobQueueMessage {
                job_id: job.job_id.clone(),
                job_type: job.job_type.clone(),
                stage: *next_stage as u32,
                parameters: job.parameters.clone(),
                correlation_id: Uuid::now_v7().to_string(),
            };
            self.job_queue.send_in(&mut *tx, &successor).await?;
        }

        tx.commit().await.map_err(MachineError::Database)?;

        if let AdvanceOutcome::Terminal { status, .. } = outcome {
            self.publish_completion(&job.job_id, &job.job_type, status.to_string());
        }

        Ok(())
    }

    /// Results above half the message limit would not survive propagation
    /// inside queue envelopes; store them and pass a reference instead.
    async fn offload_oversize_result(
        &self,
        job_id: &str,
        stage: i32,
        task_index: &str,
        result: Value,
    ) -> Result<Value, MachineError> {
        let encoded = result.to_string();
        if encoded.len() <= self.config.max_message_bytes / 2 {
            return Ok(result);
        }

        let path = format!("results/{}/{}/{}.json", job_id, stage, task_index);
        self.blobs
            .write(
                &self.config.blob_overflow_container,
                &path,
                encoded.into_bytes(),
            )
            .await
            .map_err(|e| MachineError::Blob(e.to_string()))?;

        Ok(json!({ BLOB_REF_KEY: path }))
    }

    fn publish_completion(&self, job_id: &str, job_type: &str, status: String) {
        info!("job {} reached terminal state {}", job_id, status);
        metrics::counter!(
            "coremachine_jobs_finished_total",
            &[("job_type", job_type.to_owned()), ("status", status)]
        )
        .increment(1);
    }

    /// Retry the whole (idempotent) message handling on transient database
    /// errors with jittered exponential backoff, then give up and let the
    /// lease settle as abandon.
    async fn with_transient_retry<F, Fut>(&self, mut run: F) -> Result<Disposition, MachineError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<Disposition, MachineError>>,
    {
        let mut attempt = 0;
        loop {
            match run().await {
                Ok(disposition) => return Ok(disposition),
                Err(error) if is_transient(&error) && attempt + 1 < DB_RETRY_ATTEMPTS => {
                    attempt += 1;
                    let jitter = rand::thread_rng().gen_range(0..100);
                    let backoff = Duration::from_millis(100 * 2u64.pow(attempt) + jitter);
                    warn!(
                        "transient database error (attempt {}): {}, retrying in {:?}",
                        attempt, error, backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn settle(
        &self,
        queue: &MessageQueue,
        delivery: Delivery,
        disposition: Result<Disposition, MachineError>,
        kind: &str,
    ) -> Result<(), MachineError> {
        let result = match disposition {
            Ok(Disposition::Complete) => queue.complete(delivery).await,
            Ok(Disposition::Abandon) => queue.abandon(delivery).await,
            Ok(Disposition::DeadLetter { kind: error_kind, error }) => {
                warn!("dead-lettering {} message: {} ({})", kind, error, error_kind);
                metrics::counter!(
                    "coremachine_dead_letters_total",
                    &[("kind", error_kind.as_str())]
                )
                .increment(1);
                queue.dead_letter(delivery, error_kind, &error).await
            }
            Err(error) => {
                // Processing failed beyond transient retries; the message
                // comes back after the lease backoff.
                error!("failed to process {} message: {}", kind, error);
                queue.abandon(delivery).await
            }
        };

        match result {
            Ok(()) => Ok(()),
            // Someone else holds a newer lease; their settlement wins.
            Err(QueueError::LeaseLost { id }) => {
                warn!("lease lost settling {} message {}", kind, id);
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }
}

fn prior_aggregate(job: &Job, stage: i32) -> Result<Option<StageAggregate>, serde_json::Error> {
    if stage <= 1 {
        return Ok(None);
    }
    match job.stage_result(stage - 1) {
        Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
        None => Ok(None),
    }
}

fn failure_details(failure: &HandlerFailure) -> Value {
    json!({
        "error_kind": ErrorKind::HandlerError.as_str(),
        "message": failure.message,
        "details": failure.details,
    })
}

fn is_transient(error: &MachineError) -> bool {
    match error {
        MachineError::Database(_) => true,
        MachineError::Queue(QueueError::QueryError { .. }) => true,
        MachineError::Queue(QueueError::PoolCreationError { .. }) => true,
        MachineError::State(crate::error::StateError::TransactionError { .. }) => true,
        _ => false,
    }
}
