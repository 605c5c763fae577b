//! Transactional state transitions for jobs and tasks.
//!
//! Two transactions are central. The completion transaction terminalizes a
//! task and atomically detects the last-task condition for its stage under a
//! per-(job, stage) advisory lock, so exactly one concurrent completion is
//! nominated to drive advancement. The advancement transaction bumps the job
//! row (or terminalizes it) under a per-job advisory lock and is an
//! idempotent no-op for stale callers.
//!
//! Both locks are transaction-scoped (`pg_advisory_xact_lock`): released on
//! commit or rollback, never held across network calls.

use serde_json::Value;
use sqlx::postgres::{PgPool, Postgres};
use sqlx::Transaction;

use crate::error::StateError;
use crate::ids::advisory_lock_key;
use crate::registry::{FinalizeContext, JobSpec};
use crate::types::{Job, JobStatus, StageAggregate, TaskStatus};

/// What a task completion meant for its stage: either it was a duplicate,
/// or it was recorded, or it was the last one and the caller must drive
/// advancement.
#[derive(Debug)]
pub enum CompletionOutcome {
    /// The task was no longer in `processing` (lease expired and another
    /// delivery finished it, or this is a redelivery). Nothing was written.
    AlreadyFinalized,
    /// Recorded; other tasks in the stage are still pending.
    Recorded,
    /// This completion was the last of its stage. The aggregate has been
    /// written to the job's stage_results.
    LastTask { aggregate: StageAggregate },
}

/// Result of the stage-advancement transaction.
#[derive(Debug)]
pub enum AdvanceOutcome {
    /// The job was not sitting at the completed stage (duplicate driver) or
    /// is already terminal. Nothing was written.
    Stale,
    /// The job moved to the next stage; the caller enqueues its job message
    /// within the same transaction.
    Advanced { next_stage: i32 },
    /// The final stage completed and the job is terminal.
    Terminal {
        status: JobStatus,
        result_data: Value,
    },
}

#[derive(Clone)]
pub struct StateManager {
    pool: PgPool,
}

impl StateManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Terminalize a task and check whether its stage is done.
    ///
    /// The guarded update (`status = 'processing'`) makes this idempotent
    /// under at-least-once delivery: a late or duplicate finisher observes
    /// zero affected rows and backs off without touching the aggregate.
    pub async fn complete_task(
        &self,
        job_id: &str,
        stage: i32,
        task_id: &str,
        status: TaskStatus,
        result_data: Option<&Value>,
        error_details: Option<&Value>,
    ) -> Result<CompletionOutcome, StateError> {
        debug_assert!(status.is_terminal());

        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
UPDATE task
SET status = $2, result_data = $3, error_details = $4, updated_at = NOW()
WHERE task_id = $1 AND status = 'processing'::task_status
            "#,
        )
        .bind(task_id)
        .bind(status)
        .bind(result_data)
        .bind(error_details)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(CompletionOutcome::AlreadyFinalized);
        }

        // Serialize last-task detection per (job, stage): exactly one of the
        // concurrent finishers for this stage observes remaining == 0.
        let key = advisory_lock_key(&format!("{}:{}", job_id, stage));
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(key)
            .execute(&mut *tx)
            .await?;

        let remaining: i64 = sqlx::query_scalar(
            r#"
SELECT COUNT(*)
FROM task
WHERE parent_job_id = $1
  AND stage = $2
  AND status NOT IN ('completed'::task_status, 'failed'::task_status)
            "#,
        )
        .bind(job_id)
        .bind(stage)
        .fetch_one(&mut *tx)
        .await?;

        if remaining > 0 {
            tx.commit().await?;
            return Ok(CompletionOutcome::Recorded);
        }

        let aggregate = aggregate_stage(&mut tx, job_id, stage).await?;
        record_stage_aggregate(&mut tx, job_id, stage, &aggregate).await?;

        tx.commit().await?;
        Ok(CompletionOutcome::LastTask { aggregate })
    }

    /// Advance the job past `completed_stage`, or terminalize it when
    /// that was the final stage. Caller owns the transaction so the
    /// successor enqueue commits atomically with the stage bump.
    pub async fn advance_stage_in(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job_id: &str,
        completed_stage: i32,
        spec: &dyn JobSpec,
    ) -> Result<AdvanceOutcome, StateError> {
        let key = advisory_lock_key(&format!("{}:advance", job_id));
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(key)
            .execute(&mut **tx)
            .await?;

        let job: Job = sqlx::query_as("SELECT * FROM job WHERE job_id = $1 FOR UPDATE")
            .bind(job_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| StateError::JobNotFound(job_id.to_owned()))?;

        // A duplicate driver, or a cancelled job: idempotent no-op.
        if job.stage != completed_stage || job.status.is_terminal() {
            return Ok(AdvanceOutcome::Stale);
        }

        if completed_stage < job.total_stages {
            let next_stage = completed_stage + 1;
            sqlx::query(
                r#"
UPDATE job
SET stage = $2, status = 'processing'::job_status, updated_at = NOW()
WHERE job_id = $1
                "#,
            )
            .bind(job_id)
            .bind(next_stage)
            .execute(&mut **tx)
            .await?;

            return Ok(AdvanceOutcome::Advanced { next_stage });
        }

        let (completed, failed): (i64, i64) = sqlx::query_as(
            r#"
SELECT
    COUNT(*) FILTER (WHERE status = 'completed'::task_status),
    COUNT(*) FILTER (WHERE status = 'failed'::task_status)
FROM task
WHERE parent_job_id = $1
            "#,
        )
        .bind(job_id)
        .fetch_one(&mut **tx)
        .await?;

        let status = if failed > 0 {
            JobStatus::CompletedWithErrors
        } else {
            JobStatus::Completed
        };

        let result_data = spec
            .finalize(FinalizeContext {
                job_id,
                parameters: &job.parameters,
                stage_results: &job.stage_results,
                tasks_completed: completed,
                tasks_failed: failed,
            })
            .map_err(|e| StateError::FinalizeError {
                job_id: job_id.to_owned(),
                message: e.to_string(),
            })?;

        sqlx::query(
            r#"
UPDATE job
SET status = $2, result_data = $3, updated_at = NOW()
WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .bind(status)
        .bind(&result_data)
        .execute(&mut **tx)
        .await?;

        Ok(AdvanceOutcome::Terminal {
            status,
            result_data,
        })
    }

    /// Write a stage aggregate outside the completion path. Used for empty
    /// fan-out stages, which complete on entry without any task ever running.
    pub async fn record_stage_aggregate_in(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job_id: &str,
        stage: i32,
        aggregate: &StageAggregate,
    ) -> Result<(), StateError> {
        record_stage_aggregate(tx, job_id, stage, aggregate).await
    }

    /// First job message consumed: queued -> processing.
    pub async fn mark_job_processing(&self, job_id: &str) -> Result<bool, StateError> {
        let result = sqlx::query(
            r#"
UPDATE job
SET status = 'processing'::job_status, updated_at = NOW()
WHERE job_id = $1 AND status = 'queued'::job_status
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// External cancellation. Returns false if the job was already terminal.
    /// In-flight handlers are not interrupted; the task loop checks the
    /// parent status before each handler invocation.
    pub async fn fail_job(
        &self,
        job_id: &str,
        error_details: &Value,
    ) -> Result<bool, StateError> {
        let result = sqlx::query(
            r#"
UPDATE job
SET status = 'failed'::job_status, error_details = $2, updated_at = NOW()
WHERE job_id = $1
  AND status IN ('queued'::job_status, 'processing'::job_status)
            "#,
        )
        .bind(job_id)
        .bind(error_details)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// The latest failing task's error, for user-visible job status.
    pub async fn latest_task_failure(&self, job_id: &str) -> Result<Option<Value>, StateError> {
        let error: Option<Option<Value>> = sqlx::query_scalar(
            r#"
SELECT error_details
FROM task
WHERE parent_job_id = $1 AND status = 'failed'::task_status
ORDER BY updated_at DESC
LIMIT 1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(error.flatten())
    }
}

async fn aggregate_stage(
    tx: &mut Transaction<'_, Postgres>,
    job_id: &str,
    stage: i32,
) -> Result<StageAggregate, StateError> {
    let rows: Vec<(String, TaskStatus, Option<Value>)> = sqlx::query_as(
        r#"
SELECT task_index, status, result_data
FROM task
WHERE parent_job_id = $1 AND stage = $2
ORDER BY task_index
        "#,
    )
    .bind(job_id)
    .bind(stage)
    .fetch_all(&mut **tx)
    .await?;

    let mut aggregate = StageAggregate::default();
    for (task_index, status, result_data) in rows {
        match status {
            TaskStatus::Completed => aggregate.completed += 1,
            TaskStatus::Failed => aggregate.failed += 1,
            // Unreachable under the advisory lock, but harmless.
            TaskStatus::Queued | TaskStatus::Processing => continue,
        }
        aggregate
            .results
            .insert(task_index, result_data.unwrap_or(Value::Null));
    }

    Ok(aggregate)
}

async fn record_stage_aggregate(
    tx: &mut Transaction<'_, Postgres>,
    job_id: &str,
    stage: i32,
    aggregate: &StageAggregate,
) -> Result<(), StateError> {
    let aggregate = serde_json::to_value(aggregate).map_err(|e| StateError::FinalizeError {
        job_id: job_id.to_owned(),
        message: format!("could not serialize stage aggregate: {}", e),
    })?;

    sqlx::query(
        r#"
UPDATE job
SET stage_results = stage_results || jsonb_build_object($2::text, $3::jsonb),
    updated_at = NOW()
WHERE job_id = $1
        "#,
    )
    .bind(job_id)
    .bind(stage.to_string())
    .bind(&aggregate)
    .execute(&mut **tx)
    .await?;

    Ok(())
}
