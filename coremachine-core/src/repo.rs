use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::QueryBuilder;

use crate::error::QueueError;
use crate::types::{Job, JobStatus, Task, TaskStatus};

/// A task row to be materialized. Ids are already deterministic fingerprints
/// by the time they reach the repository.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_id: String,
    pub parent_job_id: String,
    pub job_type: String,
    pub task_type: String,
    pub stage: i32,
    pub task_index: String,
    pub parameters: Value,
}

/// Partial update for a job row. None fields are left untouched.
#[derive(Debug, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub stage: Option<i32>,
    pub result_data: Option<Value>,
    pub error_details: Option<Value>,
    pub metadata: Option<Value>,
}

/// Per-status task counts for one job, used for progress reporting.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct TaskStatusCounts {
    pub queued: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

impl TaskStatusCounts {
    pub fn total(&self) -> i64 {
        self.queued + self.processing + self.completed + self.failed
    }

    pub fn terminal(&self) -> i64 {
        self.completed + self.failed
    }
}

/// Narrow adapter over the durable job/task tables. All authoritative state
/// lives here; in-memory views are read per operation and written back under
/// transactions.
#[derive(Clone)]
pub struct JobTaskRepo {
    pool: PgPool,
}

impl JobTaskRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a job row if absent. Returns true when this call created the
    /// row; false means an identical submission got there first.
    pub async fn create_job(
        &self,
        job_id: &str,
        job_type: &str,
        total_stages: i32,
        parameters: &Value,
        metadata: Option<&Value>,
    ) -> Result<bool, QueueError> {
        self.create_job_in(&self.pool, job_id, job_type, total_stages, parameters, metadata)
            .await
    }

    pub async fn create_job_in<'c, E>(
        &self,
        executor: E,
        job_id: &str,
        job_type: &str,
        total_stages: i32,
        parameters: &Value,
        metadata: Option<&Value>,
    ) -> Result<bool, QueueError>
    where
        E: sqlx::Executor<'c, Database = sqlx::Postgres>,
    {
        let result = sqlx::query(
            r#"
INSERT INTO job (job_id, job_type, status, stage, total_stages, parameters, metadata)
VALUES ($1, $2, 'queued'::job_status, 1, $3, $4, $5)
ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(job_id)
        .bind(job_type)
        .bind(total_stages)
        .bind(parameters)
        .bind(metadata)
        .execute(executor)
        .await
        .map_err(|error| QueueError::QueryError {
            command: "INSERT".to_owned(),
            error,
        })?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        sqlx::query_as::<_, Job>("SELECT * FROM job WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })
    }

    pub async fn update_job(&self, job_id: &str, patch: JobPatch) -> Result<(), QueueError> {
        let mut query = QueryBuilder::new("UPDATE job SET updated_at = NOW()");

        if let Some(status) = patch.status {
            query.push(", status = ");
            query.push_bind(status);
        }
        if let Some(stage) = patch.stage {
            query.push(", stage = ");
            query.push_bind(stage);
        }
        if let Some(result_data) = patch.result_data {
            query.push(", result_data = ");
            query.push_bind(result_data);
        }
        if let Some(error_details) = patch.error_details {
            query.push(", error_details = ");
            query.push_bind(error_details);
        }
        if let Some(metadata) = patch.metadata {
            query.push(", metadata = ");
            query.push_bind(metadata);
        }

        query.push(" WHERE job_id = ");
        query.push_bind(job_id);

        query
            .build()
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(())
    }

    /// Recent jobs for the listing endpoint, newest first.
    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Job>, QueueError> {
        let jobs = match status {
            Some(status) => {
                sqlx::query_as::<_, Job>(
                    r#"
SELECT * FROM job
WHERE status = $1
ORDER BY created_at DESC
LIMIT $2 OFFSET $3
                    "#,
                )
                .bind(status)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, Job>(
                    "SELECT * FROM job ORDER BY created_at DESC LIMIT $1 OFFSET $2",
                )
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await
            }
        };

        jobs.map_err(|error| QueueError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })
    }

    pub async fn create_task(&self, task: &NewTask) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"
INSERT INTO task (task_id, parent_job_id, job_type, task_type, stage, task_index, status, parameters)
VALUES ($1, $2, $3, $4, $5, $6, 'queued'::task_status, $7)
ON CONFLICT (task_id) DO NOTHING
            "#,
        )
        .bind(&task.task_id)
        .bind(&task.parent_job_id)
        .bind(&task.job_type)
        .bind(&task.task_type)
        .bind(task.stage)
        .bind(&task.task_index)
        .bind(&task.parameters)
        .execute(&self.pool)
        .await
        .map_err(|error| QueueError::QueryError {
            command: "INSERT".to_owned(),
            error,
        })?;

        Ok(result.rows_affected() == 1)
    }

    /// Insert-if-absent for a whole stage in one round-trip, using UNNEST to
    /// turn the column arrays into rows. Existing rows (crashed partial
    /// enqueue, redelivered stage message) are left untouched.
    pub async fn bulk_create_tasks(&self, tasks: &[NewTask]) -> Result<(), QueueError> {
        if tasks.is_empty() {
            return Ok(());
        }

        let mut task_ids = Vec::with_capacity(tasks.len());
        let mut parent_job_ids = Vec::with_capacity(tasks.len());
        let mut job_types = Vec::with_capacity(tasks.len());
        let mut task_types = Vec::with_capacity(tasks.len());
        let mut stages = Vec::with_capacity(tasks.len());
        let mut task_indexes = Vec::with_capacity(tasks.len());
        let mut parameters = Vec::with_capacity(tasks.len());

        for task in tasks {
            task_ids.push(task.task_id.clone());
            parent_job_ids.push(task.parent_job_id.clone());
            job_types.push(task.job_type.clone());
            task_types.push(task.task_type.clone());
            stages.push(task.stage);
            task_indexes.push(task.task_index.clone());
            parameters.push(task.parameters.clone());
        }

        sqlx::query(
            r#"
INSERT INTO task (task_id, parent_job_id, job_type, task_type, stage, task_index, status, parameters)
SELECT unnested.task_id,
       unnested.parent_job_id,
       unnested.job_type,
       unnested.task_type,
       unnested.stage,
       unnested.task_index,
       'queued'::task_status,
       unnested.parameters
FROM UNNEST($1::text[], $2::text[], $3::text[], $4::text[], $5::int[], $6::text[], $7::jsonb[])
    AS unnested(task_id, parent_job_id, job_type, task_type, stage, task_index, parameters)
ON CONFLICT (task_id) DO NOTHING
            "#,
        )
        .bind(&task_ids)
        .bind(&parent_job_ids)
        .bind(&job_types)
        .bind(&task_types)
        .bind(&stages)
        .bind(&task_indexes)
        .bind(&parameters)
        .execute(&self.pool)
        .await
        .map_err(|error| QueueError::QueryError {
            command: "INSERT".to_owned(),
            error,
        })?;

        Ok(())
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>, QueueError> {
        sqlx::query_as::<_, Task>("SELECT * FROM task WHERE task_id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })
    }

    /// Claim a queued task for processing. Zero rows affected means the task
    /// is already processing or terminal: a duplicate delivery.
    pub async fn mark_task_processing(&self, task_id: &str) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"
UPDATE task
SET status = 'processing'::task_status, updated_at = NOW()
WHERE task_id = $1 AND status = 'queued'::task_status
            "#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(|error| QueueError::QueryError {
            command: "UPDATE".to_owned(),
            error,
        })?;

        Ok(result.rows_affected() == 1)
    }

    /// Return a processing task to queued for another attempt, recording the
    /// failure. The terminal statuses are never left: zero rows affected
    /// means the task is no longer retryable.
    pub async fn retry_task(
        &self,
        task_id: &str,
        retry_count: i32,
        error_details: &Value,
    ) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"
UPDATE task
SET status = 'queued'::task_status, retry_count = $2, error_details = $3, updated_at = NOW()
WHERE task_id = $1 AND status = 'processing'::task_status
            "#,
        )
        .bind(task_id)
        .bind(retry_count)
        .bind(error_details)
        .execute(&self.pool)
        .await
        .map_err(|error| QueueError::QueryError {
            command: "UPDATE".to_owned(),
            error,
        })?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn list_tasks(
        &self,
        job_id: &str,
        stage: Option<i32>,
    ) -> Result<Vec<Task>, QueueError> {
        let tasks = match stage {
            Some(stage) => {
                sqlx::query_as::<_, Task>(
                    r#"
SELECT * FROM task
WHERE parent_job_id = $1 AND stage = $2
ORDER BY task_index
                    "#,
                )
                .bind(job_id)
                .bind(stage)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, Task>(
                    "SELECT * FROM task WHERE parent_job_id = $1 ORDER BY stage, task_index",
                )
                .bind(job_id)
                .fetch_all(&self.pool)
                .await
            }
        };

        tasks.map_err(|error| QueueError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })
    }

    pub async fn count_tasks_by_status(
        &self,
        job_id: &str,
        stage: Option<i32>,
    ) -> Result<TaskStatusCounts, QueueError> {
        let rows: Vec<(TaskStatus, i64)> = match stage {
            Some(stage) => {
                sqlx::query_as(
                    r#"
SELECT status, COUNT(*)
FROM task
WHERE parent_job_id = $1 AND stage = $2
GROUP BY status
                    "#,
                )
                .bind(job_id)
                .bind(stage)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as(
                    "SELECT status, COUNT(*) FROM task WHERE parent_job_id = $1 GROUP BY status",
                )
                .bind(job_id)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|error| QueueError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })?;

        let mut counts = TaskStatusCounts::default();
        for (status, count) in rows {
            match status {
                TaskStatus::Queued => counts.queued = count,
                TaskStatus::Processing => counts.processing = count,
                TaskStatus::Completed => counts.completed = count,
                TaskStatus::Failed => counts.failed = count,
            }
        }

        Ok(counts)
    }

    /// Tasks of a stage that are still queued: the ones a redelivered stage
    /// message must (re-)enqueue.
    pub async fn queued_tasks(&self, job_id: &str, stage: i32) -> Result<Vec<Task>, QueueError> {
        sqlx::query_as::<_, Task>(
            r#"
SELECT * FROM task
WHERE parent_job_id = $1 AND stage = $2 AND status = 'queued'::task_status
ORDER BY task_index
            "#,
        )
        .bind(job_id)
        .bind(stage)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| QueueError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })
    }

    /// Cascades to the job's tasks.
    pub async fn delete_job(&self, job_id: &str) -> Result<bool, QueueError> {
        let result = sqlx::query("DELETE FROM job WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "DELETE".to_owned(),
                error,
            })?;

        Ok(result.rows_affected() == 1)
    }
}
