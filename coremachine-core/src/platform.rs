//! External submission surface. Translates platform requests into validated,
//! deduplicated jobs with version-lineage tracking. No partial state is ever
//! written: validation happens first, then one transaction creates the job
//! row, records the lineage version and enqueues the initial stage message.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::postgres::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::error::PlatformError;
use crate::ids::{job_fingerprint, lineage_fingerprint};
use crate::queue::MessageQueue;
use crate::registry::HandlerRegistry;
use crate::repo::JobTaskRepo;
use crate::types::{Job, JobQueueMessage};

/// A blob the submission depends on, checked for existence before any state
/// is written.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct BlobRef {
    pub container: String,
    pub path: String,
}

/// What an external client sends. version_id is deliberately excluded from
/// the lineage key so that different versions of a resource share a lineage.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlatformRequest {
    pub platform_id: String,
    pub dataset_id: String,
    pub resource_id: String,
    pub version_id: String,
    #[serde(default)]
    pub previous_version_id: Option<String>,
    pub job_type: String,
    pub parameters: Value,
    #[serde(default)]
    pub required_blobs: Vec<BlobRef>,
}

impl PlatformRequest {
    pub fn lineage_id(&self) -> String {
        lineage_fingerprint(&self.platform_id, &self.dataset_id, &self.resource_id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlatformResult {
    pub job_id: String,
    pub lineage_id: String,
    pub already_exists: bool,
    pub dry_run: bool,
    /// The created (or pre-existing) job row. None on dry-run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<Job>,
}

#[derive(Clone)]
pub struct PlatformLayer {
    repo: JobTaskRepo,
    registry: Arc<HandlerRegistry>,
    job_queue: MessageQueue,
    blobs: Arc<dyn BlobStore>,
}

impl PlatformLayer {
    pub fn new(
        repo: JobTaskRepo,
        registry: Arc<HandlerRegistry>,
        job_queue: MessageQueue,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            repo,
            registry,
            job_queue,
            blobs,
        }
    }

    fn pool(&self) -> &PgPool {
        self.repo.pool()
    }

    /// Run every validation check in order, mutating nothing. Returns the
    /// projected (job_id, lineage_id) on success.
    pub async fn validate(
        &self,
        request: &PlatformRequest,
    ) -> Result<(String, String), PlatformError> {
        let spec = self
            .registry
            .job_spec(&request.job_type)
            .ok_or_else(|| PlatformError::UnknownJobType(request.job_type.clone()))?;

        spec.validate_parameters(&request.parameters)
            .map_err(|e| PlatformError::InvalidParams(e.to_string()))?;

        for blob in &request.required_blobs {
            let exists = self
                .blobs
                .exists(&blob.container, &blob.path)
                .await
                .map_err(|e| PlatformError::ResourceMissing(e.to_string()))?;
            if !exists {
                return Err(PlatformError::ResourceMissing(format!(
                    "blob {}/{} does not exist",
                    blob.container, blob.path
                )));
            }
        }

        let lineage_id = request.lineage_id();

        if let Some(previous) = &request.previous_version_id {
            let known: bool = sqlx::query_scalar(
                r#"
SELECT EXISTS (
    SELECT 1 FROM platform_version
    WHERE lineage_id = $1 AND version_id = $2
)
                "#,
            )
            .bind(&lineage_id)
            .bind(previous)
            .fetch_one(self.pool())
            .await?;

            if !known {
                return Err(PlatformError::InvalidParams(format!(
                    "previous_version_id {} is not part of this lineage",
                    previous
                )));
            }
        }

        let job_id = job_fingerprint(&request.job_type, &request.parameters);
        Ok((job_id, lineage_id))
    }

    /// Validate and, unless dry_run, create the job and enqueue its first
    /// stage. Identical submissions are idempotent and flagged
    /// `already_exists`.
    pub async fn submit(
        &self,
        request: &PlatformRequest,
        dry_run: bool,
    ) -> Result<PlatformResult, PlatformError> {
        let (job_id, lineage_id) = self.validate(request).await?;

        if dry_run {
            let existing = self.repo.get_job(&job_id).await?;
            return Ok(PlatformResult {
                job_id,
                lineage_id,
                already_exists: existing.is_some(),
                dry_run: true,
                job: None,
            });
        }

        let spec = self
            .registry
            .job_spec(&request.job_type)
            .ok_or_else(|| PlatformError::UnknownJobType(request.job_type.clone()))?;

        let metadata = json!({
            "platform": {
                "lineage_id": lineage_id,
                "platform_id": request.platform_id,
                "dataset_id": request.dataset_id,
                "resource_id": request.resource_id,
                "version_id": request.version_id,
                "previous_version_id": request.previous_version_id,
            }
        });

        let mut tx = self.pool().begin().await?;

        let inserted = self
            .repo
            .create_job_in(
                &mut *tx,
                &job_id,
                &request.job_type,
                spec.total_stages() as i32,
                &request.parameters,
                Some(&metadata),
            )
            .await?;

        sqlx::query(
            r#"
INSERT INTO platform_version (lineage_id, version_id, job_id)
VALUES ($1, $2, $3)
ON CONFLICT (lineage_id, version_id) DO NOTHING
            "#,
        )
        .bind(&lineage_id)
        .bind(&request.version_id)
        .bind(&job_id)
        .execute(&mut *tx)
        .await?;

        if inserted {
            let message = JobQueueMessage {
                job_id: job_id.clone(),
                job_type: request.job_type.clone(),
                stage: 1,
                parameters: request.parameters.clone(),
                correlation_id: Uuid::now_v7().to_string(),
            };
            self.job_queue.send_in(&mut *tx, &message).await?;
        }

        tx.commit().await?;

        let job = self.repo.get_job(&job_id).await?;
        if inserted {
            info!(
                "platform submission created job {} in lineage {}",
                job_id, lineage_id
            );
        }

        Ok(PlatformResult {
            job_id,
            lineage_id,
            already_exists: !inserted,
            dry_run: false,
            job,
        })
    }
}
