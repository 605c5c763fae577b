use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::debug;

use coremachine_core::{DeadLetter, ErrorKind, PlatformError, PlatformRequest, PlatformResult};

use super::app::{AppState, ErrorBody};
use super::jobs::internal_error;

type ErrorResponse = (StatusCode, Json<ErrorBody>);

#[derive(Deserialize)]
pub struct SubmitQuery {
    #[serde(default)]
    pub dry_run: bool,
}

/// POST /platform/submit?dry_run=: lineage-tracked submission. Validation
/// failures never write state; idempotent duplicates come back as 409.
pub async fn submit(
    State(state): State<AppState>,
    Query(query): Query<SubmitQuery>,
    Json(request): Json<PlatformRequest>,
) -> Result<(StatusCode, Json<PlatformResult>), ErrorResponse> {
    debug!(
        "platform submit for job type {} (dry_run: {})",
        request.job_type, query.dry_run
    );

    let result = state
        .platform
        .submit(&request, query.dry_run)
        .await
        .map_err(|e| match &e {
            PlatformError::InvalidParams(_)
            | PlatformError::UnknownJobType(_)
            | PlatformError::ResourceMissing(_) => {
                ErrorBody::response(StatusCode::BAD_REQUEST, e.kind(), e.to_string())
            }
            PlatformError::Queue(_) | PlatformError::Database(_) => internal_error(e),
        })?;

    let status = if result.already_exists && !result.dry_run {
        StatusCode::CONFLICT
    } else {
        StatusCode::OK
    };

    Ok((status, Json(result)))
}

#[derive(Deserialize)]
pub struct DeadLettersQuery {
    pub limit: Option<i64>,
}

#[derive(Serialize)]
pub struct DeadLettersResponse {
    pub dead_letters: Vec<DeadLetter>,
}

/// GET /dead-letters: read-only inspection for post-mortem. Re-queueing is
/// an administrative action outside the engine.
pub async fn dead_letters(
    State(state): State<AppState>,
    Query(query): Query<DeadLettersQuery>,
) -> Result<Json<DeadLettersResponse>, ErrorResponse> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let dead_letters = state
        .dead_letters
        .peek_dead_letters(limit)
        .await
        .map_err(internal_error)?;

    Ok(Json(DeadLettersResponse { dead_letters }))
}
