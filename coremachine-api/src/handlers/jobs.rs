use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use coremachine_core::{Job, JobStatus, MachineError, Task, TaskStatusCounts};

use super::app::{AppState, ErrorBody};
use coremachine_core::ErrorKind;

type ErrorResponse = (StatusCode, Json<ErrorBody>);

#[derive(Serialize)]
pub struct SubmitResponse {
    pub job: Job,
    pub already_exists: bool,
}

/// POST /jobs/submit/{job_type}: direct submission. A duplicate submission
/// is answered with 409 and the existing job.
pub async fn submit(
    State(state): State<AppState>,
    Path(job_type): Path<String>,
    Json(parameters): Json<Value>,
) -> Result<(StatusCode, Json<SubmitResponse>), ErrorResponse> {
    debug!("direct submit for job type {}", job_type);

    let (job, already_exists) = state
        .machine
        .submit(&job_type, &parameters)
        .await
        .map_err(|e| match e {
            MachineError::Spec(message) => ErrorBody::response(
                StatusCode::BAD_REQUEST,
                ErrorKind::InvalidParams,
                message,
            ),
            other => internal_error(other),
        })?;

    let status = if already_exists {
        StatusCode::CONFLICT
    } else {
        StatusCode::OK
    };

    Ok((
        status,
        Json(SubmitResponse {
            job,
            already_exists,
        }),
    ))
}

#[derive(Serialize)]
pub struct JobStatusResponse {
    pub job: Job,
    pub task_counts: TaskStatusCounts,
    pub progress_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<Value>,
}

/// GET /jobs/status/{job_id}: the job plus derived progress. error_details
/// falls back to the latest failing task when the row itself carries none.
pub async fn status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusResponse>, ErrorResponse> {
    let job = state
        .repo
        .get_job(&job_id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| {
            ErrorBody::response(
                StatusCode::NOT_FOUND,
                ErrorKind::ResourceMissing,
                format!("unknown job {}", job_id),
            )
        })?;

    let task_counts = state
        .repo
        .count_tasks_by_status(&job_id, None)
        .await
        .map_err(internal_error)?;

    let progress_percent = if task_counts.total() == 0 {
        0.0
    } else {
        task_counts.terminal() as f64 / task_counts.total() as f64 * 100.0
    };

    let error_details = match &job.error_details {
        Some(details) => Some(details.clone()),
        None if task_counts.failed > 0 => state
            .state
            .latest_task_failure(&job_id)
            .await
            .map_err(internal_error)?,
        None => None,
    };

    Ok(Json(JobStatusResponse {
        job,
        task_counts,
        progress_percent,
        error_details,
    }))
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<Job>,
}

/// GET /jobs: recent jobs, newest first, optionally filtered by status.
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<JobListResponse>, ErrorResponse> {
    let status = match &query.status {
        Some(raw) => Some(raw.parse::<JobStatus>().map_err(|e| {
            ErrorBody::response(StatusCode::BAD_REQUEST, ErrorKind::InvalidParams, e)
        })?),
        None => None,
    };

    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let offset = query.offset.unwrap_or(0).max(0);

    let jobs = state
        .repo
        .list_jobs(status, limit, offset)
        .await
        .map_err(internal_error)?;

    Ok(Json(JobListResponse { jobs }))
}

#[derive(Deserialize)]
pub struct TasksQuery {
    pub job_id: String,
    pub stage: Option<i32>,
}

#[derive(Serialize)]
pub struct TaskListResponse {
    pub tasks: Vec<Task>,
}

/// GET /tasks?job_id=&stage=: tasks for a job, optionally one stage.
pub async fn tasks(
    State(state): State<AppState>,
    Query(query): Query<TasksQuery>,
) -> Result<Json<TaskListResponse>, ErrorResponse> {
    if state
        .repo
        .get_job(&query.job_id)
        .await
        .map_err(internal_error)?
        .is_none()
    {
        return Err(ErrorBody::response(
            StatusCode::NOT_FOUND,
            ErrorKind::ResourceMissing,
            format!("unknown job {}", query.job_id),
        ));
    }

    let tasks = state
        .repo
        .list_tasks(&query.job_id, query.stage)
        .await
        .map_err(internal_error)?;

    Ok(Json(TaskListResponse { tasks }))
}

pub(super) fn internal_error<E: std::fmt::Display>(error: E) -> ErrorResponse {
    error!("internal error handling request: {}", error);
    ErrorBody::response(
        StatusCode::INTERNAL_SERVER_ERROR,
        ErrorKind::TransientDbError,
        "internal error",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use axum::Router;
    use http_body_util::BodyExt;
    use serde_json::json;
    use sqlx::postgres::PgPool;
    use tower::ServiceExt;

    use crate::handlers::add_routes;

    async fn post_json(app: Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[sqlx::test(migrations = "../coremachine-core/migrations")]
    async fn test_submit_then_status(db: PgPool) {
        let state = crate::test_support::app_state(db).await;
        let app = add_routes(Router::new(), state);

        let (status, body) = post_json(
            app.clone(),
            "/jobs/submit/hello_world",
            json!({"n": 3, "message": "hi"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["already_exists"], json!(false));
        assert_eq!(body["job"]["status"], json!("queued"));
        assert_eq!(body["job"]["total_stages"], json!(2));
        let job_id = body["job"]["job_id"].as_str().unwrap().to_owned();

        // Identical submission: 409 plus the existing job.
        let (status, body) = post_json(
            app.clone(),
            "/jobs/submit/hello_world",
            json!({"n": 3, "message": "hi"}),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["already_exists"], json!(true));
        assert_eq!(body["job"]["job_id"], json!(job_id.clone()));

        let (status, body) =
            get_json(app.clone(), &format!("/jobs/status/{}", job_id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["job"]["status"], json!("queued"));
        assert_eq!(body["task_counts"]["queued"], json!(0));
        assert_eq!(body["progress_percent"], json!(0.0));

        let (status, body) = get_json(app, &format!("/tasks?job_id={}", job_id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tasks"], json!([]));
    }

    #[sqlx::test(migrations = "../coremachine-core/migrations")]
    async fn test_submit_rejects_bad_parameters(db: PgPool) {
        let state = crate::test_support::app_state(db).await;
        let app = add_routes(Router::new(), state);

        let (status, body) = post_json(
            app.clone(),
            "/jobs/submit/hello_world",
            json!({"message": "hi"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_kind"], json!("invalid_params"));

        let (status, body) =
            post_json(app, "/jobs/submit/not_a_pipeline", json!({"n": 1})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_kind"], json!("invalid_params"));
    }

    #[sqlx::test(migrations = "../coremachine-core/migrations")]
    async fn test_unknown_job_is_404(db: PgPool) {
        let state = crate::test_support::app_state(db).await;
        let app = add_routes(Router::new(), state);

        let missing = "0".repeat(64);
        let (status, body) =
            get_json(app.clone(), &format!("/jobs/status/{}", missing)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error_kind"], json!("resource_missing"));

        let (status, _) = get_json(app, &format!("/tasks?job_id={}", missing)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[sqlx::test(migrations = "../coremachine-core/migrations")]
    async fn test_list_jobs_filters_by_status(db: PgPool) {
        let state = crate::test_support::app_state(db).await;
        let app = add_routes(Router::new(), state);

        post_json(
            app.clone(),
            "/jobs/submit/hello_world",
            json!({"n": 1, "message": "hi"}),
        )
        .await;

        let (status, body) = get_json(app.clone(), "/jobs?status=queued").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["jobs"].as_array().unwrap().len(), 1);

        let (status, body) = get_json(app.clone(), "/jobs?status=completed").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["jobs"].as_array().unwrap().len(), 0);

        let (status, body) = get_json(app, "/jobs?status=bogus").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_kind"], json!("invalid_params"));
    }
}
