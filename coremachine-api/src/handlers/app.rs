use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{routing, Router};
use serde::Serialize;
use sqlx::postgres::PgPool;

use coremachine_core::{CoreMachine, ErrorKind, JobTaskRepo, MessageQueue, PlatformLayer, StateManager};

use super::{jobs, platform};

#[derive(Clone)]
pub struct AppState {
    pub machine: Arc<CoreMachine>,
    pub platform: Arc<PlatformLayer>,
    pub repo: JobTaskRepo,
    pub state: StateManager,
    pub dead_letters: MessageQueue,
    pub pool: PgPool,
}

/// Machine-readable error responses: a stable error_kind plus a message,
/// never raw internals.
#[derive(Serialize)]
pub struct ErrorBody {
    pub error_kind: ErrorKind,
    pub error: String,
}

impl ErrorBody {
    pub fn response(
        status: StatusCode,
        error_kind: ErrorKind,
        error: impl Into<String>,
    ) -> (StatusCode, axum::Json<ErrorBody>) {
        (
            status,
            axum::Json(ErrorBody {
                error_kind,
                error: error.into(),
            }),
        )
    }
}

pub fn add_routes(router: Router, state: AppState) -> Router {
    router.merge(
        Router::new()
            .route("/", routing::get(index))
            .route("/jobs/submit/:job_type", routing::post(jobs::submit))
            .route("/jobs/status/:job_id", routing::get(jobs::status))
            .route("/jobs", routing::get(jobs::list))
            .route("/tasks", routing::get(jobs::tasks))
            .route("/platform/submit", routing::post(platform::submit))
            .route("/dead-letters", routing::get(platform::dead_letters))
            .route("/health", routing::get(health))
            .with_state(state),
    )
}

pub async fn index() -> &'static str {
    "coremachine api"
}

/// Liveness of this process plus reachability of the database the engine
/// depends on. The API has no consumer loops of its own, so the database
/// round-trip is the whole dependency story.
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    if let Err(e) = sqlx::query("SELECT 1").execute(&state.pool).await {
        tracing::warn!("health check cannot reach database: {}", e);
        return (StatusCode::INTERNAL_SERVER_ERROR, "database unreachable").into_response();
    }

    (StatusCode::OK, "ok").into_response()
}
