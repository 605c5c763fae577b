use std::sync::Arc;

use sqlx::postgres::PgPool;

use coremachine_core::{
    pipelines, CoreConfig, CoreMachine, HandlerRegistry, JobTaskRepo, MemoryBlobStore,
    MessageQueue, PlatformLayer, RetryPolicy, StateManager,
};

use crate::handlers::AppState;

/// An AppState over a test database, with the built-in pipelines registered.
pub async fn app_state(db: PgPool) -> AppState {
    let config = CoreConfig::default();

    let mut registry = HandlerRegistry::new();
    pipelines::register_builtin(&mut registry);
    let registry = Arc::new(registry);

    let repo = JobTaskRepo::new(db.clone());
    let state = StateManager::new(db.clone());
    let job_queue = MessageQueue::new(
        db.clone(),
        &config.job_queue_name,
        &config.dead_letter_queue_name,
        config.lease_timeout_seconds,
        config.max_message_bytes,
        RetryPolicy::default(),
    );
    let task_queue = MessageQueue::new(
        db.clone(),
        &config.task_queue_name,
        &config.dead_letter_queue_name,
        config.lease_timeout_seconds,
        config.max_message_bytes,
        RetryPolicy::default(),
    );
    let blobs = Arc::new(MemoryBlobStore::new());

    let machine = Arc::new(CoreMachine::new(
        repo.clone(),
        state.clone(),
        registry.clone(),
        job_queue.clone(),
        task_queue.clone(),
        blobs.clone(),
        config,
    ));
    let platform = Arc::new(PlatformLayer::new(
        repo.clone(),
        registry,
        job_queue,
        blobs,
    ));

    AppState {
        machine,
        platform,
        repo,
        state,
        dead_letters: task_queue,
        pool: db,
    }
}
