use std::sync::Arc;

use axum::Router;
use config::Config;
use envconfig::Envconfig;
use eyre::Result;

use coremachine_core::{
    pipelines, CoreMachine, HandlerRegistry, JobTaskRepo, MemoryBlobStore, MessageQueue,
    PlatformLayer, PoolConfig, RetryPolicy, StateManager,
};
use serve_metrics::{attach, install_recorder};

mod config;
mod handlers;
#[cfg(test)]
mod test_support;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let metrics_handle = install_recorder();

    let pool = PoolConfig::new(&config.core.db_url, Some(config.max_pg_connections))
        .connect()
        .expect("failed to create database pool");

    let mut registry = HandlerRegistry::new();
    pipelines::register_builtin(&mut registry);
    let registry = Arc::new(registry);

    let repo = JobTaskRepo::new(pool.clone());
    let state_manager = StateManager::new(pool.clone());
    let job_queue = MessageQueue::new(
        pool.clone(),
        &config.core.job_queue_name,
        &config.core.dead_letter_queue_name,
        config.core.lease_timeout_seconds,
        config.core.max_message_bytes,
        RetryPolicy::default(),
    );
    let task_queue = MessageQueue::new(
        pool.clone(),
        &config.core.task_queue_name,
        &config.core.dead_letter_queue_name,
        config.core.lease_timeout_seconds,
        config.core.max_message_bytes,
        RetryPolicy::default(),
    );
    let blobs = Arc::new(MemoryBlobStore::new());

    let machine = Arc::new(CoreMachine::new(
        repo.clone(),
        state_manager.clone(),
        registry.clone(),
        job_queue.clone(),
        task_queue.clone(),
        blobs.clone(),
        config.core.clone(),
    ));
    let platform = Arc::new(PlatformLayer::new(
        repo.clone(),
        registry,
        job_queue,
        blobs,
    ));

    let app_state = handlers::AppState {
        machine,
        platform,
        repo,
        state: state_manager,
        dead_letters: task_queue,
        pool,
    };

    let app = handlers::add_routes(Router::new(), app_state);
    let app = attach(app, metrics_handle);

    match listen(app, config.bind()).await {
        Ok(_) => {}
        Err(e) => tracing::error!("failed to start coremachine-api http server, {}", e),
    }
}
