//! Consume job and task queue messages and drive the orchestration kernel.
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use std::future::ready;

use coremachine_core::{
    pipelines, CoreMachine, HandlerRegistry, JobTaskRepo, MemoryBlobStore, MessageQueue,
    PoolConfig, StateManager,
};
use health::HealthRegistry;
use serve_metrics::{attach, install_recorder, serve};

mod config;
mod worker;

use config::Config;
use worker::MachineWorker;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let metrics_handle = install_recorder();

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness.register(&config.worker_name, time::Duration::seconds(60));

    let pool = PoolConfig::new(&config.core.db_url, Some(config.max_pg_connections))
        .connect()
        .expect("failed to create database pool");

    let mut registry = HandlerRegistry::new();
    pipelines::register_builtin(&mut registry);
    let registry = Arc::new(registry);

    let retry_policy = config.retry_policy.policy();
    let job_queue = MessageQueue::new(
        pool.clone(),
        &config.core.job_queue_name,
        &config.core.dead_letter_queue_name,
        config.core.lease_timeout_seconds,
        config.core.max_message_bytes,
        retry_policy,
    );
    let task_queue = MessageQueue::new(
        pool.clone(),
        &config.core.task_queue_name,
        &config.core.dead_letter_queue_name,
        config.core.lease_timeout_seconds,
        config.core.max_message_bytes,
        retry_policy,
    );

    let machine = Arc::new(CoreMachine::new(
        JobTaskRepo::new(pool.clone()),
        StateManager::new(pool),
        registry,
        job_queue,
        task_queue,
        Arc::new(MemoryBlobStore::new()),
        config.core.clone(),
    ));

    let worker = MachineWorker::new(
        machine,
        config.poll_interval.0,
        config.max_concurrent_messages,
        worker_liveness,
    );

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = attach(router, metrics_handle);
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    worker.run().await;
}

pub async fn index() -> &'static str {
    "coremachine worker"
}
