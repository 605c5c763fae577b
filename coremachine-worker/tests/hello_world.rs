//! The reference pipeline, driven end to end the way the worker loops
//! drive it: one message at a time until both queues drain.

use std::sync::Arc;

use serde_json::json;
use sqlx::postgres::PgPool;

use coremachine_core::{
    pipelines, CoreConfig, CoreMachine, HandlerRegistry, JobStatus, JobTaskRepo,
    MemoryBlobStore, MessageQueue, RetryPolicy, StateManager, TaskStatus,
};

fn build_machine(db: &PgPool) -> CoreMachine {
    let config = CoreConfig::default();

    let mut registry = HandlerRegistry::new();
    pipelines::register_builtin(&mut registry);

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

    CoreMachine::new(
        JobTaskRepo::new(db.clone()),
        StateManager::new(db.clone()),
        Arc::new(registry),
        job_queue,
        task_queue,
        Arc::new(MemoryBlobStore::new()),
        config,
    )
}

async fn pump(machine: &CoreMachine) {
    loop {
        let handled_job = machine
            .process_job_queue()
            .await
            .expect("failed to process job queue");
        let handled_task = machine
            .process_task_queue()
            .await
            .expect("failed to process task queue");
        if !handled_job && !handled_task {
            break;
        }
    }
}

#[sqlx::test(migrations = "../coremachine-core/migrations")]
async fn test_hello_world_two_stage_run(db: PgPool) {
    let machine = build_machine(&db);

    let (job, already_exists) = machine
        .submit(pipelines::hello_world::JOB_TYPE, &json!({"n": 3, "message": "hi"}))
        .await
        .expect("failed to submit");
    assert!(!already_exists);

    pump(&machine).await;

    let job = machine
        .repo()
        .get_job(&job.job_id)
        .await
        .unwrap()
        .expect("job exists");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result_data, Some(json!({"total_greetings": 3})));

    // Three greeters with indices 0, 1, 2.
    let stage_one = machine.repo().list_tasks(&job.job_id, Some(1)).await.unwrap();
    assert_eq!(stage_one.len(), 3);
    let indices: Vec<&str> = stage_one.iter().map(|t| t.task_index.as_str()).collect();
    assert_eq!(indices, vec!["0", "1", "2"]);
    for (k, task) in stage_one.iter().enumerate() {
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(
            task.result_data,
            Some(json!({"greeting": format!("hi #{}", k)}))
        );
    }

    // Each reply consumed its predecessor's greeting.
    let stage_two = machine.repo().list_tasks(&job.job_id, Some(2)).await.unwrap();
    assert_eq!(stage_two.len(), 3);
    for (k, task) in stage_two.iter().enumerate() {
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(
            task.result_data,
            Some(json!({"reply": format!("re: hi #{}", k)}))
        );
    }
}

#[sqlx::test(migrations = "../coremachine-core/migrations")]
async fn test_hello_world_rejects_invalid_parameters(db: PgPool) {
    let machine = build_machine(&db);

    let error = machine
        .submit(pipelines::hello_world::JOB_TYPE, &json!({"message": "hi"}))
        .await
        .expect_err("submission should fail validation");
    assert!(error.to_string().contains("invalid parameters"));

    let jobs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job")
        .fetch_one(&db)
        .await
        .unwrap();
    assert_eq!(jobs, 0);
}
