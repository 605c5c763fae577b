use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::postgres::PgPool;

use coremachine_core::{
    BlobStore, CoreConfig, CoreMachine, FinalizeContext, Handler, HandlerFailure,
    HandlerRegistry, JobSpec, JobTaskRepo, MemoryBlobStore, MessageQueue, RetryPolicy,
    SpecError, StageAggregate, StateManager, TaskDefinition,
};

pub const GREETING_PIPELINE: &str = "greeting_pipeline";
pub const FLAKY_PIPELINE: &str = "flaky_pipeline";
pub const SPARSE_PIPELINE: &str = "sparse_pipeline";
pub const CHUNK_PIPELINE: &str = "chunk_pipeline";
pub const OVERSIZE_PIPELINE: &str = "oversize_pipeline";

#[derive(Deserialize)]
struct GreetingParams {
    count: u64,
    message: String,
}

/// Two stages: fan out `count` greeters, then one replier per greeting.
pub struct GreetingPipeline;

impl JobSpec for GreetingPipeline {
    fn job_type(&self) -> &str {
        GREETING_PIPELINE
    }

    fn total_stages(&self) -> u32 {
        2
    }

    fn validate_parameters(&self, parameters: &Value) -> Result<(), SpecError> {
        serde_json::from_value::<GreetingParams>(parameters.clone())
            .map(|_| ())
            .map_err(|e| SpecError::InvalidParameters(e.to_string()))
    }

    fn create_tasks_for_stage(
        &self,
        stage: u32,
        parameters: &Value,
        prior: Option<&StageAggregate>,
    ) -> Result<Vec<TaskDefinition>, SpecError> {
        let params: GreetingParams = serde_json::from_value(parameters.clone())
            .map_err(|e| SpecError::InvalidParameters(e.to_string()))?;

        match stage {
            1 => Ok((0..params.count)
                .map(|k| {
                    TaskDefinition::new(
                        "greet",
                        k.to_string(),
                        json!({"k": k, "message": params.message}),
                    )
                })
                .collect()),
            2 => {
                let prior = prior.ok_or_else(|| {
                    SpecError::Planning("stage 2 requires stage 1 results".to_owned())
                })?;
                Ok(prior
                    .results
                    .iter()
                    .map(|(index, result)| {
                        TaskDefinition::new(
                            "reply",
                            index.clone(),
                            json!({"greeting": result["greeting"]}),
                        )
                    })
                    .collect())
            }
            other => Err(SpecError::Planning(format!("unexpected stage {}", other))),
        }
    }

    fn finalize(&self, context: FinalizeContext) -> Result<Value, SpecError> {
        let replies = context.stage_results["2"]["completed"].as_u64().unwrap_or(0);
        Ok(json!({"total_greetings": replies}))
    }
}

/// One stage of tasks that always fail, to exercise retry and dead-letter.
pub struct FlakyPipeline;

impl JobSpec for FlakyPipeline {
    fn job_type(&self) -> &str {
        FLAKY_PIPELINE
    }

    fn total_stages(&self) -> u32 {
        1
    }

    fn validate_parameters(&self, _parameters: &Value) -> Result<(), SpecError> {
        Ok(())
    }

    fn create_tasks_for_stage(
        &self,
        _stage: u32,
        parameters: &Value,
        _prior: Option<&StageAggregate>,
    ) -> Result<Vec<TaskDefinition>, SpecError> {
        let count = parameters["count"].as_u64().unwrap_or(1);
        Ok((0..count)
            .map(|k| TaskDefinition::new("always_fail", k.to_string(), json!({"k": k})))
            .collect())
    }

    fn finalize(&self, context: FinalizeContext) -> Result<Value, SpecError> {
        Ok(json!({"failed": context.tasks_failed}))
    }
}

/// Stage 1 produces no tasks at all; stage 2 has a single greeter. Exercises
/// immediate advancement of an empty stage.
pub struct SparsePipeline;

impl JobSpec for SparsePipeline {
    fn job_type(&self) -> &str {
        SPARSE_PIPELINE
    }

    fn total_stages(&self) -> u32 {
        2
    }

    fn validate_parameters(&self, _parameters: &Value) -> Result<(), SpecError> {
        Ok(())
    }

    fn create_tasks_for_stage(
        &self,
        stage: u32,
        _parameters: &Value,
        _prior: Option<&StageAggregate>,
    ) -> Result<Vec<TaskDefinition>, SpecError> {
        match stage {
            1 => Ok(vec![]),
            _ => Ok(vec![TaskDefinition::new(
                "greet",
                "only",
                json!({"k": 0, "message": "sparse"}),
            )]),
        }
    }

    fn finalize(&self, context: FinalizeContext) -> Result<Value, SpecError> {
        Ok(json!({"completed": context.tasks_completed}))
    }
}

/// Three stages: prepare -> fan out one loader per chunk -> summarize.
/// Chunks listed in `fail_chunks` fail their loader.
pub struct ChunkPipeline;

impl JobSpec for ChunkPipeline {
    fn job_type(&self) -> &str {
        CHUNK_PIPELINE
    }

    fn total_stages(&self) -> u32 {
        3
    }

    fn validate_parameters(&self, parameters: &Value) -> Result<(), SpecError> {
        if parameters["chunks"].as_u64().is_none() {
            return Err(SpecError::InvalidParameters(
                "chunks must be a positive integer".to_owned(),
            ));
        }
        Ok(())
    }

    fn create_tasks_for_stage(
        &self,
        stage: u32,
        parameters: &Value,
        prior: Option<&StageAggregate>,
    ) -> Result<Vec<TaskDefinition>, SpecError> {
        match stage {
            1 => Ok(vec![TaskDefinition::new(
                "prepare",
                "prepare",
                parameters.clone(),
            )]),
            2 => {
                let prior = prior.ok_or_else(|| {
                    SpecError::Planning("stage 2 requires the prepare result".to_owned())
                })?;
                let chunk_ids = prior.results["prepare"]["chunk_ids"]
                    .as_array()
                    .cloned()
                    .unwrap_or_default();
                let fail_chunks = parameters["fail_chunks"]
                    .as_array()
                    .cloned()
                    .unwrap_or_default();
                Ok(chunk_ids
                    .iter()
                    .map(|chunk_id| {
                        let fail = fail_chunks.contains(chunk_id);
                        TaskDefinition::new(
                            "load_chunk",
                            format!("chunk_{}", chunk_id),
                            json!({"chunk_id": chunk_id, "fail": fail}),
                        )
                    })
                    .collect())
            }
            _ => Ok(vec![TaskDefinition::new(
                "summarize",
                "summarize",
                json!({}),
            )]),
        }
    }

    fn finalize(&self, context: FinalizeContext) -> Result<Value, SpecError> {
        let failed = context.stage_results["2"]["failed"].as_u64().unwrap_or(0);
        Ok(json!({"chunks_failed": failed}))
    }
}

/// Single task whose handler result exceeds any small message budget.
pub struct OversizePipeline;

impl JobSpec for OversizePipeline {
    fn job_type(&self) -> &str {
        OVERSIZE_PIPELINE
    }

    fn total_stages(&self) -> u32 {
        1
    }

    fn validate_parameters(&self, _parameters: &Value) -> Result<(), SpecError> {
        Ok(())
    }

    fn create_tasks_for_stage(
        &self,
        _stage: u32,
        parameters: &Value,
        _prior: Option<&StageAggregate>,
    ) -> Result<Vec<TaskDefinition>, SpecError> {
        Ok(vec![TaskDefinition::new(
            "big_result",
            "0",
            parameters.clone(),
        )])
    }

    fn finalize(&self, context: FinalizeContext) -> Result<Value, SpecError> {
        Ok(json!({"completed": context.tasks_completed}))
    }
}

struct GreetHandler;

#[async_trait]
impl Handler for GreetHandler {
    async fn execute(&self, parameters: &Value) -> Result<Value, HandlerFailure> {
        let k = parameters["k"].as_u64().unwrap_or(0);
        let message = parameters["message"].as_str().unwrap_or("hi");
        Ok(json!({"greeting": format!("{} #{}", message, k)}))
    }
}

struct ReplyHandler;

#[async_trait]
impl Handler for ReplyHandler {
    async fn execute(&self, parameters: &Value) -> Result<Value, HandlerFailure> {
        let greeting = parameters["greeting"].as_str().unwrap_or("");
        Ok(json!({"reply": format!("re: {}", greeting)}))
    }
}

struct AlwaysFailHandler;

#[async_trait]
impl Handler for AlwaysFailHandler {
    async fn execute(&self, _parameters: &Value) -> Result<Value, HandlerFailure> {
        Err(HandlerFailure::new("this handler always fails"))
    }
}

struct PrepareHandler;

#[async_trait]
impl Handler for PrepareHandler {
    async fn execute(&self, parameters: &Value) -> Result<Value, HandlerFailure> {
        let chunks = parameters["chunks"].as_u64().unwrap_or(0);
        let chunk_ids: Vec<u64> = (0..chunks).collect();
        Ok(json!({"chunk_ids": chunk_ids, "chunk_count": chunks}))
    }
}

struct LoadChunkHandler;

#[async_trait]
impl Handler for LoadChunkHandler {
    async fn execute(&self, parameters: &Value) -> Result<Value, HandlerFailure> {
        if parameters["fail"].as_bool().unwrap_or(false) {
            return Err(HandlerFailure::new(format!(
                "chunk {} could not be loaded",
                parameters["chunk_id"]
            )));
        }
        Ok(json!({"loaded": parameters["chunk_id"]}))
    }
}

struct SummarizeHandler;

#[async_trait]
impl Handler for SummarizeHandler {
    async fn execute(&self, _parameters: &Value) -> Result<Value, HandlerFailure> {
        Ok(json!({"summary": "ok"}))
    }
}

struct BigResultHandler;

#[async_trait]
impl Handler for BigResultHandler {
    async fn execute(&self, parameters: &Value) -> Result<Value, HandlerFailure> {
        let size = parameters["size"].as_u64().unwrap_or(4096) as usize;
        Ok(json!({"payload": "x".repeat(size)}))
    }
}

pub fn test_registry() -> Arc<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    registry.register_spec(Arc::new(GreetingPipeline));
    registry.register_spec(Arc::new(FlakyPipeline));
    registry.register_spec(Arc::new(SparsePipeline));
    registry.register_spec(Arc::new(ChunkPipeline));
    registry.register_spec(Arc::new(OversizePipeline));
    registry.register_handler("greet", Arc::new(GreetHandler));
    registry.register_handler("reply", Arc::new(ReplyHandler));
    registry.register_handler("always_fail", Arc::new(AlwaysFailHandler));
    registry.register_handler("prepare", Arc::new(PrepareHandler));
    registry.register_handler("load_chunk", Arc::new(LoadChunkHandler));
    registry.register_handler("summarize", Arc::new(SummarizeHandler));
    registry.register_handler("big_result", Arc::new(BigResultHandler));
    Arc::new(registry)
}

/// Retries become visible immediately so the pump loop can drain them.
pub fn immediate_retry_policy() -> RetryPolicy {
    RetryPolicy::new(0, std::time::Duration::ZERO, None)
}

pub fn queue_pair(db: &PgPool, config: &CoreConfig) -> (MessageQueue, MessageQueue) {
    let job_queue = MessageQueue::new(
        db.clone(),
        &config.job_queue_name,
        &config.dead_letter_queue_name,
        config.lease_timeout_seconds,
        config.max_message_bytes,
        immediate_retry_policy(),
    );
    let task_queue = MessageQueue::new(
        db.clone(),
        &config.task_queue_name,
        &config.dead_letter_queue_name,
        config.lease_timeout_seconds,
        config.max_message_bytes,
        immediate_retry_policy(),
    );
    (job_queue, task_queue)
}

pub fn build_machine_with_blobs(
    db: &PgPool,
    config: CoreConfig,
    blobs: Arc<dyn BlobStore>,
) -> CoreMachine {
    let repo = JobTaskRepo::new(db.clone());
    let state = StateManager::new(db.clone());
    let (job_queue, task_queue) = queue_pair(db, &config);
    CoreMachine::new(
        repo,
        state,
        test_registry(),
        job_queue,
        task_queue,
        blobs,
        config,
    )
}

pub fn build_machine(db: &PgPool, config: CoreConfig) -> CoreMachine {
    build_machine_with_blobs(db, config, Arc::new(MemoryBlobStore::new()))
}

/// Drain both queues until neither has a visible message left.
pub async fn pump(machine: &CoreMachine) {
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

/// Messages currently sitting on a queue, visible or not.
pub async fn queue_size(db: &PgPool, queue: &str) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM queue_message WHERE queue = $1")
        .bind(queue)
        .fetch_one(db)
        .await
        .expect("failed to count queue messages")
}
