use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::types::{StageAggregate, TaskDefinition};

/// Errors a JobSpec can raise while validating, planning or finalizing.
#[derive(Error, Debug)]
pub enum SpecError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("stage planning failed: {0}")]
    Planning(String),
    #[error("finalize failed: {0}")]
    Finalize(String),
}

/// A handler failure, recorded on the task row and fed to the retry pipeline.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HandlerFailure {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl HandlerFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(message: impl Into<String>, details: Value) -> Self {
        Self {
            message: message.into(),
            details: Some(details),
        }
    }
}

/// A named unit of work the kernel can dispatch. Handlers are synchronous
/// from the kernel's view: one call, one result, no kernel-visible
/// intermediate state.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn execute(&self, parameters: &Value) -> Result<Value, HandlerFailure>;
}

/// Everything `finalize` needs to compute the job's result_data. Counts are
/// across all stages of the job.
pub struct FinalizeContext<'a> {
    pub job_id: &'a str,
    pub parameters: &'a Value,
    pub stage_results: &'a Value,
    pub tasks_completed: i64,
    pub tasks_failed: i64,
}

/// Code definition of a job_type: stage count, parameter validation, the
/// task factory per stage and the final aggregation.
pub trait JobSpec: Send + Sync {
    fn job_type(&self) -> &str;

    fn total_stages(&self) -> u32;

    fn validate_parameters(&self, parameters: &Value) -> Result<(), SpecError>;

    /// Produce the task set for `stage`. `prior` is the aggregate of stage-1
    /// (None when stage == 1). Must be deterministic: the same inputs yield
    /// the same task indices, so a crashed partial enqueue can resume.
    fn create_tasks_for_stage(
        &self,
        stage: u32,
        parameters: &Value,
        prior: Option<&StageAggregate>,
    ) -> Result<Vec<TaskDefinition>, SpecError>;

    fn finalize(&self, context: FinalizeContext) -> Result<Value, SpecError>;
}

/// Process-wide lookup from job_type to JobSpec and task_type to Handler.
/// Populated once at startup and read-only afterwards; lookup failures at
/// dispatch time dead-letter the message.
#[derive(Default)]
pub struct HandlerRegistry {
    job_specs: HashMap<String, Arc<dyn JobSpec>>,
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_spec(&mut self, spec: Arc<dyn JobSpec>) {
        self.job_specs.insert(spec.job_type().to_owned(), spec);
    }

    pub fn register_handler(&mut self, task_type: &str, handler: Arc<dyn Handler>) {
        self.handlers.insert(task_type.to_owned(), handler);
    }

    pub fn job_spec(&self, job_type: &str) -> Option<Arc<dyn JobSpec>> {
        self.job_specs.get(job_type).cloned()
    }

    pub fn handler(&self, task_type: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn job_types(&self) -> Vec<&str> {
        self.job_specs.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoHandler;

    #[async_trait]
    impl Handler for EchoHandler {
        async fn execute(&self, parameters: &Value) -> Result<Value, HandlerFailure> {
            Ok(parameters.clone())
        }
    }

    struct NoopSpec;

    impl JobSpec for NoopSpec {
        fn job_type(&self) -> &str {
            "noop"
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
            _parameters: &Value,
            _prior: Option<&StageAggregate>,
        ) -> Result<Vec<TaskDefinition>, SpecError> {
            Ok(vec![])
        }

        fn finalize(&self, _context: FinalizeContext) -> Result<Value, SpecError> {
            Ok(json!({}))
        }
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let mut registry = HandlerRegistry::new();
        registry.register_spec(Arc::new(NoopSpec));
        registry.register_handler("echo", Arc::new(EchoHandler));

        assert!(registry.job_spec("noop").is_some());
        assert!(registry.job_spec("missing").is_none());

        let handler = registry.handler("echo").expect("handler not registered");
        let result = handler.execute(&json!({"a": 1})).await.expect("failed");
        assert_eq!(result, json!({"a": 1}));
        assert!(registry.handler("missing").is_none());
    }
}
