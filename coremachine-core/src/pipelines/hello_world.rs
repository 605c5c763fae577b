//! The reference two-stage pipeline: fan out N greeters, then one replier
//! per greeting. Small enough to read in one sitting, but it exercises the
//! whole kernel: fan-out, cross-stage data flow and final aggregation.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::registry::{
    FinalizeContext, Handler, HandlerFailure, HandlerRegistry, JobSpec, SpecError,
};
use crate::types::{StageAggregate, TaskDefinition};

pub const JOB_TYPE: &str = "hello_world";

#[derive(Deserialize)]
struct HelloWorldParams {
    n: u64,
    message: String,
}

pub struct HelloWorldSpec;

impl JobSpec for HelloWorldSpec {
    fn job_type(&self) -> &str {
        JOB_TYPE
    }

    fn total_stages(&self) -> u32 {
        2
    }

    fn validate_parameters(&self, parameters: &Value) -> Result<(), SpecError> {
        let params: HelloWorldParams = serde_json::from_value(parameters.clone())
            .map_err(|e| SpecError::InvalidParameters(e.to_string()))?;
        if params.n == 0 {
            return Err(SpecError::InvalidParameters("n must be at least 1".to_owned()));
        }
        Ok(())
    }

    fn create_tasks_for_stage(
        &self,
        stage: u32,
        parameters: &Value,
        prior: Option<&StageAggregate>,
    ) -> Result<Vec<TaskDefinition>, SpecError> {
        let params: HelloWorldParams = serde_json::from_value(parameters.clone())
            .map_err(|e| SpecError::InvalidParameters(e.to_string()))?;

        match stage {
            1 => Ok((0..params.n)
                .map(|k| {
                    TaskDefinition::new(
                        "hello_world.greet",
                        k.to_string(),
                        json!({"k": k, "message": params.message}),
                    )
                })
                .collect()),
            2 => {
                let prior = prior.ok_or_else(|| {
                    SpecError::Planning("stage 2 needs the stage 1 greetings".to_owned())
                })?;
                Ok(prior
                    .results
                    .iter()
                    .map(|(index, result)| {
                        TaskDefinition::new(
                            "hello_world.reply",
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
        let total_greetings = context.stage_results["2"]["completed"].as_u64().unwrap_or(0);
        Ok(json!({"total_greetings": total_greetings}))
    }
}

struct GreetHandler;

#[async_trait]
impl Handler for GreetHandler {
    async fn execute(&self, parameters: &Value) -> Result<Value, HandlerFailure> {
        let k = parameters["k"]
            .as_u64()
            .ok_or_else(|| HandlerFailure::new("k must be an integer"))?;
        let message = parameters["message"]
            .as_str()
            .ok_or_else(|| HandlerFailure::new("message must be a string"))?;
        Ok(json!({"greeting": format!("{} #{}", message, k)}))
    }
}

struct ReplyHandler;

#[async_trait]
impl Handler for ReplyHandler {
    async fn execute(&self, parameters: &Value) -> Result<Value, HandlerFailure> {
        let greeting = parameters["greeting"]
            .as_str()
            .ok_or_else(|| HandlerFailure::new("greeting must be a string"))?;
        Ok(json!({"reply": format!("re: {}", greeting)}))
    }
}

pub fn register(registry: &mut HandlerRegistry) {
    registry.register_spec(Arc::new(HelloWorldSpec));
    registry.register_handler("hello_world.greet", Arc::new(GreetHandler));
    registry.register_handler("hello_world.reply", Arc::new(ReplyHandler));
}
