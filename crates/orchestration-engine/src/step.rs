//! Step contract and registry
//!
//! A [`Step`] is the business logic behind a step type. The engine only ever
//! talks to it through this trait: start it, resume it with correlation
//! responses, ask a task chain for its next link, and hand it the results of
//! its child branches.
//!
//! # Usage
//!
//! ```ignore
//! let mut steps = StepRegistry::new();
//! steps.register_sync("ECHO", |_ambiance, params| Ok(StepResponse::success(params.clone())));
//! steps.register_callback("DEPLOY", |_ambiance, params| async move {
//!     Ok(ExecutableResponse::task("k8s-apply", params))
//! });
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::ambiance::Ambiance;
use crate::error::{EngineError, Result};
use crate::execution::{
    ExecutableResponse, FailureInfo, FailureType, ResponseMap, Status, StepResponse,
};

/// Business logic for one step type.
#[async_trait]
pub trait Step: Send + Sync {
    /// Begin executing the step.
    async fn start(&self, ambiance: &Ambiance, parameters: &Value) -> Result<ExecutableResponse>;

    /// Finish an async or task step once every correlation id has answered.
    async fn resume(
        &self,
        _ambiance: &Ambiance,
        _parameters: &Value,
        responses: &ResponseMap,
    ) -> Result<StepResponse> {
        Ok(response_from_correlations(responses))
    }

    /// Produce the next link of a task chain from the previous link's responses.
    async fn next_link(
        &self,
        ambiance: &Ambiance,
        parameters: &Value,
        _pass_through: &Value,
        responses: &ResponseMap,
    ) -> Result<ExecutableResponse> {
        Ok(ExecutableResponse::Sync(
            self.resume(ambiance, parameters, responses).await?,
        ))
    }

    /// Called once the fan-out wait releases, with the status of every
    /// finished branch keyed by branch root plan node id.
    async fn on_children_finished(
        &self,
        _ambiance: &Ambiance,
        _parameters: &Value,
        child_results: &HashMap<String, Status>,
    ) -> Result<StepResponse> {
        Ok(response_from_children(child_results))
    }

    /// The node is being aborted.
    async fn on_abort(&self, _ambiance: &Ambiance, _parameters: &Value) -> Result<()> {
        Ok(())
    }
}

/// Interpret correlation responses.
///
/// Responses that parse as a [`StepResponse`] are honored and the first broken
/// one wins; anything else counts as success and is kept as output.
pub fn response_from_correlations(responses: &ResponseMap) -> StepResponse {
    let mut ids: Vec<&String> = responses.keys().collect();
    ids.sort();
    for id in &ids {
        if let Ok(response) = serde_json::from_value::<StepResponse>(responses[*id].clone()) {
            if !response.is_success() {
                return response;
            }
        }
    }
    let output = ids
        .into_iter()
        .map(|id| (id.clone(), responses[id].clone()))
        .collect::<serde_json::Map<_, _>>();
    StepResponse::success(Value::Object(output))
}

/// Aggregate branch results into the parent's response.
pub fn response_from_children(child_results: &HashMap<String, Status>) -> StepResponse {
    let status = Status::aggregate(child_results.values().copied());
    if status.is_broken() {
        let mut failed: Vec<&str> = child_results
            .iter()
            .filter(|(_, s)| s.is_broken())
            .map(|(id, _)| id.as_str())
            .collect();
        failed.sort_unstable();
        StepResponse::with_status(
            status,
            Some(FailureInfo::new(
                format!("Child branches did not succeed: {}", failed.join(", ")),
                FailureType::ApplicationError,
            )),
        )
    } else {
        StepResponse::success(serde_json::to_value(child_results).unwrap_or(Value::Null))
    }
}

type StepCallback = Box<
    dyn Fn(Ambiance, Value) -> Pin<Box<dyn Future<Output = Result<ExecutableResponse>> + Send>>
        + Send
        + Sync,
>;

/// Async callback-backed step.
pub struct CallbackStep {
    callback: StepCallback,
}

impl CallbackStep {
    pub fn new<F, Fut>(callback: F) -> Self
    where
        F: Fn(Ambiance, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ExecutableResponse>> + Send + 'static,
    {
        Self {
            callback: Box::new(move |ambiance, parameters| Box::pin(callback(ambiance, parameters))),
        }
    }
}

#[async_trait]
impl Step for CallbackStep {
    async fn start(&self, ambiance: &Ambiance, parameters: &Value) -> Result<ExecutableResponse> {
        (self.callback)(ambiance.clone(), parameters.clone()).await
    }
}

/// Synchronous callback-backed step that always completes inline.
pub struct SyncCallbackStep {
    callback: Box<dyn Fn(&Ambiance, &Value) -> Result<StepResponse> + Send + Sync>,
}

impl SyncCallbackStep {
    pub fn new(
        callback: impl Fn(&Ambiance, &Value) -> Result<StepResponse> + Send + Sync + 'static,
    ) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }
}

#[async_trait]
impl Step for SyncCallbackStep {
    async fn start(&self, ambiance: &Ambiance, parameters: &Value) -> Result<ExecutableResponse> {
        (self.callback)(ambiance, parameters).map(ExecutableResponse::Sync)
    }
}

/// Maps step types to their implementations.
#[derive(Default)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<dyn Step>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, step_type: impl Into<String>, step: Arc<dyn Step>) {
        let step_type = step_type.into();
        if self.steps.insert(step_type.clone(), step).is_some() {
            log::warn!("Step type '{}' registered twice; keeping the latest", step_type);
        }
    }

    /// Register a step backed by an async closure.
    pub fn register_callback<F, Fut>(&mut self, step_type: impl Into<String>, callback: F)
    where
        F: Fn(Ambiance, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ExecutableResponse>> + Send + 'static,
    {
        self.register(step_type, Arc::new(CallbackStep::new(callback)));
    }

    /// Register a step backed by a synchronous closure.
    pub fn register_sync(
        &mut self,
        step_type: impl Into<String>,
        callback: impl Fn(&Ambiance, &Value) -> Result<StepResponse> + Send + Sync + 'static,
    ) {
        self.register(step_type, Arc::new(SyncCallbackStep::new(callback)));
    }

    pub fn get(&self, step_type: &str) -> Result<Arc<dyn Step>> {
        self.steps
            .get(step_type)
            .cloned()
            .ok_or_else(|| EngineError::NoStep(step_type.to_string()))
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.steps.contains_key(step_type)
    }

    pub fn step_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.steps.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}
