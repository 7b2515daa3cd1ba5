//! Orchestration Engine - plan execution for pipelines
//!
//! This crate runs pipeline plans: directed graphs of typed steps that are
//! instantiated as node executions and driven to completion. It supports:
//!
//! - Sync, async-callback, delegated-task and task-chain steps
//! - Fan-out to child branches, with ALL or MIN(n) completion
//! - Advisers deciding what happens after each step (retry, ignore, abort,
//!   manual intervention, rollback, ...)
//! - Absolute and activity-based timeouts
//! - Barriers that synchronise parallel branches
//! - Operator interrupts (abort, pause, resume, mark success/failed, ...)
//!
//! # Architecture
//!
//! - [`plan`]: immutable plan definitions, the fluent [`PlanBuilder`] and
//!   validation
//! - [`execution`]: node/plan execution state, the status machine and the
//!   repository seams
//! - [`facilitator`], [`adviser`], [`timeout`]: pluggable registries consulted
//!   around each step
//! - [`barrier`], [`waiter`]: rendezvous and correlation bookkeeping
//! - [`engine`]: the [`OrchestrationEngine`] tying it all together
//! - [`events`]: generic event streaming via [`EventSink`]
//!
//! # Example
//!
//! ```ignore
//! use orchestration_engine::{OrchestrationEngine, PlanBuilder, StepResponse};
//!
//! let engine = OrchestrationEngine::builder()
//!     .with_sync_step("ECHO", |_ambiance, params| Ok(StepResponse::success(params.clone())))
//!     .build();
//! let plan = PlanBuilder::new("hello").add_node("echo", "ECHO").build();
//! let plan_execution_id = engine.start_plan(plan, Default::default()).await?;
//! ```

pub mod adviser;
pub mod ambiance;
pub mod barrier;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod events;
pub mod execution;
pub mod facilitator;
pub mod interrupt;
pub mod plan;
pub mod step;
pub mod timeout;
pub mod waiter;

// Re-export key types
pub use adviser::{Advise, Adviser, AdviserRegistry};
pub use ambiance::{Ambiance, Level};
pub use config::EngineConfig;
pub use dispatch::{TaskDispatcher, TaskRequest};
pub use engine::{EngineBuilder, OrchestrationEngine};
pub use error::{EngineError, Result};
pub use events::{EventSink, OrchestrationEvent};
pub use execution::{
    ChildrenMode, ExecutableResponse, ExecutionMode, FailureInfo, FailureType, NodeExecution,
    PlanExecution, Status, StepResponse,
};
pub use facilitator::{Facilitator, FacilitatorRegistry};
pub use interrupt::{Interrupt, InterruptState, InterruptType};
pub use plan::{Plan, PlanBuilder, PlanNode};
pub use step::{Step, StepRegistry};
pub use timeout::{TimeoutTracker, TimeoutTrackerRegistry};
pub use waiter::NotifyOutcome;
