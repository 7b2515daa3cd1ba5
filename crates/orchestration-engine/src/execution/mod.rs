//! Run-time execution state: statuses, node and plan executions, and the
//! repositories that persist them.

mod executable;
mod node_execution;
mod plan_execution;
pub mod repository;
mod status;

pub use executable::{
    ChildrenMode, ExecutableResponse, ExecutionMode, FailureInfo, FailureType, ResponseMap,
    StepResponse,
};
pub use node_execution::NodeExecution;
pub use plan_execution::PlanExecution;
pub use repository::{
    InMemoryNodeExecutionRepository, InMemoryPlanExecutionRepository, NodeExecutionRepository,
    PlanExecutionRepository,
};
pub use status::Status;
