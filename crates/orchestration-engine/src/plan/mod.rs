//! Static plan model: nodes, wiring, validation and storage.

pub mod builder;
pub mod store;
pub mod types;
pub mod validation;

pub use builder::PlanBuilder;
pub use store::{PlanMetadata, PlanStore, SCHEMA_VERSION};
pub use types::{
    Obtainment, Plan, PlanNode, PlanNodeId, SkipCondition, BARRIER_REF_PARAM, BARRIER_STEP_TYPE,
};
pub use validation::{
    validate_plan, PlanRegistries, ValidationError, ValidationReport, ValidationWarning,
};
