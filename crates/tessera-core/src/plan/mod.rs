//! Execution planning.

mod planner;

pub use planner::{ExecutionPlan, plan};
