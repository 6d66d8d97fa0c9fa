//! Core engine for the Tessera reactive notebook kernel.
//!
//! This crate provides:
//! - The cell model and static analysis of cell source
//! - The dependency graph with conflict and cycle detection
//! - Execution planning in dependency order
//! - The cell runtime and the shared namespace
//! - A sequential runner with per-subtree failure isolation

pub mod error;
pub mod execute;
pub mod graph;
pub mod plan;
pub mod runtime;

pub use error::{Error, Result};
pub use execute::{
    AbortHandle, CellError, ExecutionCallback, ExecutionSlot, RunResult, RunStatus, Runner,
};
pub use graph::{Cell, CellId, CellStatus, DependencyGraph, GraphChange};
pub use plan::{ExecutionPlan, plan};
pub use runtime::{ExecError, ExecErrorKind, Namespace, RuntimeConfig, Value};
