//! Plan execution.
//!
//! - `context` - Execution slot, abort handle and progress callbacks
//! - `result` - Per-cell run results and diagnostics
//! - `runner` - Sequential runner for execution plans

mod context;
mod result;
mod runner;

pub use context::{AbortHandle, ExecutionCallback, ExecutionSlot, SlotGuard};
pub use result::{CellError, RunResult, RunStatus};
pub use runner::Runner;
