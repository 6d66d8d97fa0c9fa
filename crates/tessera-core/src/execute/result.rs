//! Per-cell run results and diagnostics.

use serde::{Deserialize, Serialize};

use crate::graph::CellId;
use crate::runtime::{ExecError, Value};

/// Final status of one cell within a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Ok,
    Error,
    /// Stopped by an explicit interrupt request.
    Interrupted,
    /// Not run because an ancestor in the same plan failed.
    Cancelled,
    /// Not run because the cell is disabled or downstream of a disabled cell.
    Skipped,
}

/// Condition recorded on a cell and carried by its run result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CellError {
    /// The cell defines names that another enabled cell also defines.
    #[error("multiply defined name(s) {}: also defined by {}", names.join(", "), join_ids(cells))]
    MultipleDefinition {
        names: Vec<String>,
        cells: Vec<CellId>,
    },

    /// The cell is on, or downstream of, a dependency cycle.
    #[error("cell is part of a dependency cycle: {}", join_ids(cycle))]
    Cycle { cycle: Vec<CellId> },

    #[error("{0}")]
    Execution(ExecError),

    #[error("execution interrupted")]
    Interrupted,

    /// An ancestor failed earlier in the same plan.
    #[error("not run: ancestor {cause} failed")]
    Cancelled { cause: CellId },
}

fn join_ids(ids: &[CellId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result of one cell within a plan, streamed to the caller as soon as the
/// cell finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub cell_id: CellId,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CellError>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    /// Wall time in milliseconds.
    pub elapsed_ms: f64,
}

impl RunResult {
    pub fn new(cell_id: CellId, status: RunStatus) -> Self {
        Self {
            cell_id,
            status,
            output: None,
            error: None,
            stdout: String::new(),
            elapsed_ms: 0.0,
        }
    }

    pub fn with_error(mut self, error: CellError) -> Self {
        self.error = Some(error);
        self
    }

    /// Whether descendants of this cell must be cancelled.
    pub fn is_failure(&self) -> bool {
        matches!(self.status, RunStatus::Error | RunStatus::Interrupted)
    }
}
