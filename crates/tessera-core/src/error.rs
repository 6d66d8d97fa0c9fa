//! Error types for tessera-core.

use thiserror::Error;

use crate::graph::CellId;

/// Result type for tessera-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tessera-core.
///
/// Per-cell failures (execution errors, conflicts) are not represented here;
/// they are recorded on the cell as a [`CellError`](crate::execute::CellError)
/// and never abort the caller.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// A request referenced a cell that is not in the graph.
    #[error("cell not found: {0}")]
    UnknownCell(CellId),

    /// Enabled cells form a dependency cycle; the whole plan is rejected.
    #[error("cyclic dependency detected: {}", format_cycle(cycle))]
    CyclicDependency {
        /// Cells on the cycle, in edge order.
        cycle: Vec<CellId>,
        /// Cycle members plus affected cells reachable through the cycle.
        implicated: Vec<CellId>,
        /// Affected cells that did not run only because the plan failed.
        blocked: Vec<CellId>,
    },

    /// Internal graph state is inconsistent. Fatal for the owning session.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

fn format_cycle(cycle: &[CellId]) -> String {
    let mut names: Vec<String> = cycle.iter().map(|id| id.to_string()).collect();
    if let Some(first) = names.first().cloned() {
        names.push(first);
    }
    names.join(" → ")
}
