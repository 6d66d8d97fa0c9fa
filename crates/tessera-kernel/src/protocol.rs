//! Request and message types exchanged with a kernel.
//!
//! Both directions are serde JSON objects tagged by `type`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tessera_core::execute::{CellError, RunResult};
use tessera_core::graph::{Cell, CellId, CellStatus};
use tessera_core::runtime::Value;

use crate::error::KernelResult;

/// Identifier assigned to every submitted request.
pub type RequestId = u64;

/// Requests accepted by the kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Create or update a cell, then run it and its descendants.
    SubmitEdit {
        cell_id: CellId,
        source: String,
        /// Leaves the current flag unchanged when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        disabled: Option<bool>,
    },

    /// Run cells and their descendants.
    RunCells { cell_ids: Vec<CellId> },

    /// Set a namespace binding from outside, as if a cell had defined it.
    SetValue { name: String, value: Value },

    /// Set several bindings at once and plan once for all of them.
    SetValues { bindings: BTreeMap<String, Value> },

    /// Remove a cell; its dependents become stale.
    DeleteCell { cell_id: CellId },

    /// Interrupt the running cell, if any.
    Interrupt,

    /// Run every stale cell.
    RunStale,

    /// Publish a snapshot of all cells and the namespace.
    GetState,
}

/// Messages published by the kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KernelMessage {
    /// A cell was added to the running plan.
    CellQueued { cell_id: CellId },

    /// A cell started executing.
    CellStarted { cell_id: CellId },

    /// A cell finished, was cancelled or was skipped.
    CellResult(RunResult),

    /// A cell changed status outside of a run (stale, conflict, cycle).
    CellStatus {
        cell_id: CellId,
        status: CellStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<CellError>,
    },

    /// Planning failed because of a dependency cycle; nothing ran.
    PlanFailed {
        cycle: Vec<CellId>,
        implicated: Vec<CellId>,
    },

    /// Snapshot of the session.
    State {
        cells: Vec<CellSnapshot>,
        namespace: BTreeMap<String, Value>,
    },

    /// A queued request has been fully processed.
    RequestCompleted { request_id: RequestId },

    /// A request was rejected without changing the session.
    RequestRejected { request_id: RequestId, error: String },

    /// The session loop stopped on an internal error.
    Fatal { message: String },
}

/// Client-facing view of one cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellSnapshot {
    pub cell_id: CellId,
    pub source: String,
    pub defs: Vec<String>,
    pub refs: Vec<String>,
    pub status: CellStatus,
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CellError>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout: String,
}

impl From<&Cell> for CellSnapshot {
    fn from(cell: &Cell) -> Self {
        Self {
            cell_id: cell.id().clone(),
            source: cell.source().to_string(),
            defs: cell.defs().iter().cloned().collect(),
            refs: cell.refs().iter().cloned().collect(),
            status: cell.status,
            disabled: cell.is_disabled(),
            output: cell.output.clone(),
            error: cell.error.clone(),
            stdout: cell.stdout.clone(),
        }
    }
}

impl Request {
    /// Parse one JSON request, as read from a JSON-lines stream.
    pub fn from_json(line: &str) -> KernelResult<Self> {
        Ok(serde_json::from_str(line)?)
    }
}

impl KernelMessage {
    /// Serialize to a single JSON line.
    pub fn to_json(&self) -> KernelResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Whether this message ends the request with the given id.
    pub fn completes(&self, id: RequestId) -> bool {
        match self {
            KernelMessage::RequestCompleted { request_id }
            | KernelMessage::RequestRejected { request_id, .. } => *request_id == id,
            _ => false,
        }
    }
}
