//! Identifier and status types shared by the graph, planner and runner.

use serde::{Deserialize, Serialize};

/// Stable, opaque identifier of a cell.
///
/// Identifiers are chosen by the caller when a cell is first submitted and
/// stay the same across edits of that logical cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellId(String);

impl CellId {
    /// Prefix that marks the identifier of a synthetic (value-injection) cell.
    pub const SYNTHETIC_PREFIX: &str = "@set:";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier of the phantom producer cell for an externally set binding.
    pub fn synthetic(name: &str) -> Self {
        Self(format!("{}{}", Self::SYNTHETIC_PREFIX, name))
    }

    pub fn is_synthetic(&self) -> bool {
        self.0.starts_with(Self::SYNTHETIC_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CellId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CellId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for CellId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Lifecycle status of a cell.
///
/// `idle → queued → running → {idle, errored}`; `stale` is reachable from any
/// state when an ancestor changed without the cell being re-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellStatus {
    #[default]
    Idle,
    Queued,
    Running,
    Errored,
    Stale,
}

impl std::fmt::Display for CellStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CellStatus::Idle => "idle",
            CellStatus::Queued => "queued",
            CellStatus::Running => "running",
            CellStatus::Errored => "errored",
            CellStatus::Stale => "stale",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_ids() {
        let id = CellId::synthetic("slider");
        assert!(id.is_synthetic());
        assert_eq!(id.as_str(), "@set:slider");
        assert!(!CellId::from("slider").is_synthetic());
    }

    #[test]
    fn test_cell_id_serializes_as_plain_string() {
        let json = serde_json::to_string(&CellId::from("abc")).unwrap();
        assert_eq!(json, "\"abc\"");
    }
}
