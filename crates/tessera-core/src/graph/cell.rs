//! The cell model.

use std::collections::BTreeSet;

use super::analyzer::analyze;
use super::types::{CellId, CellStatus};
use crate::execute::CellError;
use crate::runtime::Value;

/// One unit of code and its last known state.
///
/// `defs` and `refs` are derived from `source` and only change together with
/// it, so they are never out of date relative to the stored source.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    id: CellId,
    source: String,
    defs: BTreeSet<String>,
    refs: BTreeSet<String>,
    disabled: bool,
    /// Current lifecycle status.
    pub status: CellStatus,
    /// Output of the last successful run.
    pub output: Option<Value>,
    /// Condition recorded by the last run, conflict check or plan failure.
    pub error: Option<CellError>,
    /// Text printed by the last run.
    pub stdout: String,
}

impl Cell {
    /// Create a cell from source.
    ///
    /// Source that does not parse yields empty defs and refs; the syntax
    /// error is reported when the cell is executed.
    pub fn new(id: impl Into<CellId>, source: impl Into<String>) -> Self {
        let mut cell = Self {
            id: id.into(),
            source: String::new(),
            defs: BTreeSet::new(),
            refs: BTreeSet::new(),
            disabled: false,
            status: CellStatus::Idle,
            output: None,
            error: None,
            stdout: String::new(),
        };
        cell.set_source(source.into());
        cell
    }

    /// Phantom producer for a value set from outside the graph.
    pub fn synthetic(name: &str) -> Self {
        Self {
            id: CellId::synthetic(name),
            source: String::new(),
            defs: BTreeSet::from([name.to_string()]),
            refs: BTreeSet::new(),
            disabled: false,
            status: CellStatus::Idle,
            output: None,
            error: None,
            stdout: String::new(),
        }
    }

    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn id(&self) -> &CellId {
        &self.id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn defs(&self) -> &BTreeSet<String> {
        &self.defs
    }

    pub fn refs(&self) -> &BTreeSet<String> {
        &self.refs
    }

    pub fn defines(&self, name: &str) -> bool {
        self.defs.contains(name)
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn is_synthetic(&self) -> bool {
        self.id.is_synthetic()
    }

    pub(crate) fn set_source(&mut self, source: String) {
        let analysis = analyze(&source).unwrap_or_default();
        self.defs = analysis.defs;
        self.refs = analysis.refs;
        self.source = source;
    }

    /// Mark the displayed output as possibly out of date.
    pub fn mark_stale(&mut self) {
        self.status = CellStatus::Stale;
    }

    pub fn mark_queued(&mut self) {
        self.status = CellStatus::Queued;
    }

    pub fn mark_errored(&mut self, error: CellError) {
        self.status = CellStatus::Errored;
        self.error = Some(error);
        self.output = None;
    }

    pub fn clear_output(&mut self) {
        self.output = None;
        self.stdout.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_cell_analyzes_source() {
        let cell = Cell::new("b", "let y = x + 1;");
        assert_eq!(cell.defs(), &BTreeSet::from(["y".to_string()]));
        assert_eq!(cell.refs(), &BTreeSet::from(["x".to_string()]));
        assert_eq!(cell.status, CellStatus::Idle);
    }

    #[test]
    fn test_set_source_recomputes_names() {
        let mut cell = Cell::new("a", "let x = 1;");
        cell.set_source("let z = w;".to_string());
        assert!(!cell.defines("x"));
        assert!(cell.defines("z"));
        assert!(cell.refs().contains("w"));
    }

    #[test]
    fn test_unparsable_source_has_no_names() {
        let cell = Cell::new("a", "let = ;");
        assert!(cell.defs().is_empty());
        assert!(cell.refs().is_empty());
    }

    #[test]
    fn test_synthetic_cell() {
        let cell = Cell::synthetic("slider");
        assert!(cell.is_synthetic());
        assert!(cell.defines("slider"));
        assert!(cell.source().is_empty());
    }
}
