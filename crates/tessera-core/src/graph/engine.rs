//! The dependency graph over cells.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use petgraph::Direction;
use petgraph::algo::kosaraju_scc;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::{Dfs, NodeFiltered, Reversed};
use rustc_hash::{FxHashMap, FxHashSet};

use super::cell::Cell;
use super::types::{CellId, CellStatus};
use crate::error::{Error, Result};
use crate::execute::CellError;

/// Conflict changes caused by one graph mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphChange {
    /// Cells whose multiple-definition conflict is new or changed. They are
    /// now marked errored.
    pub conflicted: Vec<CellId>,
    /// Cells that were in conflict before the mutation and no longer are.
    /// They are now marked stale.
    pub resolved: Vec<CellId>,
}

impl GraphChange {
    pub fn is_empty(&self) -> bool {
        self.conflicted.is_empty() && self.resolved.is_empty()
    }
}

/// Directed graph of cells: an edge X → Y exists when a name defined by X
/// is referenced by Y.
///
/// Edges are recomputed from scratch on every mutation, so the edge set only
/// depends on the current cells and never on the history of edits.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// Edges go from producer to consumer.
    graph: StableDiGraph<CellId, ()>,
    node_indices: FxHashMap<CellId, NodeIndex>,
    cells: FxHashMap<CellId, Cell>,
    /// Position of each cell in first-registration order.
    order: FxHashMap<CellId, usize>,
    next_order: usize,
    /// Names each cell defines in conflict with another enabled cell.
    conflicts: FxHashMap<CellId, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a cell.
    ///
    /// A replaced cell keeps its status, last output and position in
    /// registration order; its defs and refs come from the new source.
    pub fn register(&mut self, mut cell: Cell) -> GraphChange {
        let id = cell.id().clone();
        match self.cells.remove(&id) {
            Some(previous) => {
                cell.status = previous.status;
                cell.output = previous.output;
                cell.error = previous.error;
                cell.stdout = previous.stdout;
            }
            None => {
                let idx = self.graph.add_node(id.clone());
                self.node_indices.insert(id.clone(), idx);
                self.order.insert(id.clone(), self.next_order);
                self.next_order += 1;
            }
        }
        tracing::debug!(
            "Registered cell {} (defs: {:?}, refs: {:?})",
            id,
            cell.defs(),
            cell.refs()
        );
        self.cells.insert(id, cell);
        self.relink()
    }

    /// Remove a cell and every edge touching it.
    pub fn remove(&mut self, id: &CellId) -> Result<(Cell, GraphChange)> {
        let cell = self
            .cells
            .remove(id)
            .ok_or_else(|| Error::UnknownCell(id.clone()))?;
        if let Some(idx) = self.node_indices.remove(id) {
            self.graph.remove_node(idx);
        }
        self.order.remove(id);
        tracing::debug!("Removed cell {}", id);
        let change = self.relink();
        Ok((cell, change))
    }

    /// Make sure the synthetic producer for `name` exists.
    pub fn ensure_synthetic(&mut self, name: &str) -> CellId {
        let id = CellId::synthetic(name);
        if !self.cells.contains_key(&id) {
            self.register(Cell::synthetic(name));
        }
        id
    }

    /// Rebuild all edges and conflict marks from the current cells.
    fn relink(&mut self) -> GraphChange {
        self.graph.clear_edges();

        let mut definers: BTreeMap<&str, Vec<&CellId>> = BTreeMap::new();
        for cell in self.cells.values() {
            for name in cell.defs() {
                definers.entry(name).or_default().push(cell.id());
            }
        }

        let mut edges = Vec::new();
        let mut conflicts: FxHashMap<CellId, BTreeSet<String>> = FxHashMap::default();
        for (name, ids) in &definers {
            let real: Vec<&CellId> = ids.iter().copied().filter(|id| !id.is_synthetic()).collect();
            let enabled: Vec<&CellId> = real
                .iter()
                .copied()
                .filter(|id| !self.cells[*id].is_disabled())
                .collect();

            let producers: Vec<&CellId> = match (enabled.len(), real.is_empty()) {
                (0, true) => ids.clone(),
                (0, false) => real,
                (1, _) => enabled,
                _ => {
                    for id in enabled {
                        conflicts
                            .entry(id.clone())
                            .or_default()
                            .insert(name.to_string());
                    }
                    continue;
                }
            };

            for consumer in self.cells.values().filter(|c| c.refs().contains(*name)) {
                for producer in &producers {
                    if *producer != consumer.id() {
                        edges.push((
                            self.node_indices[*producer],
                            self.node_indices[consumer.id()],
                        ));
                    }
                }
            }
        }
        for (from, to) in edges {
            self.graph.update_edge(from, to, ());
        }

        let previous = std::mem::replace(&mut self.conflicts, conflicts);
        let mut change = GraphChange::default();
        for (id, names) in &self.conflicts {
            if previous.get(id) != Some(names) {
                change.conflicted.push(id.clone());
            }
        }
        for id in previous.keys() {
            if !self.conflicts.contains_key(id) && self.cells.contains_key(id) {
                change.resolved.push(id.clone());
            }
        }
        self.sort_by_order(&mut change.conflicted);
        self.sort_by_order(&mut change.resolved);

        for id in &change.conflicted {
            let error = self.conflict_error(id);
            tracing::debug!("Cell {} conflicts: {:?}", id, error);
            if let Some(cell) = self.cells.get_mut(id) {
                cell.mark_errored(error);
            }
        }
        for id in &change.resolved {
            if let Some(cell) = self.cells.get_mut(id) {
                if matches!(cell.error, Some(CellError::MultipleDefinition { .. })) {
                    cell.error = None;
                }
                cell.status = CellStatus::Stale;
            }
        }
        change
    }

    pub(crate) fn conflict_error(&self, id: &CellId) -> CellError {
        let names: Vec<String> = self
            .conflicts
            .get(id)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default();
        let mut cells: Vec<CellId> = self
            .conflicts
            .iter()
            .filter(|(other, other_names)| {
                *other != id && names.iter().any(|n| other_names.contains(n))
            })
            .map(|(other, _)| other.clone())
            .collect();
        self.sort_by_order(&mut cells);
        CellError::MultipleDefinition { names, cells }
    }

    fn sort_by_order(&self, ids: &mut [CellId]) {
        ids.sort_by_key(|id| (self.order_of(id), id.clone()));
    }

    /// Position of a cell in first-registration order.
    pub fn order_of(&self, id: &CellId) -> usize {
        self.order.get(id).copied().unwrap_or(usize::MAX)
    }

    /// Look up a cell by id.
    pub fn cell(&self, id: &CellId) -> Option<&Cell> {
        self.cells.get(id)
    }

    /// Get mutable access to a cell.
    pub fn cell_mut(&mut self, id: &CellId) -> Option<&mut Cell> {
        self.cells.get_mut(id)
    }

    /// Check if a cell is registered.
    pub fn contains(&self, id: &CellId) -> bool {
        self.cells.contains_key(id)
    }

    /// All cells, synthetic ones included, in registration order.
    pub fn cells(&self) -> Vec<&Cell> {
        let mut cells: Vec<&Cell> = self.cells.values().collect();
        cells.sort_by_key(|c| (self.order_of(c.id()), c.id().clone()));
        cells
    }

    /// Number of cells, synthetic ones included.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Check if no cell is registered.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    fn collect_sorted(&self, ids: impl IntoIterator<Item = CellId>) -> Vec<CellId> {
        let mut ids: Vec<CellId> = ids.into_iter().collect();
        self.sort_by_order(&mut ids);
        ids.dedup();
        ids
    }

    fn neighbors(&self, id: &CellId, dir: Direction) -> Vec<CellId> {
        let Some(&idx) = self.node_indices.get(id) else {
            return Vec::new();
        };
        self.collect_sorted(
            self.graph
                .neighbors_directed(idx, dir)
                .map(|n| self.graph[n].clone()),
        )
    }

    /// Direct consumers of a cell.
    pub fn children(&self, id: &CellId) -> Vec<CellId> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Direct producers for a cell.
    pub fn parents(&self, id: &CellId) -> Vec<CellId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Transitive producers, excluding the cell itself.
    pub fn ancestors(&self, id: &CellId) -> Vec<CellId> {
        let Some(&start) = self.node_indices.get(id) else {
            return Vec::new();
        };
        let reversed = Reversed(&self.graph);
        let mut dfs = Dfs::new(reversed, start);
        let mut found = Vec::new();
        while let Some(idx) = dfs.next(reversed) {
            if idx != start {
                found.push(self.graph[idx].clone());
            }
        }
        self.collect_sorted(found)
    }

    /// Transitive consumers, excluding the cell itself.
    pub fn descendants(&self, id: &CellId) -> Vec<CellId> {
        let Some(&start) = self.node_indices.get(id) else {
            return Vec::new();
        };
        let mut dfs = Dfs::new(&self.graph, start);
        let mut found = Vec::new();
        while let Some(idx) = dfs.next(&self.graph) {
            if idx != start {
                found.push(self.graph[idx].clone());
            }
        }
        self.collect_sorted(found)
    }

    /// Real cells that reference `name`.
    pub fn consumers_of(&self, name: &str) -> Vec<CellId> {
        self.collect_sorted(
            self.cells
                .values()
                .filter(|c| !c.is_synthetic() && c.refs().contains(name))
                .map(|c| c.id().clone()),
        )
    }

    /// Cells that define `name`, synthetic producer included.
    pub fn definers_of(&self, name: &str) -> Vec<CellId> {
        self.collect_sorted(
            self.cells
                .values()
                .filter(|c| c.defines(name))
                .map(|c| c.id().clone()),
        )
    }

    /// Every edge as (producer, consumer), sorted.
    pub fn edges(&self) -> Vec<(CellId, CellId)> {
        let mut edges: Vec<(CellId, CellId)> = self
            .graph
            .edge_indices()
            .filter_map(|e| self.graph.edge_endpoints(e))
            .map(|(from, to)| (self.graph[from].clone(), self.graph[to].clone()))
            .collect();
        edges.sort();
        edges
    }

    /// Names the cell defines in conflict with another enabled cell.
    pub fn conflicts_of(&self, id: &CellId) -> Option<&BTreeSet<String>> {
        self.conflicts.get(id)
    }

    pub fn is_conflicted(&self, id: &CellId) -> bool {
        self.conflicts.contains_key(id)
    }

    /// Whether a cell is disabled or downstream of a disabled cell.
    pub fn is_blocked(&self, id: &CellId) -> bool {
        let disabled = |id: &CellId| self.cells.get(id).is_some_and(|c| c.is_disabled());
        disabled(id) || self.ancestors(id).iter().any(disabled)
    }

    /// Find a cycle in the subgraph induced by the enabled cells among `cell_ids`.
    ///
    /// The cycle is returned in edge order, starting from its earliest
    /// registered member.
    pub fn detect_cycle(&self, cell_ids: &[CellId]) -> Option<Vec<CellId>> {
        let members: FxHashSet<NodeIndex> = cell_ids
            .iter()
            .filter(|id| self.cells.get(*id).is_some_and(|c| !c.is_disabled()))
            .filter_map(|id| self.node_indices.get(id).copied())
            .collect();
        let induced = NodeFiltered::from_fn(&self.graph, |idx| members.contains(&idx));

        let scc = kosaraju_scc(&induced)
            .into_iter()
            .filter(|scc| scc.len() > 1)
            .min_by_key(|scc| {
                scc.iter()
                    .map(|idx| self.order_of(&self.graph[*idx]))
                    .min()
                    .unwrap_or(usize::MAX)
            })?;
        self.cycle_through(&scc)
    }

    /// Shortest cycle through the earliest member of a strongly connected component.
    fn cycle_through(&self, scc: &[NodeIndex]) -> Option<Vec<CellId>> {
        let in_scc: FxHashSet<NodeIndex> = scc.iter().copied().collect();
        let start = *scc
            .iter()
            .min_by_key(|idx| (self.order_of(&self.graph[**idx]), self.graph[**idx].clone()))?;

        let mut previous: FxHashMap<NodeIndex, NodeIndex> = FxHashMap::default();
        let mut queue = VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            let mut next: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(node, Direction::Outgoing)
                .filter(|n| in_scc.contains(n))
                .collect();
            next.sort_by_key(|n| self.order_of(&self.graph[*n]));
            for neighbor in next {
                if neighbor == start {
                    let mut path = vec![self.graph[node].clone()];
                    let mut cursor = node;
                    while let Some(&prev) = previous.get(&cursor) {
                        path.push(self.graph[prev].clone());
                        cursor = prev;
                    }
                    path.reverse();
                    return Some(path);
                }
                if neighbor != start && !previous.contains_key(&neighbor) {
                    previous.insert(neighbor, node);
                    queue.push_back(neighbor);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> CellId {
        CellId::from(s)
    }

    fn graph_of(cells: &[(&str, &str)]) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for (cell_id, source) in cells {
            graph.register(Cell::new(*cell_id, *source));
        }
        graph
    }

    #[test]
    fn test_edges_follow_defs_and_refs() {
        let graph = graph_of(&[
            ("a", "let x = 1;"),
            ("b", "let y = x + 1;"),
            ("c", "println!(\"{}\", y);"),
        ]);
        assert_eq!(graph.edges(), vec![(id("a"), id("b")), (id("b"), id("c"))]);
        assert_eq!(graph.descendants(&id("a")), vec![id("b"), id("c")]);
        assert_eq!(graph.ancestors(&id("c")), vec![id("a"), id("b")]);
        assert_eq!(graph.children(&id("a")), vec![id("b")]);
        assert_eq!(graph.parents(&id("c")), vec![id("b")]);
    }

    #[test]
    fn test_lookups_track_registration() {
        let mut graph = DependencyGraph::new();
        assert!(graph.is_empty());

        graph.register(Cell::new("a", "let x = 1;"));
        graph.ensure_synthetic("n");
        assert_eq!(graph.len(), 2);
        assert!(graph.contains(&id("a")));
        assert!(!graph.contains(&id("b")));

        if let Some(cell) = graph.cell_mut(&id("a")) {
            cell.mark_stale();
        }
        assert_eq!(graph.cell(&id("a")).unwrap().status, CellStatus::Stale);
        assert!(graph.cell(&id("b")).is_none());
    }

    #[test]
    fn test_register_then_remove_restores_edges() {
        let mut graph = graph_of(&[("a", "let x = 1;"), ("b", "let y = x;")]);
        let before = graph.edges();

        graph.register(Cell::new("c", "let z = x + y;"));
        assert_eq!(graph.edges().len(), 3);
        graph.remove(&id("c")).unwrap();

        assert_eq!(graph.edges(), before);
    }

    #[test]
    fn test_multiple_definition_conflict() {
        let mut graph = graph_of(&[("a", "let x = 1;"), ("b", "let x = 2;"), ("c", "x")]);

        assert!(graph.is_conflicted(&id("a")));
        assert!(graph.is_conflicted(&id("b")));
        assert!(graph.edges().is_empty());
        let a = graph.cell(&id("a")).unwrap();
        assert_eq!(a.status, CellStatus::Errored);
        assert_eq!(
            a.error,
            Some(CellError::MultipleDefinition {
                names: vec!["x".into()],
                cells: vec![id("b")],
            })
        );

        let change = graph.register(Cell::new("b", "let x = 2;").with_disabled(true));
        assert_eq!(change.resolved, vec![id("a"), id("b")]);
        assert_eq!(graph.cell(&id("a")).unwrap().status, CellStatus::Stale);
        assert_eq!(graph.cell(&id("a")).unwrap().error, None);
        assert_eq!(graph.edges(), vec![(id("a"), id("c"))]);
    }

    #[test]
    fn test_disabled_definer_still_links_when_alone() {
        let mut graph = DependencyGraph::new();
        graph.register(Cell::new("a", "let x = 1;").with_disabled(true));
        graph.register(Cell::new("b", "let y = x;"));

        assert_eq!(graph.edges(), vec![(id("a"), id("b"))]);
        assert!(graph.is_blocked(&id("b")));
        assert!(graph.is_blocked(&id("a")));
    }

    #[test]
    fn test_synthetic_cell_yields_to_real_definer() {
        let mut graph = graph_of(&[("b", "let y = slider * 2;")]);
        let synthetic = graph.ensure_synthetic("slider");
        assert_eq!(graph.edges(), vec![(synthetic.clone(), id("b"))]);

        let change = graph.register(Cell::new("a", "let slider = 5;"));
        assert!(change.is_empty());
        assert_eq!(graph.edges(), vec![(id("a"), id("b"))]);
        assert!(graph.contains(&synthetic));
    }

    #[test]
    fn test_reregister_keeps_order_and_status() {
        let mut graph = graph_of(&[("a", "let x = 1;"), ("b", "let y = 2;")]);
        graph.cell_mut(&id("a")).unwrap().mark_stale();
        graph.register(Cell::new("a", "let x = 3;"));

        assert_eq!(graph.order_of(&id("a")), 0);
        assert_eq!(graph.cell(&id("a")).unwrap().status, CellStatus::Stale);
        assert_eq!(graph.cell(&id("a")).unwrap().source(), "let x = 3;");
    }

    #[test]
    fn test_detect_cycle() {
        let graph = graph_of(&[
            ("a", "let x = z;"),
            ("b", "let y = x;"),
            ("c", "let z = y;"),
            ("d", "let w = 1;"),
        ]);
        let all: Vec<CellId> = ["a", "b", "c", "d"].into_iter().map(id).collect();
        assert_eq!(graph.detect_cycle(&all), Some(vec![id("a"), id("b"), id("c")]));
        assert_eq!(graph.detect_cycle(&[id("a"), id("b")]), None);
        assert_eq!(graph.detect_cycle(&[id("d")]), None);
    }

    #[test]
    fn test_cycle_through_disabled_cell_is_ignored() {
        let mut graph = graph_of(&[("a", "let x = y;")]);
        graph.register(Cell::new("b", "let y = x;").with_disabled(true));
        assert_eq!(graph.detect_cycle(&[id("a"), id("b")]), None);
    }

    #[test]
    fn test_remove_unknown_cell() {
        let mut graph = DependencyGraph::new();
        assert_eq!(
            graph.remove(&id("nope")).unwrap_err(),
            Error::UnknownCell(id("nope"))
        );
    }
}
