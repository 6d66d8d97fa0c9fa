//! Computes which cells run for a trigger, and in what order.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{Error, Result};
use crate::graph::{CellId, DependencyGraph};

/// Ordered, duplicate-free set of cells to execute for one triggering event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionPlan {
    /// Cells to execute, producers before consumers.
    pub order: Vec<CellId>,
    /// Triggers that were not planned because they are disabled or
    /// downstream of a disabled cell.
    pub skipped: Vec<CellId>,
}

impl ExecutionPlan {
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn contains(&self, id: &CellId) -> bool {
        self.order.contains(id)
    }
}

/// Plan execution from `triggers`.
///
/// The plan holds the triggers and all their descendants, except cells that
/// are disabled or downstream of a disabled cell. Synthetic triggers expand
/// to their consumers. Independent cells keep first-registration order.
///
/// A cycle among the affected cells fails the whole plan with
/// [`Error::CyclicDependency`].
pub fn plan(graph: &DependencyGraph, triggers: &[CellId]) -> Result<ExecutionPlan> {
    if let Some(unknown) = triggers.iter().find(|id| !graph.contains(id)) {
        return Err(Error::UnknownCell(unknown.clone()));
    }

    let mut skipped = Vec::new();
    let mut roots = Vec::new();
    for trigger in triggers {
        if trigger.is_synthetic() {
            roots.extend(
                graph
                    .children(trigger)
                    .into_iter()
                    .filter(|child| !graph.is_blocked(child)),
            );
        } else if graph.is_blocked(trigger) {
            if !skipped.contains(trigger) {
                skipped.push(trigger.clone());
            }
        } else {
            roots.push(trigger.clone());
        }
    }

    let affected = affected_cells(graph, roots);

    if let Some(cycle) = graph.detect_cycle(&affected) {
        let mut implicated: FxHashSet<CellId> = cycle.iter().cloned().collect();
        for member in &cycle {
            implicated.extend(
                graph
                    .descendants(member)
                    .into_iter()
                    .filter(|id| affected.contains(id)),
            );
        }
        let (implicated, blocked): (Vec<CellId>, Vec<CellId>) = affected
            .into_iter()
            .partition(|id| implicated.contains(id));
        tracing::debug!("Plan failed: cycle {:?}", cycle);
        return Err(Error::CyclicDependency {
            cycle,
            implicated,
            blocked,
        });
    }

    let order = topological_order(graph, &affected)?;
    tracing::debug!("Planned {} cell(s): {:?}", order.len(), order);
    Ok(ExecutionPlan { order, skipped })
}

/// Roots plus every descendant reachable without passing through a blocked
/// or synthetic cell, in registration order.
fn affected_cells(graph: &DependencyGraph, roots: Vec<CellId>) -> Vec<CellId> {
    let mut seen: FxHashSet<CellId> = FxHashSet::default();
    let mut queue: VecDeque<CellId> = roots
        .into_iter()
        .filter(|id| seen.insert(id.clone()))
        .collect();
    let mut affected = Vec::new();

    while let Some(id) = queue.pop_front() {
        for child in graph.children(&id) {
            if child.is_synthetic() || seen.contains(&child) || graph.is_blocked(&child) {
                continue;
            }
            seen.insert(child.clone());
            queue.push_back(child);
        }
        affected.push(id);
    }

    affected.sort_by_key(|id| (graph.order_of(id), id.clone()));
    affected
}

/// Kahn's algorithm over the subgraph induced by `cells`, breaking ties by
/// registration order.
fn topological_order(graph: &DependencyGraph, cells: &[CellId]) -> Result<Vec<CellId>> {
    let members: FxHashSet<&CellId> = cells.iter().collect();
    let mut indegree: FxHashMap<&CellId, usize> = cells
        .iter()
        .map(|id| {
            let parents = graph
                .parents(id)
                .iter()
                .filter(|p| members.contains(p))
                .count();
            (id, parents)
        })
        .collect();

    let mut ready: BinaryHeap<Reverse<(usize, &CellId)>> = indegree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| Reverse((graph.order_of(id), *id)))
        .collect();

    let mut order = Vec::with_capacity(cells.len());
    while let Some(Reverse((_, id))) = ready.pop() {
        order.push(id.clone());
        for child in graph.children(id) {
            let Some(member) = members.get(&child).copied() else {
                continue;
            };
            if let Some(degree) = indegree.get_mut(member) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse((graph.order_of(member), member)));
                }
            }
        }
    }

    if order.len() != cells.len() {
        return Err(Error::Invariant(format!(
            "topological sort covered {} of {} cells",
            order.len(),
            cells.len()
        )));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Cell;

    fn id(s: &str) -> CellId {
        CellId::from(s)
    }

    fn ids(list: &[&str]) -> Vec<CellId> {
        list.iter().map(|s| id(s)).collect()
    }

    fn graph_of(cells: &[(&str, &str)]) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for (cell_id, source) in cells {
            graph.register(Cell::new(*cell_id, *source));
        }
        graph
    }

    #[test]
    fn test_chain_plan() {
        let graph = graph_of(&[
            ("a", "let x = 1;"),
            ("b", "let y = x + 1;"),
            ("c", "println!(\"{}\", y);"),
        ]);
        let plan = plan(&graph, &[id("a")]).unwrap();
        assert_eq!(plan.order, ids(&["a", "b", "c"]));
        assert!(plan.skipped.is_empty());
    }

    #[test]
    fn test_single_cell_plan() {
        let graph = graph_of(&[("a", "let x = 1;"), ("b", "let y = 2;")]);
        assert_eq!(plan(&graph, &[id("b")]).unwrap().order, ids(&["b"]));
    }

    #[test]
    fn test_registration_order_breaks_ties() {
        // Registered consumer-first: c, then b, then a.
        let graph = graph_of(&[
            ("c", "let z = x * 3;"),
            ("b", "let y = x * 2;"),
            ("a", "let x = 1;"),
        ]);
        let plan = plan(&graph, &[id("a")]).unwrap();
        assert_eq!(plan.order, ids(&["a", "c", "b"]));
    }

    #[test]
    fn test_multiple_triggers_deduplicate() {
        let graph = graph_of(&[
            ("a", "let x = 1;"),
            ("b", "let y = x;"),
            ("c", "let z = y;"),
        ]);
        let plan = plan(&graph, &ids(&["b", "a", "b"])).unwrap();
        assert_eq!(plan.order, ids(&["a", "b", "c"]));
    }

    #[test]
    fn test_disabled_cell_blocks_propagation() {
        let mut graph = graph_of(&[("a", "let x = 1;")]);
        graph.register(Cell::new("b", "let y = x;").with_disabled(true));
        graph.register(Cell::new("c", "let z = y;"));
        graph.register(Cell::new("d", "let w = x;"));

        let result = plan(&graph, &[id("a")]).unwrap();
        assert_eq!(result.order, ids(&["a", "d"]));

        let result = plan(&graph, &[id("c")]).unwrap();
        assert!(result.order.is_empty());
        assert_eq!(result.skipped, ids(&["c"]));
    }

    #[test]
    fn test_synthetic_trigger_expands_to_consumers() {
        let mut graph = graph_of(&[("a", "let y = slider + 1;"), ("b", "let z = y;")]);
        let synthetic = graph.ensure_synthetic("slider");
        let plan = plan(&graph, &[synthetic]).unwrap();
        assert_eq!(plan.order, ids(&["a", "b"]));
    }

    #[test]
    fn test_cycle_fails_plan() {
        let graph = graph_of(&[
            ("root", "let s = 1;"),
            ("a", "let x = y + s;"),
            ("b", "let y = x;"),
            ("c", "let z = x;"),
            ("other", "let w = s;"),
        ]);
        match plan(&graph, &[id("root")]).unwrap_err() {
            Error::CyclicDependency {
                cycle,
                implicated,
                blocked,
            } => {
                assert_eq!(cycle, ids(&["a", "b"]));
                assert_eq!(implicated, ids(&["a", "b", "c"]));
                assert_eq!(blocked, ids(&["root", "other"]));
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_trigger() {
        let graph = DependencyGraph::new();
        assert_eq!(
            plan(&graph, &[id("ghost")]).unwrap_err(),
            Error::UnknownCell(id("ghost"))
        );
    }

    #[test]
    fn test_order_respects_every_edge() {
        let graph = graph_of(&[
            ("d", "let out = p + q;"),
            ("b", "let p = base * 2;"),
            ("c", "let q = base + p;"),
            ("a", "let base = 3;"),
        ]);
        let plan = plan(&graph, &[id("a")]).unwrap();
        let position = |cell: &CellId| plan.order.iter().position(|c| c == cell).unwrap();
        for (from, to) in graph.edges() {
            assert!(position(&from) < position(&to), "{from} must precede {to}");
        }
        assert_eq!(plan, super::plan(&graph, &[id("a")]).unwrap());
    }
}
