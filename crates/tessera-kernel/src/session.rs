//! Kernel session state.
//!
//! A session is the single owner of one dependency graph and its namespace.
//! Every request is applied here: graph mutation first, then planning and
//! running through the core runner, with progress sent through a
//! [`Publisher`].

use rustc_hash::FxHashSet;

use tessera_core::execute::{
    CellError, ExecutionCallback, ExecutionSlot, RunResult, RunStatus, Runner,
};
use tessera_core::graph::{Cell, CellId, CellStatus, DependencyGraph, GraphChange};
use tessera_core::plan::{ExecutionPlan, plan};
use tessera_core::runtime::{Namespace, RuntimeConfig, Value};

use crate::error::{KernelError, KernelResult};
use crate::protocol::{CellSnapshot, KernelMessage, Request};
use crate::publisher::Publisher;

/// Forwards runner progress to subscribers.
struct Broadcaster<'a> {
    publisher: &'a Publisher,
}

impl ExecutionCallback for Broadcaster<'_> {
    fn on_cell_queued(&self, cell_id: &CellId) {
        self.publisher.send(KernelMessage::CellQueued {
            cell_id: cell_id.clone(),
        });
    }

    fn on_cell_started(&self, cell_id: &CellId) {
        self.publisher.send(KernelMessage::CellStarted {
            cell_id: cell_id.clone(),
        });
    }

    fn on_cell_finished(&self, result: &RunResult) {
        self.publisher.send(KernelMessage::CellResult(result.clone()));
    }
}

/// State of one notebook session.
pub struct Session {
    /// Dependency graph.
    graph: DependencyGraph,

    /// Bindings shared by every cell.
    namespace: Namespace,

    /// Slot the running cell occupies; interrupts go through it.
    slot: ExecutionSlot,

    /// Limits applied to every cell execution.
    config: RuntimeConfig,

    /// Where kernel messages go.
    publisher: Publisher,
}

impl Session {
    pub fn new(config: RuntimeConfig, publisher: Publisher) -> Self {
        Self {
            graph: DependencyGraph::new(),
            namespace: Namespace::new(),
            slot: ExecutionSlot::new(),
            config,
            publisher,
        }
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Execution slot, shared with whoever delivers interrupts.
    pub fn slot(&self) -> &ExecutionSlot {
        &self.slot
    }

    /// Apply one request.
    ///
    /// An `Err` means the request was rejected before the session changed,
    /// unless the error is fatal.
    pub fn handle(&mut self, request: Request) -> KernelResult<()> {
        tracing::debug!("Handling request: {:?}", request);
        match request {
            Request::SubmitEdit {
                cell_id,
                source,
                disabled,
            } => self.submit_edit(cell_id, source, disabled),
            Request::RunCells { cell_ids } => self.run_cells(&cell_ids),
            Request::SetValue { name, value } => self.set_values(vec![(name, value)]),
            Request::SetValues { bindings } => self.set_values(bindings.into_iter().collect()),
            Request::DeleteCell { cell_id } => self.delete_cell(&cell_id),
            Request::Interrupt => {
                self.slot.interrupt();
                Ok(())
            }
            Request::RunStale => self.run_stale(),
            Request::GetState => {
                self.publish_state();
                Ok(())
            }
        }
    }

    /// Create or update a cell, then run it and its descendants.
    ///
    /// Cells that depended on the old source but are not part of the new
    /// plan are marked stale rather than run.
    pub fn submit_edit(
        &mut self,
        cell_id: CellId,
        source: String,
        disabled: Option<bool>,
    ) -> KernelResult<()> {
        if cell_id.is_synthetic() {
            return Err(KernelError::InvalidRequest(format!(
                "cell id '{}' is reserved",
                cell_id
            )));
        }

        let previous = self.graph.cell(&cell_id);
        let disabled = disabled
            .or_else(|| previous.map(Cell::is_disabled))
            .unwrap_or(false);
        let old_defs = previous.map(|c| c.defs().clone()).unwrap_or_default();
        let mut affected: FxHashSet<CellId> =
            self.graph.descendants(&cell_id).into_iter().collect();

        // Other definers of the new names may end up conflicted; their
        // consumers lose the binding along with the edge.
        let cell = Cell::new(cell_id.clone(), source).with_disabled(disabled);
        let rivals: Vec<(CellId, Vec<CellId>)> = cell
            .defs()
            .iter()
            .flat_map(|name| self.graph.definers_of(name))
            .filter(|id| *id != cell_id && !id.is_synthetic())
            .map(|id| {
                let descendants = self.graph.descendants(&id);
                (id, descendants)
            })
            .collect();

        let change = self.graph.register(cell);
        tracing::info!("Cell {} updated (disabled: {})", cell_id, disabled);
        for (rival, descendants) in rivals {
            if change.conflicted.contains(&rival) {
                affected.extend(descendants);
            }
        }

        let new_defs = self
            .graph
            .cell(&cell_id)
            .map(|c| c.defs().clone())
            .unwrap_or_default();
        let dropped = self
            .namespace
            .remove_owned_except(&cell_id, |name| new_defs.contains(name));
        for name in old_defs.difference(&new_defs).chain(dropped.iter()) {
            for consumer in self.graph.consumers_of(name) {
                affected.extend(self.graph.descendants(&consumer));
                affected.insert(consumer);
            }
        }
        affected.extend(self.graph.descendants(&cell_id));
        affected.insert(cell_id.clone());
        self.apply_conflicts(&change, &mut affected);

        let planned = plan(&self.graph, std::slice::from_ref(&cell_id));
        self.mark_stale_outside(affected, &planned);
        self.run_planned(planned)
    }

    /// Run cells and their descendants. Every id must exist.
    pub fn run_cells(&mut self, cell_ids: &[CellId]) -> KernelResult<()> {
        if let Some(unknown) = cell_ids.iter().find(|id| !self.graph.contains(id)) {
            return Err(KernelError::UnknownCell(unknown.clone()));
        }
        tracing::info!("Running {} cell(s)", cell_ids.len());
        let planned = plan(&self.graph, cell_ids);
        self.run_planned(planned)
    }

    /// Set bindings from outside the graph, then run their consumers.
    ///
    /// A name defined by a cell is overwritten on behalf of that cell. A
    /// name no cell defines is owned by its synthetic producer.
    pub fn set_values(&mut self, bindings: Vec<(String, Value)>) -> KernelResult<()> {
        let mut producers = Vec::with_capacity(bindings.len());
        for (name, _) in &bindings {
            if name.is_empty() || name.starts_with(CellId::SYNTHETIC_PREFIX) {
                return Err(KernelError::InvalidRequest(format!(
                    "'{}' is not a valid binding name",
                    name
                )));
            }
            producers.push(self.producer_of(name)?);
        }

        let mut triggers = Vec::new();
        for ((name, value), producer) in bindings.into_iter().zip(producers) {
            match producer {
                Some(owner) => {
                    tracing::info!("Setting '{}' on behalf of cell {}", name, owner);
                    triggers.extend(
                        self.graph
                            .consumers_of(&name)
                            .into_iter()
                            .filter(|id| !self.graph.is_blocked(id)),
                    );
                    self.namespace.insert(&owner, name, value);
                }
                None => {
                    let synthetic = self.graph.ensure_synthetic(&name);
                    tracing::info!("Setting '{}' from outside the graph", name);
                    self.namespace.insert(&synthetic, name, value);
                    triggers.push(synthetic);
                }
            }
        }

        let planned = plan(&self.graph, &triggers);
        self.run_planned(planned)
    }

    /// Remove a cell. Its dependents become stale; nothing runs.
    pub fn delete_cell(&mut self, cell_id: &CellId) -> KernelResult<()> {
        if cell_id.is_synthetic() {
            return Err(KernelError::InvalidRequest(format!(
                "cell '{}' cannot be deleted",
                cell_id
            )));
        }
        if !self.graph.contains(cell_id) {
            return Err(KernelError::UnknownCell(cell_id.clone()));
        }

        let mut affected: FxHashSet<CellId> =
            self.graph.descendants(cell_id).into_iter().collect();
        let (cell, change) = self.graph.remove(cell_id)?;
        let dropped = self.namespace.remove_owned(cell_id);
        tracing::info!("Cell {} deleted, dropped bindings: {:?}", cell_id, dropped);

        // Consumers may now read the same names from another definer.
        for name in cell.defs() {
            for consumer in self.graph.consumers_of(name) {
                affected.extend(self.graph.descendants(&consumer));
                affected.insert(consumer);
            }
        }
        self.apply_conflicts(&change, &mut affected);
        self.mark_stale(affected);
        Ok(())
    }

    /// Run every stale cell.
    pub fn run_stale(&mut self) -> KernelResult<()> {
        let stale: Vec<CellId> = self
            .graph
            .cells()
            .into_iter()
            .filter(|c| !c.is_synthetic() && c.status == CellStatus::Stale)
            .map(|c| c.id().clone())
            .collect();
        tracing::info!("Running {} stale cell(s)", stale.len());
        if stale.is_empty() {
            return Ok(());
        }
        let planned = plan(&self.graph, &stale);
        self.run_planned(planned)
    }

    /// Publish every cell and the namespace.
    pub fn publish_state(&self) {
        let cells = self
            .graph
            .cells()
            .into_iter()
            .filter(|c| !c.is_synthetic())
            .map(CellSnapshot::from)
            .collect();
        self.publish(KernelMessage::State {
            cells,
            namespace: self.namespace.snapshot(),
        });
    }

    /// The cell whose binding for `name` an outside value replaces, if any.
    fn producer_of(&self, name: &str) -> KernelResult<Option<CellId>> {
        let real: Vec<CellId> = self
            .graph
            .definers_of(name)
            .into_iter()
            .filter(|id| !id.is_synthetic())
            .collect();
        let enabled: Vec<&CellId> = real
            .iter()
            .filter(|id| self.graph.cell(id).is_some_and(|c| !c.is_disabled()))
            .collect();
        match enabled.as_slice() {
            [owner] => Ok(Some((*owner).clone())),
            [] => Ok(real.into_iter().next()),
            _ => Err(KernelError::InvalidRequest(format!(
                "'{}' is defined by more than one cell",
                name
            ))),
        }
    }

    /// Drop bindings of newly conflicted cells and report them. Resolved
    /// cells join `affected` so they are marked stale.
    fn apply_conflicts(&mut self, change: &GraphChange, affected: &mut FxHashSet<CellId>) {
        for id in &change.conflicted {
            self.namespace.remove_owned(id);
            if let Some(cell) = self.graph.cell(id) {
                tracing::warn!("Cell {} has conflicting definitions", id);
                self.publish(KernelMessage::CellStatus {
                    cell_id: id.clone(),
                    status: cell.status,
                    error: cell.error.clone(),
                });
            }
        }
        affected.extend(change.resolved.iter().cloned());
    }

    /// Mark `affected` stale, leaving out whatever the plan is about to run.
    fn mark_stale_outside(
        &mut self,
        mut affected: FxHashSet<CellId>,
        planned: &tessera_core::Result<ExecutionPlan>,
    ) {
        match planned {
            Ok(plan) => affected.retain(|id| !plan.contains(id)),
            Err(tessera_core::Error::CyclicDependency {
                implicated,
                blocked,
                ..
            }) => affected.retain(|id| !implicated.contains(id) && !blocked.contains(id)),
            Err(_) => {}
        }
        self.mark_stale(affected);
    }

    fn mark_stale(&mut self, ids: impl IntoIterator<Item = CellId>) {
        let mut ids: Vec<CellId> = ids
            .into_iter()
            .filter(|id| !id.is_synthetic() && !self.graph.is_conflicted(id))
            .collect();
        ids.sort_by_key(|id| (self.graph.order_of(id), id.clone()));
        ids.dedup();

        for id in ids {
            let Some(cell) = self.graph.cell_mut(&id) else {
                continue;
            };
            cell.mark_stale();
            let message = KernelMessage::CellStatus {
                cell_id: id,
                status: cell.status,
                error: cell.error.clone(),
            };
            self.publish(message);
        }
    }

    fn run_planned(&mut self, planned: tessera_core::Result<ExecutionPlan>) -> KernelResult<()> {
        match planned {
            Ok(plan) => {
                if plan.is_empty() && plan.skipped.is_empty() {
                    return Ok(());
                }
                let callback = Broadcaster {
                    publisher: &self.publisher,
                };
                let results = Runner::new(
                    &mut self.graph,
                    &mut self.namespace,
                    &self.slot,
                    &self.config,
                )
                .with_callback(&callback)
                .run(&plan)?;
                let failed = results.iter().filter(|r| r.is_failure()).count();
                tracing::debug!("Plan finished: {} result(s), {} failed", results.len(), failed);
                Ok(())
            }
            Err(tessera_core::Error::CyclicDependency {
                cycle,
                implicated,
                blocked,
            }) => {
                self.fail_cycle(cycle, implicated, blocked);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Report a plan that could not run because of a cycle.
    fn fail_cycle(&mut self, cycle: Vec<CellId>, implicated: Vec<CellId>, blocked: Vec<CellId>) {
        tracing::warn!("Dependency cycle: {:?}", cycle);
        self.publish(KernelMessage::PlanFailed {
            cycle: cycle.clone(),
            implicated: implicated.clone(),
        });

        for id in &implicated {
            let error = CellError::Cycle {
                cycle: cycle.clone(),
            };
            self.namespace.remove_owned(id);
            if let Some(cell) = self.graph.cell_mut(id) {
                cell.mark_errored(error.clone());
            }
            self.publish(KernelMessage::CellResult(
                RunResult::new(id.clone(), RunStatus::Error).with_error(error),
            ));
        }
        self.mark_stale(blocked);
    }

    fn publish(&self, message: KernelMessage) {
        self.publisher.send(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::mpsc::UnboundedReceiver;

    fn id(s: &str) -> CellId {
        CellId::from(s)
    }

    fn session() -> (Session, UnboundedReceiver<KernelMessage>) {
        let publisher = Publisher::new(1);
        let rx = publisher.stream();
        (Session::new(RuntimeConfig::default(), publisher), rx)
    }

    fn drain(rx: &mut UnboundedReceiver<KernelMessage>) -> Vec<KernelMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn edit(session: &mut Session, cell_id: &str, source: &str) {
        session
            .submit_edit(id(cell_id), source.to_string(), None)
            .unwrap();
    }

    fn started(messages: &[KernelMessage]) -> Vec<String> {
        messages
            .iter()
            .filter_map(|m| match m {
                KernelMessage::CellStarted { cell_id } => Some(cell_id.to_string()),
                _ => None,
            })
            .collect()
    }

    fn status(session: &Session, cell_id: &str) -> CellStatus {
        session.graph().cell(&id(cell_id)).unwrap().status
    }

    #[test]
    fn test_edit_runs_cell_and_descendants() {
        let (mut session, mut rx) = session();
        edit(&mut session, "a", "let x = 1;");
        edit(&mut session, "b", "let y = x + 1;");
        drain(&mut rx);

        edit(&mut session, "a", "let x = 10;");
        let messages = drain(&mut rx);

        assert_eq!(started(&messages), vec!["a", "b"]);
        assert_eq!(session.namespace().get("y"), Some(&Value::Int(11)));
    }

    #[test]
    fn test_removing_definition_marks_consumer_stale() {
        let (mut session, mut rx) = session();
        edit(&mut session, "a", "let x = 1;");
        edit(&mut session, "b", "let y = x + 1;");
        drain(&mut rx);

        edit(&mut session, "a", "let z = 1;");
        let messages = drain(&mut rx);

        assert_eq!(started(&messages), vec!["a"]);
        assert!(messages.contains(&KernelMessage::CellStatus {
            cell_id: id("b"),
            status: CellStatus::Stale,
            error: None,
        }));
        assert_eq!(status(&session, "b"), CellStatus::Stale);
        assert!(!session.namespace().contains("x"));
        assert_eq!(session.namespace().get("z"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_new_conflict_marks_consumers_stale() {
        let (mut session, mut rx) = session();
        edit(&mut session, "a", "let x = 1;");
        edit(&mut session, "c", "let y = x + 1;");
        edit(&mut session, "d", "y * 2");
        drain(&mut rx);

        edit(&mut session, "b", "let x = 2;");
        let messages = drain(&mut rx);

        assert!(started(&messages).is_empty());
        assert_eq!(status(&session, "a"), CellStatus::Errored);
        assert_eq!(status(&session, "b"), CellStatus::Errored);
        for cell in ["c", "d"] {
            assert_eq!(status(&session, cell), CellStatus::Stale);
            assert!(messages.contains(&KernelMessage::CellStatus {
                cell_id: id(cell),
                status: CellStatus::Stale,
                error: None,
            }));
        }
        assert!(!session.namespace().contains("x"));
    }

    #[test]
    fn test_set_value_without_definer_uses_synthetic_cell() {
        let (mut session, mut rx) = session();
        edit(&mut session, "b", "let y = n * 2;");
        assert_eq!(status(&session, "b"), CellStatus::Errored);

        session
            .handle(Request::SetValue {
                name: "n".into(),
                value: Value::Int(21),
            })
            .unwrap();

        assert_eq!(session.namespace().get("y"), Some(&Value::Int(42)));
        assert_eq!(session.namespace().owner("n"), Some(&CellId::synthetic("n")));
        assert_eq!(status(&session, "b"), CellStatus::Idle);

        drain(&mut rx);
        session.handle(Request::GetState).unwrap();
        match drain(&mut rx).as_slice() {
            [KernelMessage::State { cells, namespace }] => {
                assert_eq!(cells.len(), 1);
                assert_eq!(cells[0].cell_id, id("b"));
                assert_eq!(namespace.get("n"), Some(&Value::Int(21)));
            }
            other => panic!("expected one state message, got {:?}", other),
        }
    }

    #[test]
    fn test_set_value_overrides_cell_binding() {
        let (mut session, _rx) = session();
        edit(&mut session, "a", "let x = 1;");
        edit(&mut session, "b", "let y = x * 3;");

        session.set_values(vec![("x".into(), Value::Int(5))]).unwrap();

        assert_eq!(session.namespace().get("y"), Some(&Value::Int(15)));
        assert_eq!(session.namespace().owner("x"), Some(&id("a")));
        assert!(!session.graph().contains(&CellId::synthetic("x")));
    }

    #[test]
    fn test_set_value_rejects_conflicting_name() {
        let (mut session, _rx) = session();
        edit(&mut session, "a", "let x = 1;");
        edit(&mut session, "b", "let x = 2;");

        let err = session
            .set_values(vec![("x".into(), Value::Int(5))])
            .unwrap_err();

        assert!(matches!(err, KernelError::InvalidRequest(_)));
        assert!(!session.namespace().contains("x"));
    }

    #[test]
    fn test_conflict_resolved_by_disabling() {
        let (mut session, mut rx) = session();
        edit(&mut session, "a", "let x = 1;");
        edit(&mut session, "b", "let x = 2;");
        let messages = drain(&mut rx);
        assert!(messages.iter().any(|m| matches!(
            m,
            KernelMessage::CellStatus {
                status: CellStatus::Errored,
                error: Some(CellError::MultipleDefinition { .. }),
                ..
            }
        )));
        assert!(!session.namespace().contains("x"));

        session
            .submit_edit(id("b"), "let x = 2;".into(), Some(true))
            .unwrap();
        assert_eq!(status(&session, "a"), CellStatus::Stale);

        session.run_stale().unwrap();
        assert_eq!(session.namespace().get("x"), Some(&Value::Int(1)));
        assert_eq!(status(&session, "a"), CellStatus::Idle);
    }

    #[test]
    fn test_delete_marks_dependents_stale() {
        let (mut session, mut rx) = session();
        edit(&mut session, "a", "let x = 1;");
        edit(&mut session, "b", "let y = x;");
        drain(&mut rx);

        session.delete_cell(&id("a")).unwrap();
        let messages = drain(&mut rx);

        assert!(started(&messages).is_empty());
        assert_eq!(status(&session, "b"), CellStatus::Stale);
        assert!(!session.graph().contains(&id("a")));
        assert!(!session.namespace().contains("x"));
    }

    #[test]
    fn test_unknown_cells_are_rejected() {
        let (mut session, _rx) = session();
        edit(&mut session, "a", "let x = 1;");

        let err = session.run_cells(&[id("a"), id("missing")]).unwrap_err();
        assert!(matches!(err, KernelError::UnknownCell(ref c) if c == &id("missing")));

        let err = session.delete_cell(&id("missing")).unwrap_err();
        assert!(matches!(err, KernelError::UnknownCell(_)));

        let err = session
            .submit_edit(CellId::synthetic("x"), "1".into(), None)
            .unwrap_err();
        assert!(matches!(err, KernelError::InvalidRequest(_)));
    }

    #[test]
    fn test_cycle_fails_plan_without_running() {
        let (mut session, mut rx) = session();
        edit(&mut session, "a", "let a = b;");
        drain(&mut rx);

        edit(&mut session, "b", "let b = a;");
        let messages = drain(&mut rx);

        assert!(started(&messages).is_empty());
        assert!(messages.iter().any(|m| matches!(
            m,
            KernelMessage::PlanFailed { implicated, .. } if implicated.len() == 2
        )));
        for cell in ["a", "b"] {
            assert_eq!(status(&session, cell), CellStatus::Errored);
            assert!(matches!(
                session.graph().cell(&id(cell)).unwrap().error,
                Some(CellError::Cycle { .. })
            ));
        }
    }
}
