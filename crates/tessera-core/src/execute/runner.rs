//! Sequential runner for execution plans.
//!
//! Executes the cells of a plan one at a time against the shared namespace.
//! A failure cancels the failed cell's descendants in the plan; unrelated
//! cells keep running.

use std::time::Instant;

use rustc_hash::FxHashMap;

use super::context::{ExecutionCallback, ExecutionSlot};
use super::result::{CellError, RunResult, RunStatus};
use crate::error::{Error, Result};
use crate::graph::{CellId, CellStatus, DependencyGraph};
use crate::plan::ExecutionPlan;
use crate::runtime::{self, Namespace, RuntimeConfig};

/// Runs plans against a graph and its namespace.
pub struct Runner<'a> {
    graph: &'a mut DependencyGraph,
    namespace: &'a mut Namespace,
    slot: &'a ExecutionSlot,
    config: &'a RuntimeConfig,
    callback: Option<&'a dyn ExecutionCallback>,
}

impl<'a> Runner<'a> {
    pub fn new(
        graph: &'a mut DependencyGraph,
        namespace: &'a mut Namespace,
        slot: &'a ExecutionSlot,
        config: &'a RuntimeConfig,
    ) -> Self {
        Self {
            graph,
            namespace,
            slot,
            config,
            callback: None,
        }
    }

    /// Report progress to `callback` while running.
    pub fn with_callback(mut self, callback: &'a dyn ExecutionCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Execute a plan, returning one result per skipped trigger and per
    /// planned cell, in completion order.
    pub fn run(&mut self, plan: &ExecutionPlan) -> Result<Vec<RunResult>> {
        let mut results = Vec::with_capacity(plan.skipped.len() + plan.len());

        for id in &plan.skipped {
            self.finish(RunResult::new(id.clone(), RunStatus::Skipped), &mut results);
        }

        for id in &plan.order {
            let cell = self
                .graph
                .cell_mut(id)
                .ok_or_else(|| Error::Invariant(format!("planned cell {id} is not in the graph")))?;
            cell.mark_queued();
            if let Some(callback) = self.callback {
                callback.on_cell_queued(id);
            }
        }

        // Cell in the plan → the failed ancestor that cancels it.
        let mut poisoned: FxHashMap<CellId, CellId> = FxHashMap::default();

        for id in &plan.order {
            let result = if let Some(cause) = poisoned.get(id).cloned() {
                self.cancel(id, cause)
            } else if self.graph.is_conflicted(id) {
                self.reject_conflicted(id)
            } else {
                self.execute_cell(id)?
            };

            if result.is_failure() {
                for descendant in self.graph.descendants(id) {
                    if plan.contains(&descendant) {
                        poisoned.entry(descendant).or_insert_with(|| id.clone());
                    }
                }
            }
            self.finish(result, &mut results);
        }

        Ok(results)
    }

    fn finish(&self, result: RunResult, results: &mut Vec<RunResult>) {
        tracing::debug!(
            "Cell {} finished: {:?} in {:.2}ms",
            result.cell_id,
            result.status,
            result.elapsed_ms
        );
        if let Some(callback) = self.callback {
            callback.on_cell_finished(&result);
        }
        results.push(result);
    }

    /// Skip a descendant of a failed cell. Its output and bindings no longer
    /// reflect upstream state, so both are dropped.
    fn cancel(&mut self, id: &CellId, cause: CellId) -> RunResult {
        let error = CellError::Cancelled { cause };
        self.namespace.remove_owned(id);
        if let Some(cell) = self.graph.cell_mut(id) {
            cell.clear_output();
            cell.status = CellStatus::Stale;
            cell.error = Some(error.clone());
        }
        RunResult::new(id.clone(), RunStatus::Cancelled).with_error(error)
    }

    /// A conflicted cell never executes and never provides bindings.
    fn reject_conflicted(&mut self, id: &CellId) -> RunResult {
        let error = self.graph.conflict_error(id);
        self.namespace.remove_owned(id);
        if let Some(cell) = self.graph.cell_mut(id) {
            cell.mark_errored(error.clone());
        }
        RunResult::new(id.clone(), RunStatus::Error).with_error(error)
    }

    fn execute_cell(&mut self, id: &CellId) -> Result<RunResult> {
        let cell = self
            .graph
            .cell_mut(id)
            .ok_or_else(|| Error::Invariant(format!("planned cell {id} is not in the graph")))?;
        cell.status = CellStatus::Running;
        let source = cell.source().to_string();
        let defs = cell.defs().clone();

        if let Some(callback) = self.callback {
            callback.on_cell_started(id);
        }
        tracing::debug!("Executing cell {}", id);

        // Bindings for names the cell no longer defines must not linger.
        self.namespace
            .remove_owned_except(id, |name| defs.contains(name));

        let started = Instant::now();
        let execution = {
            let _guard = self.slot.enter();
            runtime::execute(&source, &*self.namespace, self.slot.abort_handle(), self.config)
        };
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let mut result = match execution.result {
            Ok(output) => {
                for (name, value) in execution.bindings {
                    self.namespace.insert(id, name, value);
                }
                let mut result = RunResult::new(id.clone(), RunStatus::Ok);
                result.output = output;
                result
            }
            Err(err) => {
                self.namespace.remove_owned(id);
                if err.is_interrupted() {
                    RunResult::new(id.clone(), RunStatus::Interrupted)
                        .with_error(CellError::Interrupted)
                } else {
                    RunResult::new(id.clone(), RunStatus::Error)
                        .with_error(CellError::Execution(err))
                }
            }
        };
        result.stdout = execution.stdout;
        result.elapsed_ms = elapsed_ms;

        if let Some(cell) = self.graph.cell_mut(id) {
            cell.stdout = result.stdout.clone();
            match &result.error {
                None => {
                    cell.status = CellStatus::Idle;
                    cell.output = result.output.clone();
                    cell.error = None;
                }
                Some(error) => cell.mark_errored(error.clone()),
            }
        }
        Ok(result)
    }
}
