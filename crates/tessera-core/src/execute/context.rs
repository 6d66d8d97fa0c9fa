//! Execution slot, cancellation and progress callbacks.
//!
//! Interruption is cooperative: the interpreter polls the abort flag between
//! statements, on every loop iteration and while sleeping.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::result::RunResult;
use crate::graph::CellId;

/// Handle for cooperative cancellation of cell execution.
///
/// `AbortHandle` can be cloned and shared across threads; an abort through
/// any clone is visible to all other clones.
///
/// # Example
///
/// ```
/// use tessera_core::execute::AbortHandle;
///
/// let handle = AbortHandle::new();
/// let handle_clone = handle.clone();
///
/// assert!(!handle.is_aborted());
/// handle_clone.abort();
/// assert!(handle.is_aborted());
/// ```
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    aborted: Arc<AtomicBool>,
}

impl AbortHandle {
    /// Create a new abort handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if abort has been requested.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }

    /// Request abort of execution.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Relaxed);
    }

    /// Reset the abort flag.
    pub fn reset(&self) {
        self.aborted.store(false, Ordering::Relaxed);
    }
}

/// The single execution context of a session.
///
/// Clones share state, so the kernel handle can interrupt a cell while the
/// worker that owns the session is blocked executing it.
#[derive(Debug, Clone, Default)]
pub struct ExecutionSlot {
    abort: AbortHandle,
    busy: Arc<AtomicBool>,
}

impl ExecutionSlot {
    /// Create an idle slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort the running cell. Returns `false` (and does nothing) when no
    /// cell is running.
    pub fn interrupt(&self) -> bool {
        if self.busy.load(Ordering::SeqCst) {
            self.abort.abort();
            true
        } else {
            false
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Claim the slot for one cell. The slot is released when the guard drops.
    pub fn enter(&self) -> SlotGuard<'_> {
        self.abort.reset();
        self.busy.store(true, Ordering::SeqCst);
        SlotGuard { slot: self }
    }

    pub fn abort_handle(&self) -> &AbortHandle {
        &self.abort
    }
}

/// Marks the slot busy while alive.
#[derive(Debug)]
pub struct SlotGuard<'a> {
    slot: &'a ExecutionSlot,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.slot.busy.store(false, Ordering::SeqCst);
    }
}

/// Callback trait for execution progress reporting.
///
/// Results are reported as soon as each cell finishes, so observers see
/// partial progress of a plan.
pub trait ExecutionCallback: Send + Sync {
    /// Called once for every cell of a plan before the first one starts.
    fn on_cell_queued(&self, _cell_id: &CellId) {}

    /// Called when a cell starts executing.
    fn on_cell_started(&self, cell_id: &CellId);

    /// Called with the final result of every cell in the plan, including
    /// cancelled and skipped ones.
    fn on_cell_finished(&self, result: &RunResult);
}
