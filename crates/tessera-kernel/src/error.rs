//! Error types for the Tessera kernel.

use tessera_core::graph::CellId;

/// Kernel error type.
///
/// Everything except [`KernelError::Fatal`] rejects a single request and
/// leaves the session running.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// Tessera core error.
    #[error("Core error: {0}")]
    Core(#[from] tessera_core::Error),

    /// A request referenced a cell that does not exist.
    #[error("Cell not found: {0}")]
    UnknownCell(CellId),

    /// The request is well-formed but cannot be applied.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The kernel loop has stopped.
    #[error("Kernel has shut down")]
    Shutdown,

    /// Internal state is corrupted; the session loop stops.
    #[error("Fatal kernel error: {0}")]
    Fatal(String),
}

impl KernelError {
    /// Whether this error must stop the session loop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KernelError::Fatal(_) | KernelError::Core(tessera_core::Error::Invariant(_))
        )
    }
}

/// Result type for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;
