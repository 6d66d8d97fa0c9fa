//! Dependency graph over cells.
//!
//! This module provides:
//! - The cell model and static analysis of cell source into defs and refs
//! - Edge derivation from defs and refs, with conflict marking
//! - Ancestor/descendant queries and cycle detection

mod analyzer;
mod cell;
mod engine;
mod types;

pub use analyzer::{Analysis, analyze};
pub use cell::Cell;
pub use engine::{DependencyGraph, GraphChange};
pub use types::{CellId, CellStatus};
