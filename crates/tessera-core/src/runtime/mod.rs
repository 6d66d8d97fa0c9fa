//! Cell runtime: values, the shared namespace and the interpreter.

mod error;
pub mod format;
mod interpreter;
mod namespace;
mod value;

pub use error::{ExecError, ExecErrorKind};
pub use interpreter::{Execution, RuntimeConfig, execute, parse_cell};
pub use namespace::Namespace;
pub use value::Value;
