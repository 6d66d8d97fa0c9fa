//! Execution errors raised while running a cell.

use proc_macro2::Span;
use serde::{Deserialize, Serialize};

/// Category of an execution error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecErrorKind {
    Syntax,
    Name,
    Type,
    Arithmetic,
    Index,
    Panic,
    Unsupported,
    Interrupted,
}

impl std::fmt::Display for ExecErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecErrorKind::Syntax => "syntax error",
            ExecErrorKind::Name => "name error",
            ExecErrorKind::Type => "type error",
            ExecErrorKind::Arithmetic => "arithmetic error",
            ExecErrorKind::Index => "index error",
            ExecErrorKind::Panic => "panic",
            ExecErrorKind::Unsupported => "unsupported",
            ExecErrorKind::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

/// An error raised by a cell during execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}{}: {message}", line.map(|l| format!(" (line {l})")).unwrap_or_default())]
pub struct ExecError {
    pub kind: ExecErrorKind,
    pub message: String,
    /// 1-based line within the cell source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
}

impl ExecError {
    pub fn new(kind: ExecErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            line: None,
        }
    }

    pub fn name(message: impl Into<String>) -> Self {
        Self::new(ExecErrorKind::Name, message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ExecErrorKind::Type, message)
    }

    pub fn arithmetic(message: impl Into<String>) -> Self {
        Self::new(ExecErrorKind::Arithmetic, message)
    }

    pub fn index(message: impl Into<String>) -> Self {
        Self::new(ExecErrorKind::Index, message)
    }

    pub fn panic(message: impl Into<String>) -> Self {
        Self::new(ExecErrorKind::Panic, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ExecErrorKind::Unsupported, message)
    }

    pub fn interrupted() -> Self {
        Self::new(ExecErrorKind::Interrupted, "execution interrupted")
    }

    pub fn is_interrupted(&self) -> bool {
        self.kind == ExecErrorKind::Interrupted
    }

    /// Convert a parse failure, mapping its position back onto the cell source.
    pub(crate) fn syntax(err: &syn::Error) -> Self {
        let mut error = Self::new(ExecErrorKind::Syntax, err.to_string());
        error.line = source_line(err.span());
        error
    }

    /// Attach the line of `span` unless a more precise line is already known.
    pub(crate) fn at(mut self, span: Span) -> Self {
        if self.line.is_none() {
            self.line = source_line(span);
        }
        self
    }
}

/// Cell sources are parsed wrapped in `{\n ... \n}`, so line 1 of the cell is
/// line 2 of the parsed text.
fn source_line(span: Span) -> Option<usize> {
    let line = span.start().line;
    (line > 1).then(|| line - 1)
}
