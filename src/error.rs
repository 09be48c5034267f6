//! Error types surfaced at the crate's public boundary (spec §7,
//! EXPANSION 7.1).
//!
//! Compile-time problems are carried as [`Diagnostic`]s (teacher grounding:
//! `diagnostic.rs`'s level/code/message/span shape, trimmed to what this
//! core actually produces). Execution-time problems are a
//! [`RuntimeError`] with a kind and a stack trace. [`CoreError`] is the one
//! error type every fallible public API returns.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of a [`Diagnostic`]. The compiler only ever raises `Error`
/// diagnostics; `Warning` exists for forward compatibility with a
/// collaborator lint pass that might run the same resolver/compiler ahead of
/// full compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticLevel {
    Error,
    Warning,
}

impl fmt::Display for DiagnosticLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticLevel::Error => write!(f, "error"),
            DiagnosticLevel::Warning => write!(f, "warning"),
        }
    }
}

/// A single compile-time diagnostic: level, message, and the source line it
/// was raised against (spec §7: "CompileError — surfaced during compilation
/// with line and message").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub message: String,
    pub line: u32,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>, line: u32) -> Self {
        Self {
            level: DiagnosticLevel::Error,
            message: message.into(),
            line,
        }
    }
}

/// Serialize a batch of diagnostics for a collaborator (LSP, CLI `--json`
/// flag) that wants them over a wire rather than printed to a terminal.
pub fn diagnostics_to_json(diagnostics: &[Diagnostic]) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(diagnostics)
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at line {}: {}", self.level, self.line, self.message)
    }
}

/// One frame of a runtime stack trace, assembled from each live call frame's
/// `ip` and line table (spec §4.6 "Exceptions").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub function_name: String,
    pub line: u32,
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "  at {} (line {})", self.function_name, self.line)
    }
}

/// Runtime error subkinds (spec §7).
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeErrorKind {
    TypeError(String),
    DivisionByZero,
    IndexError(String),
    KeyError(String),
    /// Arity mismatch or attempt to call a non-callable value.
    CallError(String),
    StackOverflow,
    AssertionFailed(String),
    Panic(String),
    /// A value thrown by `throw` that unwound past every handler.
    UserException(Value),
    /// Raised at a suspension point of a cancelled task (spec §5).
    Cancelled,
}

impl fmt::Display for RuntimeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeErrorKind::TypeError(m) => write!(f, "TypeError: {m}"),
            RuntimeErrorKind::DivisionByZero => write!(f, "DivisionByZero"),
            RuntimeErrorKind::IndexError(m) => write!(f, "IndexError: {m}"),
            RuntimeErrorKind::KeyError(m) => write!(f, "KeyError: {m}"),
            RuntimeErrorKind::CallError(m) => write!(f, "CallError: {m}"),
            RuntimeErrorKind::StackOverflow => write!(f, "StackOverflow"),
            RuntimeErrorKind::AssertionFailed(m) => write!(f, "AssertionFailed: {m}"),
            RuntimeErrorKind::Panic(m) => write!(f, "Panic: {m}"),
            RuntimeErrorKind::UserException(v) => {
                write!(f, "uncaught exception: {}", v.to_display_string())
            }
            RuntimeErrorKind::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// A runtime error together with the stack trace assembled while unwinding
/// (spec §7: "RuntimeError — surfaced during execution with line and a
/// stack trace").
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub line: u32,
    pub trace: Vec<TraceFrame>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} (line {})", self.kind, self.line)?;
        for frame in &self.trace {
            writeln!(f, "{frame}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

/// The crate's single top-level error type (EXPANSION 7.1).
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("{} compile error(s):\n{}", .0.len(), .0.iter().map(|d| d.to_string()).collect::<Vec<_>>().join("\n"))]
    Compile(Vec<Diagnostic>),

    #[error("{0}")]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Module(#[from] crate::chunk::ModuleError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostics_round_trip_through_json() {
        let diags = vec![Diagnostic::error("unexpected token", 3), Diagnostic::error("undeclared name 'x'", 7)];
        let json = diagnostics_to_json(&diags).unwrap();
        let back: Vec<Diagnostic> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, diags);
    }
}
