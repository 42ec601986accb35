//! Diagnostic collection for the compilation pipeline.
//!
//! The parser keeps compiling after an error so that one run surfaces as
//! many problems as possible; every error lands here instead of aborting.

use std::fmt;

use crate::position::line_column;

/// Diagnostic severity level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    /// An error that prevents execution of the compiled output.
    Error,
    /// A warning that does not prevent execution.
    Warning,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Error => write!(f, "error"),
            Level::Warning => write!(f, "warning"),
        }
    }
}

/// A single reported problem, anchored to a byte offset in the source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    pub level: Level,
    pub message: String,
    /// Byte offset into the source, or `None` for end-of-input errors.
    pub index: Option<u32>,
}

impl Diagnostic {
    /// Renders the diagnostic the way the CLI prints it, resolving the
    /// byte offset against `source`.
    pub fn render(&self, source: &str) -> String {
        match self.index {
            Some(index) => {
                let (line, column) = line_column(source, index);
                format!("at {}:{} in script: {}", line, column, self.message)
            }
            None => format!("at EOF: {}", self.message),
        }
    }
}

/// Sink for diagnostics produced during lexing, parsing and compilation.
#[derive(Debug, Default)]
pub struct Handler {
    diagnostics: Vec<Diagnostic>,
    errors: usize,
}

impl Handler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports an error at a byte offset.
    pub fn error(&mut self, message: impl Into<String>, index: u32) {
        self.errors += 1;
        self.diagnostics.push(Diagnostic {
            level: Level::Error,
            message: message.into(),
            index: Some(index),
        });
    }

    /// Reports an error at end of input.
    pub fn error_at_eof(&mut self, message: impl Into<String>) {
        self.errors += 1;
        self.diagnostics.push(Diagnostic {
            level: Level::Error,
            message: message.into(),
            index: None,
        });
    }

    /// Reports a warning at a byte offset.
    pub fn warning(&mut self, message: impl Into<String>, index: u32) {
        self.diagnostics.push(Diagnostic {
            level: Level::Warning,
            message: message.into(),
            index: Some(index),
        });
    }

    pub fn has_errors(&self) -> bool {
        self.errors > 0
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Drains the collected diagnostics, resetting the handler.
    pub fn take(&mut self) -> Vec<Diagnostic> {
        self.errors = 0;
        std::mem::take(&mut self.diagnostics)
    }

    /// Drops diagnostics reported after `len`, for speculative parses that
    /// were rolled back.
    pub fn truncate(&mut self, len: usize) {
        self.diagnostics.truncate(len);
        self.errors = self
            .diagnostics
            .iter()
            .filter(|diagnostic| diagnostic.level == Level::Error)
            .count();
    }
}
