//! Compile-time diagnostics
//!
//! Every compiler error flows through this one type, the way the reference
//! runtime funnels lexer/parser/interpreter errors through a single
//! `Diagnostic` struct instead of ad hoc `String` errors at each call site.

use crate::span::Line;
use std::fmt;

/// A single compile-time diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub line: Line,
    /// The offending token's lexeme, or `None` for EOF/unlocated errors.
    pub at: Option<String>,
    pub message: String,
}

impl Diagnostic {
    pub fn new(line: Line, at: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            line,
            at: at.map(|s| s.to_string()),
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.at {
            Some(lexeme) => write!(
                f,
                "[line {}] Error at '{}': {}",
                self.line, lexeme, self.message
            ),
            None => write!(f, "[line {}] Error: {}", self.line, self.message),
        }
    }
}

/// Compilation failed; carries every diagnostic accumulated across the pass
/// (panic-mode recovery means at most one per statement, per spec §4.2).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("compilation failed with {} error(s)", .0.len())]
pub struct CompileError(pub Vec<Diagnostic>);

impl CompileError {
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_located_diagnostic() {
        let d = Diagnostic::new(Line(3), Some("+"), "Expect expression.");
        assert_eq!(
            d.to_string(),
            "[line 3] Error at '+': Expect expression."
        );
    }

    #[test]
    fn formats_unlocated_diagnostic() {
        let d = Diagnostic::new(Line(1), None, "Expect expression.");
        assert_eq!(d.to_string(), "[line 1] Error: Expect expression.");
    }
}
