//! Failure records.
//!
//! A plan that cannot be built or performed carries an `Explanation`
//! describing why; the kind separates caller mistakes from definition
//! mistakes from internal bugs. Grammar-file syntax problems use
//! `GrammarFileError`, which keeps the offending line for display.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExplanationKind {
    /// The dancer call is impossible or semantically wrong.
    UserError,
    /// The definition invoked a primitive incorrectly.
    DefinitionError,
    /// An unexpected internal state.
    ProgramBug,
}

#[derive(Debug, Clone)]
pub struct Explanation {
    pub kind: ExplanationKind,
    pub text: String,
}

impl Explanation {
    pub fn new(kind: ExplanationKind, text: impl Into<String>) -> Explanation {
        Explanation {
            kind,
            text: text.into(),
        }
    }
}

impl fmt::Display for Explanation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.kind {
            ExplanationKind::UserError => "call error",
            ExplanationKind::DefinitionError => "definition error",
            ExplanationKind::ProgramBug => "internal error",
        };
        write!(f, "{}: {}", label, self.text)
    }
}

#[derive(Debug, Clone)]
pub struct GrammarFileError {
    pub line: usize,
    pub message: String,
}

impl GrammarFileError {
    pub fn new(line: usize, message: impl Into<String>) -> GrammarFileError {
        GrammarFileError {
            line,
            message: message.into(),
        }
    }
}

impl fmt::Display for GrammarFileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for GrammarFileError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explanation_displays_its_kind() {
        let e = Explanation::new(ExplanationKind::UserError, "no one can run");
        assert_eq!(e.to_string(), "call error: no one can run");
        let e = Explanation::new(ExplanationKind::ProgramBug, "unfinished");
        assert!(e.to_string().starts_with("internal error"));
    }

    #[test]
    fn grammar_file_error_carries_line() {
        let e = GrammarFileError::new(12, "Synonym missing =");
        assert_eq!(e.to_string(), "line 12: Synonym missing =");
    }
}
