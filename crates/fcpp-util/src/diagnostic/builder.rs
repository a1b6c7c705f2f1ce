//! Fluent construction of diagnostics.

use super::{Diagnostic, DiagnosticCode, Level};
use crate::span::Span;

/// Builder for [`Diagnostic`] values.
///
/// # Examples
///
/// ```
/// use fcpp_util::diagnostic::{DiagnosticBuilder, E_SEMA_UNDECLARED};
/// use fcpp_util::Span;
///
/// let diag = DiagnosticBuilder::error("use of undeclared identifier 'frobnicate'")
///     .code(E_SEMA_UNDECLARED)
///     .span(Span::DUMMY)
///     .help("did you mean 'frobnicate_all'?")
///     .build();
/// assert_eq!(diag.helps.len(), 1);
/// ```
pub struct DiagnosticBuilder {
    diagnostic: Diagnostic,
}

impl DiagnosticBuilder {
    /// Start an error diagnostic.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            diagnostic: Diagnostic::error(message, Span::DUMMY),
        }
    }

    /// Start a warning diagnostic.
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            diagnostic: Diagnostic::warning(message, Span::DUMMY),
        }
    }

    /// Override the severity level.
    pub fn level(mut self, level: Level) -> Self {
        self.diagnostic.level = level;
        self
    }

    /// Attach a stable code.
    pub fn code(mut self, code: DiagnosticCode) -> Self {
        self.diagnostic.code = Some(code);
        self
    }

    /// Set the primary span.
    pub fn span(mut self, span: Span) -> Self {
        self.diagnostic.span = span;
        self
    }

    /// Add a note line.
    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.diagnostic.notes.push(note.into());
        self
    }

    /// Add a help line.
    pub fn help(mut self, help: impl Into<String>) -> Self {
        self.diagnostic.helps.push(help.into());
        self
    }

    /// Finish building.
    pub fn build(self) -> Diagnostic {
        self.diagnostic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_accumulates() {
        let diag = DiagnosticBuilder::error("boom")
            .note("context")
            .note("more context")
            .help("fix it")
            .build();
        assert_eq!(diag.level, Level::Error);
        assert_eq!(diag.notes.len(), 2);
        assert_eq!(diag.helps.len(), 1);
    }

    #[test]
    fn test_warning_builder() {
        let diag = DiagnosticBuilder::warning("narrowing conversion").build();
        assert_eq!(diag.level, Level::Warning);
    }
}
