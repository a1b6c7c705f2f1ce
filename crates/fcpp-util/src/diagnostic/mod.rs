//! Error and warning reporting infrastructure.
//!
//! Diagnostics render in the fixed `file:line:column: level: message` form on
//! stderr. Errors accumulate in a [`Handler`]; warnings are reported but do
//! not affect the process exit code. The parser keeps going after recoverable
//! errors, so a single run can surface many diagnostics.
//!
//! # Examples
//!
//! ```
//! use fcpp_util::diagnostic::{Handler, DiagnosticBuilder, E_PARSE_UNEXPECTED_TOKEN};
//! use fcpp_util::Span;
//!
//! let handler = Handler::new();
//! handler.report(
//!     DiagnosticBuilder::error("expected ';' after declaration")
//!         .code(E_PARSE_UNEXPECTED_TOKEN)
//!         .span(Span::DUMMY)
//!         .build(),
//! );
//! assert!(handler.has_errors());
//! ```

mod builder;
mod codes;

pub use builder::DiagnosticBuilder;
pub use codes::DiagnosticCode;

pub use codes::{
    E_CODEGEN_INTERNAL, E_CODEGEN_UNRESOLVED_SYMBOL, E_CONSTEVAL_DIV_BY_ZERO,
    E_CONSTEVAL_NOT_CONSTANT, E_CONSTEVAL_OVERFLOW, E_LEX_INVALID_CHAR, E_LEX_INVALID_NUMBER,
    E_LEX_UNTERMINATED_CHAR, E_LEX_UNTERMINATED_STRING, E_PARSE_DUPLICATE_DEF,
    E_PARSE_EXPECTED_TOKEN, E_PARSE_UNEXPECTED_EOF, E_PARSE_UNEXPECTED_TOKEN,
    E_SEMA_STATIC_ASSERT, E_SEMA_TYPE_MISMATCH, E_SEMA_UNDECLARED,
    E_TEMPLATE_NO_MATCH, E_TEMPLATE_RECURSION, W_NARROWING_CONVERSION, W_UNUSED_VARIABLE,
};

use crate::span::{SourceMap, Span};
use std::cell::{Cell, RefCell};
use std::fmt;

/// Diagnostic severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    /// Prevents compilation; non-zero exit.
    Error,
    /// Reported, does not affect the exit code.
    Warning,
    /// Attached context line.
    Note,
    /// Attached suggestion line.
    Help,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Error => write!(f, "error"),
            Level::Warning => write!(f, "warning"),
            Level::Note => write!(f, "note"),
            Level::Help => write!(f, "help"),
        }
    }
}

/// A single diagnostic message.
#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub level: Level,
    pub message: String,
    pub span: Span,
    pub code: Option<DiagnosticCode>,
    pub notes: Vec<String>,
    pub helps: Vec<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>, span: Span) -> Self {
        Self {
            level: Level::Error,
            message: message.into(),
            span,
            code: None,
            notes: Vec::new(),
            helps: Vec::new(),
        }
    }

    pub fn warning(message: impl Into<String>, span: Span) -> Self {
        Self {
            level: Level::Warning,
            ..Self::error(message, span)
        }
    }

    /// Render as `file:line:column: level: message`, with note/help lines
    /// indented below.
    pub fn render(&self, sources: &SourceMap) -> String {
        let mut out = format!(
            "{}:{}:{}: {}: {}",
            sources.name(self.span.file_id),
            self.span.line,
            self.span.column,
            self.level,
            self.message
        );
        for note in &self.notes {
            out.push_str(&format!("\n  note: {note}"));
        }
        for help in &self.helps {
            out.push_str(&format!("\n  help: {help}"));
        }
        out
    }
}

/// Collects diagnostics for one translation unit.
///
/// Interior mutability keeps reporting available from `&self` contexts deep
/// in the parser without threading `&mut` everywhere.
#[derive(Debug, Default)]
pub struct Handler {
    diagnostics: RefCell<Vec<Diagnostic>>,
    errors: Cell<usize>,
    warnings: Cell<usize>,
}

impl Handler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a diagnostic.
    pub fn report(&self, diagnostic: Diagnostic) {
        match diagnostic.level {
            Level::Error => self.errors.set(self.errors.get() + 1),
            Level::Warning => self.warnings.set(self.warnings.get() + 1),
            _ => {}
        }
        self.diagnostics.borrow_mut().push(diagnostic);
    }

    /// Shorthand for a plain error.
    pub fn error(&self, message: impl Into<String>, span: Span) {
        self.report(Diagnostic::error(message, span));
    }

    /// Shorthand for a plain warning.
    pub fn warning(&self, message: impl Into<String>, span: Span) {
        self.report(Diagnostic::warning(message, span));
    }

    /// True if any error has been reported.
    pub fn has_errors(&self) -> bool {
        self.errors.get() > 0
    }

    /// Number of errors reported so far.
    pub fn error_count(&self) -> usize {
        self.errors.get()
    }

    /// Number of warnings reported so far.
    pub fn warning_count(&self) -> usize {
        self.warnings.get()
    }

    /// Drain all collected diagnostics in report order.
    pub fn take(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics.borrow_mut())
    }

    /// Render every diagnostic to a string, one per line group.
    pub fn render_all(&self, sources: &SourceMap) -> String {
        self.diagnostics
            .borrow()
            .iter()
            .map(|d| d.render(sources))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_format() {
        let mut sources = SourceMap::new();
        let file = sources.add_file("main.cpp", "int x@;\n");
        let span = Span::with_file(5, 6, file, 1, 6);
        let diag = Diagnostic::error("invalid character '@'", span);
        assert_eq!(
            diag.render(&sources),
            "main.cpp:1:6: error: invalid character '@'"
        );
    }

    #[test]
    fn test_handler_counts() {
        let handler = Handler::new();
        handler.error("bad", Span::DUMMY);
        handler.warning("meh", Span::DUMMY);
        handler.error("worse", Span::DUMMY);
        assert!(handler.has_errors());
        assert_eq!(handler.error_count(), 2);
        assert_eq!(handler.warning_count(), 1);
    }

    #[test]
    fn test_warnings_alone_are_not_errors() {
        let handler = Handler::new();
        handler.warning("unused variable 'x'", Span::DUMMY);
        assert!(!handler.has_errors());
    }

    #[test]
    fn test_take_drains() {
        let handler = Handler::new();
        handler.error("one", Span::DUMMY);
        assert_eq!(handler.take().len(), 1);
        assert!(handler.take().is_empty());
        // Counters survive the drain.
        assert_eq!(handler.error_count(), 1);
    }

    #[test]
    fn test_notes_render_indented() {
        let sources = SourceMap::new();
        let mut diag = Diagnostic::error("duplicate definition of 'f'", Span::DUMMY);
        diag.notes.push("previous definition is here".to_string());
        let rendered = diag.render(&sources);
        assert!(rendered.contains("\n  note: previous definition is here"));
    }
}
