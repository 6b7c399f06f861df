//! Diagnostics collection for advice registration and weaving.
//!
//! Weaving never aborts on a reportable problem: an advice bucket that overflows,
//! a field write before the base constructor ran, or an advice whose code
//! generator failed are all recorded here and the affected operation is skipped.
//! The host inspects the collected entries after [`crate::weaver::Weaver::weave`]
//! returns and decides whether the build fails.
//!
//! The [`Diagnostics`] container uses `boxcar::Vec` for lock-free append
//! operations, so methods woven on separate rayon workers can report without
//! synchronization.
//!
//! # Usage Examples
//!
//! ```rust
//! use dotweave::metadata::diagnostics::{
//!     Diagnostic, DiagnosticCategory, DiagnosticSeverity, Diagnostics,
//! };
//! use dotweave::metadata::token::Token;
//!
//! let diagnostics = Diagnostics::new();
//! diagnostics.push(
//!     Diagnostic::new(
//!         DiagnosticSeverity::Warning,
//!         DiagnosticCategory::FieldAccess,
//!         "address of field 'count' escapes, access is not intercepted",
//!     )
//!     .with_method(Token::new(0x06000003)),
//! );
//!
//! assert_eq!(diagnostics.warning_count(), 1);
//! assert!(!diagnostics.has_errors());
//! ```

use std::fmt::{self, Write};

use crate::{assembly::SequenceId, metadata::token::Token};

/// Severity level of a diagnostic entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DiagnosticSeverity {
    /// Informational, e.g. a hook that does not apply to a constructor shape.
    Info,
    /// Something was not woven but the output is still correct.
    Warning,
    /// The output does not implement what was registered.
    Error,
}

impl fmt::Display for DiagnosticSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticSeverity::Info => write!(f, "INFO"),
            DiagnosticSeverity::Warning => write!(f, "WARN"),
            DiagnosticSeverity::Error => write!(f, "ERROR"),
        }
    }
}

/// The stage of the pass that produced a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticCategory {
    /// Building the advice index (capacity, invalid targets).
    Registration,
    /// Instruction-level weaving and advice code generation.
    Weaving,
    /// Method-body restructuring for around advices.
    Restructuring,
    /// Constructor classification and constructor hooks.
    Constructor,
    /// Field access rewriting and accessor synthesis.
    FieldAccess,
    /// Metadata lookups.
    Metadata,
    /// Anything else.
    General,
}

impl fmt::Display for DiagnosticCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticCategory::Registration => write!(f, "Registration"),
            DiagnosticCategory::Weaving => write!(f, "Weaving"),
            DiagnosticCategory::Restructuring => write!(f, "Restructuring"),
            DiagnosticCategory::Constructor => write!(f, "Constructor"),
            DiagnosticCategory::FieldAccess => write!(f, "FieldAccess"),
            DiagnosticCategory::Metadata => write!(f, "Metadata"),
            DiagnosticCategory::General => write!(f, "General"),
        }
    }
}

/// Location of a diagnostic inside a method body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourcePosition {
    /// The sequence holding the instruction
    pub sequence: SequenceId,
    /// Index of the instruction within the sequence
    pub offset: usize,
}

/// A single diagnostic entry.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// Severity of the entry
    pub severity: DiagnosticSeverity,
    /// Stage that reported it
    pub category: DiagnosticCategory,
    /// Human readable message
    pub message: String,
    /// Method the entry is about
    pub method: Option<Token>,
    /// Other metadata member involved (field, advice target, ...)
    pub token: Option<Token>,
    /// Nearest known position inside the method body
    pub position: Option<SourcePosition>,
}

impl Diagnostic {
    /// Creates a new entry without location information.
    pub fn new(
        severity: DiagnosticSeverity,
        category: DiagnosticCategory,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            category,
            message: message.into(),
            method: None,
            token: None,
            position: None,
        }
    }

    /// Attaches the affected method.
    #[must_use]
    pub fn with_method(mut self, method: Token) -> Self {
        self.method = Some(method);
        self
    }

    /// Attaches a related metadata member.
    #[must_use]
    pub fn with_token(mut self, token: Token) -> Self {
        self.token = Some(token);
        self
    }

    /// Attaches a position inside the method body.
    #[must_use]
    pub fn with_position(mut self, sequence: SequenceId, offset: usize) -> Self {
        self.position = Some(SourcePosition { sequence, offset });
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.category, self.message)?;

        if let Some(method) = self.method {
            write!(f, " (method: {method})")?;
        }

        if let Some(token) = self.token {
            write!(f, " (token: {token})")?;
        }

        if let Some(position) = self.position {
            write!(
                f,
                " (sequence: {}, offset: {})",
                position.sequence.0, position.offset
            )?;
        }

        Ok(())
    }
}

/// Lock-free container for diagnostics reported during a pass.
#[derive(Debug)]
pub struct Diagnostics {
    entries: boxcar::Vec<Diagnostic>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}

impl Diagnostics {
    /// Creates an empty container.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: boxcar::Vec::new(),
        }
    }

    /// Records a fully built entry and mirrors it to the `log` facade.
    pub fn push(&self, diagnostic: Diagnostic) {
        match diagnostic.severity {
            DiagnosticSeverity::Info => log::debug!("{diagnostic}"),
            DiagnosticSeverity::Warning => log::warn!("{diagnostic}"),
            DiagnosticSeverity::Error => log::error!("{diagnostic}"),
        }
        self.entries.push(diagnostic);
    }

    /// Returns true if anything was recorded.
    pub fn has_any(&self) -> bool {
        self.entries.count() > 0
    }

    /// Returns true if at least one error was recorded.
    pub fn has_errors(&self) -> bool {
        self.entries
            .iter()
            .any(|(_, d)| d.severity == DiagnosticSeverity::Error)
    }

    /// Number of recorded entries.
    pub fn count(&self) -> usize {
        self.entries.count()
    }

    /// Number of recorded entries with the given severity.
    pub fn count_of(&self, severity: DiagnosticSeverity) -> usize {
        self.entries
            .iter()
            .filter(|(_, d)| d.severity == severity)
            .count()
    }

    /// Number of recorded errors.
    pub fn error_count(&self) -> usize {
        self.count_of(DiagnosticSeverity::Error)
    }

    /// Number of recorded warnings.
    pub fn warning_count(&self) -> usize {
        self.count_of(DiagnosticSeverity::Warning)
    }

    /// Iterates over all entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter().map(|(_, d)| d)
    }

    /// All errors.
    pub fn errors(&self) -> Vec<&Diagnostic> {
        self.iter()
            .filter(|d| d.severity == DiagnosticSeverity::Error)
            .collect()
    }

    /// All warnings.
    pub fn warnings(&self) -> Vec<&Diagnostic> {
        self.iter()
            .filter(|d| d.severity == DiagnosticSeverity::Warning)
            .collect()
    }

    /// All entries reported about `method`.
    pub fn for_method(&self, method: Token) -> Vec<&Diagnostic> {
        self.iter().filter(|d| d.method == Some(method)).collect()
    }

    /// All entries of `category`.
    pub fn by_category(&self, category: DiagnosticCategory) -> Vec<&Diagnostic> {
        self.iter().filter(|d| d.category == category).collect()
    }

    /// Human readable summary, errors first.
    pub fn summary(&self) -> String {
        let mut output = String::new();

        let error_count = self.error_count();
        let warning_count = self.warning_count();
        let info_count = self.count_of(DiagnosticSeverity::Info);

        let _ = writeln!(
            output,
            "Diagnostics: {} error(s), {} warning(s), {} info(s)",
            error_count, warning_count, info_count
        );

        if error_count > 0 {
            output.push_str("\nErrors:\n");
            for diag in self.errors() {
                let _ = writeln!(output, "  {diag}");
            }
        }

        if warning_count > 0 {
            output.push_str("\nWarnings:\n");
            for diag in self.warnings() {
                let _ = writeln!(output, "  {diag}");
            }
        }

        output
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_diagnostic_with_context() {
        let diag = Diagnostic::new(
            DiagnosticSeverity::Error,
            DiagnosticCategory::Weaving,
            "advice failed",
        )
        .with_method(Token(0x06000001))
        .with_position(SequenceId(3), 2);

        assert_eq!(diag.method, Some(Token(0x06000001)));
        assert_eq!(
            diag.position,
            Some(SourcePosition {
                sequence: SequenceId(3),
                offset: 2
            })
        );
        let text = diag.to_string();
        assert!(text.starts_with("[ERROR] Weaving: advice failed"));
        assert!(text.contains("method: 0x06000001"));
        assert!(text.contains("sequence: 3, offset: 2"));
    }

    #[test]
    fn test_diagnostics_container() {
        let diagnostics = Diagnostics::new();

        for (severity, category, message) in [
            (DiagnosticSeverity::Info, DiagnosticCategory::Constructor, "skipped"),
            (DiagnosticSeverity::Warning, DiagnosticCategory::FieldAccess, "address escapes"),
            (DiagnosticSeverity::Error, DiagnosticCategory::Registration, "too many advices"),
        ] {
            diagnostics.push(Diagnostic::new(severity, category, message));
        }

        assert_eq!(diagnostics.count(), 3);
        assert_eq!(diagnostics.error_count(), 1);
        assert_eq!(diagnostics.warning_count(), 1);
        assert!(diagnostics.has_errors());
        assert_eq!(
            diagnostics.by_category(DiagnosticCategory::FieldAccess).len(),
            1
        );
        assert!(diagnostics.summary().contains("1 error(s), 1 warning(s), 1 info(s)"));
    }

    #[test]
    fn test_diagnostics_for_method() {
        let diagnostics = Diagnostics::new();
        diagnostics.push(
            Diagnostic::new(DiagnosticSeverity::Warning, DiagnosticCategory::Weaving, "a")
                .with_method(Token(0x06000001)),
        );
        diagnostics.push(
            Diagnostic::new(DiagnosticSeverity::Warning, DiagnosticCategory::Weaving, "b")
                .with_method(Token(0x06000002)),
        );

        assert_eq!(diagnostics.for_method(Token(0x06000002)).len(), 1);
        assert_eq!(diagnostics.for_method(Token(0x06000003)).len(), 0);
    }

    #[test]
    fn test_diagnostics_concurrent_push() {
        let diagnostics = Arc::new(Diagnostics::new());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let diagnostics = Arc::clone(&diagnostics);
                thread::spawn(move || {
                    for j in 0..25 {
                        diagnostics.push(Diagnostic::new(
                            DiagnosticSeverity::Warning,
                            DiagnosticCategory::Weaving,
                            format!("{i}/{j}"),
                        ));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(diagnostics.warning_count(), 100);
    }
}
