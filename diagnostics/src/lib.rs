//! Diagnostics for C declaration processing
//!
//! Errors found while parsing or lowering declaration text are turned into
//! [`Diagnostic`] values that carry a severity, a span, labels, notes and help
//! lines. [`ErrorFormatter`] renders them
//! with the offending source line and a caret underline.

use std::fmt;

pub use source_map::{FileId, SourceFile, SourceMap, SourcePosition, SourceSpan};

/// Severity level for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiagnosticSeverity {
    Error,
    Warning,
    Note,
}

impl fmt::Display for DiagnosticSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticSeverity::Error => write!(f, "error"),
            DiagnosticSeverity::Warning => write!(f, "warning"),
            DiagnosticSeverity::Note => write!(f, "note"),
        }
    }
}

/// A message attached to a span of declaration text
#[derive(Debug, Clone)]
pub struct Label {
    pub span: SourceSpan,
    pub message: String,
}

impl Label {
    pub fn new(span: SourceSpan, message: impl Into<String>) -> Self {
        Self {
            span,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: DiagnosticSeverity,
    pub code: Option<String>,
    pub message: String,
    pub span: SourceSpan,
    pub labels: Vec<Label>,
    pub notes: Vec<String>,
    pub help: Vec<String>,
}

impl Diagnostic {
    pub fn line(&self) -> usize {
        self.span.start.line
    }
}

/// Builder for creating diagnostics
pub struct DiagnosticBuilder {
    diagnostic: Diagnostic,
}

impl DiagnosticBuilder {
    fn with_severity(
        severity: DiagnosticSeverity,
        message: impl Into<String>,
        span: SourceSpan,
    ) -> Self {
        Self {
            diagnostic: Diagnostic {
                severity,
                code: None,
                message: message.into(),
                span,
                labels: vec![],
                notes: vec![],
                help: vec![],
            },
        }
    }

    pub fn error(message: impl Into<String>, span: SourceSpan) -> Self {
        Self::with_severity(DiagnosticSeverity::Error, message, span)
    }

    pub fn warning(message: impl Into<String>, span: SourceSpan) -> Self {
        Self::with_severity(DiagnosticSeverity::Warning, message, span)
    }

    pub fn code(mut self, code: impl Into<String>) -> Self {
        self.diagnostic.code = Some(code.into());
        self
    }

    pub fn label(mut self, span: SourceSpan, message: impl Into<String>) -> Self {
        self.diagnostic.labels.push(Label::new(span, message));
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.diagnostic.notes.push(note.into());
        self
    }

    pub fn help(mut self, help: impl Into<String>) -> Self {
        self.diagnostic.help.push(help.into());
        self
    }

    pub fn build(self) -> Diagnostic {
        self.diagnostic
    }
}

/// Renders diagnostics as text with source snippets
pub struct ErrorFormatter {
    use_colors: bool,
}

const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[96m";
const GREEN: &str = "\x1b[32m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

impl ErrorFormatter {
    pub fn new() -> Self {
        Self { use_colors: false }
    }

    pub fn with_colors() -> Self {
        Self { use_colors: true }
    }

    fn paint(&self, color: &str, text: &str) -> String {
        if self.use_colors {
            format!("{color}{text}{RESET}")
        } else {
            text.to_string()
        }
    }

    pub fn format_diagnostic(&self, diagnostic: &Diagnostic, source_map: &SourceMap) -> String {
        let mut output = String::new();

        let severity_color = match diagnostic.severity {
            DiagnosticSeverity::Error => RED,
            DiagnosticSeverity::Warning => YELLOW,
            DiagnosticSeverity::Note => CYAN,
        };
        let mut header = diagnostic.severity.to_string();
        if let Some(code) = &diagnostic.code {
            header.push_str(&format!("[{code}]"));
        }
        output.push_str(&self.paint(severity_color, &header));
        output.push_str(": ");
        output.push_str(&self.paint(BOLD, &diagnostic.message));
        output.push('\n');

        let span = &diagnostic.span;
        if let Some(file) = source_map.get_file(span.file_id) {
            let gutter = span.start.line.to_string().len();
            output.push_str(&format!(
                "{:gutter$}{} {}:{}:{}\n",
                "",
                self.paint(CYAN, "-->"),
                file.name,
                span.start.line,
                span.start.column
            ));

            if let Some(line) = file.line_text(span.start.line) {
                let bar = self.paint(CYAN, "|");
                output.push_str(&format!("{:gutter$} {bar}\n", ""));
                output.push_str(&format!(
                    "{} {bar} {line}\n",
                    self.paint(CYAN, &span.start.line.to_string())
                ));

                let padding = " ".repeat(span.start.column.saturating_sub(1));
                let width = underline_width(span, line);
                output.push_str(&format!(
                    "{:gutter$} {bar} {padding}{}",
                    "",
                    self.paint(severity_color, &"^".repeat(width))
                ));
                if let Some(label) = diagnostic.labels.first() {
                    output.push(' ');
                    output.push_str(&self.paint(severity_color, &label.message));
                }
                output.push('\n');
            }
        }

        for help in &diagnostic.help {
            output.push_str(&format!("   {}: {help}\n", self.paint(GREEN, "help")));
        }
        for note in &diagnostic.notes {
            output.push_str(&format!("   {}: {note}\n", self.paint(CYAN, "note")));
        }

        output
    }
}

impl Default for ErrorFormatter {
    fn default() -> Self {
        Self::new()
    }
}

/// Width of the caret underline, falling back to the identifier under the
/// cursor when the span is empty or covers several lines
fn underline_width(span: &SourceSpan, line: &str) -> usize {
    if span.start.line == span.end.line && span.end.column > span.start.column + 1 {
        return span.end.column - span.start.column;
    }
    let start = span.start.column.saturating_sub(1);
    let word = line
        .get(start..)
        .unwrap_or("")
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .count();
    word.max(1)
}

pub mod cdecl;

#[cfg(test)]
mod tests {
    use super::*;

    fn span_in(map: &SourceMap, file: FileId, start: usize, end: usize) -> SourceSpan {
        map.span(file, start, end).unwrap()
    }

    #[test]
    fn test_diagnostic_builder() {
        let mut map = SourceMap::new();
        let file = map.add_file("<cdef #0>", "foo_t x;");
        let span = span_in(&map, file, 0, 5);

        let diagnostic = DiagnosticBuilder::error("unknown type name 'foo_t'", span)
            .code("C0101")
            .label(span, "not declared")
            .help("declare it with a typedef first")
            .note("typedef names must be declared before use")
            .build();

        assert_eq!(diagnostic.severity, DiagnosticSeverity::Error);
        assert_eq!(diagnostic.code.as_deref(), Some("C0101"));
        assert_eq!(diagnostic.line(), 1);
        assert_eq!(diagnostic.labels.len(), 1);
        assert_eq!(diagnostic.help.len(), 1);
        assert_eq!(diagnostic.notes.len(), 1);
    }

    #[test]
    fn test_format_plain() {
        let mut map = SourceMap::new();
        let file = map.add_file("<cdef #3>", "int a;\nfoo_t x;\n");
        let span = span_in(&map, file, 7, 12);
        let diagnostic = DiagnosticBuilder::error("unknown type name 'foo_t'", span)
            .label(span, "not declared")
            .build();

        let text = ErrorFormatter::new().format_diagnostic(&diagnostic, &map);
        assert!(text.starts_with("error: unknown type name 'foo_t'\n"));
        assert!(text.contains("--> <cdef #3>:2:1"));
        assert!(text.contains("2 | foo_t x;"));
        assert!(text.contains("  | ^^^^^ not declared"));
    }

    #[test]
    fn test_underline_falls_back_to_word() {
        let mut map = SourceMap::new();
        let file = map.add_file("t", "struct Node *next;");
        let span = span_in(&map, file, 7, 7);
        assert_eq!(underline_width(&span, "struct Node *next;"), 4);
    }
}
