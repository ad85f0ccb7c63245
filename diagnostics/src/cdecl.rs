//! Diagnostic builders for C declaration errors
//!
//! Codes are grouped by phase: `C01xx` for syntax, `C02xx` for names and
//! definitions, `C03xx` for constant expressions and layout.

use crate::{Diagnostic, DiagnosticBuilder, SourceSpan};

pub struct CDeclDiagnostics;

impl CDeclDiagnostics {
    pub fn syntax_error(span: SourceSpan, message: &str, expected: &[&str]) -> Diagnostic {
        let mut builder = DiagnosticBuilder::error(message.to_string(), span)
            .code("C0101")
            .label(span, "parse error here");
        if !expected.is_empty() {
            builder = builder.help(format!("expected {}", expected.join(" or ")));
        }
        builder.build()
    }

    pub fn unknown_type_name(span: SourceSpan, name: &str) -> Diagnostic {
        DiagnosticBuilder::error(format!("unknown type name '{}'", name), span)
            .code("C0201")
            .label(span, "not declared")
            .help(format!("declare it first, e.g. `typedef int {};`", name))
            .build()
    }

    pub fn redefinition(span: SourceSpan, what: &str) -> Diagnostic {
        DiagnosticBuilder::error(format!("redefinition of {}", what), span)
            .code("C0202")
            .label(span, "already defined")
            .build()
    }

    pub fn conflicting_typedef(span: SourceSpan, name: &str) -> Diagnostic {
        DiagnosticBuilder::error(format!("conflicting types for typedef '{}'", name), span)
            .code("C0203")
            .label(span, "previous typedef differs")
            .build()
    }

    pub fn unsupported(span: SourceSpan, what: &str) -> Diagnostic {
        DiagnosticBuilder::error(format!("{} are not supported", what), span)
            .code("C0204")
            .label(span, "here")
            .build()
    }

    pub fn invalid_constant(span: SourceSpan, message: &str) -> Diagnostic {
        DiagnosticBuilder::error(message.to_string(), span)
            .code("C0301")
            .label(span, "in this constant expression")
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SourceMap;

    #[test]
    fn test_codes_and_help() {
        let mut map = SourceMap::new();
        let file = map.add_file("t", "struct P { int x; };");
        let span = map.span(file, 0, 8).unwrap();

        let d = CDeclDiagnostics::redefinition(span, "struct P");
        assert_eq!(d.code.as_deref(), Some("C0202"));
        assert_eq!(d.message, "redefinition of struct P");

        let d = CDeclDiagnostics::syntax_error(span, "unexpected token", &["';'", "','"]);
        assert_eq!(d.help, vec!["expected ';' or ','".to_string()]);

        let d = CDeclDiagnostics::syntax_error(span, "unexpected token", &[]);
        assert!(d.help.is_empty());
    }
}
