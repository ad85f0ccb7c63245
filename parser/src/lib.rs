//! Parser for C declaration text
//!
//! Entry points are [`parse_declarations`] for a chunk of declarations and
//! [`parse_type_name`] for a single type such as `struct P *[4]`. Both return
//! a syntax tree with byte spans; semantic checks (known type names,
//! redefinitions, constant evaluation) happen when the tree is lowered.

use std::fmt;

pub mod c_ast;
pub mod c_parser;
pub mod c_parser_expr;
pub mod c_parser_types;
pub mod custom_error;

pub use c_ast::*;
pub use custom_error::{ContextualError, PResult};

use diagnostics::cdecl::CDeclDiagnostics;
use diagnostics::{Diagnostic, FileId, SourceMap};

/// A syntax error with the byte offset it was detected at
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub offset: usize,
    /// Constructs being parsed when the error occurred, innermost first
    pub contexts: Vec<&'static str>,
}

impl ParseError {
    fn from_nom(full: &str, err: nom::Err<ContextualError<&str>>) -> Self {
        match err {
            nom::Err::Error(e) | nom::Err::Failure(e) => {
                let offset = full.len() - e.input.len();
                let message = match (&e.message, e.innermost_context()) {
                    (Some(m), _) => m.clone(),
                    (None, Some(ctx)) => format!("invalid {}", ctx),
                    (None, None) => "syntax error".to_string(),
                };
                let message = format!("{} {}", message, describe_token(e.input));
                ParseError {
                    message,
                    offset,
                    contexts: e.contexts,
                }
            }
            nom::Err::Incomplete(_) => ParseError {
                message: "unexpected end of input".to_string(),
                offset: full.len(),
                contexts: Vec::new(),
            },
        }
    }

    /// Render as a diagnostic against the chunk registered as `file`
    pub fn to_diagnostic(&self, file: FileId, source_map: &SourceMap) -> Option<Diagnostic> {
        let span = source_map.span(file, self.offset, self.offset)?;
        Some(CDeclDiagnostics::syntax_error(span, &self.message, &[]))
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParseError {}

/// `near 'tok'` for the token at the error position
fn describe_token(rest: &str) -> String {
    let rest = rest.trim_start();
    if rest.is_empty() {
        return "at end of input".to_string();
    }
    let len = rest
        .char_indices()
        .find(|(i, c)| *i > 0 && (c.is_whitespace() || !(c.is_alphanumeric() || *c == '_')))
        .map(|(i, _)| i)
        .unwrap_or(rest.len());
    format!("near '{}'", &rest[..len])
}

/// Parse a chunk of declarations
pub fn parse_declarations(source: &str) -> Result<TranslationUnit, ParseError> {
    match c_parser::translation_unit(source, source) {
        Ok((_, unit)) => Ok(unit),
        Err(e) => Err(ParseError::from_nom(source, e)),
    }
}

/// Parse a type name; the whole input must be consumed
pub fn parse_type_name(source: &str) -> Result<TypeName, ParseError> {
    let (rest, ty) = c_parser_types::type_name(source, source)
        .map_err(|e| ParseError::from_nom(source, e))?;
    let rest = match c_parser::ws(rest) {
        Ok((rest, _)) => rest,
        Err(e) => return Err(ParseError::from_nom(source, e)),
    };
    if !rest.is_empty() {
        return Err(ParseError {
            message: format!("unexpected text in type name {}", describe_token(rest)),
            offset: source.len() - rest.len(),
            contexts: vec!["type name"],
        });
    }
    Ok(ty)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_token() {
        assert_eq!(describe_token("  foo_t x;"), "near 'foo_t'");
        assert_eq!(describe_token("; int"), "near ';'");
        assert_eq!(describe_token("   "), "at end of input");
    }

    #[test]
    fn test_parse_type_name_rejects_trailing_text() {
        let err = parse_type_name("int x").unwrap_err();
        assert_eq!(err.offset, 4);
        assert!(err.message.contains("near 'x'"), "{}", err.message);
    }

    #[test]
    fn test_error_offset_for_diagnostic() {
        let src = "int a;\nstruct { int x } b;";
        let err = parse_declarations(src).unwrap_err();
        assert!(err.message.starts_with("expected ';'"), "{}", err.message);

        let mut map = SourceMap::new();
        let file = map.add_file("<cdef #0>", src);
        let diag = err.to_diagnostic(file, &map).unwrap();
        assert_eq!(diag.line(), 2);
    }
}
