//! Error taxonomy for the FFI layer
//!
//! Declaration errors carry a source position when one is known. Backend
//! errors are passed through unchanged; the facade never reinterprets them.

use std::fmt;

use diagnostics::cdecl::CDeclDiagnostics;
use diagnostics::{Diagnostic, FileId, SourceMap, SourceSpan};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FfiError>;

/// Everything a facade or library proxy operation can fail with
#[derive(Debug, Error)]
pub enum FfiError {
    #[error(transparent)]
    Declaration(#[from] DeclarationError),

    #[error("unknown symbol '{0}'")]
    UnknownSymbol(String),

    #[error("library not found: '{0}'")]
    LibraryNotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Verify(#[from] VerifyError),
}

impl FfiError {
    /// Diagnostic for declaration errors that know their position
    pub fn to_diagnostic(&self) -> Option<Diagnostic> {
        match self {
            FfiError::Declaration(e) => e.to_diagnostic(),
            _ => None,
        }
    }
}

/// What kind of declaration problem was found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeclarationErrorKind {
    Syntax,
    UnknownType(String),
    Redefinition(String),
    ConflictingTypes(String),
    Unsupported(String),
    InvalidConstant,
    Invalid,
}

/// Malformed or inconsistent declaration text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclarationError {
    pub kind: DeclarationErrorKind,
    pub message: String,
    /// Byte offset into the declaration chunk
    pub offset: Option<usize>,
    /// Resolved position once the chunk is known to a source map
    pub span: Option<SourceSpan>,
}

impl DeclarationError {
    pub fn new(kind: DeclarationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            offset: None,
            span: None,
        }
    }

    pub fn at(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn syntax(err: parser::ParseError) -> Self {
        Self::new(DeclarationErrorKind::Syntax, err.message).at(err.offset)
    }

    pub fn unknown_type(name: &str) -> Self {
        Self::new(
            DeclarationErrorKind::UnknownType(name.to_string()),
            format!("unknown type name '{}'", name),
        )
    }

    pub fn redefinition(what: impl Into<String>) -> Self {
        let what = what.into();
        Self::new(
            DeclarationErrorKind::Redefinition(what.clone()),
            format!("redefinition of {}", what),
        )
    }

    pub fn conflicting(name: &str) -> Self {
        Self::new(
            DeclarationErrorKind::ConflictingTypes(name.to_string()),
            format!("conflicting types for '{}'", name),
        )
    }

    pub fn unsupported(what: impl Into<String>) -> Self {
        let what = what.into();
        Self::new(
            DeclarationErrorKind::Unsupported(what.clone()),
            format!("{} are not supported", what),
        )
    }

    pub fn constant(message: impl Into<String>) -> Self {
        Self::new(DeclarationErrorKind::InvalidConstant, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(DeclarationErrorKind::Invalid, message)
    }

    /// Resolve the byte offset against the chunk registered as `file`
    pub fn located(mut self, file: FileId, source_map: &SourceMap) -> Self {
        if let Some(offset) = self.offset {
            self.span = source_map.span(file, offset, offset);
        }
        self
    }

    pub fn line(&self) -> Option<usize> {
        self.span.map(|s| s.line())
    }

    pub fn to_diagnostic(&self) -> Option<Diagnostic> {
        let span = self.span?;
        Some(match &self.kind {
            DeclarationErrorKind::Syntax | DeclarationErrorKind::Invalid => {
                CDeclDiagnostics::syntax_error(span, &self.message, &[])
            }
            DeclarationErrorKind::UnknownType(name) => CDeclDiagnostics::unknown_type_name(span, name),
            DeclarationErrorKind::Redefinition(what) => CDeclDiagnostics::redefinition(span, what),
            DeclarationErrorKind::ConflictingTypes(name) => {
                CDeclDiagnostics::conflicting_typedef(span, name)
            }
            DeclarationErrorKind::Unsupported(what) => CDeclDiagnostics::unsupported(span, what),
            DeclarationErrorKind::InvalidConstant => {
                CDeclDiagnostics::invalid_constant(span, &self.message)
            }
        })
    }
}

impl fmt::Display for DeclarationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line() {
            Some(line) => write!(f, "line {}: {}", line, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for DeclarationError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    UnknownType,
    IncompleteType,
    InvalidField,
    Allocation,
    Cast,
    TypeMismatch,
    Library,
    Symbol,
    Call,
    Unsupported,
    Bounds,
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            BackendErrorKind::UnknownType => "unknown type",
            BackendErrorKind::IncompleteType => "incomplete type",
            BackendErrorKind::InvalidField => "invalid field",
            BackendErrorKind::Allocation => "allocation failed",
            BackendErrorKind::Cast => "invalid cast",
            BackendErrorKind::TypeMismatch => "type mismatch",
            BackendErrorKind::Library => "library error",
            BackendErrorKind::Symbol => "symbol error",
            BackendErrorKind::Call => "call failed",
            BackendErrorKind::Unsupported => "unsupported",
            BackendErrorKind::Bounds => "out of bounds",
        };
        f.write_str(text)
    }
}

/// Failure reported by a backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unsupported(what: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Unsupported, what)
    }

    pub fn incomplete(type_name: &str) -> Self {
        Self::new(BackendErrorKind::IncompleteType, format!("'{}'", type_name))
    }

    pub fn mismatch(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::TypeMismatch, message)
    }

    pub fn bounds(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Bounds, message)
    }
}

/// Failure of the layout verification step
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("verifier I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("probe compilation failed ({status}):\n{stderr}")]
    Compile { status: String, stderr: String },

    #[error("probe exited with {status}:\n{stderr}")]
    Run { status: String, stderr: String },

    #[error("unreadable probe output: {0}")]
    Output(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_and_without_line() {
        let err = DeclarationError::unknown_type("foo_t");
        assert_eq!(err.to_string(), "unknown type name 'foo_t'");
        assert!(err.to_diagnostic().is_none());

        let mut map = SourceMap::new();
        let file = map.add_file("<cdef #0>", "int a;\nfoo_t b;\n");
        let err = err.at(7).located(file, &map);
        assert_eq!(err.line(), Some(2));
        assert_eq!(err.to_string(), "line 2: unknown type name 'foo_t'");

        let diag = err.to_diagnostic().unwrap();
        assert_eq!(diag.code.as_deref(), Some("C0201"));
        assert_eq!(diag.line(), 2);
    }

    #[test]
    fn test_backend_error_display() {
        let err = BackendError::incomplete("struct S");
        assert_eq!(err.to_string(), "incomplete type: 'struct S'");
        let wrapped: FfiError = err.clone().into();
        assert!(matches!(wrapped, FfiError::Backend(ref e) if *e == err));
        assert!(wrapped.to_diagnostic().is_none());
    }
}
