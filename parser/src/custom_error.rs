//! Error type that keeps the furthest failure and the context stack leading to it

use nom::error::{ContextError, ErrorKind, FromExternalError, ParseError};
use nom::IResult;

/// Parser result type used throughout the crate
pub type PResult<'a, T> = IResult<&'a str, T, ContextualError<&'a str>>;

#[derive(Debug, Clone, PartialEq)]
pub struct ContextualError<I> {
    /// Remaining input at the point of failure
    pub input: I,
    pub code: ErrorKind,
    /// Innermost context first
    pub contexts: Vec<&'static str>,
    /// Explicit message set by a parser that knows exactly what went wrong
    pub message: Option<String>,
}

impl<I> ContextualError<I> {
    pub fn new(input: I, code: ErrorKind) -> Self {
        Self {
            input,
            code,
            contexts: Vec::new(),
            message: None,
        }
    }

    pub fn with_message(input: I, message: impl Into<String>) -> Self {
        Self {
            input,
            code: ErrorKind::Verify,
            contexts: Vec::new(),
            message: Some(message.into()),
        }
    }

    /// Innermost context, which names the construct that failed
    pub fn innermost_context(&self) -> Option<&'static str> {
        self.contexts.first().copied()
    }
}

impl<I: AsRef<str>> ContextualError<I> {
    fn remaining(&self) -> usize {
        self.input.as_ref().len()
    }
}

impl<I: AsRef<str>> ParseError<I> for ContextualError<I> {
    fn from_error_kind(input: I, kind: ErrorKind) -> Self {
        Self::new(input, kind)
    }

    fn append(_input: I, _kind: ErrorKind, other: Self) -> Self {
        other
    }

    fn or(self, other: Self) -> Self {
        // less remaining input means the branch got further
        match self.remaining().cmp(&other.remaining()) {
            std::cmp::Ordering::Less => self,
            std::cmp::Ordering::Greater => other,
            std::cmp::Ordering::Equal => {
                if self.message.is_some() || self.contexts.len() >= other.contexts.len() {
                    self
                } else {
                    other
                }
            }
        }
    }
}

impl<I> ContextError<I> for ContextualError<I> {
    fn add_context(_input: I, ctx: &'static str, mut other: Self) -> Self {
        other.contexts.push(ctx);
        other
    }
}

impl<I, E: std::fmt::Display> FromExternalError<I, E> for ContextualError<I> {
    fn from_external_error(input: I, kind: ErrorKind, e: E) -> Self {
        Self {
            input,
            code: kind,
            contexts: Vec::new(),
            message: Some(e.to_string()),
        }
    }
}

/// Fail at `input` with a fixed message
pub fn fail_at<T>(input: &str, message: impl Into<String>) -> PResult<'_, T> {
    Err(nom::Err::Error(ContextualError::with_message(input, message)))
}

/// Like [`fail_at`] but not recoverable by `alt`
pub fn cut_at<T>(input: &str, message: impl Into<String>) -> PResult<'_, T> {
    Err(nom::Err::Failure(ContextualError::with_message(input, message)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_or_prefers_furthest_progress() {
        let full = "struct P { int x };";
        let early = ContextualError::new(&full[0..], ErrorKind::Tag);
        let late = ContextualError::with_message(&full[17..], "expected ';'");
        let kept = early.clone().or(late.clone());
        assert_eq!(kept, late);
        let kept = late.clone().or(early);
        assert_eq!(kept.message.as_deref(), Some("expected ';'"));
    }

    #[test]
    fn test_context_stack_order() {
        let e = ContextualError::new("x", ErrorKind::Tag);
        let e = ContextualError::add_context("x", "field", e);
        let e = ContextualError::add_context("x", "struct body", e);
        assert_eq!(e.innermost_context(), Some("field"));
        assert_eq!(e.contexts, vec!["field", "struct body"]);
    }
}
