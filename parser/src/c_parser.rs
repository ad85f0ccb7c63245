//! C declaration parser with span tracking
//!
//! Parses the declaration subset of C: typedefs, struct/union/enum
//! definitions, function prototypes and variable declarations. Function
//! bodies and statements are not part of the grammar. Every node records the
//! byte range it came from so errors can be mapped back to lines.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_until, take_while, take_while1},
    character::complete::multispace1,
    combinator::{opt, recognize, value, verify},
    error::context,
    multi::many0,
    sequence::pair,
    Parser,
};

use crate::c_ast::*;
use crate::c_parser_expr::const_expr;
use crate::c_parser_types::{decl_specifiers, declarator, DeclaratorMode};
use crate::custom_error::{cut_at, fail_at, PResult};

// =============================================================================
// Lexical helpers
// =============================================================================

/// Get current position in the original input
pub fn position(full: &str, current: &str) -> usize {
    full.len() - current.len()
}

/// Create span from start position to current position
pub fn make_span(full: &str, start: usize, current: &str) -> Span {
    Span::new(start, position(full, current))
}

/// Skip whitespace and comments
pub fn ws(input: &str) -> PResult<'_, ()> {
    value(
        (),
        many0(alt((
            value((), multispace1),
            value((), line_comment),
            value((), block_comment),
        ))),
    )
    .parse(input)
}

/// Line comment: // comment
fn line_comment(input: &str) -> PResult<'_, &str> {
    recognize(pair(tag("//"), take_while(|c| c != '\n'))).parse(input)
}

/// Block comment: /* comment */
fn block_comment(input: &str) -> PResult<'_, &str> {
    recognize((tag("/*"), take_until("*/"), tag("*/"))).parse(input)
}

/// Words that can never be identifiers
pub fn is_reserved(s: &str) -> bool {
    matches!(
        s,
        "auto"
            | "break"
            | "case"
            | "char"
            | "const"
            | "continue"
            | "default"
            | "do"
            | "double"
            | "else"
            | "enum"
            | "extern"
            | "float"
            | "for"
            | "goto"
            | "if"
            | "inline"
            | "int"
            | "long"
            | "register"
            | "restrict"
            | "return"
            | "short"
            | "signed"
            | "sizeof"
            | "static"
            | "struct"
            | "switch"
            | "typedef"
            | "union"
            | "unsigned"
            | "void"
            | "volatile"
            | "while"
            | "_Bool"
            | "__restrict"
    )
}

/// Parse one identifier-shaped word, reserved or not
pub fn word(input: &str) -> PResult<'_, &str> {
    let (input, _) = ws(input)?;
    recognize(pair(
        take_while1(|c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))
    .parse(input)
}

/// Parse a keyword; the whole word must match so `int` never matches `int8_t`
pub fn keyword<'a>(kw: &'static str) -> impl FnMut(&'a str) -> PResult<'a, &'a str> {
    move |input| verify(word, |w: &str| w == kw).parse(input)
}

/// Parse an identifier
pub fn identifier(input: &str) -> PResult<'_, String> {
    let (input, id) = verify(word, |w: &str| !is_reserved(w)).parse(input)?;
    Ok((input, id.to_string()))
}

/// Parse a symbol with leading whitespace
pub fn symbol<'a>(sym: &'static str) -> impl FnMut(&'a str) -> PResult<'a, &'a str> {
    move |input| {
        let (input, _) = ws(input)?;
        tag(sym)(input)
    }
}

/// Like [`symbol`] but reports `expected 'sym'` on failure
pub fn expect<'a>(sym: &'static str) -> impl FnMut(&'a str) -> PResult<'a, &'a str> {
    move |input| {
        let (input, _) = ws(input)?;
        match tag::<_, _, crate::custom_error::ContextualError<&str>>(sym)(input) {
            Ok(ok) => Ok(ok),
            Err(_) => fail_at(input, format!("expected '{}'", sym)),
        }
    }
}

/// True when the next token starts with `sym`
pub fn peek_symbol(input: &str, sym: &str) -> bool {
    match ws(input) {
        Ok((rest, _)) => rest.starts_with(sym),
        Err(_) => false,
    }
}

// =============================================================================
// Translation unit
// =============================================================================

/// Parse a complete chunk of declaration text
pub fn translation_unit<'a>(full: &'a str, input: &'a str) -> PResult<'a, TranslationUnit> {
    let mut declarations = Vec::new();
    let mut input = input;
    loop {
        let (rest, _) = ws(input)?;
        if rest.is_empty() {
            return Ok((rest, TranslationUnit { declarations }));
        }
        if let Some(after) = rest.strip_prefix(';') {
            input = after;
            continue;
        }
        if rest.starts_with('#') {
            return cut_at(rest, "preprocessor directives are not supported");
        }
        let (rest, decl) = declaration(full, rest)?;
        declarations.push(decl);
        input = rest;
    }
}

/// `specifiers init-declarator-list? ;`
pub fn declaration<'a>(full: &'a str, input: &'a str) -> PResult<'a, Declaration> {
    context("declaration", |input| {
        let (input, _) = ws(input)?;
        let start = position(full, input);
        let (input, specifiers) = decl_specifiers(full, input)?;

        let mut declarators = Vec::new();
        let mut input = input;
        if !peek_symbol(input, ";") {
            loop {
                let (rest, item) = init_declarator(full, input)?;
                declarators.push(item);
                match symbol(",")(rest) {
                    Ok((rest, _)) => input = rest,
                    Err(_) => {
                        input = rest;
                        break;
                    }
                }
            }
        }
        let (input, _) = expect(";")(input)?;

        Ok((
            input,
            Declaration {
                specifiers,
                declarators,
                span: make_span(full, start, input),
            },
        ))
    })
    .parse(input)
}

fn init_declarator<'a>(full: &'a str, input: &'a str) -> PResult<'a, InitDeclarator> {
    let (input, decl) = declarator(full, input, DeclaratorMode::Named)?;
    let (input, initializer) = opt(|i| initializer(full, i)).parse(input)?;
    Ok((
        input,
        InitDeclarator {
            declarator: decl,
            initializer,
        },
    ))
}

/// `= ...` up to the next top-level `,` or `;`; only its extent is kept
fn initializer<'a>(full: &'a str, input: &'a str) -> PResult<'a, Span> {
    let (input, _) = symbol("=")(input)?;
    let (input, _) = ws(input)?;
    let start = position(full, input);
    let mut depth = 0usize;
    let mut end = input.len();
    for (i, c) in input.char_indices() {
        match c {
            '(' | '{' | '[' => depth += 1,
            ')' | '}' | ']' => depth = depth.saturating_sub(1),
            ',' | ';' if depth == 0 => {
                end = i;
                break;
            }
            _ => {}
        }
    }
    let rest = &input[end..];
    Ok((rest, make_span(full, start, rest)))
}

// =============================================================================
// Struct, union and enum specifiers
// =============================================================================

/// `struct tag? { fields }?` or the `union` equivalent
pub fn aggregate_specifier<'a>(full: &'a str, input: &'a str) -> PResult<'a, AggregateSpecifier> {
    context("struct or union", |input| {
        let (input, _) = ws(input)?;
        let start = position(full, input);
        let (input, kw) = alt((keyword("struct"), keyword("union"))).parse(input)?;
        let kind = if kw == "struct" {
            AggregateKind::Struct
        } else {
            AggregateKind::Union
        };
        let (input, tag) = opt(identifier).parse(input)?;

        let (input, fields) = if peek_symbol(input, "{") {
            let (mut input, _) = symbol("{")(input)?;
            let mut fields = Vec::new();
            while !peek_symbol(input, "}") {
                let (rest, _) = ws(input)?;
                if rest.is_empty() {
                    return fail_at(rest, format!("expected '}}' to close {}", kind.keyword()));
                }
                let (rest, field) = field_decl(full, rest)?;
                fields.push(field);
                input = rest;
            }
            let (input, _) = symbol("}")(input)?;
            (input, Some(fields))
        } else {
            (input, None)
        };

        if tag.is_none() && fields.is_none() {
            return fail_at(input, format!("expected tag name or '{{' after '{}'", kind.keyword()));
        }

        Ok((
            input,
            AggregateSpecifier {
                kind,
                tag,
                fields,
                span: make_span(full, start, input),
            },
        ))
    })
    .parse(input)
}

/// One line of a struct body: `specifiers member, member ;`
fn field_decl<'a>(full: &'a str, input: &'a str) -> PResult<'a, FieldDecl> {
    context("field", |input| {
        let (input, _) = ws(input)?;
        let start = position(full, input);
        let (input, specifiers) = decl_specifiers(full, input)?;

        let mut members = Vec::new();
        let mut input = input;
        if !peek_symbol(input, ";") {
            loop {
                let (rest, member) = field_member(full, input)?;
                members.push(member);
                match symbol(",")(rest) {
                    Ok((rest, _)) => input = rest,
                    Err(_) => {
                        input = rest;
                        break;
                    }
                }
            }
        }
        let (input, _) = expect(";")(input)?;

        Ok((
            input,
            FieldDecl {
                specifiers,
                members,
                span: make_span(full, start, input),
            },
        ))
    })
    .parse(input)
}

fn field_member<'a>(full: &'a str, input: &'a str) -> PResult<'a, FieldMember> {
    let (input, _) = ws(input)?;
    let start = position(full, input);
    let (input, decl) = if peek_symbol(input, ":") {
        (input, None)
    } else {
        let (input, d) = declarator(full, input, DeclaratorMode::Named)?;
        (input, Some(d))
    };
    let (input, bit_width) = if peek_symbol(input, ":") {
        let (input, _) = symbol(":")(input)?;
        let (input, width) = const_expr(full, input)?;
        (input, Some(width))
    } else {
        (input, None)
    };
    Ok((
        input,
        FieldMember {
            declarator: decl,
            bit_width,
            span: make_span(full, start, input),
        },
    ))
}

/// `enum tag? { A, B = 3, C }?`
pub fn enum_specifier<'a>(full: &'a str, input: &'a str) -> PResult<'a, EnumSpecifier> {
    context("enum", |input| {
        let (input, _) = ws(input)?;
        let start = position(full, input);
        let (input, _) = keyword("enum")(input)?;
        let (input, tag) = opt(identifier).parse(input)?;

        let (input, enumerators) = if peek_symbol(input, "{") {
            let (mut input, _) = symbol("{")(input)?;
            let mut items = Vec::new();
            while !peek_symbol(input, "}") {
                let (rest, item) = enumerator(full, input)?;
                items.push(item);
                match symbol(",")(rest) {
                    Ok((rest, _)) => input = rest,
                    Err(_) => {
                        input = rest;
                        break;
                    }
                }
            }
            let (input, _) = expect("}")(input)?;
            (input, Some(items))
        } else {
            (input, None)
        };

        if tag.is_none() && enumerators.is_none() {
            return fail_at(input, "expected tag name or '{' after 'enum'");
        }

        Ok((
            input,
            EnumSpecifier {
                tag,
                enumerators,
                span: make_span(full, start, input),
            },
        ))
    })
    .parse(input)
}

fn enumerator<'a>(full: &'a str, input: &'a str) -> PResult<'a, Enumerator> {
    let (input, _) = ws(input)?;
    let start = position(full, input);
    let (input, name) = match identifier(input) {
        Ok(ok) => ok,
        Err(_) => return fail_at(input, "expected enumerator name"),
    };
    let (input, value) = if peek_symbol(input, "=") {
        let (input, _) = symbol("=")(input)?;
        let (input, v) = const_expr(full, input)?;
        (input, Some(v))
    } else {
        (input, None)
    };
    Ok((
        input,
        Enumerator {
            name,
            value,
            span: make_span(full, start, input),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_needs_whole_word() {
        assert!(keyword("int")("int x").is_ok());
        assert!(keyword("int")("int8_t x").is_err());
        assert!(keyword("int")("  /* c */ int").is_ok());
    }

    #[test]
    fn test_identifier_rejects_reserved() {
        assert_eq!(identifier("  _foo1 ;").unwrap().1, "_foo1");
        assert!(identifier("struct").is_err());
    }

    #[test]
    fn test_ws_skips_comments() {
        let (rest, _) = ws("  // line\n /* block */ int").unwrap();
        assert_eq!(rest, "int");
    }

    #[test]
    fn test_declaration_spans() {
        let full = "int a;\n  long b, c;";
        let (rest, unit) = translation_unit(full, full).unwrap();
        assert!(rest.is_empty());
        assert_eq!(unit.declarations.len(), 2);
        assert_eq!(unit.declarations[0].span, Span::new(0, 6));
        assert_eq!(unit.declarations[1].span, Span::new(9, 19));
        assert_eq!(unit.declarations[1].declarators.len(), 2);
    }

    #[test]
    fn test_initializer_extent() {
        let full = "int a = { 1, 2 }, b;";
        let (_, unit) = translation_unit(full, full).unwrap();
        let decl = &unit.declarations[0];
        assert_eq!(decl.declarators.len(), 2);
        assert_eq!(decl.declarators[0].initializer, Some(Span::new(8, 16)));
        assert!(decl.declarators[1].initializer.is_none());
    }

    #[test]
    fn test_missing_semicolon_message() {
        let full = "int a";
        let err = match translation_unit(full, full) {
            Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => e,
            other => panic!("expected error, got {:?}", other),
        };
        assert_eq!(err.message.as_deref(), Some("expected ';'"));
        assert_eq!(position(full, err.input), 5);
    }
}
