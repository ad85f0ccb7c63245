//! Integer constant expressions
//!
//! Only what appears in declarations is supported: literals, enumerator
//! names, unary `- + ~ !`, the arithmetic, shift and bitwise binary operators,
//! and parentheses. Binary operators are parsed by precedence climbing.

use nom::{error::context, Parser};

use crate::c_ast::*;
use crate::c_parser::{expect, identifier, make_span, position, symbol, ws};
use crate::custom_error::{fail_at, PResult};

/// Binding power of each binary operator; higher binds tighter
fn binary_op(input: &str) -> Option<(BinaryOp, u8, usize)> {
    let two = input.get(..2).unwrap_or("");
    match two {
        "<<" => return Some((BinaryOp::Shl, 4, 2)),
        ">>" => return Some((BinaryOp::Shr, 4, 2)),
        "||" | "&&" | "==" | "!=" | "<=" | ">=" => return None,
        _ => {}
    }
    let op = match input.chars().next()? {
        '*' => (BinaryOp::Mul, 6),
        '/' => (BinaryOp::Div, 6),
        '%' => (BinaryOp::Mod, 6),
        '+' => (BinaryOp::Add, 5),
        '-' => (BinaryOp::Sub, 5),
        '&' => (BinaryOp::BitAnd, 3),
        '^' => (BinaryOp::BitXor, 2),
        '|' => (BinaryOp::BitOr, 1),
        _ => return None,
    };
    Some((op.0, op.1, 1))
}

/// Parse a full constant expression
pub fn const_expr<'a>(full: &'a str, input: &'a str) -> PResult<'a, ConstExpr> {
    context("constant expression", |input| binary_expr(full, input, 0)).parse(input)
}

fn binary_expr<'a>(full: &'a str, input: &'a str, min_power: u8) -> PResult<'a, ConstExpr> {
    let (mut input, mut left) = unary_expr(full, input)?;
    loop {
        let (here, _) = ws(input)?;
        let Some((op, power, len)) = binary_op(here) else {
            return Ok((input, left));
        };
        if power < min_power {
            return Ok((input, left));
        }
        let (rest, right) = binary_expr(full, &here[len..], power + 1)?;
        let span = Span::new(left.span().start, position(full, rest));
        left = ConstExpr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
            span,
        };
        input = rest;
    }
}

fn unary_expr<'a>(full: &'a str, input: &'a str) -> PResult<'a, ConstExpr> {
    let (input, _) = ws(input)?;
    let start = position(full, input);
    let op = match input.chars().next() {
        Some('-') => Some(UnaryOp::Neg),
        Some('+') => Some(UnaryOp::Plus),
        Some('~') => Some(UnaryOp::BitNot),
        Some('!') => Some(UnaryOp::Not),
        _ => None,
    };
    match op {
        Some(op) => {
            let (rest, operand) = unary_expr(full, &input[1..])?;
            Ok((
                rest,
                ConstExpr::Unary {
                    op,
                    operand: Box::new(operand),
                    span: make_span(full, start, rest),
                },
            ))
        }
        None => primary_expr(full, input),
    }
}

fn primary_expr<'a>(full: &'a str, input: &'a str) -> PResult<'a, ConstExpr> {
    let (input, _) = ws(input)?;
    let start = position(full, input);
    if input.starts_with('(') {
        let (rest, _) = symbol("(")(input)?;
        let (rest, inner) = binary_expr(full, rest, 0)?;
        let (rest, _) = expect(")")(rest)?;
        return Ok((rest, inner));
    }
    if input.starts_with('\'') {
        let (rest, value) = char_literal(input)?;
        return Ok((
            rest,
            ConstExpr::Int {
                value,
                span: make_span(full, start, rest),
            },
        ));
    }
    if input.starts_with(|c: char| c.is_ascii_digit()) {
        let (rest, value) = integer_literal(input)?;
        return Ok((
            rest,
            ConstExpr::Int {
                value,
                span: make_span(full, start, rest),
            },
        ));
    }
    match identifier(input) {
        Ok((rest, name)) => Ok((
            rest,
            ConstExpr::Ident {
                name,
                span: make_span(full, start, rest),
            },
        )),
        Err(_) => fail_at(input, "expected constant expression"),
    }
}

/// Decimal, hex or octal literal with optional `u`/`l` suffixes
fn integer_literal(input: &str) -> PResult<'_, i64> {
    let (digits_input, radix) = if let Some(rest) = input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
    {
        (rest, 16)
    } else if input.starts_with('0') && input[1..].starts_with(|c: char| c.is_ascii_digit()) {
        (&input[1..], 8)
    } else {
        (input, 10)
    };

    let len = digits_input
        .find(|c: char| !c.is_ascii_alphanumeric() || matches!(c, 'u' | 'U' | 'l' | 'L'))
        .unwrap_or(digits_input.len());
    let (digits, rest) = digits_input.split_at(len);
    let value = match u64::from_str_radix(digits, radix) {
        Ok(v) => v,
        Err(_) => return fail_at(input, format!("invalid integer literal '{}'", digits)),
    };
    if value > i64::MAX as u64 {
        return fail_at(input, "integer literal is too large");
    }

    let rest = rest.trim_start_matches(['u', 'U', 'l', 'L']);
    if rest.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_') {
        return fail_at(rest, "invalid suffix on integer literal");
    }
    Ok((rest, value as i64))
}

/// `'a'`, `'\n'`, `'\0'`, `'\x41'`
fn char_literal(input: &str) -> PResult<'_, i64> {
    let body = &input[1..];
    let mut chars = body.char_indices();
    let (value, consumed) = match chars.next() {
        Some((_, '\\')) => match chars.next() {
            Some((_, 'n')) => (10, 2),
            Some((_, 't')) => (9, 2),
            Some((_, 'r')) => (13, 2),
            Some((_, '\\')) => (92, 2),
            Some((_, '\'')) => (39, 2),
            Some((_, '"')) => (34, 2),
            Some((_, 'x')) => {
                let hex: String = body[2..].chars().take_while(|c| c.is_ascii_hexdigit()).collect();
                match i64::from_str_radix(&hex, 16) {
                    Ok(v) => (v, 2 + hex.len()),
                    Err(_) => return fail_at(input, "invalid hex escape"),
                }
            }
            Some((_, c)) if c.is_digit(8) => {
                let oct: String = body[1..].chars().take_while(|c| c.is_digit(8)).take(3).collect();
                match i64::from_str_radix(&oct, 8) {
                    Ok(v) => (v, 1 + oct.len()),
                    Err(_) => return fail_at(input, "invalid octal escape"),
                }
            }
            _ => return fail_at(input, "unknown escape sequence"),
        },
        Some((_, c)) if c != '\'' => (c as i64, c.len_utf8()),
        _ => return fail_at(input, "empty character constant"),
    };
    match body[consumed..].strip_prefix('\'') {
        Some(rest) => Ok((rest, value)),
        None => fail_at(input, "unterminated character constant"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(expr: &ConstExpr) -> i64 {
        match expr {
            ConstExpr::Int { value, .. } => *value,
            ConstExpr::Ident { .. } => panic!("unexpected identifier"),
            ConstExpr::Unary { op, operand, .. } => {
                let v = eval(operand);
                match op {
                    UnaryOp::Neg => -v,
                    UnaryOp::Plus => v,
                    UnaryOp::BitNot => !v,
                    UnaryOp::Not => (v == 0) as i64,
                }
            }
            ConstExpr::Binary { op, left, right, .. } => {
                let (l, r) = (eval(left), eval(right));
                match op {
                    BinaryOp::Mul => l * r,
                    BinaryOp::Div => l / r,
                    BinaryOp::Mod => l % r,
                    BinaryOp::Add => l + r,
                    BinaryOp::Sub => l - r,
                    BinaryOp::Shl => l << r,
                    BinaryOp::Shr => l >> r,
                    BinaryOp::BitAnd => l & r,
                    BinaryOp::BitXor => l ^ r,
                    BinaryOp::BitOr => l | r,
                }
            }
        }
    }

    fn parse(src: &str) -> ConstExpr {
        let (rest, e) = const_expr(src, src).unwrap();
        assert!(rest.trim().is_empty(), "left over: {:?}", rest);
        e
    }

    #[test]
    fn test_precedence() {
        assert_eq!(eval(&parse("1 + 2 * 3")), 7);
        assert_eq!(eval(&parse("(1 + 2) * 3")), 9);
        assert_eq!(eval(&parse("1 << 4 | 1")), 17);
        assert_eq!(eval(&parse("10 - 4 - 3")), 3);
        assert_eq!(eval(&parse("-2 * -3")), 6);
        assert_eq!(eval(&parse("~0 & 0xff")), 255);
    }

    #[test]
    fn test_literals() {
        assert_eq!(eval(&parse("0x1F")), 31);
        assert_eq!(eval(&parse("017")), 15);
        assert_eq!(eval(&parse("0")), 0);
        assert_eq!(eval(&parse("42UL")), 42);
        assert_eq!(eval(&parse("'A'")), 65);
        assert_eq!(eval(&parse("'\\n'")), 10);
        assert_eq!(eval(&parse("'\\0'")), 0);
        assert_eq!(eval(&parse("'\\x41'")), 65);
    }

    #[test]
    fn test_identifier_and_span() {
        let src = "N * 2";
        let e = parse(src);
        assert_eq!(e.span(), Span::new(0, 5));
        match e {
            ConstExpr::Binary { left, .. } => {
                assert!(matches!(*left, ConstExpr::Ident { ref name, .. } if name == "N"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_stops_at_closing_bracket() {
        let src = "4]";
        let (rest, e) = const_expr(src, src).unwrap();
        assert_eq!(rest, "]");
        assert_eq!(eval(&e), 4);
    }

    #[test]
    fn test_bad_literals() {
        assert!(const_expr("12abc", "12abc").is_err());
        assert!(const_expr("099", "099").is_err());
        assert!(const_expr("99999999999999999999", "99999999999999999999").is_err());
    }
}
