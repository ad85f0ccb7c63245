//! Declaration specifiers, declarators and type names

use nom::{error::context, Parser};

use crate::c_ast::*;
use crate::c_parser::{
    aggregate_specifier, enum_specifier, expect, identifier, is_reserved, keyword, make_span,
    peek_symbol, position, symbol, word, ws,
};
use crate::c_parser_expr::const_expr;
use crate::custom_error::{fail_at, PResult};

/// Which declarators are acceptable at a given position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclaratorMode {
    /// Must declare a name (declarations, struct fields)
    Named,
    /// Must not declare a name (type names)
    Abstract,
    /// Either form (function parameters)
    Either,
}

/// Arithmetic keywords seen so far in one specifier list
#[derive(Debug, Default)]
struct ArithmeticWords {
    signed: Option<bool>,
    short: bool,
    long: u8,
    base: Option<&'static str>,
}

impl ArithmeticWords {
    fn is_empty(&self) -> bool {
        self.signed.is_none() && !self.short && self.long == 0 && self.base.is_none()
    }

    /// Canonical C spelling, or an error message for an invalid combination
    fn canonical(&self) -> Result<TypeSpecifier, String> {
        let unsigned = self.signed == Some(false);
        let sized = |plain: &str| {
            if unsigned {
                format!("unsigned {}", plain)
            } else {
                plain.to_string()
            }
        };
        match self.base {
            Some("void") if self.signed.is_none() && !self.short && self.long == 0 => {
                Ok(TypeSpecifier::Void)
            }
            Some("char") if !self.short && self.long == 0 => Ok(TypeSpecifier::Primitive(
                match self.signed {
                    None => "char".to_string(),
                    Some(true) => "signed char".to_string(),
                    Some(false) => "unsigned char".to_string(),
                },
            )),
            Some("_Bool") if self.signed.is_none() && !self.short && self.long == 0 => {
                Ok(TypeSpecifier::Primitive("_Bool".to_string()))
            }
            Some("float") if self.signed.is_none() && !self.short && self.long == 0 => {
                Ok(TypeSpecifier::Primitive("float".to_string()))
            }
            Some("double") if self.signed.is_none() && !self.short && self.long <= 1 => {
                Ok(TypeSpecifier::Primitive(if self.long == 1 {
                    "long double".to_string()
                } else {
                    "double".to_string()
                }))
            }
            Some("int") | None => match (self.short, self.long) {
                (true, 0) => Ok(TypeSpecifier::Primitive(sized("short"))),
                (false, 0) => Ok(TypeSpecifier::Primitive(sized("int"))),
                (false, 1) => Ok(TypeSpecifier::Primitive(sized("long"))),
                (false, 2) => Ok(TypeSpecifier::Primitive(sized("long long"))),
                _ => Err("invalid combination of 'short' and 'long'".to_string()),
            },
            Some(base) => Err(format!("invalid type specifiers before '{}'", base)),
        }
    }
}

fn arithmetic_keyword(w: &str) -> Option<&'static str> {
    Some(match w {
        "void" => "void",
        "char" => "char",
        "int" => "int",
        "float" => "float",
        "double" => "double",
        "_Bool" => "_Bool",
        _ => return None,
    })
}

/// Storage class, qualifiers and exactly one type specifier, in any order
pub fn decl_specifiers<'a>(full: &'a str, input: &'a str) -> PResult<'a, DeclSpecifiers> {
    context("declaration specifiers", |input| {
        let (input, _) = ws(input)?;
        let start = position(full, input);
        let mut storage = None;
        let mut qualifiers = Qualifiers::default();
        let mut words = ArithmeticWords::default();
        let mut other: Option<TypeSpecifier> = None;
        let mut rest = input;

        loop {
            let (here, _) = ws(rest)?;
            let Ok((after, w)) = word(here) else {
                break;
            };
            let has_type = other.is_some() || !words.is_empty();
            match w {
                "typedef" | "extern" | "static" => {
                    if storage.is_some() {
                        return fail_at(here, "multiple storage classes in declaration");
                    }
                    storage = Some(match w {
                        "typedef" => StorageClass::Typedef,
                        "extern" => StorageClass::Extern,
                        _ => StorageClass::Static,
                    });
                }
                "inline" | "register" | "restrict" | "__restrict" => {}
                "const" => qualifiers.is_const = true,
                "volatile" => qualifiers.is_volatile = true,
                "signed" | "unsigned" => {
                    if words.signed.is_some() || other.is_some() {
                        return fail_at(here, format!("unexpected '{}'", w));
                    }
                    words.signed = Some(w == "signed");
                }
                "short" => {
                    if words.short || other.is_some() {
                        return fail_at(here, "unexpected 'short'");
                    }
                    words.short = true;
                }
                "long" => {
                    if words.long >= 2 || other.is_some() {
                        return fail_at(here, "unexpected 'long'");
                    }
                    words.long += 1;
                }
                "struct" | "union" => {
                    if has_type {
                        return fail_at(here, "two or more data types in declaration");
                    }
                    let (after, agg) = aggregate_specifier(full, here)?;
                    other = Some(TypeSpecifier::StructOrUnion(agg));
                    rest = after;
                    continue;
                }
                "enum" => {
                    if has_type {
                        return fail_at(here, "two or more data types in declaration");
                    }
                    let (after, e) = enum_specifier(full, here)?;
                    other = Some(TypeSpecifier::Enum(e));
                    rest = after;
                    continue;
                }
                _ => {
                    if let Some(base) = arithmetic_keyword(w) {
                        if words.base.is_some() || other.is_some() {
                            return fail_at(here, "two or more data types in declaration");
                        }
                        words.base = Some(base);
                    } else if !has_type && !is_reserved(w) {
                        other = Some(TypeSpecifier::Named(w.to_string()));
                    } else {
                        break;
                    }
                }
            }
            rest = after;
        }

        let ty = match other {
            Some(ty) => ty,
            None if words.is_empty() => return fail_at(rest, "expected type specifier"),
            None => match words.canonical() {
                Ok(ty) => ty,
                Err(message) => return fail_at(input, message),
            },
        };

        Ok((
            rest,
            DeclSpecifiers {
                storage,
                qualifiers,
                ty,
                span: make_span(full, start, rest),
            },
        ))
    })
    .parse(input)
}

fn qualifier_list(input: &str) -> PResult<'_, Qualifiers> {
    let mut qualifiers = Qualifiers::default();
    let mut rest = input;
    loop {
        if let Ok((after, _)) = keyword("const")(rest) {
            qualifiers.is_const = true;
            rest = after;
        } else if let Ok((after, _)) = keyword("volatile")(rest) {
            qualifiers.is_volatile = true;
            rest = after;
        } else if let Ok((after, _)) = keyword("restrict")(rest) {
            rest = after;
        } else if let Ok((after, _)) = keyword("__restrict")(rest) {
            rest = after;
        } else {
            return Ok((rest, qualifiers));
        }
    }
}

/// `* qualifiers declarator` or a direct declarator
pub fn declarator<'a>(full: &'a str, input: &'a str, mode: DeclaratorMode) -> PResult<'a, Declarator> {
    let (input, _) = ws(input)?;
    if let Some(after) = input.strip_prefix('*') {
        let (after, qualifiers) = qualifier_list(after)?;
        let (rest, inner) = declarator(full, after, mode)?;
        return Ok((
            rest,
            Declarator::Pointer {
                inner: Box::new(inner),
                qualifiers,
            },
        ));
    }
    direct_declarator(full, input, mode)
}

/// Core (name or parenthesized declarator) followed by `[]` and `()` suffixes
fn direct_declarator<'a>(
    full: &'a str,
    input: &'a str,
    mode: DeclaratorMode,
) -> PResult<'a, Declarator> {
    let (input, _) = ws(input)?;
    let pos = position(full, input);

    let (mut input, mut node) = if is_grouping(input, mode) {
        let (input, _) = symbol("(")(input)?;
        let (input, inner) = declarator(full, input, mode)?;
        let (input, _) = expect(")")(input)?;
        (input, inner)
    } else {
        match (mode, identifier(input)) {
            (DeclaratorMode::Abstract, Ok(_)) => {
                return fail_at(input, "unexpected identifier in type name");
            }
            (_, Ok((rest, name))) => {
                let span = make_span(full, pos, rest);
                (rest, Declarator::Name { name: Some(name), span })
            }
            (DeclaratorMode::Named, Err(_)) => return fail_at(input, "expected identifier"),
            (_, Err(_)) => (input, Declarator::abstract_at(pos)),
        }
    };

    loop {
        if peek_symbol(input, "[") {
            let (rest, _) = symbol("[")(input)?;
            let (rest, length) = if peek_symbol(rest, "]") {
                (rest, None)
            } else {
                let (rest, len) = const_expr(full, rest)?;
                (rest, Some(len))
            };
            let (rest, _) = expect("]")(rest)?;
            node = Declarator::Array {
                inner: Box::new(node),
                length,
            };
            input = rest;
        } else if peek_symbol(input, "(") {
            let (rest, params) = param_list(full, input)?;
            node = Declarator::Function {
                inner: Box::new(node),
                params,
            };
            input = rest;
        } else {
            return Ok((input, node));
        }
    }
}

/// Decide whether a `(` opens a nested declarator rather than a parameter list
fn is_grouping(input: &str, mode: DeclaratorMode) -> bool {
    let Some(after) = input.strip_prefix('(') else {
        return false;
    };
    if mode == DeclaratorMode::Named {
        return true;
    }
    match ws(after) {
        Ok((next, _)) => next.starts_with('*') || next.starts_with('('),
        Err(_) => false,
    }
}

/// `( void )`, `( )` or `( param, param, ... )`
pub fn param_list<'a>(full: &'a str, input: &'a str) -> PResult<'a, ParamList> {
    context("parameter list", |input| {
        let (input, _) = symbol("(")(input)?;

        if let Ok((rest, _)) = symbol(")")(input) {
            return Ok((rest, ParamList::default()));
        }
        if let Ok((rest, _)) = (keyword("void"), symbol(")")).parse(input) {
            return Ok((rest, ParamList::default()));
        }

        let mut params = Vec::new();
        let mut variadic = false;
        let mut input = input;
        loop {
            if let Ok((rest, _)) = symbol("...")(input) {
                variadic = true;
                input = rest;
                break;
            }
            let (rest, _) = ws(input)?;
            let start = position(full, rest);
            let (rest, specifiers) = decl_specifiers(full, rest)?;
            let (rest, decl) = declarator(full, rest, DeclaratorMode::Either)?;
            params.push(ParamDecl {
                specifiers,
                declarator: decl,
                span: make_span(full, start, rest),
            });
            match symbol(",")(rest) {
                Ok((rest, _)) => input = rest,
                Err(_) => {
                    input = rest;
                    break;
                }
            }
        }
        let (input, _) = expect(")")(input)?;
        Ok((input, ParamList { params, variadic }))
    })
    .parse(input)
}

/// Specifiers followed by an abstract declarator, e.g. `struct P *[4]`
pub fn type_name<'a>(full: &'a str, input: &'a str) -> PResult<'a, TypeName> {
    context("type name", |input| {
        let (input, _) = ws(input)?;
        let start = position(full, input);
        let (input, specifiers) = decl_specifiers(full, input)?;
        let (input, decl) = declarator(full, input, DeclaratorMode::Abstract)?;
        Ok((
            input,
            TypeName {
                specifiers,
                declarator: decl,
                span: make_span(full, start, input),
            },
        ))
    })
    .parse(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs(src: &str) -> DeclSpecifiers {
        decl_specifiers(src, src).unwrap().1
    }

    #[test]
    fn test_canonical_primitives() {
        let cases = [
            ("int", "int"),
            ("signed", "int"),
            ("unsigned", "unsigned int"),
            ("short int", "short"),
            ("unsigned short", "unsigned short"),
            ("long unsigned int", "unsigned long"),
            ("long long", "long long"),
            ("unsigned long long int", "unsigned long long"),
            ("signed char", "signed char"),
            ("char", "char"),
            ("long double", "long double"),
            ("_Bool", "_Bool"),
        ];
        for (src, expected) in cases {
            assert_eq!(
                specs(src).ty,
                TypeSpecifier::Primitive(expected.to_string()),
                "{}",
                src
            );
        }
    }

    #[test]
    fn test_invalid_combinations() {
        assert!(decl_specifiers("short long x", "short long x").is_err());
        assert!(decl_specifiers("int char x", "int char x").is_err());
        assert!(decl_specifiers("long long long", "long long long").is_err());
        assert!(decl_specifiers("const ;", "const ;").is_err());
    }

    #[test]
    fn test_typedef_name_then_declarator() {
        let src = "const size_t n";
        let (rest, s) = decl_specifiers(src, src).unwrap();
        assert_eq!(s.ty, TypeSpecifier::Named("size_t".to_string()));
        assert!(s.qualifiers.is_const);
        assert_eq!(rest, " n");
    }

    #[test]
    fn test_function_pointer_declarator() {
        let src = "(*cb)(int, void *)";
        let (rest, d) = declarator(src, src, DeclaratorMode::Named).unwrap();
        assert!(rest.is_empty());
        assert_eq!(d.name(), Some("cb"));
        assert!(!d.is_function());
        match d {
            Declarator::Function { inner, params } => {
                assert_eq!(params.params.len(), 2);
                assert!(matches!(*inner, Declarator::Pointer { .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_abstract_grouping_vs_params() {
        let src = "int (*)(void)";
        let (rest, tn) = type_name(src, src).unwrap();
        assert!(rest.is_empty());
        assert!(matches!(tn.declarator, Declarator::Function { .. }));

        let src = "int (int)";
        let (_, tn) = type_name(src, src).unwrap();
        match tn.declarator {
            Declarator::Function { inner, params } => {
                assert!(matches!(*inner, Declarator::Name { name: None, .. }));
                assert_eq!(params.params.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_variadic_and_void_params() {
        let src = "(const char *fmt, ...)";
        let (_, p) = param_list(src, src).unwrap();
        assert!(p.variadic);
        assert_eq!(p.params.len(), 1);

        let src = "(void)";
        let (_, p) = param_list(src, src).unwrap();
        assert!(p.params.is_empty());
        assert!(!p.variadic);

        let src = "(void *p)";
        let (_, p) = param_list(src, src).unwrap();
        assert_eq!(p.params.len(), 1);
    }
}
