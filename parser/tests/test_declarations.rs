//! Declaration parsing tests for the C parser

use indoc::indoc;
use parser::c_ast::*;
use parser::{parse_declarations, parse_type_name};

fn parse(input: &str) -> TranslationUnit {
    match parse_declarations(input) {
        Ok(unit) => unit,
        Err(e) => panic!("declarations should parse, got: {} at {}", e, e.offset),
    }
}

#[test]
fn test_function_prototypes() {
    let unit = parse(indoc! {"
        int printf(const char *, ...);
        void *malloc(size_t size);
        int abs(int);
    "});
    assert_eq!(unit.declarations.len(), 3);

    let printf = &unit.declarations[0];
    assert_eq!(printf.specifiers.ty, TypeSpecifier::Primitive("int".into()));
    let d = &printf.declarators[0].declarator;
    assert_eq!(d.name(), Some("printf"));
    assert!(d.is_function());
    if let Declarator::Function { params, .. } = d {
        assert!(params.variadic);
        assert_eq!(params.params.len(), 1);
        assert!(params.params[0].specifiers.qualifiers.is_const);
        assert!(matches!(params.params[0].declarator, Declarator::Pointer { .. }));
    } else {
        panic!("Expected function declarator");
    }

    // `void *malloc(...)`: pointer wraps the function node
    let malloc = &unit.declarations[1].declarators[0].declarator;
    assert!(malloc.is_function());
    assert!(matches!(malloc, Declarator::Pointer { .. }));
}

#[test]
fn test_struct_definition() {
    let unit = parse(indoc! {"
        struct Node {
            int value;
            struct Node *next;
            unsigned flags : 3, : 0, mode : 2;
        };
    "});
    let decl = &unit.declarations[0];
    assert!(decl.declarators.is_empty());
    let agg = match &decl.specifiers.ty {
        TypeSpecifier::StructOrUnion(agg) => agg,
        other => panic!("Expected struct, got {:?}", other),
    };
    assert_eq!(agg.kind, AggregateKind::Struct);
    assert_eq!(agg.tag.as_deref(), Some("Node"));
    let fields = agg.fields.as_ref().unwrap();
    assert_eq!(fields.len(), 3);

    let bits = &fields[2].members;
    assert_eq!(bits.len(), 3);
    assert_eq!(bits[0].declarator.as_ref().and_then(|d| d.name()), Some("flags"));
    assert!(bits[1].declarator.is_none());
    assert!(matches!(bits[1].bit_width, Some(ConstExpr::Int { value: 0, .. })));
    assert!(bits[2].bit_width.is_some());
}

#[test]
fn test_forward_declaration_and_typedef() {
    let unit = parse(indoc! {"
        struct opaque;
        typedef struct opaque opaque_t;
        typedef int (*compare_fn)(const void *, const void *);
    "});
    assert_eq!(unit.declarations.len(), 3);
    match &unit.declarations[0].specifiers.ty {
        TypeSpecifier::StructOrUnion(agg) => assert!(agg.fields.is_none()),
        other => panic!("Expected struct, got {:?}", other),
    }
    assert_eq!(
        unit.declarations[1].specifiers.storage,
        Some(StorageClass::Typedef)
    );
    let cmp = &unit.declarations[2].declarators[0].declarator;
    assert_eq!(cmp.name(), Some("compare_fn"));
    assert!(!cmp.is_function());
}

#[test]
fn test_enum_and_array_lengths() {
    let unit = parse(indoc! {"
        enum color { RED, GREEN = 5, BLUE, };
        int table[GREEN * 2][4];
        extern char buffer[];
    "});
    match &unit.declarations[0].specifiers.ty {
        TypeSpecifier::Enum(e) => {
            let items = e.enumerators.as_ref().unwrap();
            assert_eq!(items.len(), 3);
            assert!(items[0].value.is_none());
            assert!(items[1].value.is_some());
        }
        other => panic!("Expected enum, got {:?}", other),
    }

    // table[GREEN * 2][4]: the last suffix is applied first
    match &unit.declarations[1].declarators[0].declarator {
        Declarator::Array { inner, length } => {
            assert!(matches!(length, Some(ConstExpr::Int { value: 4, .. })));
            assert!(matches!(**inner, Declarator::Array { length: Some(ConstExpr::Binary { .. }), .. }));
        }
        other => panic!("Expected array, got {:?}", other),
    }

    let buffer = &unit.declarations[2];
    assert_eq!(buffer.specifiers.storage, Some(StorageClass::Extern));
    assert!(matches!(
        buffer.declarators[0].declarator,
        Declarator::Array { length: None, .. }
    ));
}

#[test]
fn test_union_and_anonymous_struct() {
    let unit = parse("typedef union { int i; float f; } number_t; struct { char c; } value;");
    match &unit.declarations[0].specifiers.ty {
        TypeSpecifier::StructOrUnion(agg) => {
            assert_eq!(agg.kind, AggregateKind::Union);
            assert!(agg.tag.is_none());
        }
        other => panic!("Expected union, got {:?}", other),
    }
    assert_eq!(unit.declarations[1].declarators[0].declarator.name(), Some("value"));
}

#[test]
fn test_type_names() {
    for src in [
        "int",
        "unsigned long long",
        "struct P *",
        "char[]",
        "int *[4]",
        "void (*)(int, ...)",
        "const char * const",
        "size_t",
    ] {
        if let Err(e) = parse_type_name(src) {
            panic!("type name {:?} should parse, got: {}", src, e);
        }
    }

    let ty = parse_type_name("int *[4]").unwrap();
    // array of four pointers: the pointer is applied before the array
    match ty.declarator {
        Declarator::Pointer { inner, .. } => {
            assert!(matches!(*inner, Declarator::Array { .. }))
        }
        other => panic!("Expected pointer, got {:?}", other),
    }
}

#[test]
fn test_comments_are_skipped() {
    let unit = parse(indoc! {"
        /* block
           comment */
        int a; // trailing
        // whole line
        long b;
    "});
    assert_eq!(unit.declarations.len(), 2);
}

#[test]
fn test_error_positions() {
    let cases = [
        ("int a", "expected ';'"),
        ("struct;", "expected tag name"),
        ("int f(int;", "expected ')'"),
        ("int x[3;", "expected ']'"),
        ("#include <stdio.h>", "preprocessor directives"),
        ("enum { = 3 };", "expected enumerator name"),
    ];
    for (src, expected) in cases {
        match parse_declarations(src) {
            Ok(unit) => panic!("{:?} should fail, parsed {:?}", src, unit),
            Err(e) => assert!(
                e.message.starts_with(expected),
                "{:?}: expected message starting with {:?}, got {:?}",
                src,
                expected,
                e.message
            ),
        }
    }

    let err = parse_declarations("int a;\n\nlong long long x;").unwrap_err();
    assert_eq!(err.offset, 18);
}
