//! End-to-end tests against the C runtime of the test process

use ffi::verifier::{MeasuredField, MeasuredLayout};
use ffi::{Backend, BackendErrorKind, Ffi, FfiError, Symbol, Value, VerifyReport};
use indoc::indoc;

fn facade() -> Ffi<ffi::NativeBackend> {
    ffi::logging::init_test();
    Ffi::new().unwrap()
}

#[test]
fn test_function_binding_is_reused() {
    let ffi = facade();
    ffi.cdef("int printf(const char *, ...);").unwrap();
    let first = ffi.c().function("printf").unwrap();
    let second = ffi.c().function("printf").unwrap();
    assert!(first.same_binding(&second));
    assert_ne!(first.address(), 0);
    assert!(matches!(ffi.c().get("printf").unwrap(), Symbol::Function(_)));
}

#[test]
fn test_platform_integer_typedefs() {
    let ffi = facade();
    for info in ffi.backend().nonstandard_integer_types() {
        assert_eq!(ffi.size_of(&info.name).unwrap(), info.size, "{}", info.name);
        let minus_one = ffi.cast(&info.name, &Value::Int(-1)).unwrap().value().unwrap();
        assert_eq!(matches!(minus_one, Value::Int(-1)), info.signed, "{}", info.name);
    }
    assert_eq!(ffi.size_of("size_t").unwrap(), std::mem::size_of::<usize>());
}

#[test]
fn test_struct_layout() {
    let ffi = facade();
    ffi.cdef(indoc! {"
        struct P { int x; int y; };
        struct Q { char c; double d; short s; };
        union U { char c; int i; };
    "})
    .unwrap();
    assert_eq!(ffi.size_of("struct P").unwrap(), 8);
    assert_eq!(ffi.align_of("struct P").unwrap(), 4);
    assert_eq!(ffi.offset_of("struct P", "y").unwrap(), 4);
    assert_eq!(ffi.offset_of("struct Q", "d").unwrap(), 8);
    assert_eq!(ffi.size_of("struct Q").unwrap(), 24);
    assert_eq!(ffi.size_of("union U").unwrap(), 4);
    assert_eq!(ffi.backend().type_name(ffi.type_of("struct P *").unwrap()), "struct P *");
}

#[cfg(target_pointer_width = "64")]
#[test]
fn test_oversized_struct_is_an_error() {
    let ffi = facade();
    ffi.cdef("struct Big { char a[0x2000000000000000]; char b; };")
        .unwrap();
    assert!(matches!(
        ffi.size_of("struct Big"),
        Err(FfiError::Backend(ref e)) if e.kind == BackendErrorKind::Allocation
    ));
    // the fixed-size prefix alone still fits
    ffi.cdef("struct Half { char a[0x1000000000000000]; };").unwrap();
    assert_eq!(ffi.size_of("struct Half").unwrap(), 0x1000000000000000);
}

#[test]
fn test_calls_with_integers_and_strings() {
    let ffi = facade();
    ffi.cdef(indoc! {"
        size_t strlen(const char *s);
        int abs(int);
        long labs(long);
    "})
    .unwrap();
    let strlen = ffi.c().function("strlen").unwrap();
    assert_eq!(strlen.call(&[Value::from("hello")]).unwrap(), Value::UInt(5));

    let abs = ffi.c().function("abs").unwrap();
    assert_eq!(abs.call(&[Value::Int(-5)]).unwrap(), Value::Int(5));
    assert!(abs.call(&[]).is_err());

    let labs = ffi.c().function("labs").unwrap();
    assert_eq!(labs.call(&[Value::Int(-1 << 40)]).unwrap(), Value::Int(1 << 40));
}

#[test]
fn test_variadic_call_into_buffer() {
    let ffi = facade();
    ffi.cdef("int snprintf(char *buf, size_t n, const char *fmt, ...);")
        .unwrap();
    let buffer = ffi.alloc("char[32]", None).unwrap();
    let snprintf = ffi.c().function("snprintf").unwrap();
    let written = snprintf
        .call(&[
            buffer.as_argument().unwrap(),
            Value::Int(32),
            Value::from("%d-%s"),
            Value::Int(42),
            Value::from("x"),
        ])
        .unwrap();
    assert_eq!(written, Value::Int(4));
    assert_eq!(ffi.string(&buffer, 32).unwrap(), b"42-x");
}

#[test]
fn test_qsort_with_callback() {
    let ffi = facade();
    ffi.cdef("void qsort(void *base, size_t nmemb, size_t size, int (*compar)(const void *, const void *));")
        .unwrap();
    let items: Vec<Value> = [5, 3, 1, 4, 2].into_iter().map(Value::Int).collect();
    let array = ffi.alloc("int[]", Some(&Value::List(items))).unwrap();
    assert_eq!(array.len(), Some(5));

    let compare = ffi
        .callback_fn("int(*)(const void *, const void *)", |args| {
            let read = |v: &Value| {
                let address = v.as_address().unwrap_or(0);
                // SAFETY: qsort passes pointers into the array being sorted
                unsafe { *(address as *const i32) }
            };
            Value::Int((read(&args[0]) - read(&args[1])) as i64)
        })
        .unwrap();

    let qsort = ffi.c().function("qsort").unwrap();
    let result = qsort
        .call(&[
            array.as_argument().unwrap(),
            Value::Int(5),
            Value::Int(4),
            compare.as_value(),
        ])
        .unwrap();
    assert_eq!(result, Value::Void);
    let sorted: Vec<Value> = (0..5).map(|i| array.item(i).unwrap()).collect();
    assert_eq!(sorted, [1, 2, 3, 4, 5].map(Value::Int).to_vec());
}

#[test]
fn test_callback_signature_must_be_a_function() {
    let ffi = facade();
    assert!(matches!(
        ffi.callback_fn("int *", |_| Value::Int(0)),
        Err(FfiError::InvalidArgument(_))
    ));
}

#[test]
fn test_global_variable_is_live() {
    let ffi = facade();
    ffi.cdef("extern int opterr;").unwrap();
    let before = ffi.c().variable("opterr").unwrap().value().unwrap();

    ffi.c().set("opterr", &Value::Int(0)).unwrap();
    assert_eq!(ffi.c().variable("opterr").unwrap().value().unwrap(), Value::Int(0));
    let Symbol::Variable(view) = ffi.c().get("opterr").unwrap() else {
        panic!("expected a variable");
    };
    ffi.c().set("opterr", &before).unwrap();
    // views read current memory, not a snapshot
    assert_eq!(view.value().unwrap(), before);
}

#[test]
fn test_functions_cannot_be_assigned() {
    let ffi = facade();
    ffi.cdef("int abs(int);").unwrap();
    assert!(matches!(
        ffi.c().set("abs", &Value::Int(0)),
        Err(FfiError::InvalidArgument(_))
    ));
    assert!(matches!(
        ffi.c().set("undeclared", &Value::Int(0)),
        Err(FfiError::UnknownSymbol(_))
    ));
}

#[test]
fn test_errno_on_default_proxy() {
    let ffi = facade();
    ffi.c().set("errno", &Value::Int(7)).unwrap();
    assert!(matches!(ffi.c().get("errno").unwrap(), Symbol::Errno(7)));
    ffi.c().set("errno", &Value::Int(0)).unwrap();
}

#[test]
fn test_missing_library() {
    let ffi = facade();
    assert!(matches!(
        ffi.load("cffi_no_such_library_anywhere"),
        Err(FfiError::LibraryNotFound(_))
    ));
}

#[cfg(target_os = "linux")]
#[test]
fn test_load_c_library_by_name() {
    let ffi = facade();
    ffi.cdef("size_t strlen(const char *s);").unwrap();
    let libc = match ffi.load("c") {
        Ok(libc) => libc,
        Err(e) => {
            eprintln!("skipping: {}", e);
            return;
        }
    };
    assert_eq!(libc.name(), Some("c"));
    let strlen = libc.function("strlen").unwrap();
    assert_eq!(strlen.call(&[Value::from("four")]).unwrap(), Value::UInt(4));
    // errno is only special on the default proxy
    assert!(matches!(libc.get("errno"), Err(FfiError::UnknownSymbol(_))));
}

#[test]
fn test_alloc_cast_and_string() {
    let ffi = facade();
    let int = ffi.alloc("int", Some(&Value::Int(42))).unwrap();
    assert!(int.is_owned());
    assert_eq!(int.item(0).unwrap(), Value::Int(42));
    int.set_value(&Value::Int(-7)).unwrap();
    assert_eq!(int.item(0).unwrap(), Value::Int(-7));

    let truncated = ffi.cast("unsigned char", &Value::Int(0x1ff)).unwrap();
    assert_eq!(truncated.value().unwrap(), Value::UInt(0xff));
    let negative = ffi.cast("int", &Value::Int(-1)).unwrap();
    assert_eq!(negative.value().unwrap(), Value::Int(-1));
    assert_eq!(ffi.size_of_data(&negative).unwrap(), 4);

    let text = ffi.alloc("char[]", Some(&Value::from("hi"))).unwrap();
    assert_eq!(ffi.size_of_data(&text).unwrap(), 3);
    assert_eq!(ffi.string(&text, 100).unwrap(), b"hi");
    assert_eq!(ffi.string(&text, 1).unwrap(), b"h");
    assert!(ffi.alloc("void", None).is_err());
}

#[test]
fn test_compare_layouts() {
    let ffi = facade();
    ffi.cdef("struct P { int x; int y; };").unwrap();
    let measured = |size| VerifyReport {
        layouts: vec![MeasuredLayout {
            kind: "struct".into(),
            name: "P".into(),
            size,
            align: 4,
            fields: vec![
                MeasuredField { name: "x".into(), offset: 0 },
                MeasuredField { name: "y".into(), offset: 4 },
            ],
        }],
    };
    assert!(ffi.compare_layouts(&measured(8)).unwrap().is_empty());

    let mismatches = ffi.compare_layouts(&measured(12)).unwrap();
    assert_eq!(mismatches.len(), 1);
    assert_eq!(mismatches[0].what, "size");
    assert_eq!(mismatches[0].expected, 12);
    assert_eq!(mismatches[0].actual, 8);
}
