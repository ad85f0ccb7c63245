//! In-process backend
//!
//! Types live in a [`TypeArena`] and are named with cffi-style templates:
//! the C spelling with `&` marking where a declarator goes, so `int *`
//! wrapped in an array of 3 becomes `int *&[3]` and a pointer to that
//! becomes `int *(*&)[3]`.

use std::ffi::c_int;
use std::path::Path;
use std::rc::Rc;

use log::{debug, trace};

use crate::backend::{BResult, Backend, FieldSpec, IntegerTypeInfo};
use crate::error::{BackendError, BackendErrorKind};
use crate::value::{HostCallable, Value};

pub mod callback;
pub mod data;
pub mod library;
pub mod types;

pub use callback::NativeCallback;
pub use data::CData;
pub use library::{NativeFunction, NativeLibrary};
pub use types::{NativeType, PrimitiveKind, StructLayout, TypeArena, TypeKind};

use crate::model::AggregateKind;

#[derive(Debug, Default)]
pub struct NativeBackend {
    arena: Rc<TypeArena>,
}

impl NativeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arena(&self) -> &TypeArena {
        &self.arena
    }

    /// Display name of a type, e.g. `int(*)[3]`
    pub fn type_name(&self, ty: NativeType) -> String {
        self.arena.name(ty)
    }

    fn aggregate(&self, kind: AggregateKind, name: &str) -> NativeType {
        self.arena.push(
            format!("{} {}&", kind.keyword(), name),
            TypeKind::Aggregate { kind, layout: None },
        )
    }
}

#[cfg(any(target_os = "linux", target_os = "emscripten"))]
fn errno_location() -> Option<*mut c_int> {
    // SAFETY: always valid for the calling thread
    Some(unsafe { libc::__errno_location() })
}

#[cfg(any(target_os = "android", target_os = "netbsd", target_os = "openbsd"))]
fn errno_location() -> Option<*mut c_int> {
    // SAFETY: always valid for the calling thread
    Some(unsafe { libc::__errno() })
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
))]
fn errno_location() -> Option<*mut c_int> {
    // SAFETY: always valid for the calling thread
    Some(unsafe { libc::__error() })
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "emscripten",
    target_os = "android",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
)))]
fn errno_location() -> Option<*mut c_int> {
    None
}

/// Smallest integer kind that can hold every enumerator
fn enum_repr(values: &[i64]) -> PrimitiveKind {
    let min = values.iter().copied().min().unwrap_or(0);
    let max = values.iter().copied().max().unwrap_or(0);
    if min >= 0 && max <= u32::MAX as i64 {
        if max <= i32::MAX as i64 {
            PrimitiveKind::Int
        } else {
            PrimitiveKind::UInt
        }
    } else if min >= i32::MIN as i64 && max <= i32::MAX as i64 {
        PrimitiveKind::Int
    } else if min >= 0 {
        PrimitiveKind::ULongLong
    } else {
        PrimitiveKind::LongLong
    }
}

impl Backend for NativeBackend {
    type Type = NativeType;
    type Data = CData;
    type Library = NativeLibrary;
    type Function = NativeFunction;
    type Callback = NativeCallback;

    fn name(&self) -> &str {
        "native"
    }

    fn new_void_type(&self) -> BResult<NativeType> {
        Ok(self.arena.push("void&".to_string(), TypeKind::Void))
    }

    fn new_primitive_type(&self, name: &str) -> BResult<NativeType> {
        let kind = PrimitiveKind::from_name(name).ok_or_else(|| {
            BackendError::new(
                BackendErrorKind::UnknownType,
                format!("unknown primitive type '{}'", name),
            )
        })?;
        Ok(self
            .arena
            .push(format!("{}&", kind.name()), TypeKind::Primitive(kind)))
    }

    fn new_pointer_type(&self, pointee: &NativeType) -> BResult<NativeType> {
        let inner = self.arena.template(*pointee);
        let template = match self.arena.kind(*pointee) {
            TypeKind::Array { .. } | TypeKind::Function { .. } => inner.replacen('&', "(*&)", 1),
            _ => inner.replacen('&', " *&", 1),
        };
        trace!("pointer type {}", template);
        Ok(self.arena.push(template, TypeKind::Pointer(*pointee)))
    }

    fn new_array_type(&self, item: &NativeType, length: Option<usize>) -> BResult<NativeType> {
        let element = self.arena.pointee(*item).ok_or_else(|| {
            BackendError::mismatch(format!(
                "array item '{}' is not a pointer type",
                self.arena.name(*item)
            ))
        })?;
        match self.arena.kind(element) {
            TypeKind::Void | TypeKind::Function { .. } => {
                return Err(BackendError::mismatch(format!(
                    "array of '{}'",
                    self.arena.name(element)
                )))
            }
            _ => {
                self.arena.size(element)?;
            }
        }
        let suffix = match length {
            Some(n) => format!("&[{}]", n),
            None => "&[]".to_string(),
        };
        let template = self.arena.template(element).replacen('&', &suffix, 1);
        Ok(self
            .arena
            .push(template, TypeKind::Array { element, length }))
    }

    fn new_function_type(
        &self,
        args: &[NativeType],
        result: &NativeType,
        variadic: bool,
    ) -> BResult<NativeType> {
        if matches!(
            self.arena.kind(*result),
            TypeKind::Array { .. } | TypeKind::Function { .. }
        ) {
            return Err(BackendError::mismatch(format!(
                "function returning '{}'",
                self.arena.name(*result)
            )));
        }
        let mut params: Vec<String> = args.iter().map(|a| self.arena.name(*a)).collect();
        if variadic {
            params.push("...".to_string());
        }
        let params = if params.is_empty() {
            "void".to_string()
        } else {
            params.join(", ")
        };
        let template = self
            .arena
            .template(*result)
            .replacen('&', &format!("&({})", params), 1);
        Ok(self.arena.push(
            template,
            TypeKind::Function {
                args: args.to_vec(),
                result: *result,
                variadic,
            },
        ))
    }

    fn new_struct_type(&self, name: &str) -> BResult<NativeType> {
        Ok(self.aggregate(AggregateKind::Struct, name))
    }

    fn new_union_type(&self, name: &str) -> BResult<NativeType> {
        Ok(self.aggregate(AggregateKind::Union, name))
    }

    fn complete_struct_or_union(
        &self,
        ty: &NativeType,
        fields: &[FieldSpec<'_, NativeType>],
    ) -> BResult<()> {
        self.arena.complete(*ty, fields)?;
        debug!(
            "laid out {} ({} bytes)",
            self.arena.name(*ty),
            self.arena.size(*ty)?
        );
        Ok(())
    }

    fn new_enum_type(
        &self,
        name: &str,
        enumerators: &[String],
        values: &[i64],
    ) -> BResult<NativeType> {
        if enumerators.len() != values.len() {
            return Err(BackendError::mismatch(format!(
                "enum {} has {} enumerators but {} values",
                name,
                enumerators.len(),
                values.len()
            )));
        }
        let repr = enum_repr(values);
        Ok(self
            .arena
            .push(format!("enum {}&", name), TypeKind::Enum { repr }))
    }

    fn sizeof_type(&self, ty: &NativeType) -> BResult<usize> {
        self.arena.size(*ty)
    }

    fn alignof(&self, ty: &NativeType) -> BResult<usize> {
        self.arena.align(*ty)
    }

    fn offsetof(&self, ty: &NativeType, field: &str) -> BResult<usize> {
        self.arena.offset_of(*ty, field)
    }

    fn sizeof_instance(&self, data: &CData) -> BResult<usize> {
        data.size()
    }

    fn typeof_instance(&self, data: &CData) -> BResult<NativeType> {
        Ok(data.ctype())
    }

    fn newp(&self, ty: &NativeType, init: Option<&Value>) -> BResult<CData> {
        data::newp(&self.arena, *ty, init)
    }

    fn cast(&self, ty: &NativeType, source: &Value) -> BResult<CData> {
        data::cast(&self.arena, *ty, source)
    }

    fn string(&self, data: &CData, length: usize) -> BResult<Vec<u8>> {
        data::string(data, length)
    }

    fn load_library(&self, path: Option<&Path>) -> BResult<NativeLibrary> {
        match path {
            None => NativeLibrary::this(),
            Some(path) => NativeLibrary::open(path),
        }
    }

    fn load_function(
        &self,
        library: &NativeLibrary,
        ty: &NativeType,
        name: &str,
    ) -> BResult<NativeFunction> {
        NativeFunction::bind(&self.arena, library, *ty, name)
    }

    fn read_variable(
        &self,
        library: &NativeLibrary,
        ty: &NativeType,
        name: &str,
    ) -> BResult<CData> {
        let address = library.symbol(name)?;
        let extent = self.arena.size(*ty).ok();
        Ok(CData::view(self.arena.clone(), *ty, address, extent))
    }

    fn write_variable(
        &self,
        library: &NativeLibrary,
        ty: &NativeType,
        name: &str,
        value: &Value,
    ) -> BResult<()> {
        self.read_variable(library, ty, name)?.set_value(value)
    }

    fn callback(&self, ty: &NativeType, callable: HostCallable) -> BResult<NativeCallback> {
        NativeCallback::new(&self.arena, *ty, callable)
    }

    fn get_errno(&self) -> i32 {
        match errno_location() {
            // SAFETY: thread-local and always mapped
            Some(location) => unsafe { *location },
            None => std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
        }
    }

    fn set_errno(&self, value: i32) {
        if let Some(location) = errno_location() {
            // SAFETY: thread-local and always mapped
            unsafe { *location = value };
        }
    }

    fn nonstandard_integer_types(&self) -> Vec<IntegerTypeInfo> {
        use std::mem::size_of;
        let mut types = Vec::new();
        for (bits, size) in [(8, 1), (16, 2), (32, 4), (64, 8)] {
            for prefix in ["int", "int_least"] {
                types.push(IntegerTypeInfo::new(format!("{}{}_t", prefix, bits), size, true));
                types.push(IntegerTypeInfo::new(format!("u{}{}_t", prefix, bits), size, false));
            }
        }
        types.extend([
            IntegerTypeInfo::new("intmax_t", 8, true),
            IntegerTypeInfo::new("uintmax_t", 8, false),
            IntegerTypeInfo::new("intptr_t", size_of::<isize>(), true),
            IntegerTypeInfo::new("uintptr_t", size_of::<usize>(), false),
            IntegerTypeInfo::new("ptrdiff_t", size_of::<isize>(), true),
            IntegerTypeInfo::new("size_t", size_of::<libc::size_t>(), false),
            IntegerTypeInfo::new("ssize_t", size_of::<libc::ssize_t>(), true),
            IntegerTypeInfo::new(
                "wchar_t",
                size_of::<libc::wchar_t>(),
                libc::wchar_t::MIN != 0,
            ),
        ]);
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn primitive(backend: &NativeBackend, name: &str) -> NativeType {
        backend.new_primitive_type(name).unwrap()
    }

    #[test]
    fn test_type_names() {
        let backend = NativeBackend::new();
        let int = primitive(&backend, "int");
        let ptr = backend.new_pointer_type(&int).unwrap();
        let ptr_ptr = backend.new_pointer_type(&ptr).unwrap();
        let array = backend.new_array_type(&ptr, Some(3)).unwrap();
        let array_ptr = backend.new_pointer_type(&array).unwrap();
        let open = backend.new_array_type(&ptr, None).unwrap();
        let function = backend.new_function_type(&[int, ptr], &int, true).unwrap();
        let function_ptr = backend.new_pointer_type(&function).unwrap();
        let no_args = backend.new_function_type(&[], &int, false).unwrap();

        assert_eq!(backend.type_name(int), "int");
        assert_eq!(backend.type_name(ptr), "int *");
        assert_eq!(backend.type_name(ptr_ptr), "int * *");
        assert_eq!(backend.type_name(array), "int[3]");
        assert_eq!(backend.type_name(array_ptr), "int(*)[3]");
        assert_eq!(backend.type_name(open), "int[]");
        assert_eq!(backend.type_name(function), "int(int, int *, ...)");
        assert_eq!(backend.type_name(function_ptr), "int(*)(int, int *, ...)");
        assert_eq!(backend.type_name(no_args), "int(void)");
    }

    #[test]
    fn test_array_of_incomplete_struct_rejected() {
        let backend = NativeBackend::new();
        let s = backend.new_struct_type("S").unwrap();
        let ptr = backend.new_pointer_type(&s).unwrap();
        let err = backend.new_array_type(&ptr, Some(2)).unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::IncompleteType);
        assert_eq!(backend.type_name(ptr), "struct S *");
    }

    #[test]
    fn test_enum_repr() {
        assert_eq!(enum_repr(&[0, 1, 2]), PrimitiveKind::Int);
        assert_eq!(enum_repr(&[-1, 1]), PrimitiveKind::Int);
        assert_eq!(enum_repr(&[0, u32::MAX as i64]), PrimitiveKind::UInt);
        assert_eq!(enum_repr(&[-1, u32::MAX as i64]), PrimitiveKind::LongLong);
        assert_eq!(enum_repr(&[0, 1 << 40]), PrimitiveKind::ULongLong);
    }

    #[test]
    fn test_errno_round_trip() {
        let backend = NativeBackend::new();
        backend.set_errno(42);
        assert_eq!(backend.get_errno(), 42);
        backend.set_errno(0);
    }

    #[test]
    fn test_nonstandard_integer_types() {
        let types = NativeBackend::new().nonstandard_integer_types();
        let size_t = types.iter().find(|t| t.name == "size_t").unwrap();
        assert_eq!(size_t.size, std::mem::size_of::<usize>());
        assert!(!size_t.signed);
        assert!(types.iter().any(|t| t.name == "uint8_t" && t.size == 1));
    }
}
