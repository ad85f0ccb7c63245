//! Backend capability contract
//!
//! A backend turns logical types into concrete handles and performs every
//! operation that touches native memory or code. The facade is generic over
//! [`Backend`] and never assumes which implementation it was given.
//!
//! Type construction and layout queries are required. Data, library and
//! callback operations have default implementations that report
//! [`BackendErrorKind::Unsupported`](crate::error::BackendErrorKind), so a
//! layout-only backend only has to implement the first group.

use std::path::Path;

use crate::error::BackendError;
use crate::value::{HostCallable, Value};

pub mod native;

pub type BResult<T> = std::result::Result<T, BackendError>;

/// One field handed to [`Backend::complete_struct_or_union`]
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec<'a, T> {
    /// Empty for unnamed bit-fields
    pub name: &'a str,
    pub ty: &'a T,
    pub bitsize: Option<u32>,
}

/// A platform integer typedef such as `size_t`, as reported by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegerTypeInfo {
    pub name: String,
    pub size: usize,
    pub signed: bool,
}

impl IntegerTypeInfo {
    pub fn new(name: impl Into<String>, size: usize, signed: bool) -> Self {
        Self {
            name: name.into(),
            size,
            signed,
        }
    }
}

pub trait Backend {
    /// Realized type; cloning must preserve identity
    type Type: Clone + std::fmt::Debug;
    /// Data handle ("cdata")
    type Data;
    type Library;
    /// Bound native function
    type Function: Clone;
    /// Native-callable trampoline; dropping it releases the trampoline
    type Callback;

    /// Short name for logs and CLI output
    fn name(&self) -> &str;

    // Type construction

    fn new_void_type(&self) -> BResult<Self::Type>;

    /// `name` is a canonical C spelling such as `unsigned long long`
    fn new_primitive_type(&self, name: &str) -> BResult<Self::Type>;

    fn new_pointer_type(&self, pointee: &Self::Type) -> BResult<Self::Type>;

    /// `item` is the pointer-to-element handle; `None` length is an open array
    fn new_array_type(&self, item: &Self::Type, length: Option<usize>) -> BResult<Self::Type>;

    fn new_function_type(
        &self,
        args: &[Self::Type],
        result: &Self::Type,
        variadic: bool,
    ) -> BResult<Self::Type>;

    /// Incomplete struct handle; completed later by
    /// [`complete_struct_or_union`](Backend::complete_struct_or_union)
    fn new_struct_type(&self, name: &str) -> BResult<Self::Type>;

    fn new_union_type(&self, name: &str) -> BResult<Self::Type>;

    /// Lay out the fields of an incomplete struct or union handle in place
    fn complete_struct_or_union(
        &self,
        ty: &Self::Type,
        fields: &[FieldSpec<'_, Self::Type>],
    ) -> BResult<()>;

    fn new_enum_type(&self, name: &str, enumerators: &[String], values: &[i64])
        -> BResult<Self::Type>;

    // Layout queries

    fn sizeof_type(&self, ty: &Self::Type) -> BResult<usize>;

    fn alignof(&self, ty: &Self::Type) -> BResult<usize>;

    fn offsetof(&self, ty: &Self::Type, field: &str) -> BResult<usize>;

    fn sizeof_instance(&self, _data: &Self::Data) -> BResult<usize> {
        Err(BackendError::unsupported("data handles"))
    }

    fn typeof_instance(&self, _data: &Self::Data) -> BResult<Self::Type> {
        Err(BackendError::unsupported("data handles"))
    }

    // Data

    /// Allocate zeroed storage for a pointer's pointee (or an array) and
    /// apply `init`; returns an owning handle
    fn newp(&self, _ty: &Self::Type, _init: Option<&Value>) -> BResult<Self::Data> {
        Err(BackendError::unsupported("allocation"))
    }

    /// Reinterpret `source` as `ty` without allocating
    fn cast(&self, _ty: &Self::Type, _source: &Value) -> BResult<Self::Data> {
        Err(BackendError::unsupported("casts"))
    }

    /// Bytes of a `char *` or `char[]` up to `length` or the first NUL
    fn string(&self, _data: &Self::Data, _length: usize) -> BResult<Vec<u8>> {
        Err(BackendError::unsupported("strings"))
    }

    // Libraries and symbols

    /// Open a library; `None` binds the running process image
    fn load_library(&self, _path: Option<&Path>) -> BResult<Self::Library> {
        Err(BackendError::unsupported("library loading"))
    }

    fn load_function(
        &self,
        _library: &Self::Library,
        _ty: &Self::Type,
        _name: &str,
    ) -> BResult<Self::Function> {
        Err(BackendError::unsupported("function binding"))
    }

    /// A live view of a global variable; every call reads current memory
    fn read_variable(
        &self,
        _library: &Self::Library,
        _ty: &Self::Type,
        _name: &str,
    ) -> BResult<Self::Data> {
        Err(BackendError::unsupported("variable access"))
    }

    fn write_variable(
        &self,
        _library: &Self::Library,
        _ty: &Self::Type,
        _name: &str,
        _value: &Value,
    ) -> BResult<()> {
        Err(BackendError::unsupported("variable access"))
    }

    fn callback(&self, _ty: &Self::Type, _callable: HostCallable) -> BResult<Self::Callback> {
        Err(BackendError::unsupported("callbacks"))
    }

    /// The calling thread's last native error code
    fn get_errno(&self) -> i32 {
        0
    }

    fn set_errno(&self, _value: i32) {}

    /// Integer typedefs that are not builtin C keywords on this platform
    fn nonstandard_integer_types(&self) -> Vec<IntegerTypeInfo> {
        Vec::new()
    }
}
