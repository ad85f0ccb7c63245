//! A layout-only backend that records every constructor call

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use ffi::{BResult, Backend, BackendError, BackendErrorKind, FieldSpec, IntegerTypeInfo};

pub struct Node {
    pub id: usize,
    pub name: String,
    pub size: Cell<Option<usize>>,
    pub fields: RefCell<Vec<(String, usize)>>,
}

/// Identity is the allocation, not the name
#[derive(Clone)]
pub struct Handle(pub Rc<Node>);

impl Handle {
    pub fn same(&self, other: &Handle) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn is_complete(&self) -> bool {
        self.0.size.get().is_some()
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.0.id, self.0.name)
    }
}

#[derive(Default)]
pub struct RecordingBackend {
    next: Cell<usize>,
    pub calls: RefCell<Vec<String>>,
    /// Completing an aggregate with this name fails
    pub fail_on: RefCell<Option<String>>,
    pub integer_types: Vec<IntegerTypeInfo>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_integer_types(integer_types: Vec<IntegerTypeInfo>) -> Self {
        Self {
            integer_types,
            ..Self::default()
        }
    }

    pub fn fail_on(&self, name: &str) {
        *self.fail_on.borrow_mut() = Some(name.to_string());
    }

    pub fn clear_failure(&self) {
        *self.fail_on.borrow_mut() = None;
    }

    /// Calls whose description starts with `prefix`
    pub fn count(&self, prefix: &str) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn node(&self, call: &str, name: String, size: Option<usize>) -> Handle {
        let id = self.next.get();
        self.next.set(id + 1);
        self.calls.borrow_mut().push(format!("{} {}", call, name));
        Handle(Rc::new(Node {
            id,
            name,
            size: Cell::new(size),
            fields: RefCell::new(Vec::new()),
        }))
    }
}

fn primitive_size(name: &str) -> Option<usize> {
    let base = name
        .trim_start_matches("unsigned ")
        .trim_start_matches("signed ");
    Some(match base {
        "char" | "_Bool" => 1,
        "short" => 2,
        "int" | "float" => 4,
        "long" | "long long" | "double" => 8,
        "long double" => 16,
        _ => return None,
    })
}

impl Backend for RecordingBackend {
    type Type = Handle;
    type Data = ();
    type Library = ();
    type Function = Handle;
    type Callback = ();

    fn name(&self) -> &str {
        "recording"
    }

    fn new_void_type(&self) -> BResult<Handle> {
        Ok(self.node("void", "void".into(), None))
    }

    fn new_primitive_type(&self, name: &str) -> BResult<Handle> {
        let size = primitive_size(name).ok_or_else(|| {
            BackendError::new(BackendErrorKind::UnknownType, format!("unknown primitive '{}'", name))
        })?;
        Ok(self.node("primitive", name.to_string(), Some(size)))
    }

    fn new_pointer_type(&self, pointee: &Handle) -> BResult<Handle> {
        Ok(self.node("pointer", format!("{}*", pointee.name()), Some(8)))
    }

    fn new_array_type(&self, item: &Handle, length: Option<usize>) -> BResult<Handle> {
        let element = item.name().trim_end_matches('*').to_string();
        Ok(self.node("array", format!("{}[{:?}]", element, length), None))
    }

    fn new_function_type(&self, args: &[Handle], result: &Handle, variadic: bool) -> BResult<Handle> {
        let args: Vec<&str> = args.iter().map(Handle::name).collect();
        Ok(self.node(
            "function",
            format!("{}({}{})", result.name(), args.join(","), if variadic { ",..." } else { "" }),
            None,
        ))
    }

    fn new_struct_type(&self, name: &str) -> BResult<Handle> {
        Ok(self.node("struct", format!("struct {}", name), None))
    }

    fn new_union_type(&self, name: &str) -> BResult<Handle> {
        Ok(self.node("union", format!("union {}", name), None))
    }

    fn complete_struct_or_union(&self, ty: &Handle, fields: &[FieldSpec<'_, Handle>]) -> BResult<()> {
        self.calls.borrow_mut().push(format!("complete {}", ty.name()));
        if self.fail_on.borrow().as_deref() == Some(ty.name()) {
            return Err(BackendError::new(
                BackendErrorKind::InvalidField,
                format!("refusing to lay out {}", ty.name()),
            ));
        }
        let mut offset = 0;
        let mut laid_out = Vec::new();
        for field in fields {
            let size = field.ty.0.size.get().ok_or_else(|| BackendError::incomplete(field.ty.name()))?;
            laid_out.push((field.name.to_string(), offset));
            offset += size;
        }
        *ty.0.fields.borrow_mut() = laid_out;
        ty.0.size.set(Some(offset));
        Ok(())
    }

    fn new_enum_type(&self, name: &str, _enumerators: &[String], _values: &[i64]) -> BResult<Handle> {
        Ok(self.node("enum", format!("enum {}", name), Some(4)))
    }

    fn sizeof_type(&self, ty: &Handle) -> BResult<usize> {
        ty.0.size.get().ok_or_else(|| BackendError::incomplete(ty.name()))
    }

    fn alignof(&self, ty: &Handle) -> BResult<usize> {
        self.sizeof_type(ty).map(|size| size.clamp(1, 8))
    }

    fn offsetof(&self, ty: &Handle, field: &str) -> BResult<usize> {
        ty.0.fields
            .borrow()
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, offset)| *offset)
            .ok_or_else(|| BackendError::new(BackendErrorKind::InvalidField, format!("no field '{}'", field)))
    }

    fn load_library(&self, _path: Option<&std::path::Path>) -> BResult<()> {
        Ok(())
    }

    fn load_function(&self, _library: &(), ty: &Handle, name: &str) -> BResult<Handle> {
        self.calls.borrow_mut().push(format!("bind {}", name));
        Ok(ty.clone())
    }

    fn nonstandard_integer_types(&self) -> Vec<IntegerTypeInfo> {
        self.integer_types.clone()
    }
}
