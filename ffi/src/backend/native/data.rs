//! Native data handles
//!
//! A [`CData`] is one of three things:
//!
//! - owned zeroed storage from `newp`, typed as a pointer to it or as an
//!   array; freed when the last clone is dropped
//! - a view over memory owned elsewhere, typed as the object living there
//!   (library variables)
//! - an inline scalar produced by `cast`, which never touches memory
//!
//! Safe accessors check offsets against the extent of the memory when it is
//! known. Memory reached through a raw pointer has no known extent and is
//! only accessible through the `unsafe` `*_unchecked` accessors.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::rc::Rc;

use super::types::{FieldLayout, NativeType, PrimitiveKind, TypeArena, TypeKind};
use crate::backend::BResult;
use crate::error::{BackendError, BackendErrorKind};
use crate::value::Value;

const INLINE: usize = 16;

pub(crate) struct Allocation {
    ptr: NonNull<u8>,
    layout: Layout,
    size: usize,
}

impl Allocation {
    fn zeroed(size: usize, align: usize) -> BResult<Self> {
        let layout = Layout::from_size_align(size.max(1), align.max(1))
            .map_err(|e| BackendError::new(BackendErrorKind::Allocation, e.to_string()))?;
        // SAFETY: layout has a non-zero size
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            BackendError::new(
                BackendErrorKind::Allocation,
                format!("out of memory allocating {} bytes", size),
            )
        })?;
        Ok(Self { ptr, layout, size })
    }

    fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with this layout
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

#[derive(Clone)]
enum Repr {
    Owned(Rc<Allocation>),
    View { address: usize, extent: Option<usize> },
    Inline([u8; INLINE]),
}

#[derive(Clone)]
pub struct CData {
    ty: NativeType,
    arena: Rc<TypeArena>,
    repr: Repr,
}

/// Memory reached by indexing or field access
struct Region {
    address: usize,
    ty: NativeType,
    /// Bytes known to be valid from `address`
    extent: Option<usize>,
}

impl CData {
    /// View of `ty` living at `address`; `extent` bounds safe access
    pub(crate) fn view(arena: Rc<TypeArena>, ty: NativeType, address: usize, extent: Option<usize>) -> Self {
        Self {
            ty,
            arena,
            repr: Repr::View { address, extent },
        }
    }

    pub fn ctype(&self) -> NativeType {
        self.ty
    }

    pub fn type_name(&self) -> String {
        self.arena.name(self.ty)
    }

    /// True if this handle keeps its memory alive
    pub fn is_owned(&self) -> bool {
        matches!(self.repr, Repr::Owned(_))
    }

    /// Size of the handle's type; for owned arrays the whole array
    pub fn size(&self) -> BResult<usize> {
        self.arena.size(self.ty)
    }

    /// Address of the memory this handle refers to; a cast pointer's value
    pub fn address(&self) -> Option<usize> {
        match &self.repr {
            Repr::Owned(alloc) => Some(alloc.address()),
            Repr::View { address, .. } => Some(*address),
            Repr::Inline(bytes) => match self.arena.kind(self.ty) {
                TypeKind::Pointer(_) => Some(load_uint(&bytes[..size_of_ptr()]) as usize),
                _ => None,
            },
        }
    }

    /// Number of items of an array handle
    pub fn len(&self) -> Option<usize> {
        match self.arena.kind(self.ty) {
            TypeKind::Array { length, .. } => length,
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// The value of this handle: the pointer for owned storage, the
    /// contents for views and the scalar for casts
    pub fn value(&self) -> BResult<Value> {
        match &self.repr {
            Repr::Owned(alloc) => match self.arena.kind(self.ty) {
                TypeKind::Pointer(_) => Ok(Value::Pointer(alloc.address())),
                _ => {
                    check_extent(Some(alloc.size), 0, self.arena.size(self.ty)?)?;
                    // SAFETY: owned, zero-initialized and large enough
                    unsafe { read(&self.arena, self.ty, alloc.address()) }
                }
            },
            Repr::View { address, extent } => {
                check_extent(*extent, 0, self.arena.size(self.ty)?)?;
                // SAFETY: within the extent reported by the owner of the memory
                unsafe { read(&self.arena, self.ty, *address) }
            }
            Repr::Inline(bytes) => decode_inline(&self.arena, self.ty, bytes),
        }
    }

    /// Store into the memory this handle refers to (`*p = v` for owned
    /// pointers)
    pub fn set_value(&self, value: &Value) -> BResult<()> {
        let region = match &self.repr {
            Repr::Owned(alloc) => Region {
                address: alloc.address(),
                ty: self.arena.pointee(self.ty).unwrap_or(self.ty),
                extent: Some(alloc.size),
            },
            Repr::View { address, extent } => Region {
                address: *address,
                ty: self.ty,
                extent: *extent,
            },
            Repr::Inline(_) => {
                return Err(BackendError::mismatch(format!(
                    "cast value of type '{}' is not stored in memory",
                    self.type_name()
                )))
            }
        };
        check_extent(region.extent, 0, self.arena.size(region.ty)?)?;
        // SAFETY: bounds checked above
        unsafe { write(&self.arena, region.ty, region.address, value) }
    }

    /// The value to pass for this handle as a call argument
    pub fn as_argument(&self) -> BResult<Value> {
        match (&self.repr, self.arena.kind(self.ty)) {
            (Repr::Owned(alloc), _) => Ok(Value::Pointer(alloc.address())),
            (Repr::View { address, .. }, TypeKind::Array { .. }) => Ok(Value::Pointer(*address)),
            (_, TypeKind::Aggregate { .. }) => Err(BackendError::unsupported(
                "passing structs or unions by value",
            )),
            _ => self.value(),
        }
    }

    pub fn item(&self, index: usize) -> BResult<Value> {
        let region = self.element(index)?;
        check_extent(region.extent, 0, self.arena.size(region.ty)?)?;
        // SAFETY: bounds checked above
        unsafe { read(&self.arena, region.ty, region.address) }
    }

    /// # Safety
    ///
    /// The pointer must be valid for reading item `index`.
    pub unsafe fn item_unchecked(&self, index: usize) -> BResult<Value> {
        let region = self.element(index)?;
        read(&self.arena, region.ty, region.address)
    }

    pub fn set_item(&self, index: usize, value: &Value) -> BResult<()> {
        let region = self.element(index)?;
        check_extent(region.extent, 0, self.arena.size(region.ty)?)?;
        // SAFETY: bounds checked above
        unsafe { write(&self.arena, region.ty, region.address, value) }
    }

    /// # Safety
    ///
    /// The pointer must be valid for writing item `index`.
    pub unsafe fn set_item_unchecked(&self, index: usize, value: &Value) -> BResult<()> {
        let region = self.element(index)?;
        write(&self.arena, region.ty, region.address, value)
    }

    /// Field of a struct/union handle or of the struct a pointer points to
    pub fn field(&self, name: &str) -> BResult<Value> {
        let (region, field) = self.member(name)?;
        check_extent(region.extent, field.offset, self.arena.size(field.ty)?)?;
        // SAFETY: bounds checked above
        unsafe { read_field(&self.arena, &field, region.address) }
    }

    /// # Safety
    ///
    /// The pointer must be valid for reading the field.
    pub unsafe fn field_unchecked(&self, name: &str) -> BResult<Value> {
        let (region, field) = self.member(name)?;
        read_field(&self.arena, &field, region.address)
    }

    pub fn set_field(&self, name: &str, value: &Value) -> BResult<()> {
        let (region, field) = self.member(name)?;
        check_extent(region.extent, field.offset, self.arena.size(field.ty)?)?;
        // SAFETY: bounds checked above
        unsafe { write_field(&self.arena, &field, region.address, value) }
    }

    /// # Safety
    ///
    /// The pointer must be valid for writing the field.
    pub unsafe fn set_field_unchecked(&self, name: &str, value: &Value) -> BResult<()> {
        let (region, field) = self.member(name)?;
        write_field(&self.arena, &field, region.address, value)
    }

    /// Memory a pointer or array handle designates, typed as its items
    fn items(&self) -> BResult<Region> {
        let kind = self.arena.kind(self.ty);
        match (&self.repr, kind) {
            (Repr::Owned(alloc), TypeKind::Pointer(inner) | TypeKind::Array { element: inner, .. }) => {
                Ok(Region {
                    address: alloc.address(),
                    ty: inner,
                    extent: Some(alloc.size),
                })
            }
            (Repr::View { address, extent }, TypeKind::Array { element, length }) => {
                let extent = match length {
                    Some(n) => Some(n * self.arena.size(element)?),
                    None => *extent,
                };
                Ok(Region {
                    address: *address,
                    ty: element,
                    extent,
                })
            }
            (Repr::View { .. } | Repr::Inline(_), TypeKind::Pointer(inner)) => {
                let pointer = self.value()?.as_address().unwrap_or(0);
                if pointer == 0 {
                    return Err(BackendError::bounds("NULL pointer dereference"));
                }
                Ok(Region {
                    address: pointer,
                    ty: inner,
                    extent: None,
                })
            }
            _ => Err(BackendError::mismatch(format!(
                "'{}' is not a pointer or array",
                self.type_name()
            ))),
        }
    }

    fn element(&self, index: usize) -> BResult<Region> {
        let items = self.items()?;
        let size = self.arena.size(items.ty)?;
        let offset = index
            .checked_mul(size)
            .ok_or_else(|| BackendError::bounds(format!("index {} overflows", index)))?;
        if let Some(extent) = items.extent {
            if offset + size > extent {
                return Err(BackendError::bounds(format!(
                    "index {} out of range for '{}'",
                    index,
                    self.type_name()
                )));
            }
        }
        Ok(Region {
            address: items.address + offset,
            ty: items.ty,
            extent: items.extent.map(|e| e - offset),
        })
    }

    fn member(&self, name: &str) -> BResult<(Region, FieldLayout)> {
        let region = match (&self.repr, self.arena.kind(self.ty)) {
            (Repr::View { address, extent }, TypeKind::Aggregate { .. }) => Region {
                address: *address,
                ty: self.ty,
                extent: *extent,
            },
            (_, TypeKind::Pointer(_)) => self.items()?,
            _ => {
                return Err(BackendError::mismatch(format!(
                    "'{}' is not a struct, union or pointer to one",
                    self.type_name()
                )))
            }
        };
        let layout = self
            .arena
            .layout(region.ty)
            .ok_or_else(|| BackendError::incomplete(&self.arena.name(region.ty)))?;
        let field = layout.field(name).cloned().ok_or_else(|| {
            BackendError::new(
                BackendErrorKind::InvalidField,
                format!("'{}' has no field '{}'", self.arena.name(region.ty), name),
            )
        })?;
        Ok((region, field))
    }
}

impl fmt::Debug for CData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.repr {
            Repr::Owned(_) => "owning",
            Repr::View { .. } => "view",
            Repr::Inline(_) => "value",
        };
        write!(f, "<cdata '{}' {}", self.type_name(), mode)?;
        if let Some(address) = self.address() {
            write!(f, " {:#x}", address)?;
        }
        f.write_str(">")
    }
}

/// Allocate zeroed storage for a pointer's target or for an array. Open
/// arrays take their length from `init`: a list, a byte string (plus NUL)
/// or an integer count.
pub(crate) fn newp(arena: &Rc<TypeArena>, ty: NativeType, init: Option<&Value>) -> BResult<CData> {
    let (ty, init, storage) = match arena.kind(ty) {
        TypeKind::Pointer(target) => (ty, init, target),
        TypeKind::Array { length: Some(_), .. } => (ty, init, ty),
        TypeKind::Array {
            element,
            length: None,
        } => {
            let (length, init) = match init {
                Some(Value::List(items)) => (items.len(), init),
                Some(Value::Bytes(bytes)) => (bytes.len() + 1, init),
                Some(count) => {
                    let n = count.as_u64().and_then(|n| usize::try_from(n).ok()).ok_or_else(|| {
                        BackendError::mismatch(format!(
                            "expected a length or initializer for '{}', got {}",
                            arena.name(ty),
                            count.kind_name()
                        ))
                    })?;
                    (n, None)
                }
                None => {
                    return Err(BackendError::mismatch(format!(
                        "'{}' needs a length or an initializer",
                        arena.name(ty)
                    )))
                }
            };
            let template = arena.template(ty).replacen("&[]", &format!("&[{}]", length), 1);
            let concrete = arena.push(
                template,
                TypeKind::Array {
                    element,
                    length: Some(length),
                },
            );
            (concrete, init, concrete)
        }
        _ => {
            return Err(BackendError::mismatch(format!(
                "expected a pointer or array type, got '{}'",
                arena.name(ty)
            )))
        }
    };

    let size = arena.size(storage)?;
    let alloc = Allocation::zeroed(size, arena.align(storage)?)?;
    if let Some(init) = init {
        // SAFETY: fresh allocation of `size` bytes for `storage`
        unsafe { write(arena, storage, alloc.address(), init)? };
    }
    Ok(CData {
        ty,
        arena: arena.clone(),
        repr: Repr::Owned(Rc::new(alloc)),
    })
}

/// Reinterpret `source` as a scalar of type `ty`. Integers are truncated
/// the way a C cast truncates them.
pub(crate) fn cast(arena: &Rc<TypeArena>, ty: NativeType, source: &Value) -> BResult<CData> {
    let invalid = || {
        BackendError::new(
            BackendErrorKind::Cast,
            format!("cannot cast {} to '{}'", source.kind_name(), arena.name(ty)),
        )
    };
    let mut bytes = [0u8; INLINE];
    match arena.kind(ty) {
        TypeKind::Primitive(kind) | TypeKind::Enum { repr: kind } => {
            let size = kind.size();
            if size > INLINE {
                return Err(BackendError::unsupported(format!("casts to '{}'", kind.name())));
            }
            let value = if kind.is_float() {
                Value::Float(source.as_f64().ok_or_else(invalid)?)
            } else {
                let bits = match source {
                    Value::Int(v) => *v as u64,
                    Value::UInt(v) => *v,
                    Value::Pointer(p) => *p as u64,
                    Value::Float(f) => *f as i64 as u64,
                    Value::Bytes(b) if b.len() == 1 => b[0] as u64,
                    _ => return Err(invalid()),
                };
                if kind == PrimitiveKind::Bool {
                    Value::UInt((bits != 0) as u64)
                } else {
                    Value::UInt(bits)
                }
            };
            encode_primitive(kind, &value, &mut bytes[..size])?;
        }
        TypeKind::Pointer(_) => {
            let address = source.as_address().ok_or_else(invalid)?;
            store_uint(address as u64, &mut bytes[..size_of_ptr()]);
        }
        _ => return Err(invalid()),
    }
    Ok(CData {
        ty,
        arena: arena.clone(),
        repr: Repr::Inline(bytes),
    })
}

/// Bytes of a char pointer or array up to `length` or the first NUL
pub(crate) fn string(data: &CData, length: usize) -> BResult<Vec<u8>> {
    let items = data.items()?;
    let is_char = data.arena.primitive(items.ty).is_some_and(|k| k.is_char());
    if !is_char {
        return Err(BackendError::mismatch(format!(
            "string() needs a char pointer or array, got '{}'",
            data.type_name()
        )));
    }
    let limit = match items.extent {
        Some(extent) => length.min(extent),
        None => length,
    };
    let mut out = Vec::new();
    for i in 0..limit {
        // SAFETY: within the extent when it is known; otherwise the caller
        // vouches for the pointer, as with C's strnlen
        let byte = unsafe { *((items.address + i) as *const u8) };
        if byte == 0 {
            break;
        }
        out.push(byte);
    }
    Ok(out)
}

fn check_extent(extent: Option<usize>, offset: usize, size: usize) -> BResult<()> {
    match extent {
        None => Err(BackendError::bounds(
            "memory behind a raw pointer has no known extent; use the unchecked accessors",
        )),
        Some(extent) if offset + size > extent => Err(BackendError::bounds(format!(
            "access of {} bytes at offset {} exceeds {} bytes",
            size, offset, extent
        ))),
        Some(_) => Ok(()),
    }
}

fn size_of_ptr() -> usize {
    std::mem::size_of::<usize>()
}

pub(crate) fn load_uint(bytes: &[u8]) -> u64 {
    match bytes.len() {
        1 => bytes[0] as u64,
        2 => u16::from_ne_bytes([bytes[0], bytes[1]]) as u64,
        4 => u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64,
        _ => {
            let mut buf = [0u8; 8];
            let n = bytes.len().min(8);
            buf[..n].copy_from_slice(&bytes[..n]);
            u64::from_ne_bytes(buf)
        }
    }
}

pub(crate) fn store_uint(bits: u64, out: &mut [u8]) {
    match out.len() {
        1 => out[0] = bits as u8,
        2 => out.copy_from_slice(&(bits as u16).to_ne_bytes()),
        4 => out.copy_from_slice(&(bits as u32).to_ne_bytes()),
        n => {
            let bytes = bits.to_ne_bytes();
            let n = n.min(8);
            out[..n].copy_from_slice(&bytes[..n]);
        }
    }
}

/// Sign- or zero-extend the low `bits` bits of `raw`
pub(crate) fn integer_value(raw: u64, bits: u32, signed: bool) -> Value {
    if signed {
        let shift = 64 - bits;
        Value::Int(((raw << shift) as i64) >> shift)
    } else if bits < 64 {
        Value::UInt(raw & ((1u64 << bits) - 1))
    } else {
        Value::UInt(raw)
    }
}

pub(crate) fn decode_primitive(kind: PrimitiveKind, bytes: &[u8]) -> BResult<Value> {
    match kind {
        PrimitiveKind::Float => Ok(Value::Float(
            f32::from_bits(load_uint(bytes) as u32) as f64,
        )),
        PrimitiveKind::Double => Ok(Value::Float(f64::from_bits(load_uint(bytes)))),
        PrimitiveKind::LongDouble => Err(BackendError::unsupported("'long double' values")),
        PrimitiveKind::Bool => Ok(Value::Int((load_uint(bytes) != 0) as i64)),
        _ => Ok(integer_value(
            load_uint(bytes),
            (bytes.len() * 8) as u32,
            kind.is_signed(),
        )),
    }
}

pub(crate) fn encode_primitive(kind: PrimitiveKind, value: &Value, out: &mut [u8]) -> BResult<()> {
    let mismatch = || {
        BackendError::mismatch(format!(
            "cannot store {} in '{}'",
            value.kind_name(),
            kind.name()
        ))
    };
    match kind {
        PrimitiveKind::Float => {
            let v = value.as_f64().ok_or_else(mismatch)?;
            store_uint((v as f32).to_bits() as u64, out);
        }
        PrimitiveKind::Double => {
            let v = value.as_f64().ok_or_else(mismatch)?;
            store_uint(v.to_bits(), out);
        }
        PrimitiveKind::LongDouble => return Err(BackendError::unsupported("'long double' values")),
        _ => {
            let bits = match value {
                Value::Int(v) => *v as u64,
                Value::UInt(v) => *v,
                Value::Pointer(p) => *p as u64,
                Value::Bytes(b) if kind.is_char() && b.len() == 1 => b[0] as u64,
                _ => return Err(mismatch()),
            };
            let bits = if kind == PrimitiveKind::Bool {
                (bits != 0) as u64
            } else {
                bits
            };
            store_uint(bits, out);
        }
    }
    Ok(())
}

fn decode_inline(arena: &TypeArena, ty: NativeType, bytes: &[u8; INLINE]) -> BResult<Value> {
    match arena.kind(ty) {
        TypeKind::Primitive(kind) | TypeKind::Enum { repr: kind } => {
            decode_primitive(kind, &bytes[..kind.size()])
        }
        TypeKind::Pointer(_) => Ok(Value::Pointer(load_uint(&bytes[..size_of_ptr()]) as usize)),
        _ => Err(BackendError::mismatch(format!(
            "'{}' has no scalar value",
            arena.name(ty)
        ))),
    }
}

/// # Safety
///
/// `address` must be valid for reading a value of `ty`.
pub(crate) unsafe fn read(arena: &TypeArena, ty: NativeType, address: usize) -> BResult<Value> {
    match arena.kind(ty) {
        TypeKind::Primitive(kind) | TypeKind::Enum { repr: kind } => {
            let bytes = std::slice::from_raw_parts(address as *const u8, kind.size());
            decode_primitive(kind, bytes)
        }
        TypeKind::Pointer(_) => Ok(Value::Pointer(
            (address as *const usize).read_unaligned(),
        )),
        TypeKind::Array {
            element,
            length: Some(n),
        } => {
            if arena.primitive(element).is_some_and(|k| k.is_char()) {
                let bytes = std::slice::from_raw_parts(address as *const u8, n);
                return Ok(Value::Bytes(bytes.to_vec()));
            }
            let size = arena.size(element)?;
            (0..n)
                .map(|i| read(arena, element, address + i * size))
                .collect::<BResult<Vec<_>>>()
                .map(Value::List)
        }
        TypeKind::Aggregate {
            layout: Some(layout),
            ..
        } => layout
            .fields
            .iter()
            .map(|field| read_field(arena, field, address))
            .collect::<BResult<Vec<_>>>()
            .map(Value::List),
        TypeKind::Array { length: None, .. } | TypeKind::Aggregate { layout: None, .. } => {
            Err(BackendError::incomplete(&arena.name(ty)))
        }
        TypeKind::Void | TypeKind::Function { .. } => Err(BackendError::mismatch(format!(
            "cannot read a value of type '{}'",
            arena.name(ty)
        ))),
    }
}

/// # Safety
///
/// `address` must be valid for writing a value of `ty`.
pub(crate) unsafe fn write(arena: &TypeArena, ty: NativeType, address: usize, value: &Value) -> BResult<()> {
    match arena.kind(ty) {
        TypeKind::Primitive(kind) | TypeKind::Enum { repr: kind } => {
            let out = std::slice::from_raw_parts_mut(address as *mut u8, kind.size());
            encode_primitive(kind, value, out)
        }
        TypeKind::Pointer(_) => {
            let pointer = match value {
                Value::Pointer(_) | Value::Int(_) | Value::UInt(_) => value.as_address(),
                _ => None,
            }
            .ok_or_else(|| {
                BackendError::mismatch(format!(
                    "cannot store {} in '{}'",
                    value.kind_name(),
                    arena.name(ty)
                ))
            })?;
            (address as *mut usize).write_unaligned(pointer);
            Ok(())
        }
        TypeKind::Array {
            element,
            length: Some(n),
        } => {
            let size = arena.size(element)?;
            match value {
                Value::Bytes(bytes) if arena.primitive(element).is_some_and(|k| k.is_char()) => {
                    if bytes.len() > n {
                        return Err(BackendError::bounds(format!(
                            "{} bytes do not fit in '{}'",
                            bytes.len(),
                            arena.name(ty)
                        )));
                    }
                    let out = std::slice::from_raw_parts_mut(address as *mut u8, n);
                    out[..bytes.len()].copy_from_slice(bytes);
                    if bytes.len() < n {
                        out[bytes.len()] = 0;
                    }
                    Ok(())
                }
                Value::List(items) => {
                    if items.len() > n {
                        return Err(BackendError::bounds(format!(
                            "{} items do not fit in '{}'",
                            items.len(),
                            arena.name(ty)
                        )));
                    }
                    for (i, item) in items.iter().enumerate() {
                        write(arena, element, address + i * size, item)?;
                    }
                    Ok(())
                }
                other => Err(BackendError::mismatch(format!(
                    "cannot initialize '{}' from {}",
                    arena.name(ty),
                    other.kind_name()
                ))),
            }
        }
        TypeKind::Aggregate {
            kind,
            layout: Some(layout),
        } => {
            let Value::List(items) = value else {
                return Err(BackendError::mismatch(format!(
                    "cannot initialize '{}' from {}",
                    arena.name(ty),
                    value.kind_name()
                )));
            };
            let capacity = match kind {
                crate::model::AggregateKind::Struct => layout.fields.len(),
                crate::model::AggregateKind::Union => 1,
            };
            if items.len() > capacity {
                return Err(BackendError::bounds(format!(
                    "too many initializers for '{}'",
                    arena.name(ty)
                )));
            }
            for (field, item) in layout.fields.iter().zip(items) {
                write_field(arena, field, address, item)?;
            }
            Ok(())
        }
        TypeKind::Array { length: None, .. } | TypeKind::Aggregate { layout: None, .. } => {
            Err(BackendError::incomplete(&arena.name(ty)))
        }
        TypeKind::Void | TypeKind::Function { .. } => Err(BackendError::mismatch(format!(
            "cannot write a value of type '{}'",
            arena.name(ty)
        ))),
    }
}

/// # Safety
///
/// `base` must be valid for reading the struct containing `field`.
unsafe fn read_field(arena: &TypeArena, field: &FieldLayout, base: usize) -> BResult<Value> {
    let address = base + field.offset;
    let Some((shift, width)) = field.bits else {
        return read(arena, field.ty, address);
    };
    let kind = bitfield_kind(arena, field)?;
    let unit = std::slice::from_raw_parts(address as *const u8, kind.size());
    let raw = load_uint(unit) >> shift;
    if kind == PrimitiveKind::Bool {
        return Ok(Value::Int((raw & 1) as i64));
    }
    Ok(integer_value(raw, width, kind.is_signed()))
}

/// # Safety
///
/// `base` must be valid for writing the struct containing `field`.
unsafe fn write_field(arena: &TypeArena, field: &FieldLayout, base: usize, value: &Value) -> BResult<()> {
    let address = base + field.offset;
    let Some((shift, width)) = field.bits else {
        return write(arena, field.ty, address, value);
    };
    let kind = bitfield_kind(arena, field)?;
    let fits = match value {
        Value::Int(v) if kind.is_signed() => {
            width == 64 || (*v >= -(1i64 << (width - 1)) && *v < (1i64 << (width - 1)))
        }
        Value::Int(v) => *v >= 0 && (width == 64 || (*v as u64) < (1u64 << width)),
        Value::UInt(v) if kind.is_signed() => width == 64 || *v < (1u64 << (width - 1)),
        Value::UInt(v) => width == 64 || *v < (1u64 << width),
        _ => false,
    };
    if !fits {
        return Err(BackendError::mismatch(format!(
            "{:?} does not fit in bit-field '{}' of width {}",
            value, field.name, width
        )));
    }
    let bits = match value {
        Value::Int(v) => *v as u64,
        Value::UInt(v) => *v,
        _ => 0,
    };
    let mask = if width == 64 { u64::MAX } else { (1u64 << width) - 1 };
    let unit = std::slice::from_raw_parts_mut(address as *mut u8, kind.size());
    let current = load_uint(unit);
    let updated = (current & !(mask << shift)) | ((bits & mask) << shift);
    store_uint(updated, unit);
    Ok(())
}

fn bitfield_kind(arena: &TypeArena, field: &FieldLayout) -> BResult<PrimitiveKind> {
    arena.primitive(field.ty).ok_or_else(|| {
        BackendError::mismatch(format!("bit-field '{}' is not an integer", field.name))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_types(arena: &TypeArena) -> (NativeType, NativeType) {
        let int = arena.push("int&".into(), TypeKind::Primitive(PrimitiveKind::Int));
        let ptr = arena.push("int *&".into(), TypeKind::Pointer(int));
        (int, ptr)
    }

    #[test]
    fn test_integer_codecs() {
        let mut buf = [0u8; 4];
        encode_primitive(PrimitiveKind::Int, &Value::Int(-2), &mut buf).unwrap();
        assert_eq!(decode_primitive(PrimitiveKind::Int, &buf).unwrap(), Value::Int(-2));
        assert_eq!(
            decode_primitive(PrimitiveKind::UInt, &buf).unwrap(),
            Value::UInt(u32::MAX as u64 - 1)
        );
        assert!(encode_primitive(PrimitiveKind::Int, &Value::Float(1.0), &mut buf).is_err());
        assert_eq!(integer_value(0b101, 3, true), Value::Int(-3));
        assert_eq!(integer_value(0b1101, 3, false), Value::UInt(5));
    }

    #[test]
    fn test_newp_pointer_and_array() {
        let arena = Rc::new(TypeArena::new());
        let (int, ptr) = int_types(&arena);
        let p = newp(&arena, ptr, Some(&Value::Int(42))).unwrap();
        assert!(p.is_owned());
        assert_eq!(p.item(0).unwrap(), Value::Int(42));
        assert!(p.item(1).is_err());
        p.set_item(0, &Value::Int(-7)).unwrap();
        assert_eq!(p.item(0).unwrap(), Value::Int(-7));

        let open = arena.push(
            "int&[]".into(),
            TypeKind::Array {
                element: int,
                length: None,
            },
        );
        let a = newp(&arena, open, Some(&Value::List(vec![Value::Int(1), Value::Int(2)]))).unwrap();
        assert_eq!(a.len(), Some(2));
        assert_eq!(a.type_name(), "int[2]");
        assert_eq!(a.value().unwrap(), Value::List(vec![Value::Int(1), Value::Int(2)]));
        assert!(matches!(a.as_argument().unwrap(), Value::Pointer(_)));

        let counted = newp(&arena, open, Some(&Value::Int(5))).unwrap();
        assert_eq!(counted.size().unwrap(), 20);
        assert_eq!(counted.item(4).unwrap(), Value::Int(0));
    }

    #[test]
    fn test_cast_truncates_and_never_allocates() {
        let arena = Rc::new(TypeArena::new());
        let uchar = arena.push("unsigned char&".into(), TypeKind::Primitive(PrimitiveKind::UChar));
        let c = cast(&arena, uchar, &Value::Int(0x1ff)).unwrap();
        assert_eq!(c.value().unwrap(), Value::UInt(0xff));
        assert!(!c.is_owned());
        assert!(c.set_value(&Value::Int(1)).is_err());

        let (_, ptr) = int_types(&arena);
        let p = cast(&arena, ptr, &Value::Int(0)).unwrap();
        assert_eq!(p.address(), Some(0));
        assert!(p.item(0).is_err());
    }

    #[test]
    fn test_string_stops_at_nul() {
        let arena = Rc::new(TypeArena::new());
        let ch = arena.push("char&".into(), TypeKind::Primitive(PrimitiveKind::Char));
        let open = arena.push(
            "char&[]".into(),
            TypeKind::Array {
                element: ch,
                length: None,
            },
        );
        let s = newp(&arena, open, Some(&Value::Bytes(b"hello".to_vec()))).unwrap();
        assert_eq!(s.len(), Some(6));
        assert_eq!(string(&s, 100).unwrap(), b"hello");
        assert_eq!(string(&s, 3).unwrap(), b"hel");
    }
}
