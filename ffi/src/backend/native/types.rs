//! Native type records and C struct layout

use std::cell::RefCell;
use std::ffi::{c_char, c_double, c_float, c_int, c_long, c_longlong, c_short};
use std::mem::{align_of, size_of};

use crate::backend::{BResult, FieldSpec};
use crate::error::{BackendError, BackendErrorKind};
use crate::model::AggregateKind;

/// Index of a type record in the arena; identity is the index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeType(u32);

impl NativeType {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    Char,
    SChar,
    UChar,
    Short,
    UShort,
    Int,
    UInt,
    Long,
    ULong,
    LongLong,
    ULongLong,
    Float,
    Double,
    LongDouble,
    Bool,
}

impl PrimitiveKind {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "char" => PrimitiveKind::Char,
            "signed char" => PrimitiveKind::SChar,
            "unsigned char" => PrimitiveKind::UChar,
            "short" => PrimitiveKind::Short,
            "unsigned short" => PrimitiveKind::UShort,
            "int" => PrimitiveKind::Int,
            "unsigned int" => PrimitiveKind::UInt,
            "long" => PrimitiveKind::Long,
            "unsigned long" => PrimitiveKind::ULong,
            "long long" => PrimitiveKind::LongLong,
            "unsigned long long" => PrimitiveKind::ULongLong,
            "float" => PrimitiveKind::Float,
            "double" => PrimitiveKind::Double,
            "long double" => PrimitiveKind::LongDouble,
            "_Bool" => PrimitiveKind::Bool,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            PrimitiveKind::Char => "char",
            PrimitiveKind::SChar => "signed char",
            PrimitiveKind::UChar => "unsigned char",
            PrimitiveKind::Short => "short",
            PrimitiveKind::UShort => "unsigned short",
            PrimitiveKind::Int => "int",
            PrimitiveKind::UInt => "unsigned int",
            PrimitiveKind::Long => "long",
            PrimitiveKind::ULong => "unsigned long",
            PrimitiveKind::LongLong => "long long",
            PrimitiveKind::ULongLong => "unsigned long long",
            PrimitiveKind::Float => "float",
            PrimitiveKind::Double => "double",
            PrimitiveKind::LongDouble => "long double",
            PrimitiveKind::Bool => "_Bool",
        }
    }

    pub fn size(self) -> usize {
        match self {
            PrimitiveKind::Char | PrimitiveKind::SChar | PrimitiveKind::UChar => size_of::<c_char>(),
            PrimitiveKind::Short | PrimitiveKind::UShort => size_of::<c_short>(),
            PrimitiveKind::Int | PrimitiveKind::UInt => size_of::<c_int>(),
            PrimitiveKind::Long | PrimitiveKind::ULong => size_of::<c_long>(),
            PrimitiveKind::LongLong | PrimitiveKind::ULongLong => size_of::<c_longlong>(),
            PrimitiveKind::Float => size_of::<c_float>(),
            PrimitiveKind::Double => size_of::<c_double>(),
            PrimitiveKind::LongDouble => LONG_DOUBLE_SIZE,
            PrimitiveKind::Bool => size_of::<bool>(),
        }
    }

    pub fn align(self) -> usize {
        match self {
            PrimitiveKind::Char | PrimitiveKind::SChar | PrimitiveKind::UChar => align_of::<c_char>(),
            PrimitiveKind::Short | PrimitiveKind::UShort => align_of::<c_short>(),
            PrimitiveKind::Int | PrimitiveKind::UInt => align_of::<c_int>(),
            PrimitiveKind::Long | PrimitiveKind::ULong => align_of::<c_long>(),
            PrimitiveKind::LongLong | PrimitiveKind::ULongLong => align_of::<c_longlong>(),
            PrimitiveKind::Float => align_of::<c_float>(),
            PrimitiveKind::Double => align_of::<c_double>(),
            PrimitiveKind::LongDouble => LONG_DOUBLE_SIZE,
            PrimitiveKind::Bool => align_of::<bool>(),
        }
    }

    pub fn is_float(self) -> bool {
        matches!(
            self,
            PrimitiveKind::Float | PrimitiveKind::Double | PrimitiveKind::LongDouble
        )
    }

    pub fn is_signed(self) -> bool {
        match self {
            #[allow(clippy::absurd_extreme_comparisons, unused_comparisons)]
            PrimitiveKind::Char => c_char::MIN != 0,
            PrimitiveKind::SChar
            | PrimitiveKind::Short
            | PrimitiveKind::Int
            | PrimitiveKind::Long
            | PrimitiveKind::LongLong => true,
            _ => self.is_float(),
        }
    }

    /// `char`, `signed char` or `unsigned char`
    pub fn is_char(self) -> bool {
        matches!(
            self,
            PrimitiveKind::Char | PrimitiveKind::SChar | PrimitiveKind::UChar
        )
    }
}

#[cfg(all(
    any(target_arch = "x86_64", target_arch = "aarch64"),
    not(target_os = "windows"),
    not(target_vendor = "apple")
))]
const LONG_DOUBLE_SIZE: usize = 16;

#[cfg(not(all(
    any(target_arch = "x86_64", target_arch = "aarch64"),
    not(target_os = "windows"),
    not(target_vendor = "apple")
)))]
const LONG_DOUBLE_SIZE: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLayout {
    pub name: String,
    pub ty: NativeType,
    /// Byte offset; for bit-fields, the offset of the storage unit
    pub offset: usize,
    /// `(shift, width)` inside the storage unit for bit-fields
    pub bits: Option<(u32, u32)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructLayout {
    pub size: usize,
    pub align: usize,
    pub fields: Vec<FieldLayout>,
}

impl StructLayout {
    pub fn field(&self, name: &str) -> Option<&FieldLayout> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
    Void,
    Primitive(PrimitiveKind),
    Pointer(NativeType),
    Array {
        element: NativeType,
        length: Option<usize>,
    },
    Function {
        args: Vec<NativeType>,
        result: NativeType,
        variadic: bool,
    },
    Aggregate {
        kind: AggregateKind,
        /// `None` until completed
        layout: Option<StructLayout>,
    },
    Enum {
        repr: PrimitiveKind,
    },
}

#[derive(Debug, Clone)]
pub struct TypeRecord {
    /// C spelling with `&` where a declarator would go, e.g. `int (*&)[3]`
    pub template: String,
    pub kind: TypeKind,
}

impl TypeRecord {
    pub fn name(&self) -> String {
        self.template.replace('&', "").trim_end().to_string()
    }
}

/// All native types created by one backend
#[derive(Debug, Default)]
pub struct TypeArena {
    records: RefCell<Vec<TypeRecord>>,
}

impl TypeArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.borrow().is_empty()
    }

    pub(crate) fn push(&self, template: String, kind: TypeKind) -> NativeType {
        let mut records = self.records.borrow_mut();
        let id = NativeType(records.len() as u32);
        records.push(TypeRecord { template, kind });
        id
    }

    pub fn kind(&self, ty: NativeType) -> TypeKind {
        self.records.borrow()[ty.index()].kind.clone()
    }

    pub fn template(&self, ty: NativeType) -> String {
        self.records.borrow()[ty.index()].template.clone()
    }

    pub fn name(&self, ty: NativeType) -> String {
        self.records.borrow()[ty.index()].name()
    }

    pub fn primitive(&self, ty: NativeType) -> Option<PrimitiveKind> {
        match self.kind(ty) {
            TypeKind::Primitive(kind) | TypeKind::Enum { repr: kind } => Some(kind),
            _ => None,
        }
    }

    pub fn pointee(&self, ty: NativeType) -> Option<NativeType> {
        match self.kind(ty) {
            TypeKind::Pointer(inner) => Some(inner),
            _ => None,
        }
    }

    pub fn layout(&self, ty: NativeType) -> Option<StructLayout> {
        match &self.records.borrow()[ty.index()].kind {
            TypeKind::Aggregate { layout, .. } => layout.clone(),
            _ => None,
        }
    }

    pub fn size(&self, ty: NativeType) -> BResult<usize> {
        match self.kind(ty) {
            TypeKind::Primitive(kind) | TypeKind::Enum { repr: kind } => Ok(kind.size()),
            TypeKind::Pointer(_) => Ok(size_of::<usize>()),
            TypeKind::Array {
                element,
                length: Some(n),
            } => self
                .size(element)?
                .checked_mul(n)
                .ok_or_else(|| BackendError::new(BackendErrorKind::Allocation, "array too large")),
            TypeKind::Aggregate {
                layout: Some(layout),
                ..
            } => Ok(layout.size),
            TypeKind::Array { length: None, .. } | TypeKind::Aggregate { layout: None, .. } => {
                Err(BackendError::incomplete(&self.name(ty)))
            }
            TypeKind::Void | TypeKind::Function { .. } => Err(BackendError::mismatch(format!(
                "'{}' has no size",
                self.name(ty)
            ))),
        }
    }

    pub fn align(&self, ty: NativeType) -> BResult<usize> {
        match self.kind(ty) {
            TypeKind::Primitive(kind) | TypeKind::Enum { repr: kind } => Ok(kind.align()),
            TypeKind::Pointer(_) => Ok(align_of::<usize>()),
            TypeKind::Array { element, .. } => self.align(element),
            TypeKind::Aggregate {
                layout: Some(layout),
                ..
            } => Ok(layout.align),
            TypeKind::Aggregate { layout: None, .. } => Err(BackendError::incomplete(&self.name(ty))),
            TypeKind::Void | TypeKind::Function { .. } => Err(BackendError::mismatch(format!(
                "'{}' has no alignment",
                self.name(ty)
            ))),
        }
    }

    /// Lay out and store the fields of an incomplete aggregate
    pub(crate) fn complete(&self, ty: NativeType, fields: &[FieldSpec<'_, NativeType>]) -> BResult<()> {
        let kind = match self.kind(ty) {
            TypeKind::Aggregate { layout: Some(_), .. } => {
                return Err(BackendError::new(
                    BackendErrorKind::TypeMismatch,
                    format!("'{}' is already completed", self.name(ty)),
                ))
            }
            TypeKind::Aggregate { kind, layout: None } => kind,
            _ => {
                return Err(BackendError::mismatch(format!(
                    "'{}' is not a struct or union",
                    self.name(ty)
                )))
            }
        };
        let layout = match kind {
            AggregateKind::Struct => self.struct_layout(ty, fields)?,
            AggregateKind::Union => self.union_layout(ty, fields)?,
        };
        if let TypeKind::Aggregate { layout: slot, .. } = &mut self.records.borrow_mut()[ty.index()].kind {
            *slot = Some(layout);
        }
        Ok(())
    }

    fn field_metrics(&self, owner: NativeType, field: &FieldSpec<'_, NativeType>) -> BResult<(usize, usize)> {
        let invalid = |what: &str| {
            BackendError::new(
                BackendErrorKind::InvalidField,
                format!("field '{}' of '{}' {}", field.name, self.name(owner), what),
            )
        };
        if *field.ty == owner {
            return Err(invalid("has the type of its own container"));
        }
        let size = self
            .size(*field.ty)
            .map_err(|_| invalid(&format!("has incomplete type '{}'", self.name(*field.ty))))?;
        let align = self.align(*field.ty)?;
        if let Some(width) = field.bitsize {
            if !matches!(self.primitive(*field.ty), Some(k) if !k.is_float()) {
                return Err(invalid("is a bit-field of non-integer type"));
            }
            if width as usize > size.saturating_mul(8) {
                return Err(invalid("has a width exceeding its type"));
            }
        }
        Ok((size, align))
    }

    fn struct_layout(&self, owner: NativeType, fields: &[FieldSpec<'_, NativeType>]) -> BResult<StructLayout> {
        let too_large = || {
            BackendError::new(
                BackendErrorKind::Allocation,
                format!("'{}' is too large", self.name(owner)),
            )
        };
        let mut out = Vec::with_capacity(fields.len());
        let mut bit_pos: usize = 0;
        let mut align = 1;

        for (i, field) in fields.iter().enumerate() {
            if let TypeKind::Array { element, length: None } = self.kind(*field.ty) {
                if i + 1 != fields.len() || field.bitsize.is_some() {
                    return Err(BackendError::new(
                        BackendErrorKind::InvalidField,
                        format!("flexible array member '{}' is not last", field.name),
                    ));
                }
                let elem_align = self.align(element)?;
                let offset = align_up(bit_pos.div_ceil(8), elem_align).ok_or_else(too_large)?;
                align = align.max(elem_align);
                bit_pos = offset.checked_mul(8).ok_or_else(too_large)?;
                out.push(FieldLayout {
                    name: field.name.to_string(),
                    ty: *field.ty,
                    offset,
                    bits: None,
                });
                continue;
            }

            let (size, field_align) = self.field_metrics(owner, field)?;
            match field.bitsize {
                None => {
                    let offset = align_up(bit_pos.div_ceil(8), field_align).ok_or_else(too_large)?;
                    align = align.max(field_align);
                    bit_pos = offset
                        .checked_add(size)
                        .and_then(|end| end.checked_mul(8))
                        .ok_or_else(too_large)?;
                    out.push(FieldLayout {
                        name: field.name.to_string(),
                        ty: *field.ty,
                        offset,
                        bits: None,
                    });
                }
                Some(0) => bit_pos = align_up(bit_pos, field_align * 8).ok_or_else(too_large)?,
                Some(width) => {
                    let width = width as usize;
                    let unit_bits = field_align * 8;
                    if bit_pos % unit_bits + width > unit_bits {
                        bit_pos = align_up(bit_pos, unit_bits).ok_or_else(too_large)?;
                    }
                    let unit = bit_pos / unit_bits * field_align;
                    let shift = bit_pos - unit * 8;
                    if !field.name.is_empty() {
                        align = align.max(field_align);
                        out.push(FieldLayout {
                            name: field.name.to_string(),
                            ty: *field.ty,
                            offset: unit,
                            bits: Some((shift as u32, width as u32)),
                        });
                    }
                    bit_pos = bit_pos.checked_add(width).ok_or_else(too_large)?;
                }
            }
        }

        Ok(StructLayout {
            size: align_up(bit_pos.div_ceil(8), align).ok_or_else(too_large)?,
            align,
            fields: out,
        })
    }

    fn union_layout(&self, owner: NativeType, fields: &[FieldSpec<'_, NativeType>]) -> BResult<StructLayout> {
        let mut out = Vec::with_capacity(fields.len());
        let mut size = 0;
        let mut align = 1;
        for field in fields {
            let (field_size, field_align) = self.field_metrics(owner, field)?;
            if field.name.is_empty() {
                continue;
            }
            size = size.max(field_size);
            align = align.max(field_align);
            out.push(FieldLayout {
                name: field.name.to_string(),
                ty: *field.ty,
                offset: 0,
                bits: field.bitsize.map(|w| (0, w)),
            });
        }
        let size = align_up(size, align).ok_or_else(|| {
            BackendError::new(
                BackendErrorKind::Allocation,
                format!("'{}' is too large", self.name(owner)),
            )
        })?;
        Ok(StructLayout {
            size,
            align,
            fields: out,
        })
    }

    /// Offset of a possibly nested field path such as `"inner.x"`
    pub fn offset_of(&self, ty: NativeType, path: &str) -> BResult<usize> {
        let mut current = ty;
        let mut total = 0;
        for part in path.split('.') {
            let layout = match self.kind(current) {
                TypeKind::Aggregate {
                    layout: Some(layout),
                    ..
                } => layout,
                TypeKind::Aggregate { layout: None, .. } => {
                    return Err(BackendError::incomplete(&self.name(current)))
                }
                _ => {
                    return Err(BackendError::mismatch(format!(
                        "'{}' is not a struct or union",
                        self.name(current)
                    )))
                }
            };
            let field = layout.field(part).ok_or_else(|| {
                BackendError::new(
                    BackendErrorKind::InvalidField,
                    format!("'{}' has no field '{}'", self.name(current), part),
                )
            })?;
            if field.bits.is_some() {
                return Err(BackendError::new(
                    BackendErrorKind::InvalidField,
                    format!("bit-field '{}' has no byte offset", part),
                ));
            }
            total += field.offset;
            current = field.ty;
        }
        Ok(total)
    }
}

/// `value` rounded up to a multiple of `align`, or `None` on overflow
pub(crate) fn align_up(value: usize, align: usize) -> Option<usize> {
    if align <= 1 {
        Some(value)
    } else {
        value.checked_next_multiple_of(align)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena_with_int() -> (TypeArena, NativeType) {
        let arena = TypeArena::new();
        let int = arena.push("int &".into(), TypeKind::Primitive(PrimitiveKind::Int));
        (arena, int)
    }

    fn field<'a>(name: &'a str, ty: &'a NativeType, bitsize: Option<u32>) -> FieldSpec<'a, NativeType> {
        FieldSpec { name, ty, bitsize }
    }

    #[test]
    fn test_sequential_layout_with_padding() {
        let (arena, int) = arena_with_int();
        let ch = arena.push("char &".into(), TypeKind::Primitive(PrimitiveKind::Char));
        let s = arena.push(
            "struct S &".into(),
            TypeKind::Aggregate {
                kind: AggregateKind::Struct,
                layout: None,
            },
        );
        arena
            .complete(s, &[field("c", &ch, None), field("i", &int, None), field("d", &ch, None)])
            .unwrap();
        let layout = arena.layout(s).unwrap();
        assert_eq!(layout.size, 12);
        assert_eq!(layout.align, 4);
        assert_eq!(arena.offset_of(s, "i").unwrap(), 4);
        assert_eq!(arena.offset_of(s, "d").unwrap(), 8);
        assert_eq!(arena.name(s), "struct S");

        // completing twice is refused
        assert!(arena.complete(s, &[]).is_err());
    }

    #[test]
    fn test_bitfields_share_units() {
        let (arena, int) = arena_with_int();
        let s = arena.push(
            "struct B &".into(),
            TypeKind::Aggregate {
                kind: AggregateKind::Struct,
                layout: None,
            },
        );
        arena
            .complete(
                s,
                &[
                    field("a", &int, Some(3)),
                    field("b", &int, Some(30)),
                    field("", &int, Some(0)),
                    field("c", &int, Some(4)),
                ],
            )
            .unwrap();
        let layout = arena.layout(s).unwrap();
        // b straddles the first unit and moves to the second
        assert_eq!(layout.field("a").unwrap().bits, Some((0, 3)));
        assert_eq!(layout.field("b").unwrap().offset, 4);
        assert_eq!(layout.field("b").unwrap().bits, Some((0, 30)));
        assert_eq!(layout.field("c").unwrap().offset, 8);
        assert_eq!(layout.size, 12);
        assert!(arena.offset_of(s, "a").is_err());
    }

    #[test]
    fn test_union_and_flexible_array() {
        let (arena, int) = arena_with_int();
        let dbl = arena.push("double &".into(), TypeKind::Primitive(PrimitiveKind::Double));
        let u = arena.push(
            "union U &".into(),
            TypeKind::Aggregate {
                kind: AggregateKind::Union,
                layout: None,
            },
        );
        arena
            .complete(u, &[field("i", &int, None), field("d", &dbl, None)])
            .unwrap();
        assert_eq!(arena.size(u).unwrap(), size_of::<f64>());
        assert_eq!(arena.offset_of(u, "d").unwrap(), 0);

        let open = arena.push(
            "int &[]".into(),
            TypeKind::Array {
                element: int,
                length: None,
            },
        );
        let s = arena.push(
            "struct F &".into(),
            TypeKind::Aggregate {
                kind: AggregateKind::Struct,
                layout: None,
            },
        );
        arena
            .complete(s, &[field("n", &int, None), field("data", &open, None)])
            .unwrap();
        assert_eq!(arena.size(s).unwrap(), 4);
        assert_eq!(arena.offset_of(s, "data").unwrap(), 4);
    }

    #[test]
    fn test_incomplete_field_rejected() {
        let (arena, int) = arena_with_int();
        let opaque = arena.push(
            "struct O &".into(),
            TypeKind::Aggregate {
                kind: AggregateKind::Struct,
                layout: None,
            },
        );
        let s = arena.push(
            "struct H &".into(),
            TypeKind::Aggregate {
                kind: AggregateKind::Struct,
                layout: None,
            },
        );
        let err = arena
            .complete(s, &[field("x", &int, None), field("o", &opaque, None)])
            .unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::InvalidField);
        // the failed completion leaves the handle incomplete
        assert!(arena.layout(s).is_none());
    }

    #[test]
    fn test_oversized_struct_rejected() {
        let (arena, int) = arena_with_int();
        let char_ty = arena.push("char &".into(), TypeKind::Primitive(PrimitiveKind::Char));
        let huge = arena.push(
            "char &[N]".into(),
            TypeKind::Array {
                element: char_ty,
                length: Some(usize::MAX / 4),
            },
        );
        let s = arena.push(
            "struct Big &".into(),
            TypeKind::Aggregate {
                kind: AggregateKind::Struct,
                layout: None,
            },
        );
        let err = arena
            .complete(s, &[field("a", &huge, None), field("b", &int, None)])
            .unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::Allocation);
        assert!(arena.layout(s).is_none());

        assert_eq!(align_up(5, 4), Some(8));
        assert_eq!(align_up(usize::MAX, 8), None);
    }
}
