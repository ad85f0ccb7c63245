//! Lowering of parsed C declarations into the declaration table
//!
//! [`Parser::parse`] is atomic: each chunk is lowered into a staged copy of
//! the table that replaces the live one only when every declaration in the
//! chunk succeeded.

use log::{debug, trace};
use parser::c_ast::{
    AggregateSpecifier, BinaryOp, ConstExpr, DeclSpecifiers, Declaration, Declarator,
    EnumSpecifier, FieldDecl, ParamDecl, StorageClass, TypeSpecifier, UnaryOp,
};

use crate::declarations::{AggregateFields, DeclarationTable};
use crate::error::DeclarationError;
use crate::model::{AggregateKind, CType, EnumType};

type LResult<T> = std::result::Result<T, DeclarationError>;

#[derive(Debug, Default)]
pub struct Parser {
    declarations: DeclarationTable,
}

impl Parser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declarations(&self) -> &DeclarationTable {
        &self.declarations
    }

    /// Parse and lower a chunk of declarations
    pub fn parse(&mut self, source: &str) -> LResult<()> {
        let unit = parser::parse_declarations(source).map_err(DeclarationError::syntax)?;
        let mut staged = self.declarations.clone();
        {
            let mut lowering = Lowering {
                table: Table::Staged(&mut staged),
            };
            for decl in &unit.declarations {
                lowering.declaration(decl)?;
            }
        }
        debug!(
            "lowered {} declarations ({} table entries)",
            unit.declarations.len(),
            staged.len()
        );
        self.declarations = staged;
        Ok(())
    }

    /// Parse a type name such as `struct P *`. With `force_pointer`, non-array
    /// types are wrapped in a pointer (the allocation form used by `alloc`).
    pub fn parse_type(&self, text: &str, force_pointer: bool) -> LResult<CType> {
        let name = parser::parse_type_name(text).map_err(DeclarationError::syntax)?;
        let mut lowering = Lowering {
            table: Table::Lookup(&self.declarations),
        };
        let base = lowering.specifiers(&name.specifiers)?;
        let ty = lowering.apply(base, &name.declarator)?;
        trace!("parsed type {:?} as {}", text, ty);
        Ok(match ty {
            CType::Array(_) => ty,
            other if force_pointer => CType::pointer(other),
            other => other,
        })
    }
}

/// Declarations write to a staged table; type names only read the live one
enum Table<'t> {
    Staged(&'t mut DeclarationTable),
    Lookup(&'t DeclarationTable),
}

impl Table<'_> {
    fn get(&self) -> &DeclarationTable {
        match self {
            Table::Staged(table) => table,
            Table::Lookup(table) => table,
        }
    }
}

struct Lowering<'t> {
    table: Table<'t>,
}

impl Lowering<'_> {
    /// The table to define into, or an error when lowering a type name
    fn staged(&mut self, what: &str, offset: usize) -> LResult<&mut DeclarationTable> {
        match &mut self.table {
            Table::Staged(table) => Ok(table),
            Table::Lookup(_) => Err(DeclarationError::unsupported(format!(
                "{} definitions in type names",
                what
            ))
            .at(offset)),
        }
    }

    fn declaration(&mut self, decl: &Declaration) -> LResult<()> {
        let base = self.specifiers(&decl.specifiers)?;
        let is_typedef = decl.specifiers.storage == Some(StorageClass::Typedef);

        for item in &decl.declarators {
            if let Some(init) = item.initializer {
                return Err(DeclarationError::unsupported("initializers").at(init.start));
            }
            let declarator = &item.declarator;
            let offset = declarator.name_span().start;
            let Some(name) = declarator.name() else {
                return Err(DeclarationError::invalid("expected a declarator name").at(offset));
            };
            let ty = self.apply(base.clone(), declarator)?;

            if is_typedef {
                self.typedef(name, ty).map_err(|e| e.at(offset))?;
            } else if ty.as_function().is_some() {
                let ty = ty.with_linkage_name(name);
                self.declare(format!("function {}", name), name, ty)
                    .map_err(|e| e.at(offset))?;
            } else {
                if ty.is_void() {
                    return Err(DeclarationError::invalid(format!(
                        "variable '{}' declared void",
                        name
                    ))
                    .at(offset));
                }
                self.declare(format!("variable {}", name), name, ty)
                    .map_err(|e| e.at(offset))?;
            }
        }
        Ok(())
    }

    fn typedef(&mut self, name: &str, ty: CType) -> LResult<()> {
        let key = format!("typedef {}", name);
        let table = self.staged("typedef", 0)?;
        match table.get(&key) {
            Some(existing) if *existing != ty => Err(DeclarationError::conflicting(name)),
            Some(_) => Ok(()),
            None => {
                trace!("typedef {} = {}", name, ty);
                table.insert(key, ty);
                Ok(())
            }
        }
    }

    /// Functions and variables may be redeclared with an identical type
    fn declare(&mut self, key: String, name: &str, ty: CType) -> LResult<()> {
        let table = self.staged("declaration", 0)?;
        match table.get(&key) {
            Some(existing) if *existing != ty => Err(DeclarationError::conflicting(name)),
            _ => {
                table.insert(key, ty);
                Ok(())
            }
        }
    }

    fn specifiers(&mut self, specifiers: &DeclSpecifiers) -> LResult<CType> {
        match &specifiers.ty {
            TypeSpecifier::Void => Ok(CType::Void),
            TypeSpecifier::Primitive(name) => Ok(CType::primitive(name)),
            TypeSpecifier::Named(name) => self
                .table
                .get()
                .typedef(name)
                .cloned()
                .ok_or_else(|| DeclarationError::unknown_type(name).at(specifiers.span.start)),
            TypeSpecifier::StructOrUnion(agg) => self.aggregate(agg),
            TypeSpecifier::Enum(e) => self.enumeration(e),
        }
    }

    fn aggregate(&mut self, agg: &AggregateSpecifier) -> LResult<CType> {
        let tag = match &agg.tag {
            Some(tag) => tag.clone(),
            None => self
                .staged(agg.kind.keyword(), agg.span.start)?
                .next_anonymous_tag(),
        };
        let other_kind = match agg.kind {
            AggregateKind::Struct => AggregateKind::Union,
            AggregateKind::Union => AggregateKind::Struct,
        };
        if self.table.get().aggregate(other_kind, &tag).is_some() {
            return Err(DeclarationError::invalid(format!(
                "'{}' defined as wrong kind of tag",
                tag
            ))
            .at(agg.span.start));
        }

        let node = CType::aggregate(agg.kind, &tag);
        let Some(fields) = &agg.fields else {
            // first mention declares the tag; type names only refer to it
            if let Table::Staged(table) = &mut self.table {
                table.declare_aggregate(agg.kind, &tag);
            }
            return Ok(node);
        };
        self.staged(agg.kind.keyword(), agg.span.start)?;

        let display = format!("{} {}", agg.kind.keyword(), tag);
        if self
            .table
            .get()
            .aggregate(agg.kind, &tag)
            .is_some_and(|def| def.fields.is_some())
        {
            return Err(DeclarationError::redefinition(display).at(agg.span.start));
        }
        // visible to its own fields, e.g. `struct Node *next`
        self.staged(agg.kind.keyword(), agg.span.start)?
            .declare_aggregate(agg.kind, &tag);

        let mut lowered = AggregateFields {
            names: Vec::new(),
            types: Vec::new(),
            bitsizes: Vec::new(),
        };
        for field in fields {
            self.field(field, &mut lowered)?;
        }
        trace!("defined {} with {} fields", display, lowered.len());
        self.staged(agg.kind.keyword(), agg.span.start)?
            .define_aggregate(agg.kind, &tag, lowered);
        Ok(node)
    }

    fn field(&mut self, field: &FieldDecl, out: &mut AggregateFields) -> LResult<()> {
        let base = self.specifiers(&field.specifiers)?;

        if field.members.is_empty() {
            return match &field.specifiers.ty {
                TypeSpecifier::StructOrUnion(AggregateSpecifier { tag: None, .. }) => Err(
                    DeclarationError::unsupported("anonymous struct or union members")
                        .at(field.span.start),
                ),
                _ => Ok(()),
            };
        }

        for member in &field.members {
            let (name, ty) = match &member.declarator {
                Some(d) => (d.name().unwrap_or_default().to_string(), self.apply(base.clone(), d)?),
                None => (String::new(), base.clone()),
            };
            if !name.is_empty() && out.names.contains(&name) {
                return Err(DeclarationError::invalid(format!("duplicate member '{}'", name))
                    .at(member.span.start));
            }
            if ty.as_function().is_some() {
                return Err(DeclarationError::invalid(format!(
                    "field '{}' declared as a function",
                    name
                ))
                .at(member.span.start));
            }
            let bitsize = match &member.bit_width {
                Some(width) => {
                    if !ty.is_integer() {
                        return Err(DeclarationError::invalid(format!(
                            "bit-field '{}' has non-integer type '{}'",
                            name, ty
                        ))
                        .at(member.span.start));
                    }
                    let value = self.eval(width)?;
                    let bits = u32::try_from(value).map_err(|_| {
                        DeclarationError::constant(format!("bit-field '{}' has negative width", name))
                            .at(width.span().start)
                    })?;
                    if bits == 0 && !name.is_empty() {
                        return Err(DeclarationError::invalid(format!(
                            "named bit-field '{}' has zero width",
                            name
                        ))
                        .at(width.span().start));
                    }
                    Some(bits)
                }
                None => None,
            };
            out.names.push(name);
            out.types.push(ty);
            out.bitsizes.push(bitsize);
        }
        Ok(())
    }

    fn enumeration(&mut self, e: &EnumSpecifier) -> LResult<CType> {
        let tag = match &e.tag {
            Some(tag) => tag.clone(),
            None => self.staged("enum", e.span.start)?.next_anonymous_tag(),
        };
        let key = format!("enum {}", tag);

        let Some(items) = &e.enumerators else {
            return self
                .table
                .get()
                .get(&key)
                .cloned()
                .ok_or_else(|| DeclarationError::unknown_type(&key).at(e.span.start));
        };
        self.staged("enum", e.span.start)?;
        if self.table.get().contains_key(&key) {
            return Err(DeclarationError::redefinition(key).at(e.span.start));
        }

        let mut names = Vec::with_capacity(items.len());
        let mut values = Vec::with_capacity(items.len());
        let mut next: i64 = 0;
        for item in items {
            if self.table.get().constant(&item.name).is_some() {
                return Err(DeclarationError::redefinition(format!(
                    "enumerator '{}'",
                    item.name
                ))
                .at(item.span.start));
            }
            let value = match &item.value {
                Some(expr) => self.eval(expr)?,
                None => next,
            };
            next = value.checked_add(1).ok_or_else(|| {
                DeclarationError::constant("enumerator value overflows").at(item.span.start)
            })?;
            self.staged("enum", e.span.start)?
                .insert_constant(item.name.clone(), value);
            names.push(item.name.clone());
            values.push(value);
        }

        let ty = CType::Enum(EnumType {
            name: tag.as_str().into(),
            enumerators: names.into(),
            values: values.into(),
        });
        self.staged("enum", e.span.start)?.insert(key, ty.clone());
        Ok(ty)
    }

    /// Wrap `ty` with the declarator's constructors, outermost first
    fn apply(&mut self, ty: CType, declarator: &Declarator) -> LResult<CType> {
        match declarator {
            Declarator::Name { .. } => Ok(ty),
            Declarator::Pointer { inner, .. } => self.apply(CType::pointer(ty), inner),
            Declarator::Array { inner, length } => {
                let offset = inner.name_span().start;
                if ty.as_function().is_some() {
                    return Err(DeclarationError::invalid("array of functions").at(offset));
                }
                if ty.is_void() {
                    return Err(DeclarationError::invalid("array of void").at(offset));
                }
                let length = match length {
                    Some(expr) => {
                        let n = self.eval(expr)?;
                        let n = usize::try_from(n).map_err(|_| {
                            DeclarationError::constant("size of array is negative")
                                .at(expr.span().start)
                        })?;
                        Some(n)
                    }
                    None => None,
                };
                self.apply(CType::array(ty, length), inner)
            }
            Declarator::Function { inner, params } => {
                let offset = inner.name_span().start;
                if matches!(ty, CType::Function(_) | CType::Array(_)) {
                    return Err(DeclarationError::invalid(format!(
                        "function cannot return '{}'",
                        ty
                    ))
                    .at(offset));
                }
                let args = params
                    .params
                    .iter()
                    .map(|p| self.parameter(p))
                    .collect::<LResult<Vec<_>>>()?;
                self.apply(CType::function(args, ty, params.variadic), inner)
            }
        }
    }

    /// Arrays and functions decay to pointers in parameter position
    fn parameter(&mut self, param: &ParamDecl) -> LResult<CType> {
        let base = self.specifiers(&param.specifiers)?;
        let ty = self.apply(base, &param.declarator)?;
        match ty {
            CType::Array(array) => Ok(array.item().clone()),
            CType::Function(_) => Ok(CType::pointer(ty)),
            CType::Void => Err(DeclarationError::invalid("parameter has void type").at(param.span.start)),
            other => Ok(other),
        }
    }

    fn eval(&self, expr: &ConstExpr) -> LResult<i64> {
        let overflow = |span: parser::Span| {
            DeclarationError::constant("integer overflow in constant expression").at(span.start)
        };
        match expr {
            ConstExpr::Int { value, .. } => Ok(*value),
            ConstExpr::Ident { name, span } => self.table.get().constant(name).ok_or_else(|| {
                DeclarationError::constant(format!("'{}' is not an integer constant", name))
                    .at(span.start)
            }),
            ConstExpr::Unary { op, operand, span } => {
                let v = self.eval(operand)?;
                match op {
                    UnaryOp::Neg => v.checked_neg().ok_or_else(|| overflow(*span)),
                    UnaryOp::Plus => Ok(v),
                    UnaryOp::BitNot => Ok(!v),
                    UnaryOp::Not => Ok((v == 0) as i64),
                }
            }
            ConstExpr::Binary {
                op,
                left,
                right,
                span,
            } => {
                let l = self.eval(left)?;
                let r = self.eval(right)?;
                let result = match op {
                    BinaryOp::Mul => l.checked_mul(r),
                    BinaryOp::Add => l.checked_add(r),
                    BinaryOp::Sub => l.checked_sub(r),
                    BinaryOp::Div | BinaryOp::Mod if r == 0 => {
                        return Err(DeclarationError::constant("division by zero").at(span.start))
                    }
                    BinaryOp::Div => l.checked_div(r),
                    BinaryOp::Mod => l.checked_rem(r),
                    BinaryOp::Shl => u32::try_from(r).ok().and_then(|r| l.checked_shl(r)),
                    BinaryOp::Shr => u32::try_from(r).ok().and_then(|r| l.checked_shr(r)),
                    BinaryOp::BitAnd => Some(l & r),
                    BinaryOp::BitXor => Some(l ^ r),
                    BinaryOp::BitOr => Some(l | r),
                };
                result.ok_or_else(|| overflow(*span))
            }
        }
    }
}
