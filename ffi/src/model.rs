//! Logical C type model
//!
//! A [`CType`] is an immutable value describing a C type independently of any
//! backend. Equality and hashing are structural, so two separately parsed
//! occurrences of `unsigned long *` compare equal and share one backend
//! handle in the type cache.
//!
//! Struct and union nodes are identified by kind and tag only. Their fields
//! live in the [`DeclarationTable`], which keeps self-referential aggregates
//! finite and lets a forward declaration be completed later under the same
//! identity.
//!
//! Each node takes part in backend construction in two phases: [`CType::prepare`]
//! lists the nodes whose handles must exist first, and [`CType::finish`]
//! materializes this node's handle from them.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

pub use parser::AggregateKind;

use crate::backend::{Backend, FieldSpec};
use crate::declarations::DeclarationTable;
use crate::error::{BackendError, BackendErrorKind};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CType {
    Void,
    /// Canonical spelling of an arithmetic type, e.g. `unsigned long long`
    Primitive(Rc<str>),
    Function(FunctionType),
    Pointer(Rc<CType>),
    Array(ArrayType),
    StructOrUnion(StructOrUnionType),
    Enum(EnumType),
}

/// Function signature; the linkage name does not take part in identity
#[derive(Debug, Clone)]
pub struct FunctionType {
    pub args: Rc<[CType]>,
    pub result: Rc<CType>,
    pub variadic: bool,
    pub name: Option<Rc<str>>,
}

impl PartialEq for FunctionType {
    fn eq(&self, other: &Self) -> bool {
        self.args == other.args && self.result == other.result && self.variadic == other.variadic
    }
}

impl Eq for FunctionType {}

impl Hash for FunctionType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.args.hash(state);
        self.result.hash(state);
        self.variadic.hash(state);
    }
}

/// Array node; `item` is always `Pointer(element)` so arrays and pointers
/// share one construction path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArrayType {
    item: Rc<CType>,
    length: Option<usize>,
}

impl ArrayType {
    pub fn new(element: CType, length: Option<usize>) -> Self {
        Self {
            item: Rc::new(CType::pointer(element)),
            length,
        }
    }

    /// The `Pointer(element)` wrapper handed to the backend
    pub fn item(&self) -> &CType {
        &self.item
    }

    pub fn element(&self) -> &CType {
        match &*self.item {
            CType::Pointer(element) => element,
            other => other,
        }
    }

    /// `None` for an open array such as `char[]`
    pub fn length(&self) -> Option<usize> {
        self.length
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructOrUnionType {
    pub kind: AggregateKind,
    /// Tag name; anonymous aggregates get `$1`, `$2`, ...
    pub name: Rc<str>,
}

impl StructOrUnionType {
    pub fn is_anonymous(&self) -> bool {
        self.name.starts_with('$')
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnumType {
    pub name: Rc<str>,
    pub enumerators: Rc<[String]>,
    pub values: Rc<[i64]>,
}

impl CType {
    pub fn primitive(name: &str) -> Self {
        CType::Primitive(Rc::from(name))
    }

    pub fn pointer(pointee: CType) -> Self {
        CType::Pointer(Rc::new(pointee))
    }

    pub fn array(element: CType, length: Option<usize>) -> Self {
        CType::Array(ArrayType::new(element, length))
    }

    pub fn function(args: Vec<CType>, result: CType, variadic: bool) -> Self {
        CType::Function(FunctionType {
            args: args.into(),
            result: Rc::new(result),
            variadic,
            name: None,
        })
    }

    pub fn aggregate(kind: AggregateKind, name: &str) -> Self {
        CType::StructOrUnion(StructOrUnionType {
            kind,
            name: Rc::from(name),
        })
    }

    pub fn is_void(&self) -> bool {
        matches!(self, CType::Void)
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, CType::StructOrUnion(_))
    }

    pub fn as_function(&self) -> Option<&FunctionType> {
        match self {
            CType::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_aggregate(&self) -> Option<&StructOrUnionType> {
        match self {
            CType::StructOrUnion(s) => Some(s),
            _ => None,
        }
    }

    pub fn pointee(&self) -> Option<&CType> {
        match self {
            CType::Pointer(p) => Some(p),
            _ => None,
        }
    }

    /// Integer-valued types, the only ones allowed as bit-fields
    pub fn is_integer(&self) -> bool {
        match self {
            CType::Enum(_) => true,
            CType::Primitive(name) => !matches!(&**name, "float" | "double" | "long double"),
            _ => false,
        }
    }

    /// Same node carrying a linkage name, for top-level function declarations
    pub fn with_linkage_name(self, name: &str) -> Self {
        match self {
            CType::Function(mut f) => {
                f.name = Some(Rc::from(name));
                CType::Function(f)
            }
            other => other,
        }
    }

    /// Nodes whose backend handles must exist before this one can be finished
    pub fn prepare(&self, decls: &DeclarationTable) -> Vec<CType> {
        match self {
            CType::Void | CType::Primitive(_) | CType::Enum(_) => Vec::new(),
            CType::Pointer(pointee) => vec![(**pointee).clone()],
            CType::Array(array) => vec![array.item().clone()],
            CType::Function(f) => std::iter::once((*f.result).clone())
                .chain(f.args.iter().cloned())
                .collect(),
            CType::StructOrUnion(s) => decls
                .fields(s)
                .map(|fields| fields.types.clone())
                .unwrap_or_default(),
        }
    }

    /// Create the incomplete handle for an aggregate, before its fields exist
    pub fn new_incomplete<B: Backend>(&self, backend: &B) -> Result<B::Type, BackendError> {
        match self {
            CType::StructOrUnion(s) => match s.kind {
                AggregateKind::Struct => backend.new_struct_type(&s.name),
                AggregateKind::Union => backend.new_union_type(&s.name),
            },
            other => Err(BackendError::new(
                BackendErrorKind::UnknownType,
                format!("'{}' is not a struct or union", other),
            )),
        }
    }

    /// Materialize the handle from the handles of [`CType::prepare`]'s nodes.
    /// Aggregates complete `placeholder` and return it.
    pub fn finish<B: Backend>(
        &self,
        backend: &B,
        decls: &DeclarationTable,
        placeholder: Option<&B::Type>,
        deps: &[B::Type],
    ) -> Result<B::Type, BackendError> {
        match (self, deps) {
            (CType::Void, []) => backend.new_void_type(),
            (CType::Primitive(name), []) => backend.new_primitive_type(name),
            (CType::Enum(e), []) => backend.new_enum_type(&e.name, &e.enumerators, &e.values),
            (CType::Pointer(_), [pointee]) => backend.new_pointer_type(pointee),
            (CType::Array(array), [item]) => backend.new_array_type(item, array.length()),
            (CType::Function(f), [result, args @ ..]) => {
                backend.new_function_type(args, result, f.variadic)
            }
            (CType::StructOrUnion(s), _) => {
                let placeholder = placeholder.ok_or_else(|| {
                    BackendError::new(
                        BackendErrorKind::UnknownType,
                        format!("no incomplete handle for '{}'", self),
                    )
                })?;
                if let Some(fields) = decls.fields(s) {
                    let specs: Vec<FieldSpec<'_, B::Type>> = fields
                        .names
                        .iter()
                        .zip(deps)
                        .zip(&fields.bitsizes)
                        .map(|((name, ty), bitsize)| FieldSpec {
                            name,
                            ty,
                            bitsize: *bitsize,
                        })
                        .collect();
                    backend.complete_struct_or_union(placeholder, &specs)?;
                }
                Ok(placeholder.clone())
            }
            _ => Err(BackendError::new(
                BackendErrorKind::UnknownType,
                format!("wrong number of dependencies for '{}'", self),
            )),
        }
    }

    /// C spelling with `inner` as the declarator, e.g. `int (*inner)[4]`
    pub fn declaration(&self, inner: &str) -> String {
        match self {
            CType::Void => join_declarator("void", inner),
            CType::Primitive(name) => join_declarator(name, inner),
            CType::StructOrUnion(s) => join_declarator(&format!("{} {}", s.kind.keyword(), s.name), inner),
            CType::Enum(e) => join_declarator(&format!("enum {}", e.name), inner),
            CType::Pointer(pointee) => match &**pointee {
                CType::Array(_) | CType::Function(_) => pointee.declaration(&format!("(*{})", inner)),
                _ => pointee.declaration(&format!("*{}", inner)),
            },
            CType::Array(array) => {
                let suffix = match array.length() {
                    Some(n) => format!("{}[{}]", inner, n),
                    None => format!("{}[]", inner),
                };
                array.element().declaration(&suffix)
            }
            CType::Function(f) => {
                let mut args: Vec<String> = f.args.iter().map(|a| a.to_string()).collect();
                if f.variadic {
                    args.push("...".to_string());
                } else if args.is_empty() {
                    args.push("void".to_string());
                }
                f.result
                    .declaration(&format!("{}({})", inner, args.join(", ")))
            }
        }
    }
}

fn join_declarator(base: &str, inner: &str) -> String {
    if inner.is_empty() {
        base.to_string()
    } else if inner.starts_with('[') || inner.starts_with('(') {
        format!("{}{}", base, inner)
    } else {
        format!("{} {}", base, inner)
    }
}

impl fmt::Display for CType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.declaration(""))
    }
}
