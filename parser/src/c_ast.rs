//! Syntax tree for C declarations
//!
//! The tree mirrors C's declarator structure: a declaration is a list of
//! specifiers followed by declarators, and each declarator is a chain of
//! pointer/array/function wrappers around an optional name. Lowering the tree
//! into semantic types happens in the `ffi` crate.

/// Byte range inside one chunk of declaration text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn merge(self, other: Span) -> Span {
        Span::new(self.start.min(other.start), self.end.max(other.end))
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TranslationUnit {
    pub declarations: Vec<Declaration>,
}

/// `specifiers declarator, declarator, ... ;`
#[derive(Debug, Clone, PartialEq)]
pub struct Declaration {
    pub specifiers: DeclSpecifiers,
    pub declarators: Vec<InitDeclarator>,
    pub span: Span,
}

/// A declarator with its (rejected later) initializer, if any
#[derive(Debug, Clone, PartialEq)]
pub struct InitDeclarator {
    pub declarator: Declarator,
    pub initializer: Option<Span>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageClass {
    Typedef,
    Extern,
    Static,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Qualifiers {
    pub is_const: bool,
    pub is_volatile: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeclSpecifiers {
    pub storage: Option<StorageClass>,
    pub qualifiers: Qualifiers,
    pub ty: TypeSpecifier,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypeSpecifier {
    Void,
    /// Canonical spelling of a builtin arithmetic type, e.g. `unsigned long long`
    Primitive(String),
    /// A typedef name
    Named(String),
    StructOrUnion(AggregateSpecifier),
    Enum(EnumSpecifier),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateKind {
    Struct,
    Union,
}

impl AggregateKind {
    pub fn keyword(self) -> &'static str {
        match self {
            AggregateKind::Struct => "struct",
            AggregateKind::Union => "union",
        }
    }
}

/// `struct tag { fields }`, `struct tag` or `struct { fields }`
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateSpecifier {
    pub kind: AggregateKind,
    pub tag: Option<String>,
    /// `None` when the body is absent (reference or forward declaration)
    pub fields: Option<Vec<FieldDecl>>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDecl {
    pub specifiers: DeclSpecifiers,
    pub members: Vec<FieldMember>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldMember {
    /// `None` for an unnamed bit-field such as `int : 0;`
    pub declarator: Option<Declarator>,
    pub bit_width: Option<ConstExpr>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumSpecifier {
    pub tag: Option<String>,
    pub enumerators: Option<Vec<Enumerator>>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Enumerator {
    pub name: String,
    pub value: Option<ConstExpr>,
    pub span: Span,
}

/// Declarator chain; lowering applies the wrappers from the outside in
#[derive(Debug, Clone, PartialEq)]
pub enum Declarator {
    Name {
        name: Option<String>,
        span: Span,
    },
    Pointer {
        inner: Box<Declarator>,
        qualifiers: Qualifiers,
    },
    Array {
        inner: Box<Declarator>,
        length: Option<ConstExpr>,
    },
    Function {
        inner: Box<Declarator>,
        params: ParamList,
    },
}

impl Declarator {
    pub fn abstract_at(pos: usize) -> Self {
        Declarator::Name {
            name: None,
            span: Span::new(pos, pos),
        }
    }

    /// The declared identifier, if this is not an abstract declarator
    pub fn name(&self) -> Option<&str> {
        match self {
            Declarator::Name { name, .. } => name.as_deref(),
            Declarator::Pointer { inner, .. }
            | Declarator::Array { inner, .. }
            | Declarator::Function { inner, .. } => inner.name(),
        }
    }

    pub fn name_span(&self) -> Span {
        match self {
            Declarator::Name { span, .. } => *span,
            Declarator::Pointer { inner, .. }
            | Declarator::Array { inner, .. }
            | Declarator::Function { inner, .. } => inner.name_span(),
        }
    }

    /// True when the outermost type constructor applied to the base type is a
    /// function, i.e. this declares a function rather than a pointer to one
    pub fn is_function(&self) -> bool {
        match self {
            Declarator::Name { .. } => false,
            Declarator::Function { inner, .. } => !inner.has_derivation(),
            Declarator::Pointer { inner, .. } | Declarator::Array { inner, .. } => {
                inner.is_function()
            }
        }
    }

    fn has_derivation(&self) -> bool {
        !matches!(self, Declarator::Name { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParamList {
    pub params: Vec<ParamDecl>,
    pub variadic: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamDecl {
    pub specifiers: DeclSpecifiers,
    pub declarator: Declarator,
    pub span: Span,
}

/// `specifiers abstract-declarator`, as used by casts and `sizeof`
#[derive(Debug, Clone, PartialEq)]
pub struct TypeName {
    pub specifiers: DeclSpecifiers,
    pub declarator: Declarator,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Plus,
    BitNot,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Mul,
    Div,
    Mod,
    Add,
    Sub,
    Shl,
    Shr,
    BitAnd,
    BitXor,
    BitOr,
}

/// Integer constant expression (array lengths, bit widths, enumerator values)
#[derive(Debug, Clone, PartialEq)]
pub enum ConstExpr {
    Int {
        value: i64,
        span: Span,
    },
    Ident {
        name: String,
        span: Span,
    },
    Unary {
        op: UnaryOp,
        operand: Box<ConstExpr>,
        span: Span,
    },
    Binary {
        op: BinaryOp,
        left: Box<ConstExpr>,
        right: Box<ConstExpr>,
        span: Span,
    },
}

impl ConstExpr {
    pub fn span(&self) -> Span {
        match self {
            ConstExpr::Int { span, .. }
            | ConstExpr::Ident { span, .. }
            | ConstExpr::Unary { span, .. }
            | ConstExpr::Binary { span, .. } => *span,
        }
    }
}
