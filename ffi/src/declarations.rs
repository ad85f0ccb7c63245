//! The declaration table
//!
//! Maps qualified keys (`"function NAME"`, `"variable NAME"`,
//! `"typedef NAME"`, `"enum TAG"`) to logical types, and holds the field
//! lists of every struct and union seen so far. Insertion order is kept so
//! tools can list declarations the way they were written.

use std::rc::Rc;

use indexmap::IndexMap;

use crate::model::{AggregateKind, CType, StructOrUnionType};

/// Field lists of a completed struct or union
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateFields {
    /// Empty for unnamed bit-fields
    pub names: Vec<String>,
    pub types: Vec<CType>,
    pub bitsizes: Vec<Option<u32>>,
}

impl AggregateFields {
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateDef {
    pub kind: AggregateKind,
    pub name: Rc<str>,
    /// `None` while only forward-declared
    pub fields: Option<AggregateFields>,
}

#[derive(Debug, Clone, Default)]
pub struct DeclarationTable {
    entries: IndexMap<String, CType>,
    aggregates: IndexMap<(AggregateKind, Rc<str>), AggregateDef>,
    constants: IndexMap<String, i64>,
    anonymous: usize,
}

impl DeclarationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&CType> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn function(&self, name: &str) -> Option<&CType> {
        self.get(&format!("function {}", name))
    }

    pub fn variable(&self, name: &str) -> Option<&CType> {
        self.get(&format!("variable {}", name))
    }

    pub fn typedef(&self, name: &str) -> Option<&CType> {
        self.get(&format!("typedef {}", name))
    }

    pub fn enum_type(&self, tag: &str) -> Option<&CType> {
        self.get(&format!("enum {}", tag))
    }

    pub fn aggregate(&self, kind: AggregateKind, tag: &str) -> Option<&AggregateDef> {
        self.aggregates.get(&(kind, Rc::from(tag)))
    }

    /// Field lists of a struct or union node, if it has been completed
    pub fn fields(&self, ty: &StructOrUnionType) -> Option<&AggregateFields> {
        self.aggregates
            .get(&(ty.kind, ty.name.clone()))
            .and_then(|def| def.fields.as_ref())
    }

    /// Value of an enumerator constant
    pub fn constant(&self, name: &str) -> Option<i64> {
        self.constants.get(name).copied()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &CType)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn functions(&self) -> impl Iterator<Item = (&str, &CType)> {
        self.with_prefix("function ")
    }

    pub fn variables(&self) -> impl Iterator<Item = (&str, &CType)> {
        self.with_prefix("variable ")
    }

    pub fn typedefs(&self) -> impl Iterator<Item = (&str, &CType)> {
        self.with_prefix("typedef ")
    }

    fn with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a str, &'a CType)> {
        self.entries
            .iter()
            .filter_map(move |(k, v)| k.strip_prefix(prefix).map(|name| (name, v)))
    }

    pub fn aggregates(&self) -> impl Iterator<Item = &AggregateDef> {
        self.aggregates.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn insert(&mut self, key: String, ty: CType) {
        self.entries.insert(key, ty);
    }

    pub(crate) fn insert_constant(&mut self, name: String, value: i64) {
        self.constants.insert(name, value);
    }

    /// Record a struct/union tag without fields unless it already exists
    pub(crate) fn declare_aggregate(&mut self, kind: AggregateKind, tag: &str) {
        let tag: Rc<str> = Rc::from(tag);
        self.aggregates
            .entry((kind, tag.clone()))
            .or_insert_with(|| AggregateDef {
                kind,
                name: tag,
                fields: None,
            });
    }

    pub(crate) fn define_aggregate(&mut self, kind: AggregateKind, tag: &str, fields: AggregateFields) {
        self.declare_aggregate(kind, tag);
        if let Some(def) = self.aggregates.get_mut(&(kind, Rc::from(tag))) {
            def.fields = Some(fields);
        }
    }

    pub(crate) fn next_anonymous_tag(&mut self) -> String {
        self.anonymous += 1;
        format!("${}", self.anonymous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_iterators() {
        let mut table = DeclarationTable::new();
        table.insert("function abs".into(), CType::function(vec![], CType::primitive("int"), false));
        table.insert("variable optind".into(), CType::primitive("int"));
        table.insert("typedef size_t".into(), CType::primitive("unsigned long"));

        let functions: Vec<&str> = table.functions().map(|(n, _)| n).collect();
        assert_eq!(functions, vec!["abs"]);
        assert_eq!(table.variables().count(), 1);
        assert_eq!(table.typedef("size_t"), Some(&CType::primitive("unsigned long")));
        assert!(table.variable("abs").is_none());
    }

    #[test]
    fn test_forward_then_define() {
        let mut table = DeclarationTable::new();
        table.declare_aggregate(AggregateKind::Struct, "S");
        let node = StructOrUnionType {
            kind: AggregateKind::Struct,
            name: Rc::from("S"),
        };
        assert!(table.aggregate(AggregateKind::Struct, "S").is_some());
        assert!(table.fields(&node).is_none());

        table.define_aggregate(
            AggregateKind::Struct,
            "S",
            AggregateFields {
                names: vec!["a".into()],
                types: vec![CType::primitive("int")],
                bitsizes: vec![None],
            },
        );
        assert_eq!(table.fields(&node).map(|f| f.len()), Some(1));
        // declaring again keeps the definition
        table.declare_aggregate(AggregateKind::Struct, "S");
        assert!(table.fields(&node).is_some());
    }

    #[test]
    fn test_anonymous_tags() {
        let mut table = DeclarationTable::new();
        assert_eq!(table.next_anonymous_tag(), "$1");
        assert_eq!(table.next_anonymous_tag(), "$2");
    }
}
