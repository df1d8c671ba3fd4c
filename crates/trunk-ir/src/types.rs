//! Attributes and hash-consed types.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;

use cranelift_entity::PrimaryMap;
use smallvec::SmallVec;

use crate::location::Location;
use crate::refs::TypeRef;
use crate::symbol::Symbol;

// ============================================================================
// Attribute
// ============================================================================

/// Constant data attached to operations, block arguments, and types.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Attribute {
    Unit,
    Bool(bool),
    /// Signless integer stored as raw bits.
    IntBits(u64),
    /// Float stored as raw bits.
    FloatBits(u64),
    String(String),
    Type(TypeRef),
    Symbol(Symbol),
    List(Vec<Attribute>),
    Location(Location),
}

/// Variant tag of an [`Attribute`], used to key typed conversion rules.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AttributeKind {
    Unit,
    Bool,
    Int,
    Float,
    String,
    Type,
    Symbol,
    List,
    Location,
}

impl Attribute {
    pub fn kind(&self) -> AttributeKind {
        match self {
            Attribute::Unit => AttributeKind::Unit,
            Attribute::Bool(_) => AttributeKind::Bool,
            Attribute::IntBits(_) => AttributeKind::Int,
            Attribute::FloatBits(_) => AttributeKind::Float,
            Attribute::String(_) => AttributeKind::String,
            Attribute::Type(_) => AttributeKind::Type,
            Attribute::Symbol(_) => AttributeKind::Symbol,
            Attribute::List(_) => AttributeKind::List,
            Attribute::Location(_) => AttributeKind::Location,
        }
    }

    pub fn as_type(&self) -> Option<TypeRef> {
        match self {
            Attribute::Type(ty) => Some(*ty),
            _ => None,
        }
    }
}

impl From<i64> for Attribute {
    fn from(value: i64) -> Self {
        Attribute::IntBits(u64::from_ne_bytes(value.to_ne_bytes()))
    }
}

impl From<u64> for Attribute {
    fn from(value: u64) -> Self {
        Attribute::IntBits(value)
    }
}

impl From<bool> for Attribute {
    fn from(value: bool) -> Self {
        Attribute::Bool(value)
    }
}

impl From<TypeRef> for Attribute {
    fn from(value: TypeRef) -> Self {
        Attribute::Type(value)
    }
}

impl From<Symbol> for Attribute {
    fn from(value: Symbol) -> Self {
        Attribute::Symbol(value)
    }
}

impl From<&str> for Attribute {
    fn from(value: &str) -> Self {
        Attribute::String(value.to_owned())
    }
}

impl From<Vec<Attribute>> for Attribute {
    fn from(value: Vec<Attribute>) -> Self {
        Attribute::List(value)
    }
}

// ============================================================================
// TypeData
// ============================================================================

/// Stable per-variant tag of a type: its dialect and name, ignoring params.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeKind {
    pub dialect: Symbol,
    pub name: Symbol,
}

impl TypeKind {
    pub fn new(dialect: impl Into<Symbol>, name: impl Into<Symbol>) -> Self {
        Self {
            dialect: dialect.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.dialect, self.name)
    }
}

impl fmt::Debug for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeKind({self})")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TypeData {
    pub dialect: Symbol,
    pub name: Symbol,
    pub params: SmallVec<[TypeRef; 4]>,
    pub attrs: BTreeMap<Symbol, Attribute>,
}

impl TypeData {
    pub fn kind(&self) -> TypeKind {
        TypeKind {
            dialect: self.dialect,
            name: self.name,
        }
    }
}

/// Fluent construction of [`TypeData`]; params and attrs default to empty.
pub struct TypeDataBuilder {
    data: TypeData,
}

impl TypeDataBuilder {
    pub fn new(dialect: impl Into<Symbol>, name: impl Into<Symbol>) -> Self {
        Self {
            data: TypeData {
                dialect: dialect.into(),
                name: name.into(),
                params: SmallVec::new(),
                attrs: BTreeMap::new(),
            },
        }
    }

    pub fn param(mut self, ty: TypeRef) -> Self {
        self.data.params.push(ty);
        self
    }

    pub fn params(mut self, tys: impl IntoIterator<Item = TypeRef>) -> Self {
        self.data.params.extend(tys);
        self
    }

    pub fn attr(mut self, key: impl Into<Symbol>, val: Attribute) -> Self {
        self.data.attrs.insert(key.into(), val);
        self
    }

    pub fn build(self) -> TypeData {
        self.data
    }
}

// ============================================================================
// TypeInterner
// ============================================================================

#[derive(Default)]
struct InternTable {
    types: PrimaryMap<TypeRef, Rc<TypeData>>,
    dedup: HashMap<Rc<TypeData>, TypeRef>,
}

/// Deduplicating type table. Equal `TypeData` always yields the same `TypeRef`.
///
/// Interning goes through a shared reference so that code holding only
/// `&IrContext` (legality predicates, type conversion rules) can build the
/// types it needs.
#[derive(Default)]
pub struct TypeInterner {
    table: RefCell<InternTable>,
}

impl TypeInterner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&self, data: TypeData) -> TypeRef {
        let mut table = self.table.borrow_mut();
        if let Some(&existing) = table.dedup.get(&data) {
            return existing;
        }
        let data = Rc::new(data);
        let r = table.types.push(Rc::clone(&data));
        table.dedup.insert(data, r);
        r
    }

    pub fn get(&self, r: TypeRef) -> Rc<TypeData> {
        Rc::clone(&self.table.borrow().types[r])
    }

    pub fn kind(&self, r: TypeRef) -> TypeKind {
        self.table.borrow().types[r].kind()
    }

    /// Check whether `r` is the type `dialect.name`.
    pub fn is(&self, r: TypeRef, dialect: &str, name: &str) -> bool {
        let table = self.table.borrow();
        let data = &table.types[r];
        data.dialect == dialect && data.name == name
    }

    pub fn len(&self) -> usize {
        self.table.borrow().types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
