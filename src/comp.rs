//! Component types, schemas and the per-world type registry.
//!
//! A component type is registered once per world through a [`ComponentDef`]:
//! an ordered list of field descriptors, a storage strategy, a capacity
//! policy and an optional validator hook. Registration consumes the def, so
//! a def can never end up bound to two live worlds. Field identity is the
//! sequence number assigned at registration; names are resolved to sequence
//! numbers when a view is bound.

use std::fmt;

use indexmap::IndexMap;

use crate::entity::Entity;
use crate::error::{CheckError, Error, Result};
use crate::world::EntityChecker;

/// The maximum number of fields a component schema may declare.
pub const MAX_NUM_FIELDS: usize = 64;

/// Identifies a component type within its world. Sequentially assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(pub(crate) u32);

impl ComponentId {
    pub(crate) fn index(self) -> usize { self.0 as usize }
}

/// Selects the storage backend for a component type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    /// Direct entity-indexed buffers. Constant time, wastes space.
    Sparse,
    /// Slot indirection with a LIFO free list. Compact, one extra hop.
    Packed,
    /// Linear scan over a small live-id table. For singletons or rare types.
    Compact,
}

/// Capacity policy of a storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    /// Exactly this many slots; exhaustion is an authoring error.
    Fixed(usize),
    /// Starts with this many slots, doubles up to the entity limit.
    Elastic(usize),
}

/// The closed set of field type descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum FieldKind {
    F32,
    F64,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    Bool,
    /// Holds an `Option<Entity>`; tracked by the reference graph.
    Ref,
}

impl FieldKind {
    /// Size in bytes of one stored value.
    pub fn size(self) -> usize {
        match self {
            Self::Bool | Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::F32 | Self::I32 | Self::U32 => 4,
            Self::F64 | Self::I64 | Self::U64 | Self::Ref => 8,
        }
    }

    /// The zero-like default for this kind.
    pub fn default_value(self) -> Value {
        match self {
            Self::F32 => Value::F32(0.),
            Self::F64 => Value::F64(0.),
            Self::I8 => Value::I8(0),
            Self::I16 => Value::I16(0),
            Self::I32 => Value::I32(0),
            Self::I64 => Value::I64(0),
            Self::U8 => Value::U8(0),
            Self::U16 => Value::U16(0),
            Self::U32 => Value::U32(0),
            Self::U64 => Value::U64(0),
            Self::Bool => Value::Bool(false),
            Self::Ref => Value::Ref(None),
        }
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::Bool => "bool",
            Self::Ref => "ref",
        }
    }
}

/// A dynamically typed field value.
#[derive(Debug, Clone, Copy, PartialEq)]
#[allow(missing_docs)]
pub enum Value {
    F32(f32),
    F64(f64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Bool(bool),
    Ref(Option<Entity>),
}

impl Value {
    /// The kind this value belongs to.
    pub fn kind(&self) -> FieldKind {
        match self {
            Self::F32(_) => FieldKind::F32,
            Self::F64(_) => FieldKind::F64,
            Self::I8(_) => FieldKind::I8,
            Self::I16(_) => FieldKind::I16,
            Self::I32(_) => FieldKind::I32,
            Self::I64(_) => FieldKind::I64,
            Self::U8(_) => FieldKind::U8,
            Self::U16(_) => FieldKind::U16,
            Self::U32(_) => FieldKind::U32,
            Self::U64(_) => FieldKind::U64,
            Self::Bool(_) => FieldKind::Bool,
            Self::Ref(_) => FieldKind::Ref,
        }
    }

    /// Unwraps an `F64` value.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Self::F64(v) => Some(v),
            _ => None,
        }
    }

    /// Unwraps an `F32` value.
    pub fn as_f32(&self) -> Option<f32> {
        match *self {
            Self::F32(v) => Some(v),
            _ => None,
        }
    }

    /// Unwraps any integer value widened to `i64`, if it fits.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Self::I8(v) => Some(v.into()),
            Self::I16(v) => Some(v.into()),
            Self::I32(v) => Some(v.into()),
            Self::I64(v) => Some(v),
            Self::U8(v) => Some(v.into()),
            Self::U16(v) => Some(v.into()),
            Self::U32(v) => Some(v.into()),
            Self::U64(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    /// Unwraps a `Bool` value.
    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Self::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// Unwraps a `Ref` value.
    pub fn as_entity(&self) -> Option<Option<Entity>> {
        match *self {
            Self::Ref(v) => Some(v),
            _ => None,
        }
    }
}

/// A typed slot in a component schema.
#[derive(Debug, Clone)]
pub struct FieldDef {
    /// Field name, unique within the schema.
    pub name:    String,
    /// Sequence number; the canonical field identity.
    pub seq:     u16,
    /// Type descriptor.
    pub kind:    FieldKind,
    /// Default value, applied on every slot initialization.
    pub default: Value,
}

/// The validator hook of a component type.
///
/// Invoked against the post-change shape on every shape mutation; an `Err`
/// unwinds the mutation. Validators only get shape inspection; `read` and
/// `write` on the checker fail.
pub type Validator = Box<dyn Fn(&EntityChecker<'_>) -> Result<()>>;

/// Declares a component type for registration.
pub struct ComponentDef {
    pub(crate) name:      String,
    pub(crate) storage:   Option<StorageKind>,
    pub(crate) capacity:  Option<Capacity>,
    pub(crate) fields:    Vec<FieldDef>,
    pub(crate) validator: Option<Validator>,
}

impl fmt::Debug for ComponentDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentDef")
            .field("name", &self.name)
            .field("storage", &self.storage)
            .field("capacity", &self.capacity)
            .field("fields", &self.fields)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

impl ComponentDef {
    /// Starts a def with the given type name. A def with no fields is a tag
    /// component: its existence is encoded solely in the shape bitmask.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name:      name.into(),
            storage:   None,
            capacity:  None,
            fields:    Vec::new(),
            validator: None,
        }
    }

    /// Overrides the world default storage strategy.
    pub fn storage(mut self, kind: StorageKind) -> Self {
        self.storage = Some(kind);
        self
    }

    /// Overrides the default capacity policy.
    pub fn capacity(mut self, capacity: Capacity) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Appends a field with an explicit default.
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind, default: Value) -> Self {
        let seq = self.fields.len() as u16;
        self.fields.push(FieldDef { name: name.into(), seq, kind, default });
        self
    }

    /// Appends a field defaulting to the kind's zero value.
    pub fn field_default(self, name: impl Into<String>, kind: FieldKind) -> Self {
        let default = kind.default_value();
        self.field(name, kind, default)
    }

    /// Appends a `ref` field holding `Option<Entity>`, initially `None`.
    pub fn ref_field(self, name: impl Into<String>) -> Self {
        self.field(name, FieldKind::Ref, Value::Ref(None))
    }

    /// Installs the validator hook.
    pub fn validate(mut self, hook: impl Fn(&EntityChecker<'_>) -> Result<()> + 'static) -> Self {
        self.validator = Some(Box::new(hook));
        self
    }
}

/// A registered component type.
pub(crate) struct TypeInfo {
    pub(crate) name:      String,
    pub(crate) storage:   StorageKind,
    pub(crate) capacity:  Capacity,
    pub(crate) fields:    Vec<FieldDef>,
    pub(crate) by_name:   IndexMap<String, u16>,
    pub(crate) validator: Option<Validator>,
}

impl TypeInfo {
    /// Whether this type stores no data at all.
    pub(crate) fn is_tag(&self) -> bool { self.fields.is_empty() }

    /// Resolves a field name to its descriptor.
    pub(crate) fn resolve(&self, field: &str) -> Result<&FieldDef, CheckError> {
        match self.by_name.get(field) {
            Some(&seq) => Ok(&self.fields[seq as usize]),
            None => Err(CheckError::UnknownField {
                component: self.name.clone(),
                field:     field.to_owned(),
            }),
        }
    }
}

/// All component types registered in one world.
#[derive(Default)]
pub(crate) struct Registry {
    pub(crate) types:   Vec<TypeInfo>,
    pub(crate) by_name: IndexMap<String, ComponentId>,
}

impl Registry {
    pub(crate) fn register(
        &mut self,
        def: ComponentDef,
        default_storage: StorageKind,
    ) -> Result<ComponentId, Error> {
        if self.by_name.contains_key(&def.name) {
            return Err(CheckError::DuplicateName { name: def.name }.into());
        }
        if def.fields.len() > MAX_NUM_FIELDS {
            return Err(CheckError::TooManyFields {
                component: def.name,
                count:     def.fields.len(),
                limit:     MAX_NUM_FIELDS,
            }
            .into());
        }

        let mut by_name = IndexMap::with_capacity(def.fields.len());
        for field in &def.fields {
            if by_name.insert(field.name.clone(), field.seq).is_some() {
                return Err(CheckError::DuplicateName { name: field.name.clone() }.into());
            }
        }

        // tags carry no data, so the indirection of packed/compact buys nothing
        let storage = if def.fields.is_empty() {
            StorageKind::Sparse
        } else {
            def.storage.unwrap_or(default_storage)
        };
        let capacity = def.capacity.unwrap_or(match storage {
            StorageKind::Sparse => Capacity::Fixed(0), // sized to the entity limit
            StorageKind::Packed => Capacity::Elastic(8),
            StorageKind::Compact => Capacity::Elastic(4),
        });

        let id = ComponentId(self.types.len() as u32);
        self.by_name.insert(def.name.clone(), id);
        self.types.push(TypeInfo {
            name: def.name,
            storage,
            capacity,
            fields: def.fields,
            by_name,
            validator: def.validator,
        });
        Ok(id)
    }

    pub(crate) fn len(&self) -> usize { self.types.len() }

    pub(crate) fn info(&self, id: ComponentId) -> &TypeInfo {
        self.types.get(id.index()).expect("component id issued by this registry")
    }

    pub(crate) fn check_id(&self, id: ComponentId) -> Result<(), CheckError> {
        if id.index() < self.types.len() {
            Ok(())
        } else {
            Err(CheckError::UnknownId { what: "component", id: id.0 })
        }
    }

    /// Component ids with a validator hook, in registration order.
    pub(crate) fn validated_types(&self) -> impl Iterator<Item = ComponentId> + '_ {
        self.types
            .iter()
            .enumerate()
            .filter(|(_, info)| info.validator.is_some())
            .map(|(index, _)| ComponentId(index as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_assigns_sequential_ids() {
        let mut registry = Registry::default();
        let a = registry
            .register(ComponentDef::new("A").field_default("x", FieldKind::F64), StorageKind::Sparse)
            .unwrap();
        let b = registry.register(ComponentDef::new("B"), StorageKind::Sparse).unwrap();
        assert_eq!(a, ComponentId(0));
        assert_eq!(b, ComponentId(1));
        assert!(registry.info(b).is_tag());
    }

    #[test]
    fn duplicate_name_rejected() {
        let mut registry = Registry::default();
        registry.register(ComponentDef::new("A"), StorageKind::Sparse).unwrap();
        let err = registry.register(ComponentDef::new("A"), StorageKind::Sparse).unwrap_err();
        assert!(matches!(err, Error::Check(CheckError::DuplicateName { .. })));
    }

    #[test]
    fn tag_forced_to_sparse() {
        let mut registry = Registry::default();
        let tag = registry
            .register(ComponentDef::new("Tag").storage(StorageKind::Packed), StorageKind::Packed)
            .unwrap();
        assert_eq!(registry.info(tag).storage, StorageKind::Sparse);
    }

    #[test]
    fn field_lookup_by_name() {
        let mut registry = Registry::default();
        let id = registry
            .register(
                ComponentDef::new("A")
                    .field("x", FieldKind::F32, Value::F32(1.5))
                    .ref_field("target"),
                StorageKind::Sparse,
            )
            .unwrap();
        let info = registry.info(id);
        assert_eq!(info.resolve("x").unwrap().seq, 0);
        assert_eq!(info.resolve("target").unwrap().kind, FieldKind::Ref);
        assert!(matches!(info.resolve("y"), Err(CheckError::UnknownField { .. })));
    }
}
