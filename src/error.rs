//! Error taxonomy of the runtime.
//!
//! Authoring mistakes surface as [`CheckError`] synchronously from the
//! offending call and are never caught internally. [`InternalError`] values
//! indicate a bug in the engine itself. Coroutine cancellation and errors
//! returned by user code (validators, system bodies, coroutines) are carried
//! by the umbrella [`Error`] type.

use thiserror::Error;

use crate::entity::Entity;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A misuse of the API discoverable before production.
#[derive(Debug, Error)]
pub enum CheckError {
    /// A field name does not exist in the component schema.
    #[error("component `{component}` has no field `{field}`")]
    UnknownField {
        /// Component type name.
        component: String,
        /// The offending field name.
        field:     String,
    },

    /// A value of the wrong kind was supplied for a field.
    #[error("field `{component}.{field}` holds {expected} values, got {actual}")]
    FieldType {
        /// Component type name.
        component: String,
        /// Field name.
        field:     String,
        /// Declared field kind.
        expected:  &'static str,
        /// Kind of the supplied value.
        actual:    &'static str,
    },

    /// The caller did not declare the access it attempted.
    #[error("`{accessor}` is not entitled to {access} component `{component}`")]
    NotEntitled {
        /// System name, or `validator` for validator hooks.
        accessor:  String,
        /// Component type name.
        component: String,
        /// `read` or `write`.
        access:    &'static str,
    },

    /// `add` on a component the entity already has.
    #[error("entity {entity:?} already has component `{component}`")]
    AlreadyPresent {
        /// Component type name.
        component: String,
        /// The entity.
        entity:    Entity,
    },

    /// `remove`/`read`/`write` on a component the entity does not have.
    #[error("entity {entity:?} does not have component `{component}`")]
    NotPresent {
        /// Component type name.
        component: String,
        /// The entity.
        entity:    Entity,
    },

    /// A fixed-capacity storage (or the entity pool) is full.
    #[error("capacity of `{what}` exhausted at {capacity}")]
    CapacityExhausted {
        /// The storage or pool that overflowed.
        what:     String,
        /// The capacity that was hit.
        capacity: usize,
    },

    /// An operation was invoked in a world state that does not permit it.
    #[error("cannot {op} while the world is {state}")]
    WrongState {
        /// The attempted operation.
        op:    &'static str,
        /// Name of the current state.
        state: &'static str,
    },

    /// The schedule graph contains a cycle not broken by any constraint.
    #[error("schedule cycle in group {group} among systems: {systems}")]
    CycleDetected {
        /// The system group.
        group:   u32,
        /// Comma-joined names of the systems on the cycle.
        systems: String,
    },

    /// Two components or two systems were registered under one name.
    #[error("duplicate registration of `{name}`")]
    DuplicateName {
        /// The conflicting name.
        name: String,
    },

    /// A component schema declares more fields than the bitmask supports.
    #[error("component `{component}` declares {count} fields, limit is {limit}")]
    TooManyFields {
        /// Component type name.
        component: String,
        /// Declared field count.
        count:     usize,
        /// The hard limit.
        limit:     usize,
    },

    /// An entity handle whose generation no longer matches the live entity.
    #[error("stale entity handle {entity:?}")]
    StaleEntity {
        /// The stale handle.
        entity: Entity,
    },

    /// A `before`/`after` constraint names a system in another group.
    #[error("system `{system}` constrains `{other}` which runs in another group")]
    ForeignConstraint {
        /// The constrained system.
        system: String,
        /// The system in the other group.
        other:  String,
    },

    /// An id (component, system, group, query) that this world never issued.
    #[error("unknown {what} id {id}")]
    UnknownId {
        /// What kind of id.
        what: &'static str,
        /// The raw id value.
        id:   u32,
    },

    /// `build` called from inside another `build` block.
    #[error("build blocks cannot nest")]
    NestedBuild,
}

/// A should-never-happen state; indicates a bug in the engine.
#[derive(Debug, Error)]
pub enum InternalError {
    /// Releasing a slot that was never acquired.
    #[error("released slot for entity {entity} in `{component}` was not acquired")]
    ReleaseUnacquired {
        /// Component type name.
        component: String,
        /// Raw entity id.
        entity:    u32,
    },

    /// Binding a view over an entity with no acquired slot.
    #[error("entity {entity} has `{component}` in its shape but no acquired slot")]
    BindUnacquired {
        /// Component type name.
        component: String,
        /// Raw entity id.
        entity:    u32,
    },

    /// Acquiring a slot that is already occupied.
    #[error("entity {entity} already occupies a slot in `{component}`")]
    AcquireOccupied {
        /// Component type name.
        component: String,
        /// Raw entity id.
        entity:    u32,
    },

    /// A back reference expected in the ref graph was absent.
    #[error("missing back reference to entity {target} from entity {referrer}")]
    MissingBackRef {
        /// Referenced entity id.
        target: u32,
        /// Referencing entity id.
        referrer: u32,
    },
}

/// Any error surfaced by the runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// An authoring mistake.
    #[error(transparent)]
    Check(#[from] CheckError),

    /// An engine invariant violation.
    #[error(transparent)]
    Internal(#[from] InternalError),

    /// A coroutine was cancelled before completion.
    #[error("coroutine cancelled")]
    Canceled,

    /// An error returned by user code in a validator, system or coroutine.
    #[error("{0}")]
    User(Box<dyn std::error::Error + 'static>),
}

impl Error {
    /// Wraps an arbitrary user error, as returned from validators, system
    /// bodies and coroutines.
    pub fn user(err: impl Into<Box<dyn std::error::Error + 'static>>) -> Self {
        Self::User(err.into())
    }

    /// Whether this error is a cancellation marker.
    pub fn is_canceled(&self) -> bool { matches!(self, Self::Canceled) }
}
