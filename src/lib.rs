//! A synchronous, frame-phased ECS runtime with cooperative coroutines.
//!
//! # The model
//! State lives in a single [`World`]: entities composed of dynamically
//! registered component types, mutated by systems that run once per frame in
//! a deterministic order derived from their declared data access. Components
//! are schemas of typed fields stored struct-of-arrays; an entity's
//! composition is a bit stripe (its *shape*) giving O(1) membership tests.
//!
//! # Scheduling
//! Systems declare queries: a shape predicate plus read/write entitlements.
//! Within a group, every writer of a component type is ordered before every
//! reader of it, further constrained by explicit `before`/`after` edges; the
//! resulting topological order is fixed at build time. Between systems, a
//! flush applies deferred work (entity deletions, dangling-reference
//! clearing), so a system always observes the full effects of the systems
//! scheduled before it in the same frame.
//!
//! # Coroutines
//! Systems launch cooperative coroutines that advance between systems, can
//! await each other with return values and error propagation, and cancel
//! through explicit handles, predicates, entity scoping, or newer starts of
//! the same coroutine type.
//!
//! # Example
//! ```
//! use cadre::{ComponentDef, FieldKind, System, SystemContext, SystemDef, Value, World};
//!
//! struct Mover {
//!     position: cadre::ComponentId,
//!     moving:   Option<cadre::QueryId>,
//! }
//!
//! impl System for Mover {
//!     fn declare(&mut self, decl: &mut cadre::Declarations<'_>) {
//!         self.moving =
//!             Some(decl.query().with(&[self.position]).writes(&[self.position]).build());
//!     }
//!
//!     fn execute(&mut self, cx: &mut SystemContext<'_>) -> cadre::Result<()> {
//!         let query = cx.query(self.moving.expect("declared"))?;
//!         for entity in query.current {
//!             let mut position = cx.write(entity, self.position)?;
//!             let x = position.get("x")?.as_f64().expect("f64 field");
//!             position.set("x", Value::F64(x + 1.))?;
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let mut builder = World::builder();
//! let position = builder
//!     .register_component(ComponentDef::new("Position").field_default("x", FieldKind::F64))?;
//! builder.register_system(SystemDef::new("Mover", Mover { position, moving: None }))?;
//! let mut world = builder.build()?;
//!
//! world.create_entity(&[(position, &[("x", Value::F64(2.))])])?;
//! world.execute()?;
//! world.terminate()?;
//! # Ok::<(), cadre::Error>(())
//! ```

#![warn(missing_docs)]

pub mod comp;
pub use comp::{
    Capacity, ComponentDef, ComponentId, FieldDef, FieldKind, StorageKind, Value, MAX_NUM_FIELDS,
};

pub mod coroutine;
pub use coroutine::{
    CoroContext, CoroValue, Coroutine, CoroutineHandle, FnCoroutine, Predicate, Spawn, Step,
    Waiting,
};

pub mod entity;
pub use entity::Entity;

pub mod error;
pub use error::{CheckError, Error, InternalError, Result};

mod scheduler;

pub mod storage;
pub use storage::bind::{CompRead, CompWrite};

pub mod system;
pub use system::query::{Declarations, QueryId, QueryView};
pub use system::{Control, System, SystemDef, SystemId};

#[cfg(test)]
pub(crate) mod test_util;

pub mod world;
pub use world::{Builder, EntityChecker, Frame, SystemContext, World, WorldOptions};
