//! Systems: user-defined units of logic with declared queries, entitlements
//! and scheduling constraints.
//!
//! A system implements [`System`] and is registered through a [`SystemDef`].
//! During world construction the system's [`declare`](System::declare) pass
//! builds its queries; the declared read/write entitlements feed both the
//! access checks and the scheduler's writer-before-reader ordering.

use bitvec::vec::BitVec;

use crate::comp::ComponentId;
use crate::error::Result;
use crate::world::SystemContext;

pub(crate) mod query;

/// Identifies a registered system within its world. Sequentially assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SystemId(pub(crate) u32);

impl SystemId {
    pub(crate) fn index(self) -> usize { self.0 as usize }
}

/// A user-defined unit of logic.
///
/// `initialize` runs once before the first frame, `execute` once per frame,
/// `finalize` once on terminate, each in the scheduled order of the system's
/// group.
pub trait System: 'static {
    /// Declares the system's queries and entitlements. Runs once during
    /// world construction, before any phase.
    fn declare(&mut self, decl: &mut query::Declarations<'_>);

    /// Runs once before the first frame.
    fn initialize(&mut self, cx: &mut SystemContext<'_>) -> Result<()> {
        let _ = cx;
        Ok(())
    }

    /// Runs once per frame in scheduled order.
    fn execute(&mut self, cx: &mut SystemContext<'_>) -> Result<()>;

    /// Runs once when the world terminates.
    fn finalize(&mut self, cx: &mut SystemContext<'_>) -> Result<()> {
        let _ = cx;
        Ok(())
    }
}

/// Declares a system instance for registration.
pub struct SystemDef {
    pub(crate) name:     String,
    pub(crate) group:    u32,
    pub(crate) instance: Box<dyn System>,
    pub(crate) befores:  Vec<SystemId>,
    pub(crate) afters:   Vec<SystemId>,
}

impl SystemDef {
    /// Wraps a system instance under a name unique within the world.
    pub fn new(name: impl Into<String>, instance: impl System) -> Self {
        Self {
            name:     name.into(),
            group:    0,
            instance: Box::new(instance),
            befores:  Vec::new(),
            afters:   Vec::new(),
        }
    }

    /// Assigns the system to an execution group. Group 0 is the default.
    pub fn group(mut self, group: u32) -> Self {
        self.group = group;
        self
    }

    /// Constrains this system to run before the given sibling.
    pub fn before(mut self, other: SystemId) -> Self {
        self.befores.push(other);
        self
    }

    /// Constrains this system to run after the given sibling.
    pub fn after(mut self, other: SystemId) -> Self {
        self.afters.push(other);
        self
    }
}

/// Stop/restart requests, applied between frames.
///
/// A stopped system skips `execute` and stops accumulating reactive query
/// events; a restarted system resumes from the current world state without
/// backfilling the events it missed.
#[derive(Debug, Default)]
pub struct Control {
    /// Systems to stop.
    pub stop:    Vec<SystemId>,
    /// Systems to restart.
    pub restart: Vec<SystemId>,
}

/// World-side record of one registered system.
pub(crate) struct Node {
    pub(crate) name:     String,
    pub(crate) group:    u32,
    /// Taken out while the system runs so the world stays borrowable.
    pub(crate) instance: Option<Box<dyn System>>,
    pub(crate) befores:  Vec<SystemId>,
    pub(crate) afters:   Vec<SystemId>,
    pub(crate) reads:    BitVec,
    pub(crate) writes:   BitVec,
    pub(crate) queries:  Vec<query::QueryId>,
    pub(crate) stopped:  bool,
}

impl Node {
    pub(crate) fn new(def: SystemDef, num_components: usize) -> Self {
        Self {
            name:     def.name,
            group:    def.group,
            instance: Some(def.instance),
            befores:  def.befores,
            afters:   def.afters,
            reads:    BitVec::repeat(false, num_components),
            writes:   BitVec::repeat(false, num_components),
            queries:  Vec::new(),
            stopped:  false,
        }
    }

    pub(crate) fn may_read(&self, comp: ComponentId) -> bool {
        self.reads[comp.index()] || self.writes[comp.index()]
    }

    pub(crate) fn may_write(&self, comp: ComponentId) -> bool { self.writes[comp.index()] }
}
