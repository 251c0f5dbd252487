//! Query declaration and the reactive membership state behind it.
//!
//! A query pairs a shape predicate (`with`/`without` masks) with the
//! entitlements the system needs (`reads`/`writes`, which may exceed the
//! predicate) and the membership subsets it wants to observe (`current`,
//! `added`, `removed`). Added/removed events accumulate between the owning
//! system's runs and are handed over as a batch when it next executes.

use bitvec::slice::BitSlice;
use bitvec::vec::BitVec;

use crate::comp::ComponentId;
use crate::entity::Entity;
use crate::system::Node;

/// Identifies a declared query. Returned by [`QueryBuilder::build`] and
/// passed back to the context to obtain a [`QueryView`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryId(pub(crate) u32);

impl QueryId {
    pub(crate) fn index(self) -> usize { self.0 as usize }
}

/// Passed to [`System::declare`](crate::system::System::declare) to build
/// the system's queries.
pub struct Declarations<'a> {
    pub(crate) system:         u32,
    pub(crate) num_components: usize,
    pub(crate) max_entities:   usize,
    pub(crate) node:           &'a mut Node,
    pub(crate) queries:        &'a mut Vec<QueryState>,
}

impl<'a> Declarations<'a> {
    /// Starts a new query for this system.
    pub fn query(&mut self) -> QueryBuilder<'_, 'a> {
        let spec = QuerySpec {
            with:    BitVec::repeat(false, self.num_components),
            without: BitVec::repeat(false, self.num_components),
            current: false,
            added:   false,
            removed: false,
            recent:  false,
        };
        QueryBuilder { decl: self, spec }
    }
}

/// Builds one query; finish with [`build`](Self::build).
pub struct QueryBuilder<'d, 'a> {
    decl: &'d mut Declarations<'a>,
    spec: QuerySpec,
}

impl QueryBuilder<'_, '_> {
    /// Requires all of the given components in the shape predicate.
    pub fn with(mut self, comps: &[ComponentId]) -> Self {
        for comp in comps {
            self.spec.with.set(comp.index(), true);
        }
        self
    }

    /// Excludes entities having any of the given components.
    pub fn without(mut self, comps: &[ComponentId]) -> Self {
        for comp in comps {
            self.spec.without.set(comp.index(), true);
        }
        self
    }

    /// Entitles the system to read the given components. The entitlement may
    /// exceed the shape predicate.
    pub fn reads(self, comps: &[ComponentId]) -> Self {
        for comp in comps {
            self.decl.node.reads.set(comp.index(), true);
        }
        self
    }

    /// Entitles the system to write (and read) the given components.
    pub fn writes(self, comps: &[ComponentId]) -> Self {
        for comp in comps {
            self.decl.node.writes.set(comp.index(), true);
        }
        self
    }

    /// Observes entities currently matching the predicate.
    pub fn current(mut self) -> Self {
        self.spec.current = true;
        self
    }

    /// Observes entities that started matching since the system last ran.
    pub fn added(mut self) -> Self {
        self.spec.added = true;
        self
    }

    /// Observes entities that stopped matching since the system last ran.
    pub fn removed(mut self) -> Self {
        self.spec.removed = true;
        self
    }

    /// Permits reading components whose removal has not been swept yet.
    pub fn access_recently_deleted(mut self) -> Self {
        self.spec.recent = true;
        self
    }

    /// Registers the query and returns its id.
    pub fn build(self) -> QueryId {
        let mut spec = self.spec;
        if !(spec.current || spec.added || spec.removed) {
            spec.current = true;
        }

        let id = QueryId(self.decl.queries.len() as u32);
        self.decl.queries.push(QueryState {
            spec,
            system: self.decl.system,
            members: BitVec::repeat(false, self.decl.max_entities),
            added: Vec::new(),
            removed: Vec::new(),
            run_added: Vec::new(),
            run_removed: Vec::new(),
        });
        self.decl.node.queries.push(id);
        id
    }
}

/// The immutable shape of a query.
pub(crate) struct QuerySpec {
    pub(crate) with:    BitVec,
    pub(crate) without: BitVec,
    pub(crate) current: bool,
    pub(crate) added:   bool,
    pub(crate) removed: bool,
    pub(crate) recent:  bool,
}

impl QuerySpec {
    /// Tests the predicate against an entity stripe, optionally overriding
    /// one component bit (used to evaluate the pre-mutation shape without
    /// copying the stripe).
    pub(crate) fn matches(&self, stripe: &BitSlice, flip: Option<(ComponentId, bool)>) -> bool {
        let test = |index: usize| match flip {
            Some((comp, value)) if comp.index() == index => value,
            _ => stripe[index],
        };
        self.with.iter_ones().all(test) && !self.without.iter_ones().any(test)
    }
}

/// Reactive membership state of one query.
pub(crate) struct QueryState {
    pub(crate) spec:        QuerySpec,
    pub(crate) system:      u32,
    pub(crate) members:     BitVec,
    pub(crate) added:       Vec<Entity>,
    pub(crate) removed:     Vec<Entity>,
    pub(crate) run_added:   Vec<Entity>,
    pub(crate) run_removed: Vec<Entity>,
}

impl QueryState {
    /// Hands accumulated events over to the starting run.
    pub(crate) fn begin_run(&mut self) {
        self.run_added = std::mem::take(&mut self.added);
        self.run_removed = std::mem::take(&mut self.removed);
    }

    /// Records a membership transition. Events are dropped while the owning
    /// system is stopped (`accumulate` false); membership still tracks.
    pub(crate) fn transition(&mut self, entity: Entity, joined: bool, accumulate: bool) {
        self.members.set(entity.index(), joined);
        if !accumulate {
            return;
        }
        if joined {
            if self.spec.added {
                self.added.push(entity);
            }
        } else if self.spec.removed {
            self.removed.push(entity);
        }
    }

    /// Forgets all accumulated events and recomputes nothing; used when the
    /// owning system restarts without backfill.
    pub(crate) fn reset_events(&mut self) {
        self.added.clear();
        self.removed.clear();
        self.run_added.clear();
        self.run_removed.clear();
    }
}

/// The snapshot a system receives for one of its queries.
#[derive(Debug, Default)]
pub struct QueryView {
    /// Entities currently matching the predicate, ascending by id.
    pub current: Vec<Entity>,
    /// Entities that started matching since the system last ran.
    pub added:   Vec<Entity>,
    /// Entities that stopped matching since the system last ran.
    pub removed: Vec<Entity>,
}
