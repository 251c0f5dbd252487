//! The world: the unit of isolation holding all entities, components,
//! systems and coroutines, and the frame loop driving them.
//!
//! A world is assembled once through [`Builder`], then driven through
//! [`execute`](World::execute) one frame at a time. Within a frame, systems
//! run in the scheduled order; after each system, its coroutines advance and
//! a *flush* applies deferred mutations (entity deletions, reverse-reference
//! clearing), so every system observes the full effects of the systems
//! before it. The world walks a strict state machine:
//!
//! ```text
//! setup -> initializing -> running <-> quiescent -> finalizing -> done
//! ```
//!
//! A system-body or coroutine error aborts the frame mid-way and poisons the
//! world; only [`terminate`](World::terminate) remains legal afterwards.

use std::collections::BTreeMap;
use std::mem;
use std::time::Instant;

use crate::comp::{ComponentId, FieldKind, Registry, Value};
use crate::coroutine::{self, Coroutine, CoroutineHandle, Engine, Spawn};
use crate::entity::refs::RefGraph;
use crate::entity::shape::ShapeTable;
use crate::entity::{Allocator, Entity};
use crate::error::{CheckError, InternalError, Result};
use crate::scheduler::SimplePlan;
use crate::storage::bind::{CompRead, CompWrite};
use crate::storage::Storage;
use crate::system::query::{QueryId, QueryView};
use crate::system::{Control, Node};

mod builder;
pub use builder::Builder;

#[cfg(test)]
mod tests;

/// Construction options of a world.
#[derive(Debug, Clone)]
pub struct WorldOptions {
    /// Hard upper bound on concurrently live entities.
    pub max_entities:       usize,
    /// Storage strategy for component types that do not pick one.
    pub default_storage:    crate::comp::StorageKind,
    /// Allows entity creation and builds outside the setup state. Meant for
    /// tests; production worlds create entities during setup only.
    pub relax_state_checks: bool,
}

impl Default for WorldOptions {
    fn default() -> Self {
        Self {
            max_entities:       10_000,
            default_storage:    crate::comp::StorageKind::Sparse,
            relax_state_checks: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Setup,
    Initializing,
    Running,
    Quiescent,
    Finalizing,
    Done,
    /// A system or coroutine error aborted a frame mid-way.
    Poisoned,
}

impl State {
    fn name(self) -> &'static str {
        match self {
            Self::Setup => "in setup",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Quiescent => "quiescent",
            Self::Finalizing => "finalizing",
            Self::Done => "done",
            Self::Poisoned => "poisoned by an aborted frame",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Initialize,
    Execute,
    Finalize,
}

/// Who is performing an entity operation; decides entitlement checks.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Access {
    /// Setup-time access through the world itself; unrestricted.
    Free,
    /// A system (by index); restricted to its declared entitlements.
    System(u32),
    /// A validator hook; denied all component access.
    Validator,
}

#[derive(Default)]
struct Clock {
    time:  f64,
    delta: f64,
    last:  Option<Instant>,
}

/// Mutations deferred to the flush, plus the two-frame limbo of removed
/// component slots and retired entity ids backing recently-deleted reads.
#[derive(Default)]
struct Deferred {
    deletions:      Vec<Entity>,
    limbo_current:  Vec<(Entity, ComponentId)>,
    limbo_previous: Vec<(Entity, ComponentId)>,
    dead_current:   Vec<u32>,
    dead_previous:  Vec<u32>,
}

/// The data structure that stores all state of one simulation.
pub struct World {
    pub(crate) options:    WorldOptions,
    pub(crate) state:      State,
    pub(crate) components: Registry,
    pub(crate) storages:   Vec<Storage>,
    pub(crate) shapes:     ShapeTable,
    pub(crate) alloc:      Allocator,
    pub(crate) refs:       RefGraph,
    pub(crate) nodes:      Vec<Node>,
    pub(crate) plans:      BTreeMap<u32, SimplePlan>,
    pub(crate) queries:    Vec<crate::system::query::QueryState>,
    pub(crate) coroutines: Engine,
    clock:                 Clock,
    deferred:              Deferred,
    pending_control:       Control,
    build_log:             Option<Vec<Entity>>,
}

impl World {
    /// Starts a builder with default [`WorldOptions`].
    pub fn builder() -> Builder { Builder::new(WorldOptions::default()) }

    /// Starts a builder with explicit options.
    pub fn builder_with(options: WorldOptions) -> Builder { Builder::new(options) }

    // ---- introspection ----

    /// Current world time in seconds, as accumulated by `execute`.
    pub fn time(&self) -> f64 { self.clock.time }

    /// Delta of the current frame in seconds.
    pub fn delta(&self) -> f64 { self.clock.delta }

    /// Frame counter; zero until the first frame starts.
    pub fn frame(&self) -> u64 { self.coroutines.frame }

    /// Number of live entities.
    pub fn live_entities(&self) -> usize { self.alloc.live_count() }

    /// Resolves a component type by its registered name.
    pub fn component(&self, name: &str) -> Option<ComponentId> {
        self.components.by_name.get(name).copied()
    }

    /// Whether the entity handle refers to a live entity.
    pub fn is_alive(&self, entity: Entity) -> bool { self.alloc.is_alive(entity) }

    // ---- shape queries ----

    /// Whether the entity has the component.
    pub fn has(&self, entity: Entity, comp: ComponentId) -> Result<bool> {
        self.alloc.check(entity)?;
        self.components.check_id(comp)?;
        Ok(self.shapes.has(entity.index(), comp))
    }

    /// Whether the entity has every one of the components.
    pub fn has_all_of(&self, entity: Entity, comps: &[ComponentId]) -> Result<bool> {
        self.alloc.check(entity)?;
        Ok(comps.iter().all(|&comp| self.shapes.has(entity.index(), comp)))
    }

    /// Whether the entity has at least one of the components.
    pub fn has_any_of(&self, entity: Entity, comps: &[ComponentId]) -> Result<bool> {
        self.alloc.check(entity)?;
        Ok(comps.iter().any(|&comp| self.shapes.has(entity.index(), comp)))
    }

    /// Whether the entity has any component other than the given ones.
    pub fn has_any_other_than(&self, entity: Entity, comps: &[ComponentId]) -> Result<bool> {
        self.alloc.check(entity)?;
        Ok(self
            .shapes
            .present(entity.index())
            .any(|comp| !comps.contains(&comp)))
    }

    /// How many of the given components the entity has.
    pub fn count_has(&self, entity: Entity, comps: &[ComponentId]) -> Result<usize> {
        self.alloc.check(entity)?;
        Ok(comps.iter().filter(|&&comp| self.shapes.has(entity.index(), comp)).count())
    }

    pub(crate) fn has_unchecked(&self, entity: Entity, comp: ComponentId) -> bool {
        self.alloc.is_alive(entity) && self.shapes.has(entity.index(), comp)
    }

    // ---- entity lifecycle ----

    /// Creates an entity with the given components, each initialized from
    /// its schema defaults overlaid with the supplied field values.
    ///
    /// Validators run once against the final shape; any failure destroys the
    /// entity again, so it never becomes visible half-built.
    pub fn create_entity(&mut self, comps: &[(ComponentId, &[(&str, Value)])]) -> Result<Entity> {
        self.guard_usable("create an entity")?;
        if self.state != State::Setup && !self.options.relax_state_checks {
            return Err(CheckError::WrongState {
                op:    "create an entity",
                state: self.state.name(),
            }
            .into());
        }
        for (comp, _) in comps {
            self.components.check_id(*comp)?;
        }

        let entity = self.alloc.allocate()?;
        match self.create_inner(entity, comps) {
            Ok(()) => {
                if let Some(log) = &mut self.build_log {
                    log.push(entity);
                }
                self.publish_creation(entity);
                Ok(entity)
            }
            Err(error) => {
                self.hard_destroy(entity);
                Err(error)
            }
        }
    }

    fn create_inner(&mut self, entity: Entity, comps: &[(ComponentId, &[(&str, Value)])]) -> Result<()> {
        for (comp, values) in comps {
            let comp = *comp;
            if self.shapes.has(entity.index(), comp) {
                return Err(CheckError::AlreadyPresent {
                    component: self.components.info(comp).name.clone(),
                    entity,
                }
                .into());
            }

            let slot = {
                let Self { storages, components, .. } = self;
                let info = components.info(comp);
                let storage = &mut storages[comp.index()];
                let slot = storage.acquire(entity.id, info)?;
                storage.init_default(slot, info);
                slot
            };
            self.shapes.set(entity.index(), comp, true);

            if !values.is_empty() {
                let mut view = self.raw_write(entity, comp, slot as usize);
                for (name, value) in *values {
                    view.set(name, *value)?;
                }
            }
        }
        self.run_validators(entity)
    }

    /// A batch of entity creations applied all-or-nothing: if the closure
    /// returns an error, every entity it created is destroyed again.
    pub fn build<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        self.guard_usable("build")?;
        if self.state != State::Setup && !self.options.relax_state_checks {
            return Err(CheckError::WrongState { op: "build", state: self.state.name() }.into());
        }
        if self.build_log.is_some() {
            return Err(CheckError::NestedBuild.into());
        }

        self.build_log = Some(Vec::new());
        let result = f(self);
        let created = self.build_log.take().expect("installed above");

        match result {
            Ok(value) => {
                self.flush()?;
                Ok(value)
            }
            Err(error) => {
                for entity in created.into_iter().rev() {
                    if self.alloc.is_alive(entity) {
                        self.hard_destroy(entity);
                    }
                }
                Err(error)
            }
        }
    }

    /// Marks the entity for destruction at the next flush. The handle goes
    /// stale at that flush; component data stays readable through
    /// recently-deleted access for one more frame.
    pub fn delete(&mut self, entity: Entity) -> Result<()> {
        self.guard_usable("delete an entity")?;
        self.alloc.check(entity)?;
        self.deferred.deletions.push(entity);
        Ok(())
    }

    /// Pins the entity id against recycling after death. Counted; pair with
    /// [`unhold`](Self::unhold).
    pub fn hold(&mut self, entity: Entity) -> Result<()> { Ok(self.alloc.hold(entity)?) }

    /// Releases one hold taken by [`hold`](Self::hold).
    pub fn unhold(&mut self, entity: Entity) { self.alloc.unhold(entity); }

    // ---- setup-time component access ----

    /// Adds a component to the entity. Outside systems this is unrestricted;
    /// from a system context it requires a write entitlement.
    pub fn add(
        &mut self,
        entity: Entity,
        comp: ComponentId,
        values: &[(&str, Value)],
    ) -> Result<()> {
        self.op_add(Access::Free, entity, comp, values)
    }

    /// Removes a component from the entity.
    pub fn remove(&mut self, entity: Entity, comp: ComponentId) -> Result<()> {
        self.op_remove(Access::Free, entity, comp)
    }

    /// Binds a read view of the component.
    pub fn read(&self, entity: Entity, comp: ComponentId) -> Result<CompRead<'_>> {
        self.op_read(Access::Free, entity, comp, false)
    }

    /// Binds a write view of the component.
    pub fn write(&mut self, entity: Entity, comp: ComponentId) -> Result<CompWrite<'_>> {
        self.op_write(Access::Free, entity, comp)
    }

    // ---- frame loop ----

    /// Advances one frame, measuring the delta from a monotonic clock.
    /// The first call also runs every system's `initialize` phase.
    pub fn execute(&mut self) -> Result<()> {
        let now = Instant::now();
        let delta = self.clock.last.map_or(0., |last| now.duration_since(last).as_secs_f64());
        self.clock.last = Some(now);
        let time = self.clock.time + delta;
        self.execute_with(time, delta)
    }

    /// Advances one frame with an explicit time and delta, for deterministic
    /// drivers and tests.
    pub fn execute_with(&mut self, time: f64, delta: f64) -> Result<()> {
        match self.state {
            State::Setup | State::Quiescent => {}
            other => {
                return Err(CheckError::WrongState { op: "execute", state: other.name() }.into())
            }
        }
        if self.state == State::Setup {
            if let Err(error) = self.initialize_world() {
                self.state = State::Poisoned;
                return Err(error);
            }
        }

        self.begin_frame(time, delta);
        // deletions queued between frames apply before the first system
        if let Err(error) = self.flush() {
            self.state = State::Poisoned;
            return Err(error);
        }
        let groups: Vec<u32> = self.plans.keys().copied().collect();
        for group in groups {
            if let Err(error) = self.run_group_phase(group, Phase::Execute) {
                self.state = State::Poisoned;
                return Err(error);
            }
        }
        self.end_frame();
        self.state = State::Quiescent;
        Ok(())
    }

    /// Shuts the world down: runs every system's `finalize` phase in
    /// scheduled order, cancels all coroutines and reaches the terminal
    /// state. Allowed once from any non-terminal state, including a
    /// poisoned one.
    pub fn terminate(&mut self) -> Result<()> {
        if self.state == State::Done {
            return Err(CheckError::WrongState { op: "terminate", state: self.state.name() }.into());
        }
        self.state = State::Finalizing;

        let mut first_error = None;
        let groups: Vec<u32> = self.plans.keys().copied().collect();
        'groups: for group in groups {
            let order = self.plans.get(&group).expect("group key just listed").order.clone();
            for index in order {
                if let Err(error) = self.run_system(index, Phase::Finalize) {
                    first_error = Some(error);
                    break 'groups;
                }
            }
        }

        self.coroutines.cancel_all();
        self.state = State::Done;
        log::trace!("world terminated");
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Queues stop/restart requests, applied at the start of the next frame.
    /// Restarted systems resume without backfilling reactive query events.
    pub fn control(&mut self, control: Control) -> Result<()> {
        self.guard_usable("control systems")?;
        for id in control.stop.iter().chain(&control.restart) {
            if id.index() >= self.nodes.len() {
                return Err(CheckError::UnknownId { what: "system", id: id.0 }.into());
            }
        }
        self.pending_control.stop.extend(control.stop);
        self.pending_control.restart.extend(control.restart);
        Ok(())
    }

    /// Requests cancellation of a coroutine at its next yield point.
    pub fn cancel(&mut self, handle: CoroutineHandle) { self.coroutines.cancel(handle); }

    /// Begins a custom-executed frame over the given groups. Every group of
    /// the world must still be executed periodically, or its reactive query
    /// buffers grow without bound.
    pub fn custom_executor(&mut self, groups: &[u32]) -> Result<Frame<'_>> {
        for &group in groups {
            if !self.plans.contains_key(&group) {
                return Err(CheckError::UnknownId { what: "group", id: group }.into());
            }
        }
        match self.state {
            State::Setup => {
                if let Err(error) = self.initialize_world() {
                    self.state = State::Poisoned;
                    return Err(error);
                }
            }
            State::Quiescent => {}
            other => {
                return Err(CheckError::WrongState {
                    op:    "begin a custom frame",
                    state: other.name(),
                }
                .into())
            }
        }

        let now = Instant::now();
        let delta = self.clock.last.map_or(0., |last| now.duration_since(last).as_secs_f64());
        self.clock.last = Some(now);
        let time = self.clock.time + delta;
        self.begin_frame(time, delta);
        if let Err(error) = self.flush() {
            self.state = State::Poisoned;
            return Err(error);
        }

        Ok(Frame { world: self, groups: groups.to_vec() })
    }

    // ---- frame internals ----

    fn initialize_world(&mut self) -> Result<()> {
        self.state = State::Initializing;
        log::trace!("initializing world");
        self.flush()?;
        let groups: Vec<u32> = self.plans.keys().copied().collect();
        for group in groups {
            self.run_group_phase(group, Phase::Initialize)?;
        }
        self.state = State::Quiescent;
        Ok(())
    }

    fn begin_frame(&mut self, time: f64, delta: f64) {
        self.state = State::Running;
        self.clock.time = time;
        self.clock.delta = delta;
        self.coroutines.begin_frame();

        let control = mem::take(&mut self.pending_control);
        for id in control.stop {
            self.nodes[id.index()].stopped = true;
        }
        for id in control.restart {
            let queries = {
                let node = &mut self.nodes[id.index()];
                if !node.stopped {
                    continue;
                }
                node.stopped = false;
                node.queries.clone()
            };
            for query in queries {
                self.queries[query.index()].reset_events();
            }
        }
    }

    fn run_group_phase(&mut self, group: u32, phase: Phase) -> Result<()> {
        let order = self.plans.get(&group).expect("validated group key").order.clone();
        for index in order {
            self.run_system(index, phase)?;
        }
        Ok(())
    }

    fn run_system(&mut self, index: usize, phase: Phase) -> Result<()> {
        if self.nodes[index].stopped && phase == Phase::Execute {
            return Ok(());
        }

        // only an execute run consumes the accumulated transitions
        if phase == Phase::Execute {
            for query in self.nodes[index].queries.clone() {
                self.queries[query.index()].begin_run();
            }
        }

        let mut instance =
            self.nodes[index].instance.take().expect("system instance in place between phases");
        let system = index as u32;
        let mut cx = SystemContext { world: self, system };
        let result = match phase {
            Phase::Initialize => instance.initialize(&mut cx),
            Phase::Execute => instance.execute(&mut cx),
            Phase::Finalize => instance.finalize(&mut cx),
        };
        self.nodes[index].instance = Some(instance);
        result?;

        coroutine::advance(self, system)?;
        self.flush()
    }

    /// Applies deferred mutations: entity deletions with reverse-reference
    /// clearing. Runs after every system phase and at the end of builds.
    pub(crate) fn flush(&mut self) -> Result<()> {
        let deletions = mem::take(&mut self.deferred.deletions);
        for entity in deletions {
            if !self.alloc.is_alive(entity) {
                continue; // double delete, or deleted earlier in this flush
            }
            self.coroutines.cancel_scoped(entity);

            let present: Vec<ComponentId> = self.shapes.present(entity.index()).collect();
            for comp in &present {
                self.clear_outbound_refs(entity, *comp)?;
                self.deferred.limbo_current.push((entity, *comp));
            }

            for edge in self.refs.take_inbound(entity) {
                let storage = &mut self.storages[edge.comp.index()];
                if let Some(slot) = storage.slot_of(edge.source.id) {
                    storage.columns[edge.field as usize].set_ref(slot as usize, None);
                }
            }

            self.publish_destruction(entity);
            self.shapes.clear_entity(entity.index());
            self.alloc.retire(entity.id);
            self.deferred.dead_current.push(entity.id);
            log::trace!("deleted entity {}", entity.id);
        }

        #[cfg(debug_assertions)]
        self.assert_consistency();
        Ok(())
    }

    fn end_frame(&mut self) {
        for (entity, comp) in mem::take(&mut self.deferred.limbo_previous) {
            if self.alloc.is_alive(entity) && self.shapes.has(entity.index(), comp) {
                continue; // resurrected
            }
            let storage = &mut self.storages[comp.index()];
            if storage.slot_of(entity.id).is_some() {
                let _ = storage.release(entity.id);
            }
        }
        self.deferred.limbo_previous = mem::take(&mut self.deferred.limbo_current);

        for id in mem::take(&mut self.deferred.dead_previous) {
            self.alloc.recycle(id);
        }
        self.deferred.dead_previous = mem::take(&mut self.deferred.dead_current);
    }

    // ---- entity operation internals ----

    fn guard_usable(&self, op: &'static str) -> Result<(), CheckError> {
        match self.state {
            State::Done | State::Poisoned => {
                Err(CheckError::WrongState { op, state: self.state.name() })
            }
            _ => Ok(()),
        }
    }

    fn check_read_entitled(&self, access: Access, comp: ComponentId) -> Result<(), CheckError> {
        match access {
            Access::Free => Ok(()),
            Access::Validator => Err(self.not_entitled("validator", comp, "read")),
            Access::System(system) if self.nodes[system as usize].may_read(comp) => Ok(()),
            Access::System(system) => {
                Err(self.not_entitled(&self.nodes[system as usize].name, comp, "read"))
            }
        }
    }

    fn check_write_entitled(&self, access: Access, comp: ComponentId) -> Result<(), CheckError> {
        match access {
            Access::Free => Ok(()),
            Access::Validator => Err(self.not_entitled("validator", comp, "write")),
            Access::System(system) if self.nodes[system as usize].may_write(comp) => Ok(()),
            Access::System(system) => {
                Err(self.not_entitled(&self.nodes[system as usize].name, comp, "write"))
            }
        }
    }

    fn not_entitled(&self, accessor: &str, comp: ComponentId, access: &'static str) -> CheckError {
        CheckError::NotEntitled {
            accessor:  accessor.to_owned(),
            component: self.components.info(comp).name.clone(),
            access,
        }
    }

    pub(crate) fn op_read(
        &self,
        access: Access,
        entity: Entity,
        comp: ComponentId,
        recent: bool,
    ) -> Result<CompRead<'_>> {
        self.guard_usable("read a component")?;
        self.components.check_id(comp)?;
        self.check_read_entitled(access, comp)?;

        let info = self.components.info(comp);
        let alive = self.alloc.is_alive(entity);

        if alive && self.shapes.has(entity.index(), comp) {
            let storage = &self.storages[comp.index()];
            let slot = storage.slot_of(entity.id).ok_or(InternalError::BindUnacquired {
                component: info.name.clone(),
                entity:    entity.id,
            })?;
            return Ok(CompRead { info, columns: &storage.columns, slot: slot as usize });
        }

        // the slot of a recently removed component stays bound until the
        // end-of-frame sweep after the removal
        if recent && self.in_limbo(entity, comp) {
            let storage = &self.storages[comp.index()];
            if let Some(slot) = storage.slot_of(entity.id) {
                return Ok(CompRead { info, columns: &storage.columns, slot: slot as usize });
            }
        }

        if alive {
            Err(CheckError::NotPresent { component: info.name.clone(), entity }.into())
        } else {
            Err(CheckError::StaleEntity { entity }.into())
        }
    }

    pub(crate) fn op_write(
        &mut self,
        access: Access,
        entity: Entity,
        comp: ComponentId,
    ) -> Result<CompWrite<'_>> {
        self.guard_usable("write a component")?;
        self.components.check_id(comp)?;
        self.check_write_entitled(access, comp)?;
        self.alloc.check(entity)?;
        if !self.shapes.has(entity.index(), comp) {
            return Err(CheckError::NotPresent {
                component: self.components.info(comp).name.clone(),
                entity,
            }
            .into());
        }

        let slot = self.storages[comp.index()].slot_of(entity.id).ok_or(
            InternalError::BindUnacquired {
                component: self.components.info(comp).name.clone(),
                entity:    entity.id,
            },
        )?;
        Ok(self.raw_write(entity, comp, slot as usize))
    }

    /// Builds a write view without checks; callers have validated access,
    /// aliveness and slot.
    fn raw_write(&mut self, entity: Entity, comp: ComponentId, slot: usize) -> CompWrite<'_> {
        let Self { storages, components, refs, alloc, .. } = self;
        let storage = &mut storages[comp.index()];
        CompWrite {
            info: components.info(comp),
            columns: &mut storage.columns,
            slot,
            refs,
            alloc,
            source: entity,
            comp,
        }
    }

    pub(crate) fn op_add(
        &mut self,
        access: Access,
        entity: Entity,
        comp: ComponentId,
        values: &[(&str, Value)],
    ) -> Result<()> {
        self.guard_usable("add a component")?;
        self.components.check_id(comp)?;
        self.check_write_entitled(access, comp)?;
        self.alloc.check(entity)?;
        if self.shapes.has(entity.index(), comp) {
            return Err(CheckError::AlreadyPresent {
                component: self.components.info(comp).name.clone(),
                entity,
            }
            .into());
        }

        // validate the value record up front so failures cannot leave a
        // half-initialized slot behind
        {
            let info = self.components.info(comp);
            for (name, value) in values {
                let def = info.resolve(name)?;
                if def.kind != value.kind() {
                    return Err(CheckError::FieldType {
                        component: info.name.clone(),
                        field:     def.name.clone(),
                        expected:  def.kind.name(),
                        actual:    value.kind().name(),
                    }
                    .into());
                }
                if let Value::Ref(Some(target)) = value {
                    self.alloc.check(*target)?;
                }
            }
        }

        // a slot still in limbo is resurrected with its old field values
        let resurrected = self.take_limbo(entity, comp);
        let slot = match resurrected {
            Some(_) => self.storages[comp.index()].slot_of(entity.id).ok_or(
                InternalError::BindUnacquired {
                    component: self.components.info(comp).name.clone(),
                    entity:    entity.id,
                },
            )?,
            None => {
                let Self { storages, components, .. } = self;
                storages[comp.index()].acquire(entity.id, components.info(comp))?
            }
        };

        self.shapes.set(entity.index(), comp, true);
        if let Err(error) = self.run_validators(entity) {
            self.shapes.set(entity.index(), comp, false);
            match resurrected {
                Some(LimboList::Current) => self.deferred.limbo_current.push((entity, comp)),
                Some(LimboList::Previous) => self.deferred.limbo_previous.push((entity, comp)),
                None => {
                    let _ = self.storages[comp.index()].release(entity.id);
                }
            }
            return Err(error);
        }

        if resurrected.is_none() {
            let Self { storages, components, .. } = self;
            storages[comp.index()].init_default(slot, components.info(comp));
        }
        if !values.is_empty() {
            let mut view = self.raw_write(entity, comp, slot as usize);
            for (name, value) in values {
                view.set(name, *value)?;
            }
        }

        self.publish_shape_change(entity, comp, true);
        Ok(())
    }

    pub(crate) fn op_remove(
        &mut self,
        access: Access,
        entity: Entity,
        comp: ComponentId,
    ) -> Result<()> {
        self.guard_usable("remove a component")?;
        self.components.check_id(comp)?;
        self.check_write_entitled(access, comp)?;
        self.alloc.check(entity)?;
        if !self.shapes.has(entity.index(), comp) {
            return Err(CheckError::NotPresent {
                component: self.components.info(comp).name.clone(),
                entity,
            }
            .into());
        }

        self.shapes.set(entity.index(), comp, false);
        if let Err(error) = self.run_validators(entity) {
            self.shapes.set(entity.index(), comp, true);
            return Err(error);
        }

        self.clear_outbound_refs(entity, comp)?;
        self.deferred.limbo_current.push((entity, comp));
        self.publish_shape_change(entity, comp, false);
        Ok(())
    }

    /// Runs every registered validator against the entity's current shape.
    fn run_validators(&self, entity: Entity) -> Result<()> {
        for comp in self.components.validated_types() {
            let info = self.components.info(comp);
            let validator = info.validator.as_ref().expect("listed as validated");
            let checker = EntityChecker { world: self, entity };
            validator(&checker)?;
        }
        Ok(())
    }

    /// Nulls the ref fields of one component instance, dropping their
    /// reverse edges.
    fn clear_outbound_refs(&mut self, entity: Entity, comp: ComponentId) -> Result<()> {
        let Self { storages, components, refs, .. } = self;
        let info = components.info(comp);
        if info.is_tag() {
            return Ok(());
        }
        let storage = &mut storages[comp.index()];
        let slot = storage.slot_of(entity.id).ok_or(InternalError::BindUnacquired {
            component: info.name.clone(),
            entity:    entity.id,
        })?;

        for field in &info.fields {
            if field.kind != FieldKind::Ref {
                continue;
            }
            let column = &mut storage.columns[field.seq as usize];
            if let Some(target) = column.get_ref(slot as usize) {
                refs.unlink(target, entity, comp, field.seq);
                column.set_ref(slot as usize, None);
            }
        }
        Ok(())
    }

    fn in_limbo(&self, entity: Entity, comp: ComponentId) -> bool {
        let key = (entity, comp);
        self.deferred.limbo_current.contains(&key) || self.deferred.limbo_previous.contains(&key)
    }

    fn take_limbo(&mut self, entity: Entity, comp: ComponentId) -> Option<LimboList> {
        let key = (entity, comp);
        if let Some(position) = self.deferred.limbo_current.iter().position(|k| *k == key) {
            self.deferred.limbo_current.swap_remove(position);
            return Some(LimboList::Current);
        }
        if let Some(position) = self.deferred.limbo_previous.iter().position(|k| *k == key) {
            self.deferred.limbo_previous.swap_remove(position);
            return Some(LimboList::Previous);
        }
        None
    }

    /// Destroys an entity immediately, with no limbo and no deferred sweep.
    /// Used to reject half-built entities.
    fn hard_destroy(&mut self, entity: Entity) {
        let present: Vec<ComponentId> = self.shapes.present(entity.index()).collect();
        for comp in present {
            let _ = self.clear_outbound_refs(entity, comp);
            let _ = self.storages[comp.index()].release(entity.id);
            self.shapes.set(entity.index(), comp, false);
        }

        for edge in self.refs.take_inbound(entity) {
            let storage = &mut self.storages[edge.comp.index()];
            if let Some(slot) = storage.slot_of(edge.source.id) {
                storage.columns[edge.field as usize].set_ref(slot as usize, None);
            }
        }

        for state in &mut self.queries {
            state.members.set(entity.index(), false);
            state.added.retain(|e| *e != entity);
            state.removed.retain(|e| *e != entity);
        }

        self.alloc.retire(entity.id);
        self.alloc.recycle(entity.id);
    }

    // ---- query bookkeeping ----

    fn publish_shape_change(&mut self, entity: Entity, comp: ComponentId, added: bool) {
        let Self { shapes, queries, nodes, .. } = self;
        let stripe = shapes.stripe(entity.index());
        for state in queries.iter_mut() {
            let old = state.spec.matches(stripe, Some((comp, !added)));
            let new = state.spec.matches(stripe, None);
            if old != new {
                let accumulate = !nodes[state.system as usize].stopped;
                state.transition(entity, new, accumulate);
            }
        }
    }

    fn publish_creation(&mut self, entity: Entity) {
        let Self { shapes, queries, nodes, .. } = self;
        let stripe = shapes.stripe(entity.index());
        for state in queries.iter_mut() {
            if state.spec.matches(stripe, None) {
                let accumulate = !nodes[state.system as usize].stopped;
                state.transition(entity, true, accumulate);
            }
        }
    }

    fn publish_destruction(&mut self, entity: Entity) {
        let Self { queries, nodes, .. } = self;
        for state in queries.iter_mut() {
            if state.members[entity.index()] {
                let accumulate = !nodes[state.system as usize].stopped;
                state.transition(entity, false, accumulate);
            }
        }
    }

    pub(crate) fn recent_allowed(&self, system: u32) -> bool {
        self.nodes[system as usize]
            .queries
            .iter()
            .any(|query| self.queries[query.index()].spec.recent)
    }

    #[cfg(debug_assertions)]
    fn assert_consistency(&self) {
        for id in self.alloc.alive_ids() {
            for comp in self.shapes.present(id as usize) {
                assert!(
                    self.storages[comp.index()].slot_of(id).is_some(),
                    "entity {id} has `{}` in its shape but no acquired slot",
                    self.components.info(comp).name,
                );
            }
        }
    }
}

#[derive(Clone, Copy)]
enum LimboList {
    Current,
    Previous,
}

/// The world access a system receives during its phases.
pub struct SystemContext<'w> {
    pub(crate) world:  &'w mut World,
    pub(crate) system: u32,
}

impl SystemContext<'_> {
    fn access(&self) -> Access { Access::System(self.system) }

    /// Current world time in seconds.
    pub fn time(&self) -> f64 { self.world.time() }

    /// Delta of the current frame in seconds.
    pub fn delta(&self) -> f64 { self.world.delta() }

    /// Frame counter.
    pub fn frame(&self) -> u64 { self.world.frame() }

    /// A snapshot of one of this system's queries: current members plus the
    /// added/removed transitions accumulated since the system last ran.
    pub fn query(&self, query: QueryId) -> Result<QueryView> {
        let state = self
            .world
            .queries
            .get(query.index())
            .filter(|state| state.system == self.system)
            .ok_or(CheckError::UnknownId { what: "query", id: query.0 })?;

        let current = if state.spec.current {
            state
                .members
                .iter_ones()
                .map(|index| self.world.alloc.handle(index as u32))
                .collect()
        } else {
            Vec::new()
        };
        Ok(QueryView {
            current,
            added: state.run_added.clone(),
            removed: state.run_removed.clone(),
        })
    }

    /// Whether the entity handle refers to a live entity.
    pub fn is_alive(&self, entity: Entity) -> bool { self.world.is_alive(entity) }

    /// Shape query; see [`World::has`].
    pub fn has(&self, entity: Entity, comp: ComponentId) -> Result<bool> {
        self.world.has(entity, comp)
    }

    /// See [`World::has_all_of`].
    pub fn has_all_of(&self, entity: Entity, comps: &[ComponentId]) -> Result<bool> {
        self.world.has_all_of(entity, comps)
    }

    /// See [`World::has_any_of`].
    pub fn has_any_of(&self, entity: Entity, comps: &[ComponentId]) -> Result<bool> {
        self.world.has_any_of(entity, comps)
    }

    /// See [`World::has_any_other_than`].
    pub fn has_any_other_than(&self, entity: Entity, comps: &[ComponentId]) -> Result<bool> {
        self.world.has_any_other_than(entity, comps)
    }

    /// See [`World::count_has`].
    pub fn count_has(&self, entity: Entity, comps: &[ComponentId]) -> Result<usize> {
        self.world.count_has(entity, comps)
    }

    /// Binds a read view under this system's entitlements. If any of the
    /// system's queries opted into recently-deleted access, removals that
    /// have not been swept yet stay readable.
    pub fn read(&self, entity: Entity, comp: ComponentId) -> Result<CompRead<'_>> {
        let recent = self.world.recent_allowed(self.system);
        self.world.op_read(self.access(), entity, comp, recent)
    }

    /// Binds a write view under this system's entitlements.
    pub fn write(&mut self, entity: Entity, comp: ComponentId) -> Result<CompWrite<'_>> {
        let access = self.access();
        self.world.op_write(access, entity, comp)
    }

    /// Adds a component; requires a write entitlement on the type.
    pub fn add(
        &mut self,
        entity: Entity,
        comp: ComponentId,
        values: &[(&str, Value)],
    ) -> Result<()> {
        let access = self.access();
        self.world.op_add(access, entity, comp, values)
    }

    /// Removes a component; requires a write entitlement on the type.
    pub fn remove(&mut self, entity: Entity, comp: ComponentId) -> Result<()> {
        let access = self.access();
        self.world.op_remove(access, entity, comp)
    }

    /// Marks the entity for destruction at the flush after this system.
    pub fn delete(&mut self, entity: Entity) -> Result<()> { self.world.delete(entity) }

    /// Pins the entity id against recycling; see [`World::hold`].
    pub fn hold(&mut self, entity: Entity) -> Result<()> { self.world.hold(entity) }

    /// Releases one hold; see [`World::unhold`].
    pub fn unhold(&mut self, entity: Entity) { self.world.unhold(entity); }

    /// Starts a coroutine owned by this system. It advances for the first
    /// time in the same pass, right after this phase returns.
    pub fn start<C: Coroutine>(&mut self, co: C) -> Spawn<'_> {
        self.world.coroutines.spawn(
            self.system,
            Box::new(co),
            std::any::TypeId::of::<C>(),
            None,
        )
    }

    /// Requests cancellation of a coroutine at its next yield point.
    pub fn cancel(&mut self, handle: CoroutineHandle) { self.world.coroutines.cancel(handle); }
}

/// The shape-only view validators receive. Component access is denied.
pub struct EntityChecker<'w> {
    pub(crate) world:  &'w World,
    pub(crate) entity: Entity,
}

impl EntityChecker<'_> {
    /// The entity being validated.
    pub fn entity(&self) -> Entity { self.entity }

    /// Whether the entity has the component, post-change.
    pub fn has(&self, comp: ComponentId) -> bool {
        self.world.shapes.has(self.entity.index(), comp)
    }

    /// Whether the entity has every one of the components.
    pub fn has_all_of(&self, comps: &[ComponentId]) -> bool {
        comps.iter().all(|&comp| self.has(comp))
    }

    /// Whether the entity has at least one of the components.
    pub fn has_any_of(&self, comps: &[ComponentId]) -> bool {
        comps.iter().any(|&comp| self.has(comp))
    }

    /// Whether the entity has any component other than the given ones.
    pub fn has_any_other_than(&self, comps: &[ComponentId]) -> bool {
        self.world
            .shapes
            .present(self.entity.index())
            .any(|comp| !comps.contains(&comp))
    }

    /// How many of the given components the entity has.
    pub fn count_has(&self, comps: &[ComponentId]) -> usize {
        comps.iter().filter(|&&comp| self.has(comp)).count()
    }

    /// Always fails: validators hold no entitlements.
    pub fn read(&self, comp: ComponentId) -> Result<CompRead<'_>> {
        self.world.op_read(Access::Validator, self.entity, comp, false)
    }

    /// Always fails: validators hold no entitlements.
    pub fn write(&self, comp: ComponentId) -> Result<()> {
        self.world.check_write_entitled(Access::Validator, comp)?;
        Ok(())
    }
}

/// A frame under external control: executes chosen groups, ends when
/// dropped.
pub struct Frame<'w> {
    world:  &'w mut World,
    groups: Vec<u32>,
}

impl Frame<'_> {
    /// Runs one group's plan, with the usual per-system coroutine
    /// advancement and flushes.
    pub fn execute(&mut self, group: u32) -> Result<()> {
        if !self.groups.contains(&group) {
            return Err(CheckError::UnknownId { what: "group", id: group }.into());
        }
        if self.world.state != State::Running {
            return Err(CheckError::WrongState {
                op:    "execute a custom frame group",
                state: self.world.state.name(),
            }
            .into());
        }
        match self.world.run_group_phase(group, Phase::Execute) {
            Ok(()) => Ok(()),
            Err(error) => {
                self.world.state = State::Poisoned;
                Err(error)
            }
        }
    }
}

impl Drop for Frame<'_> {
    fn drop(&mut self) {
        if self.world.state == State::Running {
            self.world.end_frame();
            self.world.state = State::Quiescent;
        }
    }
}
