//! Cooperative, frame-aligned coroutines scoped to a system and optionally
//! to an entity.
//!
//! A coroutine is a tagged state machine: each [`resume`](Coroutine::resume)
//! runs until the next suspension point and returns a [`Step`] telling the
//! engine when to resume it. The yield sum type is closed: next frame, a
//! frame count, a duration of world time, a predicate, or another
//! coroutine. All coroutines of a system advance right after that system's
//! `execute` returns, before the next system runs, in the order they were
//! started; a coroutine started during the pass runs to its first yield in
//! the same pass.
//!
//! Cancellation is cooperative and multi-source: an explicit handle cancel,
//! a predicate, deletion of the scoped entity, a missing component on the
//! scoped entity, or a newer coroutine start in the same system. It
//! materializes at the task's next advancement: the awaited chain below the
//! cancelled task drops on the floor and the task resolves to
//! [`Error::Canceled`], which an awaiting parent observes at its next
//! resume. A cancelled top-level coroutine is dropped silently; a top-level
//! user error surfaces from `World::execute` on the frame that would have
//! resumed it.

use std::any::{Any, TypeId};
use std::mem;

use crate::comp::{ComponentId, Value};
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::storage::bind::{CompRead, CompWrite};
use crate::world::{Access, World};

/// The value a coroutine returns on normal completion.
pub type CoroValue = Box<dyn Any>;

/// A predicate evaluated against the world, used by `Until` waits and
/// `cancel_if` conditions.
pub type Predicate = Box<dyn FnMut(&World) -> bool>;

/// What a coroutine asks the engine to do after a resume.
pub enum Step {
    /// Suspend; resume per the wait condition.
    Yield(Waiting),
    /// Complete with a value, delivered to the awaiting parent if any.
    Return(CoroValue),
}

impl Step {
    /// Completes with no interesting value.
    pub fn done() -> Self { Self::Return(Box::new(())) }
}

/// The closed set of resume conditions.
pub enum Waiting {
    /// Resume on the next frame.
    NextFrame,
    /// Resume after this many frame advances.
    Frames(u32),
    /// Resume on the first frame where at least this much world time passed.
    Seconds(f64),
    /// Resume on the first frame after the predicate returns true.
    Until(Predicate),
    /// Resume when that coroutine completes or is cancelled; its outcome is
    /// delivered through [`CoroContext::child_outcome`].
    Child(CoroutineHandle),
}

impl Waiting {
    /// Builds an `Until` wait from a closure.
    pub fn until(pred: impl FnMut(&World) -> bool + 'static) -> Self {
        Self::Until(Box::new(pred))
    }
}

/// A cooperative task. Implementors keep their own resume point and locals.
///
/// Simple coroutines can be written as closures through [`FnCoroutine`];
/// stateful ones implement the trait on their own type.
pub trait Coroutine: 'static {
    /// Runs until the next suspension point.
    fn resume(&mut self, cx: &mut CoroContext<'_>) -> Result<Step>;
}

/// Adapts a closure into a [`Coroutine`]. The closure runs on every resume,
/// so multi-step coroutines keep their resume point in captured state.
pub struct FnCoroutine<F>(
    /// The closure run on each resume.
    pub F,
);

impl<F: FnMut(&mut CoroContext<'_>) -> Result<Step> + 'static> Coroutine for FnCoroutine<F> {
    fn resume(&mut self, cx: &mut CoroContext<'_>) -> Result<Step> { (self.0)(cx) }
}

/// Identifies a started coroutine. Stale handles are inert: cancelling one
/// is a no-op and awaiting one observes [`Error::Canceled`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoroutineHandle {
    pub(crate) index:      u32,
    pub(crate) generation: u32,
}

/// The per-resume context: world access under the owning system's
/// entitlements, plus the delivered child outcome if the coroutine was
/// awaiting one.
pub struct CoroContext<'w> {
    pub(crate) world:   &'w mut World,
    pub(crate) system:  u32,
    pub(crate) task:    CoroutineHandle,
    pub(crate) scope:   Option<Entity>,
    pub(crate) outcome: Option<Result<CoroValue>>,
}

impl CoroContext<'_> {
    fn access(&self) -> Access { Access::System(self.system) }

    /// The entity this coroutine is scoped to, if any.
    pub fn scope(&self) -> Option<Entity> { self.scope }

    /// Takes the outcome of the child this coroutine was awaiting. `Some`
    /// exactly on the resume that follows the child's completion.
    pub fn child_outcome(&mut self) -> Option<Result<CoroValue>> { self.outcome.take() }

    /// Current world time in seconds.
    pub fn time(&self) -> f64 { self.world.time() }

    /// Frame counter.
    pub fn frame(&self) -> u64 { self.world.frame() }

    /// Whether the entity is alive.
    pub fn is_alive(&self, entity: Entity) -> bool { self.world.is_alive(entity) }

    /// Shape query under the system's entitlements; see [`World::has`].
    pub fn has(&self, entity: Entity, comp: ComponentId) -> Result<bool> {
        self.world.has(entity, comp)
    }

    /// Binds a read view under the system's entitlements.
    pub fn read(&self, entity: Entity, comp: ComponentId) -> Result<CompRead<'_>> {
        self.world.op_read(self.access(), entity, comp, false)
    }

    /// Binds a write view under the system's entitlements.
    pub fn write(&mut self, entity: Entity, comp: ComponentId) -> Result<CompWrite<'_>> {
        let access = self.access();
        self.world.op_write(access, entity, comp)
    }

    /// Adds a component; see [`World::add`].
    pub fn add(
        &mut self,
        entity: Entity,
        comp: ComponentId,
        values: &[(&str, Value)],
    ) -> Result<()> {
        let access = self.access();
        self.world.op_add(access, entity, comp, values)
    }

    /// Removes a component; see [`World::remove`].
    pub fn remove(&mut self, entity: Entity, comp: ComponentId) -> Result<()> {
        let access = self.access();
        self.world.op_remove(access, entity, comp)
    }

    /// Marks an entity for deletion at the next flush.
    pub fn delete(&mut self, entity: Entity) -> Result<()> { self.world.delete(entity) }

    /// Starts a sibling coroutine in the same system.
    pub fn start<C: Coroutine>(&mut self, co: C) -> Spawn<'_> {
        let spawner = Some(self.task.index);
        self.world.coroutines.spawn(self.system, Box::new(co), TypeId::of::<C>(), spawner)
    }

    /// Requests cancellation of a coroutine at its next yield point.
    pub fn cancel(&mut self, handle: CoroutineHandle) { self.world.coroutines.cancel(handle); }
}

/// Configures a freshly started coroutine; drop it or call
/// [`handle`](Self::handle) when done.
pub struct Spawn<'a> {
    engine: &'a mut Engine,
    task:   CoroutineHandle,
}

impl Spawn<'_> {
    /// Scopes the coroutine to an entity: deletion of the entity cancels it.
    pub fn scope(self, entity: Entity) -> Self {
        if let Some(task) = self.engine.task_mut(self.task) {
            task.scope = Some(entity);
        }
        if let Some(record) =
            self.engine.starts.iter_mut().rev().find(|record| record.task == self.task.index)
        {
            record.scope = Some(entity);
        }
        self
    }

    /// Cancels the coroutine when the predicate turns true at a yield point.
    pub fn cancel_if(self, pred: impl FnMut(&World) -> bool + 'static) -> Self {
        if let Some(task) = self.engine.task_mut(self.task) {
            task.cancel_preds.push(Box::new(pred));
        }
        self
    }

    /// Cancels the coroutine when the scoped entity loses the component.
    pub fn cancel_if_component_missing(self, comp: ComponentId) -> Self {
        if let Some(task) = self.engine.task_mut(self.task) {
            task.cancel_missing.push(comp);
        }
        self
    }

    /// Cancels the coroutine when another coroutine of type `C` with the
    /// same scope starts in the same system. The coroutine never cancels
    /// itself through this rule, nor through coroutines it starts itself.
    pub fn cancel_if_coroutine_started<C: Coroutine>(self) -> Self {
        if let Some(task) = self.engine.task_mut(self.task) {
            task.cancel_started = Some(Some(TypeId::of::<C>()));
        }
        self
    }

    /// Like [`cancel_if_coroutine_started`](Self::cancel_if_coroutine_started)
    /// but matching any coroutine type.
    pub fn cancel_if_any_coroutine_started(self) -> Self {
        if let Some(task) = self.engine.task_mut(self.task) {
            task.cancel_started = Some(None);
        }
        self
    }

    /// The handle of the started coroutine.
    pub fn handle(&self) -> CoroutineHandle { self.task }
}

/// One coroutine start, remembered for the started-since cancellation rule.
struct StartRecord {
    seq:     u64,
    system:  u32,
    type_id: TypeId,
    scope:   Option<Entity>,
    task:    u32,
    spawner: Option<u32>,
}

/// Internal wait state, with conditions resolved to absolutes at yield time.
enum Wait {
    Frame { target: u64 },
    Seconds { since: f64, duration: f64 },
    Until(Predicate),
    Child,
}

enum TaskState {
    /// Run at the next advancement opportunity.
    Ready,
    Waiting(Wait),
}

pub(crate) struct Task {
    generation:     u32,
    system:         u32,
    /// Taken out during resume so the engine stays borrowable.
    co:             Option<Box<dyn Coroutine>>,
    scope:          Option<Entity>,
    cancel_preds:   Vec<Predicate>,
    cancel_missing: Vec<ComponentId>,
    /// `Some(None)` cancels on any start, `Some(Some(t))` on starts of `t`.
    cancel_started: Option<Option<TypeId>>,
    started_check:  u64,
    state:          TaskState,
    canceled:       bool,
    /// The parent awaiting this task, if any.
    awaiting:       Option<CoroutineHandle>,
    /// The child this task awaits, if any.
    awaited:        Option<CoroutineHandle>,
    pending:        Option<Result<CoroValue>>,
    suspended_pass: u64,
}

/// The per-world coroutine engine.
pub(crate) struct Engine {
    tasks:            Vec<Option<Task>>,
    generations:      Vec<u32>,
    free:             Vec<u32>,
    /// Task handles per system, in start order.
    order:            Vec<Vec<CoroutineHandle>>,
    starts:           Vec<StartRecord>,
    next_seq:         u64,
    /// Sequence floors of the current and previous frame, bounding the
    /// retained start log.
    frame_seqs:       (u64, u64),
    pub(crate) frame: u64,
    pass:             u64,
    errors:           Vec<Error>,
}

impl Engine {
    pub(crate) fn new(num_systems: usize) -> Self {
        Self {
            tasks:       Vec::new(),
            generations: Vec::new(),
            free:        Vec::new(),
            order:       vec![Vec::new(); num_systems],
            starts:      Vec::new(),
            next_seq:    0,
            frame_seqs:  (0, 0),
            frame:       0,
            pass:        0,
            errors:      Vec::new(),
        }
    }

    pub(crate) fn spawn(
        &mut self,
        system: u32,
        co: Box<dyn Coroutine>,
        type_id: TypeId,
        spawner: Option<u32>,
    ) -> Spawn<'_> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.tasks.push(None);
                self.generations.push(0);
                (self.tasks.len() - 1) as u32
            }
        };
        let generation = self.generations[index as usize];
        let handle = CoroutineHandle { index, generation };

        let seq = self.next_seq;
        self.next_seq += 1;

        self.tasks[index as usize] = Some(Task {
            generation,
            system,
            co: Some(co),
            scope: None,
            cancel_preds: Vec::new(),
            cancel_missing: Vec::new(),
            cancel_started: None,
            started_check: seq,
            state: TaskState::Ready,
            canceled: false,
            awaiting: None,
            awaited: None,
            pending: None,
            suspended_pass: 0,
        });
        self.starts.push(StartRecord { seq, system, type_id, scope: None, task: index, spawner });
        self.order[system as usize].push(handle);

        Spawn { engine: self, task: handle }
    }

    fn task(&self, handle: CoroutineHandle) -> Option<&Task> {
        self.tasks
            .get(handle.index as usize)?
            .as_ref()
            .filter(|task| task.generation == handle.generation)
    }

    fn task_mut(&mut self, handle: CoroutineHandle) -> Option<&mut Task> {
        self.tasks
            .get_mut(handle.index as usize)?
            .as_mut()
            .filter(|task| task.generation == handle.generation)
    }

    fn remove(&mut self, handle: CoroutineHandle) -> Option<Task> {
        let slot = self.tasks.get_mut(handle.index as usize)?;
        if slot.as_ref().is_some_and(|task| task.generation == handle.generation) {
            self.generations[handle.index as usize] += 1;
            self.free.push(handle.index);
            slot.take()
        } else {
            None
        }
    }

    /// Marks a task for cancellation at its next advancement. Stale handles
    /// are ignored.
    pub(crate) fn cancel(&mut self, handle: CoroutineHandle) {
        if let Some(task) = self.task_mut(handle) {
            task.canceled = true;
        }
    }

    /// Cancels every task scoped to the entity; called when it is deleted.
    pub(crate) fn cancel_scoped(&mut self, entity: Entity) {
        for task in self.tasks.iter_mut().flatten() {
            if task.scope == Some(entity) {
                task.canceled = true;
            }
        }
    }

    /// Drops everything; called on terminate.
    pub(crate) fn cancel_all(&mut self) {
        for slot in &mut self.tasks {
            *slot = None;
        }
        for generation in &mut self.generations {
            *generation += 1;
        }
        self.free = (0..self.tasks.len() as u32).rev().collect();
        for order in &mut self.order {
            order.clear();
        }
        self.starts.clear();
    }

    /// Whether any task is live. Used by tests and the terminate path.
    pub(crate) fn live_count(&self) -> usize {
        self.tasks.iter().filter(|slot| slot.is_some()).count()
    }

    /// Advances the frame counter, prunes the start log down to the current
    /// and previous frame, and drops stale order entries.
    pub(crate) fn begin_frame(&mut self) {
        self.frame += 1;
        let floor = self.frame_seqs.1;
        self.starts.retain(|record| record.seq >= floor);
        self.frame_seqs = (self.next_seq, self.frame_seqs.0);

        let tasks = &self.tasks;
        for order in &mut self.order {
            order.retain(|&handle| {
                tasks[handle.index as usize]
                    .as_ref()
                    .is_some_and(|task| task.generation == handle.generation)
            });
        }
    }

    fn matching_start(&self, handle: CoroutineHandle, task: &Task) -> bool {
        let Some(filter) = task.cancel_started else { return false };
        self.starts.iter().any(|record| {
            record.seq >= task.started_check
                && record.system == task.system
                && record.task != handle.index
                && record.spawner != Some(handle.index)
                && record.scope == task.scope
                && filter.map_or(true, |type_id| record.type_id == type_id)
        })
    }
}

/// Advances all coroutines of one system by one pass.
///
/// Returns the first user error raised by a top-level coroutine, poisoning
/// the frame like a system-body error would.
pub(crate) fn advance(world: &mut World, system: u32) -> Result<()> {
    world.coroutines.pass += 1;
    let pass = world.coroutines.pass;

    let mut index = 0;
    loop {
        let Some(&handle) = world.coroutines.order[system as usize].get(index) else { break };
        index += 1;
        step_task(world, handle, pass);
    }

    if world.coroutines.errors.is_empty() {
        Ok(())
    } else {
        let error = world.coroutines.errors.remove(0);
        for extra in world.coroutines.errors.drain(..) {
            log::error!("additional coroutine error dropped: {extra}");
        }
        Err(error)
    }
}

fn step_task(world: &mut World, handle: CoroutineHandle, pass: u64) {
    let frame = world.coroutines.frame;
    let time = world.time();

    // cancellation sources, checked before any resume
    let mut cancel = {
        let Some(task) = world.coroutines.task(handle) else { return };
        if task.suspended_pass == pass {
            return; // yielded earlier in this very pass
        }

        let mut cancel = task.canceled;
        if !cancel {
            if let Some(scope) = task.scope {
                if !world.is_alive(scope) {
                    cancel = true;
                } else {
                    cancel = task
                        .cancel_missing
                        .iter()
                        .any(|&comp| !world.has_unchecked(scope, comp));
                }
            }
        }
        if !cancel {
            cancel = world.coroutines.matching_start(handle, task);
        }
        cancel
    };

    {
        let next_seq = world.coroutines.next_seq;
        if let Some(task) = world.coroutines.task_mut(handle) {
            task.started_check = next_seq;
        }
    }

    if !cancel {
        // user predicates are taken out so they can observe the world
        let mut preds = match world.coroutines.task_mut(handle) {
            Some(task) => mem::take(&mut task.cancel_preds),
            None => return,
        };
        cancel = preds.iter_mut().any(|pred| pred(world));
        if let Some(task) = world.coroutines.task_mut(handle) {
            task.cancel_preds = preds;
        }
    }

    if cancel {
        cancel_tree(world, handle);
        return;
    }

    // wait evaluation; the state is taken out so `Until` can observe the world
    let state = {
        let Some(task) = world.coroutines.task_mut(handle) else { return };
        mem::replace(&mut task.state, TaskState::Ready)
    };
    let ready = match state {
        TaskState::Ready => true,
        TaskState::Waiting(wait) => {
            let (fire, wait) = match wait {
                Wait::Frame { target } => (frame >= target, Wait::Frame { target }),
                Wait::Seconds { since, duration } => {
                    (time - since >= duration, Wait::Seconds { since, duration })
                }
                Wait::Until(mut pred) => {
                    let fire = pred(world);
                    (fire, Wait::Until(pred))
                }
                // resumed through outcome delivery, never by polling
                Wait::Child => (false, Wait::Child),
            };
            if !fire {
                if let Some(task) = world.coroutines.task_mut(handle) {
                    task.state = TaskState::Waiting(wait);
                }
            }
            fire
        }
    };

    if ready {
        resume(world, handle, pass);
    }
}

fn resume(world: &mut World, handle: CoroutineHandle, pass: u64) {
    let (mut co, outcome, scope, system) = {
        let Some(task) = world.coroutines.task_mut(handle) else { return };
        (
            task.co.take().expect("task resumed while already running"),
            task.pending.take(),
            task.scope,
            task.system,
        )
    };

    let mut cx = CoroContext { world: &mut *world, system, task: handle, scope, outcome };
    let result = co.resume(&mut cx);

    if let Some(task) = world.coroutines.task_mut(handle) {
        task.co = Some(co);
        task.suspended_pass = pass;
    }

    match result {
        Ok(Step::Yield(waiting)) => install_wait(world, handle, waiting),
        Ok(Step::Return(value)) => complete(world, handle, Ok(value)),
        Err(error) => complete(world, handle, Err(error)),
    }
}

fn install_wait(world: &mut World, handle: CoroutineHandle, waiting: Waiting) {
    let frame = world.coroutines.frame;
    let time = world.time();

    let wait = match waiting {
        Waiting::NextFrame => Wait::Frame { target: frame + 1 },
        Waiting::Frames(count) => Wait::Frame { target: frame + u64::from(count.max(1)) },
        Waiting::Seconds(duration) => Wait::Seconds { since: time, duration },
        Waiting::Until(pred) => Wait::Until(pred),
        Waiting::Child(child) => {
            let valid = child != handle && world.coroutines.task(child).is_some();
            if valid {
                if let Some(child_task) = world.coroutines.task_mut(child) {
                    child_task.awaiting = Some(handle);
                }
                if let Some(task) = world.coroutines.task_mut(handle) {
                    task.awaited = Some(child);
                    task.state = TaskState::Waiting(Wait::Child);
                }
            } else if let Some(task) = world.coroutines.task_mut(handle) {
                // the child is already gone; observe a cancellation
                task.pending = Some(Err(Error::Canceled));
                task.state = TaskState::Ready;
            }
            return;
        }
    };

    if let Some(task) = world.coroutines.task_mut(handle) {
        task.state = TaskState::Waiting(wait);
    }
}

fn complete(world: &mut World, handle: CoroutineHandle, outcome: Result<CoroValue>) {
    let Some(task) = world.coroutines.remove(handle) else { return };

    let unobserved = match task.awaiting {
        Some(parent) => match world.coroutines.task_mut(parent) {
            Some(parent_task) => {
                parent_task.pending = Some(outcome);
                parent_task.state = TaskState::Ready;
                parent_task.awaited = None;
                None
            }
            None => Some(outcome),
        },
        None => Some(outcome),
    };

    if let Some(Err(error)) = unobserved {
        if !error.is_canceled() {
            world.coroutines.errors.push(error);
        }
    }
}

/// Cancels the awaited chain below the task, then resolves the task itself
/// to [`Error::Canceled`], delivering it to an awaiting parent if any.
fn cancel_tree(world: &mut World, handle: CoroutineHandle) {
    let mut chain = vec![handle];
    loop {
        let next = world
            .coroutines
            .task(*chain.last().expect("chain starts nonempty"))
            .and_then(|task| task.awaited);
        match next {
            Some(child) if !chain.contains(&child) => chain.push(child),
            _ => break,
        }
    }
    // descendants drop on the floor without further observation
    for &descendant in chain.iter().skip(1).rev() {
        world.coroutines.remove(descendant);
    }
    complete(world, handle, Err(Error::Canceled));
}
