//! Fixtures shared by the scenario tests.

#![allow(missing_docs)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Once;

use crate::error::Result;
use crate::system::query::Declarations;
use crate::system::System;
use crate::world::SystemContext;

/// Routes `log` output through `env_logger` exactly once per process.
pub(crate) fn init_logger() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Records events and asserts on their final order.
#[derive(Clone, Default)]
pub(crate) struct EventLog(Rc<RefCell<Vec<String>>>);

impl EventLog {
    pub(crate) fn push(&self, event: impl Into<String>) { self.0.borrow_mut().push(event.into()); }

    pub(crate) fn take(&self) -> Vec<String> { std::mem::take(&mut *self.0.borrow_mut()) }

    /// Position of the first occurrence; panics if absent.
    pub(crate) fn position(&self, event: &str) -> usize {
        let events = self.0.borrow();
        events
            .iter()
            .position(|seen| seen == event)
            .unwrap_or_else(|| panic!("event {event:?} not in {events:?}"))
    }
}

/// A shared counter for coroutine tests.
#[derive(Clone, Default)]
pub(crate) struct Counter(Rc<Cell<u32>>);

impl Counter {
    pub(crate) fn bump(&self) { self.0.set(self.0.get() + 1); }

    pub(crate) fn get(&self) -> u32 { self.0.get() }
}

/// A late-bound slot for values only known after world construction, such
/// as component ids captured by validators or entities captured by systems.
pub(crate) struct Shared<T>(Rc<Cell<Option<T>>>);

impl<T> Default for Shared<T> {
    fn default() -> Self { Self(Rc::new(Cell::new(None))) }
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self { Self(Rc::clone(&self.0)) }
}

impl<T: Copy> Shared<T> {
    pub(crate) fn set(&self, value: T) { self.0.set(Some(value)); }

    pub(crate) fn get(&self) -> T { self.0.get().expect("shared value set before use") }

    pub(crate) fn try_get(&self) -> Option<T> { self.0.get() }
}

/// A system assembled from closures, for tests that do not warrant a named
/// system type.
pub(crate) struct ScriptSystem {
    declare: Box<dyn FnMut(&mut Declarations<'_>)>,
    execute: Box<dyn FnMut(&mut SystemContext<'_>) -> Result<()>>,
}

impl ScriptSystem {
    pub(crate) fn new(
        declare: impl FnMut(&mut Declarations<'_>) + 'static,
        execute: impl FnMut(&mut SystemContext<'_>) -> Result<()> + 'static,
    ) -> Self {
        Self { declare: Box::new(declare), execute: Box::new(execute) }
    }

    /// A system that declares nothing and runs the closure every frame.
    pub(crate) fn bare(
        execute: impl FnMut(&mut SystemContext<'_>) -> Result<()> + 'static,
    ) -> Self {
        Self::new(|_| {}, execute)
    }
}

impl System for ScriptSystem {
    fn declare(&mut self, decl: &mut Declarations<'_>) { (self.declare)(decl) }

    fn execute(&mut self, cx: &mut SystemContext<'_>) -> Result<()> { (self.execute)(cx) }
}
