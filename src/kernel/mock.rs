// Deterministic port for tests: manual clock, sleep advances the clock,
// hook counters, and a log handlers can write into.

use core::cell::{Cell, RefCell};
use std::vec::Vec;

use super::port::Port;
use super::task::TaskId;

#[derive(Default)]
pub(crate) struct MockPort {
    now: Cell<u32>,
    pub(crate) inits: Cell<u32>,
    pub(crate) deinits: Cell<u32>,
    sleeps: RefCell<Vec<u32>>,
    runs: RefCell<Vec<(TaskId, u32)>>,
    payloads: RefCell<Vec<Vec<u8>>>,
    // a second task for handlers that act on someone else
    pub(crate) target: Cell<Option<TaskId>>,
    // handler runtime simulated by advancing the clock
    pub(crate) handler_cost_ms: Cell<u32>,
    // handlers call shutdown once this many runs are logged
    pub(crate) stop_after: Cell<Option<usize>>,
}

impl MockPort {
    pub(crate) fn at(now_ms: u32) -> Self {
        let port = Self::default();
        port.now.set(now_ms);
        port
    }

    pub(crate) fn set_now(&self, now_ms: u32) {
        self.now.set(now_ms);
    }

    pub(crate) fn advance(&self, ms: u32) {
        self.now.set(self.now.get().wrapping_add(ms));
    }

    // called by test handlers
    pub(crate) fn record(&self, id: TaskId, data: &[u8]) {
        let now = self.now.get();
        self.runs.borrow_mut().push((id, now));
        self.payloads.borrow_mut().push(data.to_vec());
        self.advance(self.handler_cost_ms.get());
    }

    pub(crate) fn runs(&self) -> Vec<TaskId> {
        self.runs.borrow().iter().map(|(id, _)| *id).collect()
    }

    pub(crate) fn run_times(&self, id: TaskId) -> Vec<u32> {
        self.runs
            .borrow()
            .iter()
            .filter(|(run, _)| *run == id)
            .map(|(_, at)| *at)
            .collect()
    }

    pub(crate) fn count(&self, id: TaskId) -> usize {
        self.runs.borrow().iter().filter(|(run, _)| *run == id).count()
    }

    pub(crate) fn last_payload(&self) -> Option<Vec<u8>> {
        self.payloads.borrow().last().cloned()
    }

    pub(crate) fn sleeps(&self) -> Vec<u32> {
        self.sleeps.borrow().clone()
    }

    pub(crate) fn should_stop(&self) -> bool {
        self.stop_after
            .get()
            .is_some_and(|limit| self.runs.borrow().len() >= limit)
    }
}

impl Port for MockPort {
    fn now_ms(&self) -> u32 {
        self.now.get()
    }

    fn sleep(&self, interval_ms: u32) {
        self.sleeps.borrow_mut().push(interval_ms);
        self.advance(interval_ms);
    }

    fn init(&self) {
        self.inits.set(self.inits.get() + 1);
    }

    fn deinit(&self) {
        self.deinits.set(self.deinits.get() + 1);
    }
}
