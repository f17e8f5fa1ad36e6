// Task state machine, dispatch round, and the blocking run loop
//
// Every operation takes &self so handlers and interrupt handlers can
// call back into the scheduler while a round is in progress. A task
// is advanced to Executing/Stopping (and restamped) before its handler
// runs; whatever the handler did to itself is reconciled afterwards.
// Each due task runs at most once per round.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use critical_section::CriticalSection;
use log::{debug, trace};

use super::port::Port;
use super::queue::{ExpiryCache, Queue};
use super::task::{Handler, NIL, Task, TaskId, TaskState};
use super::timer::{MAX_INTERVAL_MS, clamp_interval};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    Stopped = 0,
    Active = 1,
    Stopping = 2,
}

impl RunState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => RunState::Active,
            2 => RunState::Stopping,
            _ => RunState::Stopped,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Stopped => write!(f, "Stopped"),
            RunState::Active => write!(f, "Active"),
            RunState::Stopping => write!(f, "Stopping"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Handle was not handed out by this scheduler
    InvalidTask(TaskId),
    /// Operation not allowed in the task's current state
    InvalidState(TaskState),
    /// Byte copy requested on a task without its own buffer
    NotBuffered,
    /// `init` on a scheduler that is not stopped
    AlreadyRunning,
    /// Dispatch requested before `init`
    NotInitialized,
    /// Dispatch requested from inside a handler
    Busy,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidTask(id) => write!(f, "unknown {}", id),
            Error::InvalidState(state) => write!(f, "not allowed while {}", state),
            Error::NotBuffered => write!(f, "task has no buffer"),
            Error::AlreadyRunning => write!(f, "scheduler already running"),
            Error::NotInitialized => write!(f, "scheduler not initialized"),
            Error::Busy => write!(f, "dispatch already in progress"),
        }
    }
}

pub struct Scheduler<'d, P> {
    port: P,
    tasks: &'d [Task<'d, P>],
    declared: AtomicUsize,
    queue: Queue,
    cache: ExpiryCache,
    run_state: AtomicU8,
    dispatching: AtomicBool,
}

impl<'d, P: Port> Scheduler<'d, P> {
    /// Scheduler over a caller-owned arena of task slots.
    pub const fn new(port: P, tasks: &'d [Task<'d, P>]) -> Self {
        Self {
            port,
            tasks,
            declared: AtomicUsize::new(0),
            queue: Queue::new(),
            cache: ExpiryCache::new(),
            run_state: AtomicU8::new(RunState::Stopped as u8),
            dispatching: AtomicBool::new(false),
        }
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn now_ms(&self) -> u32 {
        self.port.now_ms()
    }

    /// Total arena slots.
    pub fn capacity(&self) -> usize {
        self.tasks.len()
    }

    /// Tasks currently linked into the queue.
    pub fn queued(&self) -> usize {
        self.queue.iter(self.tasks).count()
    }

    /// Task the run loop expects to fire next, when known.
    pub fn next_due(&self) -> Option<TaskId> {
        let idx = self.cache.snapshot();
        (idx != NIL).then_some(TaskId(idx))
    }

    pub fn run_state(&self) -> RunState {
        RunState::from_u8(self.run_state.load(Ordering::Acquire))
    }

    /// Hand out the next unused slot as an `Uninit` task.
    pub fn declare(&self) -> Option<TaskId> {
        self.reserve(1).map(TaskId)
    }

    fn reserve(&self, count: usize) -> Option<usize> {
        self.port.lock(|cs| self.reserve_locked(cs, count))
    }

    // claim `count` consecutive slots, returns the first index
    pub(crate) fn reserve_locked(&self, _cs: CriticalSection<'_>, count: usize) -> Option<usize> {
        let first = self.declared.load(Ordering::Acquire);
        let end = first.checked_add(count)?;
        if end > self.tasks.len() {
            return None;
        }
        self.declared.store(end, Ordering::Release);
        Some(first)
    }

    pub(crate) fn slot(&self, idx: usize) -> &'d Task<'d, P> {
        &self.tasks[idx]
    }

    fn task(&self, id: TaskId) -> Result<&'d Task<'d, P>, Error> {
        if id.0 < self.declared.load(Ordering::Acquire) {
            Ok(&self.tasks[id.0])
        } else {
            Err(Error::InvalidTask(id))
        }
    }

    /// Set handler, interval and repeat mode; the task ends up `Stopped`.
    ///
    /// The first successful call links the task into the queue. Refused
    /// while the task's handler is running.
    pub fn configure(
        &self,
        id: TaskId,
        handler: Handler<'d, P>,
        interval_ms: u32,
        repeat: bool,
    ) -> Result<(), Error> {
        let task = self.task(id)?;
        self.port.lock(|cs| {
            let state = task.state();
            if state.is_dispatching() {
                return Err(Error::InvalidState(state));
            }
            if state == TaskState::Uninit {
                self.queue.append(cs, self.tasks, id.0);
            }
            task.set_handler(cs, handler);
            task.set_interval(clamp_interval(interval_ms, repeat));
            task.set_repeat(repeat);
            task.set_state(TaskState::Stopped);
            self.cache.invalidate(cs, id.0);
            Ok(())
        })
    }

    /// Arm the task from now. Restarting an armed task restamps it;
    /// restarting from inside its own handler cancels a pending stop.
    pub fn start(&self, id: TaskId) -> Result<(), Error> {
        let task = self.task(id)?;
        let next = match task.state() {
            TaskState::Uninit => return Err(Error::InvalidState(TaskState::Uninit)),
            TaskState::Stopped => TaskState::Active,
            TaskState::Stopping => TaskState::Executing,
            state @ (TaskState::Active | TaskState::Executing) => state,
        };
        let now = self.port.now_ms();
        task.restamp(now);
        task.set_state(next);
        self.port.lock(|cs| self.cache.offer(cs, self.tasks, id.0, now));
        Ok(())
    }

    /// Change the interval and restart.
    pub fn update(&self, id: TaskId, interval_ms: u32) -> Result<(), Error> {
        let task = self.task(id)?;
        if task.state() == TaskState::Uninit {
            return Err(Error::InvalidState(TaskState::Uninit));
        }
        task.set_interval(clamp_interval(interval_ms, task.is_repeating()));
        self.start(id)
    }

    /// Disarm the task. Inside its own handler the stop is deferred
    /// until the handler returns.
    pub fn stop(&self, id: TaskId) -> Result<(), Error> {
        let task = self.task(id)?;
        match task.state() {
            TaskState::Uninit => return Err(Error::InvalidState(TaskState::Uninit)),
            TaskState::Active => {
                task.set_state(TaskState::Stopped);
                task.release();
            }
            TaskState::Executing => task.set_state(TaskState::Stopping),
            TaskState::Stopped | TaskState::Stopping => {}
        }
        self.port.lock(|cs| self.cache.invalidate(cs, id.0));
        Ok(())
    }

    /// Attach a payload to a stopped task. Pool tasks copy the bytes
    /// (truncated to their slot size); other tasks keep the reference.
    /// `None` clears the payload.
    pub fn attach_data(&self, id: TaskId, data: Option<&'d [u8]>) -> Result<(), Error> {
        let task = self.task(id)?;
        self.port.lock(|cs| {
            let state = task.state();
            if state != TaskState::Stopped {
                return Err(Error::InvalidState(state));
            }
            task.store(cs, data);
            Ok(())
        })
    }

    /// Copy bytes of any lifetime into a stopped pool task. Returns the
    /// number of bytes kept.
    pub fn write_data(&self, id: TaskId, data: &[u8]) -> Result<usize, Error> {
        let task = self.task(id)?;
        self.port.lock(|cs| {
            let state = task.state();
            if state != TaskState::Stopped {
                return Err(Error::InvalidState(state));
            }
            task.copy_in(cs, data).ok_or(Error::NotBuffered)
        })
    }

    /// Unknown handles read as `Uninit`.
    pub fn state(&self, id: TaskId) -> TaskState {
        self.task(id).map_or(TaskState::Uninit, |task| task.state())
    }

    /// Time since the task was last started.
    pub fn elapsed_ms(&self, id: TaskId) -> u32 {
        match self.task(id) {
            Ok(task) if task.state() != TaskState::Uninit => {
                task.timing().elapsed(self.port.now_ms())
            }
            _ => 0,
        }
    }

    /// Time until the task fires; 0 when due or not armed.
    pub fn remaining_ms(&self, id: TaskId) -> u32 {
        match self.task(id) {
            Ok(task) if matches!(task.state(), TaskState::Active | TaskState::Executing) => {
                task.timing().remaining(self.port.now_ms())
            }
            _ => 0,
        }
    }

    pub fn is_expired(&self, id: TaskId) -> bool {
        match self.task(id) {
            Ok(task) if task.state() == TaskState::Active => {
                task.timing().is_expired(self.port.now_ms())
            }
            _ => false,
        }
    }

    /// Configured interval after clamping.
    pub fn interval_ms(&self, id: TaskId) -> u32 {
        self.task(id).map_or(0, |task| task.timing().interval_ms)
    }

    pub fn is_repeating(&self, id: TaskId) -> bool {
        self.task(id).is_ok_and(|task| task.is_repeating())
    }

    pub fn is_allocated(&self, id: TaskId) -> bool {
        self.task(id).is_ok_and(|task| task.is_allocated())
    }

    pub fn data_len(&self, id: TaskId) -> usize {
        match self.task(id) {
            Ok(task) => self.port.lock(|cs| task.payload(cs).len()),
            Err(_) => 0,
        }
    }

    /// Reset the queue and cache and mark the scheduler active.
    ///
    /// Tasks configured before `init` are reset to `Uninit` and have to
    /// be configured again.
    pub fn init(&self) -> Result<(), Error> {
        if self.run_state() != RunState::Stopped {
            return Err(Error::AlreadyRunning);
        }
        self.port.init();
        self.port.lock(|cs| {
            self.queue.clear(cs, self.tasks);
            self.cache.clear();
        });
        self.run_state.store(RunState::Active as u8, Ordering::Release);
        debug!("scheduler init: {} task slots", self.tasks.len());
        Ok(())
    }

    /// Dispatch rounds until [`shutdown`](Self::shutdown), sleeping
    /// through the port between rounds. On the way out every task is
    /// reset to `Uninit` and the scheduler returns to `Stopped`.
    pub fn run(&self) -> Result<(), Error> {
        if self.run_state() == RunState::Stopped {
            return Err(Error::NotInitialized);
        }
        if self.dispatching.load(Ordering::Acquire) {
            return Err(Error::Busy);
        }

        debug!("scheduler running");
        while self.run_state() == RunState::Active {
            let next = self.round();
            if self.run_state() != RunState::Active {
                break;
            }
            match next {
                Some(0) => {}
                Some(ms) => self.port.sleep(ms),
                None => self.port.sleep(MAX_INTERVAL_MS),
            }
        }
        self.finalize();
        Ok(())
    }

    /// Run a single dispatch round. Returns the time until the next
    /// deadline, or `None` when no task is armed.
    pub fn tick(&self) -> Result<Option<u32>, Error> {
        if self.run_state() != RunState::Active {
            return Err(Error::NotInitialized);
        }
        if self.dispatching.load(Ordering::Acquire) {
            return Err(Error::Busy);
        }
        Ok(self.round())
    }

    /// Ask the run loop to wind down after the current round. Safe from
    /// handlers and interrupts.
    pub fn shutdown(&self) {
        // under the lock so it cannot land after finalize's Stopped
        self.port.lock(|_| {
            if self.run_state() != RunState::Stopped {
                self.run_state.store(RunState::Stopping as u8, Ordering::Release);
            }
        });
    }

    fn round(&self) -> Option<u32> {
        self.dispatching.store(true, Ordering::Release);
        let next = self.service();
        self.dispatching.store(false, Ordering::Release);
        next
    }

    fn service(&self) -> Option<u32> {
        let cached = self.cache.snapshot();
        let mut first = NIL;
        if cached != NIL && self.tasks[cached].state() == TaskState::Active {
            let left = self.tasks[cached].timing().remaining(self.port.now_ms());
            if left > 0 {
                // an interrupt may have retargeted the cache meanwhile
                if self.cache.snapshot() == cached {
                    return Some(left);
                }
            } else {
                self.execute(cached);
                first = cached;
            }
        }

        self.dispatch_due(first);
        self.refresh_cache()
    }

    // run every due task once, in queue order
    fn dispatch_due(&self, skip: usize) {
        for idx in self.queue.iter(self.tasks) {
            if idx == skip {
                continue;
            }
            let task = &self.tasks[idx];
            if task.state() == TaskState::Active && task.timing().is_expired(self.port.now_ms()) {
                self.execute(idx);
            }
        }
    }

    fn refresh_cache(&self) -> Option<u32> {
        let now = self.port.now_ms();
        let mut best: Option<(usize, u32)> = None;
        for idx in self.queue.iter(self.tasks) {
            let task = &self.tasks[idx];
            if task.state() != TaskState::Active {
                continue;
            }
            let left = task.timing().remaining(now);
            if best.is_none_or(|(_, min)| left < min) {
                best = Some((idx, left));
            }
        }
        self.port.lock(|cs| self.cache.install(cs, self.tasks, best.map(|(idx, _)| idx), now))
    }

    fn execute(&self, idx: usize) {
        let task = &self.tasks[idx];
        if task.state() != TaskState::Active {
            return;
        }
        if task.is_repeating() {
            task.restamp(self.port.now_ms());
            task.set_state(TaskState::Executing);
        } else {
            task.set_state(TaskState::Stopping);
        }

        let (handler, payload) = self.port.lock(|cs| (task.handler(cs), task.payload(cs)));
        trace!("dispatch {}", TaskId(idx));
        if let Some(handler) = handler {
            // Safety: payload writes are refused unless the task is
            // Stopped, and it stays Executing/Stopping until we return.
            let data = unsafe { payload.as_slice() };
            handler(self, TaskId(idx), data);
        }

        match task.state() {
            TaskState::Executing => task.set_state(TaskState::Active),
            TaskState::Stopping => {
                task.set_state(TaskState::Stopped);
                task.release();
            }
            _ => {}
        }
    }

    fn finalize(&self) {
        let reset = self.port.lock(|cs| {
            let reset = self.queue.clear(cs, self.tasks);
            let declared = self.declared.load(Ordering::Acquire);
            for task in &self.tasks[..declared] {
                task.release();
            }
            self.cache.clear();
            reset
        });
        self.port.deinit();
        self.port
            .lock(|_| self.run_state.store(RunState::Stopped as u8, Ordering::Release));
        debug!("scheduler stopped: {} tasks reset", reset);
    }
}
