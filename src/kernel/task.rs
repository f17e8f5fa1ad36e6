// Task slots: state, timing, handler, payload, queue link
//
// Runtime fields are atomics written with plain load/store (no RMW;
// riscv32imc has none). Handler and payload are only touched inside
// the port lock. A slot is addressed by its index in the arena that
// the scheduler borrows, so TaskId is just that index.

use core::cell::Cell;
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicUsize, Ordering};

use critical_section::{CriticalSection, Mutex};

use super::scheduler::Scheduler;
use super::timer::Interval;

// end of queue / empty cache
pub(crate) const NIL: usize = usize::MAX;

/// Handle to a task slot in a scheduler's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) usize);

impl TaskId {
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Task lifecycle.
///
/// `Uninit` → `Stopped` (configure) → `Active` (start) → `Executing`
/// (handler running) → `Stopping` (stop requested mid-handler) →
/// `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Uninit = 0,
    Stopped = 1,
    Active = 2,
    Executing = 3,
    Stopping = 4,
}

impl TaskState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => TaskState::Stopped,
            2 => TaskState::Active,
            3 => TaskState::Executing,
            4 => TaskState::Stopping,
            _ => TaskState::Uninit,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            TaskState::Uninit => "Uninit",
            TaskState::Stopped => "Stopped",
            TaskState::Active => "Active",
            TaskState::Executing => "Executing",
            TaskState::Stopping => "Stopping",
        }
    }

    // handler currently on the stack
    pub const fn is_dispatching(self) -> bool {
        matches!(self, TaskState::Executing | TaskState::Stopping)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Task callback: the scheduler, the task's own handle, its payload.
pub type Handler<'d, P> = fn(&Scheduler<'d, P>, TaskId, &[u8]);

// one pool segment, owned by exactly one slot
#[derive(Clone, Copy)]
pub(crate) struct Segment {
    ptr: NonNull<u8>,
    cap: usize,
}

// Safety: a segment is bound to a single task slot and only read or
// written under that slot's state rules (see Task::store).
unsafe impl Send for Segment {}

impl Segment {
    // Safety: `ptr..ptr+cap` must stay valid and exclusively owned by
    // one task slot for as long as that slot can reach it.
    pub(crate) const unsafe fn new(ptr: NonNull<u8>, cap: usize) -> Self {
        Self { ptr, cap }
    }
}

#[derive(Clone, Copy)]
pub(crate) enum Payload<'d> {
    Borrowed(&'d [u8]),
    Buffered { seg: Segment, len: usize },
}

impl<'d> Payload<'d> {
    const EMPTY: Self = Payload::Borrowed(&[]);

    pub(crate) const fn len(&self) -> usize {
        match self {
            Payload::Borrowed(data) => data.len(),
            Payload::Buffered { len, .. } => *len,
        }
    }

    // Safety: for buffered payloads no write to the segment may happen
    // while the returned slice is alive.
    pub(crate) unsafe fn as_slice<'a>(&'a self) -> &'a [u8]
    where
        'd: 'a,
    {
        match self {
            Payload::Borrowed(data) => *data,
            Payload::Buffered { seg, len } => unsafe {
                core::slice::from_raw_parts(seg.ptr.as_ptr(), *len)
            },
        }
    }
}

pub struct Task<'d, P> {
    state: AtomicU8,
    start_ms: AtomicU32,
    interval_ms: AtomicU32,
    repeat: AtomicBool,
    pooled: AtomicBool,
    allocated: AtomicBool,
    pub(crate) next: AtomicUsize,
    handler: Mutex<Cell<Option<Handler<'d, P>>>>,
    payload: Mutex<Cell<Payload<'d>>>,
}

impl<'d, P> Default for Task<'d, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'d, P> Task<'d, P> {
    /// Empty, never configured slot.
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(TaskState::Uninit as u8),
            start_ms: AtomicU32::new(0),
            interval_ms: AtomicU32::new(0),
            repeat: AtomicBool::new(false),
            pooled: AtomicBool::new(false),
            allocated: AtomicBool::new(false),
            next: AtomicUsize::new(NIL),
            handler: Mutex::new(Cell::new(None)),
            payload: Mutex::new(Cell::new(Payload::EMPTY)),
        }
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub(crate) fn timing(&self) -> Interval {
        Interval::new(
            self.start_ms.load(Ordering::Acquire),
            self.interval_ms.load(Ordering::Acquire),
        )
    }

    #[inline]
    pub(crate) fn restamp(&self, now_ms: u32) {
        self.start_ms.store(now_ms, Ordering::Release);
    }

    #[inline]
    pub(crate) fn set_interval(&self, interval_ms: u32) {
        self.interval_ms.store(interval_ms, Ordering::Release);
    }

    #[inline]
    pub fn is_repeating(&self) -> bool {
        self.repeat.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_repeat(&self, repeat: bool) {
        self.repeat.store(repeat, Ordering::Release);
    }

    #[inline]
    pub fn is_pooled(&self) -> bool {
        self.pooled.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_allocated(&self) -> bool {
        self.allocated.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_allocated(&self, allocated: bool) {
        self.allocated.store(allocated, Ordering::Release);
    }

    // pool slots only
    pub(crate) fn release(&self) {
        if self.is_pooled() {
            self.set_allocated(false);
        }
    }

    pub(crate) fn handler(&self, cs: CriticalSection<'_>) -> Option<Handler<'d, P>> {
        self.handler.borrow(cs).get()
    }

    pub(crate) fn set_handler(&self, cs: CriticalSection<'_>, handler: Handler<'d, P>) {
        self.handler.borrow(cs).set(Some(handler));
    }

    pub(crate) fn payload(&self, cs: CriticalSection<'_>) -> Payload<'d> {
        self.payload.borrow(cs).get()
    }

    // turn this slot into a pool slot backed by `seg`
    pub(crate) fn bind(&self, cs: CriticalSection<'_>, seg: Segment) {
        self.payload.borrow(cs).set(Payload::Buffered { seg, len: 0 });
        self.allocated.store(false, Ordering::Release);
        self.pooled.store(true, Ordering::Release);
    }

    // Attach a payload. Buffered slots copy (truncating to capacity),
    // unbuffered slots keep the reference. Caller checks the state.
    pub(crate) fn store(&self, cs: CriticalSection<'_>, data: Option<&'d [u8]>) {
        let cell = self.payload.borrow(cs);
        match cell.get() {
            Payload::Borrowed(_) => cell.set(Payload::Borrowed(data.unwrap_or(&[]))),
            Payload::Buffered { .. } => {
                let _ = self.copy_in(cs, data.unwrap_or(&[]));
            }
        }
    }

    // Copy into the pool segment; None for unbuffered slots.
    pub(crate) fn copy_in(&self, cs: CriticalSection<'_>, data: &[u8]) -> Option<usize> {
        let cell = self.payload.borrow(cs);
        let Payload::Buffered { seg, .. } = cell.get() else {
            return None;
        };
        let len = data.len().min(seg.cap);
        // Safety: the segment belongs to this slot alone. The caller holds
        // the port lock and has checked the slot is not dispatching, so no
        // handler holds a slice into it.
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), seg.ptr.as_ptr(), len);
        }
        cell.set(Payload::Buffered { seg, len });
        Some(len)
    }

    // forget stored bytes; zero them too when `wipe` is set
    pub(crate) fn clear_data(&self, cs: CriticalSection<'_>, wipe: bool) {
        let cell = self.payload.borrow(cs);
        match cell.get() {
            Payload::Borrowed(_) => cell.set(Payload::EMPTY),
            Payload::Buffered { seg, .. } => {
                if wipe {
                    // Safety: see copy_in
                    unsafe {
                        core::ptr::write_bytes(seg.ptr.as_ptr(), 0, seg.cap);
                    }
                }
                cell.set(Payload::Buffered { seg, len: 0 });
            }
        }
    }

    // Back to a never-configured slot. Pool binding survives; the
    // slot is unlinked and released.
    pub(crate) fn reset(&self, cs: CriticalSection<'_>) {
        self.set_state(TaskState::Uninit);
        self.next.store(NIL, Ordering::Release);
        self.handler.borrow(cs).set(None);
        self.start_ms.store(0, Ordering::Release);
        self.interval_ms.store(0, Ordering::Release);
        self.repeat.store(false, Ordering::Release);
        self.allocated.store(false, Ordering::Release);
        self.clear_data(cs, false);
    }
}

impl<'d, P> fmt::Debug for Task<'d, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let timing = self.timing();
        f.debug_struct("Task")
            .field("state", &self.state())
            .field("start_ms", &timing.start_ms)
            .field("interval_ms", &timing.interval_ms)
            .field("repeat", &self.is_repeating())
            .field("pooled", &self.is_pooled())
            .field("allocated", &self.is_allocated())
            .finish()
    }
}
