// Fixed pool of reusable buffered tasks
//
// N task slots share one N x S byte buffer. The pool reserves its slots
// in the scheduler's arena on the first allocation attempt and gives
// each one its own S-byte segment. A slot is handed back implicitly
// when its task settles in Stopped (see Scheduler::stop and dispatch);
// it stays linked in the queue and is simply reconfigured on reuse.

use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use log::warn;

use super::port::Port;
use super::scheduler::Scheduler;
use super::task::{NIL, Segment, TaskId};

/// `N` tasks with `S` bytes of payload each.
///
/// A pool belongs to the first scheduler it allocates from.
pub struct TaskPool<const N: usize, const S: usize> {
    storage: UnsafeCell<[[u8; S]; N]>,
    // first arena slot owned by the pool, NIL until first use
    first: AtomicUsize,
}

// Safety: the storage is only reached through the segments bound to the
// pool's slots, and every access to a segment follows the slot's state
// rules under the port lock.
unsafe impl<const N: usize, const S: usize> Sync for TaskPool<N, S> {}

impl<const N: usize, const S: usize> Default for TaskPool<N, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize, const S: usize> TaskPool<N, S> {
    pub const fn new() -> Self {
        Self {
            storage: UnsafeCell::new([[0u8; S]; N]),
            first: AtomicUsize::new(NIL),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub const fn slot_size(&self) -> usize {
        S
    }

    pub fn is_initialized(&self) -> bool {
        self.first.load(Ordering::Acquire) != NIL
    }

    /// Claim a free slot. `None` when all slots are taken or the
    /// scheduler's arena has no room left for the pool.
    ///
    /// The returned task keeps its old state: `Uninit` on first use,
    /// `Stopped` when reused. Its payload length is reset to zero.
    pub fn alloc<'d, P: Port>(&'d self, sched: &Scheduler<'d, P>) -> Option<TaskId> {
        let first = self.slots(sched)?;
        for idx in first..first + N {
            let task = sched.slot(idx);
            if task.is_allocated() {
                continue;
            }
            // re-check under the lock; an interrupt may have raced us here
            let claimed = sched.port().lock(|cs| {
                if task.is_allocated() {
                    return false;
                }
                task.set_allocated(true);
                task.clear_data(cs, cfg!(feature = "clear-on-alloc"));
                true
            });
            if claimed {
                return Some(TaskId(idx));
            }
        }
        None
    }

    pub fn allocated<P: Port>(&self, sched: &Scheduler<'_, P>) -> usize {
        self.count(sched, true)
    }

    pub fn free<P: Port>(&self, sched: &Scheduler<'_, P>) -> usize {
        self.count(sched, false)
    }

    fn count<P: Port>(&self, sched: &Scheduler<'_, P>, allocated: bool) -> usize {
        let first = self.first.load(Ordering::Acquire);
        if first == NIL {
            return if allocated { 0 } else { N };
        }
        (first..first + N)
            .filter(|&idx| sched.slot(idx).is_allocated() == allocated)
            .count()
    }

    // lazily reserve and bind the pool's slots
    fn slots<'d, P: Port>(&'d self, sched: &Scheduler<'d, P>) -> Option<usize> {
        let first = self.first.load(Ordering::Acquire);
        if first != NIL {
            return Some(first);
        }

        sched.port().lock(|cs| {
            let first = self.first.load(Ordering::Acquire);
            if first != NIL {
                return Some(first);
            }
            let Some(first) = sched.reserve_locked(cs, N) else {
                warn!("task pool: arena has no room for {} slots", N);
                return None;
            };

            let base = self.storage.get().cast::<u8>();
            for i in 0..N {
                // Safety: `base` comes from a live reference so it is never
                // null, segment i covers bytes [i*S, (i+1)*S) of the storage,
                // segments are disjoint, and the pool is borrowed for 'd.
                let seg = unsafe { Segment::new(NonNull::new_unchecked(base.add(i * S)), S) };
                sched.slot(first + i).bind(cs, seg);
            }
            self.first.store(first, Ordering::Release);
            Some(first)
        })
    }
}
