// Append-only task queue and nearest-deadline cache
//
// Links are arena indices stored in each task. Appends happen under the
// port lock; walking the list is lock-free since a published link never
// changes until the whole queue is torn down. The cache remembers which
// active task expires first so a quiet tick costs one subtraction.

use core::sync::atomic::{AtomicUsize, Ordering};

use critical_section::CriticalSection;

use super::task::{NIL, Task, TaskState};

pub(crate) struct Queue {
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl Queue {
    pub(crate) const fn new() -> Self {
        Self {
            head: AtomicUsize::new(NIL),
            tail: AtomicUsize::new(NIL),
        }
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == NIL
    }

    // Link `idx` at the tail. Called once per task, inside the lock.
    pub(crate) fn append<P>(&self, _cs: CriticalSection<'_>, tasks: &[Task<'_, P>], idx: usize) {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        debug_assert!(
            (head == NIL) == (tail == NIL),
            "queue corrupt: head={} tail={}",
            head,
            tail
        );

        tasks[idx].next.store(NIL, Ordering::Release);
        if tail == NIL {
            self.head.store(idx, Ordering::Release);
        } else {
            tasks[tail].next.store(idx, Ordering::Release);
        }
        self.tail.store(idx, Ordering::Release);
    }

    pub(crate) fn iter<'a, 'd, P>(&self, tasks: &'a [Task<'d, P>]) -> Iter<'a, 'd, P> {
        Iter {
            tasks,
            cursor: self.head.load(Ordering::Acquire),
        }
    }

    // Unlink everything, resetting each queued task. Returns how many
    // tasks were reset.
    pub(crate) fn clear<P>(&self, cs: CriticalSection<'_>, tasks: &[Task<'_, P>]) -> usize {
        let mut idx = self.head.load(Ordering::Acquire);
        let mut count = 0;
        while idx != NIL {
            let next = tasks[idx].next.load(Ordering::Acquire);
            tasks[idx].reset(cs);
            count += 1;
            idx = next;
        }
        self.head.store(NIL, Ordering::Release);
        self.tail.store(NIL, Ordering::Release);
        count
    }
}

pub(crate) struct Iter<'a, 'd, P> {
    tasks: &'a [Task<'d, P>],
    cursor: usize,
}

impl<'a, 'd, P> Iterator for Iter<'a, 'd, P> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.cursor == NIL {
            return None;
        }
        let idx = self.cursor;
        // read the link before handing the slot out; a handler may run on it
        self.cursor = self.tasks[idx].next.load(Ordering::Acquire);
        Some(idx)
    }
}

pub(crate) struct ExpiryCache {
    next: AtomicUsize,
    // offered while the cache could not vouch for it; folded into the
    // next full scan instead of being trusted on its own
    pending: AtomicUsize,
}

impl ExpiryCache {
    pub(crate) const fn new() -> Self {
        Self {
            next: AtomicUsize::new(NIL),
            pending: AtomicUsize::new(NIL),
        }
    }

    #[inline]
    pub(crate) fn snapshot(&self) -> usize {
        self.next.load(Ordering::Acquire)
    }

    pub(crate) fn clear(&self) {
        self.next.store(NIL, Ordering::Release);
        self.pending.store(NIL, Ordering::Release);
    }

    // Drop the cache if it points at `idx`.
    pub(crate) fn invalidate(&self, _cs: CriticalSection<'_>, idx: usize) {
        if self.next.load(Ordering::Acquire) == idx {
            self.next.store(NIL, Ordering::Release);
        }
    }

    // A task was (re)started. It is only compared against a live cache
    // entry. An empty or stale cache, or the cached task itself moving,
    // drops the cache so the next round rescans.
    pub(crate) fn offer<P>(
        &self,
        _cs: CriticalSection<'_>,
        tasks: &[Task<'_, P>],
        idx: usize,
        now_ms: u32,
    ) {
        let cur = self.next.load(Ordering::Acquire);
        if cur != NIL && cur != idx && armed(&tasks[cur]) {
            if sooner(tasks, idx, cur, now_ms) {
                self.next.store(idx, Ordering::Release);
            }
            return;
        }
        self.next.store(NIL, Ordering::Release);

        // a scan already in flight may have read this task before it was
        // armed; keep the soonest such task for install
        let pending = self.pending.load(Ordering::Acquire);
        if pending == NIL || pending == idx || sooner(tasks, idx, pending, now_ms) {
            self.pending.store(idx, Ordering::Release);
        }
    }

    // Install the result of a full scan. Tasks offered concurrently
    // (interrupt or handler) win if they are still active and sooner.
    // Returns the time left on whatever ends up cached.
    pub(crate) fn install<P>(
        &self,
        _cs: CriticalSection<'_>,
        tasks: &[Task<'_, P>],
        best: Option<usize>,
        now_ms: u32,
    ) -> Option<u32> {
        let mut chosen = best.unwrap_or(NIL);
        for cand in [self.next.load(Ordering::Acquire), self.pending.load(Ordering::Acquire)] {
            if cand == NIL || cand == chosen || tasks[cand].state() != TaskState::Active {
                continue;
            }
            if chosen == NIL || sooner(tasks, cand, chosen, now_ms) {
                chosen = cand;
            }
        }
        self.pending.store(NIL, Ordering::Release);
        self.next.store(chosen, Ordering::Release);
        if chosen == NIL {
            None
        } else {
            Some(tasks[chosen].timing().remaining(now_ms))
        }
    }
}

fn armed<P>(task: &Task<'_, P>) -> bool {
    matches!(task.state(), TaskState::Active | TaskState::Executing)
}

// `a` expires strictly before `b`, or `b` is no longer armed
fn sooner<P>(tasks: &[Task<'_, P>], a: usize, b: usize, now_ms: u32) -> bool {
    if !armed(&tasks[b]) {
        return true;
    }
    tasks[a].timing().remaining(now_ms) < tasks[b].timing().remaining(now_ms)
}
