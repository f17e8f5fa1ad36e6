// Platform hooks consumed by the scheduler
//
// Only the clock is mandatory. Locking defaults to the global
// critical-section implementation (interrupts masked on bare metal,
// a process-wide mutex with the `std` feature). Sleep defaults to a
// no-op, which turns the run loop into a busy wait.

use critical_section::CriticalSection;

pub trait Port {
    /// Monotonic millisecond clock; may only decrease by wrapping.
    fn now_ms(&self) -> u32;

    /// Run `f` with the scheduler's concurrent contexts excluded.
    ///
    /// Custom implementations must provide real exclusion against every
    /// context that touches the scheduler before handing out the token.
    fn lock<R>(&self, f: impl FnOnce(CriticalSection<'_>) -> R) -> R {
        critical_section::with(f)
    }

    /// Suspend for up to `interval_ms`. Called with
    /// [`MAX_INTERVAL_MS`](super::timer::MAX_INTERVAL_MS) when no task is
    /// active, which is a good moment for a deeper low-power state.
    fn sleep(&self, _interval_ms: u32) {}

    fn init(&self) {}

    fn deinit(&self) {}
}

impl<T: Port + ?Sized> Port for &T {
    fn now_ms(&self) -> u32 {
        (**self).now_ms()
    }

    fn lock<R>(&self, f: impl FnOnce(CriticalSection<'_>) -> R) -> R {
        (**self).lock(f)
    }

    fn sleep(&self, interval_ms: u32) {
        (**self).sleep(interval_ms)
    }

    fn init(&self) {
        (**self).init()
    }

    fn deinit(&self) {
        (**self).deinit()
    }
}

// Hosted port: Instant-backed clock, thread sleep
#[cfg(feature = "std")]
pub struct StdPort {
    epoch: std::time::Instant,
}

#[cfg(feature = "std")]
impl StdPort {
    pub fn new() -> Self {
        Self {
            epoch: std::time::Instant::now(),
        }
    }
}

#[cfg(feature = "std")]
impl Default for StdPort {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "std")]
impl Port for StdPort {
    fn now_ms(&self) -> u32 {
        // truncation is the wrap
        self.epoch.elapsed().as_millis() as u32
    }

    fn sleep(&self, interval_ms: u32) {
        std::thread::sleep(std::time::Duration::from_millis(interval_ms as u64));
    }
}
