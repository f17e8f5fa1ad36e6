// Wraparound-safe interval math on the port's 32-bit millisecond clock
//
// The clock wraps to zero after u32::MAX. Elapsed time is a plain
// wrapping subtraction, which stays correct across one wrap as long as
// the true elapsed time fits in 32 bits. Capping intervals at a week
// keeps every live interval far inside that window.

/// Largest interval a task may be configured with (one week).
pub const MAX_INTERVAL_MS: u32 = 7 * 24 * 60 * 60 * 1000;

/// Repeating tasks never run with a zero interval; the scan would
/// find them due on every pass.
pub const MIN_REPEAT_INTERVAL_MS: u32 = 1;

/// A start stamp paired with an interval, evaluated against `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub start_ms: u32,
    pub interval_ms: u32,
}

impl Interval {
    pub const fn new(start_ms: u32, interval_ms: u32) -> Self {
        Self {
            start_ms,
            interval_ms,
        }
    }

    #[inline]
    pub const fn elapsed(&self, now_ms: u32) -> u32 {
        now_ms.wrapping_sub(self.start_ms)
    }

    #[inline]
    pub const fn is_expired(&self, now_ms: u32) -> bool {
        self.elapsed(now_ms) >= self.interval_ms
    }

    /// Time left until expiry, 0 once expired.
    #[inline]
    pub const fn remaining(&self, now_ms: u32) -> u32 {
        let elapsed = self.elapsed(now_ms);
        if elapsed < self.interval_ms {
            self.interval_ms - elapsed
        } else {
            0
        }
    }
}

// cap to the supported range; repeating tasks get at least 1ms
pub const fn clamp_interval(interval_ms: u32, repeat: bool) -> u32 {
    let ms = if interval_ms > MAX_INTERVAL_MS {
        MAX_INTERVAL_MS
    } else {
        interval_ms
    };
    if repeat && ms < MIN_REPEAT_INTERVAL_MS {
        MIN_REPEAT_INTERVAL_MS
    } else {
        ms
    }
}
