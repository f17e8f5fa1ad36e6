// pulp-sched: cooperative, interrupt-aware timed-task scheduler for
// small targets that do not need an RTOS.
//
// Tasks live in a caller-owned arena and are addressed by TaskId.
// The run loop dispatches due tasks in registration order and sleeps
// through the port until the nearest deadline.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

pub mod kernel;

pub use kernel::{
    Error, Handler, Interval, MAX_INTERVAL_MS, Port, RunState, Scheduler, Task, TaskId, TaskPool,
    TaskState,
};

#[cfg(feature = "std")]
pub use kernel::StdPort;
