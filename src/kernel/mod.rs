// Cooperative timed-task scheduler
// Single core, no preemption. Handlers run to completion on the run
// loop; the port's sleep hook idles the CPU between deadlines.
//
// task:      task slots, states, payloads
// timer:     wraparound-safe interval math
// queue:     append-only task queue + nearest-deadline cache
// scheduler: state machine, dispatch round, run loop
// pool:      fixed pool of reusable buffered tasks
// port:      platform hooks (lock, clock, sleep, init/deinit)

pub mod pool;
pub mod port;
pub mod queue;
pub mod scheduler;
pub mod task;
pub mod timer;

#[cfg(test)]
mod mock;

pub use pool::TaskPool;
pub use port::Port;
#[cfg(feature = "std")]
pub use port::StdPort;
pub use scheduler::{Error, RunState, Scheduler};
pub use task::{Handler, Task, TaskId, TaskState};
pub use timer::{Interval, MAX_INTERVAL_MS};
