//! Cooperative background task scheduler.
//!
//! Long-running work (library scans, file hashing, cache rebuilds) is split
//! into *tasks* made of bounded *steps*. The host event loop calls
//! [`Scheduler::tick`] periodically; each pass shares a fixed time budget
//! between the runnable tasks and sizes every step invocation from what a
//! unit of work has cost that task so far. Nothing runs in parallel: a step
//! runs to completion and hands control back by returning.
//!
//! *Daemon* tasks drain a work queue fed through [`Scheduler::enqueue`] and
//! sleep while it is empty.

pub mod daemon;
pub mod driver;
mod queue;
pub mod runner;
pub mod signal;
pub mod task;
pub mod timing;

pub use daemon::{DaemonEvent, DaemonSpec};
pub use driver::drive;
pub use runner::{Scheduler, SchedulerSnapshot, ShutdownReport, TaskInfo, TaskVariant};
pub use signal::BgSignal;
pub use task::{
    ERROR_EXIT_CODE, StepPtr, StepResult, TaskCx, TaskExit, TaskId, TaskSpec, TaskState,
    TaskStatus,
};
pub use timing::{Clock, ManualClock, SystemClock};
