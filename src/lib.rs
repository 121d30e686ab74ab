//! Shoal: core library of a peer-to-peer file-sharing client.
//!
//! The centrepiece is the cooperative background task scheduler in
//! [`scheduler`], which lets CPU and I/O heavy chores run in bounded slices
//! inside a single-threaded, event-driven host without blocking it.

pub mod config;
pub mod error;
pub mod scheduler;

pub use config::{SchedulerConfig, ShoalConfig};
pub use error::{Result, ShoalError};
pub use scheduler::{DaemonSpec, Scheduler, TaskId, TaskSpec};
