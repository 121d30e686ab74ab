//! Error types for the shoal core.

use crate::scheduler::{BgSignal, TaskId};

/// Top-level error type for the shoal core library.
///
/// Failures of a background task itself are never reported through this
/// type; they travel through [`crate::scheduler::TaskExit`]. These variants
/// describe misuse of the scheduler API or of the configuration layer.
#[derive(Debug, thiserror::Error)]
pub enum ShoalError {
    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The handle does not name a live task (never created, or already freed).
    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    /// The task has already terminated.
    #[error("task {0} has already exited")]
    TaskExited(TaskId),

    /// The task has not terminated yet, so it has no status to collect.
    #[error("task {0} is still active")]
    TaskActive(TaskId),

    /// A daemon-only operation was attempted on a plain task.
    #[error("task {0} is not a daemon")]
    NotADaemon(TaskId),

    /// A work item of the wrong type was enqueued to a daemon.
    #[error("daemon {task} expects items of type {expected}")]
    ItemType {
        /// Daemon the item was offered to.
        task: TaskId,
        /// Item type the daemon was created for.
        expected: &'static str,
    },

    /// The signal cannot carry a user handler.
    #[error("signal {0} cannot be trapped")]
    Untrappable(BgSignal),

    /// A task was described without any processing step.
    #[error("task \"{0}\" has no steps")]
    NoSteps(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, ShoalError>;
