//! Cooperative signals.
//!
//! Signals are delivered in-band: a handler only ever runs while its task is
//! the running task, either at the start of the task's next invocation
//! (queued delivery) or right after the step or handler that raised it.
//! [`BgSignal::Kill`] is never handed to user code; it terminates the task.

use serde::{Deserialize, Serialize};
use std::any::Any;
use tracing::debug;

use super::task::{TaskCore, TaskCx, TaskId};

/// Signals understood by background tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BgSignal {
    /// Not a real signal; probing with it only checks the task is alive.
    Zero,
    /// Untrappable forced termination.
    Kill,
    /// Polite termination request, sent first on cancellation.
    Term,
    /// Application-defined signal.
    Usr,
}

impl BgSignal {
    /// Number of signal kinds.
    pub const COUNT: usize = 4;

    fn index(self) -> usize {
        match self {
            Self::Zero => 0,
            Self::Kill => 1,
            Self::Term => 2,
            Self::Usr => 3,
        }
    }

    /// Whether a user handler may be installed for this signal.
    pub fn is_trappable(self) -> bool {
        matches!(self, Self::Term | Self::Usr)
    }
}

impl std::fmt::Display for BgSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Zero => "ZERO",
            Self::Kill => "KILL",
            Self::Term => "TERM",
            Self::Usr => "USR",
        };
        f.write_str(name)
    }
}

/// Type-erased signal handler. The second argument is the task context.
pub type SignalHandler = Box<dyn FnMut(&mut TaskCx<'_>, &mut dyn Any, BgSignal)>;

/// Handlers installed on one task, indexed by signal kind.
pub(crate) struct SignalTable {
    handlers: [Option<SignalHandler>; BgSignal::COUNT],
}

impl Default for SignalTable {
    fn default() -> Self {
        Self {
            handlers: std::array::from_fn(|_| None),
        }
    }
}

impl SignalTable {
    pub(crate) fn has(&self, sig: BgSignal) -> bool {
        self.handlers[sig.index()].is_some()
    }

    /// Install `handler`, returning the one it replaces.
    pub(crate) fn install(
        &mut self,
        sig: BgSignal,
        handler: SignalHandler,
    ) -> Option<SignalHandler> {
        debug_assert!(sig.is_trappable());
        self.handlers[sig.index()].replace(handler)
    }

    fn get_mut(&mut self, sig: BgSignal) -> Option<&mut SignalHandler> {
        self.handlers[sig.index()].as_mut()
    }
}

/// Deliver `sig` to a running task, inline.
///
/// A trappable signal without a handler is dropped. The handler runs with
/// the task flagged as signaled, so anything it raises is queued behind it
/// instead of nesting.
pub(crate) fn send(
    id: TaskId,
    core: &mut TaskCore,
    context: &mut dyn Any,
    table: &mut SignalTable,
    sig: BgSignal,
) {
    match sig {
        BgSignal::Zero => {}
        BgSignal::Kill => core.request_kill(),
        BgSignal::Term | BgSignal::Usr => {
            let Some(handler) = table.get_mut(sig) else {
                debug!(task = %id, signal = %sig, "no handler installed, signal dropped");
                return;
            };

            debug_assert!(!core.signaled, "nested signal delivery");
            core.signaled = true;
            core.current_signal = Some(sig);
            core.last_signal = Some(sig);

            let ticks = core.timing.ticks;
            let mut cx = TaskCx::new(id, core, ticks);
            handler(&mut cx, context, sig);

            core.signaled = false;
            core.current_signal = None;
        }
    }
}

/// Deliver every queued signal, oldest first.
///
/// Stops as soon as the task asks to exit; whatever is still queued dies
/// with it.
pub(crate) fn deliver_pending(
    id: TaskId,
    core: &mut TaskCore,
    context: &mut dyn Any,
    table: &mut SignalTable,
) {
    while !core.exit_requested {
        let Some(sig) = core.pending.pop_front() else {
            break;
        };
        send(id, core, context, table, sig);
    }
}
