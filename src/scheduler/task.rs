//! Task records and the step execution protocol.
//!
//! A task is a named program of *steps*. Each time the scheduler elects the
//! task it runs the current step once, handing it a tick allotment; the
//! step does that much work and answers with a [`StepResult`] telling the
//! scheduler whether to call it again, move to the next step, or stop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::VecDeque;
use std::marker::PhantomData;
use tracing::warn;

use super::daemon::Daemon;
use super::signal::{self, BgSignal, SignalHandler, SignalTable};
use super::timing::Timing;

/// Exit code recorded when a step answers [`StepResult::Error`].
pub const ERROR_EXIT_CODE: i32 = -1;

/// Opaque handle naming a task within one [`super::Scheduler`].
///
/// Handles are never reused by the scheduler that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(u64);

impl TaskId {
    /// Build a handle from its raw value.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw value of the handle.
    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Scheduling state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting in the run queue.
    Runnable,
    /// Executing right now. At most one task is ever in this state.
    Running,
    /// Daemon with an empty work queue, parked in the sleep queue.
    Sleeping,
    /// Terminated, waiting to be reclaimed (or collected, for zombies).
    Exited,
}

/// What a step asks the scheduler to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// All work is finished.
    Done,
    /// This step is finished; continue with the next one (or finish, if it
    /// was the last).
    Next,
    /// Call this step again on the next turn.
    More,
    /// Unrecoverable failure; the task terminates with [`ERROR_EXIT_CODE`].
    Error,
}

/// Classified outcome of a terminated task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Finished with exit code 0.
    Success,
    /// Finished with a non-zero exit code.
    Error,
    /// Terminated by [`BgSignal::Kill`].
    Killed,
}

/// Final result of a task, handed to its completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskExit {
    /// Classified status.
    pub status: TaskStatus,
    /// Exit code (0 unless set by `exit` or an `Error` return).
    pub exit_code: i32,
    /// Last signal delivered to the task, if any.
    pub signal: Option<BgSignal>,
}

pub(crate) type StepFn = Box<dyn FnMut(&mut TaskCx<'_>, &mut dyn Any, u32) -> StepResult>;
pub(crate) type DoneFn = Box<dyn FnOnce(TaskId, &mut dyn Any, &TaskExit)>;
pub(crate) type DestructorFn = Box<dyn FnOnce(Box<dyn Any>)>;

/// Plain function step, for building step tables that
/// [`TaskSpec::steps`] copies.
pub type StepPtr<C> = fn(&mut TaskCx<'_>, &mut C, u32) -> StepResult;

/// Scheduler-owned bookkeeping of one task.
pub(crate) struct TaskCore {
    pub(crate) name: String,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) state: TaskState,
    /// State the task was in before it was last resumed.
    pub(crate) resumed_from: TaskState,
    pub(crate) zombie: bool,
    /// Skip tick-cost learning when the current invocation is suspended.
    pub(crate) no_tick: bool,
    /// Inside a signal handler.
    pub(crate) signaled: bool,
    pub(crate) step: usize,
    pub(crate) seqno: u32,
    pub(crate) exit_code: i32,
    pub(crate) exit_requested: bool,
    pub(crate) killed: bool,
    pub(crate) last_signal: Option<BgSignal>,
    pub(crate) current_signal: Option<BgSignal>,
    pub(crate) pending: VecDeque<BgSignal>,
    pub(crate) timing: Timing,
}

impl TaskCore {
    pub(crate) fn new(name: String, state: TaskState) -> Self {
        Self {
            name,
            created_at: Utc::now(),
            state,
            resumed_from: state,
            zombie: false,
            no_tick: false,
            signaled: false,
            step: 0,
            seqno: 0,
            exit_code: 0,
            exit_requested: false,
            killed: false,
            last_signal: None,
            current_signal: None,
            pending: VecDeque::new(),
            timing: Timing::default(),
        }
    }

    pub(crate) fn request_exit(&mut self, code: i32) {
        self.exit_code = code;
        self.exit_requested = true;
    }

    pub(crate) fn request_kill(&mut self) {
        self.killed = true;
        self.last_signal = Some(BgSignal::Kill);
        self.exit_requested = true;
    }

    /// Rewind to the first step with no cost estimate.
    pub(crate) fn rewind(&mut self) {
        self.step = 0;
        self.seqno = 0;
        self.timing.forget_cost();
    }

    pub(crate) fn exit_info(&self) -> TaskExit {
        let status = if self.killed {
            TaskStatus::Killed
        } else if self.exit_code != 0 {
            TaskStatus::Error
        } else {
            TaskStatus::Success
        };
        TaskExit {
            status,
            exit_code: self.exit_code,
            signal: self.last_signal,
        }
    }
}

/// View of its own task handed to a step, item-start callback or signal
/// handler.
pub struct TaskCx<'a> {
    id: TaskId,
    core: &'a mut TaskCore,
    ticks: u32,
}

impl<'a> TaskCx<'a> {
    pub(crate) fn new(id: TaskId, core: &'a mut TaskCore, ticks: u32) -> Self {
        Self { id, core, ticks }
    }

    /// Handle of the task.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Task name.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Index of the current step.
    pub fn step(&self) -> usize {
        self.core.step
    }

    /// Number of earlier invocations of the current step.
    pub fn seqno(&self) -> u32 {
        self.core.seqno
    }

    /// Ticks granted to this invocation.
    pub fn ticks(&self) -> u32 {
        self.ticks
    }

    /// Signal being handled, when called from a signal handler.
    pub fn signal(&self) -> Option<BgSignal> {
        self.core.current_signal
    }

    /// Report that only `used` of the granted ticks were consumed.
    ///
    /// The measured time would understate the true per-tick cost, so the
    /// invocation is kept out of cost learning when `used` is below the
    /// grant. Values above the grant are clamped to it.
    pub fn ticks_used(&mut self, used: u32) {
        let granted = self.core.timing.ticks;
        if used > granted {
            warn!(
                task = %self.id,
                used,
                granted,
                "task reported more ticks than granted"
            );
        }
        let used = used.min(granted);
        self.core.timing.ticks_used = used;
        if used < granted {
            self.core.no_tick = true;
        }
    }

    /// Terminate the task with `code` once control is back in the scheduler.
    ///
    /// Return the result straight away: nothing after the call runs under
    /// the scheduler's supervision, and whatever the step returns instead
    /// is ignored.
    pub fn exit(&mut self, code: i32) -> StepResult {
        self.core.request_exit(code);
        StepResult::Done
    }

    /// Send `sig` to this task.
    ///
    /// [`BgSignal::Kill`] terminates the task when control returns to the
    /// scheduler. Other signals are queued and handed to their handler
    /// before that, in the same invocation.
    pub fn raise(&mut self, sig: BgSignal) {
        match sig {
            BgSignal::Zero => {}
            BgSignal::Kill => self.core.request_kill(),
            BgSignal::Term | BgSignal::Usr => self.core.pending.push_back(sig),
        }
    }
}

pub(crate) enum TaskKind {
    Plain { on_done: Option<DoneFn> },
    Daemon(Daemon),
}

/// Outcome of one invocation, as seen by the scheduler.
pub(crate) enum Slice {
    Returned(StepResult),
    Exited,
}

pub(crate) struct Task {
    pub(crate) id: TaskId,
    pub(crate) core: TaskCore,
    pub(crate) context: Option<Box<dyn Any>>,
    pub(crate) destructor: Option<DestructorFn>,
    pub(crate) steps: Vec<StepFn>,
    pub(crate) handlers: SignalTable,
    pub(crate) kind: TaskKind,
}

impl Task {
    pub(crate) fn new(id: TaskId, program: Program, kind: TaskKind, state: TaskState) -> Self {
        Self {
            id,
            core: TaskCore::new(program.name, state),
            context: Some(program.context),
            destructor: program.destructor,
            steps: program.steps,
            handlers: program.handlers,
            kind,
        }
    }

    pub(crate) fn is_daemon(&self) -> bool {
        matches!(self.kind, TaskKind::Daemon(_))
    }

    /// Run one invocation of the current step with `ticks` ticks.
    ///
    /// Queued signals go first, then (for a daemon starting a new item) the
    /// item-start callback, then the step. Signals raised by the step are
    /// delivered before returning.
    pub(crate) fn run_slice(&mut self, ticks: u32) -> Slice {
        let Task {
            id,
            core,
            context,
            steps,
            handlers,
            kind,
            ..
        } = self;
        let id = *id;
        let Some(ctx) = context.as_deref_mut() else {
            return Slice::Exited;
        };

        signal::deliver_pending(id, core, ctx, handlers);
        if core.exit_requested {
            return Slice::Exited;
        }

        if let TaskKind::Daemon(daemon) = kind {
            if core.step == 0 && core.seqno == 0 {
                daemon.start_item(id, core, ctx, ticks);
                if core.exit_requested {
                    return Slice::Exited;
                }
            }
        }

        let Some(step) = steps.get_mut(core.step) else {
            warn!(task = %id, step = core.step, "step index out of range");
            core.request_exit(ERROR_EXIT_CODE);
            return Slice::Exited;
        };

        let ret = {
            let mut cx = TaskCx::new(id, core, ticks);
            step(&mut cx, ctx, ticks)
        };

        signal::deliver_pending(id, core, ctx, handlers);
        if core.exit_requested {
            Slice::Exited
        } else {
            Slice::Returned(ret)
        }
    }

    /// Deliver `sig` inline to the running task.
    ///
    /// Signals already queued, or raised by the handler, stay queued.
    pub(crate) fn deliver(&mut self, sig: BgSignal) {
        let Task {
            id,
            core,
            context,
            handlers,
            ..
        } = self;
        let Some(ctx) = context.as_deref_mut() else {
            return;
        };
        signal::send(*id, core, ctx, handlers, sig);
    }

    /// Hand the context to its destructor. Runs at most once.
    pub(crate) fn release_context(&mut self) {
        if let Some(ctx) = self.context.take() {
            match self.destructor.take() {
                Some(destructor) => destructor(ctx),
                None => drop(ctx),
            }
        }
    }
}

/// Type-erased parts shared by task and daemon descriptions.
pub(crate) struct Program {
    pub(crate) name: String,
    pub(crate) context: Box<dyn Any>,
    pub(crate) steps: Vec<StepFn>,
    pub(crate) handlers: SignalTable,
    pub(crate) destructor: Option<DestructorFn>,
}

impl Program {
    pub(crate) fn new<C: 'static>(name: String, context: C) -> Self {
        Self {
            name,
            context: Box::new(context),
            steps: Vec::new(),
            handlers: SignalTable::default(),
            destructor: None,
        }
    }

    pub(crate) fn push_step<C, F>(&mut self, step: F)
    where
        C: 'static,
        F: FnMut(&mut TaskCx<'_>, &mut C, u32) -> StepResult + 'static,
    {
        self.steps.push(erase_step::<C, F>(step));
    }

    pub(crate) fn push_handler<C, F>(&mut self, sig: BgSignal, handler: F)
    where
        C: 'static,
        F: FnMut(&mut TaskCx<'_>, &mut C, BgSignal) + 'static,
    {
        if !sig.is_trappable() {
            warn!(task = %self.name, signal = %sig, "ignoring handler for untrappable signal");
            return;
        }
        self.handlers.install(sig, erase_handler::<C, F>(handler));
    }

    pub(crate) fn set_destructor<C, F>(&mut self, destructor: F)
    where
        C: 'static,
        F: FnOnce(C) + 'static,
    {
        self.destructor = Some(Box::new(move |ctx: Box<dyn Any>| {
            if let Ok(ctx) = ctx.downcast::<C>() {
                destructor(*ctx);
            }
        }));
    }
}

fn erase_step<C, F>(mut step: F) -> StepFn
where
    C: 'static,
    F: FnMut(&mut TaskCx<'_>, &mut C, u32) -> StepResult + 'static,
{
    Box::new(
        move |cx: &mut TaskCx<'_>, ctx: &mut dyn Any, ticks: u32| match ctx.downcast_mut::<C>() {
            Some(ctx) => step(cx, ctx, ticks),
            None => {
                warn!(task = %cx.id(), "task context has an unexpected type");
                StepResult::Error
            }
        },
    )
}

pub(crate) fn erase_handler<C, F>(mut handler: F) -> SignalHandler
where
    C: 'static,
    F: FnMut(&mut TaskCx<'_>, &mut C, BgSignal) + 'static,
{
    Box::new(
        move |cx: &mut TaskCx<'_>, ctx: &mut dyn Any, sig: BgSignal| {
            match ctx.downcast_mut::<C>() {
                Some(ctx) => handler(cx, ctx, sig),
                None => warn!(task = %cx.id(), signal = %sig, "handler context has an unexpected type"),
            }
        },
    )
}

/// Description of a plain task, consumed by
/// [`super::Scheduler::create_task`].
///
/// `C` is the task context. The scheduler owns it from creation until
/// termination, hands it to every step, and finally passes it to the
/// destructor (or drops it).
pub struct TaskSpec<C> {
    pub(crate) program: Program,
    pub(crate) on_done: Option<DoneFn>,
    _context: PhantomData<fn(C)>,
}

impl<C: 'static> TaskSpec<C> {
    pub(crate) fn into_parts(self) -> (Program, Option<DoneFn>) {
        (self.program, self.on_done)
    }

    /// Start describing a task named `name` owning `context`.
    pub fn new(name: impl Into<String>, context: C) -> Self {
        Self {
            program: Program::new(name.into(), context),
            on_done: None,
            _context: PhantomData,
        }
    }

    /// Append a step.
    pub fn step<F>(mut self, step: F) -> Self
    where
        F: FnMut(&mut TaskCx<'_>, &mut C, u32) -> StepResult + 'static,
    {
        self.program.push_step::<C, F>(step);
        self
    }

    /// Append a copy of every step in `steps`; the caller keeps the slice.
    pub fn steps<F>(mut self, steps: &[F]) -> Self
    where
        F: FnMut(&mut TaskCx<'_>, &mut C, u32) -> StepResult + Clone + 'static,
    {
        for step in steps {
            self.program.push_step::<C, F>(step.clone());
        }
        self
    }

    /// Install a handler for a trappable signal.
    pub fn on_signal<F>(mut self, sig: BgSignal, handler: F) -> Self
    where
        F: FnMut(&mut TaskCx<'_>, &mut C, BgSignal) + 'static,
    {
        self.program.push_handler::<C, F>(sig, handler);
        self
    }

    /// Callback invoked once when the task terminates, before the context
    /// is destroyed.
    pub fn on_done<F>(mut self, done: F) -> Self
    where
        F: FnOnce(TaskId, &mut C, &TaskExit) + 'static,
    {
        self.on_done = Some(Box::new(
            move |id: TaskId, ctx: &mut dyn Any, exit: &TaskExit| {
                if let Some(ctx) = ctx.downcast_mut::<C>() {
                    done(id, ctx, exit);
                }
            },
        ));
        self
    }

    /// Consume the context at termination instead of dropping it.
    pub fn with_destructor<F>(mut self, destructor: F) -> Self
    where
        F: FnOnce(C) + 'static,
    {
        self.program.set_destructor::<C, F>(destructor);
        self
    }
}
