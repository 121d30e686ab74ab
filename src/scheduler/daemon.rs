//! Daemon tasks: long-lived tasks draining a work queue.
//!
//! A daemon sleeps while its queue is empty and is woken by
//! [`Scheduler::enqueue`]. Each queued item is run through the daemon's
//! steps from the first one; when the steps finish, the item is handed to
//! the end callback, destroyed, and the daemon either picks the next item on
//! its following turn or goes back to sleep.

use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::collections::VecDeque;
use std::marker::PhantomData;
use tracing::{debug, info, warn};

use super::runner::Scheduler;
use super::signal::BgSignal;
use super::task::{Program, StepResult, Task, TaskCore, TaskCx, TaskId, TaskKind, TaskState};
use crate::error::{Result, ShoalError};

/// Daemon activity change reported to the notify callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonEvent {
    /// Work arrived while the daemon was sleeping.
    Started,
    /// The work queue was drained; the daemon is sleeping again.
    Stopped,
}

type ItemStartFn = Box<dyn FnMut(&mut TaskCx<'_>, &mut dyn Any, &mut dyn Any)>;
type ItemEndFn = Box<dyn FnMut(TaskId, &mut dyn Any, &mut dyn Any)>;
type ItemFreeFn = Box<dyn FnMut(Box<dyn Any>)>;
type NotifyFn = Box<dyn FnMut(TaskId, DaemonEvent)>;

pub(crate) struct Daemon {
    queue: VecDeque<Box<dyn Any>>,
    item_type: TypeId,
    item_type_name: &'static str,
    on_start: Option<ItemStartFn>,
    on_end: Option<ItemEndFn>,
    item_free: Option<ItemFreeFn>,
    notify: Option<NotifyFn>,
}

impl Daemon {
    fn new<I: 'static>() -> Self {
        Self {
            queue: VecDeque::new(),
            item_type: TypeId::of::<I>(),
            item_type_name: std::any::type_name::<I>(),
            on_start: None,
            on_end: None,
            item_free: None,
            notify: None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    /// Announce the head item to the start callback.
    pub(crate) fn start_item(
        &mut self,
        id: TaskId,
        core: &mut TaskCore,
        context: &mut dyn Any,
        ticks: u32,
    ) {
        let queued = self.queue.len();
        let Some(item) = self.queue.front_mut() else {
            warn!(task = %id, "runnable daemon has no work queued");
            return;
        };
        debug!(task = %id, queued, "daemon starting new item");
        if let Some(start) = self.on_start.as_mut() {
            let mut cx = TaskCx::new(id, core, ticks);
            start(&mut cx, context, &mut **item);
        }
    }

    /// Retire the head item: end callback, then destruction. Returns how
    /// many items are still queued.
    fn finish_item(&mut self, id: TaskId, context: Option<&mut dyn Any>) -> usize {
        let Some(mut item) = self.queue.pop_front() else {
            warn!(task = %id, "daemon finished an item it never had");
            return 0;
        };
        debug!(task = %id, "daemon done with item");
        if let (Some(end), Some(context)) = (self.on_end.as_mut(), context) {
            end(id, context, &mut *item);
        }
        self.free_item(item);
        self.queue.len()
    }

    fn free_item(&mut self, item: Box<dyn Any>) {
        match self.item_free.as_mut() {
            Some(free) => free(item),
            None => drop(item),
        }
    }

    /// Destroy every queued item, returning how many there were.
    pub(crate) fn drain_items(&mut self) -> usize {
        let count = self.queue.len();
        while let Some(item) = self.queue.pop_front() {
            self.free_item(item);
        }
        count
    }

    fn notify(&mut self, id: TaskId, event: DaemonEvent) {
        if let Some(notify) = self.notify.as_mut() {
            notify(id, event);
        }
    }
}

/// Description of a daemon task, consumed by [`Scheduler::create_daemon`].
///
/// `C` is the daemon context, `I` the work item type accepted by
/// [`Scheduler::enqueue`]. Steps only see the context; the item-start
/// callback is where the head item is loaded into it.
pub struct DaemonSpec<C, I> {
    program: Program,
    daemon: Daemon,
    _types: PhantomData<fn(C, I)>,
}

impl<C: 'static, I: 'static> DaemonSpec<C, I> {
    /// Start describing a daemon named `name` owning `context`.
    pub fn new(name: impl Into<String>, context: C) -> Self {
        Self {
            program: Program::new(name.into(), context),
            daemon: Daemon::new::<I>(),
            _types: PhantomData,
        }
    }

    /// Append a step, run once per item.
    pub fn step<F>(mut self, step: F) -> Self
    where
        F: FnMut(&mut TaskCx<'_>, &mut C, u32) -> StepResult + 'static,
    {
        self.program.push_step::<C, F>(step);
        self
    }

    /// Append a copy of every step in `steps`.
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

    /// Consume the context when the daemon is terminated.
    pub fn with_destructor<F>(mut self, destructor: F) -> Self
    where
        F: FnOnce(C) + 'static,
    {
        self.program.set_destructor::<C, F>(destructor);
        self
    }

    /// Called with the head item before the first step runs for it.
    pub fn on_item_start<F>(mut self, mut start: F) -> Self
    where
        F: FnMut(&mut TaskCx<'_>, &mut C, &mut I) + 'static,
    {
        self.daemon.on_start = Some(Box::new(
            move |cx: &mut TaskCx<'_>, ctx: &mut dyn Any, item: &mut dyn Any| {
                if let (Some(ctx), Some(item)) = (ctx.downcast_mut::<C>(), item.downcast_mut::<I>())
                {
                    start(cx, ctx, item);
                }
            },
        ));
        self
    }

    /// Called with the item once its steps are done, before it is destroyed.
    pub fn on_item_end<F>(mut self, mut end: F) -> Self
    where
        F: FnMut(TaskId, &mut C, &mut I) + 'static,
    {
        self.daemon.on_end = Some(Box::new(
            move |id: TaskId, ctx: &mut dyn Any, item: &mut dyn Any| {
                if let (Some(ctx), Some(item)) = (ctx.downcast_mut::<C>(), item.downcast_mut::<I>())
                {
                    end(id, ctx, item);
                }
            },
        ));
        self
    }

    /// Consume items when they are retired instead of dropping them.
    ///
    /// Also applies to items still queued when the daemon is freed.
    pub fn with_item_destructor<F>(mut self, mut free: F) -> Self
    where
        F: FnMut(I) + 'static,
    {
        self.daemon.item_free = Some(Box::new(move |item: Box<dyn Any>| {
            if let Ok(item) = item.downcast::<I>() {
                free(*item);
            }
        }));
        self
    }

    /// Called when the daemon wakes up or goes back to sleep.
    pub fn on_notify<F>(mut self, notify: F) -> Self
    where
        F: FnMut(TaskId, DaemonEvent) + 'static,
    {
        self.daemon.notify = Some(Box::new(notify));
        self
    }
}

impl Scheduler {
    /// Create a daemon task. It starts asleep with an empty work queue.
    ///
    /// # Errors
    ///
    /// Returns [`ShoalError::NoSteps`] when no step was given.
    pub fn create_daemon<C: 'static, I: 'static>(&mut self, spec: DaemonSpec<C, I>) -> Result<TaskId> {
        let DaemonSpec {
            program, daemon, ..
        } = spec;
        let name = program.name.clone();
        let id = self.insert(program, TaskKind::Daemon(daemon))?;
        info!(task = %id, name = %name, "daemon created");
        Ok(id)
    }

    /// Append `item` to a daemon's work queue, waking the daemon if it was
    /// asleep.
    ///
    /// # Errors
    ///
    /// Fails when `id` does not name a live daemon, or when `I` is not the
    /// item type the daemon was created with.
    pub fn enqueue<I: 'static>(&mut self, id: TaskId, item: I) -> Result<()> {
        let task = self.live_task_mut(id)?;
        if task.core.state == TaskState::Exited {
            return Err(ShoalError::TaskExited(id));
        }
        let TaskKind::Daemon(daemon) = &mut task.kind else {
            return Err(ShoalError::NotADaemon(id));
        };
        if daemon.item_type != TypeId::of::<I>() {
            return Err(ShoalError::ItemType {
                task: id,
                expected: daemon.item_type_name,
            });
        }

        daemon.queue.push_back(Box::new(item));
        debug!(task = %id, queued = daemon.queue.len(), "item enqueued");

        if task.core.state != TaskState::Sleeping {
            return Ok(());
        }

        debug!(task = %id, name = %task.core.name, "waking up daemon");
        task.core.state = TaskState::Runnable;
        daemon.notify(id, DaemonEvent::Started);

        self.sleepq.remove(id);
        self.runq.push(id);
        self.runcount += 1;
        Ok(())
    }

    /// The daemon finished its current item: retire it and rewind to the
    /// first step, or put the daemon to sleep when nothing is left.
    pub(super) fn item_done(&mut self, id: TaskId) {
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        let Task {
            core,
            context,
            kind,
            ..
        } = task;
        let TaskKind::Daemon(daemon) = kind else {
            return;
        };

        let remaining = daemon.finish_item(id, context.as_deref_mut());
        core.rewind();
        if remaining > 0 {
            return;
        }

        debug!(task = %id, name = %core.name, "daemon going back to sleep");
        core.state = TaskState::Sleeping;
        daemon.notify(id, DaemonEvent::Stopped);

        self.runq.remove(id);
        self.runcount = self.runcount.saturating_sub(1);
        self.sleepq.push(id);
    }
}
