//! The scheduler object and its tick.
//!
//! [`Scheduler::tick`] is the only place where task code runs. Each call
//! shares a fixed time budget between the runnable tasks, round-robin, and
//! sizes every invocation from the task's learned tick cost so that one call
//! lasts about `max(min_life, max_life / runnable)` of wall time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::queue::TaskQueue;
use super::signal::BgSignal;
use super::task::{
    ERROR_EXIT_CODE, Program, Slice, StepResult, Task, TaskCx, TaskExit, TaskId, TaskKind,
    TaskSpec, TaskState, TaskStatus, erase_handler,
};
use super::timing::{Clock, SystemClock};
use crate::config::SchedulerConfig;
use crate::error::{Result, ShoalError};

/// Counts of what [`Scheduler::shutdown`] had to force.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Tasks still in the run queue (plain tasks and busy daemons).
    pub tasks: usize,
    /// Sleeping daemons.
    pub daemons: usize,
    /// Terminated tasks whose status was never collected.
    pub zombies: usize,
}

impl ShutdownReport {
    /// Whether nothing had to be forced.
    pub fn is_clean(&self) -> bool {
        self.tasks == 0 && self.daemons == 0 && self.zombies == 0
    }
}

/// Variant of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskVariant {
    /// Runs its steps once and terminates.
    Plain,
    /// Runs its steps once per work item.
    Daemon,
}

/// Diagnostic view of one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    /// Handle.
    pub id: TaskId,
    /// Name given at creation.
    pub name: String,
    /// Plain task or daemon.
    pub variant: TaskVariant,
    /// Scheduling state.
    pub state: TaskState,
    /// Current step index.
    pub step: usize,
    /// Invocations of the current step so far.
    pub seqno: u32,
    /// Ticks granted to the last invocation.
    pub ticks: u32,
    /// Smoothed cost of one tick, in µs (0 when not learned yet).
    pub tick_cost_us: f64,
    /// Accumulated run time, in ms.
    pub wall_time_ms: u64,
    /// Items waiting in a daemon's work queue.
    pub queued_items: usize,
    /// Terminated with a status nobody collected yet.
    pub zombie: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Diagnostic view of the whole scheduler, for doctor-style tooling.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    /// Tasks competing for time.
    pub runnable: usize,
    /// Run queue, head first.
    pub run_queue: Vec<TaskId>,
    /// Sleeping daemons.
    pub sleep_queue: Vec<TaskId>,
    /// Every task record still held, by handle.
    pub tasks: Vec<TaskInfo>,
}

/// Cooperative background task scheduler.
///
/// Owns every task record. All entry points take `&mut self`; a host that
/// shares the scheduler between threads must serialize access itself.
pub struct Scheduler {
    config: SchedulerConfig,
    clock: Box<dyn Clock>,
    pub(super) tasks: HashMap<TaskId, Task>,
    pub(super) runq: TaskQueue,
    pub(super) sleepq: TaskQueue,
    /// Terminated tasks waiting to be freed.
    dead: Vec<TaskId>,
    /// Tasks competing for time: the run queue plus the running task.
    pub(super) runcount: usize,
    current: Option<TaskId>,
    next_id: u64,
}

impl Scheduler {
    /// Create a scheduler reading the system wall clock.
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_clock(config, Box::new(SystemClock))
    }

    /// Create a scheduler reading `clock`.
    pub fn with_clock(config: SchedulerConfig, clock: Box<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            tasks: HashMap::new(),
            runq: TaskQueue::default(),
            sleepq: TaskQueue::default(),
            dead: Vec::new(),
            runcount: 0,
            current: None,
            next_id: 1,
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Create a plain task, runnable right away.
    ///
    /// # Errors
    ///
    /// Returns [`ShoalError::NoSteps`] when no step was given.
    pub fn create_task<C: 'static>(&mut self, spec: TaskSpec<C>) -> Result<TaskId> {
        let (program, on_done) = spec.into_parts();
        let name = program.name.clone();
        let id = self.insert(program, TaskKind::Plain { on_done })?;
        info!(task = %id, name = %name, "task created");
        Ok(id)
    }

    /// Register a new record. Plain tasks join the run queue, daemons the
    /// sleep queue.
    pub(super) fn insert(&mut self, program: Program, kind: TaskKind) -> Result<TaskId> {
        if program.steps.is_empty() {
            return Err(ShoalError::NoSteps(program.name));
        }

        let id = TaskId::from_raw(self.next_id);
        self.next_id += 1;

        let state = match kind {
            TaskKind::Plain { .. } => TaskState::Runnable,
            TaskKind::Daemon(_) => TaskState::Sleeping,
        };
        match state {
            TaskState::Sleeping => self.sleepq.push(id),
            _ => {
                self.runq.push(id);
                self.runcount += 1;
            }
        }
        self.tasks.insert(id, Task::new(id, program, kind, state));
        Ok(id)
    }

    pub(super) fn live_task_mut(&mut self, id: TaskId) -> Result<&mut Task> {
        match self.tasks.get_mut(&id) {
            Some(task) => Ok(task),
            None => {
                warn!(task = %id, "operation on unknown task");
                Err(ShoalError::UnknownTask(id))
            }
        }
    }

    fn live_task(&self, id: TaskId) -> Result<&Task> {
        match self.tasks.get(&id) {
            Some(task) => Ok(task),
            None => {
                warn!(task = %id, "operation on unknown task");
                Err(ShoalError::UnknownTask(id))
            }
        }
    }

    // -----------------------------------------------------------------
    // Running-task switching
    // -----------------------------------------------------------------

    fn resume(&mut self, id: TaskId) {
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        debug_assert_ne!(task.core.state, TaskState::Running);
        match task.core.state {
            TaskState::Sleeping => {
                self.sleepq.remove(id);
            }
            _ => {
                self.runq.remove(id);
            }
        }
        task.core.resumed_from = task.core.state;
        task.core.state = TaskState::Running;
        task.core.timing.begin(self.clock.now_micros());
        self.current = Some(id);
    }

    /// Stop the running task and put it back where it was resumed from.
    /// Returns the elapsed time of the invocation.
    fn suspend(&mut self, id: TaskId) -> i64 {
        let Some(task) = self.tasks.get_mut(&id) else {
            return 0;
        };
        debug_assert_eq!(task.core.state, TaskState::Running);
        match task.core.resumed_from {
            TaskState::Sleeping => {
                task.core.state = TaskState::Sleeping;
                self.sleepq.push(id);
            }
            _ => {
                task.core.state = TaskState::Runnable;
                self.runq.push(id);
            }
        }
        let learn = !task.core.no_tick;
        task.core.timing.finish(self.clock.now_micros(), learn)
    }

    /// Make `next` the running task, suspending the current one first.
    /// Returns the elapsed time of the suspended task, 0 if there was none.
    fn switch_to(&mut self, next: Option<TaskId>) -> i64 {
        let mut elapsed = 0;
        if let Some(old) = self.current.take() {
            elapsed = self.suspend(old);
        }
        if let Some(id) = next {
            self.resume(id);
        }
        elapsed
    }

    // -----------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------

    /// Run one scheduling pass.
    ///
    /// Frees the tasks terminated since the previous pass, then hands out
    /// slices of the global budget until it is spent or nothing is runnable.
    pub fn tick(&mut self) {
        if let Some(id) = self.current {
            warn!(task = %id, "tick entered while a task is running");
            return;
        }
        self.reclaim_dead();

        let max_life = i64::try_from(self.config.max_life_us).unwrap_or(i64::MAX);
        let min_life = self.config.min_life_us;
        let mut remain = max_life;

        while self.runcount > 0 && remain > 0 {
            let target = min_life.max(self.config.max_life_us / self.runcount as u64);

            let Some(id) = self.runq.front() else {
                warn!(runcount = self.runcount, "run queue empty with runnable tasks");
                self.runcount = 0;
                break;
            };
            let Some(task) = self.tasks.get_mut(&id) else {
                warn!(task = %id, "run queue holds a freed task");
                self.runq.remove(id);
                self.runcount = self.runcount.saturating_sub(1);
                continue;
            };

            task.core.no_tick = false;
            let ticks = task.core.timing.allot(target, self.config.delta_factor);
            task.core.timing.grant(ticks);

            self.switch_to(Some(id));

            let Some(task) = self.tasks.get_mut(&id) else {
                break;
            };
            debug!(
                task = %id,
                name = %task.core.name,
                step = task.core.step,
                seqno = task.core.seqno,
                ticks,
                "running step"
            );
            let slice = task.run_slice(ticks);
            if matches!(slice, Slice::Exited) {
                task.core.no_tick = true;
            }

            let elapsed = self.switch_to(None);
            remain -= elapsed.max(1);

            match slice {
                Slice::Exited => {
                    debug!(task = %id, elapsed_us = elapsed, "task exited from its step");
                    self.terminate(id);
                }
                Slice::Returned(ret) => {
                    debug!(task = %id, elapsed_us = elapsed, ?ret, "step returned");
                    self.dispatch(id, ret);
                }
            }
        }

        self.reclaim_dead();
    }

    fn dispatch(&mut self, id: TaskId, ret: StepResult) {
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        match ret {
            StepResult::Done => self.task_ended(id),
            StepResult::Next => {
                if task.core.step + 1 >= task.steps.len() {
                    self.task_ended(id);
                } else {
                    task.core.step += 1;
                    task.core.seqno = 0;
                    task.core.timing.forget_cost();
                }
            }
            StepResult::More => {
                task.core.seqno = task.core.seqno.saturating_add(1);
            }
            StepResult::Error => {
                task.core.exit_code = ERROR_EXIT_CODE;
                self.terminate(id);
            }
        }
    }

    /// Steps are exhausted: a daemon retires its item, a plain task ends.
    fn task_ended(&mut self, id: TaskId) {
        let is_daemon = self.tasks.get(&id).is_some_and(Task::is_daemon);
        if is_daemon {
            self.item_done(id);
        } else {
            self.terminate(id);
        }
    }

    // -----------------------------------------------------------------
    // Termination
    // -----------------------------------------------------------------

    /// Terminate a task that is not running. Does nothing if it already
    /// exited.
    fn terminate(&mut self, id: TaskId) {
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        match task.core.state {
            TaskState::Exited => return,
            TaskState::Running => {
                warn!(task = %id, "cannot terminate the running task in place");
                return;
            }
            TaskState::Sleeping => {
                self.sleepq.remove(id);
            }
            TaskState::Runnable => {
                self.runq.remove(id);
                self.runcount = self.runcount.saturating_sub(1);
            }
        }
        task.core.state = TaskState::Exited;

        let exit = task.core.exit_info();
        info!(
            task = %id,
            name = %task.core.name,
            daemon = task.is_daemon(),
            status = ?exit.status,
            exit_code = exit.exit_code,
            wall_time_ms = task.core.timing.wtime_ms,
            "task terminated"
        );

        if let TaskKind::Plain { on_done } = &mut task.kind {
            match on_done.take() {
                Some(done) => {
                    if let Some(ctx) = task.context.as_deref_mut() {
                        done(id, ctx, &exit);
                    }
                }
                None if exit.status != TaskStatus::Success => {
                    debug!(task = %id, "holding exit status until collected");
                    task.core.zombie = true;
                }
                None => {}
            }
        }

        task.release_context();

        if !task.core.zombie {
            self.dead.push(id);
        }
    }

    fn kill(&mut self, id: TaskId) {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.core.request_kill();
        }
        self.terminate(id);
    }

    /// Free every task queued for deletion.
    fn reclaim_dead(&mut self) {
        for id in self.dead.drain(..) {
            if self.current == Some(id) {
                warn!(task = %id, "refusing to free the running task");
                continue;
            }
            let Some(mut task) = self.tasks.remove(&id) else {
                continue;
            };
            if let TaskKind::Daemon(daemon) = &mut task.kind {
                let dropped = daemon.drain_items();
                if dropped > 0 {
                    warn!(
                        task = %id,
                        name = %task.core.name,
                        "freed {dropped} pending item(s) for daemon"
                    );
                }
            }
            debug!(task = %id, name = %task.core.name, "task reclaimed");
        }
    }

    // -----------------------------------------------------------------
    // Host operations
    // -----------------------------------------------------------------

    /// Cancel a task: send it [`BgSignal::Term`] if it traps it, then kill
    /// it unless the handler already made it exit.
    ///
    /// Cancelling a task that already exited is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ShoalError::UnknownTask`] when the record was already freed.
    pub fn cancel(&mut self, id: TaskId) -> Result<()> {
        let task = self.live_task(id)?;
        if task.core.state == TaskState::Exited {
            return Ok(());
        }

        if task.handlers.has(BgSignal::Term) {
            let previous = self.current;
            self.switch_to(Some(id));
            if let Some(task) = self.tasks.get_mut(&id) {
                task.deliver(BgSignal::Term);
                task.core.no_tick = true;
            }
            self.switch_to(previous);

            let exited = self
                .tasks
                .get(&id)
                .is_some_and(|task| task.core.exit_requested);
            if exited {
                debug!(task = %id, "task exited on TERM");
                self.terminate(id);
                return Ok(());
            }
        }

        self.kill(id);
        Ok(())
    }

    /// Send `sig` to a task.
    ///
    /// [`BgSignal::Zero`] only probes the task. [`BgSignal::Kill`]
    /// terminates it at once. Trappable signals are queued for delivery at
    /// the start of the task's next invocation; they are dropped when the
    /// task has no handler for them, in which case `false` is returned.
    ///
    /// # Errors
    ///
    /// Fails when the task is unknown or has already exited.
    pub fn signal(&mut self, id: TaskId, sig: BgSignal) -> Result<bool> {
        let task = self.live_task_mut(id)?;
        if task.core.state == TaskState::Exited {
            return Err(ShoalError::TaskExited(id));
        }
        match sig {
            BgSignal::Zero => Ok(true),
            BgSignal::Kill => {
                self.kill(id);
                Ok(true)
            }
            BgSignal::Term | BgSignal::Usr => {
                if !task.handlers.has(sig) {
                    debug!(task = %id, signal = %sig, "no handler installed, signal dropped");
                    return Ok(false);
                }
                task.core.pending.push_back(sig);
                Ok(true)
            }
        }
    }

    /// Install a handler for a trappable signal on an existing task.
    ///
    /// Returns whether a previous handler was replaced.
    ///
    /// # Errors
    ///
    /// Fails for untrappable signals, unknown tasks, and tasks that already
    /// exited.
    pub fn set_signal_handler<C, F>(&mut self, id: TaskId, sig: BgSignal, handler: F) -> Result<bool>
    where
        C: 'static,
        F: FnMut(&mut TaskCx<'_>, &mut C, BgSignal) + 'static,
    {
        if !sig.is_trappable() {
            return Err(ShoalError::Untrappable(sig));
        }
        let task = self.live_task_mut(id)?;
        if task.core.state == TaskState::Exited {
            return Err(ShoalError::TaskExited(id));
        }
        let replaced = task.handlers.install(sig, erase_handler::<C, F>(handler));
        Ok(replaced.is_some())
    }

    /// Read the final status of a terminated task.
    ///
    /// A zombie is released by this call and freed on the next tick.
    ///
    /// # Errors
    ///
    /// Returns [`ShoalError::TaskActive`] while the task is still running,
    /// [`ShoalError::UnknownTask`] once it has been freed.
    pub fn collect(&mut self, id: TaskId) -> Result<TaskExit> {
        let task = self.live_task_mut(id)?;
        if task.core.state != TaskState::Exited {
            return Err(ShoalError::TaskActive(id));
        }
        let exit = task.core.exit_info();
        if task.core.zombie {
            task.core.zombie = false;
            self.dead.push(id);
        }
        Ok(exit)
    }

    /// Final status of a terminated task not freed yet.
    pub fn exit_status(&self, id: TaskId) -> Option<TaskExit> {
        self.tasks
            .get(&id)
            .filter(|task| task.core.state == TaskState::Exited)
            .map(|task| task.core.exit_info())
    }

    // -----------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------

    /// Context of a live task, if it has type `C`.
    pub fn context_mut<C: 'static>(&mut self, id: TaskId) -> Option<&mut C> {
        self.tasks
            .get_mut(&id)?
            .context
            .as_deref_mut()?
            .downcast_mut::<C>()
    }

    /// Scheduling state of a task not freed yet.
    pub fn state(&self, id: TaskId) -> Option<TaskState> {
        self.tasks.get(&id).map(|task| task.core.state)
    }

    /// Invocations of the task's current step so far.
    pub fn seqno(&self, id: TaskId) -> Option<u32> {
        self.tasks.get(&id).map(|task| task.core.seqno)
    }

    /// Whether `id` names a daemon.
    pub fn is_daemon(&self, id: TaskId) -> bool {
        self.tasks.get(&id).is_some_and(Task::is_daemon)
    }

    /// Items waiting in a daemon's work queue, including the one being
    /// processed.
    pub fn queue_len(&self, id: TaskId) -> Option<usize> {
        match &self.tasks.get(&id)?.kind {
            TaskKind::Daemon(daemon) => Some(daemon.len()),
            TaskKind::Plain { .. } => None,
        }
    }

    /// Number of tasks competing for time.
    pub fn runnable_count(&self) -> usize {
        self.runcount
    }

    /// Whether no task wants to run.
    pub fn is_idle(&self) -> bool {
        self.runcount == 0
    }

    /// Task currently running. Always `None` outside of [`Self::tick`].
    pub fn running(&self) -> Option<TaskId> {
        self.current
    }

    /// Diagnostic view of every task.
    pub fn snapshot(&self) -> SchedulerSnapshot {
        let mut tasks: Vec<TaskInfo> = self
            .tasks
            .values()
            .map(|task| TaskInfo {
                id: task.id,
                name: task.core.name.clone(),
                variant: if task.is_daemon() {
                    TaskVariant::Daemon
                } else {
                    TaskVariant::Plain
                },
                state: task.core.state,
                step: task.core.step,
                seqno: task.core.seqno,
                ticks: task.core.timing.ticks,
                tick_cost_us: task.core.timing.tick_cost,
                wall_time_ms: task.core.timing.wtime_ms,
                queued_items: match &task.kind {
                    TaskKind::Daemon(daemon) => daemon.len(),
                    TaskKind::Plain { .. } => 0,
                },
                zombie: task.core.zombie,
                created_at: task.core.created_at,
            })
            .collect();
        tasks.sort_by_key(|info| info.id);

        SchedulerSnapshot {
            runnable: self.runcount,
            run_queue: self.runq.snapshot(),
            sleep_queue: self.sleepq.snapshot(),
            tasks,
        }
    }

    // -----------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------

    /// Cancel every remaining task, discard uncollected statuses and free
    /// all records.
    pub fn shutdown(&mut self) -> ShutdownReport {
        let zombies: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|task| task.core.zombie)
            .map(|task| task.id)
            .collect();

        let running = self.runq.snapshot();
        for &id in &running {
            if let Err(e) = self.cancel(id) {
                debug!(task = %id, "cannot cancel task at shutdown: {e}");
            }
        }
        if !running.is_empty() {
            warn!("terminated {} running task(s)", running.len());
        }

        let sleeping = self.sleepq.snapshot();
        for &id in &sleeping {
            if let Err(e) = self.cancel(id) {
                debug!(task = %id, "cannot cancel daemon at shutdown: {e}");
            }
        }
        if !sleeping.is_empty() {
            warn!("terminated {} daemon task(s)", sleeping.len());
        }

        for task in self.tasks.values_mut() {
            if !task.core.zombie {
                continue;
            }
            if zombies.contains(&task.id) {
                warn!(
                    task = %task.id,
                    name = %task.core.name,
                    "user code lost exit status of task"
                );
            }
            task.core.zombie = false;
            self.dead.push(task.id);
        }

        self.reclaim_dead();

        ShutdownReport {
            tasks: running.len(),
            daemons: sleeping.len(),
            zombies: zombies.len(),
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        let report = self.shutdown();
        if !report.is_clean() {
            debug!(?report, "scheduler dropped with live tasks");
        }
    }
}
