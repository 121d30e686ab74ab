//! End-to-end scheduler behaviour, driven with a manual clock.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use shoal::SchedulerConfig;
use shoal::ShoalError;
use shoal::scheduler::{
    BgSignal, DaemonEvent, DaemonSpec, ERROR_EXIT_CODE, ManualClock, Scheduler, StepPtr,
    StepResult, TaskCx, TaskExit, TaskId, TaskSpec, TaskState, TaskStatus, TaskVariant,
};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Budget small enough that a step which never advances the clock still
/// lets a tick finish quickly (one µs is charged per invocation).
const BUDGET_US: u64 = 1_000;

fn config() -> SchedulerConfig {
    SchedulerConfig {
        max_life_us: BUDGET_US,
        min_life_us: 100,
        ..SchedulerConfig::default()
    }
}

fn scheduler() -> (Scheduler, ManualClock) {
    let clock = ManualClock::new(1_000_000);
    let scheduler = Scheduler::with_clock(config(), Box::new(clock.clone()));
    (scheduler, clock)
}

fn run_until_idle(scheduler: &mut Scheduler, max_ticks: usize) {
    for _ in 0..max_ticks {
        if scheduler.is_idle() {
            break;
        }
        scheduler.tick();
    }
    assert!(scheduler.is_idle(), "scheduler still busy after {max_ticks} ticks");
    // One more pass frees whatever terminated during the last one.
    scheduler.tick();
}

fn exit_recorder() -> (
    Rc<RefCell<Vec<TaskExit>>>,
    impl FnOnce(TaskId, &mut (), &TaskExit) + 'static,
) {
    let exits = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&exits);
    (exits, move |_id: TaskId, _ctx: &mut (), exit: &TaskExit| {
        sink.borrow_mut().push(*exit);
    })
}

fn forever(_: &mut TaskCx<'_>, _: &mut (), _: u32) -> StepResult {
    StepResult::More
}

// ---------------------------------------------------------------------------
// Plain tasks
// ---------------------------------------------------------------------------

#[test]
fn two_step_task_completes_successfully_once() {
    let (mut scheduler, _clock) = scheduler();
    let (exits, on_done) = exit_recorder();

    let id = scheduler
        .create_task(
            TaskSpec::new("two steps", ())
                .step(|_: &mut TaskCx<'_>, _: &mut (), _: u32| StepResult::Next)
                .step(|_: &mut TaskCx<'_>, _: &mut (), _: u32| StepResult::Done)
                .on_done(on_done),
        )
        .unwrap();
    assert_eq!(scheduler.state(id), Some(TaskState::Runnable));
    assert_eq!(scheduler.runnable_count(), 1);

    run_until_idle(&mut scheduler, 10);

    assert_eq!(
        *exits.borrow(),
        vec![TaskExit {
            status: TaskStatus::Success,
            exit_code: 0,
            signal: None,
        }]
    );
    assert_eq!(scheduler.state(id), None);
}

#[test]
fn error_return_reports_application_error() {
    let (mut scheduler, _clock) = scheduler();
    let (exits, on_done) = exit_recorder();

    scheduler
        .create_task(
            TaskSpec::new("failing", ())
                .step(|_: &mut TaskCx<'_>, _: &mut (), _: u32| StepResult::Error)
                .on_done(on_done),
        )
        .unwrap();
    run_until_idle(&mut scheduler, 10);

    let exits = exits.borrow();
    assert_eq!(exits.len(), 1);
    assert_eq!(exits[0].status, TaskStatus::Error);
    assert_eq!(exits[0].exit_code, ERROR_EXIT_CODE);
}

#[test]
fn explicit_exit_code_reaches_completion_callback() {
    let (mut scheduler, _clock) = scheduler();
    let (exits, on_done) = exit_recorder();
    let after_exit = Rc::new(Cell::new(0));
    let counter = Rc::clone(&after_exit);

    scheduler
        .create_task(
            TaskSpec::new("exiting", ())
                .step(|_: &mut TaskCx<'_>, _: &mut (), _: u32| StepResult::Next)
                .step(|cx: &mut TaskCx<'_>, _: &mut (), _: u32| cx.exit(7))
                .step(move |_: &mut TaskCx<'_>, _: &mut (), _: u32| {
                    counter.set(counter.get() + 1);
                    StepResult::Done
                })
                .on_done(on_done),
        )
        .unwrap();
    run_until_idle(&mut scheduler, 10);

    assert_eq!(exits.borrow()[0].status, TaskStatus::Error);
    assert_eq!(exits.borrow()[0].exit_code, 7);
    assert_eq!(after_exit.get(), 0);
}

#[test]
fn exit_wins_over_the_returned_value() {
    let (mut scheduler, _clock) = scheduler();
    let (exits, on_done) = exit_recorder();

    scheduler
        .create_task(
            TaskSpec::new("exit then more", ())
                .step(|cx: &mut TaskCx<'_>, _: &mut (), _: u32| {
                    cx.exit(3);
                    StepResult::More
                })
                .on_done(on_done),
        )
        .unwrap();
    run_until_idle(&mut scheduler, 10);

    assert_eq!(exits.borrow()[0].exit_code, 3);
}

#[test]
fn step_table_is_copied() {
    fn count(_: &mut TaskCx<'_>, n: &mut u32, _: u32) -> StepResult {
        *n += 1;
        StepResult::Next
    }

    let (mut scheduler, _clock) = scheduler();
    let table: Vec<StepPtr<u32>> = vec![count, count, count];
    let totals = Rc::new(RefCell::new(Vec::new()));

    for name in ["first", "second"] {
        let sink = Rc::clone(&totals);
        scheduler
            .create_task(TaskSpec::new(name, 0_u32).steps(&table).on_done(
                move |_id: TaskId, n: &mut u32, _exit: &TaskExit| sink.borrow_mut().push(*n),
            ))
            .unwrap();
    }
    drop(table);
    run_until_idle(&mut scheduler, 10);

    assert_eq!(*totals.borrow(), vec![3, 3]);
}

#[test]
fn destructor_runs_once_after_completion_callback() {
    let (mut scheduler, _clock) = scheduler();
    let order = Rc::new(RefCell::new(Vec::new()));
    let done_log = Rc::clone(&order);
    let free_log = Rc::clone(&order);

    scheduler
        .create_task(
            TaskSpec::new("owned", String::from("ctx"))
                .step(|_: &mut TaskCx<'_>, _: &mut String, _: u32| StepResult::Done)
                .on_done(move |_id: TaskId, ctx: &mut String, _exit: &TaskExit| {
                    done_log.borrow_mut().push(format!("done {ctx}"));
                })
                .with_destructor(move |ctx: String| {
                    free_log.borrow_mut().push(format!("free {ctx}"));
                }),
        )
        .unwrap();
    run_until_idle(&mut scheduler, 10);

    assert_eq!(*order.borrow(), vec!["done ctx", "free ctx"]);
}

#[test]
fn uncollected_failure_is_held_as_zombie_until_collected() {
    let (mut scheduler, _clock) = scheduler();
    let id = scheduler
        .create_task(
            TaskSpec::new("zombie", ()).step(|_: &mut TaskCx<'_>, _: &mut (), _: u32| {
                StepResult::Error
            }),
        )
        .unwrap();

    scheduler.tick();
    scheduler.tick();
    scheduler.tick();
    assert_eq!(scheduler.state(id), Some(TaskState::Exited));
    assert!(scheduler.snapshot().tasks[0].zombie);
    assert_eq!(
        scheduler.exit_status(id).map(|exit| exit.status),
        Some(TaskStatus::Error)
    );

    let exit = scheduler.collect(id).unwrap();
    assert_eq!(exit.exit_code, ERROR_EXIT_CODE);

    scheduler.tick();
    assert_eq!(scheduler.state(id), None);
    assert!(matches!(
        scheduler.collect(id),
        Err(ShoalError::UnknownTask(_))
    ));
}

#[test]
fn successful_task_without_callback_is_freed_directly() {
    let (mut scheduler, _clock) = scheduler();
    let id = scheduler
        .create_task(
            TaskSpec::new("quiet", ())
                .step(|_: &mut TaskCx<'_>, _: &mut (), _: u32| StepResult::Done),
        )
        .unwrap();
    scheduler.tick();
    assert_eq!(scheduler.state(id), None);
}

#[test]
fn collecting_an_active_task_fails() {
    let (mut scheduler, _clock) = scheduler();
    let id = scheduler
        .create_task(TaskSpec::new("busy", ()).step(forever))
        .unwrap();
    assert!(matches!(
        scheduler.collect(id),
        Err(ShoalError::TaskActive(_))
    ));
}

// ---------------------------------------------------------------------------
// Time budget and tick accounting
// ---------------------------------------------------------------------------

#[test]
fn tick_terminates_when_the_clock_stands_still() {
    let (mut scheduler, _clock) = scheduler();
    let calls = Rc::new(Cell::new(0_u64));
    let counter = Rc::clone(&calls);
    scheduler
        .create_task(TaskSpec::new("spinner", ()).step(
            move |_: &mut TaskCx<'_>, _: &mut (), _: u32| {
                counter.set(counter.get() + 1);
                StepResult::More
            },
        ))
        .unwrap();

    scheduler.tick();
    assert_eq!(calls.get(), BUDGET_US);
    assert_eq!(scheduler.running(), None);
}

#[test]
fn runnable_tasks_share_the_budget_round_robin() {
    let (mut scheduler, clock) = scheduler();
    let calls = Rc::new(RefCell::new(Vec::new()));

    for name in ["a", "b"] {
        let log = Rc::clone(&calls);
        let clock = clock.clone();
        scheduler
            .create_task(TaskSpec::new(name, ()).step(
                move |cx: &mut TaskCx<'_>, _: &mut (), _: u32| {
                    clock.advance(100);
                    log.borrow_mut().push(cx.name().to_owned());
                    StepResult::More
                },
            ))
            .unwrap();
    }

    scheduler.tick();
    let calls = calls.borrow();
    assert_eq!(calls.len(), 10);
    for pair in calls.chunks(2) {
        assert_eq!(pair, ["a", "b"]);
    }
}

#[test]
fn only_one_task_runs_at_a_time() {
    let (mut scheduler, clock) = scheduler();
    let trace = Rc::new(RefCell::new(Vec::new()));

    for name in ["x", "y", "z"] {
        let log = Rc::clone(&trace);
        let clock = clock.clone();
        scheduler
            .create_task(TaskSpec::new(name, 0_u32).step(
                move |cx: &mut TaskCx<'_>, n: &mut u32, _: u32| {
                    log.borrow_mut().push((cx.id(), true));
                    clock.advance(50);
                    *n += 1;
                    log.borrow_mut().push((cx.id(), false));
                    if *n == 20 {
                        StepResult::Done
                    } else {
                        StepResult::More
                    }
                },
            ))
            .unwrap();
    }

    for _ in 0..20 {
        scheduler.tick();
        assert_eq!(scheduler.running(), None);
        assert!(
            scheduler
                .snapshot()
                .tasks
                .iter()
                .all(|task| task.state != TaskState::Running)
        );
    }

    let trace = trace.borrow();
    assert!(!trace.is_empty());
    for pair in trace.chunks(2) {
        assert_eq!(pair[0].0, pair[1].0);
        assert!(pair[0].1 && !pair[1].1);
    }
}

#[test]
fn over_reported_ticks_are_clamped_to_the_grant() {
    let (mut scheduler, clock) = scheduler();
    let id = scheduler
        .create_task(TaskSpec::new("greedy", ()).step(
            move |cx: &mut TaskCx<'_>, _: &mut (), ticks: u32| {
                clock.advance(BUDGET_US as i64);
                cx.ticks_used(ticks + 5);
                StepResult::More
            },
        ))
        .unwrap();

    scheduler.tick();

    let snapshot = scheduler.snapshot();
    let info = &snapshot.tasks[0];
    assert_eq!(info.id, id);
    assert_eq!(info.ticks, 1);
    // The full elapsed time was spread over the one granted tick.
    assert!((info.tick_cost_us - BUDGET_US as f64 / 5.0).abs() < 1e-9);
}

#[test]
fn partial_tick_use_skips_cost_learning() {
    let (mut scheduler, clock) = scheduler();
    scheduler
        .create_task(TaskSpec::new("idle", ()).step(
            move |cx: &mut TaskCx<'_>, _: &mut (), _: u32| {
                clock.advance(BUDGET_US as i64);
                cx.ticks_used(0);
                StepResult::More
            },
        ))
        .unwrap();

    scheduler.tick();
    scheduler.tick();
    let snapshot = scheduler.snapshot();
    let info = &snapshot.tasks[0];
    assert_eq!(info.tick_cost_us, 0.0);
    assert_eq!(info.ticks, 1);
}

#[test]
fn tick_cost_converges_monotonically() {
    const COST_US: i64 = 100;
    let (mut scheduler, clock) = scheduler();
    scheduler
        .create_task(TaskSpec::new("steady", ()).step(
            move |_: &mut TaskCx<'_>, _: &mut (), ticks: u32| {
                clock.advance(COST_US * i64::from(ticks));
                StepResult::More
            },
        ))
        .unwrap();

    let mut costs = Vec::new();
    for _ in 0..30 {
        scheduler.tick();
        costs.push(scheduler.snapshot().tasks[0].tick_cost_us);
    }

    for pair in costs.windows(2) {
        assert!(pair[1] >= pair[0], "cost went down: {costs:?}");
    }
    let last = costs[costs.len() - 1];
    assert!(last <= COST_US as f64);
    assert!(last > 0.99 * COST_US as f64, "did not converge: {costs:?}");
}

#[test]
fn new_step_relearns_its_cost() {
    let (mut scheduler, clock) = scheduler();
    let first = clock.clone();
    scheduler
        .create_task(
            TaskSpec::new("phases", 0_u32)
                .step(move |_: &mut TaskCx<'_>, n: &mut u32, _: u32| {
                    first.advance(BUDGET_US as i64);
                    *n += 1;
                    if *n == 3 {
                        StepResult::Next
                    } else {
                        StepResult::More
                    }
                })
                .step(|_: &mut TaskCx<'_>, _: &mut u32, _: u32| StepResult::More),
        )
        .unwrap();

    scheduler.tick();
    scheduler.tick();
    assert!(scheduler.snapshot().tasks[0].tick_cost_us > 0.0);

    scheduler.tick();
    let snapshot = scheduler.snapshot();
    let info = &snapshot.tasks[0];
    assert_eq!(info.step, 1);
    assert_eq!(info.seqno, 0);
    assert_eq!(info.tick_cost_us, 0.0);
}

#[test]
fn backward_clock_keeps_accounting_bounded() {
    let (mut scheduler, clock) = scheduler();
    scheduler
        .create_task(TaskSpec::new("skewed", 0_u32).step(
            move |_: &mut TaskCx<'_>, n: &mut u32, _: u32| {
                *n += 1;
                if *n == 2 {
                    clock.advance(-5_000_000);
                } else {
                    clock.advance(BUDGET_US as i64);
                }
                StepResult::More
            },
        ))
        .unwrap();

    for _ in 0..4 {
        scheduler.tick();
    }

    let snapshot = scheduler.snapshot();
    let info = &snapshot.tasks[0];
    assert!(info.tick_cost_us.is_finite());
    assert!(info.tick_cost_us >= 0.0);
    assert!(info.tick_cost_us <= BUDGET_US as f64);
    assert!(info.wall_time_ms <= 4 * 4 * BUDGET_US / 1000 + 4);
}

// ---------------------------------------------------------------------------
// Signals and cancellation
// ---------------------------------------------------------------------------

#[test]
fn cancel_with_term_handler_invokes_it_once_then_kills() {
    let (mut scheduler, _clock) = scheduler();
    let (exits, on_done) = exit_recorder();
    let term_calls = Rc::new(Cell::new(0));
    let counter = Rc::clone(&term_calls);

    let id = scheduler
        .create_task(
            TaskSpec::new("stubborn", ())
                .step(forever)
                .on_signal(BgSignal::Term, move |cx: &mut TaskCx<'_>, _: &mut (), sig| {
                    assert_eq!(cx.signal(), Some(sig));
                    counter.set(counter.get() + 1);
                })
                .on_done(on_done),
        )
        .unwrap();
    scheduler.tick();

    scheduler.cancel(id).unwrap();

    assert_eq!(term_calls.get(), 1);
    assert_eq!(
        *exits.borrow(),
        vec![TaskExit {
            status: TaskStatus::Killed,
            exit_code: 0,
            signal: Some(BgSignal::Kill),
        }]
    );
    assert_eq!(scheduler.state(id), Some(TaskState::Exited));
    assert!(scheduler.is_idle());

    // Already exited: no-op until the record is freed.
    scheduler.cancel(id).unwrap();
    assert_eq!(term_calls.get(), 1);
    scheduler.tick();
    assert!(matches!(
        scheduler.cancel(id),
        Err(ShoalError::UnknownTask(_))
    ));
}

#[test]
fn cancel_leaves_an_already_queued_term_undelivered() {
    let (mut scheduler, _clock) = scheduler();
    let (exits, on_done) = exit_recorder();
    let term_calls = Rc::new(Cell::new(0));
    let counter = Rc::clone(&term_calls);

    let id = scheduler
        .create_task(
            TaskSpec::new("queued", ())
                .step(forever)
                .on_signal(BgSignal::Term, move |_: &mut TaskCx<'_>, _: &mut (), _| {
                    counter.set(counter.get() + 1);
                })
                .on_done(on_done),
        )
        .unwrap();

    assert!(scheduler.signal(id, BgSignal::Term).unwrap());
    scheduler.cancel(id).unwrap();

    assert_eq!(term_calls.get(), 1);
    assert_eq!(exits.borrow().len(), 1);
    assert_eq!(exits.borrow()[0].status, TaskStatus::Killed);
    assert_eq!(scheduler.state(id), Some(TaskState::Exited));
}

#[test]
fn term_raised_from_its_own_handler_does_not_repeat_on_cancel() {
    let (mut scheduler, _clock) = scheduler();
    let term_calls = Rc::new(Cell::new(0));
    let counter = Rc::clone(&term_calls);

    let id = scheduler
        .create_task(TaskSpec::new("echo", ()).step(forever).on_signal(
            BgSignal::Term,
            move |cx: &mut TaskCx<'_>, _: &mut (), _| {
                counter.set(counter.get() + 1);
                if counter.get() < 50 {
                    cx.raise(BgSignal::Term);
                }
            },
        ))
        .unwrap();

    scheduler.cancel(id).unwrap();

    assert_eq!(term_calls.get(), 1);
    assert_eq!(
        scheduler.collect(id).map(|exit| exit.status).unwrap(),
        TaskStatus::Killed
    );
}

#[test]
fn term_handler_may_exit_voluntarily() {
    let (mut scheduler, _clock) = scheduler();
    let (exits, on_done) = exit_recorder();

    let id = scheduler
        .create_task(
            TaskSpec::new("polite", ())
                .step(forever)
                .on_signal(BgSignal::Term, |cx: &mut TaskCx<'_>, _: &mut (), _| {
                    cx.exit(5);
                })
                .on_done(on_done),
        )
        .unwrap();

    scheduler.cancel(id).unwrap();

    assert_eq!(
        *exits.borrow(),
        vec![TaskExit {
            status: TaskStatus::Error,
            exit_code: 5,
            signal: Some(BgSignal::Term),
        }]
    );
}

#[test]
fn cancel_without_term_handler_kills_immediately() {
    let (mut scheduler, _clock) = scheduler();
    let (exits, on_done) = exit_recorder();
    let usr_calls = Rc::new(Cell::new(0));
    let counter = Rc::clone(&usr_calls);

    let id = scheduler
        .create_task(
            TaskSpec::new("plain", ())
                .step(forever)
                .on_signal(BgSignal::Usr, move |_: &mut TaskCx<'_>, _: &mut (), _| {
                    counter.set(counter.get() + 1);
                })
                .on_done(on_done),
        )
        .unwrap();

    scheduler.cancel(id).unwrap();

    assert_eq!(usr_calls.get(), 0);
    assert_eq!(exits.borrow().len(), 1);
    assert_eq!(exits.borrow()[0].status, TaskStatus::Killed);
    assert_eq!(scheduler.state(id), Some(TaskState::Exited));
}

#[test]
fn queued_signal_is_delivered_before_the_next_step() {
    let (mut scheduler, _clock) = scheduler();
    let log = Rc::new(RefCell::new(Vec::new()));
    let step_log = Rc::clone(&log);
    let handler_log = Rc::clone(&log);

    let id = scheduler
        .create_task(
            TaskSpec::new("listener", ())
                .step(move |_: &mut TaskCx<'_>, _: &mut (), _: u32| {
                    step_log.borrow_mut().push("step".to_owned());
                    StepResult::Done
                })
                .on_signal(BgSignal::Usr, move |_: &mut TaskCx<'_>, _: &mut (), sig| {
                    handler_log.borrow_mut().push(format!("handler {sig}"));
                }),
        )
        .unwrap();

    assert!(scheduler.signal(id, BgSignal::Usr).unwrap());
    assert!(!scheduler.signal(id, BgSignal::Term).unwrap());
    assert!(scheduler.signal(id, BgSignal::Zero).unwrap());
    assert!(log.borrow().is_empty());

    scheduler.tick();
    assert_eq!(*log.borrow(), vec!["handler USR", "step"]);
}

#[test]
fn self_raised_signal_is_handled_in_the_same_invocation() {
    let (mut scheduler, _clock) = scheduler();
    let log = Rc::new(RefCell::new(Vec::new()));
    let step_log = Rc::clone(&log);
    let handler_log = Rc::clone(&log);

    scheduler
        .create_task(
            TaskSpec::new("self signal", ())
                .step(move |cx: &mut TaskCx<'_>, _: &mut (), _: u32| {
                    step_log.borrow_mut().push(format!("step {}", cx.seqno()));
                    if cx.seqno() == 0 {
                        cx.raise(BgSignal::Usr);
                        StepResult::More
                    } else {
                        StepResult::Done
                    }
                })
                .on_signal(BgSignal::Usr, move |_: &mut TaskCx<'_>, _: &mut (), _| {
                    handler_log.borrow_mut().push("handler".to_owned());
                }),
        )
        .unwrap();

    run_until_idle(&mut scheduler, 10);
    assert_eq!(*log.borrow(), vec!["step 0", "handler", "step 1"]);
}

#[test]
fn self_kill_terminates_as_killed() {
    let (mut scheduler, _clock) = scheduler();
    let (exits, on_done) = exit_recorder();

    scheduler
        .create_task(
            TaskSpec::new("suicidal", ())
                .step(|cx: &mut TaskCx<'_>, _: &mut (), _: u32| {
                    cx.raise(BgSignal::Kill);
                    StepResult::More
                })
                .on_done(on_done),
        )
        .unwrap();
    run_until_idle(&mut scheduler, 10);

    assert_eq!(exits.borrow()[0].status, TaskStatus::Killed);
    assert_eq!(exits.borrow()[0].signal, Some(BgSignal::Kill));
}

#[test]
fn signal_handler_can_be_installed_later() {
    let (mut scheduler, _clock) = scheduler();
    let id = scheduler
        .create_task(TaskSpec::new("late", 0_u32).step(
            |_: &mut TaskCx<'_>, _: &mut u32, _: u32| StepResult::More,
        ))
        .unwrap();

    let first = scheduler
        .set_signal_handler(id, BgSignal::Usr, |_: &mut TaskCx<'_>, n: &mut u32, _| {
            *n += 1;
        })
        .unwrap();
    let second = scheduler
        .set_signal_handler(id, BgSignal::Usr, |_: &mut TaskCx<'_>, n: &mut u32, _| {
            *n += 10;
        })
        .unwrap();
    assert!(!first);
    assert!(second);
    assert!(matches!(
        scheduler.set_signal_handler(id, BgSignal::Zero, |_: &mut TaskCx<'_>, _: &mut u32, _| {}),
        Err(ShoalError::Untrappable(BgSignal::Zero))
    ));

    assert!(scheduler.signal(id, BgSignal::Usr).unwrap());
    scheduler.tick();
    assert_eq!(scheduler.context_mut::<u32>(id).copied(), Some(10));
}

// ---------------------------------------------------------------------------
// Daemons
// ---------------------------------------------------------------------------

fn recording_daemon(
    scheduler: &mut Scheduler,
    log: &Rc<RefCell<Vec<String>>>,
) -> TaskId {
    let start_log = Rc::clone(log);
    let end_log = Rc::clone(log);
    let notify_log = Rc::clone(log);
    scheduler
        .create_daemon(
            DaemonSpec::<Option<String>, String>::new("worker", None)
                .on_item_start(
                    move |_: &mut TaskCx<'_>, current: &mut Option<String>, item: &mut String| {
                        start_log.borrow_mut().push(format!("start {item}"));
                        *current = Some(item.clone());
                    },
                )
                .step(|_: &mut TaskCx<'_>, current: &mut Option<String>, _: u32| {
                    if current.is_some() {
                        StepResult::Next
                    } else {
                        StepResult::Error
                    }
                })
                .step(|_: &mut TaskCx<'_>, _: &mut Option<String>, _: u32| StepResult::Done)
                .on_item_end(
                    move |_: TaskId, current: &mut Option<String>, item: &mut String| {
                        assert_eq!(current.take().as_deref(), Some(item.as_str()));
                        end_log.borrow_mut().push(format!("end {item}"));
                    },
                )
                .on_notify(move |_: TaskId, event: DaemonEvent| {
                    notify_log.borrow_mut().push(format!("{event:?}"));
                }),
        )
        .unwrap()
}

#[test]
fn daemon_processes_items_in_order_and_sleeps_when_drained() {
    let (mut scheduler, _clock) = scheduler();
    let log = Rc::new(RefCell::new(Vec::new()));
    let daemon = recording_daemon(&mut scheduler, &log);

    assert_eq!(scheduler.state(daemon), Some(TaskState::Sleeping));
    assert!(scheduler.is_daemon(daemon));
    assert!(scheduler.is_idle());

    for item in ["x", "y", "z"] {
        scheduler.enqueue(daemon, item.to_owned()).unwrap();
    }
    assert_eq!(scheduler.queue_len(daemon), Some(3));
    assert_eq!(scheduler.runnable_count(), 1);

    run_until_idle(&mut scheduler, 10);

    assert_eq!(
        *log.borrow(),
        vec![
            "Started", "start x", "end x", "start y", "end y", "start z", "end z", "Stopped",
        ]
    );
    assert_eq!(scheduler.state(daemon), Some(TaskState::Sleeping));
    assert_eq!(scheduler.queue_len(daemon), Some(0));
}

#[test]
fn daemon_wakes_again_for_new_work() {
    let (mut scheduler, _clock) = scheduler();
    let log = Rc::new(RefCell::new(Vec::new()));
    let daemon = recording_daemon(&mut scheduler, &log);

    scheduler.enqueue(daemon, "a".to_owned()).unwrap();
    run_until_idle(&mut scheduler, 10);
    scheduler.enqueue(daemon, "b".to_owned()).unwrap();
    run_until_idle(&mut scheduler, 10);

    assert_eq!(
        *log.borrow(),
        vec!["Started", "start a", "end a", "Stopped", "Started", "start b", "end b", "Stopped"]
    );
}

#[test]
fn daemon_sleeps_exactly_when_its_queue_is_empty() {
    let (mut scheduler, clock) = scheduler();
    let step_clock = clock.clone();
    let daemon = scheduler
        .create_daemon(
            DaemonSpec::<(), u32>::new("slow", ()).step(
                move |cx: &mut TaskCx<'_>, _: &mut (), _: u32| {
                    step_clock.advance(BUDGET_US as i64);
                    if cx.seqno() < 2 {
                        StepResult::More
                    } else {
                        StepResult::Done
                    }
                },
            ),
        )
        .unwrap();

    let check = |scheduler: &Scheduler| {
        let snapshot = scheduler.snapshot();
        let info = snapshot
            .tasks
            .iter()
            .find(|task| task.id == daemon)
            .unwrap();
        assert_eq!(info.variant, TaskVariant::Daemon);
        assert_eq!(
            info.state == TaskState::Sleeping,
            info.queued_items == 0,
            "{info:?}"
        );
    };

    check(&scheduler);
    for round in 0..12_u32 {
        if round % 4 == 0 {
            scheduler.enqueue(daemon, round).unwrap();
            check(&scheduler);
        }
        scheduler.tick();
        check(&scheduler);
    }
}

#[test]
fn enqueue_rejects_wrong_targets() {
    let (mut scheduler, _clock) = scheduler();
    let log = Rc::new(RefCell::new(Vec::new()));
    let daemon = recording_daemon(&mut scheduler, &log);
    let plain = scheduler
        .create_task(TaskSpec::new("plain", ()).step(forever))
        .unwrap();

    assert!(matches!(
        scheduler.enqueue(daemon, 42_u32),
        Err(ShoalError::ItemType { task, .. }) if task == daemon
    ));
    assert!(matches!(
        scheduler.enqueue(plain, "x".to_owned()),
        Err(ShoalError::NotADaemon(_))
    ));
    assert_eq!(scheduler.queue_len(daemon), Some(0));
    assert!(log.borrow().is_empty());
}

#[test]
fn cancelled_daemon_frees_pending_items() {
    let (mut scheduler, _clock) = scheduler();
    let freed = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&freed);
    let daemon = scheduler
        .create_daemon(
            DaemonSpec::<(), u32>::new("stuck", ())
                .step(|_: &mut TaskCx<'_>, _: &mut (), _: u32| StepResult::More)
                .with_item_destructor(move |item: u32| sink.borrow_mut().push(item)),
        )
        .unwrap();

    for item in 1..=3_u32 {
        scheduler.enqueue(daemon, item).unwrap();
    }
    scheduler.tick();
    scheduler.cancel(daemon).unwrap();
    assert!(freed.borrow().is_empty());
    assert!(matches!(
        scheduler.enqueue(daemon, 4_u32),
        Err(ShoalError::TaskExited(_))
    ));

    scheduler.tick();
    assert_eq!(*freed.borrow(), vec![1, 2, 3]);
    assert_eq!(scheduler.state(daemon), None);
}

#[test]
fn cancelling_a_sleeping_daemon_delivers_term_once() {
    let (mut scheduler, _clock) = scheduler();
    let term_calls = Rc::new(Cell::new(0));
    let counter = Rc::clone(&term_calls);
    let daemon = scheduler
        .create_daemon(
            DaemonSpec::<(), u32>::new("sleeper", ())
                .step(|_: &mut TaskCx<'_>, _: &mut (), _: u32| StepResult::Done)
                .on_signal(BgSignal::Term, move |_: &mut TaskCx<'_>, _: &mut (), _| {
                    counter.set(counter.get() + 1);
                }),
        )
        .unwrap();

    scheduler.cancel(daemon).unwrap();

    assert_eq!(term_calls.get(), 1);
    assert_eq!(scheduler.state(daemon), Some(TaskState::Exited));
    assert_eq!(scheduler.runnable_count(), 0);
    assert!(scheduler.snapshot().sleep_queue.is_empty());
    scheduler.tick();
    assert_eq!(scheduler.state(daemon), None);
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[test]
fn shutdown_terminates_runnable_tasks_and_reports_them() {
    let (mut scheduler, _clock) = scheduler();
    let (exits, on_done) = exit_recorder();
    scheduler
        .create_task(TaskSpec::new("one", ()).step(forever).on_done(on_done))
        .unwrap();
    scheduler
        .create_task(TaskSpec::new("two", ()).step(forever))
        .unwrap();
    scheduler.tick();

    let report = scheduler.shutdown();

    assert_eq!(report.tasks, 2);
    assert_eq!(report.daemons, 0);
    assert_eq!(report.zombies, 0);
    assert_eq!(exits.borrow()[0].status, TaskStatus::Killed);
    assert!(scheduler.snapshot().tasks.is_empty());
    assert!(scheduler.is_idle());
}

#[test]
fn shutdown_counts_daemons_and_lost_zombies() {
    let (mut scheduler, _clock) = scheduler();
    let log = Rc::new(RefCell::new(Vec::new()));
    recording_daemon(&mut scheduler, &log);
    scheduler
        .create_task(
            TaskSpec::new("failed", ())
                .step(|_: &mut TaskCx<'_>, _: &mut (), _: u32| StepResult::Error),
        )
        .unwrap();
    scheduler.tick();

    let report = scheduler.shutdown();

    assert_eq!(report.tasks, 0);
    assert_eq!(report.daemons, 1);
    assert_eq!(report.zombies, 1);
    assert!(scheduler.snapshot().tasks.is_empty());
    assert!(scheduler.shutdown().is_clean());
}

#[test]
fn dropping_the_scheduler_releases_contexts() {
    let (mut scheduler, _clock) = scheduler();
    let released = Rc::new(Cell::new(false));
    let flag = Rc::clone(&released);
    scheduler
        .create_task(
            TaskSpec::new("orphan", ())
                .step(forever)
                .with_destructor(move |_: ()| flag.set(true)),
        )
        .unwrap();

    drop(scheduler);
    assert!(released.get());
}
