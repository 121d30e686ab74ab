//! Host event loop glue.
//!
//! The scheduler is not `Send`; drive it from a current-thread runtime or a
//! `LocalSet`.

use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::runner::{Scheduler, ShutdownReport};

/// Tick `scheduler` every `period` until `cancel` fires, then shut it down.
///
/// `on_tick` runs after each scheduling pass; the host uses it to feed
/// daemons, collect results, or cancel the token once it is done.
pub async fn drive<F>(
    scheduler: &mut Scheduler,
    period: Duration,
    cancel: CancellationToken,
    mut on_tick: F,
) -> ShutdownReport
where
    F: FnMut(&mut Scheduler),
{
    let period = period.max(Duration::from_millis(1));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(period_ms = period.as_millis() as u64, "background scheduler started");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("background scheduler cancelled");
                break;
            }
            _ = interval.tick() => {
                scheduler.tick();
                on_tick(scheduler);
            }
        }
    }

    let report = scheduler.shutdown();
    info!(
        tasks = report.tasks,
        daemons = report.daemons,
        zombies = report.zombies,
        "background scheduler stopped"
    );
    report
}
