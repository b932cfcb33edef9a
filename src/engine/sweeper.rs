//! Horizon sweeper: promotes CREATED tasks that fall due within the horizon.
//!
//! The sweep is the recovery mechanism; precision comes from the timers it arms.

use super::Engine;
use nudge_core::{
    error::NudgeError,
    lifecycle::TaskEvent,
    task::{Task, TaskStatus},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// What one sweep did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Promoted to SCHEDULED and armed.
    pub promoted: usize,
    /// Lost the compare-and-set to a concurrent writer.
    pub skipped: usize,
    /// Promoted with a due time already in the past (armed with zero delay).
    pub overdue: usize,
}

impl Engine {
    /// CREATED tasks the next sweep would promote.
    pub async fn sweep_candidates(&self) -> Result<Vec<Task>, NudgeError> {
        let until = self.clock.now() + self.config.horizon();
        self.store.due_before(TaskStatus::Created, until).await
    }

    /// Run one sweep.
    pub async fn sweep_once(self: &Arc<Self>) -> Result<SweepReport, NudgeError> {
        let now = self.clock.now();
        let candidates = self.sweep_candidates().await?;
        let mut report = SweepReport::default();

        for task in candidates {
            match self.commit(&task, &TaskEvent::Promote, now).await? {
                Some(transition) => {
                    if task.due_at <= now {
                        report.overdue += 1;
                    }
                    debug!(
                        "sweeper: promoted {} (fires in {}s)",
                        task.id,
                        task.delay_from(now).as_secs()
                    );
                    self.run_effects(&transition);
                    report.promoted += 1;
                }
                None => {
                    debug!("sweeper: {} changed concurrently, skipped", task.id);
                    report.skipped += 1;
                }
            }
        }

        if report.promoted > 0 || report.skipped > 0 {
            info!(
                "sweeper: promoted {} ({} overdue), skipped {}",
                report.promoted, report.overdue, report.skipped
            );
        }
        Ok(report)
    }

    /// Background loop: sweep on a fixed tick. Missed ticks are skipped, the
    /// next sweep catches up.
    pub async fn run_sweeper(self: Arc<Self>) {
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            "sweeper: every {}s, horizon {}s",
            period.as_secs(),
            self.config.horizon_secs
        );

        loop {
            tick.tick().await;
            if let Err(e) = self.sweep_once().await {
                error!("sweeper: {e}");
            }
        }
    }
}
