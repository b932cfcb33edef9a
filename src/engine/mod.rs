//! Scheduling engine: ingestion, horizon sweep, precise dispatch and user
//! interactions on top of the task store.
//!
//! Every status change goes through [`Engine::commit`]: the pure
//! state machine computes the next task, the store persists it with a
//! compare-and-set on `(status, version)`, and the caller then carries out the
//! transition's effects (arm/unarm a timer, touch the calendar mirror).

mod dispatcher;
mod ingest;
mod interaction;
mod mirror;
pub mod render;
mod sweeper;

#[cfg(test)]
mod tests;

pub use dispatcher::TimerArena;
pub use ingest::{IngestOutcome, IngestRequest};
pub use interaction::{InteractionEvent, Outcome};
pub use sweeper::SweepReport;

use chrono::{DateTime, Utc};
use mirror::{MirrorLocks, MirrorOp};
use nudge_core::{
    clock::Clock,
    config::SchedulerConfig,
    error::NudgeError,
    lifecycle::{self, Effect, LifecyclePolicy, TaskEvent, Transition},
    task::{Task, TaskStatus},
    traits::{CalendarMirror, Channel, ReminderParser},
};
use nudge_store::{AuditEntry, AuditLogger, Store, StoreStats};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// The scheduling engine. Shared as `Arc<Engine>`; timers hold a clone.
pub struct Engine {
    pub(super) store: Store,
    pub(super) audit: AuditLogger,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) channels: HashMap<String, Arc<dyn Channel>>,
    pub(super) parser: Arc<dyn ReminderParser>,
    pub(super) mirror: Option<Arc<dyn CalendarMirror>>,
    pub(super) config: SchedulerConfig,
    pub(super) policy: LifecyclePolicy,
    /// Attempts per calendar call before giving up.
    pub(super) mirror_attempts: u32,
    pub(super) mirror_locks: MirrorLocks,
    pub(super) timers: TimerArena,
}

impl Engine {
    /// Create a new engine.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        clock: Arc<dyn Clock>,
        channels: HashMap<String, Arc<dyn Channel>>,
        parser: Arc<dyn ReminderParser>,
        mirror: Option<Arc<dyn CalendarMirror>>,
        config: SchedulerConfig,
        mirror_attempts: u32,
    ) -> Self {
        let audit = AuditLogger::new(store.pool().clone());
        let policy = config.lifecycle_policy();
        Self {
            store,
            audit,
            clock,
            channels,
            parser,
            mirror,
            config,
            policy,
            mirror_attempts: mirror_attempts.max(1),
            mirror_locks: MirrorLocks::default(),
            timers: TimerArena::default(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Number of timers currently armed in this process.
    pub fn armed_timers(&self) -> usize {
        self.timers.len()
    }

    pub async fn stats(&self) -> Result<StoreStats, NudgeError> {
        self.store.stats(self.config.max_send_attempts.max(1)).await
    }

    /// Apply `event` to `task` and persist it.
    ///
    /// Returns `None` when the compare-and-set lost to a concurrent writer.
    /// Illegal transitions are errors and never reach the store.
    pub(super) async fn commit(
        &self,
        task: &Task,
        event: &TaskEvent,
        now: DateTime<Utc>,
    ) -> Result<Option<Transition>, NudgeError> {
        let transition = lifecycle::apply(task, event, now, &self.policy)?;
        if !self.store.compare_and_set(task, &transition.task).await? {
            return Ok(None);
        }
        self.record(
            &transition.task.id,
            event.name(),
            Some(transition.from),
            transition.task.status,
            None,
            now,
        )
        .await;
        Ok(Some(transition))
    }

    /// Carry out a committed transition's side effects.
    pub(super) fn run_effects(self: &Arc<Self>, transition: &Transition) {
        let task = &transition.task;
        for effect in &transition.effects {
            match effect {
                Effect::Arm { .. } => self.arm(task),
                Effect::Unarm => {
                    self.timers.unarm(&task.id);
                }
                Effect::RetireMirror => self.sync_mirror(MirrorOp::Retire, task.clone()),
                Effect::CompleteMirror => self.sync_mirror(MirrorOp::Complete, task.clone()),
                Effect::RetimeMirror => self.sync_mirror(MirrorOp::Retime, task.clone()),
            }
        }
    }

    /// Promote a CREATED task that is already inside the horizon and arm it.
    ///
    /// Returns the task as it stands afterwards. A lost compare-and-set is not
    /// an error: whoever won owns the task now and the sweep is the fallback.
    pub(super) async fn promote_if_due(
        self: &Arc<Self>,
        task: Task,
        now: DateTime<Utc>,
    ) -> Result<Task, NudgeError> {
        if task.status != TaskStatus::Created || !task.due_within(now, self.config.horizon()) {
            return Ok(task);
        }
        match self.commit(&task, &TaskEvent::Promote, now).await? {
            Some(transition) => {
                self.run_effects(&transition);
                Ok(transition.task)
            }
            None => {
                info!("engine: promotion of {} lost a race, leaving it to the sweep", task.id);
                Ok(task)
            }
        }
    }

    /// Re-arm timers for SCHEDULED tasks after a restart.
    ///
    /// Tasks that used up every delivery attempt stay parked for
    /// [`Engine::requeue`]. A task interrupted mid-backoff resumes with the
    /// attempts it has left.
    pub async fn recover(self: &Arc<Self>) -> Result<usize, NudgeError> {
        let max = i64::from(self.config.max_send_attempts.max(1));
        let scheduled = self.store.tasks_with_status(TaskStatus::Scheduled).await?;
        let mut armed = 0;
        for task in &scheduled {
            if task.attempts >= max {
                warn!(
                    "recovery: {} gave up after {} attempts ({}), run `nudge requeue {}`",
                    task.id,
                    task.attempts,
                    task.last_error.as_deref().unwrap_or_default(),
                    task.id
                );
                continue;
            }
            self.arm(task);
            armed += 1;
        }
        info!("recovery: re-armed {armed} of {} scheduled tasks", scheduled.len());
        Ok(armed)
    }

    /// Administrative recovery: put a SCHEDULED task back to CREATED with a
    /// clean attempt counter so the next sweep picks it up again.
    pub async fn requeue(self: &Arc<Self>, task_id: &str) -> Result<Task, NudgeError> {
        let task = self.store.require_task(task_id).await?;
        let now = self.clock.now();
        match self.commit(&task, &TaskEvent::Deschedule, now).await? {
            Some(transition) => {
                self.run_effects(&transition);
                info!("engine: requeued {task_id}");
                Ok(transition.task)
            }
            None => Err(NudgeError::Conflict(format!(
                "task {task_id} changed while requeueing"
            ))),
        }
    }

    /// Best-effort audit write.
    pub(super) async fn record(
        &self,
        task_id: &str,
        event: &str,
        from: Option<TaskStatus>,
        to: TaskStatus,
        detail: Option<String>,
        at: DateTime<Utc>,
    ) {
        let entry = AuditEntry {
            task_id: task_id.to_string(),
            event: event.to_string(),
            from_status: from,
            to_status: to,
            detail,
            at,
        };
        if let Err(e) = self.audit.log(&entry).await {
            warn!("audit: {e}");
        }
    }
}
