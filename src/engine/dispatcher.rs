//! Dispatcher: one-shot timers per task and the guarded delivery path.

use super::{render, Engine};
use nudge_core::{
    error::NudgeError,
    lifecycle::TaskEvent,
    task::{Task, TaskStatus},
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct ArmedTimer {
    version: i64,
    handle: JoinHandle<()>,
}

/// Armed timer handles keyed by task id.
///
/// A timer is only abortable while it sleeps: once it fires it removes
/// itself from the arena, and from then on only the store's compare-and-set
/// decides whether its delivery still counts.
#[derive(Default)]
pub struct TimerArena {
    armed: Mutex<HashMap<String, ArmedTimer>>,
}

impl TimerArena {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, ArmedTimer>> {
        self.armed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Arm a timer for `version` of a task, spawning it with `spawn`.
    ///
    /// Arming the same version twice is a no-op and so is arming an older
    /// version than the one already armed. A newer version replaces (and
    /// aborts) the older timer. The lock is held across `spawn` so a timer
    /// that fires at once still finds itself registered.
    fn arm<F>(&self, task_id: &str, version: i64, spawn: F) -> bool
    where
        F: FnOnce() -> JoinHandle<()>,
    {
        let mut armed = self.lock();
        if let Some(existing) = armed.get(task_id) {
            if existing.version > version
                || (existing.version == version && !existing.handle.is_finished())
            {
                return false;
            }
        }
        let handle = spawn();
        if let Some(old) = armed.insert(task_id.to_string(), ArmedTimer { version, handle }) {
            old.handle.abort();
        }
        true
    }

    /// Claim a fired timer. `false` means it was unarmed or superseded.
    fn take(&self, task_id: &str, version: i64) -> bool {
        let mut armed = self.lock();
        match armed.get(task_id) {
            Some(timer) if timer.version == version => {
                armed.remove(task_id);
                true
            }
            _ => false,
        }
    }

    /// Abort the sleeping timer for a task, if any.
    pub fn unarm(&self, task_id: &str) -> bool {
        match self.lock().remove(task_id) {
            Some(timer) => {
                timer.handle.abort();
                debug!("dispatcher: unarmed {task_id} v{}", timer.version);
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn is_armed(&self, task_id: &str) -> bool {
        self.lock().contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Engine {
    /// Arm a one-shot timer for the task's current version at its due time.
    /// Overdue tasks fire immediately.
    pub(super) fn arm(self: &Arc<Self>, task: &Task) {
        let task_id = task.id.clone();
        let version = task.version;
        let at = task.due_at;
        let engine = Arc::clone(self);

        let armed = self.timers.arm(&task.id, version, move || {
            tokio::spawn(async move {
                engine.clock.sleep_until(at).await;
                if engine.timers.take(&task_id, version) {
                    engine.fire(&task_id, version).await;
                }
            })
        });

        if armed {
            debug!(
                "dispatcher: armed {} v{version} in {}s",
                task.id,
                task.delay_from(self.clock.now()).as_secs()
            );
        }
    }

    async fn fire(&self, task_id: &str, version: i64) {
        if let Err(e) = self.deliver(task_id, version).await {
            error!("dispatcher: delivery of {task_id} failed: {e}");
        }
    }

    /// Deliver with bounded retries, re-validating before every attempt.
    ///
    /// The attempt count lives in the store, so a delivery re-armed after a
    /// restart picks up where the previous process stopped.
    async fn deliver(&self, task_id: &str, version: i64) -> Result<(), NudgeError> {
        let max = self.config.max_send_attempts.max(1);

        loop {
            let Some(task) = self.store.get_task(task_id).await? else {
                warn!("dispatcher: {task_id} vanished before delivery");
                return Ok(());
            };
            if !task.status.is_deliverable() || task.version != version {
                debug!(
                    "dispatcher: {task_id} v{version} is stale (now {} v{}), suppressed",
                    task.status, task.version
                );
                return Ok(());
            }

            let attempt = u32::try_from(task.attempts)
                .unwrap_or(u32::MAX)
                .saturating_add(1);
            if attempt > max {
                let reason = task.last_error.unwrap_or_default();
                return self.give_up(task_id, max, reason).await;
            }

            let error = match self.send_notification(&task).await {
                Ok(message_ref) => return self.mark_sent(&task, message_ref).await,
                Err(e) => e.to_string(),
            };

            warn!("dispatcher: attempt {attempt}/{max} for {task_id} failed: {error}");
            if !self
                .store
                .record_attempt_failure(task_id, version, &error)
                .await?
            {
                return Ok(());
            }
            if attempt >= max {
                return self.give_up(task_id, max, error).await;
            }
            tokio::time::sleep(self.backoff(attempt)).await;
        }
    }

    async fn give_up(&self, task_id: &str, max: u32, error: String) -> Result<(), NudgeError> {
        error!("dispatcher: giving up on {task_id} after {max} attempts, left scheduled");
        self.record(
            task_id,
            "give_up",
            Some(TaskStatus::Scheduled),
            TaskStatus::Scheduled,
            Some(error),
            self.clock.now(),
        )
        .await;
        Ok(())
    }

    async fn send_notification(&self, task: &Task) -> Result<String, NudgeError> {
        let channel = self
            .channels
            .get(&task.channel)
            .ok_or_else(|| NudgeError::Channel(format!("no channel named {}", task.channel)))?;
        let message = render::notification(task, &self.config.snooze_options_minutes);
        let timeout = Duration::from_secs(self.config.send_timeout_secs);
        tokio::time::timeout(timeout, channel.send(message))
            .await
            .map_err(|_| {
                NudgeError::Channel(format!(
                    "send timed out after {}s",
                    self.config.send_timeout_secs
                ))
            })?
    }

    async fn mark_sent(&self, task: &Task, message_ref: String) -> Result<(), NudgeError> {
        let event = TaskEvent::Deliver {
            message_ref: Some(message_ref),
        };
        match self.commit(task, &event, self.clock.now()).await? {
            Some(_) => info!("dispatcher: delivered {}", task.id),
            // The transport already has it; nothing left to suppress.
            None => warn!(
                "dispatcher: {} changed while its notification was in flight",
                task.id
            ),
        }
        Ok(())
    }

    /// `retry_backoff_ms * 2^(attempt - 1)`.
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.config.retry_backoff_ms.saturating_mul(factor))
    }
}
