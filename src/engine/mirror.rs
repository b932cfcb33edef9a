//! Calendar mirror sync: fire-and-forget with bounded retries.
//!
//! Mirror failures are logged and never touch task status. Calls for one task
//! run one at a time and always push the task's current state, so the mirror
//! ends up matching the last committed transition whatever order the spawned
//! updates run in.

use super::Engine;
use nudge_core::{
    error::NudgeError,
    task::{CompletionReason, Task, TaskStatus},
    traits::CalendarMirror,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Per-task locks serializing mirror calls.
#[derive(Default)]
pub(crate) struct MirrorLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl MirrorLocks {
    fn for_task(&self, task_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // Entries nobody holds or waits on are dropped.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(task_id.to_string()).or_default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MirrorOp {
    Create,
    Retime,
    Complete,
    Retire,
}

impl MirrorOp {
    fn name(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Retime => "retime",
            Self::Complete => "complete",
            Self::Retire => "retire",
        }
    }
}

impl Engine {
    /// Spawn a mirror update for `task`. No-op without a configured mirror.
    pub(super) fn sync_mirror(self: &Arc<Self>, op: MirrorOp, task: Task) {
        let Some(mirror) = self.mirror.clone() else {
            return;
        };
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let lock = engine.mirror_locks.for_task(&task.id);
            let _serial = lock.lock().await;
            if let Err(e) = engine.apply_mirror(mirror.as_ref(), op, &task).await {
                warn!("mirror: {} of {} failed: {e}", op.name(), task.id);
            }
        });
    }

    async fn apply_mirror(
        &self,
        mirror: &dyn CalendarMirror,
        op: MirrorOp,
        task: &Task,
    ) -> Result<(), NudgeError> {
        if op == MirrorOp::Create {
            return self.create_mirror(mirror, task).await;
        }

        // `task` may be stale by now; push whatever is current.
        let Some(current) = self.store.get_task(&task.id).await? else {
            return Ok(());
        };
        let Some(event_ref) = current.external_event_ref.clone() else {
            debug!("mirror: {} has no mirror yet, {} skipped", task.id, op.name());
            return Ok(());
        };
        self.converge(mirror, &event_ref, &current).await
    }

    async fn create_mirror(&self, mirror: &dyn CalendarMirror, task: &Task) -> Result<(), NudgeError> {
        let event_ref = self
            .with_retries("create", || mirror.create_mirror(task))
            .await?;
        self.store.set_external_ref(&task.id, Some(&event_ref)).await?;
        info!("mirror: {} -> {event_ref}", task.id);

        // Catch up with whatever happened while the call was in flight.
        match self.store.get_task(&task.id).await? {
            Some(current)
                if current.status == TaskStatus::Completed || current.due_at != task.due_at =>
            {
                self.converge(mirror, &event_ref, &current).await
            }
            _ => Ok(()),
        }
    }

    /// Bring the mirror in line with the task's current state.
    async fn converge(
        &self,
        mirror: &dyn CalendarMirror,
        event_ref: &str,
        current: &Task,
    ) -> Result<(), NudgeError> {
        match (current.status, current.completion_reason) {
            (TaskStatus::Completed, Some(CompletionReason::Cancelled)) => {
                self.retire(mirror, event_ref, current).await
            }
            (TaskStatus::Completed, _) => {
                self.with_retries("complete", || mirror.mark_mirror_done(event_ref, current))
                    .await
            }
            _ => {
                self.with_retries("update", || mirror.update_mirror(event_ref, current))
                    .await
            }
        }
    }

    async fn retire(
        &self,
        mirror: &dyn CalendarMirror,
        event_ref: &str,
        task: &Task,
    ) -> Result<(), NudgeError> {
        self.with_retries("delete", || mirror.delete_mirror(event_ref))
            .await?;
        self.store.set_external_ref(&task.id, None).await
    }

    async fn with_retries<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T, NudgeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, NudgeError>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.mirror_attempts => {
                    debug!(
                        "mirror: {what} attempt {attempt}/{} failed: {e}",
                        self.mirror_attempts
                    );
                    let backoff = self.config.retry_backoff_ms.saturating_mul(u64::from(attempt));
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
