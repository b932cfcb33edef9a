//! Interaction handler: cancel, complete and snooze arriving out of band.

use super::{render, Engine};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use nudge_core::{
    error::NudgeError,
    lifecycle::TaskEvent,
    task::{Task, TaskAction},
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A user action on a task, e.g. from a notification button.
#[derive(Debug, Clone)]
pub struct InteractionEvent {
    pub task_id: String,
    /// Platform user id of whoever acted; must own the task.
    pub actor: String,
    pub action: TaskAction,
}

/// Result of an interaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The transition was committed; carries the task afterwards.
    Applied(Task),
    /// The task was already in a terminal status; nothing changed.
    AlreadyResolved(Task),
}

impl Outcome {
    pub fn task(&self) -> &Task {
        match self {
            Self::Applied(t) | Self::AlreadyResolved(t) => t,
        }
    }
}

/// The lifecycle event for an action. A snooze may not land further out than
/// `max_lead` from now.
fn event_for(
    action: TaskAction,
    now: DateTime<Utc>,
    max_lead: chrono::Duration,
) -> Result<TaskEvent, NudgeError> {
    Ok(match action {
        TaskAction::Cancel => TaskEvent::Cancel,
        TaskAction::Complete => TaskEvent::Complete,
        TaskAction::Snooze { minutes } => {
            let until = now
                .checked_add_signed(chrono::Duration::minutes(i64::from(minutes)))
                .filter(|until| *until <= now + max_lead)
                .ok_or_else(|| {
                    NudgeError::Rejected(format!("snooze of {minutes} minutes is too far ahead"))
                })?;
            TaskEvent::Snooze { until }
        }
    })
}

impl Engine {
    /// Apply a user action. A lost compare-and-set is retried once against a
    /// fresh read; pressing a button on an already resolved task is a no-op.
    pub async fn handle(self: &Arc<Self>, event: InteractionEvent) -> Result<Outcome, NudgeError> {
        let mut task = self.store.require_task(&event.task_id).await?;
        if task.owner != event.actor {
            return Err(NudgeError::Auth(format!(
                "{} does not own task {}",
                event.actor, event.task_id
            )));
        }

        for round in 0..2 {
            if task.status.is_terminal() {
                debug!("interaction: {} already resolved", task.id);
                return Ok(Outcome::AlreadyResolved(task));
            }

            let now = self.clock.now();
            let lifecycle_event = event_for(event.action, now, self.config.max_lead())?;
            if let Some(transition) = self.commit(&task, &lifecycle_event, now).await?
            {
                info!(
                    "interaction: {} {} -> {}",
                    event.action.label(),
                    task.id,
                    transition.task.status
                );
                self.run_effects(&transition);
                let updated = self.promote_if_due(transition.task, now).await?;
                self.update_notification(&task, &updated, event.action).await;
                return Ok(Outcome::Applied(updated));
            }

            if round == 0 {
                debug!("interaction: {} changed underneath, retrying", task.id);
                task = self.store.require_task(&event.task_id).await?;
            }
        }

        Err(NudgeError::Conflict(format!(
            "task {} kept changing, {} not applied",
            event.task_id,
            event.action.label()
        )))
    }

    /// Replace the delivered notification's text and drop its buttons.
    async fn update_notification(&self, before: &Task, after: &Task, action: TaskAction) {
        let Some(message_ref) = before.message_ref.as_deref() else {
            return;
        };
        let Some(channel) = self.channels.get(&before.channel) else {
            return;
        };
        let tz = self.user_timezone(&before.owner).await;
        let text = render::resolved(after, action, tz);
        if let Err(e) = channel
            .edit_message(&before.reply_target, message_ref, &text)
            .await
        {
            warn!("interaction: could not edit notification for {}: {e}", before.id);
        }
    }

    /// The owner's timezone, UTC when unknown or unreadable.
    pub(super) async fn user_timezone(&self, owner: &str) -> Tz {
        match self.store.get_timezone(owner).await {
            Ok(Some(name)) => name.parse().unwrap_or(chrono_tz::UTC),
            Ok(None) => chrono_tz::UTC,
            Err(e) => {
                warn!("interaction: timezone lookup for {owner} failed: {e}");
                chrono_tz::UTC
            }
        }
    }
}
