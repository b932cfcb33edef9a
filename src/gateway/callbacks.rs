//! Button presses on delivered reminders.

use super::Gateway;
use crate::engine::{InteractionEvent, Outcome};
use nudge_core::{
    error::NudgeError,
    message::CallbackQuery,
    task::{decode_callback, TaskAction},
};
use tracing::{info, warn};

impl Gateway {
    pub(super) async fn handle_callback(&self, query: CallbackQuery) {
        let toast = match decode_callback(&query.data) {
            Some((task_id, action)) => {
                info!("[{}] {} pressed {}", query.channel, query.actor, query.data);
                let result = self
                    .engine
                    .handle(InteractionEvent {
                        task_id,
                        actor: query.actor.clone(),
                        action,
                    })
                    .await;
                toast(action, &result)
            }
            None => {
                warn!("unknown callback data: {}", query.data);
                "Unknown action"
            }
        };

        if let Some(channel) = self.channels.get(&query.channel) {
            if let Err(e) = channel.answer_callback(&query.id, Some(toast)).await {
                warn!("failed to answer callback {}: {e}", query.id);
            }
        }
    }
}

/// Short acknowledgement shown to the user after a button press.
pub(super) fn toast(action: TaskAction, result: &Result<Outcome, NudgeError>) -> &'static str {
    match result {
        Ok(Outcome::Applied(_)) => match action {
            TaskAction::Complete => "Marked as done",
            TaskAction::Cancel => "Reminder cancelled",
            TaskAction::Snooze { .. } => "Snoozed",
        },
        Ok(Outcome::AlreadyResolved(_)) => "Already resolved",
        Err(NudgeError::Auth(_)) => "This reminder isn't yours",
        Err(NudgeError::NotFound(_)) => "Reminder not found",
        Err(NudgeError::InvalidTransition { .. }) => "Too late for that",
        Err(NudgeError::Rejected(_)) => "That's too far ahead",
        Err(e) => {
            warn!("interaction failed: {e}");
            "Something went wrong, try again"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nudge_core::task::TaskStatus;

    #[test]
    fn test_toast_for_errors() {
        let snooze = TaskAction::Snooze { minutes: 15 };
        assert_eq!(
            toast(snooze, &Err(NudgeError::Auth("nope".into()))),
            "This reminder isn't yours"
        );
        assert_eq!(
            toast(
                TaskAction::Cancel,
                &Err(NudgeError::InvalidTransition {
                    from: TaskStatus::Sent,
                    event: "cancel",
                })
            ),
            "Too late for that"
        );
        assert_eq!(
            toast(snooze, &Err(NudgeError::NotFound("task x".into()))),
            "Reminder not found"
        );
        assert_eq!(
            toast(snooze, &Err(NudgeError::Rejected("too far".into()))),
            "That's too far ahead"
        );
        assert_eq!(
            toast(snooze, &Err(NudgeError::Conflict("busy".into()))),
            "Something went wrong, try again"
        );
    }
}
