//! The reminder task record and its status vocabulary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a task.
///
/// `Completed` is the only terminal status. Cancellation is a completion with
/// [`CompletionReason::Cancelled`], not a separate status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Stored, not yet within the dispatch horizon.
    Created,
    /// Promoted and armed with a one-shot timer.
    Scheduled,
    /// Notification handed to the messaging transport.
    Sent,
    /// Resolved by the user (done or cancelled).
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Scheduled => "scheduled",
            Self::Sent => "sent",
            Self::Completed => "completed",
        }
    }

    /// Whether a pending delivery for a task in this status may still go out.
    pub fn is_deliverable(&self) -> bool {
        matches!(self, Self::Created | Self::Scheduled)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "scheduled" => Ok(Self::Scheduled),
            "sent" => Ok(Self::Sent),
            "completed" => Ok(Self::Completed),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// Why a task reached `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionReason {
    Done,
    Cancelled,
}

impl CompletionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Cancelled => "cancelled",
        }
    }
}

impl FromStr for CompletionReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "done" => Ok(Self::Done),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown completion reason '{other}'")),
        }
    }
}

/// A reminder: the unit of scheduling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Platform user id of the owner.
    pub owner: String,
    /// Messaging channel name (e.g. "telegram").
    pub channel: String,
    /// Platform-specific delivery target (e.g. Telegram chat_id).
    pub reply_target: String,
    pub description: String,
    pub due_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    pub completion_reason: Option<CompletionReason>,
    /// Identifier of the inbound request that produced this task.
    pub dedup_key: String,
    /// Handle of the mirrored calendar event, if any.
    pub external_event_ref: Option<String>,
    /// Transport message id of the delivered notification.
    pub message_ref: Option<String>,
    /// Bumped by every status transition; the compare-and-set token.
    pub version: i64,
    pub attempts: i64,
    pub last_error: Option<String>,
}

impl Task {
    /// Time left until `due_at`, clamped at zero for overdue tasks.
    pub fn delay_from(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.due_at - now).to_std().unwrap_or_default()
    }

    /// Whether the task is due within `horizon` of `now` (overdue counts).
    pub fn due_within(&self, now: DateTime<Utc>, horizon: chrono::Duration) -> bool {
        self.due_at <= now + horizon
    }

    /// Short id used in user-facing listings.
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(8)]
    }
}

/// Everything needed to insert a fresh task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub owner: String,
    pub channel: String,
    pub reply_target: String,
    pub description: String,
    pub due_at: DateTime<Utc>,
    pub dedup_key: String,
}

/// A user-initiated action on a task, usually from a notification button.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskAction {
    Cancel,
    Complete,
    Snooze { minutes: u32 },
}

impl TaskAction {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Cancel => "cancel",
            Self::Complete => "done",
            Self::Snooze { .. } => "snooze",
        }
    }
}

/// Encode a task action as compact callback data (`done:<id>`, `snooze:<id>:<min>`).
pub fn encode_callback(task_id: &str, action: TaskAction) -> String {
    match action {
        TaskAction::Snooze { minutes } => format!("snooze:{task_id}:{minutes}"),
        other => format!("{}:{task_id}", other.label()),
    }
}

/// Parse callback data produced by [`encode_callback`].
pub fn decode_callback(data: &str) -> Option<(String, TaskAction)> {
    let mut parts = data.splitn(3, ':');
    let kind = parts.next()?;
    let task_id = parts.next().filter(|id| !id.is_empty())?.to_string();
    let action = match (kind, parts.next()) {
        ("cancel", None) => TaskAction::Cancel,
        ("done", None) => TaskAction::Complete,
        ("snooze", Some(min)) => {
            let minutes: u32 = min.parse().ok().filter(|m| *m > 0)?;
            TaskAction::Snooze { minutes }
        }
        _ => return None,
    };
    Some((task_id, action))
}
