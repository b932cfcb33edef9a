//! Task lifecycle state machine.
//!
//! Pure logic: given a task, an event and the current time, compute the next
//! task value and the side effects the caller must carry out. Persistence
//! (compare-and-set) and side-effect execution live in the engine.
//!
//! ```text
//!            promote            deliver
//! CREATED ───────────▶ SCHEDULED ───────▶ SENT
//!    ▲ ▲   deschedule      │                │
//!    │ └───────────────────┤                │
//!    │      snooze         │                │ done
//!    └─────────────────────┤                ▼
//!                          └──cancel/done─▶ COMPLETED
//! ```

use crate::error::NudgeError;
use crate::task::{CompletionReason, Task, TaskStatus};
use chrono::{DateTime, Utc};

/// Policy knobs that change which transitions are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecyclePolicy {
    /// Allow snoozing a task whose notification was already delivered
    /// (SENT → CREATED). When false, snooze applies to CREATED/SCHEDULED only.
    pub snooze_after_send: bool,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            snooze_after_send: true,
        }
    }
}

/// An event that drives a task from one status to another.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    /// Sweep (or creation) found the task inside the dispatch horizon.
    Promote,
    /// The notification was handed to the messaging transport.
    Deliver { message_ref: Option<String> },
    /// The user cancelled the reminder.
    Cancel,
    /// The user marked the reminder done.
    Complete,
    /// The user pushed the reminder to a new due time.
    Snooze { until: DateTime<Utc> },
    /// Administrative de-scheduling of a task whose delivery gave up.
    Deschedule,
}

impl TaskEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Promote => "promote",
            Self::Deliver { .. } => "deliver",
            Self::Cancel => "cancel",
            Self::Complete => "complete",
            Self::Snooze { .. } => "snooze",
            Self::Deschedule => "deschedule",
        }
    }
}

/// A side effect the caller must perform once the transition is committed.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Arm a one-shot timer firing at `at`.
    Arm { at: DateTime<Utc> },
    /// Drop any armed timer for the task.
    Unarm,
    /// Remove the calendar mirror.
    RetireMirror,
    /// Mark the calendar mirror done.
    CompleteMirror,
    /// Move the calendar mirror to the new due time.
    RetimeMirror,
}

/// Result of applying an event: the new task value plus required effects.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: TaskStatus,
    pub task: Task,
    pub effects: Vec<Effect>,
}

/// Apply `event` to `task` at time `now`.
///
/// The returned task carries `version + 1`; callers persist it with a
/// compare-and-set on the original `(status, version)`.
pub fn apply(
    task: &Task,
    event: &TaskEvent,
    now: DateTime<Utc>,
    policy: &LifecyclePolicy,
) -> Result<Transition, NudgeError> {
    use TaskStatus::*;

    let invalid = || NudgeError::InvalidTransition {
        from: task.status,
        event: event.name(),
    };

    let mut next = task.clone();
    next.version = task.version + 1;

    let effects = match (task.status, event) {
        (Created, TaskEvent::Promote) => {
            next.status = Scheduled;
            vec![Effect::Arm { at: task.due_at }]
        }
        (Created | Scheduled, TaskEvent::Deliver { message_ref }) => {
            next.status = Sent;
            next.message_ref = message_ref.clone();
            next.last_error = None;
            Vec::new()
        }
        (Created | Scheduled, TaskEvent::Cancel) => {
            complete(&mut next, CompletionReason::Cancelled, now);
            vec![Effect::Unarm, Effect::RetireMirror]
        }
        (Created | Scheduled | Sent, TaskEvent::Complete) => {
            complete(&mut next, CompletionReason::Done, now);
            vec![Effect::Unarm, Effect::CompleteMirror]
        }
        (Created | Scheduled, TaskEvent::Snooze { until }) => {
            reschedule(&mut next, *until);
            vec![Effect::Unarm, Effect::RetimeMirror]
        }
        (Sent, TaskEvent::Snooze { until }) if policy.snooze_after_send => {
            reschedule(&mut next, *until);
            vec![Effect::Unarm, Effect::RetimeMirror]
        }
        (Scheduled, TaskEvent::Deschedule) => {
            next.status = Created;
            next.attempts = 0;
            next.last_error = None;
            vec![Effect::Unarm]
        }
        _ => return Err(invalid()),
    };

    Ok(Transition {
        from: task.status,
        task: next,
        effects,
    })
}

fn complete(task: &mut Task, reason: CompletionReason, now: DateTime<Utc>) {
    task.status = TaskStatus::Completed;
    task.completion_reason = Some(reason);
    task.completed_at = Some(now);
}

fn reschedule(task: &mut Task, until: DateTime<Utc>) {
    task.status = TaskStatus::Created;
    task.due_at = until;
    task.attempts = 0;
    task.last_error = None;
}
