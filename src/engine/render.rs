//! User-facing text and buttons.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use nudge_core::{
    message::{Button, OutgoingMessage},
    task::{encode_callback, Task, TaskAction, TaskStatus},
};

/// Render a due reminder: the text plus snooze, done and cancel buttons.
pub fn notification(task: &Task, snooze_minutes: &[u32]) -> OutgoingMessage {
    let snooze_row = snooze_minutes
        .iter()
        .map(|&minutes| Button {
            label: snooze_label(minutes),
            data: encode_callback(&task.id, TaskAction::Snooze { minutes }),
        })
        .collect();
    let resolve_row = vec![
        Button {
            label: "\u{2705} Done".to_string(),
            data: encode_callback(&task.id, TaskAction::Complete),
        },
        Button {
            label: "\u{2716} Cancel".to_string(),
            data: encode_callback(&task.id, TaskAction::Cancel),
        },
    ];

    OutgoingMessage {
        text: format!("\u{23f0} {}", task.description),
        reply_target: task.reply_target.clone(),
        buttons: vec![snooze_row, resolve_row],
        reply_keyboard: None,
    }
}

/// "+15 min", "+1 h", "+1 h 30 min".
pub fn snooze_label(minutes: u32) -> String {
    match (minutes / 60, minutes % 60) {
        (0, m) => format!("+{m} min"),
        (h, 0) => format!("+{h} h"),
        (h, m) => format!("+{h} h {m} min"),
    }
}

/// `dd.mm.yyyy HH:MM` in the user's timezone.
pub fn local_time(at: DateTime<Utc>, tz: Tz) -> String {
    at.with_timezone(&tz).format("%d.%m.%Y %H:%M").to_string()
}

/// Replacement text for a notification after the user acted on it.
pub fn resolved(task: &Task, action: TaskAction, tz: Tz) -> String {
    match action {
        TaskAction::Complete => format!("\u{2705} {}\n\nDone.", task.description),
        TaskAction::Cancel => format!("\u{2716} {}\n\nCancelled.", task.description),
        TaskAction::Snooze { .. } => format!(
            "\u{23f0} {}\n\nSnoozed until {}.",
            task.description,
            local_time(task.due_at, tz)
        ),
    }
}

/// Reply to a successfully scheduled request.
pub fn confirmation(task: &Task, tz: Tz) -> String {
    format!(
        "Got it. I'll remind you on {}:\n{}",
        local_time(task.due_at, tz),
        task.description
    )
}

/// `/tasks` listing.
pub fn task_list(tasks: &[Task], tz: Tz) -> String {
    if tasks.is_empty() {
        return "No pending reminders.".to_string();
    }
    let mut out = String::from("Pending reminders:\n");
    for task in tasks {
        let marker = match task.status {
            TaskStatus::Sent => " (sent)",
            _ => "",
        };
        out.push_str(&format!(
            "\n{} [{}] {}{marker}",
            local_time(task.due_at, tz),
            task.short_id(),
            task.description
        ));
    }
    out
}
