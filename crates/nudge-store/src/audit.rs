//! Audit trail: one row per applied task transition.

use chrono::{DateTime, Utc};
use nudge_core::error::NudgeError;
use nudge_core::task::TaskStatus;
use sqlx::SqlitePool;
use tracing::debug;

use crate::store::{parse_ts, ts};

/// An entry to write to the audit trail.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub task_id: String,
    /// Event name, e.g. "promote" or "snooze".
    pub event: String,
    /// `None` for the initial insert.
    pub from_status: Option<TaskStatus>,
    pub to_status: TaskStatus,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

/// Audit logger backed by SQLite.
#[derive(Clone)]
pub struct AuditLogger {
    pool: SqlitePool,
}

impl AuditLogger {
    /// Create a new audit logger sharing the given pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Write an entry to the audit trail.
    pub async fn log(&self, entry: &AuditEntry) -> Result<(), NudgeError> {
        sqlx::query(
            "INSERT INTO task_events (task_id, event, from_status, to_status, detail, at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.task_id)
        .bind(&entry.event)
        .bind(entry.from_status.map(|s| s.as_str()))
        .bind(entry.to_status.as_str())
        .bind(&entry.detail)
        .bind(ts(entry.at))
        .execute(&self.pool)
        .await
        .map_err(|e| NudgeError::Store(format!("audit log write failed: {e}")))?;

        debug!(
            "audit: {} {} {} -> {}",
            entry.task_id,
            entry.event,
            entry.from_status.map(|s| s.as_str()).unwrap_or("-"),
            entry.to_status
        );

        Ok(())
    }

    /// All entries for a task, oldest first.
    pub async fn history(&self, task_id: &str) -> Result<Vec<AuditEntry>, NudgeError> {
        let rows: Vec<(String, String, Option<String>, String, Option<String>, String)> =
            sqlx::query_as(
                "SELECT task_id, event, from_status, to_status, detail, at \
                 FROM task_events WHERE task_id = ? ORDER BY id",
            )
            .bind(task_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| NudgeError::Store(format!("audit history failed: {e}")))?;

        rows.into_iter()
            .map(|(task_id, event, from, to, detail, at)| {
                Ok(AuditEntry {
                    task_id,
                    event,
                    from_status: from
                        .as_deref()
                        .map(str::parse)
                        .transpose()
                        .map_err(NudgeError::Store)?,
                    to_status: to.parse().map_err(NudgeError::Store)?,
                    detail,
                    at: parse_ts(&at)?,
                })
            })
            .collect()
    }
}
