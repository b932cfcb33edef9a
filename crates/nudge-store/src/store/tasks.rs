//! Task insert with dedup, predicate queries, and compare-and-set updates.

use super::{parse_ts, ts, Store};
use chrono::{DateTime, Utc};
use nudge_core::error::NudgeError;
use nudge_core::task::{NewTask, Task, TaskStatus};
use uuid::Uuid;

const TASK_COLUMNS: &str = "id, owner, channel, reply_target, description, due_at, created_at, \
     completed_at, status, completion_reason, dedup_key, external_event_ref, message_ref, \
     version, attempts, last_error";

/// Outcome of [`Store::insert_task`].
#[derive(Debug, Clone)]
pub enum Inserted {
    /// A new row was written.
    Created(Task),
    /// A row with the same dedup key already existed; it is returned untouched.
    Existing(Task),
}

impl Inserted {
    pub fn task(&self) -> &Task {
        match self {
            Self::Created(t) | Self::Existing(t) => t,
        }
    }

    pub fn into_task(self) -> Task {
        match self {
            Self::Created(t) | Self::Existing(t) => t,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Task counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub created: i64,
    pub scheduled: i64,
    pub sent: i64,
    pub completed: i64,
    /// SCHEDULED tasks whose delivery gave up.
    pub stuck: i64,
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    owner: String,
    channel: String,
    reply_target: String,
    description: String,
    due_at: String,
    created_at: String,
    completed_at: Option<String>,
    status: String,
    completion_reason: Option<String>,
    dedup_key: String,
    external_event_ref: Option<String>,
    message_ref: Option<String>,
    version: i64,
    attempts: i64,
    last_error: Option<String>,
}

impl TryFrom<TaskRow> for Task {
    type Error = NudgeError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(Task {
            due_at: parse_ts(&row.due_at)?,
            created_at: parse_ts(&row.created_at)?,
            completed_at: row.completed_at.as_deref().map(parse_ts).transpose()?,
            status: row.status.parse().map_err(NudgeError::Store)?,
            completion_reason: row
                .completion_reason
                .as_deref()
                .map(str::parse)
                .transpose()
                .map_err(NudgeError::Store)?,
            id: row.id,
            owner: row.owner,
            channel: row.channel,
            reply_target: row.reply_target,
            description: row.description,
            dedup_key: row.dedup_key,
            external_event_ref: row.external_event_ref,
            message_ref: row.message_ref,
            version: row.version,
            attempts: row.attempts,
            last_error: row.last_error,
        })
    }
}

fn into_tasks(rows: Vec<TaskRow>) -> Result<Vec<Task>, NudgeError> {
    rows.into_iter().map(Task::try_from).collect()
}

impl Store {
    /// Insert a task in CREATED status unless one with the same dedup key exists.
    ///
    /// The unique index on `dedup_key` arbitrates concurrent inserts: the loser's
    /// insert is a no-op and both callers get the same row back.
    pub async fn insert_task(
        &self,
        new: &NewTask,
        now: DateTime<Utc>,
    ) -> Result<Inserted, NudgeError> {
        let id = Uuid::new_v4().to_string();
        let result = sqlx::query(
            "INSERT INTO tasks (id, owner, channel, reply_target, description, due_at, \
             created_at, status, dedup_key) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 'created', ?) \
             ON CONFLICT(dedup_key) DO NOTHING",
        )
        .bind(&id)
        .bind(&new.owner)
        .bind(&new.channel)
        .bind(&new.reply_target)
        .bind(&new.description)
        .bind(ts(new.due_at))
        .bind(ts(now))
        .bind(&new.dedup_key)
        .execute(&self.pool)
        .await
        .map_err(|e| NudgeError::Store(format!("insert task failed: {e}")))?;

        let task = self
            .find_by_dedup_key(&new.dedup_key)
            .await?
            .ok_or_else(|| NudgeError::Store(format!("task for {} vanished", new.dedup_key)))?;

        if result.rows_affected() == 1 {
            Ok(Inserted::Created(task))
        } else {
            tracing::info!("dedup: {} already stored as {}", new.dedup_key, task.id);
            Ok(Inserted::Existing(task))
        }
    }

    pub async fn find_by_dedup_key(&self, dedup_key: &str) -> Result<Option<Task>, NudgeError> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE dedup_key = ?"))
                .bind(dedup_key)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| NudgeError::Store(format!("dedup lookup failed: {e}")))?;
        row.map(Task::try_from).transpose()
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<Task>, NudgeError> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| NudgeError::Store(format!("get task failed: {e}")))?;
        row.map(Task::try_from).transpose()
    }

    /// Like [`Store::get_task`] but a missing row is `NotFound`.
    pub async fn require_task(&self, id: &str) -> Result<Task, NudgeError> {
        self.get_task(id)
            .await?
            .ok_or_else(|| NudgeError::NotFound(format!("task {id}")))
    }

    /// Tasks in `status` due at or before `until`, oldest first.
    pub async fn due_before(
        &self,
        status: TaskStatus,
        until: DateTime<Utc>,
    ) -> Result<Vec<Task>, NudgeError> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ? AND due_at <= ? ORDER BY due_at"
        ))
        .bind(status.as_str())
        .bind(ts(until))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| NudgeError::Store(format!("due query failed: {e}")))?;
        into_tasks(rows)
    }

    pub async fn tasks_with_status(&self, status: TaskStatus) -> Result<Vec<Task>, NudgeError> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ? ORDER BY due_at"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| NudgeError::Store(format!("status query failed: {e}")))?;
        into_tasks(rows)
    }

    /// An owner's tasks, soonest first. Completed tasks only when asked for.
    pub async fn tasks_for_owner(
        &self,
        owner: &str,
        include_completed: bool,
    ) -> Result<Vec<Task>, NudgeError> {
        let sql = if include_completed {
            format!("SELECT {TASK_COLUMNS} FROM tasks WHERE owner = ? ORDER BY due_at")
        } else {
            format!(
                "SELECT {TASK_COLUMNS} FROM tasks \
                 WHERE owner = ? AND status != 'completed' ORDER BY due_at"
            )
        };
        let rows: Vec<TaskRow> = sqlx::query_as(&sql)
            .bind(owner)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| NudgeError::Store(format!("owner query failed: {e}")))?;
        into_tasks(rows)
    }

    /// Persist `next` only if the row still has `expected`'s status and version.
    ///
    /// Returns `false` when another writer got there first.
    pub async fn compare_and_set(&self, expected: &Task, next: &Task) -> Result<bool, NudgeError> {
        let result = sqlx::query(
            "UPDATE tasks SET status = ?, due_at = ?, completed_at = ?, completion_reason = ?, \
             message_ref = ?, version = ?, attempts = ?, last_error = ? \
             WHERE id = ? AND status = ? AND version = ?",
        )
        .bind(next.status.as_str())
        .bind(ts(next.due_at))
        .bind(next.completed_at.map(ts))
        .bind(next.completion_reason.map(|r| r.as_str()))
        .bind(&next.message_ref)
        .bind(next.version)
        .bind(next.attempts)
        .bind(&next.last_error)
        .bind(&expected.id)
        .bind(expected.status.as_str())
        .bind(expected.version)
        .execute(&self.pool)
        .await
        .map_err(|e| NudgeError::Store(format!("compare-and-set failed: {e}")))?;
        Ok(result.rows_affected() == 1)
    }

    /// Record a failed delivery attempt against a specific version.
    ///
    /// Status and version are untouched. Returns `false` if the task moved on.
    pub async fn record_attempt_failure(
        &self,
        id: &str,
        version: i64,
        error: &str,
    ) -> Result<bool, NudgeError> {
        let result = sqlx::query(
            "UPDATE tasks SET attempts = attempts + 1, last_error = ? \
             WHERE id = ? AND version = ?",
        )
        .bind(error)
        .bind(id)
        .bind(version)
        .execute(&self.pool)
        .await
        .map_err(|e| NudgeError::Store(format!("record attempt failed: {e}")))?;
        Ok(result.rows_affected() == 1)
    }

    /// Store the calendar mirror handle. Status-neutral.
    pub async fn set_external_ref(
        &self,
        id: &str,
        event_ref: Option<&str>,
    ) -> Result<(), NudgeError> {
        sqlx::query("UPDATE tasks SET external_event_ref = ? WHERE id = ?")
            .bind(event_ref)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| NudgeError::Store(format!("set external ref failed: {e}")))?;
        Ok(())
    }

    /// Count tasks per status. `stuck` counts SCHEDULED tasks that used up
    /// `max_send_attempts`.
    pub async fn stats(&self, max_send_attempts: u32) -> Result<StoreStats, NudgeError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| NudgeError::Store(format!("stats query failed: {e}")))?;

        let mut stats = StoreStats::default();
        for (status, count) in rows {
            match status.parse::<TaskStatus>() {
                Ok(TaskStatus::Created) => stats.created = count,
                Ok(TaskStatus::Scheduled) => stats.scheduled = count,
                Ok(TaskStatus::Sent) => stats.sent = count,
                Ok(TaskStatus::Completed) => stats.completed = count,
                Err(e) => tracing::warn!("stats: {e}"),
            }
        }

        let (stuck,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM tasks WHERE status = 'scheduled' AND attempts >= ?",
        )
        .bind(i64::from(max_send_attempts))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| NudgeError::Store(format!("stats query failed: {e}")))?;
        stats.stuck = stuck;

        Ok(stats)
    }
}
