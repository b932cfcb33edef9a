//! Ingestion with the duplicate guard.

use super::{mirror::MirrorOp, Engine};
use chrono_tz::Tz;
use nudge_core::{
    error::NudgeError,
    task::{NewTask, Task, TaskStatus},
    traits::{ParseOutcome, ParseRequest},
};
use nudge_store::Inserted;
use std::sync::Arc;
use tracing::info;

/// Free text from a user, to be turned into a task.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    /// Identifies the inbound request; retries carry the same key.
    pub dedup_key: String,
    pub owner: String,
    pub channel: String,
    pub reply_target: String,
    pub text: String,
    pub timezone: Tz,
}

/// Result of an ingestion.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// A new task was stored (and promoted when already inside the horizon).
    Created(Task),
    /// The request was seen before; this is the task it produced.
    Duplicate(Task),
    /// The parser could not make a reminder of the text.
    Unparseable { reason: String },
    /// Parsed, but not a task we accept.
    Rejected { reason: String },
}

impl Engine {
    /// Parse free text and create a task from it, at most once per dedup key.
    pub async fn ingest(self: &Arc<Self>, req: IngestRequest) -> Result<IngestOutcome, NudgeError> {
        if let Some(existing) = self.store.find_by_dedup_key(&req.dedup_key).await? {
            info!("ingest: {} already produced {}", req.dedup_key, existing.id);
            return Ok(IngestOutcome::Duplicate(existing));
        }

        let request = ParseRequest {
            text: req.text,
            now: self.clock.now(),
            timezone: req.timezone,
        };
        let (due_at, description) = match self.parser.parse(&request).await? {
            ParseOutcome::Parsed {
                due_at,
                description,
            } => (due_at, description),
            ParseOutcome::Unparseable { reason } => {
                return Ok(IngestOutcome::Unparseable { reason })
            }
        };

        self.create(NewTask {
            owner: req.owner,
            channel: req.channel,
            reply_target: req.reply_target,
            description,
            due_at,
            dedup_key: req.dedup_key,
        })
        .await
    }

    /// Create a task with an explicit due time.
    ///
    /// Insertion is `ON CONFLICT DO NOTHING` on the dedup key, so concurrent
    /// retries of one request resolve to a single row.
    pub async fn create(self: &Arc<Self>, new: NewTask) -> Result<IngestOutcome, NudgeError> {
        let now = self.clock.now();
        if new.description.trim().is_empty() {
            return Ok(IngestOutcome::Rejected {
                reason: "empty_description".to_string(),
            });
        }
        if new.due_at < now - self.config.past_due_grace() {
            return Ok(IngestOutcome::Rejected {
                reason: "due_in_past".to_string(),
            });
        }
        if new.due_at > now + self.config.max_lead() {
            return Ok(IngestOutcome::Rejected {
                reason: "due_too_far".to_string(),
            });
        }

        let task = match self.store.insert_task(&new, now).await? {
            Inserted::Existing(task) => return Ok(IngestOutcome::Duplicate(task)),
            Inserted::Created(task) => task,
        };
        self.record(&task.id, "create", None, TaskStatus::Created, None, now)
            .await;
        info!(
            "ingest: created {} for {} due {}",
            task.id, task.owner, task.due_at
        );

        let task = self.promote_if_due(task, now).await?;
        self.sync_mirror(MirrorOp::Create, task.clone());
        Ok(IngestOutcome::Created(task))
    }
}
