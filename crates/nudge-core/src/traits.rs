use crate::{
    error::NudgeError,
    message::{Inbound, OutgoingMessage},
    task::Task,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;

/// Messaging Channel trait.
///
/// Every messaging platform implements this trait to receive messages and
/// button presses and to deliver notifications.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Human-readable channel name.
    fn name(&self) -> &str;

    /// Start listening. Returns a receiver that yields messages and button presses.
    async fn start(&self) -> Result<tokio::sync::mpsc::Receiver<Inbound>, NudgeError>;

    /// Send a message. Returns the platform message id.
    async fn send(&self, message: OutgoingMessage) -> Result<String, NudgeError>;

    /// Replace the text of a message we sent earlier and drop its buttons.
    async fn edit_message(
        &self,
        target: &str,
        message_ref: &str,
        text: &str,
    ) -> Result<(), NudgeError>;

    /// Acknowledge a button press, optionally with a short toast.
    async fn answer_callback(&self, _query_id: &str, _text: Option<&str>) -> Result<(), NudgeError> {
        Ok(())
    }

    /// Graceful shutdown.
    async fn stop(&self) -> Result<(), NudgeError>;
}

/// A single completion request to a language model.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub system: String,
    pub user: String,
    /// Ask the backend for a JSON object reply.
    pub json_mode: bool,
    pub temperature: f32,
}

/// LLM Provider trait: one interchangeable completion backend.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Human-readable provider name.
    fn name(&self) -> &str;

    /// Whether this provider requires an API key to function.
    fn requires_api_key(&self) -> bool;

    /// Run a completion and return the raw text reply.
    async fn complete(&self, prompt: &Prompt) -> Result<String, NudgeError>;

    /// Check if the provider is configured and ready.
    async fn is_available(&self) -> bool;
}

/// Free text to turn into a reminder.
#[derive(Debug, Clone)]
pub struct ParseRequest {
    pub text: String,
    pub now: DateTime<Utc>,
    pub timezone: Tz,
}

/// What the parser made of a [`ParseRequest`].
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    Parsed {
        due_at: DateTime<Utc>,
        description: String,
    },
    Unparseable {
        reason: String,
    },
}

/// Natural-language parsing collaborator. The engine never parses time itself.
#[async_trait]
pub trait ReminderParser: Send + Sync {
    async fn parse(&self, request: &ParseRequest) -> Result<ParseOutcome, NudgeError>;
}

/// Calendar mirror collaborator: a best-effort projection of a task.
///
/// Implementations must tolerate repeated calls that converge on the same state.
#[async_trait]
pub trait CalendarMirror: Send + Sync {
    fn name(&self) -> &str;

    /// Create the mirror and return its handle.
    async fn create_mirror(&self, task: &Task) -> Result<String, NudgeError>;

    /// Move the mirror to the task's current due time.
    async fn update_mirror(&self, event_ref: &str, task: &Task) -> Result<(), NudgeError>;

    async fn mark_mirror_done(&self, event_ref: &str, task: &Task) -> Result<(), NudgeError>;

    async fn delete_mirror(&self, event_ref: &str) -> Result<(), NudgeError>;
}
