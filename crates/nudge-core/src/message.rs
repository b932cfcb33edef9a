use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Anything a channel delivers to the gateway.
#[derive(Debug, Clone)]
pub enum Inbound {
    Message(IncomingMessage),
    Callback(CallbackQuery),
}

/// A point shared by the user.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

/// An incoming message from a channel: text, or a shared location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    /// Channel name (e.g. "telegram").
    pub channel: String,
    /// Platform-specific user ID.
    pub sender_id: String,
    /// Human-readable sender name.
    pub sender_name: Option<String>,
    /// Message text content. Empty for a bare location.
    pub text: String,
    #[serde(default)]
    pub location: Option<Location>,
    pub timestamp: DateTime<Utc>,
    /// Platform-specific target for routing the response (e.g. Telegram chat_id).
    pub reply_target: String,
    /// Platform message id; together with channel and chat it identifies the request.
    pub message_ref: String,
}

impl IncomingMessage {
    /// Key identifying the inbound request, stable across redeliveries.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}:{}", self.channel, self.reply_target, self.message_ref)
    }
}

/// A button press on a message we sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackQuery {
    /// Platform id of the query, used to acknowledge it.
    pub id: String,
    pub channel: String,
    /// Platform user id of whoever pressed the button.
    pub actor: String,
    /// Opaque payload attached to the button.
    pub data: String,
    /// Chat the pressed message lives in.
    pub reply_target: Option<String>,
    /// Id of the message carrying the button.
    pub message_ref: Option<String>,
}

/// An outgoing message to send through a channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub text: String,
    /// Platform-specific target for routing (e.g. Telegram chat_id).
    pub reply_target: String,
    /// Inline keyboard rows. Empty means no buttons.
    #[serde(default)]
    pub buttons: Vec<Vec<Button>>,
    /// Keyboard shown in place of the user's input field.
    #[serde(default)]
    pub reply_keyboard: Option<ReplyKeyboard>,
}

impl OutgoingMessage {
    pub fn text(reply_target: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            reply_target: reply_target.into(),
            buttons: Vec::new(),
            reply_keyboard: None,
        }
    }

    pub fn with_reply_keyboard(mut self, keyboard: ReplyKeyboard) -> Self {
        self.reply_keyboard = Some(keyboard);
        self
    }
}

/// Replaces the user's input field until removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyKeyboard {
    /// A single button that shares the user's location.
    RequestLocation { label: String },
    /// Restore the normal input field.
    Remove,
}

/// An interactive affordance attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    pub label: String,
    /// Routed back verbatim in [`CallbackQuery::data`].
    pub data: String,
}
