//! Outbound calls: messages with inline keyboards, edits, callback answers,
//! and command registration.

use super::types::{
    InlineKeyboardButton, InlineKeyboardMarkup, KeyboardButton, ReplyKeyboardMarkup,
    ReplyKeyboardRemove, TgMessage, TgResponse,
};
use super::{TelegramChannel, MAX_MESSAGE_LEN};
use crate::utils::split_message;
use nudge_core::error::NudgeError;
use nudge_core::message::{Button, OutgoingMessage, ReplyKeyboard};
use serde_json::Value;
use tracing::{info, warn};

/// Build the `reply_markup` for a button grid.
pub(crate) fn keyboard(buttons: &[Vec<Button>]) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup {
        inline_keyboard: buttons
            .iter()
            .filter(|row| !row.is_empty())
            .map(|row| {
                row.iter()
                    .map(|b| InlineKeyboardButton {
                        text: b.label.clone(),
                        callback_data: b.data.clone(),
                    })
                    .collect()
            })
            .collect(),
    }
}

/// The `reply_markup` for a message, if it carries any keyboard.
///
/// Inline buttons win; a message has room for one markup only.
pub(crate) fn reply_markup(message: &OutgoingMessage) -> Result<Option<Value>, NudgeError> {
    if message.buttons.iter().any(|row| !row.is_empty()) {
        return Ok(Some(serde_json::to_value(keyboard(&message.buttons))?));
    }
    let markup = match &message.reply_keyboard {
        Some(ReplyKeyboard::RequestLocation { label }) => {
            serde_json::to_value(ReplyKeyboardMarkup {
                keyboard: vec![vec![KeyboardButton {
                    text: label.clone(),
                    request_location: true,
                }]],
                resize_keyboard: true,
                one_time_keyboard: true,
            })?
        }
        Some(ReplyKeyboard::Remove) => serde_json::to_value(ReplyKeyboardRemove {
            remove_keyboard: true,
        })?,
        None => return Ok(None),
    };
    Ok(Some(markup))
}

impl TelegramChannel {
    /// Send a message, attaching its keyboard to the last chunk.
    ///
    /// Returns the message_id of the last chunk, which carries the keyboard.
    pub(crate) async fn send_text(
        &self,
        chat_id: i64,
        message: &OutgoingMessage,
    ) -> Result<i64, NudgeError> {
        let markup = reply_markup(message)?;
        let chunks = split_message(&message.text, MAX_MESSAGE_LEN);
        let last = chunks.len().saturating_sub(1);
        let mut message_id = 0;

        for (i, chunk) in chunks.into_iter().enumerate() {
            let mut body = serde_json::json!({
                "chat_id": chat_id,
                "text": chunk,
            });
            if i == last {
                if let Some(markup) = &markup {
                    body["reply_markup"] = markup.clone();
                }
            }
            message_id = self.post_with_markdown_fallback("sendMessage", body).await?;
        }

        Ok(message_id)
    }

    /// Replace a message's text and remove its inline keyboard.
    pub(crate) async fn edit_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
    ) -> Result<(), NudgeError> {
        let body = serde_json::json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": split_message(text, MAX_MESSAGE_LEN)[0],
            "reply_markup": { "inline_keyboard": [] },
        });
        self.post_with_markdown_fallback("editMessageText", body)
            .await
            .map(|_| ())
    }

    pub(crate) async fn answer_callback_query(
        &self,
        query_id: &str,
        text: Option<&str>,
    ) -> Result<(), NudgeError> {
        let mut body = serde_json::json!({ "callback_query_id": query_id });
        if let Some(text) = text {
            body["text"] = Value::String(text.to_string());
        }
        let resp = self
            .client
            .post(format!("{}/answerCallbackQuery", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| NudgeError::Channel(format!("telegram answerCallbackQuery failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await.unwrap_or_default();
            return Err(NudgeError::Channel(format!(
                "telegram answerCallbackQuery failed ({status}): {error_text}"
            )));
        }
        Ok(())
    }

    /// POST with Markdown parse mode, retrying as plain text if Telegram
    /// cannot parse the entities. Returns the resulting message_id.
    async fn post_with_markdown_fallback(
        &self,
        method: &str,
        mut body: Value,
    ) -> Result<i64, NudgeError> {
        let url = format!("{}/{method}", self.base_url);
        body["parse_mode"] = Value::String("Markdown".into());

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| NudgeError::Channel(format!("telegram {method} failed: {e}")))?;

        let status = resp.status();
        if status.is_success() {
            return message_id_of(resp, method).await;
        }

        let error_text = resp.text().await.unwrap_or_default();
        if !error_text.contains("can't parse entities") {
            return Err(NudgeError::Channel(format!(
                "telegram {method} failed ({status}): {error_text}"
            )));
        }

        warn!("Markdown parse failed, retrying as plain text: {error_text}");
        if let Some(obj) = body.as_object_mut() {
            obj.remove("parse_mode");
        }
        let plain_resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| NudgeError::Channel(format!("telegram {method} (plain) failed: {e}")))?;
        if !plain_resp.status().is_success() {
            let plain_err = plain_resp.text().await.unwrap_or_default();
            return Err(NudgeError::Channel(format!(
                "telegram {method} (plain fallback) failed: {plain_err}"
            )));
        }
        message_id_of(plain_resp, method).await
    }

    /// Register bot commands with Telegram so users see an autocomplete menu.
    /// Best-effort: logs failures but does not propagate errors.
    pub(crate) async fn register_commands(&self) {
        let commands = serde_json::json!({
            "commands": [
                { "command": "start", "description": "Register and get started" },
                { "command": "help", "description": "How to create reminders" },
                { "command": "timezone", "description": "Set your timezone, e.g. /timezone Europe/Berlin" },
                { "command": "autotimezone", "description": "Set your timezone from your location" },
                { "command": "tasks", "description": "List your open reminders" },
            ]
        });

        let url = format!("{}/setMyCommands", self.base_url);
        match self.client.post(&url).json(&commands).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!("registered Telegram bot commands");
            }
            Ok(resp) => {
                let body = resp.text().await.unwrap_or_default();
                warn!("failed to register Telegram bot commands: {body}");
            }
            Err(e) => {
                warn!("failed to register Telegram bot commands: {e}");
            }
        }
    }
}

/// Extract `result.message_id`. `editMessageText` may return `true` instead
/// of a message, which maps to 0.
async fn message_id_of(resp: reqwest::Response, method: &str) -> Result<i64, NudgeError> {
    let body: TgResponse<Value> = resp
        .json()
        .await
        .map_err(|e| NudgeError::Channel(format!("telegram {method} parse failed: {e}")))?;
    if !body.ok {
        return Err(NudgeError::Channel(format!(
            "telegram {method} rejected: {}",
            body.description.unwrap_or_default()
        )));
    }
    Ok(body
        .result
        .and_then(|v| serde_json::from_value::<TgMessage>(v).ok())
        .map(|m| m.message_id)
        .unwrap_or_default())
}
