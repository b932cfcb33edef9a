//! Long-polling update loop and Channel trait implementation.

use super::types::{TgMessage, TgResponse, TgUpdate, TgUser};
use super::TelegramChannel;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nudge_core::{
    error::NudgeError,
    message::{CallbackQuery, Inbound, IncomingMessage, Location, OutgoingMessage},
    traits::Channel,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn start(&self) -> Result<mpsc::Receiver<Inbound>, NudgeError> {
        self.register_commands().await;

        let (tx, rx) = mpsc::channel(64);
        let client = self.client.clone();
        let base_url = self.base_url.clone();
        let allowed_users = self.config.allowed_users.clone();
        let last_update_id = self.last_update_id.clone();

        info!("Telegram channel starting long polling...");

        tokio::spawn(async move {
            let mut backoff_secs: u64 = 1;

            loop {
                let last = last_update_id.lock().await;
                let offset = last.map(|id| id + 1);
                drop(last);

                let mut url = format!(
                    "{base_url}/getUpdates?timeout=30&allowed_updates=%5B%22message%22%2C%22callback_query%22%5D"
                );
                if let Some(off) = offset {
                    url.push_str(&format!("&offset={off}"));
                }

                let resp = match client
                    .get(&url)
                    .timeout(std::time::Duration::from_secs(35))
                    .send()
                    .await
                {
                    Ok(r) => r,
                    Err(e) => {
                        error!("telegram poll error (retry in {backoff_secs}s): {e}");
                        tokio::time::sleep(std::time::Duration::from_secs(backoff_secs)).await;
                        backoff_secs = (backoff_secs * 2).min(60);
                        continue;
                    }
                };

                let body: TgResponse<Vec<TgUpdate>> = match resp.json().await {
                    Ok(b) => b,
                    Err(e) => {
                        error!("telegram parse error (retry in {backoff_secs}s): {e}");
                        tokio::time::sleep(std::time::Duration::from_secs(backoff_secs)).await;
                        backoff_secs = (backoff_secs * 2).min(60);
                        continue;
                    }
                };

                if !body.ok {
                    error!(
                        "telegram API error (retry in {backoff_secs}s): {}",
                        body.description.unwrap_or_default()
                    );
                    tokio::time::sleep(std::time::Duration::from_secs(backoff_secs)).await;
                    backoff_secs = (backoff_secs * 2).min(60);
                    continue;
                }

                // Successful poll -- reset backoff.
                backoff_secs = 1;

                let updates = body.result.unwrap_or_default();

                if let Some(last_update) = updates.last() {
                    *last_update_id.lock().await = Some(last_update.update_id);
                }

                for update in updates {
                    let Some(inbound) = to_inbound(update, &allowed_users) else {
                        continue;
                    };
                    if tx.send(inbound).await.is_err() {
                        info!("telegram channel receiver dropped, stopping poll");
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn send(&self, message: OutgoingMessage) -> Result<String, NudgeError> {
        let chat_id = parse_chat_id(&message.reply_target)?;
        let message_id = self.send_text(chat_id, &message).await?;
        Ok(message_id.to_string())
    }

    async fn edit_message(
        &self,
        target: &str,
        message_ref: &str,
        text: &str,
    ) -> Result<(), NudgeError> {
        let chat_id = parse_chat_id(target)?;
        let message_id: i64 = message_ref.parse().map_err(|e| {
            NudgeError::Channel(format!("invalid telegram message_id '{message_ref}': {e}"))
        })?;
        self.edit_text(chat_id, message_id, text).await
    }

    async fn answer_callback(&self, query_id: &str, text: Option<&str>) -> Result<(), NudgeError> {
        self.answer_callback_query(query_id, text).await
    }

    async fn stop(&self) -> Result<(), NudgeError> {
        info!("Telegram channel stopped");
        Ok(())
    }
}

fn parse_chat_id(target: &str) -> Result<i64, NudgeError> {
    target
        .parse()
        .map_err(|e| NudgeError::Channel(format!("invalid telegram chat_id '{target}': {e}")))
}

/// Convert a raw update into an inbound event, dropping what the bot ignores:
/// messages with neither text nor a location, group chats, and users outside
/// `allowed_users`.
pub(crate) fn to_inbound(update: TgUpdate, allowed_users: &[i64]) -> Option<Inbound> {
    let allowed = |user: &TgUser| {
        let ok = allowed_users.is_empty() || allowed_users.contains(&user.id);
        if !ok {
            warn!("ignoring update from unauthorized user {}", user.id);
        }
        ok
    };

    if let Some(query) = update.callback_query {
        if !allowed(&query.from) {
            return None;
        }
        let data = query.data?;
        return Some(Inbound::Callback(CallbackQuery {
            id: query.id,
            channel: "telegram".to_string(),
            actor: query.from.id.to_string(),
            data,
            reply_target: query.message.as_ref().map(|m| m.chat.id.to_string()),
            message_ref: query.message.as_ref().map(|m| m.message_id.to_string()),
        }));
    }

    let msg: TgMessage = update.message?;
    let location = msg.location.as_ref().map(|l| Location {
        latitude: l.latitude,
        longitude: l.longitude,
    });
    let text = match (msg.text, location) {
        (Some(text), _) => text,
        (None, Some(_)) => String::new(),
        (None, None) => return None,
    };
    let user = msg.from?;
    if !allowed(&user) {
        return None;
    }

    if matches!(msg.chat.chat_type.as_str(), "group" | "supergroup") {
        debug!("telegram: ignoring group message from chat {}", msg.chat.id);
        return None;
    }

    let sender_name = if let Some(ref un) = user.username {
        format!("@{un}")
    } else if let Some(ref ln) = user.last_name {
        format!("{} {ln}", user.first_name)
    } else {
        user.first_name.clone()
    };

    Some(Inbound::Message(IncomingMessage {
        channel: "telegram".to_string(),
        sender_id: user.id.to_string(),
        sender_name: Some(sender_name),
        text,
        location,
        timestamp: DateTime::<Utc>::from_timestamp(msg.date, 0).unwrap_or_else(Utc::now),
        reply_target: msg.chat.id.to_string(),
        message_ref: msg.message_id.to_string(),
    }))
}
