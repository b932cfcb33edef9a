//! Text messages: commands, or free text to turn into a reminder.

use super::Gateway;
use crate::commands::{self, Command, CommandContext};
use crate::engine::{render, IngestOutcome, IngestRequest};
use chrono_tz::Tz;
use nudge_core::{
    error::NudgeError,
    message::{IncomingMessage, OutgoingMessage, ReplyKeyboard},
};
use tracing::{error, info, warn};

const PROCESSING: &str = "\u{23f3} Processing...";
const NEED_TIMEZONE: &str =
    "Tell me your timezone first, e.g. /timezone Europe/Berlin, so I know when to remind you.";

impl Gateway {
    pub(super) async fn handle_message(&self, msg: IncomingMessage) {
        if let Some(location) = msg.location {
            let reply = commands::handle_location(
                self.engine.store(),
                &msg.sender_id,
                location,
                self.engine.now(),
            )
            .await;
            let out = OutgoingMessage::text(&msg.reply_target, reply)
                .with_reply_keyboard(ReplyKeyboard::Remove);
            self.send(&msg.channel, out).await;
            return;
        }

        let text = msg.text.trim();
        if text.is_empty() {
            return;
        }

        if let Some(cmd) = Command::parse(text) {
            let keyboard = cmd.reply_keyboard();
            let ctx = CommandContext {
                store: self.engine.store(),
                owner: &msg.sender_id,
                text,
                now: self.engine.now(),
            };
            let reply = commands::handle(cmd, &ctx).await;
            let mut out = OutgoingMessage::text(&msg.reply_target, reply);
            if let Some(keyboard) = keyboard {
                out = out.with_reply_keyboard(keyboard);
            }
            self.send(&msg.channel, out).await;
            return;
        }

        let tz = match self.engine.store().get_timezone(&msg.sender_id).await {
            Ok(name) => name.and_then(|n| n.parse::<Tz>().ok()),
            Err(e) => {
                error!("timezone lookup for {} failed: {e}", msg.sender_id);
                None
            }
        };
        let Some(tz) = tz else {
            self.send_text(&msg.channel, &msg.reply_target, NEED_TIMEZONE)
                .await;
            return;
        };

        info!(
            "[{}] {} -> ingest {}",
            msg.channel,
            msg.sender_name.as_deref().unwrap_or(&msg.sender_id),
            msg.dedup_key()
        );

        let placeholder = self
            .send_text(&msg.channel, &msg.reply_target, PROCESSING)
            .await;

        let result = self
            .engine
            .ingest(IngestRequest {
                dedup_key: msg.dedup_key(),
                owner: msg.sender_id.clone(),
                channel: msg.channel.clone(),
                reply_target: msg.reply_target.clone(),
                text: text.to_string(),
                timezone: tz,
            })
            .await;
        let reply = ingest_reply(&result, tz);

        // Edit the placeholder in place; fall back to a fresh message.
        if let (Some(message_ref), Some(channel)) = (placeholder, self.channels.get(&msg.channel)) {
            match channel
                .edit_message(&msg.reply_target, &message_ref, &reply)
                .await
            {
                Ok(()) => return,
                Err(e) => warn!("could not edit processing message: {e}"),
            }
        }
        self.send_text(&msg.channel, &msg.reply_target, &reply)
            .await;
    }
}

/// User-facing reply for an ingestion result.
pub(super) fn ingest_reply(result: &Result<IngestOutcome, NudgeError>, tz: Tz) -> String {
    match result {
        Ok(IngestOutcome::Created(task)) => render::confirmation(task, tz),
        Ok(IngestOutcome::Duplicate(task)) => format!(
            "Already scheduled for {}:\n{}",
            render::local_time(task.due_at, tz),
            task.description
        ),
        Ok(IngestOutcome::Unparseable { reason }) => format!(
            "I couldn't find a reminder in that ({reason}). \
             Try something like \"remind me to call mom tomorrow at 18:00\"."
        ),
        Ok(IngestOutcome::Rejected { reason }) if reason == "due_in_past" => {
            "That time has already passed. When should I remind you?".to_string()
        }
        Ok(IngestOutcome::Rejected { reason }) => {
            format!("I can't schedule that ({reason}).")
        }
        Err(NudgeError::Parser(e)) => {
            error!("parser failed: {e}");
            "I couldn't understand that right now, please try again in a moment.".to_string()
        }
        Err(e) => {
            error!("ingest failed: {e}");
            "Something went wrong, please try again.".to_string()
        }
    }
}
