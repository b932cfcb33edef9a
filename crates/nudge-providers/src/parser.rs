//! Natural-language reminder parser on top of any [`Provider`].
//!
//! The model gets the user's text, timezone and the current time and must
//! reply with `{"iso_datetime": "...", "text": "..."}` (UTC) or
//! `{"error": "..."}`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use nudge_core::{
    error::NudgeError,
    traits::{ParseOutcome, ParseRequest, Prompt, Provider, ReminderParser},
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

const SYSTEM_PROMPT: &str = "\
You turn a user's message into a reminder.

You receive the message, the user's IANA timezone, the current time in UTC and \
the current local time. Work out when the reminder should fire and what it should say.

Rules:
- Interpret dates and times in the user's timezone, then convert to UTC.
- If the message clearly asks for a reminder but names no time, fire 5 minutes from now.
- If a named date has already passed this year, use the same date next year.
- Relative times (\"in 2 hours\", \"in 90 minutes\") count from the current time.
- The reminder text is a short imperative: \"remind me to call mom\" becomes \"Call mom\".
- Keep the language of the user's message.
- If the message is not a reminder request, is ambiguous, or points to the past, it is an error.

Reply with exactly one JSON object and nothing else:
- success: {\"iso_datetime\": \"YYYY-MM-DDTHH:MM:SS\", \"text\": \"...\"} with the time in UTC
- failure: {\"error\": \"unknown_request\"}";

/// Reason reported when the model's reply lacks the expected fields.
const MALFORMED: &str = "malformed_reply";

/// LLM-backed [`ReminderParser`].
pub struct LlmReminderParser {
    provider: Arc<dyn Provider>,
}

impl LlmReminderParser {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }
}

#[derive(Debug, Deserialize)]
struct Reply {
    iso_datetime: Option<String>,
    text: Option<String>,
    error: Option<serde_json::Value>,
}

fn build_prompt(req: &ParseRequest) -> Prompt {
    let local = req.now.with_timezone(&req.timezone);
    Prompt {
        system: SYSTEM_PROMPT.to_string(),
        user: format!(
            "Message: {:?}\nTimezone: {}\nCurrent time (UTC): {}\nCurrent local time: {}",
            req.text,
            req.timezone.name(),
            req.now.format("%Y-%m-%dT%H:%M:%S"),
            local.format("%Y-%m-%dT%H:%M:%S (%A)"),
        ),
        json_mode: true,
        temperature: 0.1,
    }
}

/// Strip Markdown code fences the model may wrap its JSON in.
fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    body.strip_suffix("```").unwrap_or(body).trim()
}

/// Parse an ISO 8601 datetime. Naive values are UTC.
fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Interpret the model's raw reply.
fn interpret(raw: &str) -> Result<ParseOutcome, NudgeError> {
    let reply: Reply = serde_json::from_str(strip_fences(raw))
        .map_err(|e| NudgeError::Parser(format!("reply is not JSON: {e}")))?;

    if let Some(err) = reply.error {
        let reason = match err {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        return Ok(ParseOutcome::Unparseable { reason });
    }

    let (Some(when), Some(text)) = (reply.iso_datetime, reply.text) else {
        return Ok(ParseOutcome::Unparseable {
            reason: MALFORMED.to_string(),
        });
    };
    let description = text.trim().to_string();
    match parse_datetime(&when) {
        Some(due_at) if !description.is_empty() => Ok(ParseOutcome::Parsed {
            due_at,
            description,
        }),
        _ => Ok(ParseOutcome::Unparseable {
            reason: MALFORMED.to_string(),
        }),
    }
}

#[async_trait]
impl ReminderParser for LlmReminderParser {
    async fn parse(&self, request: &ParseRequest) -> Result<ParseOutcome, NudgeError> {
        let raw = self.provider.complete(&build_prompt(request)).await?;
        debug!("parser: {} replied {raw}", self.provider.name());
        let outcome = interpret(&raw)?;
        if let ParseOutcome::Unparseable { ref reason } = outcome {
            info!("parser: unparseable ({reason})");
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Mutex;

    struct CannedProvider {
        reply: String,
        seen: Mutex<Vec<Prompt>>,
    }

    #[async_trait]
    impl Provider for CannedProvider {
        fn name(&self) -> &str {
            "canned"
        }
        fn requires_api_key(&self) -> bool {
            false
        }
        async fn complete(&self, prompt: &Prompt) -> Result<String, NudgeError> {
            self.seen.lock().unwrap().push(prompt.clone());
            Ok(self.reply.clone())
        }
        async fn is_available(&self) -> bool {
            true
        }
    }

    fn request() -> ParseRequest {
        ParseRequest {
            text: "remind me to buy milk tomorrow at 9".into(),
            now: Utc.with_ymd_and_hms(2025, 12, 17, 22, 0, 0).unwrap(),
            timezone: chrono_tz::Europe::Moscow,
        }
    }

    #[test]
    fn test_strip_fences() {
        assert_eq!(strip_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_fences("```{\"a\":1}```"), "{\"a\":1}");
        assert_eq!(strip_fences("  {\"a\":1} "), "{\"a\":1}");
    }

    #[test]
    fn test_parse_datetime_variants() {
        let expected = Utc.with_ymd_and_hms(2025, 12, 18, 6, 0, 0).unwrap();
        assert_eq!(parse_datetime("2025-12-18T06:00:00"), Some(expected));
        assert_eq!(parse_datetime("2025-12-18T06:00:00Z"), Some(expected));
        assert_eq!(parse_datetime("2025-12-18T09:00:00+03:00"), Some(expected));
        assert_eq!(parse_datetime("2025-12-18 06:00:00"), Some(expected));
        assert_eq!(parse_datetime("2025-12-18T06:00"), Some(expected));
        assert_eq!(parse_datetime("tomorrow"), None);
    }

    #[test]
    fn test_interpret_success() {
        let outcome =
            interpret(r#"{"iso_datetime": "2025-12-18T06:00:00", "text": " Buy milk "}"#).unwrap();
        assert_eq!(
            outcome,
            ParseOutcome::Parsed {
                due_at: Utc.with_ymd_and_hms(2025, 12, 18, 6, 0, 0).unwrap(),
                description: "Buy milk".into(),
            }
        );
    }

    #[test]
    fn test_interpret_error_and_malformed() {
        assert_eq!(
            interpret(r#"{"error": "unknown_request"}"#).unwrap(),
            ParseOutcome::Unparseable {
                reason: "unknown_request".into()
            }
        );
        assert_eq!(
            interpret(r#"{"text": "Buy milk"}"#).unwrap(),
            ParseOutcome::Unparseable {
                reason: MALFORMED.into()
            }
        );
        assert_eq!(
            interpret(r#"{"iso_datetime": "2025-12-18T06:00:00", "text": "  "}"#).unwrap(),
            ParseOutcome::Unparseable {
                reason: MALFORMED.into()
            }
        );
        assert!(interpret("Sure! Here is your reminder").is_err());
    }

    #[test]
    fn test_prompt_carries_context() {
        let p = build_prompt(&request());
        assert!(p.json_mode);
        assert!(p.user.contains("buy milk"));
        assert!(p.user.contains("Europe/Moscow"));
        assert!(p.user.contains("2025-12-17T22:00:00"));
        assert!(p.user.contains("2025-12-18T01:00:00"), "local time: {}", p.user);
    }

    #[tokio::test]
    async fn test_parser_uses_provider() {
        let provider = Arc::new(CannedProvider {
            reply: "```json\n{\"iso_datetime\": \"2025-12-18T06:00:00\", \"text\": \"Buy milk\"}\n```"
                .into(),
            seen: Mutex::new(Vec::new()),
        });
        let parser = LlmReminderParser::new(provider.clone());
        let outcome = parser.parse(&request()).await.unwrap();
        assert!(matches!(outcome, ParseOutcome::Parsed { .. }));
        assert_eq!(provider.seen.lock().unwrap().len(), 1);
        assert_eq!(parser.provider_name(), "canned");
    }
}
