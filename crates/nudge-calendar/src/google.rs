//! Google Calendar v3 REST mirror.
//!
//! Each task becomes a zero-length event at its due time with a popup
//! reminder. Completion prefixes the title with a check mark and greys the
//! event out. Auth is a bearer access token issued elsewhere.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use nudge_core::{error::NudgeError, task::Task, traits::CalendarMirror};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

/// Google Calendar "graphite" color, used for finished reminders.
const DONE_COLOR_ID: &str = "8";
const DONE_PREFIX: &str = "\u{2705} ";

/// Google Calendar mirror.
pub struct GoogleCalendar {
    client: reqwest::Client,
    base_url: String,
    calendar_id: String,
    access_token: String,
}

#[derive(Deserialize)]
struct CreatedEvent {
    id: String,
}

impl GoogleCalendar {
    /// Create from config values.
    pub fn from_config(base_url: String, calendar_id: String, access_token: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            calendar_id,
            access_token,
        }
    }

    fn events_url(&self) -> String {
        format!(
            "{}/calendars/{}/events",
            self.base_url,
            urlencoding::encode(&self.calendar_id)
        )
    }

    fn event_url(&self, event_ref: &str) -> String {
        format!("{}/{}", self.events_url(), urlencoding::encode(event_ref))
    }

    async fn send(
        &self,
        req: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<reqwest::Response, NudgeError> {
        let resp = req
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| NudgeError::Calendar(format!("{what} failed: {e}")))?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        Err(NudgeError::Calendar(format!("{what} returned {status}: {text}")))
    }
}

fn event_time(at: DateTime<Utc>) -> Value {
    json!({
        "dateTime": at.to_rfc3339_opts(SecondsFormat::Secs, true),
        "timeZone": "UTC",
    })
}

/// Body for a freshly mirrored task.
pub(crate) fn event_body(task: &Task) -> Value {
    json!({
        "summary": task.description,
        "description": format!("Reminder {}", task.id),
        "start": event_time(task.due_at),
        "end": event_time(task.due_at),
        "reminders": {
            "useDefault": false,
            "overrides": [{ "method": "popup", "minutes": 0 }],
        },
    })
}

/// Patch moving the event to the task's current due time.
pub(crate) fn retime_patch(task: &Task) -> Value {
    json!({
        "summary": task.description,
        "start": event_time(task.due_at),
        "end": event_time(task.due_at),
    })
}

/// Patch marking the event done.
pub(crate) fn done_patch(task: &Task) -> Value {
    json!({
        "summary": format!("{DONE_PREFIX}{}", task.description),
        "colorId": DONE_COLOR_ID,
    })
}

#[async_trait]
impl CalendarMirror for GoogleCalendar {
    fn name(&self) -> &str {
        "google"
    }

    async fn create_mirror(&self, task: &Task) -> Result<String, NudgeError> {
        let resp = self
            .send(
                self.client.post(self.events_url()).json(&event_body(task)),
                "calendar insert",
            )
            .await?;
        let created: CreatedEvent = resp
            .json()
            .await
            .map_err(|e| NudgeError::Calendar(format!("calendar insert parse failed: {e}")))?;
        info!("calendar: mirrored task {} as {}", task.id, created.id);
        Ok(created.id)
    }

    async fn update_mirror(&self, event_ref: &str, task: &Task) -> Result<(), NudgeError> {
        self.send(
            self.client.patch(self.event_url(event_ref)).json(&retime_patch(task)),
            "calendar update",
        )
        .await?;
        debug!("calendar: retimed {event_ref}");
        Ok(())
    }

    async fn mark_mirror_done(&self, event_ref: &str, task: &Task) -> Result<(), NudgeError> {
        self.send(
            self.client.patch(self.event_url(event_ref)).json(&done_patch(task)),
            "calendar complete",
        )
        .await?;
        debug!("calendar: marked {event_ref} done");
        Ok(())
    }

    async fn delete_mirror(&self, event_ref: &str) -> Result<(), NudgeError> {
        let resp = self
            .client
            .delete(self.event_url(event_ref))
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| NudgeError::Calendar(format!("calendar delete failed: {e}")))?;

        // Already gone counts as deleted.
        match resp.status() {
            s if s.is_success() => {}
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                debug!("calendar: {event_ref} already deleted");
            }
            status => {
                let text = resp.text().await.unwrap_or_default();
                return Err(NudgeError::Calendar(format!(
                    "calendar delete returned {status}: {text}"
                )));
            }
        }
        Ok(())
    }
}
