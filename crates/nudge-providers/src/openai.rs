//! OpenAI-compatible chat completions provider.
//!
//! Works with OpenAI's API and any compatible endpoint (Groq serves the same
//! API under its own base URL).

use async_trait::async_trait;
use nudge_core::{
    error::NudgeError,
    traits::{Prompt, Provider},
};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// OpenAI-compatible provider.
pub struct OpenAiProvider {
    client: reqwest::Client,
    name: String,
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl OpenAiProvider {
    /// Create from config values. `name` is what logs and `/status` report.
    pub fn from_config(
        name: impl Into<String>,
        base_url: String,
        api_key: String,
        model: String,
        timeout: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            name: name.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            timeout,
        }
    }
}

#[derive(Serialize, Deserialize, Clone)]
pub(crate) struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Deserialize)]
pub(crate) struct ChatCompletionResponse {
    pub choices: Option<Vec<ChatChoice>>,
    pub usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
pub(crate) struct ChatChoice {
    pub message: Option<ChatMessage>,
}

#[derive(Deserialize)]
pub(crate) struct ChatUsage {
    pub total_tokens: Option<u64>,
}

fn build_request(model: &str, prompt: &Prompt) -> ChatCompletionRequest {
    let mut messages = Vec::with_capacity(2);
    if !prompt.system.is_empty() {
        messages.push(ChatMessage {
            role: "system".to_string(),
            content: prompt.system.clone(),
        });
    }
    messages.push(ChatMessage {
        role: "user".to_string(),
        content: prompt.user.clone(),
    });
    ChatCompletionRequest {
        model: model.to_string(),
        messages,
        temperature: prompt.temperature,
        response_format: prompt.json_mode.then_some(ResponseFormat {
            kind: "json_object",
        }),
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn requires_api_key(&self) -> bool {
        true
    }

    async fn complete(&self, prompt: &Prompt) -> Result<String, NudgeError> {
        let start = Instant::now();
        let body = build_request(&self.model, prompt);

        let url = format!("{}/chat/completions", self.base_url);
        debug!("{}: POST {url} model={}", self.name, self.model);

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| NudgeError::Parser(format!("{} request failed: {e}", self.name)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(NudgeError::Parser(format!(
                "{} returned {status}: {text}",
                self.name
            )));
        }

        let parsed: ChatCompletionResponse = resp.json().await.map_err(|e| {
            NudgeError::Parser(format!("{}: failed to parse response: {e}", self.name))
        })?;

        let text = parsed
            .choices
            .as_ref()
            .and_then(|c| c.first())
            .and_then(|c| c.message.as_ref())
            .map(|m| m.content.clone())
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| NudgeError::Parser(format!("{}: empty response", self.name)))?;

        debug!(
            "{}: {} tokens in {}ms",
            self.name,
            parsed
                .usage
                .as_ref()
                .and_then(|u| u.total_tokens)
                .unwrap_or_default(),
            start.elapsed().as_millis()
        );

        Ok(text)
    }

    async fn is_available(&self) -> bool {
        if self.api_key.is_empty() {
            warn!("{}: no API key configured", self.name);
            return false;
        }
        let url = format!("{}/models", self.base_url);
        match self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!("{} not available: {e}", self.name);
                false
            }
        }
    }
}
