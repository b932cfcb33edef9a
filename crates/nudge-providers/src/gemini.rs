//! Google Gemini API provider.
//!
//! Calls the Gemini `generateContent` endpoint. Auth via URL query param.

use async_trait::async_trait;
use nudge_core::{
    error::NudgeError,
    traits::{Prompt, Provider},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Google Gemini API provider.
pub struct GeminiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl GeminiProvider {
    /// Create from config values.
    pub fn from_config(base_url: String, api_key: String, model: String, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            timeout,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
}

#[derive(Serialize, Deserialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize, Deserialize)]
struct GeminiPart {
    text: String,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

fn build_request(prompt: &Prompt) -> GeminiRequest {
    GeminiRequest {
        contents: vec![GeminiContent {
            role: Some("user".to_string()),
            parts: vec![GeminiPart {
                text: prompt.user.clone(),
            }],
        }],
        system_instruction: (!prompt.system.is_empty()).then(|| GeminiContent {
            role: None,
            parts: vec![GeminiPart {
                text: prompt.system.clone(),
            }],
        }),
        generation_config: GenerationConfig {
            temperature: prompt.temperature,
            response_mime_type: prompt.json_mode.then_some("application/json"),
        },
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn requires_api_key(&self) -> bool {
        true
    }

    async fn complete(&self, prompt: &Prompt) -> Result<String, NudgeError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );
        debug!("gemini: POST models/{}:generateContent", self.model);

        let resp = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&build_request(prompt))
            .send()
            .await
            .map_err(|e| NudgeError::Parser(format!("gemini request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(NudgeError::Parser(format!(
                "gemini returned {status}: {text}"
            )));
        }

        let parsed: GeminiResponse = resp
            .json()
            .await
            .map_err(|e| NudgeError::Parser(format!("gemini: failed to parse response: {e}")))?;

        first_text(parsed).ok_or_else(|| NudgeError::Parser("gemini: empty response".into()))
    }

    async fn is_available(&self) -> bool {
        if self.api_key.is_empty() {
            warn!("gemini: no API key configured");
            return false;
        }
        let url = format!("{}/models?key={}", self.base_url, self.api_key);
        match self.client.get(&url).timeout(self.timeout).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!("gemini not available: {e}");
                false
            }
        }
    }
}

fn first_text(resp: GeminiResponse) -> Option<String> {
    resp.candidates?
        .into_iter()
        .next()?
        .content?
        .parts
        .into_iter()
        .next()
        .map(|p| p.text)
        .filter(|t| !t.trim().is_empty())
}
