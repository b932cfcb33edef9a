//! Parser factory: builds the configured LLM backend from config.

use nudge_core::{config::Config, traits::Provider};
use nudge_providers::{gemini::GeminiProvider, openai::OpenAiProvider};
use std::sync::Arc;
use std::time::Duration;

/// Build the provider named by `parser.default`.
///
/// OpenAI and Groq share the chat-completions client; Gemini has its own.
pub fn build_provider(cfg: &Config) -> anyhow::Result<Arc<dyn Provider>> {
    let name = cfg.parser.default.as_str();
    let backend = cfg
        .parser
        .resolve(name)
        .ok_or_else(|| anyhow::anyhow!("parser.{name} section missing in config"))?;
    let timeout = Duration::from_secs(cfg.parser.timeout_secs);

    match name {
        "openai" | "groq" => Ok(Arc::new(OpenAiProvider::from_config(
            backend.name,
            backend.base_url,
            backend.api_key,
            backend.model,
            timeout,
        ))),
        "gemini" => Ok(Arc::new(GeminiProvider::from_config(
            backend.base_url,
            backend.api_key,
            backend.model,
            timeout,
        ))),
        other => anyhow::bail!("unsupported provider: {other}"),
    }
}
