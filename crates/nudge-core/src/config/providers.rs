use serde::{Deserialize, Serialize};

use super::defaults::*;

/// Natural-language parser configuration.
///
/// `default` names the backend used for parsing; each backend has its own table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserConfig {
    #[serde(default = "default_parser")]
    pub default: String,
    #[serde(default = "default_parser_timeout")]
    pub timeout_secs: u64,
    pub openai: Option<BackendConfig>,
    pub groq: Option<BackendConfig>,
    pub gemini: Option<BackendConfig>,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            default: default_parser(),
            timeout_secs: default_parser_timeout(),
            openai: None,
            groq: None,
            gemini: None,
        }
    }
}

impl ParserConfig {
    /// Backend table by name.
    pub fn backend(&self, name: &str) -> Option<&BackendConfig> {
        match name {
            "openai" => self.openai.as_ref(),
            "groq" => self.groq.as_ref(),
            "gemini" => self.gemini.as_ref(),
            _ => None,
        }
    }

    pub(crate) fn backend_mut(&mut self, name: &str) -> Option<&mut Option<BackendConfig>> {
        match name {
            "openai" => Some(&mut self.openai),
            "groq" => Some(&mut self.groq),
            "gemini" => Some(&mut self.gemini),
            _ => None,
        }
    }
}

/// One LLM backend. Unset `model`/`base_url` fall back to the backend's defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BackendConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

/// A backend table with its defaults filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBackend {
    pub name: String,
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

impl ParserConfig {
    /// Resolve the backend `name`, filling unset fields with that backend's
    /// defaults. `None` for unknown names or backends without a table.
    pub fn resolve(&self, name: &str) -> Option<ResolvedBackend> {
        let cfg = self.backend(name)?;
        let (model, base_url): (fn() -> String, fn() -> String) = match name {
            "openai" => (default_openai_model, default_openai_base_url),
            "groq" => (default_groq_model, default_groq_base_url),
            "gemini" => (default_gemini_model, default_gemini_base_url),
            _ => return None,
        };
        Some(ResolvedBackend {
            name: name.to_string(),
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone().unwrap_or_else(model),
            base_url: cfg
                .base_url
                .clone()
                .unwrap_or_else(base_url)
                .trim_end_matches('/')
                .to_string(),
        })
    }
}
