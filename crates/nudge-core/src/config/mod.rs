mod channels;
mod defaults;
mod providers;


pub use channels::*;
pub use providers::*;

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

use crate::error::NudgeError;
use crate::lifecycle::LifecyclePolicy;
use defaults::*;

/// Top-level Nudge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub nudge: NudgeConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub parser: ParserConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub calendar: CalendarConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NudgeConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for NudgeConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            data_dir: default_data_dir(),
            log_level: default_log_level(),
        }
    }
}

/// Task store config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Scheduling engine configuration: sweep tick, horizon, delivery retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Look-ahead window for promoting CREATED tasks.
    #[serde(default = "default_horizon")]
    pub horizon_secs: u64,
    #[serde(default = "default_max_send_attempts")]
    pub max_send_attempts: u32,
    /// Base backoff between delivery attempts; doubles per attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,
    /// Whether a delivered (SENT) reminder can still be snoozed.
    #[serde(default = "default_true")]
    pub snooze_after_send: bool,
    /// Snooze buttons offered on every notification, in minutes.
    #[serde(default = "default_snooze_options")]
    pub snooze_options_minutes: Vec<u32>,
    /// How far in the past a freshly parsed due time may be before it is rejected.
    #[serde(default = "default_past_due_grace")]
    pub past_due_grace_secs: u64,
    /// Furthest ahead a task may be due, from creation or a snooze.
    #[serde(default = "default_max_lead_days")]
    pub max_lead_days: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sweep_interval_secs: default_sweep_interval(),
            horizon_secs: default_horizon(),
            max_send_attempts: default_max_send_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            send_timeout_secs: default_send_timeout(),
            snooze_after_send: true,
            snooze_options_minutes: default_snooze_options(),
            past_due_grace_secs: default_past_due_grace(),
            max_lead_days: default_max_lead_days(),
        }
    }
}

impl SchedulerConfig {
    pub fn horizon(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.horizon_secs as i64)
    }

    pub fn past_due_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.past_due_grace_secs as i64)
    }

    pub fn max_lead(&self) -> chrono::Duration {
        chrono::Duration::days(self.max_lead_days.min(36_500) as i64)
    }

    pub fn lifecycle_policy(&self) -> LifecyclePolicy {
        LifecyclePolicy {
            snooze_after_send: self.snooze_after_send,
        }
    }
}

/// Calendar mirror configuration. Disabled or token-less means no mirroring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarConfig {
    #[serde(default)]
    pub enabled: bool,
    /// OAuth access token with calendar scope.
    #[serde(default)]
    pub access_token: String,
    #[serde(default = "default_calendar_id")]
    pub calendar_id: String,
    #[serde(default = "default_calendar_base_url")]
    pub base_url: String,
    /// Attempts per mirror call before giving up.
    #[serde(default = "default_calendar_attempts")]
    pub max_attempts: u32,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            access_token: String::new(),
            calendar_id: default_calendar_id(),
            base_url: default_calendar_base_url(),
            max_attempts: default_calendar_attempts(),
        }
    }
}

/// HTTP API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Shared secret for service-to-service calls. Empty = bearer auth disabled.
    #[serde(default)]
    pub internal_api_key: String,
    /// Maximum age of Mini App init data.
    #[serde(default = "default_init_data_ttl")]
    pub init_data_ttl_secs: i64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_api_host(),
            port: default_api_port(),
            internal_api_key: String::new(),
            init_data_ttl_secs: default_init_data_ttl(),
        }
    }
}

impl Config {
    /// Override secrets from the environment (or any lookup, for tests).
    ///
    /// `NUDGE_BOT_TOKEN`, `NUDGE_INTERNAL_API_KEY`, `NUDGE_CALENDAR_TOKEN`, and
    /// `<BACKEND>_API_KEY` for each parser backend.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(token) = get("NUDGE_BOT_TOKEN") {
            self.channel
                .telegram
                .get_or_insert_with(|| TelegramConfig {
                    enabled: true,
                    ..Default::default()
                })
                .bot_token = token;
        }
        if let Some(key) = get("NUDGE_INTERNAL_API_KEY") {
            self.api.internal_api_key = key;
        }
        if let Some(token) = get("NUDGE_CALENDAR_TOKEN") {
            self.calendar.access_token = token;
        }
        for backend in ["openai", "groq", "gemini"] {
            let var = format!("{}_API_KEY", backend.to_uppercase());
            if let (Some(key), Some(slot)) = (get(&var), self.parser.backend_mut(backend)) {
                slot.get_or_insert_with(BackendConfig::default).api_key = key;
            }
        }
    }

    /// Bot token of the Telegram channel, if configured.
    pub fn bot_token(&self) -> Option<&str> {
        self.channel
            .telegram
            .as_ref()
            .map(|tg| tg.bot_token.as_str())
            .filter(|t| !t.is_empty())
    }
}

/// Expand `~` to home directory.
pub fn shellexpand(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return format!("{}/{rest}", home.to_string_lossy());
        }
    }
    path.to_string()
}

/// Create the `data/` and `logs/` subdirectories under `data_dir`.
pub fn ensure_layout(data_dir: &str) {
    let dir = shellexpand(data_dir);
    let base = Path::new(&dir);
    for sub in &["data", "logs"] {
        if let Err(e) = std::fs::create_dir_all(base.join(sub)) {
            warn!("layout: failed to create {}: {e}", base.join(sub).display());
        }
    }
}

/// Load configuration from a TOML file, then apply environment overrides.
///
/// Falls back to defaults if the file does not exist.
pub fn load(path: &str) -> Result<Config, NudgeError> {
    let mut config = read_file(path)?;
    config.apply_env(|key| std::env::var(key).ok());
    Ok(config)
}

fn read_file(path: &str) -> Result<Config, NudgeError> {
    let path = Path::new(path);
    if !path.exists() {
        info!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| NudgeError::Config(format!("failed to read {}: {}", path.display(), e)))?;

    let config: Config = toml::from_str(&content)
        .map_err(|e| NudgeError::Config(format!("failed to parse config: {}", e)))?;

    if config.scheduler.snooze_options_minutes.contains(&0) {
        return Err(NudgeError::Config(
            "scheduler.snooze_options_minutes must be positive".into(),
        ));
    }

    Ok(config)
}
