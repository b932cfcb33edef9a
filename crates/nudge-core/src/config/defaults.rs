//! Default value functions used by serde for config deserialization.

pub fn default_name() -> String {
    "Nudge".to_string()
}

pub fn default_data_dir() -> String {
    "~/.nudge".to_string()
}

pub fn default_log_level() -> String {
    "info".to_string()
}

pub fn default_db_path() -> String {
    "~/.nudge/data/nudge.db".to_string()
}

pub fn default_true() -> bool {
    true
}

pub fn default_sweep_interval() -> u64 {
    60
}

pub fn default_horizon() -> u64 {
    300
}

pub fn default_max_send_attempts() -> u32 {
    3
}

pub fn default_retry_backoff_ms() -> u64 {
    2000
}

pub fn default_send_timeout() -> u64 {
    10
}

pub fn default_snooze_options() -> Vec<u32> {
    vec![15, 60]
}

pub fn default_past_due_grace() -> u64 {
    60
}

pub fn default_max_lead_days() -> u64 {
    3650
}

pub fn default_parser() -> String {
    "groq".to_string()
}

pub fn default_parser_timeout() -> u64 {
    30
}

pub fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

pub fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

pub fn default_groq_model() -> String {
    "llama-3.3-70b-versatile".to_string()
}

pub fn default_groq_base_url() -> String {
    "https://api.groq.com/openai/v1".to_string()
}

pub fn default_gemini_model() -> String {
    "gemini-2.0-flash".to_string()
}

pub fn default_gemini_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

pub fn default_calendar_id() -> String {
    "primary".to_string()
}

pub fn default_calendar_base_url() -> String {
    "https://www.googleapis.com/calendar/v3".to_string()
}

pub fn default_calendar_attempts() -> u32 {
    3
}

pub fn default_api_host() -> String {
    "127.0.0.1".to_string()
}

pub fn default_api_port() -> u16 {
    3000
}

pub fn default_init_data_ttl() -> i64 {
    86_400
}
