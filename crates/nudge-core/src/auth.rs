//! Authentication boundary for mutating entry points.
//!
//! Two schemes are accepted:
//! - `tma <initData>`: Telegram Mini App init data, signed by Telegram with a
//!   key derived from the bot token.
//! - `Bearer <key>`: the internal service key, paired with an explicit owner.
//!
//! Both checks are stateless and compare in constant time.

use crate::error::NudgeError;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Secrets and limits used to authenticate a request.
#[derive(Debug, Clone)]
pub struct AuthKeys {
    pub bot_token: String,
    /// Empty disables the bearer scheme.
    pub internal_api_key: String,
    pub init_data_ttl_secs: i64,
}

/// The user a request was authenticated as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub owner: String,
    pub username: Option<String>,
    /// True when authenticated with the internal service key.
    pub internal: bool,
}

/// The `user` object embedded in Mini App init data.
#[derive(Debug, Clone, Deserialize)]
pub struct WebAppUser {
    pub id: i64,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub language_code: Option<String>,
}

/// Authenticate an `Authorization` header value.
///
/// `owner` is the explicit owner parameter; it is only consulted (and then
/// required) for the bearer scheme.
pub fn authenticate(
    header: &str,
    owner: Option<&str>,
    keys: &AuthKeys,
    now: DateTime<Utc>,
) -> Result<AuthContext, NudgeError> {
    if let Some(init_data) = strip_prefix_ci(header, "tma ") {
        let user = verify_init_data(init_data, &keys.bot_token, now, keys.init_data_ttl_secs)?;
        return Ok(AuthContext {
            owner: user.id.to_string(),
            username: user.username,
            internal: false,
        });
    }

    let token = strip_prefix_ci(header, "bearer ").unwrap_or(header);
    if keys.internal_api_key.is_empty() || !constant_time_eq(token, &keys.internal_api_key) {
        return Err(NudgeError::Auth("invalid authorization".into()));
    }
    match owner.filter(|o| !o.is_empty()) {
        Some(owner) => Ok(AuthContext {
            owner: owner.to_string(),
            username: None,
            internal: true,
        }),
        None => Err(NudgeError::Auth(
            "owner is required for internal calls".into(),
        )),
    }
}

/// Validate Telegram Mini App init data and return the signed-in user.
///
/// The data-check string is every field except `hash`, sorted by key, as
/// `key=value` lines. The signing key is `HMAC_SHA256("WebAppData", bot_token)`.
pub fn verify_init_data(
    init_data: &str,
    bot_token: &str,
    now: DateTime<Utc>,
    ttl_secs: i64,
) -> Result<WebAppUser, NudgeError> {
    let mut fields = parse_query(init_data)?;

    let hash_pos = fields
        .iter()
        .position(|(k, _)| k == "hash")
        .ok_or_else(|| NudgeError::Auth("init data has no hash".into()))?;
    let (_, received) = fields.remove(hash_pos);
    let received = hex::decode(received)
        .map_err(|_| NudgeError::Auth("init data hash is not hex".into()))?;

    fields.sort_by(|a, b| a.0.cmp(&b.0));
    let data_check = fields
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("\n");

    let mut mac = new_mac(&webapp_secret(bot_token)?)?;
    mac.update(data_check.as_bytes());
    mac.verify_slice(&received)
        .map_err(|_| NudgeError::Auth("init data signature mismatch".into()))?;

    let field = |name: &str| {
        fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    };

    let auth_date: i64 = field("auth_date")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| NudgeError::Auth("init data has no auth_date".into()))?;
    if now.timestamp() - auth_date > ttl_secs {
        return Err(NudgeError::Auth("init data expired".into()));
    }

    let user = field("user").ok_or_else(|| NudgeError::Auth("init data has no user".into()))?;
    serde_json::from_str(user).map_err(|e| NudgeError::Auth(format!("invalid init data user: {e}")))
}

/// Sign init data fields the way Telegram does. Returns the hex hash.
pub fn sign_init_data(fields: &[(&str, &str)], bot_token: &str) -> Result<String, NudgeError> {
    let mut sorted: Vec<_> = fields.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let data_check = sorted
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("\n");
    let mut mac = new_mac(&webapp_secret(bot_token)?)?;
    mac.update(data_check.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time string comparison.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

fn webapp_secret(bot_token: &str) -> Result<Vec<u8>, NudgeError> {
    let mut mac = new_mac(b"WebAppData")?;
    mac.update(bot_token.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

fn new_mac(key: &[u8]) -> Result<HmacSha256, NudgeError> {
    HmacSha256::new_from_slice(key).map_err(|e| NudgeError::Auth(format!("hmac key: {e}")))
}

fn parse_query(query: &str) -> Result<Vec<(String, String)>, NudgeError> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            Ok((decode_component(k)?, decode_component(v)?))
        })
        .collect()
}

fn decode_component(raw: &str) -> Result<String, NudgeError> {
    urlencoding::decode(&raw.replace('+', " "))
        .map(|s| s.into_owned())
        .map_err(|e| NudgeError::Auth(format!("malformed init data: {e}")))
}

fn strip_prefix_ci<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &value[prefix.len()..])
}
