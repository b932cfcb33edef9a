//! User registration and timezone preference.

use super::{ts, Store};
use chrono::{DateTime, Utc};
use nudge_core::error::NudgeError;

impl Store {
    /// Register a user. Returns `true` if the user was new.
    pub async fn register_user(&self, owner: &str, now: DateTime<Utc>) -> Result<bool, NudgeError> {
        let result =
            sqlx::query("INSERT INTO users (owner, created_at) VALUES (?, ?) ON CONFLICT(owner) DO NOTHING")
                .bind(owner)
                .bind(ts(now))
                .execute(&self.pool)
                .await
                .map_err(|e| NudgeError::Store(format!("register user failed: {e}")))?;
        Ok(result.rows_affected() == 1)
    }

    /// Set a user's IANA timezone, registering the user if needed.
    pub async fn set_timezone(
        &self,
        owner: &str,
        timezone: &str,
        now: DateTime<Utc>,
    ) -> Result<(), NudgeError> {
        sqlx::query(
            "INSERT INTO users (owner, timezone, created_at) VALUES (?, ?, ?) \
             ON CONFLICT(owner) DO UPDATE SET timezone = excluded.timezone",
        )
        .bind(owner)
        .bind(timezone)
        .bind(ts(now))
        .execute(&self.pool)
        .await
        .map_err(|e| NudgeError::Store(format!("set timezone failed: {e}")))?;
        Ok(())
    }

    pub async fn get_timezone(&self, owner: &str) -> Result<Option<String>, NudgeError> {
        let tz: Option<(Option<String>,)> =
            sqlx::query_as("SELECT timezone FROM users WHERE owner = ?")
                .bind(owner)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| NudgeError::Store(format!("get timezone failed: {e}")))?;
        Ok(tz.and_then(|(tz,)| tz))
    }
}
