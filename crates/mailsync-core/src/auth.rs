//! API-key gate consulted before a sync run is allowed to start.

use anyhow::{Result, anyhow};
use chrono::{NaiveDate, NaiveDateTime};

use crate::{DATE_FORMAT, SqliteStore, now_timestamp};

/// Accepts `YYYY-MM-DD HH:MM:SS` or a bare `YYYY-MM-DD` (midnight).
pub fn parse_expiry(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, DATE_FORMAT) {
        return Ok(dt.format(DATE_FORMAT).to_string());
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        if let Some(dt) = date.and_hms_opt(0, 0, 0) {
            return Ok(dt.format(DATE_FORMAT).to_string());
        }
    }
    Err(anyhow!("invalid expiry {:?}, expected YYYY-MM-DD[ HH:MM:SS]", raw))
}

impl SqliteStore {
    /// A key is accepted when it exists, carries permission 1, and has not
    /// expired. Timestamps compare as `YYYY-MM-DD HH:MM:SS` strings in UTC.
    pub async fn is_authorized(&self, api_key: &str) -> Result<bool> {
        if api_key.trim().is_empty() {
            return Ok(false);
        }
        let row = sqlx::query_as::<_, (i64, Option<String>)>(
            "SELECT permissions, expires_at FROM api_keys WHERE api_key = ?",
        )
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await?;
        let Some((permissions, expires_at)) = row else {
            return Ok(false);
        };
        let now = now_timestamp();
        Ok(permissions == 1 && expires_at.is_none_or(|exp| exp > now))
    }

    pub async fn upsert_api_key(
        &self,
        api_key: &str,
        permissions: i64,
        expires_at: Option<&str>,
    ) -> Result<()> {
        if api_key.trim().is_empty() {
            return Err(anyhow!("api key must not be empty"));
        }
        let expires_at = expires_at.map(parse_expiry).transpose()?;
        sqlx::query(
            "INSERT INTO api_keys (api_key, permissions, expires_at) VALUES (?, ?, ?)
             ON CONFLICT(api_key) DO UPDATE SET
               permissions = excluded.permissions,
               expires_at = excluded.expires_at",
        )
        .bind(api_key)
        .bind(permissions)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
