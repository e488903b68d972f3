use std::collections::HashSet;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailparse::dateparse;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::warn;

pub mod auth;
pub mod ledger;
pub mod registrar;

pub use registrar::{CorrespondentTable, StoredRow, disambiguated_table_name, table_name_for};

pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const NO_SUBJECT: &str = "[No Subject]";
pub const UNKNOWN_SENDER: &str = "unknown";

/// One message as ingested by a sync run and reported back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestedMessage {
    pub id: u32,
    pub date: String,
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub message_id: Option<String>,
    pub thread_id: Option<String>,
}

/// Result of a sync run as seen by the caller. A failed run never exposes
/// the rows it may have committed before failing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SyncOutcome {
    Success {
        emails_count: usize,
        data: Vec<IngestedMessage>,
    },
    /// Keeps `emails_count: 0` and `data: null` so callers can read the same
    /// fields from either status.
    Error {
        emails_count: usize,
        data: Option<Vec<IngestedMessage>>,
        message: String,
    },
}

impl SyncOutcome {
    pub fn success(data: Vec<IngestedMessage>) -> Self {
        SyncOutcome::Success {
            emails_count: data.len(),
            data,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        SyncOutcome::Error {
            emails_count: 0,
            data: None,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SyncOutcome::Success { .. })
    }
}

pub fn now_timestamp() -> String {
    Utc::now().format(DATE_FORMAT).to_string()
}

/// Parses an RFC 2822 Date header into `YYYY-MM-DD HH:MM:SS` (UTC).
///
/// Strict RFC 2822 first, then `mailparse`'s lenient parser for the
/// malformed dates real mail carries. The lenient parser yields the epoch for
/// input with no date in it, which is treated as unparsable.
pub fn parse_message_date(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let ts = match DateTime::parse_from_rfc2822(trimmed) {
        Ok(dt) => dt.timestamp(),
        Err(_) => dateparse(trimmed).ok().filter(|ts| *ts > 0)?,
    };
    DateTime::<Utc>::from_timestamp(ts, 0).map(|dt| dt.format(DATE_FORMAT).to_string())
}

/// Storage operations the sync coordinator depends on.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Applies pending migrations (ledger, registry, API keys).
    async fn init(&self) -> Result<()>;
    async fn processed_ids(&self, mailbox: &str) -> Result<HashSet<String>>;
    async fn record_batch(&self, mailbox: &str, ids: &[String]) -> Result<()>;
    async fn ensure_table(&self, sender: &str) -> Result<CorrespondentTable>;
    async fn insert_row(
        &self,
        table: &CorrespondentTable,
        message: &IngestedMessage,
    ) -> Result<()>;
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(path: &str) -> Result<Self> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{}", path)
        };
        let options = SqliteConnectOptions::new()
            .filename(url.trim_start_matches("sqlite:"))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub async fn init(&self) -> Result<()> {
        let migrator = sqlx::migrate!("../../migrations");
        if let Err(err) = migrator.run(&self.pool).await {
            // Another process may have applied the same migration first.
            warn!(error = %err, "migration failed, retrying once");
            migrator.run(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn table_exists(&self, table: &str) -> Result<bool> {
        let row = sqlx::query_as::<_, (String,)>(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ? COLLATE NOCASE",
        )
        .bind(table)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn column_exists(&self, table: &str, column: &str) -> Result<bool> {
        let row = sqlx::query_as::<_, (i64,)>(
            "SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?",
        )
        .bind(table)
        .bind(column)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0 > 0)
    }

    pub async fn index_exists(&self, index: &str) -> Result<bool> {
        let row = sqlx::query_as::<_, (String,)>(
            "SELECT name FROM sqlite_master WHERE type = 'index' AND name = ? COLLATE NOCASE",
        )
        .bind(index)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }
}

fn placeholders(count: usize) -> String {
    std::iter::repeat("?")
        .take(count)
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn init(&self) -> Result<()> {
        SqliteStore::init(self).await
    }

    async fn processed_ids(&self, mailbox: &str) -> Result<HashSet<String>> {
        SqliteStore::processed_ids(self, mailbox).await
    }

    async fn record_batch(&self, mailbox: &str, ids: &[String]) -> Result<()> {
        SqliteStore::record_batch(self, mailbox, ids).await
    }

    async fn ensure_table(&self, sender: &str) -> Result<CorrespondentTable> {
        SqliteStore::ensure_table(self, sender).await
    }

    async fn insert_row(
        &self,
        table: &CorrespondentTable,
        message: &IngestedMessage,
    ) -> Result<()> {
        SqliteStore::insert_row(self, table, message).await
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{cleanup, fresh_store};
    use super::*;

    #[tokio::test]
    async fn init_is_repeatable() -> anyhow::Result<()> {
        let (store, db_path) = fresh_store().await?;
        store.init().await?;
        store.init().await?;

        for table in ["processed_emails", "correspondent_tables", "api_keys"] {
            assert!(store.table_exists(table).await?, "missing table {}", table);
        }

        cleanup(store, db_path).await;
        Ok(())
    }

    #[test]
    fn message_dates_normalize_to_utc() {
        assert_eq!(
            parse_message_date("Tue, 1 Jul 2003 10:52:37 +0200").as_deref(),
            Some("2003-07-01 08:52:37")
        );
        assert_eq!(
            parse_message_date("1 Jul 2003 10:52:37 GMT").as_deref(),
            Some("2003-07-01 10:52:37")
        );
        assert_eq!(parse_message_date("   "), None);
    }

    #[test]
    fn dateless_headers_are_unparsable() {
        for raw in ["not a date", "garbage 12", "2024", "yesterday", "1 Jan"] {
            assert_eq!(parse_message_date(raw), None, "input {:?}", raw);
        }
    }

    #[test]
    fn outcome_serializes_with_status_tag() -> anyhow::Result<()> {
        let ok = SyncOutcome::success(vec![IngestedMessage {
            id: 7,
            date: "2024-01-01 00:00:00".to_string(),
            sender: "a@x.com".to_string(),
            subject: "hi".to_string(),
            body: "body".to_string(),
            message_id: Some("m@x.com".to_string()),
            thread_id: None,
        }]);
        let value = serde_json_value(&ok)?;
        assert_eq!(value["status"], "success");
        assert_eq!(value["emails_count"], 1);
        assert_eq!(value["data"][0]["sender"], "a@x.com");
        assert!(value["data"][0]["thread_id"].is_null());

        let err = serde_json_value(&SyncOutcome::error("boom"))?;
        assert_eq!(err["status"], "error");
        assert_eq!(err["message"], "boom");
        assert_eq!(err["emails_count"], 0);
        assert!(err.get("data").is_some_and(|data| data.is_null()));
        Ok(())
    }

    fn serde_json_value(outcome: &SyncOutcome) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::to_value(outcome)?)
    }
}
