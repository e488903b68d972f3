//! One table per correspondent, created on first contact and migrated
//! forward additively.
//!
//! Table names come from the sender address with everything outside
//! `[A-Za-z0-9_]` replaced by `_`, so distinct addresses can collide
//! (`a.b@x.com` and `a_b@x.com`). The `correspondent_tables` registry records
//! which sender owns a name; a later sender that collides gets a name with a
//! SHA-256 suffix instead of sharing the table.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::{IngestedMessage, SqliteStore};

pub const TABLE_PREFIX: &str = "thread_";
const HASH_SUFFIX_LEN: usize = 12;

/// Columns added after the first table layout shipped.
const THREADING_COLUMNS: [&str; 2] = ["message_id", "thread_id"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrespondentTable {
    pub sender: String,
    pub name: String,
}

impl CorrespondentTable {
    pub fn thread_index(&self) -> String {
        format!("{}_thread_id_idx", self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredRow {
    pub id: i64,
    pub email_id: String,
    pub date: String,
    pub sender: String,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub message_id: Option<String>,
    pub thread_id: Option<String>,
    pub created_at: String,
}

pub fn table_name_for(sender: &str) -> String {
    let canonical: String = sender
        .bytes()
        .map(|b| {
            if b.is_ascii_alphanumeric() || b == b'_' {
                b as char
            } else {
                '_'
            }
        })
        .collect();
    format!("{}{}", TABLE_PREFIX, canonical)
}

pub fn disambiguated_table_name(sender: &str) -> String {
    let digest = hex::encode(Sha256::digest(sender.as_bytes()));
    format!(
        "{}_{}",
        table_name_for(sender),
        &digest[..HASH_SUFFIX_LEN]
    )
}

impl SqliteStore {
    /// Makes sure `sender` has a table with the current column set.
    /// Repeatable, and safe when several runs race on the same sender.
    pub async fn ensure_table(&self, sender: &str) -> Result<CorrespondentTable> {
        let name = self.claim_table_name(sender).await?;
        let table = CorrespondentTable {
            sender: sender.to_string(),
            name,
        };
        if self.table_exists(&table.name).await? {
            self.upgrade_table(&table).await?;
        } else {
            self.create_table(&table).await?;
        }
        Ok(table)
    }

    pub async fn insert_row(
        &self,
        table: &CorrespondentTable,
        message: &IngestedMessage,
    ) -> Result<()> {
        let query = format!(
            "INSERT INTO \"{}\" (email_id, date, sender, subject, body, message_id, thread_id)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            table.name
        );
        sqlx::query(&query)
            .bind(message.id.to_string())
            .bind(&message.date)
            .bind(&message.sender)
            .bind(&message.subject)
            .bind(&message.body)
            .bind(message.message_id.as_deref())
            .bind(message.thread_id.as_deref())
            .execute(&self.pool)
            .await
            .with_context(|| format!("insert into {}", table.name))?;
        Ok(())
    }

    pub async fn registered_table(&self, sender: &str) -> Result<Option<String>> {
        let row = sqlx::query_as::<_, (String,)>(
            "SELECT table_name FROM correspondent_tables WHERE sender = ?",
        )
        .bind(sender)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.0))
    }

    /// Table holding `sender`'s rows: the registered one, or an unclaimed
    /// legacy `thread_<sender>` table that predates the registry.
    pub async fn readable_table(&self, sender: &str) -> Result<Option<String>> {
        if let Some(name) = self.registered_table(sender).await? {
            return Ok(Some(name));
        }
        let legacy = table_name_for(sender);
        if !self.table_exists(&legacy).await? {
            return Ok(None);
        }
        let owner = sqlx::query_as::<_, (String,)>(
            "SELECT sender FROM correspondent_tables WHERE table_name = ?",
        )
        .bind(&legacy)
        .fetch_optional(&self.pool)
        .await?;
        Ok(owner.is_none().then_some(legacy))
    }

    /// Rows stored for `sender`, oldest first, optionally limited to one
    /// thread. Unknown senders have no rows.
    pub async fn list_rows(&self, sender: &str, thread_id: Option<&str>) -> Result<Vec<StoredRow>> {
        let Some(name) = self.readable_table(sender).await? else {
            return Ok(Vec::new());
        };
        // Legacy tables read before their first upgrade lack the threading columns.
        let mut threading = Vec::with_capacity(THREADING_COLUMNS.len());
        for column in THREADING_COLUMNS {
            if self.column_exists(&name, column).await? {
                threading.push(column.to_string());
            } else if thread_id.is_some() && column == "thread_id" {
                return Ok(Vec::new());
            } else {
                threading.push(format!("NULL AS {}", column));
            }
        }
        let mut query = format!(
            "SELECT id, email_id, date, sender, subject, body, {}, created_at FROM \"{}\"",
            threading.join(", "),
            name
        );
        if thread_id.is_some() {
            query.push_str(" WHERE thread_id = ?");
        }
        query.push_str(" ORDER BY date, id");

        let mut q = sqlx::query_as::<
            _,
            (
                i64,
                String,
                String,
                String,
                Option<String>,
                Option<String>,
                Option<String>,
                Option<String>,
                String,
            ),
        >(&query);
        if let Some(thread_id) = thread_id {
            q = q.bind(thread_id);
        }
        let rows = q.fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|row| StoredRow {
                id: row.0,
                email_id: row.1,
                date: row.2,
                sender: row.3,
                subject: row.4,
                body: row.5,
                message_id: row.6,
                thread_id: row.7,
                created_at: row.8,
            })
            .collect())
    }

    async fn claim_table_name(&self, sender: &str) -> Result<String> {
        if let Some(name) = self.registered_table(sender).await? {
            return Ok(name);
        }
        for candidate in [table_name_for(sender), disambiguated_table_name(sender)] {
            sqlx::query(
                "INSERT OR IGNORE INTO correspondent_tables (sender, table_name) VALUES (?, ?)",
            )
            .bind(sender)
            .bind(&candidate)
            .execute(&self.pool)
            .await?;
            if let Some(name) = self.registered_table(sender).await? {
                return Ok(name);
            }
            warn!(
                sender,
                table = %candidate,
                "table name owned by another sender, trying next candidate"
            );
        }
        Err(anyhow!("no free table name for sender {}", sender))
    }

    async fn create_table(&self, table: &CorrespondentTable) -> Result<()> {
        let create = format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email_id TEXT NOT NULL,
                date TEXT NOT NULL,
                sender TEXT NOT NULL,
                subject TEXT,
                body TEXT,
                message_id TEXT,
                thread_id TEXT,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )",
            table.name
        );
        sqlx::query(&create)
            .execute(&self.pool)
            .await
            .with_context(|| format!("create table {}", table.name))?;
        self.create_thread_index(table).await?;
        info!(sender = %table.sender, table = %table.name, "correspondent table created");
        Ok(())
    }

    async fn upgrade_table(&self, table: &CorrespondentTable) -> Result<()> {
        for column in THREADING_COLUMNS {
            if self.column_exists(&table.name, column).await? {
                continue;
            }
            let alter = format!("ALTER TABLE \"{}\" ADD COLUMN {} TEXT", table.name, column);
            if let Err(err) = sqlx::query(&alter).execute(&self.pool).await {
                // A concurrent run may have added it between the check and the ALTER.
                if !self.column_exists(&table.name, column).await? {
                    return Err(err).with_context(|| format!("alter table {}", table.name));
                }
            } else {
                info!(table = %table.name, column, "correspondent table column added");
            }
        }
        self.create_thread_index(table).await
    }

    async fn create_thread_index(&self, table: &CorrespondentTable) -> Result<()> {
        let index = format!(
            "CREATE INDEX IF NOT EXISTS \"{}\" ON \"{}\" (thread_id)",
            table.thread_index(),
            table.name
        );
        sqlx::query(&index)
            .execute(&self.pool)
            .await
            .with_context(|| format!("index thread_id on {}", table.name))?;
        Ok(())
    }
}
