//! Mailbox-partitioned record of message ids that were already ingested.
//!
//! The `UNIQUE (email_id, mailbox)` constraint is what makes ingestion
//! idempotent; the up-front set lookups only spare redundant fetches.

use std::collections::HashSet;

use anyhow::Result;
use tracing::debug;

use crate::{SqliteStore, placeholders};

const LOOKUP_CHUNK: usize = 500;

impl SqliteStore {
    pub async fn processed_ids(&self, mailbox: &str) -> Result<HashSet<String>> {
        let rows =
            sqlx::query_as::<_, (String,)>("SELECT email_id FROM processed_emails WHERE mailbox = ?")
                .bind(mailbox)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|row| row.0).collect())
    }

    /// Returns the subset of `candidates` already recorded for `mailbox`.
    pub async fn contains_any(
        &self,
        mailbox: &str,
        candidates: &[String],
    ) -> Result<HashSet<String>> {
        let mut seen = HashSet::new();
        for chunk in candidates.chunks(LOOKUP_CHUNK) {
            let query = format!(
                "SELECT email_id FROM processed_emails WHERE mailbox = ? AND email_id IN ({})",
                placeholders(chunk.len())
            );
            let mut q = sqlx::query_as::<_, (String,)>(&query).bind(mailbox);
            for id in chunk {
                q = q.bind(id);
            }
            seen.extend(q.fetch_all(&self.pool).await?.into_iter().map(|row| row.0));
        }
        Ok(seen)
    }

    /// Records `ids` for `mailbox` in one transaction. Pairs that are already
    /// present are skipped, so racing runs cannot fail each other here.
    pub async fn record_batch(&self, mailbox: &str, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for id in ids {
            inserted += sqlx::query(
                "INSERT OR IGNORE INTO processed_emails (email_id, mailbox) VALUES (?, ?)",
            )
            .bind(id)
            .bind(mailbox)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        debug!(
            mailbox,
            requested = ids.len(),
            inserted,
            "ledger batch recorded"
        );
        Ok(())
    }
}
