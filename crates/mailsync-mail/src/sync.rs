use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use mailsync_content::{decode_body, is_blank, normalize_message_id, resolve_thread_id};
use mailsync_core::{
    CorrespondentTable, IngestedMessage, MessageStore, NO_SUBJECT, SyncOutcome, UNKNOWN_SENDER,
    now_timestamp, parse_message_date,
};

use crate::MailSource;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Mail store unavailable: {0}")]
    Connection(String),

    #[error("Failed to fetch message {uid}: {reason}")]
    Fetch { uid: u32, reason: String },

    #[error("Failed to prepare table for {sender}: {reason}")]
    Schema { sender: String, reason: String },

    #[error("Failed to store message {uid}: {reason}")]
    Persist { uid: u32, reason: String },

    #[error("Ledger update failed: {0}")]
    Ledger(String),

    #[error("unauthorized")]
    Unauthorized,
}

/// Runs one sync pass over `source` and always releases it afterwards.
pub async fn sync_mailbox<M>(source: &mut M, store: &dyn MessageStore, mailbox: &str) -> SyncOutcome
where
    M: MailSource + ?Sized,
{
    info!(mailbox, "sync started");
    let result = ingest_new_messages(source, store, mailbox).await;
    if let Err(err) = source.close().await {
        warn!(mailbox, error = %err, "mailbox close failed");
    }
    match result {
        Ok(messages) => {
            info!(mailbox, ingested = messages.len(), "sync finished");
            SyncOutcome::success(messages)
        }
        Err(err) => {
            error!(mailbox, error = %err, "sync failed");
            SyncOutcome::error(err.to_string())
        }
    }
}

/// Ingests every message whose id is not yet in the ledger for `mailbox`,
/// newest id first. On failure the ids persisted so far are still recorded
/// before the error is returned.
pub async fn ingest_new_messages<M>(
    source: &mut M,
    store: &dyn MessageStore,
    mailbox: &str,
) -> Result<Vec<IngestedMessage>, SyncError>
where
    M: MailSource + ?Sized,
{
    store
        .init()
        .await
        .map_err(|e| SyncError::Ledger(format!("{e:#}")))?;

    let mut ids = source
        .list_message_ids()
        .await
        .map_err(|e| SyncError::Connection(format!("{e:#}")))?;
    ids.sort_unstable_by(|a, b| b.cmp(a));
    ids.dedup();

    let processed = store
        .processed_ids(mailbox)
        .await
        .map_err(|e| SyncError::Ledger(format!("{e:#}")))?;
    debug!(mailbox, listed = ids.len(), known = processed.len(), "ledger loaded");

    let mut tables: HashMap<String, CorrespondentTable> = HashMap::new();
    let mut ingested = Vec::new();
    let mut batch = Vec::new();
    let mut failure = None;

    for uid in ids {
        let key = uid.to_string();
        if processed.contains(&key) {
            continue;
        }
        match ingest_one(source, store, &mut tables, uid).await {
            Ok(message) => {
                batch.push(key);
                ingested.push(message);
            }
            Err(err) => {
                failure = Some(err);
                break;
            }
        }
    }

    let recorded = store
        .record_batch(mailbox, &batch)
        .await
        .map_err(|e| SyncError::Ledger(format!("{e:#}")));
    if let Some(err) = failure {
        if let Err(ledger_err) = recorded {
            warn!(mailbox, error = %ledger_err, "could not record ids persisted before failure");
        }
        return Err(err);
    }
    recorded?;
    Ok(ingested)
}

async fn ingest_one<M>(
    source: &mut M,
    store: &dyn MessageStore,
    tables: &mut HashMap<String, CorrespondentTable>,
    uid: u32,
) -> Result<IngestedMessage, SyncError>
where
    M: MailSource + ?Sized,
{
    let message = fetch_message(source, uid)
        .await
        .map_err(|e| SyncError::Fetch {
            uid,
            reason: format!("{e:#}"),
        })?;

    let table = match tables.get(&message.sender) {
        Some(table) => table.clone(),
        None => {
            let table = store
                .ensure_table(&message.sender)
                .await
                .map_err(|e| SyncError::Schema {
                    sender: message.sender.clone(),
                    reason: format!("{e:#}"),
                })?;
            tables.insert(message.sender.clone(), table.clone());
            table
        }
    };

    store
        .insert_row(&table, &message)
        .await
        .map_err(|e| SyncError::Persist {
            uid,
            reason: format!("{e:#}"),
        })?;
    debug!(uid, table = %table.name, thread_id = ?message.thread_id, "message stored");
    Ok(message)
}

async fn fetch_message<M>(source: &mut M, uid: u32) -> anyhow::Result<IngestedMessage>
where
    M: MailSource + ?Sized,
{
    let header = source.fetch_header_info(uid).await?;
    let sender = header
        .from
        .filter(|from| !from.trim().is_empty())
        .unwrap_or_else(|| UNKNOWN_SENDER.to_string());
    let subject = header.subject.unwrap_or_else(|| NO_SUBJECT.to_string());
    let date = match header.date.as_deref().and_then(parse_message_date) {
        Some(date) => date,
        None => {
            warn!(uid, raw = ?header.date, "unusable Date header, using ingestion time");
            now_timestamp()
        }
    };

    let structure = source.fetch_structure(uid).await?;
    let first = source.fetch_body_part(uid, 1).await?;
    let mut body = decode_body(&first, &structure.encoding_for(1));
    if is_blank(&body) {
        let second = source.fetch_body_part(uid, 2).await?;
        body = decode_body(&second, &structure.encoding_for(2));
    }

    let overview = source.fetch_overview(uid).await?;
    let message_id = overview.message_id.as_deref().and_then(normalize_message_id);
    let raw_headers = source.fetch_raw_headers(uid).await?;
    let thread_id = resolve_thread_id(&raw_headers, message_id.as_deref());

    Ok(IngestedMessage {
        id: uid,
        date,
        sender,
        subject,
        body,
        message_id,
        thread_id,
    })
}
