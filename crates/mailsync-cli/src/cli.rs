use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use serde_json::{Value as JsonValue, json};
use tracing::{info, warn};

use mailsync_core::{SqliteStore, SyncOutcome};
use mailsync_mail::{ImapMailbox, SyncError, sync_mailbox};

use crate::config::{AccountConfig, database_path, resolve_account};

const CLI_SCHEMA_VERSION: u32 = 1;

#[derive(Parser, Debug)]
#[command(name = "mailsync", version, about = "Mailbox ingestion and threading")]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum CliCommand {
    /// Ingest new messages from the account's mailbox.
    Sync(SyncCmd),
    /// List stored messages for one correspondent.
    Messages(MessagesCmd),
    Keys(KeysCmd),
}

#[derive(Args, Debug)]
pub(crate) struct SyncCmd {
    #[arg(long)]
    api_key: String,
    #[arg(long)]
    account: Option<String>,
}

#[derive(Args, Debug)]
pub(crate) struct MessagesCmd {
    #[arg(long)]
    sender: String,
    #[arg(long)]
    thread: Option<String>,
    #[arg(long)]
    account: Option<String>,
}

#[derive(Args, Debug)]
pub(crate) struct KeysCmd {
    #[command(subcommand)]
    command: KeysCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum KeysCommand {
    /// Create or update an API key.
    Add {
        key: String,
        /// `YYYY-MM-DD` or `YYYY-MM-DD HH:MM:SS` (UTC).
        #[arg(long)]
        expires_at: Option<String>,
        #[arg(long)]
        disabled: bool,
        #[arg(long)]
        account: Option<String>,
    },
}

pub(crate) fn output_ok(value: JsonValue) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string(&json!({
            "schema": CLI_SCHEMA_VERSION,
            "ok": true,
            "result": value
        }))?
    );
    Ok(())
}

pub(crate) fn output_error(message: &str) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string(&json!({
            "schema": CLI_SCHEMA_VERSION,
            "ok": false,
            "error": message
        }))?
    );
    Ok(())
}

fn output_outcome(outcome: &SyncOutcome) -> Result<()> {
    println!("{}", serde_json::to_string(outcome)?);
    Ok(())
}

pub(crate) async fn run_cli(command: CliCommand, accounts: &[AccountConfig]) -> Result<()> {
    match command {
        CliCommand::Sync(cmd) => {
            let account = resolve_account(accounts, cmd.account.as_deref())?;
            let outcome = run_sync(account, &cmd.api_key).await;
            output_outcome(&outcome)
        }
        CliCommand::Messages(cmd) => {
            let account = resolve_account(accounts, cmd.account.as_deref())?;
            let store = open_store(account).await?;
            let rows = store.list_rows(&cmd.sender, cmd.thread.as_deref()).await?;
            store.close().await;
            output_ok(json!({
                "sender": cmd.sender,
                "thread_id": cmd.thread,
                "count": rows.len(),
                "messages": rows,
            }))
        }
        CliCommand::Keys(KeysCmd {
            command:
                KeysCommand::Add {
                    key,
                    expires_at,
                    disabled,
                    account,
                },
        }) => {
            let account = resolve_account(accounts, account.as_deref())?;
            let store = open_store(account).await?;
            let permissions = if disabled { 0 } else { 1 };
            store
                .upsert_api_key(&key, permissions, expires_at.as_deref())
                .await?;
            store.close().await;
            info!(account = %account.name, permissions, "api key stored");
            output_ok(json!({ "key": key, "permissions": permissions }))
        }
    }
}

async fn open_store(account: &AccountConfig) -> Result<SqliteStore> {
    let path = database_path(account)?;
    let store = SqliteStore::connect(&path).await?;
    store.init().await?;
    Ok(store)
}

/// Authorizes the caller, connects to the mailbox and runs one sync. Every
/// failure, including a rejected key, becomes an error outcome.
async fn run_sync(account: &AccountConfig, api_key: &str) -> SyncOutcome {
    let store = match open_store(account).await {
        Ok(store) => store,
        Err(err) => return SyncOutcome::error(SyncError::Connection(format!("{err:#}")).to_string()),
    };
    let outcome = authorized_sync(account, &store, api_key).await;
    store.close().await;
    outcome
}

async fn authorized_sync(account: &AccountConfig, store: &SqliteStore, api_key: &str) -> SyncOutcome {
    match store.is_authorized(api_key).await {
        Ok(true) => {}
        Ok(false) => {
            warn!(account = %account.name, "api key rejected");
            return SyncOutcome::error(SyncError::Unauthorized.to_string());
        }
        Err(err) => return SyncOutcome::error(SyncError::Ledger(format!("{err:#}")).to_string()),
    }

    let Some(imap) = account.imap.as_ref() else {
        return SyncOutcome::error(format!("Account {} has no IMAP settings", account.name));
    };
    let mut mailbox = match ImapMailbox::connect(imap).await {
        Ok(mailbox) => mailbox,
        Err(err) => return SyncOutcome::error(SyncError::Connection(format!("{err:#}")).to_string()),
    };
    let mailbox_key = account
        .mailbox_key
        .clone()
        .unwrap_or_else(|| mailbox.identity().to_string());
    sync_mailbox(&mut mailbox, store, &mailbox_key).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_arguments_parse() -> Result<()> {
        let cli = Cli::try_parse_from(["mailsync", "sync", "--api-key", "k1", "--account", "work"])?;
        match cli.command {
            CliCommand::Sync(cmd) => {
                assert_eq!(cmd.api_key, "k1");
                assert_eq!(cmd.account.as_deref(), Some("work"));
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(Cli::try_parse_from(["mailsync", "sync"]).is_err());
        Ok(())
    }

    #[test]
    fn keys_add_arguments_parse() -> Result<()> {
        let cli = Cli::try_parse_from([
            "mailsync",
            "keys",
            "add",
            "k2",
            "--expires-at",
            "2030-01-01",
            "--disabled",
        ])?;
        match cli.command {
            CliCommand::Keys(KeysCmd {
                command:
                    KeysCommand::Add {
                        key,
                        expires_at,
                        disabled,
                        account,
                    },
            }) => {
                assert_eq!(key, "k2");
                assert_eq!(expires_at.as_deref(), Some("2030-01-01"));
                assert!(disabled);
                assert_eq!(account, None);
            }
            other => panic!("unexpected command {:?}", other),
        }
        Ok(())
    }

    fn test_account(name: &str) -> AccountConfig {
        let db_path = std::env::temp_dir().join(format!(
            "mailsync-cli-{}-{}.db",
            name,
            std::process::id()
        ));
        AccountConfig {
            name: name.to_string(),
            db_path: db_path.to_string_lossy().to_string(),
            mailbox_key: None,
            imap: None,
        }
    }

    fn remove_db(account: &AccountConfig) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", account.db_path, suffix));
        }
    }

    #[tokio::test]
    async fn unknown_key_is_rejected_before_connecting() -> Result<()> {
        let account = test_account("reject");
        remove_db(&account);

        let outcome = run_sync(&account, "nope").await;
        assert_eq!(outcome, SyncOutcome::error("unauthorized"));

        remove_db(&account);
        Ok(())
    }

    #[tokio::test]
    async fn authorized_key_without_imap_reports_config_error() -> Result<()> {
        let account = test_account("noimap");
        remove_db(&account);
        let store = open_store(&account).await?;
        store.upsert_api_key("good", 1, None).await?;
        store.close().await;

        match run_sync(&account, "good").await {
            SyncOutcome::Error { message, .. } => assert!(message.contains("no IMAP settings")),
            other => panic!("expected error, got {:?}", other),
        }

        remove_db(&account);
        Ok(())
    }
}
