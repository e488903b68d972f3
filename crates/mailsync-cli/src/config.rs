use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use mailsync_mail::{DEFAULT_FOLDER, ImapConfig};

pub(crate) const DB_ENV: &str = "MAILSYNC_DB";

#[derive(Debug, Clone)]
pub(crate) struct AccountConfig {
    pub(crate) name: String,
    pub(crate) db_path: String,
    /// Ledger partition key; defaults to the IMAP mailbox identity.
    pub(crate) mailbox_key: Option<String>,
    pub(crate) imap: Option<ImapConfig>,
}

fn xdg_config_dir() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

fn xdg_state_dir() -> PathBuf {
    std::env::var_os("XDG_STATE_HOME")
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local").join("state"))
        })
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

fn config_path_candidates() -> Vec<PathBuf> {
    vec![
        PathBuf::from("mailsync.toml"),
        xdg_config_dir().join("mailsync").join("mailsync.toml"),
    ]
}

fn load_config_text() -> Option<(PathBuf, String)> {
    config_path_candidates()
        .into_iter()
        .find_map(|path| std::fs::read_to_string(&path).ok().map(|text| (path, text)))
}

pub(crate) fn load_accounts_config() -> Result<Vec<AccountConfig>> {
    let Some((path, content)) = load_config_text() else {
        return Ok(Vec::new());
    };
    tracing::debug!(path = %path.display(), "loading config");
    parse_accounts(&content).with_context(|| format!("invalid config {}", path.display()))
}

pub(crate) fn parse_accounts(content: &str) -> Result<Vec<AccountConfig>> {
    let value: toml::Value = toml::from_str(content)?;
    if let Some(accounts) = value.get("accounts").and_then(|v| v.as_array()) {
        return accounts
            .iter()
            .enumerate()
            .map(|(idx, acct)| parse_account_config(acct, idx))
            .collect();
    }
    let Some(imap) = value.get("imap").map(parse_imap_table).transpose()?.flatten() else {
        return Ok(Vec::new());
    };
    let name = imap.username.clone();
    let db_path = value
        .get("db_path")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("mailsync-{}.db", slugify_name(&name)));
    Ok(vec![AccountConfig {
        name,
        db_path: resolve_db_path(&db_path),
        mailbox_key: value
            .get("mailbox_key")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        imap: Some(imap),
    }])
}

fn parse_account_config(value: &toml::Value, index: usize) -> Result<AccountConfig> {
    let imap = value.get("imap").map(parse_imap_table).transpose()?.flatten();
    let name = value
        .get("name")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .or_else(|| imap.as_ref().map(|i| i.username.clone()))
        .unwrap_or_else(|| format!("account-{}", index + 1));
    let db_path = value
        .get("db_path")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("mailsync-{}.db", slugify_name(&name)));
    Ok(AccountConfig {
        name,
        db_path: resolve_db_path(&db_path),
        mailbox_key: value
            .get("mailbox_key")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        imap,
    })
}

/// `Ok(None)` when required fields are missing; an out-of-range port is an
/// error rather than a silently different port.
fn parse_imap_table(imap: &toml::Value) -> Result<Option<ImapConfig>> {
    let port = match imap.get("port").and_then(|v| v.as_integer()) {
        Some(raw) => u16::try_from(raw)
            .map_err(|_| anyhow::anyhow!("imap port {} is out of range", raw))?,
        None => 993,
    };
    let field = |key: &str| imap.get(key).and_then(|v| v.as_str()).map(|s| s.to_string());
    let (Some(host), Some(username), Some(password)) =
        (field("host"), field("username"), field("password"))
    else {
        return Ok(None);
    };
    Ok(Some(ImapConfig {
        host,
        port,
        username,
        password,
        folder: imap
            .get("folder")
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_FOLDER)
            .to_string(),
        skip_tls_verify: imap
            .get("skip_tls_verify")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
    }))
}

fn resolve_db_path(raw: &str) -> String {
    let path = Path::new(raw);
    if path.is_absolute() {
        raw.to_string()
    } else {
        xdg_state_dir()
            .join("mailsync")
            .join(path)
            .to_string_lossy()
            .to_string()
    }
}

/// Database file for `account`, honouring the `MAILSYNC_DB` override.
/// Creates the parent directory.
pub(crate) fn database_path(account: &AccountConfig) -> Result<String> {
    let path = std::env::var(DB_ENV).unwrap_or_else(|_| account.db_path.clone());
    if let Some(parent) = Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
    }
    Ok(path)
}

pub(crate) fn resolve_account<'a>(
    accounts: &'a [AccountConfig],
    requested: Option<&str>,
) -> Result<&'a AccountConfig> {
    let selected = if let Some(name) = requested {
        accounts.iter().find(|acct| acct.name == name)
    } else if accounts.len() == 1 {
        accounts.first()
    } else {
        None
    };
    selected.ok_or_else(|| anyhow::anyhow!("Account not found or not specified"))
}

fn slugify_name(raw: &str) -> String {
    let mut out = String::new();
    let mut last_dash = false;
    for ch in raw.chars() {
        let lower = ch.to_ascii_lowercase();
        if lower.is_ascii_alphanumeric() {
            out.push(lower);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed = out.trim_matches('-').to_string();
    if trimmed.is_empty() {
        "account".to_string()
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accounts_table_with_defaults() -> Result<()> {
        let accounts = parse_accounts(
            r#"
[[accounts]]
name = "support"
db_path = "/var/lib/mailsync/support.db"
mailbox_key = "support-inbox"

[accounts.imap]
host = "imap.example.com"
username = "support@example.com"
password = "secret"

[[accounts]]
[accounts.imap]
host = "imap.other.org"
port = 143
username = "ops@other.org"
password = "pw"
folder = "Archive"
skip_tls_verify = true
"#,
        )?;
        assert_eq!(accounts.len(), 2);

        let support = &accounts[0];
        assert_eq!(support.name, "support");
        assert_eq!(support.db_path, "/var/lib/mailsync/support.db");
        assert_eq!(support.mailbox_key.as_deref(), Some("support-inbox"));
        let imap = support.imap.as_ref().ok_or_else(|| anyhow::anyhow!("no imap"))?;
        assert_eq!(imap.port, 993);
        assert_eq!(imap.folder, "INBOX");
        assert!(!imap.skip_tls_verify);

        let ops = &accounts[1];
        assert_eq!(ops.name, "ops@other.org");
        assert!(ops.db_path.ends_with("mailsync-ops-other-org.db"));
        assert_eq!(ops.mailbox_key, None);
        let imap = ops.imap.as_ref().ok_or_else(|| anyhow::anyhow!("no imap"))?;
        assert_eq!(imap.port, 143);
        assert_eq!(imap.folder, "Archive");
        assert!(imap.skip_tls_verify);
        Ok(())
    }

    #[test]
    fn top_level_imap_is_a_single_account() -> Result<()> {
        let accounts = parse_accounts(
            r#"
db_path = "/tmp/solo.db"

[imap]
host = "imap.example.com"
username = "me@example.com"
password = "pw"
"#,
        )?;
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].name, "me@example.com");
        assert_eq!(accounts[0].db_path, "/tmp/solo.db");
        Ok(())
    }

    #[test]
    fn incomplete_imap_table_is_ignored() -> Result<()> {
        let accounts = parse_accounts(
            r#"
[[accounts]]
name = "broken"
db_path = "/tmp/broken.db"

[accounts.imap]
host = "imap.example.com"
"#,
        )?;
        assert_eq!(accounts.len(), 1);
        assert!(accounts[0].imap.is_none());
        assert!(parse_accounts("").map(|a| a.is_empty())?);
        assert!(parse_accounts("[[accounts").is_err());
        Ok(())
    }

    #[test]
    fn out_of_range_port_is_rejected() {
        let err = parse_accounts(
            r#"
[[accounts]]
name = "bad-port"

[accounts.imap]
host = "imap.example.com"
port = 70000
username = "me@example.com"
password = "pw"
"#,
        )
        .err()
        .map(|e| e.to_string());
        assert_eq!(err.as_deref(), Some("imap port 70000 is out of range"));

        let negative = r#"
[imap]
host = "imap.example.com"
port = -1
username = "me@example.com"
password = "pw"
"#;
        assert!(parse_accounts(negative).is_err());
    }

    #[test]
    fn account_resolution() -> Result<()> {
        let mk = |name: &str| AccountConfig {
            name: name.to_string(),
            db_path: format!("/tmp/{}.db", name),
            mailbox_key: None,
            imap: None,
        };
        let one = vec![mk("a")];
        assert_eq!(resolve_account(&one, None)?.name, "a");

        let two = vec![mk("a"), mk("b")];
        assert_eq!(resolve_account(&two, Some("b"))?.name, "b");
        assert!(resolve_account(&two, None).is_err());
        assert!(resolve_account(&two, Some("c")).is_err());
        Ok(())
    }

    #[test]
    fn slugs_are_filename_safe() {
        assert_eq!(slugify_name("Support Team"), "support-team");
        assert_eq!(slugify_name("a@b.com"), "a-b-com");
        assert_eq!(slugify_name("!!"), "account");
    }
}
