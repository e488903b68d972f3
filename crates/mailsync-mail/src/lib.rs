//! Mailbox access (IMAP) and the sync coordinator built on top of it.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use imap::{ClientBuilder, ConnectionMode};
use imap_proto::types::{BodyStructure, ContentEncoding, SectionPath};
use mailparse::{MailAddr, MailHeaderMap, addrparse_header};
use tracing::debug;

use mailsync_content::TransferEncoding;

pub mod sync;

pub use sync::{SyncError, ingest_new_messages, sync_mailbox};

type ImapSession = imap::Session<imap::Connection>;

pub const DEFAULT_FOLDER: &str = "INBOX";

/// Envelope fields the sync needs from a message header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderInfo {
    /// Bare `local@domain` of the first From entry.
    pub from: Option<String>,
    pub subject: Option<String>,
    /// Date header as sent, unparsed.
    pub date: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overview {
    pub message_id: Option<String>,
}

/// Transfer encoding of each top-level body part, part 1 first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BodyStructureInfo {
    pub encodings: Vec<TransferEncoding>,
}

impl BodyStructureInfo {
    /// Encoding of a 1-based part; parts the structure does not describe are
    /// passed through.
    pub fn encoding_for(&self, part: u32) -> TransferEncoding {
        part.checked_sub(1)
            .and_then(|idx| self.encodings.get(idx as usize))
            .cloned()
            .unwrap_or_default()
    }
}

/// The mail-store capability consumed by the sync coordinator. Ids are
/// mailbox-scoped and stable for the lifetime of the mailbox.
#[async_trait]
pub trait MailSource: Send {
    async fn list_message_ids(&mut self) -> Result<Vec<u32>>;
    async fn fetch_header_info(&mut self, id: u32) -> Result<HeaderInfo>;
    /// Raw bytes of a 1-based body part; empty when the part does not exist.
    async fn fetch_body_part(&mut self, id: u32, part: u32) -> Result<Vec<u8>>;
    async fn fetch_structure(&mut self, id: u32) -> Result<BodyStructureInfo>;
    async fn fetch_raw_headers(&mut self, id: u32) -> Result<String>;
    async fn fetch_overview(&mut self, id: u32) -> Result<Overview>;
    /// Releases the underlying connection. Calling it twice is harmless.
    async fn close(&mut self) -> Result<()>;
}

#[derive(Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub folder: String,
    pub skip_tls_verify: bool,
}

impl std::fmt::Debug for ImapConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("folder", &self.folder)
            .field("skip_tls_verify", &self.skip_tls_verify)
            .finish()
    }
}

/// An authenticated IMAP session with one folder selected. Every command
/// runs on the blocking pool; the session travels there and back.
pub struct ImapMailbox {
    session: Option<ImapSession>,
    identity: String,
    header_cache: Option<(u32, Vec<u8>)>,
}

impl ImapMailbox {
    pub async fn connect(config: &ImapConfig) -> Result<Self> {
        let config = config.clone();
        tokio::task::spawn_blocking(move || Self::connect_blocking(&config)).await?
    }

    fn connect_blocking(config: &ImapConfig) -> Result<Self> {
        debug!(host = %config.host, port = config.port, "imap connect");
        let client = ClientBuilder::new(config.host.as_str(), config.port)
            .tls_kind(imap::TlsKind::Native)
            .mode(ConnectionMode::AutoTls)
            .danger_skip_tls_verify(config.skip_tls_verify)
            .connect()?;
        let mut session = client
            .login(&config.username, &config.password)
            .map_err(|e| e.0)?;
        debug!(username = %config.username, "imap login ok");
        let mailbox = session.select(&config.folder)?;
        let mut identity = format!(
            "imap://{}@{}:{}/{}",
            config.username, config.host, config.port, config.folder
        );
        if let Some(uid_validity) = mailbox.uid_validity {
            identity.push_str(&format!(";UIDVALIDITY={}", uid_validity));
        }
        debug!(folder = %config.folder, exists = mailbox.exists, "imap folder selected");
        Ok(Self {
            session: Some(session),
            identity,
            header_cache: None,
        })
    }

    /// Default ledger partition key. UIDVALIDITY is part of it so a server
    /// that renumbers the folder starts a fresh partition.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    async fn with_session<T, F>(&mut self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut ImapSession) -> Result<T> + Send + 'static,
    {
        let mut session = self
            .session
            .take()
            .ok_or_else(|| anyhow!("imap session closed"))?;
        let (session, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut session);
            (session, result)
        })
        .await?;
        self.session = Some(session);
        result
    }

    async fn header_bytes(&mut self, uid: u32) -> Result<Vec<u8>> {
        if let Some((cached_uid, bytes)) = &self.header_cache {
            if *cached_uid == uid {
                return Ok(bytes.clone());
            }
        }
        let bytes = self
            .with_session(move |session| {
                let fetches = session.uid_fetch(uid.to_string(), "BODY.PEEK[HEADER]")?;
                fetches
                    .iter()
                    .find_map(|f| f.header().map(|h| h.to_vec()))
                    .ok_or_else(|| anyhow!("No header found for UID {}", uid))
            })
            .await?;
        self.header_cache = Some((uid, bytes.clone()));
        Ok(bytes)
    }
}

#[async_trait]
impl MailSource for ImapMailbox {
    async fn list_message_ids(&mut self) -> Result<Vec<u32>> {
        self.with_session(|session| {
            let uids = session.uid_search("ALL")?;
            Ok(uids.into_iter().collect())
        })
        .await
    }

    async fn fetch_header_info(&mut self, id: u32) -> Result<HeaderInfo> {
        let raw = self.header_bytes(id).await?;
        Ok(parse_header_info(&raw))
    }

    async fn fetch_body_part(&mut self, id: u32, part: u32) -> Result<Vec<u8>> {
        self.with_session(move |session| {
            let fetches = session.uid_fetch(id.to_string(), format!("BODY.PEEK[{}]", part))?;
            if fetches.is_empty() {
                return Err(anyhow!("No message found for UID {}", id));
            }
            let path = SectionPath::Part(vec![part], None);
            Ok(fetches
                .iter()
                .find_map(|f| f.section(&path).map(|b| b.to_vec()))
                .unwrap_or_default())
        })
        .await
    }

    async fn fetch_structure(&mut self, id: u32) -> Result<BodyStructureInfo> {
        self.with_session(move |session| {
            let fetches = session.uid_fetch(id.to_string(), "BODYSTRUCTURE")?;
            fetches
                .iter()
                .find_map(|f| f.bodystructure().map(structure_info))
                .ok_or_else(|| anyhow!("No body structure found for UID {}", id))
        })
        .await
    }

    async fn fetch_raw_headers(&mut self, id: u32) -> Result<String> {
        let raw = self.header_bytes(id).await?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    async fn fetch_overview(&mut self, id: u32) -> Result<Overview> {
        let raw = self.header_bytes(id).await?;
        Ok(parse_overview(&raw))
    }

    async fn close(&mut self) -> Result<()> {
        self.header_cache = None;
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || session.logout()).await??;
        debug!(identity = %self.identity, "imap logout");
        Ok(())
    }
}

pub fn parse_header_info(raw: &[u8]) -> HeaderInfo {
    let Ok((headers, _)) = mailparse::parse_headers(raw) else {
        return HeaderInfo::default();
    };
    let from = headers
        .get_first_header("From")
        .and_then(|header| addrparse_header(header).ok())
        .and_then(|list| list.iter().find_map(first_address));
    HeaderInfo {
        from,
        subject: headers.get_first_value("Subject"),
        date: headers.get_first_value("Date"),
    }
}

pub fn parse_overview(raw: &[u8]) -> Overview {
    let message_id = mailparse::parse_headers(raw)
        .ok()
        .and_then(|(headers, _)| headers.get_first_value("Message-ID"))
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    Overview { message_id }
}

fn first_address(addr: &MailAddr) -> Option<String> {
    let raw = match addr {
        MailAddr::Single(info) => info.addr.as_str(),
        MailAddr::Group(group) => group.addrs.first()?.addr.as_str(),
    };
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn structure_info(structure: &BodyStructure) -> BodyStructureInfo {
    let encodings = match structure {
        BodyStructure::Multipart { bodies, .. } => bodies.iter().map(part_encoding).collect(),
        single => vec![part_encoding(single)],
    };
    BodyStructureInfo { encodings }
}

fn part_encoding(part: &BodyStructure) -> TransferEncoding {
    match part {
        BodyStructure::Basic { other, .. }
        | BodyStructure::Text { other, .. }
        | BodyStructure::Message { other, .. } => match &other.transfer_encoding {
            ContentEncoding::SevenBit => TransferEncoding::SevenBit,
            ContentEncoding::EightBit => TransferEncoding::EightBit,
            ContentEncoding::Binary => TransferEncoding::Binary,
            ContentEncoding::Base64 => TransferEncoding::Base64,
            ContentEncoding::QuotedPrintable => TransferEncoding::QuotedPrintable,
            ContentEncoding::Other(tag) => TransferEncoding::from_tag(tag),
        },
        BodyStructure::Multipart { .. } => TransferEncoding::SevenBit,
    }
}
