//! # IMAP handling module.
//!
//! Uses [async-email/async-imap](https://github.com/async-email/async-imap)
//! to implement connect, select, fetch and IDLE against standard IMAP
//! servers. One [`Session`] serves one account; the connection pool decides
//! when sessions are opened and reused.

use std::borrow::Cow;

use anyhow::Context as _;
use async_imap::types::{Fetch, Flag, Name, NameAttribute};
use chrono::Utc;
use futures::TryStreamExt;

use crate::account::{Account, AccountId, AuthKind, Credentials, TlsMode};
use crate::context::Context;

pub(crate) mod capabilities;
mod client;
pub(crate) mod idle;
pub(crate) mod select_folder;
pub(crate) mod session;

use capabilities::Capabilities;
use client::Client;
pub(crate) use idle::IdleOutcome;
pub(crate) use select_folder::SelectInfo;
pub(crate) use session::Session;

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IMAP connection failed: {0:#}")]
    ConnectionFailed(anyhow::Error),

    #[error("IMAP could not login as {0}")]
    LoginFailed(String),

    #[error("IMAP server has too many connections for {0}")]
    TooManyConnections(String),

    #[error("IMAP protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Attributes prefetched for every message entering the index: everything
/// the notification payload and the threading heuristic need, but no body.
const PREFETCH_FLAGS: &str = "(UID INTERNALDATE RFC822.SIZE FLAGS ENVELOPE \
                              BODY.PEEK[HEADER.FIELDS (REFERENCES IN-REPLY-TO)])";

/// Server coordinates needed to open a session for one account.
#[derive(Debug, Clone)]
pub(crate) struct Imap {
    pub account_id: AccountId,
    host: String,
    port: u16,
    tls_mode: TlsMode,
    login_user: String,
}

#[derive(Debug)]
struct OAuth2 {
    user: String,
    access_token: String,
}

impl async_imap::Authenticator for OAuth2 {
    type Response = String;

    fn process(&mut self, _data: &[u8]) -> Self::Response {
        format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            self.user, self.access_token
        )
    }
}

impl Imap {
    pub fn from_account(account: &Account) -> Self {
        Self {
            account_id: account.id,
            host: account.imap_host.clone(),
            port: account.imap_port,
            tls_mode: account.tls_mode,
            login_user: account.login_user.clone(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Opens a connection, authenticates and discovers capabilities.
    ///
    /// Rate limiting happens in the pool; this dials unconditionally.
    pub(crate) async fn connect(&self, context: &Context) -> Result<Session> {
        let client = match self.tls_mode {
            TlsMode::Tls => Client::connect_secure(&self.host, self.port, true)
                .await
                .map_err(Error::ConnectionFailed)?,
            TlsMode::StartTls => {
                let client = Client::connect_insecure(&self.host, self.port)
                    .await
                    .map_err(Error::ConnectionFailed)?;
                client
                    .secure(&self.host, true)
                    .await
                    .map_err(Error::ConnectionFailed)?
            }
            TlsMode::Plain => Client::connect_insecure(&self.host, self.port)
                .await
                .map_err(Error::ConnectionFailed)?,
        };

        let credentials = context
            .credentials
            .credentials_for(context, self.account_id)
            .await
            .map_err(Error::Other)?;

        let mut session = self.login(client, credentials).await?;

        let capabilities = self.determine_capabilities(&mut session).await?;
        info!(
            context,
            "{}: connected to {}:{} (idle={} condstore={})",
            self.account_id,
            self.host,
            self.port,
            capabilities.can_idle,
            capabilities.can_condstore,
        );
        Ok(Session::new(session, capabilities))
    }

    async fn login(
        &self,
        client: Client,
        credentials: Credentials,
    ) -> Result<async_imap::Session<Box<dyn session::SessionStream>>> {
        let inner = client.into_inner();
        let res = match credentials.kind {
            AuthKind::Password => inner.login(&self.login_user, &credentials.secret).await,
            AuthKind::OAuth2 => {
                let authenticator = OAuth2 {
                    user: self.login_user.clone(),
                    access_token: credentials.secret,
                };
                inner.authenticate("XOAUTH2", authenticator).await
            }
        };
        match res {
            Ok(session) => Ok(session),
            Err((err, _client)) => {
                let message = err.to_string();
                if message.to_lowercase().contains("too many") {
                    Err(Error::TooManyConnections(self.host.clone()))
                } else {
                    Err(Error::LoginFailed(format!(
                        "{} on {}: {}",
                        self.login_user, self.host, message
                    )))
                }
            }
        }
    }

    async fn determine_capabilities(
        &self,
        session: &mut async_imap::Session<Box<dyn session::SessionStream>>,
    ) -> Result<Capabilities> {
        let caps = session
            .capabilities()
            .await
            .map_err(|err| Error::Protocol(format!("CAPABILITY failed: {err}")))?;
        Ok(Capabilities {
            can_idle: caps.has_str("IDLE"),
            can_condstore: caps.has_str("CONDSTORE"),
            can_move: caps.has_str("MOVE"),
            can_uidplus: caps.has_str("UIDPLUS"),
        })
    }
}

impl Session {
    /// Returns the names of all selectable folders on the server.
    pub(crate) async fn list_folders(&mut self, context: &Context) -> anyhow::Result<Vec<String>> {
        let names: Vec<Name> = self
            .inner
            .list(Some(""), Some("*"))
            .await
            .context("LIST failed")?
            .try_collect()
            .await
            .context("failed to read LIST response")?;

        let mut folders = Vec::new();
        for name in names {
            if name
                .attributes()
                .iter()
                .any(|attr| attr == &NameAttribute::NoSelect)
            {
                continue;
            }
            folders.push(name.name().to_string());
        }
        info!(context, "found {} folders on the server", folders.len());
        Ok(folders)
    }

    /// Checks liveness with a NOOP.
    pub(crate) async fn noop_alive(&mut self) -> bool {
        tokio::time::timeout(std::time::Duration::from_secs(5), self.inner.noop())
            .await
            .map(|res| res.is_ok())
            .unwrap_or(false)
    }

    /// Fetches message metadata for a UID set in ascending UID order.
    pub(crate) async fn fetch_message_metadata(
        &mut self,
        uid_set: &str,
    ) -> anyhow::Result<Vec<FetchedMessage>> {
        let list: Vec<Fetch> = self
            .inner
            .uid_fetch(uid_set, PREFETCH_FLAGS)
            .await
            .with_context(|| format!("UID FETCH {uid_set} failed"))?
            .try_collect()
            .await
            .context("failed to read FETCH response")?;

        let mut messages = Vec::new();
        for fetch in &list {
            if let Some(msg) = parse_fetch(fetch) {
                messages.push(msg);
            }
        }
        messages.sort_by_key(|m| m.uid);
        Ok(messages)
    }

    /// Fetches the flag deltas since `modseq` via CONDSTORE.
    pub(crate) async fn fetch_changed_flags(
        &mut self,
        modseq: u64,
    ) -> anyhow::Result<Vec<(u32, String, Option<u64>)>> {
        let list: Vec<Fetch> = self
            .inner
            .uid_fetch("1:*", format!("(FLAGS) (CHANGEDSINCE {modseq})"))
            .await
            .context("CHANGEDSINCE fetch failed")?
            .try_collect()
            .await
            .context("failed to read CHANGEDSINCE response")?;

        let mut res = Vec::new();
        for fetch in &list {
            if let Some(uid) = fetch.uid {
                res.push((uid, flags_to_string(fetch.flags()), fetch.modseq));
            }
        }
        res.sort_by_key(|(uid, _, _)| *uid);
        Ok(res)
    }

    /// Fetches the flags of all messages, for servers without CONDSTORE.
    pub(crate) async fn fetch_all_flags(&mut self) -> anyhow::Result<Vec<(u32, String)>> {
        let list: Vec<Fetch> = self
            .inner
            .uid_fetch("1:*", "(FLAGS)")
            .await
            .context("FLAGS fetch failed")?
            .try_collect()
            .await
            .context("failed to read FLAGS response")?;

        let mut res = Vec::new();
        for fetch in &list {
            if let Some(uid) = fetch.uid {
                res.push((uid, flags_to_string(fetch.flags())));
            }
        }
        res.sort_by_key(|(uid, _)| *uid);
        Ok(res)
    }

    /// Returns all UIDs currently present on the server.
    pub(crate) async fn search_all_uids(&mut self) -> anyhow::Result<Vec<u32>> {
        let uids = self
            .inner
            .uid_search("ALL")
            .await
            .context("UID SEARCH failed")?;
        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }
}

/// Metadata of one fetched message.
#[derive(Debug, Clone, Default)]
pub(crate) struct FetchedMessage {
    pub uid: u32,
    pub internal_date: i64,
    pub size: u32,
    pub flags: String,
    pub from_addr: String,
    pub to_addrs: String,
    pub cc_addrs: String,
    pub bcc_addrs: String,
    pub subject: String,
    pub message_id: String,
    pub in_reply_to: String,
    pub references: String,
}

/// Extracts index metadata from a FETCH response.
///
/// Responses without a UID are useless to the index and dropped.
pub(crate) fn parse_fetch(fetch: &Fetch) -> Option<FetchedMessage> {
    let uid = fetch.uid?;
    let mut msg = FetchedMessage {
        uid,
        internal_date: fetch
            .internal_date()
            .map(|d| d.with_timezone(&Utc).timestamp())
            .unwrap_or_default(),
        size: fetch.size.unwrap_or_default(),
        flags: flags_to_string(fetch.flags()),
        ..Default::default()
    };

    if let Some(envelope) = fetch.envelope() {
        msg.subject = decode_bytes(envelope.subject.as_ref());
        msg.message_id = decode_bytes(envelope.message_id.as_ref());
        msg.in_reply_to = decode_bytes(envelope.in_reply_to.as_ref());
        msg.from_addr = addresses_to_string(envelope.from.as_deref());
        msg.to_addrs = addresses_to_string(envelope.to.as_deref());
        msg.cc_addrs = addresses_to_string(envelope.cc.as_deref());
        msg.bcc_addrs = addresses_to_string(envelope.bcc.as_deref());
    }

    // ENVELOPE has no References; it is prefetched as a header field.
    if let Some(header) = fetch.header() {
        if let Ok((headers, _)) = mailparse::parse_headers(header) {
            use mailparse::MailHeaderMap;
            if let Some(references) = headers.get_first_value("References") {
                msg.references = references.split_whitespace().collect::<Vec<_>>().join(" ");
            }
            if msg.in_reply_to.is_empty() {
                if let Some(irt) = headers.get_first_value("In-Reply-To") {
                    msg.in_reply_to = irt.trim().to_string();
                }
            }
        }
    }

    Some(msg)
}

fn decode_bytes(bytes: Option<&Cow<'_, [u8]>>) -> String {
    bytes
        .map(|b| String::from_utf8_lossy(b).trim().to_string())
        .unwrap_or_default()
}

fn addresses_to_string(addresses: Option<&[async_imap::imap_proto::types::Address]>) -> String {
    let Some(addresses) = addresses else {
        return String::new();
    };
    let mut out = Vec::new();
    for address in addresses {
        let mailbox = decode_bytes(address.mailbox.as_ref());
        let host = decode_bytes(address.host.as_ref());
        if mailbox.is_empty() || host.is_empty() {
            continue;
        }
        out.push(format!("{mailbox}@{host}"));
    }
    out.join(", ")
}

pub(crate) fn flags_to_string<'a>(flags: impl Iterator<Item = Flag<'a>>) -> String {
    let mut out: Vec<String> = flags
        .filter_map(|flag| match flag {
            Flag::Seen => Some("\\Seen".to_string()),
            Flag::Answered => Some("\\Answered".to_string()),
            Flag::Flagged => Some("\\Flagged".to_string()),
            Flag::Deleted => Some("\\Deleted".to_string()),
            Flag::Draft => Some("\\Draft".to_string()),
            // \Recent is session-only and would make flag comparisons flap.
            Flag::Recent => None,
            Flag::MayCreate => None,
            Flag::Custom(name) => Some(name.to_string()),
        })
        .collect();
    out.sort();
    out.join(" ")
}

/// Returns true for errors that indicate a broken TCP/TLS stream rather than
/// a server-side condition; such sessions must not be reused.
pub(crate) fn is_network_error(err: &anyhow::Error) -> bool {
    if let Some(imap_err) = err.downcast_ref::<async_imap::error::Error>() {
        matches!(
            imap_err,
            async_imap::error::Error::Io(_) | async_imap::error::Error::ConnectionLost
        )
    } else {
        err.downcast_ref::<std::io::Error>().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_to_string_is_sorted_and_stable() {
        let flags = vec![Flag::Seen, Flag::Answered, Flag::Recent];
        assert_eq!(
            flags_to_string(flags.into_iter()),
            "\\Answered \\Seen".to_string()
        );
        let flags: Vec<Flag> = vec![];
        assert_eq!(flags_to_string(flags.into_iter()), "");
    }

    #[test]
    fn test_oauth2_authenticator_format() {
        use async_imap::Authenticator;
        let mut auth = OAuth2 {
            user: "alice@example.org".into(),
            access_token: "token123".into(),
        };
        assert_eq!(
            auth.process(b""),
            "user=alice@example.org\x01auth=Bearer token123\x01\x01"
        );
    }
}
