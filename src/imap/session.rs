use std::ops::{Deref, DerefMut};

use async_imap::types::Mailbox;
use async_imap::Session as ImapSession;
use async_native_tls::TlsStream;
use tokio::net::TcpStream;

use super::capabilities::Capabilities;

/// An authenticated IMAP session belonging to one account.
///
/// Commands are serialized on the session: the wrapper is `&mut self`
/// throughout and a folder sync unit never shares it.
#[derive(Debug)]
pub(crate) struct Session {
    pub(crate) inner: ImapSession<Box<dyn SessionStream>>,

    pub capabilities: Capabilities,

    /// Selected folder name.
    pub selected_folder: Option<String>,

    /// Mailbox structure returned by the IMAP server for the selection.
    pub selected_mailbox: Option<Mailbox>,
}

pub(crate) trait SessionStream:
    tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + Sync + std::fmt::Debug
{
}

impl SessionStream for TlsStream<Box<dyn SessionStream>> {}
impl SessionStream for TlsStream<TcpStream> {}
impl SessionStream for TcpStream {}

impl Deref for Session {
    type Target = ImapSession<Box<dyn SessionStream>>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for Session {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl Session {
    pub(crate) fn new(
        inner: ImapSession<Box<dyn SessionStream>>,
        capabilities: Capabilities,
    ) -> Self {
        Self {
            inner,
            capabilities,
            selected_folder: None,
            selected_mailbox: None,
        }
    }

    pub fn can_idle(&self) -> bool {
        self.capabilities.can_idle
    }

    pub fn can_condstore(&self) -> bool {
        self.capabilities.can_condstore
    }

    pub fn can_move(&self) -> bool {
        self.capabilities.can_move
    }

    pub fn can_uidplus(&self) -> bool {
        self.capabilities.can_uidplus
    }

    /// Logs out, consuming the session. Errors are ignored; the connection
    /// is gone either way.
    pub(crate) async fn logout(mut self) {
        self.inner.logout().await.ok();
    }
}
