use std::ops::{Deref, DerefMut};

use anyhow::{Context as _, Result};
use async_imap::Client as ImapClient;

use super::session::SessionStream;
use crate::net::{build_tls, connect_tcp};

/// A connected but not yet authenticated IMAP client.
#[derive(Debug)]
pub(crate) struct Client {
    is_secure: bool,
    inner: ImapClient<Box<dyn SessionStream>>,
}

impl Deref for Client {
    type Target = ImapClient<Box<dyn SessionStream>>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for Client {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl Client {
    pub async fn connect_secure(host: &str, port: u16, strict_tls: bool) -> Result<Self> {
        let stream = connect_tcp(host, port).await?;
        let tls = build_tls(strict_tls);
        let tls_stream: Box<dyn SessionStream> = Box::new(
            tls.connect(host, stream)
                .await
                .context("TLS handshake failed")?,
        );
        let mut client = ImapClient::new(tls_stream);

        let _greeting = client
            .read_response()
            .await
            .context("failed to read greeting")?
            .context("invalid greeting")?;

        Ok(Client {
            is_secure: true,
            inner: client,
        })
    }

    pub async fn connect_insecure(host: &str, port: u16) -> Result<Self> {
        let stream: Box<dyn SessionStream> = Box::new(connect_tcp(host, port).await?);

        let mut client = ImapClient::new(stream);
        let _greeting = client
            .read_response()
            .await
            .context("failed to read greeting")?
            .context("invalid greeting")?;

        Ok(Client {
            is_secure: false,
            inner: client,
        })
    }

    /// Upgrades a plaintext connection via STARTTLS.
    pub async fn secure(self, domain: &str, strict_tls: bool) -> Result<Client> {
        if self.is_secure {
            return Ok(self);
        }
        let Client { mut inner, .. } = self;
        let tls = build_tls(strict_tls);
        inner
            .run_command_and_check_ok("STARTTLS", None)
            .await
            .context("STARTTLS failed")?;

        let stream = inner.into_inner();
        let ssl_stream = tls
            .connect(domain, stream)
            .await
            .context("STARTTLS TLS handshake failed")?;
        let boxed: Box<dyn SessionStream> = Box::new(ssl_stream);

        Ok(Client {
            is_secure: true,
            inner: ImapClient::new(boxed),
        })
    }

    pub(crate) fn into_inner(self) -> ImapClient<Box<dyn SessionStream>> {
        self.inner
    }
}
