//! TCP and TLS plumbing for IMAP connections.

use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Timeout applied to the TCP connect itself; command timeouts are applied
/// by the callers per dialogue.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) async fn connect_tcp(host: &str, port: u16) -> Result<TcpStream> {
    let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .with_context(|| format!("connect to {host}:{port} timed out"))?
        .with_context(|| format!("failed to connect to {host}:{port}"))?;
    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Builds a TLS connector.
///
/// With `strict_tls` disabled, invalid certificates and hostnames are
/// accepted; some self-hosted servers still ship them.
pub(crate) fn build_tls(strict_tls: bool) -> async_native_tls::TlsConnector {
    let tls_builder = async_native_tls::TlsConnector::new();
    if strict_tls {
        tls_builder
    } else {
        tls_builder
            .danger_accept_invalid_hostnames(true)
            .danger_accept_invalid_certs(true)
    }
}
