//! # HTTP module.

use std::time::Duration;

use anyhow::Result;

pub(crate) fn get_client(timeout: Duration) -> Result<reqwest::Client> {
    // Disable usage of "system" proxy configured via environment variables;
    // webhook targets are reached directly.
    let builder = reqwest::ClientBuilder::new().timeout(timeout).no_proxy();
    Ok(builder.build()?)
}
