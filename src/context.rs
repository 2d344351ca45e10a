//! Context module.
//!
//! The [`Context`] is the explicit handle to everything shared inside one
//! worker process: the database, the configuration, the event channel, the
//! IMAP connection pool and the credential provider. It is cheap to clone and
//! passed through construction; there are no global singletons.

use std::ops::Deref;
use std::sync::Arc;

use anyhow::Result;

use crate::account::{CredentialProvider, SqlCredentialProvider};
use crate::config::Config;
use crate::events::{Event, EventEmitter, Events, EventType};
use crate::pool::ConnectionPool;
use crate::sql::Sql;

/// The context for one worker process.
#[derive(Debug, Clone)]
pub struct Context {
    pub(crate) inner: Arc<InnerContext>,
}

impl Deref for Context {
    type Target = InnerContext;

    fn deref(&self) -> &InnerContext {
        &self.inner
    }
}

#[derive(Debug)]
pub struct InnerContext {
    /// Database handle.
    pub(crate) sql: Sql,

    /// Engine configuration.
    pub(crate) config: Config,

    /// Events channel.
    pub(crate) events: Events,

    /// Source of account credentials, opaque to the sync engine.
    pub(crate) credentials: Arc<dyn CredentialProvider>,

    /// IMAP connection pool shared by all supervisors of this process.
    pub(crate) pool: ConnectionPool,

    /// HTTP client used for webhook deliveries.
    pub(crate) http: reqwest::Client,
}

impl Context {
    /// Creates a new context with the default database-backed credential
    /// provider and opens the database.
    pub async fn new(config: Config) -> Result<Self> {
        Self::with_credential_provider(config, Arc::new(SqlCredentialProvider)).await
    }

    /// Creates a new context with a custom credential provider.
    pub async fn with_credential_provider(
        config: Config,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self> {
        let sql = Sql::new(config.db_path.clone());
        let pool = ConnectionPool::new(&config);
        let http = crate::http::get_client(config.webhook_timeout)?;

        let ctx = Context {
            inner: Arc::new(InnerContext {
                sql,
                config,
                events: Events::new(),
                credentials,
                pool,
                http,
            }),
        };
        ctx.sql.open().await?;
        Ok(ctx)
    }

    /// Emits a single event.
    pub fn emit_event(&self, event: EventType) {
        self.events.emit(Event { typ: event });
    }

    /// Returns a receiver for events as they occur.
    pub fn get_event_emitter(&self) -> EventEmitter {
        self.events.get_emitter()
    }

    /// Returns the engine configuration.
    pub fn get_config(&self) -> &Config {
        &self.config
    }

    /// Closes the context database.
    pub async fn stop(&self) {
        self.pool.drain(self).await;
        self.sql.close().await;
    }
}
