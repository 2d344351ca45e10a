//! Utilities to help writing tests.

use std::time::Duration;

use tempfile::TempDir;

use crate::account::{Account, AccountId, AuthKind, NewAccount, TlsMode};
use crate::config::Config;
use crate::context::Context;
use crate::events::{EventEmitter, EventType};

/// A [`Context`] backed by a throwaway database in a temporary directory.
pub(crate) struct TestContext {
    pub ctx: Context,

    /// Cleaned up when the `TestContext` is dropped.
    #[allow(dead_code)]
    pub dir: TempDir,

    events: EventEmitter,
}

impl TestContext {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.db_path = dir.path().join("test.db");
        config.worker_id = "test-worker".to_string();
        config.poll_interval = Duration::from_millis(100);
        let ctx = Context::new(config).await.unwrap();
        let events = ctx.get_event_emitter();
        Self { ctx, dir, events }
    }

    /// Registers an account pointing at an unreachable local server, so any
    /// accidental connect attempt fails fast instead of going to the net.
    pub async fn add_account(&self, user: &str) -> AccountId {
        Account::create(
            &self.ctx,
            &NewAccount {
                grant_id: format!("grant-{user}"),
                app_id: "app".to_string(),
                imap_host: "127.0.0.1".to_string(),
                imap_port: 1,
                tls_mode: TlsMode::Tls,
                auth_kind: AuthKind::Password,
                login_user: user.to_string(),
                secret: "secret".to_string(),
            },
        )
        .await
        .unwrap()
    }

    /// Waits for the next event matching the predicate.
    pub async fn wait_for_event(&self, matcher: impl Fn(&EventType) -> bool) -> EventType {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let event = self.events.recv().await.expect("event channel closed");
                if matcher(&event.typ) {
                    return event.typ;
                }
            }
        })
        .await
        .expect("timeout waiting for event")
    }
}
