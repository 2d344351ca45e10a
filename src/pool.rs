//! IMAP connection pool.
//!
//! Sessions are keyed by account. Commercial IMAP servers cap simultaneous
//! sessions per user, so the per-account capacity defaults low and folder
//! sync units multiplex over it: a borrower waits (FIFO) for a per-account
//! slot, reuses an idle session if a live one exists, or opens a new one
//! subject to the per-host gates.
//!
//! Per-host gates implement two bounds: maximum concurrent sessions (a
//! semaphore held for the session lifetime) and maximum new-connection rate
//! (a token bucket consulted before every dial). A server that answers
//! "too many connections" puts the whole host into a cool-down.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::account::{Account, AccountId};
use crate::config::Config;
use crate::context::Context;
use crate::imap::{self, Imap, Session};
use crate::ratelimit::Ratelimit;
use crate::tools::{time, time_elapsed, Time};

/// How long a host is cooled down after a "too many connections" response.
const HOST_COOLDOWN: Duration = Duration::from_secs(60);

/// How long one borrower waits for a free per-host slot before giving up.
const HOST_WAIT_DEADLINE: Duration = Duration::from_secs(120);

#[derive(Debug)]
pub(crate) struct ConnectionPool {
    sessions_per_account: usize,
    sessions_per_host: usize,
    session_ttl: Duration,
    connects_per_minute: f64,
    inner: Mutex<PoolInner>,
}

#[derive(Debug, Default)]
struct PoolInner {
    idle: HashMap<AccountId, Vec<IdleSession>>,
    account_gates: HashMap<AccountId, Arc<Semaphore>>,
    host_gates: HashMap<String, Arc<Semaphore>>,
    host_rates: HashMap<String, Ratelimit>,
    host_cooldown_until: HashMap<String, i64>,
}

#[derive(Debug)]
struct IdleSession {
    session: Session,
    host_permit: OwnedSemaphorePermit,
    opened_at: Time,
    last_used: Time,
}

/// The pool bookkeeping for one borrowed session: dropping the lease frees
/// the per-account and per-host slots.
#[derive(Debug)]
pub(crate) struct SessionLease {
    account_id: AccountId,
    opened_at: Time,
    host_permit: OwnedSemaphorePermit,
    _account_permit: OwnedSemaphorePermit,
}

impl ConnectionPool {
    pub fn new(config: &Config) -> Self {
        Self {
            sessions_per_account: config.sessions_per_account.max(1),
            sessions_per_host: config.sessions_per_host.max(1),
            session_ttl: config.session_ttl,
            connects_per_minute: config.connects_per_minute_per_host,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    /// Borrows a session for the account.
    ///
    /// Blocks until a per-account slot frees up; returns `None` if `cancel`
    /// fires while waiting.
    pub(crate) async fn borrow(
        &self,
        context: &Context,
        account: &Account,
        cancel: &CancellationToken,
    ) -> Result<Option<(Session, SessionLease)>> {
        let account_gate = {
            let mut inner = self.inner.lock().await;
            inner
                .account_gates
                .entry(account.id)
                .or_insert_with(|| Arc::new(Semaphore::new(self.sessions_per_account)))
                .clone()
        };

        let account_permit = tokio::select! {
            permit = account_gate.acquire_owned() => {
                permit.context("account gate closed")?
            }
            _ = cancel.cancelled() => return Ok(None),
        };

        // Prefer reusing an idle session; probe it before handing it out.
        while let Some(idle) = self.pop_idle(account.id).await {
            if time_elapsed(&idle.opened_at) > self.session_ttl {
                info!(context, "{}: discarding session past TTL", account.id);
                idle.session.logout().await;
                continue;
            }
            let IdleSession {
                mut session,
                host_permit,
                opened_at,
                ..
            } = idle;
            if !session.noop_alive().await {
                info!(context, "{}: discarding dead pooled session", account.id);
                drop(session);
                drop(host_permit);
                continue;
            }
            let lease = SessionLease {
                account_id: account.id,
                opened_at,
                host_permit,
                _account_permit: account_permit,
            };
            return Ok(Some((session, lease)));
        }

        // Nothing reusable: open a new session, subject to the host gates.
        let imap = Imap::from_account(account);
        let host_permit = tokio::select! {
            permit = self.acquire_host_slot(&imap) => permit?,
            _ = cancel.cancelled() => return Ok(None),
        };

        let session = match imap.connect(context).await {
            Ok(session) => session,
            Err(imap::Error::TooManyConnections(host)) => {
                self.start_cooldown(&host).await;
                warn!(
                    context,
                    "{}: host {} refuses more sessions, cooling down",
                    account.id,
                    host
                );
                return Err(imap::Error::TooManyConnections(host).into());
            }
            Err(err) => return Err(err.into()),
        };

        let lease = SessionLease {
            account_id: account.id,
            opened_at: Time::now(),
            host_permit,
            _account_permit: account_permit,
        };
        Ok(Some((session, lease)))
    }

    /// Returns a healthy session to the pool.
    ///
    /// A session past its TTL or failing a NOOP probe is closed instead of
    /// being handed back out.
    pub(crate) async fn recycle(&self, context: &Context, mut session: Session, lease: SessionLease) {
        if time_elapsed(&lease.opened_at) > self.session_ttl {
            info!(context, "{}: closing session past TTL", lease.account_id);
            session.logout().await;
            return;
        }
        if !session.noop_alive().await {
            info!(
                context,
                "{}: returned session failed liveness probe",
                lease.account_id
            );
            return;
        }
        let SessionLease {
            account_id,
            opened_at,
            host_permit,
            ..
        } = lease;
        let mut inner = self.inner.lock().await;
        inner.idle.entry(account_id).or_default().push(IdleSession {
            session,
            host_permit,
            opened_at,
            last_used: Time::now(),
        });
    }

    /// Closes a broken session. It is never handed back out.
    pub(crate) async fn discard(&self, session: Session, lease: SessionLease) {
        session.logout().await;
        drop(lease);
    }

    /// Logs out all idle sessions, e.g. on shutdown.
    pub(crate) async fn drain(&self, context: &Context) {
        let all: Vec<IdleSession> = {
            let mut inner = self.inner.lock().await;
            inner.idle.drain().flat_map(|(_, v)| v).collect()
        };
        let count = all.len();
        for idle in all {
            idle.session.logout().await;
        }
        if count > 0 {
            info!(context, "closed {} pooled sessions", count);
        }
    }

    /// Drops all idle sessions of one account; used when the account is
    /// quiesced.
    pub(crate) async fn drop_account(&self, account_id: AccountId) {
        let mut inner = self.inner.lock().await;
        inner.idle.remove(&account_id);
        inner.account_gates.remove(&account_id);
    }

    async fn pop_idle(&self, account_id: AccountId) -> Option<IdleSession> {
        let mut inner = self.inner.lock().await;
        let list = inner.idle.get_mut(&account_id)?;
        // Most recently used first: its server-side state is freshest.
        list.sort_by_key(|s| s.last_used);
        list.pop()
    }

    /// Waits for a per-host slot and a new-connection token.
    async fn acquire_host_slot(&self, imap: &Imap) -> Result<OwnedSemaphorePermit> {
        let host = imap.host().to_string();
        let gate = {
            let mut inner = self.inner.lock().await;
            inner
                .host_gates
                .entry(host.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(self.sessions_per_host)))
                .clone()
        };

        let permit = tokio::time::timeout(HOST_WAIT_DEADLINE, gate.acquire_owned())
            .await
            .with_context(|| format!("timed out waiting for a session slot on {host}"))?
            .context("host gate closed")?;

        loop {
            let wait = {
                let mut inner = self.inner.lock().await;
                let cooldown = inner
                    .host_cooldown_until
                    .get(&host)
                    .copied()
                    .unwrap_or(0)
                    .saturating_sub(time());
                if cooldown > 0 {
                    Duration::from_secs(cooldown as u64)
                } else {
                    let rate = inner.host_rates.entry(host.clone()).or_insert_with(|| {
                        Ratelimit::new(Duration::from_secs(60), self.connects_per_minute)
                    });
                    let wait = rate.until_can_send();
                    if wait.is_zero() {
                        rate.send();
                    }
                    wait
                }
            };
            if wait.is_zero() {
                return Ok(permit);
            }
            tokio::time::sleep(wait).await;
        }
    }

    async fn start_cooldown(&self, host: &str) {
        let mut inner = self.inner.lock().await;
        inner
            .host_cooldown_until
            .insert(host.to_string(), time() + HOST_COOLDOWN.as_secs() as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{AccountState, AuthKind, TlsMode};
    use crate::test_utils::TestContext;

    fn unreachable_account(id: AccountId) -> Account {
        Account {
            id,
            grant_id: "g".into(),
            app_id: "app".into(),
            imap_host: "127.0.0.1".into(),
            // Reserved port, nothing listens there.
            imap_port: 1,
            tls_mode: TlsMode::Plain,
            auth_kind: AuthKind::Password,
            login_user: "u".into(),
            state: AccountState::Active,
            last_sync_at: None,
            last_error: None,
            assigned_worker: None,
            generation: 0,
            backfill_horizon: None,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_borrow_cancelled_before_connect() {
        let t = TestContext::new().await;
        let id = t.add_account("alice").await;
        let account = unreachable_account(id);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let res = t.ctx.pool.borrow(&t.ctx, &account, &cancel).await.unwrap();
        assert!(res.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_borrow_fails_fast_on_unreachable_host() {
        let t = TestContext::new().await;
        let id = t.add_account("alice").await;
        let account = unreachable_account(id);

        let cancel = CancellationToken::new();
        let res = t.ctx.pool.borrow(&t.ctx, &account, &cancel).await;
        assert!(res.is_err());

        // The account and host slots were released; a second attempt still
        // reaches the connect stage instead of deadlocking on a leaked gate.
        let res = t.ctx.pool.borrow(&t.ctx, &account, &cancel).await;
        assert!(res.is_err());
    }
}
