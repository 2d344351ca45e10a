//! Accounts and credentials.
//!
//! An account is one remote mailbox the engine syncs. Rows are created by the
//! external provisioning layer; the engine only reads server coordinates and
//! drives the lifecycle state. Credentials are opaque to the engine and come
//! from a [`CredentialProvider`].

use std::fmt;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};

use crate::context::Context;
use crate::events::EventType;
use crate::tools::time;

/// Internal account id.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountId(u32);

impl AccountId {
    /// Creates a new [`AccountId`].
    pub const fn new(id: u32) -> AccountId {
        AccountId(id)
    }

    /// Returns the raw id.
    pub const fn to_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "account#{}", self.0)
    }
}

impl ToSql for AccountId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        self.0.to_sql()
    }
}

impl FromSql for AccountId {
    fn column_result(value: ValueRef) -> FromSqlResult<Self> {
        i64::column_result(value).and_then(|val| {
            val.try_into()
                .map(AccountId::new)
                .map_err(|_| FromSqlError::OutOfRange(val))
        })
    }
}

/// Account lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountState {
    /// Created by the provisioning layer, not yet picked up.
    Provisioning,

    /// Synced indefinitely.
    Active,

    /// Login failed; waits for new credentials.
    AuthError,

    /// Quiesced by the tenant.
    Disabled,

    /// Removed; folders are orphaned.
    Deleted,
}

impl AccountState {
    pub fn as_str(self) -> &'static str {
        match self {
            AccountState::Provisioning => "provisioning",
            AccountState::Active => "active",
            AccountState::AuthError => "auth_error",
            AccountState::Disabled => "disabled",
            AccountState::Deleted => "deleted",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "provisioning" => Ok(AccountState::Provisioning),
            "active" => Ok(AccountState::Active),
            "auth_error" => Ok(AccountState::AuthError),
            "disabled" => Ok(AccountState::Disabled),
            "deleted" => Ok(AccountState::Deleted),
            other => Err(anyhow::anyhow!("unknown account state {other:?}")),
        }
    }
}

impl fmt::Display for AccountState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How the IMAP connection is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    /// Implicit TLS on connect.
    Tls,

    /// Plaintext connect upgraded via STARTTLS.
    StartTls,

    /// No transport security. Only sensible for tests and localhost.
    Plain,
}

impl TlsMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TlsMode::Tls => "tls",
            TlsMode::StartTls => "starttls",
            TlsMode::Plain => "plain",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "tls" => Ok(TlsMode::Tls),
            "starttls" => Ok(TlsMode::StartTls),
            "plain" => Ok(TlsMode::Plain),
            other => Err(anyhow::anyhow!("unknown tls mode {other:?}")),
        }
    }
}

/// Kind of secret held for an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    /// Plain LOGIN with a password.
    Password,

    /// XOAUTH2 with an access token.
    OAuth2,
}

impl AuthKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthKind::Password => "password",
            AuthKind::OAuth2 => "oauth2",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "password" => Ok(AuthKind::Password),
            "oauth2" => Ok(AuthKind::OAuth2),
            other => Err(anyhow::anyhow!("unknown auth kind {other:?}")),
        }
    }
}

/// An opaque credential handed to the IMAP login path.
#[derive(Clone)]
pub struct Credentials {
    pub kind: AuthKind,
    pub secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Never log secrets.
        f.debug_struct("Credentials")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Source of account credentials.
///
/// The engine never interprets secrets itself; deployments may resolve them
/// from the database, a vault or a token-refresh service.
#[async_trait]
pub trait CredentialProvider: Send + Sync + fmt::Debug {
    async fn credentials_for(&self, context: &Context, account_id: AccountId)
        -> Result<Credentials>;
}

/// Default provider reading the `credentials` table.
#[derive(Debug)]
pub struct SqlCredentialProvider;

#[async_trait]
impl CredentialProvider for SqlCredentialProvider {
    async fn credentials_for(
        &self,
        context: &Context,
        account_id: AccountId,
    ) -> Result<Credentials> {
        let (kind, secret) = context
            .sql
            .query_row(
                "SELECT kind, secret FROM credentials WHERE account_id=?",
                (account_id,),
                |row| {
                    let kind: String = row.get(0)?;
                    let secret: String = row.get(1)?;
                    Ok((kind, secret))
                },
            )
            .await
            .with_context(|| format!("no credentials for {account_id}"))?;
        Ok(Credentials {
            kind: AuthKind::from_str(&kind)?,
            secret,
        })
    }
}

const ACCOUNT_COLUMNS: &str = "id, grant_id, app_id, imap_host, imap_port, tls_mode, \
                               auth_kind, login_user, state, last_sync_at, last_error, \
                               assigned_worker, generation, backfill_horizon";

/// One synced mailbox.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: AccountId,

    /// Tenant-facing opaque id.
    pub grant_id: String,

    /// Owning tenant application.
    pub app_id: String,

    pub imap_host: String,
    pub imap_port: u16,
    pub tls_mode: TlsMode,
    pub auth_kind: AuthKind,
    pub login_user: String,

    pub state: AccountState,
    pub last_sync_at: Option<i64>,
    pub last_error: Option<String>,

    /// Worker currently owning this account, if any.
    pub assigned_worker: Option<String>,

    /// Assignment generation; bumped by the coordinator on every
    /// reassignment to fence stale supervisors.
    pub generation: i64,

    /// Per-account backfill horizon override.
    pub backfill_horizon: Option<u32>,
}

/// Fields needed to register a new account.
///
/// Used by the provisioning layer (and the tests); the sync engine itself
/// only ever reads accounts.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub grant_id: String,
    pub app_id: String,
    pub imap_host: String,
    pub imap_port: u16,
    pub tls_mode: TlsMode,
    pub auth_kind: AuthKind,
    pub login_user: String,
    pub secret: String,
}

impl Account {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Account> {
        let state: String = row.get(8)?;
        let tls_mode: String = row.get(5)?;
        let auth_kind: String = row.get(6)?;
        Ok(Account {
            id: row.get(0)?,
            grant_id: row.get(1)?,
            app_id: row.get(2)?,
            imap_host: row.get(3)?,
            imap_port: row.get(4)?,
            tls_mode: TlsMode::from_str(&tls_mode)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(e.into()))?,
            auth_kind: AuthKind::from_str(&auth_kind)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(e.into()))?,
            login_user: row.get(7)?,
            state: AccountState::from_str(&state)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(e.into()))?,
            last_sync_at: row.get(9)?,
            last_error: row.get(10)?,
            assigned_worker: row.get(11)?,
            generation: row.get(12)?,
            backfill_horizon: row.get(13)?,
        })
    }

    /// Registers a new account together with its secret.
    pub async fn create(context: &Context, new: &NewAccount) -> Result<AccountId> {
        let new = new.clone();
        let id = context
            .sql
            .transaction(move |tx| {
                tx.execute(
                    "INSERT INTO accounts (grant_id, app_id, imap_host, imap_port, tls_mode, \
                                           auth_kind, login_user, state) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, 'provisioning')",
                    (
                        &new.grant_id,
                        &new.app_id,
                        &new.imap_host,
                        new.imap_port,
                        new.tls_mode.as_str(),
                        new.auth_kind.as_str(),
                        &new.login_user,
                    ),
                )?;
                let id = tx.last_insert_rowid();
                tx.execute(
                    "INSERT INTO credentials (account_id, kind, secret) VALUES (?, ?, ?)",
                    (id, new.auth_kind.as_str(), &new.secret),
                )?;
                Ok(AccountId::new(id.try_into()?))
            })
            .await?;
        Ok(id)
    }

    /// Loads an account by id.
    pub async fn load(context: &Context, id: AccountId) -> Result<Account> {
        context
            .sql
            .query_row(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id=?"),
                (id,),
                Account::from_row,
            )
            .await
            .with_context(|| format!("failed to load {id}"))
    }

    /// Loads all active accounts assigned to the given worker.
    pub async fn load_assigned(context: &Context, worker_id: &str) -> Result<Vec<Account>> {
        context
            .sql
            .query_map(
                &format!(
                    "SELECT {ACCOUNT_COLUMNS} FROM accounts \
                     WHERE assigned_worker=? AND state IN ('provisioning', 'active') \
                     ORDER BY id"
                ),
                (worker_id,),
                Account::from_row,
            )
            .await
    }

    /// Moves the account to a new lifecycle state.
    pub async fn set_state(context: &Context, id: AccountId, state: AccountState) -> Result<()> {
        context
            .sql
            .execute(
                "UPDATE accounts SET state=? WHERE id=?",
                (state.as_str(), id),
            )
            .await?;
        context.emit_event(EventType::AccountStateChanged {
            account_id: id,
            state,
        });
        Ok(())
    }

    /// Records the last error observed for the account.
    pub async fn set_error(context: &Context, id: AccountId, error: &str) -> Result<()> {
        context
            .sql
            .execute("UPDATE accounts SET last_error=? WHERE id=?", (error, id))
            .await?;
        Ok(())
    }

    /// Records a successful sync pass.
    pub async fn record_sync(context: &Context, id: AccountId) -> Result<()> {
        context
            .sql
            .execute(
                "UPDATE accounts SET last_sync_at=?, last_error=NULL WHERE id=?",
                (time(), id),
            )
            .await?;
        Ok(())
    }

    /// Returns the current assignment generation of the account.
    pub async fn current_generation(context: &Context, id: AccountId) -> Result<i64> {
        context
            .sql
            .query_row(
                "SELECT generation FROM accounts WHERE id=?",
                (id,),
                |row| row.get(0),
            )
            .await
            .with_context(|| format!("failed to read generation of {id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestContext;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_create_and_load() {
        let t = TestContext::new().await;
        let id = t.add_account("alice").await;

        let account = Account::load(&t.ctx, id).await.unwrap();
        assert_eq!(account.state, AccountState::Provisioning);
        assert_eq!(account.login_user, "alice");
        assert_eq!(account.tls_mode, TlsMode::Tls);
        assert!(account.assigned_worker.is_none());
        assert_eq!(account.generation, 0);

        let creds = t.ctx.credentials.credentials_for(&t.ctx, id).await.unwrap();
        assert_eq!(creds.kind, AuthKind::Password);
        assert_eq!(creds.secret, "secret");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_state_transition_emits_event() {
        let t = TestContext::new().await;
        let id = t.add_account("bob").await;

        Account::set_state(&t.ctx, id, AccountState::Active)
            .await
            .unwrap();
        let account = Account::load(&t.ctx, id).await.unwrap();
        assert_eq!(account.state, AccountState::Active);

        let event = t
            .wait_for_event(|e| {
                matches!(
                    e,
                    EventType::AccountStateChanged {
                        state: AccountState::Active,
                        ..
                    }
                )
            })
            .await;
        assert!(matches!(
            event,
            EventType::AccountStateChanged { account_id, .. } if account_id == id
        ));
    }

    #[test]
    fn test_credentials_debug_hides_secret() {
        let creds = Credentials {
            kind: AuthKind::Password,
            secret: "hunter2".to_string(),
        };
        let s = format!("{creds:?}");
        assert!(!s.contains("hunter2"));
    }
}
