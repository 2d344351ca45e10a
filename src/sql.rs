//! # SQLite wrapper.
//!
//! All durable state of the engine lives in one SQLite database shared by the
//! worker processes of a machine. Writers rely on SQLite's single-writer lock;
//! the busy timeout below absorbs short write contention between workers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result};
use rusqlite::{Connection, OpenFlags, TransactionBehavior};
use tokio::sync::RwLock;

/// A wrapper around the underlying SQLite connection pool.
#[derive(Debug)]
pub struct Sql {
    /// Database file path.
    pub(crate) dbfile: PathBuf,

    pool: RwLock<Option<r2d2::Pool<r2d2_sqlite::SqliteConnectionManager>>>,
}

impl Sql {
    pub fn new(dbfile: PathBuf) -> Sql {
        Self {
            dbfile,
            pool: Default::default(),
        }
    }

    /// Checks if there is currently a connection to the underlying database.
    pub async fn is_open(&self) -> bool {
        self.pool.read().await.is_some()
    }

    /// Opens the database, creating the schema if necessary.
    pub async fn open(&self) -> Result<()> {
        let mut lock = self.pool.write().await;
        if lock.is_some() {
            anyhow::bail!("database is already opened");
        }

        let pool = new_pool(&self.dbfile).context("failed to build connection pool")?;
        {
            let mut conn = pool.get()?;
            migrate(&mut conn).context("failed to migrate database schema")?;
        }
        *lock = Some(pool);
        Ok(())
    }

    /// Closes all underlying connections.
    pub async fn close(&self) {
        let _ = self.pool.write().await.take();
        // drop closes the connections
    }

    /// Runs `function` with a connection from the pool.
    ///
    /// The closure runs on the current thread via `block_in_place`, so calls
    /// stay cheap for the common short statement while not starving the
    /// executor during longer transactions.
    pub async fn call<T, F>(&self, function: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send,
        T: Send,
    {
        let lock = self.pool.read().await;
        let pool = lock.as_ref().context("database is not opened")?.clone();
        drop(lock);

        tokio::task::block_in_place(move || {
            let mut conn = pool.get().context("failed to get db connection")?;
            function(&mut conn)
        })
    }

    /// Executes a statement, returning the number of affected rows.
    pub async fn execute(
        &self,
        query: &str,
        params: impl rusqlite::Params + Send,
    ) -> Result<usize> {
        self.call(move |conn| {
            let count = conn.execute(query, params)?;
            Ok(count)
        })
        .await
    }

    /// Executes a statement, returning the row id of the last insert.
    pub async fn insert(&self, query: &str, params: impl rusqlite::Params + Send) -> Result<i64> {
        self.call(move |conn| {
            conn.execute(query, params)?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Queries a single row, mapping it with `f`.
    pub async fn query_row<T, F>(
        &self,
        query: &str,
        params: impl rusqlite::Params + Send,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(&rusqlite::Row) -> rusqlite::Result<T> + Send,
        T: Send,
    {
        self.call(move |conn| {
            let res = conn.query_row(query, params, f)?;
            Ok(res)
        })
        .await
    }

    /// Queries a single row, returning `None` if it does not exist.
    pub async fn query_row_optional<T, F>(
        &self,
        query: &str,
        params: impl rusqlite::Params + Send,
        f: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce(&rusqlite::Row) -> rusqlite::Result<T> + Send,
        T: Send,
    {
        use rusqlite::OptionalExtension;
        self.call(move |conn| {
            let res = conn.query_row(query, params, f).optional()?;
            Ok(res)
        })
        .await
    }

    /// Queries a single value of the first row.
    pub async fn query_get_value<T>(
        &self,
        query: &str,
        params: impl rusqlite::Params + Send,
    ) -> Result<Option<T>>
    where
        T: rusqlite::types::FromSql + Send,
    {
        self.query_row_optional(query, params, |row| row.get::<_, T>(0))
            .await
    }

    /// Returns true if a query returns at least one row.
    pub async fn exists(&self, query: &str, params: impl rusqlite::Params + Send) -> Result<bool> {
        let count: i64 = self
            .query_row(query, params, |row| row.get(0))
            .await
            .with_context(|| format!("exists: query failed: {query}"))?;
        Ok(count > 0)
    }

    /// Queries all rows, mapping each with `f`.
    pub async fn query_map<T, F>(
        &self,
        query: &str,
        params: impl rusqlite::Params + Send,
        f: F,
    ) -> Result<Vec<T>>
    where
        F: FnMut(&rusqlite::Row) -> rusqlite::Result<T> + Send,
        T: Send,
    {
        self.call(move |conn| {
            let mut stmt = conn.prepare(query)?;
            let rows = stmt.query_map(params, f)?;
            let mut res = Vec::new();
            for row in rows {
                res.push(row?);
            }
            Ok(res)
        })
        .await
    }

    /// Runs `function` inside an immediate transaction, retrying a bounded
    /// number of times on busy/locked errors.
    pub async fn transaction<T, F>(&self, function: F) -> Result<T>
    where
        F: FnOnce(&mut rusqlite::Transaction) -> Result<T> + Send + Clone,
        T: Send,
    {
        const RETRIES: usize = 3;
        for attempt in 0.. {
            let f = function.clone();
            let res = self
                .call(move |conn| {
                    let mut tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                    let res = f(&mut tx)?;
                    tx.commit()?;
                    Ok(res)
                })
                .await;
            match res {
                Ok(res) => return Ok(res),
                Err(err) if attempt < RETRIES && is_busy(&err) => {
                    tokio::time::sleep(Duration::from_millis(100 * (attempt as u64 + 1))).await;
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        unreachable!()
    }
}

fn is_busy(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<rusqlite::Error>() {
        Some(rusqlite::Error::SqliteFailure(e, _)) => {
            matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
        }
        _ => false,
    }
}

fn new_pool(dbfile: &Path) -> Result<r2d2::Pool<r2d2_sqlite::SqliteConnectionManager>> {
    let mut open_flags = OpenFlags::SQLITE_OPEN_NO_MUTEX;
    open_flags.insert(OpenFlags::SQLITE_OPEN_READ_WRITE);
    open_flags.insert(OpenFlags::SQLITE_OPEN_CREATE);

    let mgr = r2d2_sqlite::SqliteConnectionManager::file(dbfile)
        .with_flags(open_flags)
        .with_init(|c| {
            c.execute_batch(&format!(
                "PRAGMA journal_mode=WAL;
                 PRAGMA synchronous=NORMAL;
                 PRAGMA foreign_keys=ON;
                 PRAGMA busy_timeout = {};",
                Duration::from_secs(10).as_millis()
            ))?;
            Ok(())
        });

    let pool = r2d2::Pool::builder()
        .min_idle(Some(2))
        .max_size(10)
        .connection_timeout(Duration::from_secs(60))
        .build(mgr)?;
    Ok(pool)
}

/// Creates or upgrades the schema. Versioned with `PRAGMA user_version`.
fn migrate(conn: &mut Connection) -> Result<()> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if version < 1 {
        let tx = conn.transaction()?;
        tx.execute_batch(
            "CREATE TABLE accounts (
               id INTEGER PRIMARY KEY AUTOINCREMENT,
               grant_id TEXT NOT NULL UNIQUE,
               app_id TEXT NOT NULL,
               imap_host TEXT NOT NULL,
               imap_port INTEGER NOT NULL,
               tls_mode TEXT NOT NULL DEFAULT 'tls',
               smtp_host TEXT NOT NULL DEFAULT '',
               smtp_port INTEGER NOT NULL DEFAULT 0,
               auth_kind TEXT NOT NULL DEFAULT 'password',
               login_user TEXT NOT NULL,
               state TEXT NOT NULL DEFAULT 'provisioning',
               last_sync_at INTEGER,
               last_error TEXT,
               assigned_worker TEXT,
               generation INTEGER NOT NULL DEFAULT 0,
               backfill_horizon INTEGER
             );
             CREATE INDEX accounts_worker_index ON accounts (assigned_worker);

             CREATE TABLE credentials (
               account_id INTEGER PRIMARY KEY
                 REFERENCES accounts(id) ON DELETE CASCADE,
               kind TEXT NOT NULL,
               secret TEXT NOT NULL
             );

             CREATE TABLE folders (
               id INTEGER PRIMARY KEY AUTOINCREMENT,
               account_id INTEGER NOT NULL
                 REFERENCES accounts(id) ON DELETE CASCADE,
               name TEXT NOT NULL,
               uidvalidity INTEGER NOT NULL DEFAULT 0,
               uid_next INTEGER NOT NULL DEFAULT 0,
               modseq INTEGER,
               exists_count INTEGER NOT NULL DEFAULT 0,
               backfill_cursor INTEGER NOT NULL DEFAULT 0,
               state TEXT NOT NULL DEFAULT 'new',
               last_poll_at INTEGER,
               last_error TEXT,
               UNIQUE(account_id, name)
             );

             CREATE TABLE messages (
               account_id INTEGER NOT NULL,
               folder_id INTEGER NOT NULL
                 REFERENCES folders(id) ON DELETE CASCADE,
               uid INTEGER NOT NULL,
               internal_date INTEGER NOT NULL DEFAULT 0,
               from_addr TEXT NOT NULL DEFAULT '',
               to_addrs TEXT NOT NULL DEFAULT '',
               cc_addrs TEXT NOT NULL DEFAULT '',
               bcc_addrs TEXT NOT NULL DEFAULT '',
               subject TEXT NOT NULL DEFAULT '',
               message_id TEXT NOT NULL DEFAULT '',
               in_reply_to TEXT NOT NULL DEFAULT '',
               references_hdr TEXT NOT NULL DEFAULT '',
               size INTEGER NOT NULL DEFAULT 0,
               flags TEXT NOT NULL DEFAULT '',
               thread_id TEXT NOT NULL DEFAULT '',
               first_seen_at INTEGER NOT NULL DEFAULT 0,
               PRIMARY KEY(folder_id, uid)
             );
             CREATE INDEX messages_mid_index ON messages (account_id, message_id);

             CREATE TABLE tombstones (
               folder_id INTEGER NOT NULL
                 REFERENCES folders(id) ON DELETE CASCADE,
               uid INTEGER NOT NULL,
               expunged_at INTEGER NOT NULL DEFAULT 0,
               PRIMARY KEY(folder_id, uid)
             );

             CREATE TABLE webhook_subscriptions (
               id INTEGER PRIMARY KEY AUTOINCREMENT,
               app_id TEXT NOT NULL,
               url TEXT NOT NULL,
               secret TEXT NOT NULL,
               triggers TEXT NOT NULL DEFAULT '',
               enabled INTEGER NOT NULL DEFAULT 1
             );

             CREATE TABLE webhook_deliveries (
               id INTEGER PRIMARY KEY AUTOINCREMENT,
               subscription_id INTEGER NOT NULL
                 REFERENCES webhook_subscriptions(id) ON DELETE CASCADE,
               account_id INTEGER NOT NULL,
               trigger_kind TEXT NOT NULL,
               payload TEXT NOT NULL,
               attempts INTEGER NOT NULL DEFAULT 0,
               next_attempt_at INTEGER NOT NULL DEFAULT 0,
               state TEXT NOT NULL DEFAULT 'pending',
               last_status INTEGER,
               last_error TEXT,
               created_at INTEGER NOT NULL DEFAULT 0
             );
             CREATE INDEX deliveries_pending_index
               ON webhook_deliveries (state, next_attempt_at);

             CREATE TABLE worker_leases (
               worker_id TEXT PRIMARY KEY,
               heartbeat_at INTEGER NOT NULL DEFAULT 0,
               generation INTEGER NOT NULL DEFAULT 0,
               holder TEXT
             );

             CREATE TABLE connection_health (
               account_id INTEGER NOT NULL,
               folder TEXT NOT NULL,
               healthy INTEGER NOT NULL DEFAULT 1,
               detail TEXT,
               recorded_at INTEGER NOT NULL DEFAULT 0,
               PRIMARY KEY(account_id, folder)
             );

             PRAGMA user_version=1;",
        )?;
        tx.commit()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::test_utils::TestContext;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_open_and_migrate() {
        let t = TestContext::new().await;
        assert!(t.ctx.sql.is_open().await);

        // Schema is in place.
        let count: i64 = t
            .ctx
            .sql
            .query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))
            .await
            .unwrap();
        assert_eq!(count, 0);

        // Reopening the same file is idempotent with regard to the schema.
        let version: i64 = t
            .ctx
            .sql
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .await
            .unwrap();
        assert_eq!(version, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_transaction_rolls_back_on_error() {
        let t = TestContext::new().await;
        let res = t
            .ctx
            .sql
            .transaction(|tx| -> anyhow::Result<()> {
                tx.execute(
                    "INSERT INTO worker_leases (worker_id, heartbeat_at) VALUES ('w1', 1)",
                    [],
                )?;
                anyhow::bail!("boom");
            })
            .await;
        assert!(res.is_err());

        let exists = t
            .ctx
            .sql
            .exists(
                "SELECT COUNT(*) FROM worker_leases WHERE worker_id='w1'",
                [],
            )
            .await
            .unwrap();
        assert!(!exists);
    }
}
