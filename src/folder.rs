//! Folder rows and sync-state persistence.
//!
//! One row per (account, server folder name). The remote coordinates
//! (UIDVALIDITY, UIDNEXT, HIGHESTMODSEQ, EXISTS) reflect the last successful
//! server dialogue; the sync state drives the folder state machine.

use std::fmt;

use anyhow::{Context as _, Result};

use crate::account::AccountId;
use crate::context::Context;
use crate::events::EventType;
use crate::tools::time;

/// Sync state of one folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderSyncState {
    /// Never selected.
    New,

    /// Initial enumeration in progress.
    Backfilling,

    /// Caught up; incremental deltas and IDLE.
    Live,

    /// Repeated protocol failures; reset to `New` on next attempt.
    Failed,

    /// The folder disappeared from the server or the account was quiesced.
    Orphaned,
}

impl FolderSyncState {
    pub fn as_str(self) -> &'static str {
        match self {
            FolderSyncState::New => "new",
            FolderSyncState::Backfilling => "backfilling",
            FolderSyncState::Live => "live",
            FolderSyncState::Failed => "failed",
            FolderSyncState::Orphaned => "orphaned",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "new" => Ok(FolderSyncState::New),
            "backfilling" => Ok(FolderSyncState::Backfilling),
            "live" => Ok(FolderSyncState::Live),
            "failed" => Ok(FolderSyncState::Failed),
            "orphaned" => Ok(FolderSyncState::Orphaned),
            other => Err(anyhow::anyhow!("unknown folder state {other:?}")),
        }
    }
}

impl fmt::Display for FolderSyncState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

const FOLDER_COLUMNS: &str = "id, account_id, name, uidvalidity, uid_next, modseq, \
                              exists_count, backfill_cursor, state, last_poll_at, last_error";

/// One tracked folder.
#[derive(Debug, Clone)]
pub struct Folder {
    pub id: i64,
    pub account_id: AccountId,
    pub name: String,

    /// Server-reported UIDVALIDITY; 0 until the first SELECT.
    pub uidvalidity: u32,

    /// Server-reported UIDNEXT as of the last dialogue; 0 until known.
    pub uid_next: u32,

    /// CONDSTORE HIGHESTMODSEQ, absent if the server lacks the extension.
    pub modseq: Option<u64>,

    /// Last observed EXISTS count.
    pub exists_count: u32,

    /// Lowest UID already covered by backfill; 0 if backfill has not
    /// fetched anything yet. Makes backfill resumable.
    pub backfill_cursor: u32,

    pub state: FolderSyncState,
    pub last_poll_at: Option<i64>,
    pub last_error: Option<String>,
}

impl Folder {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Folder> {
        let state: String = row.get(8)?;
        Ok(Folder {
            id: row.get(0)?,
            account_id: row.get(1)?,
            name: row.get(2)?,
            uidvalidity: row.get(3)?,
            uid_next: row.get(4)?,
            modseq: row.get(5)?,
            exists_count: row.get(6)?,
            backfill_cursor: row.get(7)?,
            state: FolderSyncState::from_str(&state)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(e.into()))?,
            last_poll_at: row.get(9)?,
            last_error: row.get(10)?,
        })
    }

    /// Loads a folder row, creating it in state `new` if it does not exist.
    pub async fn load_or_create(
        context: &Context,
        account_id: AccountId,
        name: &str,
    ) -> Result<Folder> {
        context
            .sql
            .execute(
                "INSERT OR IGNORE INTO folders (account_id, name) VALUES (?, ?)",
                (account_id, name),
            )
            .await?;
        Self::load(context, account_id, name)
            .await?
            .with_context(|| format!("folder {name:?} vanished after upsert"))
    }

    /// Loads a folder row.
    pub async fn load(
        context: &Context,
        account_id: AccountId,
        name: &str,
    ) -> Result<Option<Folder>> {
        context
            .sql
            .query_row_optional(
                &format!("SELECT {FOLDER_COLUMNS} FROM folders WHERE account_id=? AND name=?"),
                (account_id, name),
                Folder::from_row,
            )
            .await
    }

    /// Loads all folder rows of an account.
    pub async fn load_all(context: &Context, account_id: AccountId) -> Result<Vec<Folder>> {
        context
            .sql
            .query_map(
                &format!(
                    "SELECT {FOLDER_COLUMNS} FROM folders WHERE account_id=? ORDER BY name"
                ),
                (account_id,),
                Folder::from_row,
            )
            .await
    }

    /// Persists the remote coordinates observed in a SELECT response.
    pub async fn record_select(
        &mut self,
        context: &Context,
        uidvalidity: u32,
        uid_next: u32,
        exists: u32,
        modseq: Option<u64>,
    ) -> Result<()> {
        context
            .sql
            .execute(
                "UPDATE folders SET uidvalidity=?, uid_next=?, exists_count=?, modseq=?, \
                 last_poll_at=? WHERE id=?",
                (uidvalidity, uid_next, exists, modseq, time(), self.id),
            )
            .await?;
        self.uidvalidity = uidvalidity;
        self.uid_next = uid_next;
        self.exists_count = exists;
        self.modseq = modseq;
        Ok(())
    }

    /// Persists a new sync state and emits [`EventType::FolderStateChanged`].
    pub async fn set_state(&mut self, context: &Context, state: FolderSyncState) -> Result<()> {
        if self.state == state {
            return Ok(());
        }
        context
            .sql
            .execute(
                "UPDATE folders SET state=? WHERE id=?",
                (state.as_str(), self.id),
            )
            .await?;
        self.state = state;
        context.emit_event(EventType::FolderStateChanged {
            account_id: self.account_id,
            folder: self.name.clone(),
            state,
        });
        Ok(())
    }

    /// Persists the backfill cursor after a committed batch.
    pub async fn set_backfill_cursor(&mut self, context: &Context, cursor: u32) -> Result<()> {
        context
            .sql
            .execute(
                "UPDATE folders SET backfill_cursor=? WHERE id=?",
                (cursor, self.id),
            )
            .await?;
        self.backfill_cursor = cursor;
        Ok(())
    }

    /// Advances the persisted UIDNEXT.
    pub async fn set_uid_next(&mut self, context: &Context, uid_next: u32) -> Result<()> {
        context
            .sql
            .execute(
                "UPDATE folders SET uid_next=? WHERE id=?",
                (uid_next, self.id),
            )
            .await?;
        self.uid_next = uid_next;
        Ok(())
    }

    /// Advances the persisted HIGHESTMODSEQ.
    pub async fn set_modseq(&mut self, context: &Context, modseq: u64) -> Result<()> {
        context
            .sql
            .execute("UPDATE folders SET modseq=? WHERE id=?", (modseq, self.id))
            .await?;
        self.modseq = Some(modseq);
        Ok(())
    }

    /// Records the last error observed on this folder.
    pub async fn set_error(&mut self, context: &Context, error: &str) -> Result<()> {
        context
            .sql
            .execute(
                "UPDATE folders SET last_error=? WHERE id=?",
                (error, self.id),
            )
            .await?;
        self.last_error = Some(error.to_string());
        Ok(())
    }

    /// Purges all local state for the folder after a UIDVALIDITY change.
    ///
    /// Removes index entries and tombstones and resets the row to state
    /// `new`. No per-message events are emitted for the purge.
    pub async fn purge(&mut self, context: &Context) -> Result<()> {
        let folder_id = self.id;
        context
            .sql
            .transaction(move |tx| {
                tx.execute("DELETE FROM messages WHERE folder_id=?", (folder_id,))?;
                tx.execute("DELETE FROM tombstones WHERE folder_id=?", (folder_id,))?;
                tx.execute(
                    "UPDATE folders SET uidvalidity=0, uid_next=0, modseq=NULL, \
                     exists_count=0, backfill_cursor=0, state='new' WHERE id=?",
                    (folder_id,),
                )?;
                Ok(())
            })
            .await?;
        self.uidvalidity = 0;
        self.uid_next = 0;
        self.modseq = None;
        self.exists_count = 0;
        self.backfill_cursor = 0;
        self.state = FolderSyncState::New;
        Ok(())
    }
}

/// Records the health of the connection serving (account, folder).
///
/// Kept for the operational surface; the sync path itself never reads it.
pub(crate) async fn record_connection_health(
    context: &Context,
    account_id: AccountId,
    folder: &str,
    healthy: bool,
    detail: Option<&str>,
) -> Result<()> {
    context
        .sql
        .execute(
            "INSERT INTO connection_health (account_id, folder, healthy, detail, recorded_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(account_id, folder) \
             DO UPDATE SET healthy=excluded.healthy, detail=excluded.detail, \
                           recorded_at=excluded.recorded_at",
            (account_id, folder, healthy, detail, time()),
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestContext;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_load_or_create_is_idempotent() {
        let t = TestContext::new().await;
        let account_id = t.add_account("alice").await;

        let folder = Folder::load_or_create(&t.ctx, account_id, "INBOX")
            .await
            .unwrap();
        assert_eq!(folder.state, FolderSyncState::New);
        assert_eq!(folder.uidvalidity, 0);

        let again = Folder::load_or_create(&t.ctx, account_id, "INBOX")
            .await
            .unwrap();
        assert_eq!(folder.id, again.id);
        assert_eq!(Folder::load_all(&t.ctx, account_id).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_purge_resets_folder() {
        let t = TestContext::new().await;
        let account_id = t.add_account("alice").await;
        let mut folder = Folder::load_or_create(&t.ctx, account_id, "INBOX")
            .await
            .unwrap();
        folder
            .record_select(&t.ctx, 42, 104, 3, Some(7))
            .await
            .unwrap();
        folder
            .set_state(&t.ctx, FolderSyncState::Live)
            .await
            .unwrap();

        t.ctx
            .sql
            .execute(
                "INSERT INTO messages (account_id, folder_id, uid) VALUES (?, ?, 101)",
                (account_id, folder.id),
            )
            .await
            .unwrap();

        folder.purge(&t.ctx).await.unwrap();
        assert_eq!(folder.state, FolderSyncState::New);
        assert_eq!(folder.uidvalidity, 0);
        let left: i64 = t
            .ctx
            .sql
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE folder_id=?",
                (folder.id,),
                |row| row.get(0),
            )
            .await
            .unwrap();
        assert_eq!(left, 0);
    }
}
