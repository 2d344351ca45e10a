//! Message index.
//!
//! The index stores header metadata only; bodies are never persisted. Entries
//! are keyed by (folder, UID) and stay valid while the folder's UIDVALIDITY
//! is unchanged. Expunged UIDs leave a tombstone behind so that a re-sync can
//! tell "never seen" from "seen and deleted".

use anyhow::Result;
use rusqlite::OptionalExtension;

use crate::account::AccountId;
use crate::context::Context;
use crate::threading;
use crate::tools::time;

/// One row of the message index.
#[derive(Debug, Clone, Default)]
pub struct MessageEntry {
    pub account_id: AccountId,
    pub folder_id: i64,
    pub uid: u32,

    /// Server INTERNALDATE as unix seconds.
    pub internal_date: i64,

    pub from_addr: String,
    pub to_addrs: String,
    pub cc_addrs: String,
    pub bcc_addrs: String,
    pub subject: String,
    pub message_id: String,
    pub in_reply_to: String,
    pub references_hdr: String,
    pub size: u32,

    /// Space-separated IMAP flags, e.g. `"\\Seen \\Answered"`.
    pub flags: String,

    /// Computed thread id, filled in during upsert.
    pub thread_id: String,

    pub first_seen_at: i64,
}

/// Outcome of an upsert, used to decide which notification to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The UID was not indexed before.
    Inserted,

    /// The UID existed and its flag set changed.
    FlagsChanged,

    /// The UID existed with identical flags.
    Unchanged,
}

impl MessageEntry {
    /// All participant addresses of the message, used for the subject-based
    /// thread fallback and the notification payload.
    pub fn participants(&self) -> Vec<String> {
        let mut out = Vec::new();
        for field in [
            &self.from_addr,
            &self.to_addrs,
            &self.cc_addrs,
            &self.bcc_addrs,
        ] {
            for addr in field.split(',') {
                let addr = addr.trim();
                if !addr.is_empty() {
                    out.push(addr.to_string());
                }
            }
        }
        out
    }

    /// Inserts or updates the entry inside an open transaction, resolving the
    /// thread id against the existing index.
    ///
    /// This runs in the same transaction that enqueues the matching webhook
    /// delivery, giving exactly-once enqueue per index mutation.
    pub(crate) fn upsert(&mut self, conn: &rusqlite::Connection) -> Result<UpsertOutcome> {
        let existing: Option<(String, String)> = conn
            .query_row(
                "SELECT flags, thread_id FROM messages WHERE folder_id=? AND uid=?",
                (self.folder_id, self.uid),
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((old_flags, thread_id)) = existing {
            self.thread_id = thread_id;
            if old_flags == self.flags {
                return Ok(UpsertOutcome::Unchanged);
            }
            conn.execute(
                "UPDATE messages SET flags=? WHERE folder_id=? AND uid=?",
                (&self.flags, self.folder_id, self.uid),
            )?;
            return Ok(UpsertOutcome::FlagsChanged);
        }

        self.thread_id = resolve_thread_id(conn, self)?;
        self.first_seen_at = time();
        conn.execute(
            "INSERT INTO messages (account_id, folder_id, uid, internal_date, from_addr, \
                                   to_addrs, cc_addrs, bcc_addrs, subject, message_id, \
                                   in_reply_to, references_hdr, size, flags, thread_id, \
                                   first_seen_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                self.account_id,
                self.folder_id,
                self.uid,
                self.internal_date,
                self.from_addr,
                self.to_addrs,
                self.cc_addrs,
                self.bcc_addrs,
                self.subject,
                self.message_id,
                self.in_reply_to,
                self.references_hdr,
                self.size,
                self.flags,
                self.thread_id,
                self.first_seen_at,
            ],
        )?;
        Ok(UpsertOutcome::Inserted)
    }
}

/// Resolves the thread id for a new entry.
///
/// If the reference chain points at an already indexed message of the same
/// account, the new entry joins its thread; the first indexed member of a
/// cluster decides the id for everyone joining later.
fn resolve_thread_id(conn: &rusqlite::Connection, entry: &MessageEntry) -> Result<String> {
    for referenced in entry
        .references_hdr
        .split_whitespace()
        .chain(entry.in_reply_to.split_whitespace())
    {
        let parent: Option<String> = conn
            .query_row(
                "SELECT thread_id FROM messages \
                 WHERE account_id=? AND message_id=? AND thread_id!='' \
                 ORDER BY internal_date LIMIT 1",
                (entry.account_id, referenced),
                |row| row.get(0),
            )
            .optional()?;
        if let Some(thread_id) = parent {
            return Ok(thread_id);
        }
    }
    Ok(threading::thread_id(
        &entry.references_hdr,
        &entry.in_reply_to,
        &entry.subject,
        &entry.participants(),
    ))
}

/// Returns all indexed UIDs of a folder in ascending order.
pub(crate) async fn list_uids(context: &Context, folder_id: i64) -> Result<Vec<u32>> {
    context
        .sql
        .query_map(
            "SELECT uid FROM messages WHERE folder_id=? ORDER BY uid",
            (folder_id,),
            |row| row.get(0),
        )
        .await
}

/// Returns the highest indexed UID of a folder, or 0 for an empty index.
pub(crate) async fn max_uid(context: &Context, folder_id: i64) -> Result<u32> {
    // MAX() over an empty table yields one NULL row.
    Ok(context
        .sql
        .query_get_value::<Option<u32>>(
            "SELECT MAX(uid) FROM messages WHERE folder_id=?",
            (folder_id,),
        )
        .await?
        .flatten()
        .unwrap_or(0))
}

/// Returns true if the UID has an index entry or a tombstone.
pub(crate) async fn is_known_uid(context: &Context, folder_id: i64, uid: u32) -> Result<bool> {
    context
        .sql
        .exists(
            "SELECT (SELECT COUNT(*) FROM messages WHERE folder_id=?1 AND uid=?2) \
                  + (SELECT COUNT(*) FROM tombstones WHERE folder_id=?1 AND uid=?2)",
            (folder_id, uid),
        )
        .await
}

/// Removes an expunged UID from the index, leaving a tombstone.
pub(crate) fn record_expunge(
    conn: &rusqlite::Connection,
    folder_id: i64,
    uid: u32,
) -> Result<()> {
    conn.execute(
        "DELETE FROM messages WHERE folder_id=? AND uid=?",
        (folder_id, uid),
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO tombstones (folder_id, uid, expunged_at) VALUES (?, ?, ?)",
        (folder_id, uid, time()),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::folder::Folder;
    use crate::test_utils::TestContext;

    async fn make_folder(t: &TestContext) -> (AccountId, Folder) {
        let account_id = t.add_account("alice").await;
        let folder = Folder::load_or_create(&t.ctx, account_id, "INBOX")
            .await
            .unwrap();
        (account_id, folder)
    }

    fn entry(account_id: AccountId, folder_id: i64, uid: u32) -> MessageEntry {
        MessageEntry {
            account_id,
            folder_id,
            uid,
            internal_date: 1_700_000_000 + uid as i64,
            from_addr: "alice@example.org".into(),
            to_addrs: "bob@example.org".into(),
            subject: format!("msg {uid}"),
            message_id: format!("<{uid}@example.org>"),
            size: 1024,
            flags: "\\Seen".into(),
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_upsert_insert_then_flags() {
        let t = TestContext::new().await;
        let (account_id, folder) = make_folder(&t).await;

        let mut e = entry(account_id, folder.id, 101);
        let outcome = t
            .ctx
            .sql
            .call(|conn| {
                let mut e = e.clone();
                e.upsert(conn)
            })
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);

        // Same flags: no change.
        let outcome = t
            .ctx
            .sql
            .call(|conn| {
                let mut e = e.clone();
                e.upsert(conn)
            })
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Unchanged);

        // Changed flags are detected.
        e.flags = "\\Seen \\Answered".into();
        let outcome = t.ctx.sql.call(|conn| e.upsert(conn)).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::FlagsChanged);

        assert_eq!(list_uids(&t.ctx, folder.id).await.unwrap(), vec![101]);
        assert_eq!(max_uid(&t.ctx, folder.id).await.unwrap(), 101);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_replies_join_existing_thread() {
        let t = TestContext::new().await;
        let (account_id, folder) = make_folder(&t).await;

        let mut root = entry(account_id, folder.id, 1);
        t.ctx.sql.call(|conn| root.upsert(conn)).await.unwrap();
        assert!(!root.thread_id.is_empty());

        let mut reply = entry(account_id, folder.id, 2);
        reply.subject = "Re: msg 1".into();
        reply.in_reply_to = "<1@example.org>".into();
        reply.references_hdr = "<1@example.org>".into();
        t.ctx.sql.call(|conn| reply.upsert(conn)).await.unwrap();

        assert_eq!(root.thread_id, reply.thread_id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_expunge_leaves_tombstone() {
        let t = TestContext::new().await;
        let (account_id, folder) = make_folder(&t).await;

        let mut e = entry(account_id, folder.id, 7);
        t.ctx.sql.call(|conn| e.upsert(conn)).await.unwrap();

        t.ctx
            .sql
            .call(|conn| record_expunge(conn, folder.id, 7))
            .await
            .unwrap();

        assert!(list_uids(&t.ctx, folder.id).await.unwrap().is_empty());
        assert!(is_known_uid(&t.ctx, folder.id, 7).await.unwrap());
        assert!(!is_known_uid(&t.ctx, folder.id, 8).await.unwrap());
    }
}
