//! Folder sync unit.
//!
//! One unit drives one (account, folder) through the state machine
//! `new → backfilling → live`, with `failed` on repeated protocol errors and
//! `orphaned` when the folder disappears from the server. All IMAP commands
//! and event emissions of a unit are strictly sequential; index mutations and
//! their webhook enqueues commit in one transaction.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_channel::Receiver;
use tokio_util::sync::CancellationToken;

use crate::account::{Account, AccountId};
use crate::context::Context;
use crate::events::EventType;
use crate::folder::{record_connection_health, Folder, FolderSyncState};
use crate::imap::{self, FetchedMessage, IdleOutcome, SelectInfo, Session};
use crate::log::LogExt;
use crate::message::{self, MessageEntry, UpsertOutcome};
use crate::tools::backoff_with_jitter;
use crate::webhook::{enqueue_event, Trigger};

/// Restart backoff of a unit after a transient failure.
const RESTART_BACKOFF_BASE: Duration = Duration::from_secs(2);
const RESTART_BACKOFF_CAP: Duration = Duration::from_secs(5 * 60);

/// Consecutive failures after which the folder is marked `failed`.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Wait between polls when the server does not support IDLE.
const FAKE_IDLE_INTERVAL: Duration = Duration::from_secs(60);

/// Why a unit stopped running.
#[derive(Debug)]
pub(crate) enum UnitExit {
    /// Cancellation was observed.
    Cancelled,

    /// The folder no longer exists on the server.
    Orphaned,

    /// Login failed; the supervisor quiesces the whole account.
    AuthFailed(String),
}

enum CycleOutcome {
    /// Reconciliation done; the folder is live and was left selected.
    Synced,

    /// The folder disappeared from the server.
    Orphaned,
}

/// The state machine driver for one (account, folder).
pub(crate) struct FolderSyncUnit {
    context: Context,
    account: Account,
    folder_name: String,
    cancel: CancellationToken,

    /// Interrupts an in-progress IDLE wait, e.g. on shutdown.
    idle_interrupt: Receiver<()>,
}

impl FolderSyncUnit {
    pub(crate) fn new(
        context: Context,
        account: Account,
        folder_name: String,
        cancel: CancellationToken,
        idle_interrupt: Receiver<()>,
    ) -> Self {
        Self {
            context,
            account,
            folder_name,
            cancel,
            idle_interrupt,
        }
    }

    /// Runs the unit until cancellation, orphaning or an auth failure.
    ///
    /// Transient failures restart the loop with full-jitter exponential
    /// backoff; after [`MAX_CONSECUTIVE_FAILURES`] the folder is marked
    /// `failed` and resets to `new` on the next successful SELECT.
    pub(crate) async fn run(mut self) -> UnitExit {
        let ctx = self.context.clone();
        let mut consecutive_failures: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return UnitExit::Cancelled;
            }

            match self.run_once().await {
                Ok(Some(exit)) => return exit,
                Ok(None) => {
                    consecutive_failures = 0;
                }
                Err(err) => {
                    if let Some(imap::Error::LoginFailed(msg)) =
                        err.downcast_ref::<imap::Error>()
                    {
                        return UnitExit::AuthFailed(msg.clone());
                    }

                    consecutive_failures += 1;
                    warn!(
                        ctx,
                        "{} {:?}: sync failed ({} consecutive): {:#}",
                        self.account.id,
                        self.folder_name,
                        consecutive_failures,
                        err
                    );
                    record_connection_health(
                        &ctx,
                        self.account.id,
                        &self.folder_name,
                        false,
                        Some(&format!("{err:#}")),
                    )
                    .await
                    .ok_or_log(&ctx);

                    if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        if let Ok(Some(mut folder)) =
                            Folder::load(&ctx, self.account.id, &self.folder_name).await
                        {
                            folder
                                .set_state(&ctx, FolderSyncState::Failed)
                                .await
                                .ok_or_log(&ctx);
                            folder.set_error(&ctx, &format!("{err:#}")).await.ok_or_log(&ctx);
                        }
                    }

                    let backoff = backoff_with_jitter(
                        consecutive_failures.saturating_sub(1),
                        RESTART_BACKOFF_BASE,
                        RESTART_BACKOFF_CAP,
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return UnitExit::Cancelled,
                        _ = tokio::time::sleep(backoff) => (),
                    }
                }
            }
        }
    }

    /// One borrow-sync-idle pass. Returns `Some` when the unit should stop.
    async fn run_once(&mut self) -> Result<Option<UnitExit>> {
        let ctx = self.context.clone();

        let Some((mut session, lease)) = ctx
            .pool
            .borrow(&ctx, &self.account, &self.cancel)
            .await?
        else {
            return Ok(Some(UnitExit::Cancelled));
        };

        let mut folder = Folder::load_or_create(&ctx, self.account.id, &self.folder_name).await?;

        let outcome = match self.sync_cycle(&mut session, &mut folder).await {
            Ok(outcome) => outcome,
            Err(err) => {
                // The session state is unknown after a failed dialogue.
                ctx.pool.discard(session, lease).await;
                return Err(err);
            }
        };

        match outcome {
            CycleOutcome::Orphaned => {
                ctx.pool.recycle(&ctx, session, lease).await;
                Ok(Some(UnitExit::Orphaned))
            }
            CycleOutcome::Synced => {
                record_connection_health(&ctx, self.account.id, &self.folder_name, true, None)
                    .await
                    .ok_or_log(&ctx);
                Account::record_sync(&ctx, self.account.id)
                    .await
                    .ok_or_log(&ctx);

                if session.can_idle() {
                    // The session stays with the unit: IDLE is its own IMAP
                    // dialogue.
                    match session
                        .idle(
                            &ctx,
                            self.idle_interrupt.clone(),
                            &self.folder_name,
                            ctx.config.idle_interval,
                        )
                        .await
                    {
                        Ok((session, IdleOutcome::Interrupted)) => {
                            ctx.pool.recycle(&ctx, session, lease).await;
                            if self.cancel.is_cancelled() {
                                return Ok(Some(UnitExit::Cancelled));
                            }
                        }
                        Ok((session, _)) => {
                            ctx.pool.recycle(&ctx, session, lease).await;
                        }
                        Err(err) => {
                            // The connection dropped inside IDLE; the lease
                            // frees the slots, the session is gone.
                            drop(lease);
                            return Err(err.context("IDLE failed"));
                        }
                    }
                } else {
                    // No IDLE: release the session during the poll wait so
                    // sibling units can multiplex onto it.
                    ctx.pool.recycle(&ctx, session, lease).await;
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(Some(UnitExit::Cancelled)),
                        _ = self.idle_interrupt.recv() => (),
                        _ = tokio::time::sleep(FAKE_IDLE_INTERVAL) => (),
                    }
                }
                Ok(None)
            }
        }
    }

    /// SELECT, handle UIDVALIDITY, then backfill or reconcile.
    async fn sync_cycle(
        &mut self,
        session: &mut Session,
        folder: &mut Folder,
    ) -> Result<CycleOutcome> {
        let ctx = self.context.clone();

        let info = match session.select_folder(&ctx, &self.folder_name).await {
            Ok(info) => info,
            Err(imap::select_folder::Error::NoFolder(..)) => {
                // Re-list the hierarchy before declaring the folder gone;
                // a NO can also mean a transient server condition.
                let folders = self.cmd(session.list_folders(&ctx)).await?;
                if folders.iter().any(|f| f == &self.folder_name) {
                    anyhow::bail!("folder {:?} exists but cannot be selected", self.folder_name);
                }
                info!(
                    ctx,
                    "{} {:?}: folder disappeared from the server",
                    self.account.id,
                    self.folder_name
                );
                folder.set_state(&ctx, FolderSyncState::Orphaned).await?;
                self.enqueue_folder_updated(folder, "deleted").await?;
                return Ok(CycleOutcome::Orphaned);
            }
            Err(err) => return Err(anyhow::Error::new(err).context("SELECT failed")),
        };

        if folder.uidvalidity != 0 && folder.uidvalidity != info.uid_validity {
            // The folder was recreated on the server: every known UID is
            // void. Purge silently and start over.
            info!(
                ctx,
                "{} {:?}: UIDVALIDITY changed {} -> {}, resetting local index",
                self.account.id,
                self.folder_name,
                folder.uidvalidity,
                info.uid_validity
            );
            folder.purge(&ctx).await?;
            self.enqueue_folder_updated(folder, "uidvalidity_change")
                .await?;
        }

        if matches!(
            folder.state,
            FolderSyncState::New | FolderSyncState::Failed | FolderSyncState::Orphaned
        ) {
            folder
                .record_select(
                    &ctx,
                    info.uid_validity,
                    info.uid_next,
                    info.exists,
                    info.highest_modseq,
                )
                .await?;
            folder.set_backfill_cursor(&ctx, info.uid_next).await?;
            folder.set_state(&ctx, FolderSyncState::Backfilling).await?;
        }

        if folder.state == FolderSyncState::Backfilling {
            self.backfill(session, folder).await?;
        }

        if folder.state == FolderSyncState::Live {
            self.reconcile(session, folder, info).await?;
        }

        Ok(CycleOutcome::Synced)
    }

    /// Enumerates pre-existing messages in descending-UID batches.
    ///
    /// The cursor is persisted after every committed batch, so a restarted
    /// unit resumes where it left off without re-emitting events for UIDs
    /// already indexed.
    async fn backfill(&mut self, session: &mut Session, folder: &mut Folder) -> Result<()> {
        let ctx = self.context.clone();
        let batch_size = ctx.config.backfill_batch_size.max(1);
        let horizon = self
            .account
            .backfill_horizon
            .or(ctx.config.backfill_horizon);

        // The SELECT-time UIDNEXT recorded at backfill start is the ceiling;
        // anything newer is handled by the live delta later.
        let ceiling = folder.uid_next;
        let floor = match horizon {
            Some(n) => ceiling.saturating_sub(n).max(1),
            None => 1,
        };

        while folder.backfill_cursor > floor {
            if self.cancel.is_cancelled() {
                // Resume after restart; the cursor is already persisted.
                return Ok(());
            }

            let high = folder.backfill_cursor - 1;
            let low = folder.backfill_cursor.saturating_sub(batch_size).max(floor);
            let set = format!("{low}:{high}");

            let messages = self.cmd(session.fetch_message_metadata(&set)).await?;
            let created = self.commit_batch(folder, messages).await?;
            folder.set_backfill_cursor(&ctx, low).await?;

            if created > 0 {
                ctx.emit_event(EventType::NewMessages {
                    account_id: self.account.id,
                    folder: self.folder_name.clone(),
                    count: created,
                });
            }
        }

        info!(
            ctx,
            "{} {:?}: backfill caught up at UID {}",
            self.account.id,
            self.folder_name,
            ceiling
        );
        folder.set_state(&ctx, FolderSyncState::Live).await?;
        Ok(())
    }

    /// Brings a live folder up to date with the server.
    async fn reconcile(
        &mut self,
        session: &mut Session,
        folder: &mut Folder,
        info: SelectInfo,
    ) -> Result<()> {
        let ctx = self.context.clone();

        // Additions first so that flag reconciliation sees the new entries.
        if info.uid_next > folder.uid_next {
            let set = format!("{}:*", folder.uid_next);
            let messages = self.cmd(session.fetch_message_metadata(&set)).await?;
            // If the range is past the last message, servers answer with the
            // last message anyway (`uid:*` is read as `*:uid`); drop it.
            let messages: Vec<FetchedMessage> = messages
                .into_iter()
                .filter(|m| m.uid >= folder.uid_next)
                .collect();
            let max_uid = messages.iter().map(|m| m.uid).max();
            let created = self.commit_batch(folder, messages).await?;
            if created > 0 {
                ctx.emit_event(EventType::NewMessages {
                    account_id: self.account.id,
                    folder: self.folder_name.clone(),
                    count: created,
                });
            }
            let new_uid_next = info.uid_next.max(max_uid.map_or(0, |uid| uid + 1));
            folder.set_uid_next(&ctx, new_uid_next).await?;
        }

        // Flag changes: CONDSTORE delta where available, full comparison
        // against the local index otherwise.
        if session.can_condstore() {
            if let (Some(known_modseq), Some(new_modseq)) = (folder.modseq, info.highest_modseq) {
                if new_modseq > known_modseq {
                    let changes = self.cmd(session.fetch_changed_flags(known_modseq)).await?;
                    self.apply_flag_changes(folder, changes.into_iter().map(|(uid, flags, _)| (uid, flags)).collect())
                        .await?;
                    folder.set_modseq(&ctx, new_modseq).await?;
                }
            } else if let Some(new_modseq) = info.highest_modseq {
                folder.set_modseq(&ctx, new_modseq).await?;
            }
        } else {
            let flags = self.cmd(session.fetch_all_flags()).await?;
            self.apply_flag_changes(folder, flags).await?;
        }

        // Expunge detection: compare the server's UID set against the index
        // whenever the message counts disagree.
        let local_uids = message::list_uids(&ctx, folder.id).await?;
        if local_uids.len() as u32 != info.exists {
            let server_uids = self.cmd(session.search_all_uids()).await?;
            let server: std::collections::HashSet<u32> = server_uids.into_iter().collect();
            let expunged: Vec<u32> = local_uids
                .into_iter()
                .filter(|uid| !server.contains(uid))
                .collect();
            if !expunged.is_empty() {
                info!(
                    ctx,
                    "{} {:?}: {} messages expunged on the server",
                    self.account.id,
                    self.folder_name,
                    expunged.len()
                );
                let folder_id = folder.id;
                ctx.sql
                    .transaction(move |tx| {
                        for &uid in &expunged {
                            message::record_expunge(tx, folder_id, uid)?;
                        }
                        Ok(())
                    })
                    .await?;
            }
        }

        folder
            .record_select(
                &ctx,
                info.uid_validity,
                folder.uid_next.max(info.uid_next),
                info.exists,
                folder.modseq,
            )
            .await?;
        Ok(())
    }

    /// Upserts one batch of fetched messages and enqueues the matching
    /// notifications in a single transaction, in ascending UID order.
    async fn commit_batch(
        &self,
        folder: &Folder,
        messages: Vec<FetchedMessage>,
    ) -> Result<usize> {
        if messages.is_empty() {
            return Ok(0);
        }
        let account_id = self.account.id;
        let app_id = self.account.app_id.clone();
        let grant_id = self.account.grant_id.clone();
        let folder_id = folder.id;
        let folder_name = folder.name.clone();

        self.context
            .sql
            .transaction(move |tx| {
                let mut created = 0;
                for msg in &messages {
                    let mut entry = entry_from_fetch(account_id, folder_id, msg);
                    match entry.upsert(tx)? {
                        UpsertOutcome::Inserted => {
                            let object =
                                message_object(&entry, &folder_name, &grant_id);
                            enqueue_event(
                                tx,
                                &app_id,
                                account_id,
                                Trigger::MessageCreated,
                                &object,
                            )?;
                            created += 1;
                        }
                        UpsertOutcome::FlagsChanged => {
                            let object =
                                message_object(&entry, &folder_name, &grant_id);
                            enqueue_event(
                                tx,
                                &app_id,
                                account_id,
                                Trigger::MessageUpdated,
                                &object,
                            )?;
                        }
                        UpsertOutcome::Unchanged => (),
                    }
                }
                Ok(created)
            })
            .await
    }

    /// Applies (uid, flags) observations to indexed entries, emitting
    /// `message.updated` for every actual change.
    async fn apply_flag_changes(
        &self,
        folder: &Folder,
        changes: Vec<(u32, String)>,
    ) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let account_id = self.account.id;
        let app_id = self.account.app_id.clone();
        let grant_id = self.account.grant_id.clone();
        let folder_id = folder.id;
        let folder_name = folder.name.clone();

        self.context
            .sql
            .transaction(move |tx| {
                for (uid, flags) in &changes {
                    let existing: Option<(String, String, String)> = rusqlite::OptionalExtension::optional(
                        tx.query_row(
                            "SELECT flags, thread_id, message_id FROM messages \
                             WHERE folder_id=? AND uid=?",
                            (folder_id, uid),
                            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                        ),
                    )?;
                    let Some((old_flags, thread_id, message_id)) = existing else {
                        // Not indexed (e.g. outside the backfill horizon).
                        continue;
                    };
                    if &old_flags == flags {
                        continue;
                    }
                    tx.execute(
                        "UPDATE messages SET flags=? WHERE folder_id=? AND uid=?",
                        (flags, folder_id, uid),
                    )?;
                    let object = serde_json::json!({
                        "id": format!("{folder_id}-{uid}"),
                        "grant_id": grant_id,
                        "thread_id": thread_id,
                        "message_id": message_id,
                        "folder": folder_name,
                        "flags": flags.split(' ').filter(|f| !f.is_empty()).collect::<Vec<_>>(),
                    });
                    enqueue_event(tx, &app_id, account_id, Trigger::MessageUpdated, &object)?;
                }
                Ok(())
            })
            .await
    }

    /// Enqueues a `folder.updated` notification.
    async fn enqueue_folder_updated(&self, folder: &Folder, reason: &str) -> Result<()> {
        let app_id = self.account.app_id.clone();
        let grant_id = self.account.grant_id.clone();
        let account_id = self.account.id;
        let folder_name = folder.name.clone();
        let reason = reason.to_string();

        self.context
            .sql
            .transaction(move |tx| {
                let object = serde_json::json!({
                    "grant_id": grant_id,
                    "folder": folder_name,
                    "reason": reason,
                });
                enqueue_event(tx, &app_id, account_id, Trigger::FolderUpdated, &object)?;
                Ok(())
            })
            .await
    }

    /// Applies the per-command IMAP timeout.
    async fn cmd<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.context.config.imap_timeout, fut)
            .await
            .context("IMAP command timed out")?
    }
}

fn entry_from_fetch(account_id: AccountId, folder_id: i64, msg: &FetchedMessage) -> MessageEntry {
    MessageEntry {
        account_id,
        folder_id,
        uid: msg.uid,
        internal_date: msg.internal_date,
        from_addr: msg.from_addr.clone(),
        to_addrs: msg.to_addrs.clone(),
        cc_addrs: msg.cc_addrs.clone(),
        bcc_addrs: msg.bcc_addrs.clone(),
        subject: msg.subject.clone(),
        message_id: msg.message_id.clone(),
        in_reply_to: msg.in_reply_to.clone(),
        references_hdr: msg.references.clone(),
        size: msg.size,
        flags: msg.flags.clone(),
        thread_id: String::new(),
        first_seen_at: 0,
    }
}

/// Builds the `object` body of `message.created`/`message.updated`.
fn message_object(entry: &MessageEntry, folder: &str, grant_id: &str) -> serde_json::Value {
    serde_json::json!({
        "id": format!("{}-{}", entry.folder_id, entry.uid),
        "grant_id": grant_id,
        "thread_id": entry.thread_id,
        "folder": folder,
        "uid": entry.uid,
        "date": entry.internal_date,
        "size": entry.size,
        "flags": entry.flags.split(' ').filter(|f| !f.is_empty()).collect::<Vec<_>>(),
        "headers": {
            "message_id": entry.message_id,
            "in_reply_to": entry.in_reply_to,
            "references": entry.references_hdr,
            "subject": entry.subject,
        },
        "participants": {
            "from": entry.from_addr,
            "to": entry.to_addrs,
            "cc": entry.cc_addrs,
            "bcc": entry.bcc_addrs,
        },
    })
}

// The unit is exercised end-to-end in the supervisor and scenario tests;
// the pure pieces are covered here.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::folder::Folder;
    use crate::test_utils::TestContext;
    use crate::webhook::{Delivery, Subscription};

    async fn test_unit(t: &TestContext, account_id: AccountId) -> FolderSyncUnit {
        let account = Account::load(&t.ctx, account_id).await.unwrap();
        let (_tx, rx) = async_channel::bounded(1);
        FolderSyncUnit::new(
            t.ctx.clone(),
            account,
            "INBOX".to_string(),
            CancellationToken::new(),
            rx,
        )
    }

    fn fetched(uid: u32, subject: &str) -> FetchedMessage {
        FetchedMessage {
            uid,
            internal_date: 1_700_000_000 + uid as i64,
            size: 512,
            flags: String::new(),
            from_addr: "sender@example.org".into(),
            to_addrs: "alice@example.org".into(),
            subject: subject.into(),
            message_id: format!("<{uid}@example.org>"),
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_commit_batch_emits_created_in_uid_order() {
        let t = TestContext::new().await;
        let account_id = t.add_account("alice").await;
        Subscription::create(
            &t.ctx,
            "app",
            "https://example.org/hook",
            "s",
            &[Trigger::MessageCreated],
        )
        .await
        .unwrap();
        let folder = Folder::load_or_create(&t.ctx, account_id, "INBOX")
            .await
            .unwrap();
        let unit = test_unit(&t, account_id).await;

        let batch = vec![fetched(101, "a"), fetched(102, "b"), fetched(103, "c")];
        let created = unit.commit_batch(&folder, batch).await.unwrap();
        assert_eq!(created, 3);

        // Delivery ids follow UID order.
        let uids: Vec<i64> = t
            .ctx
            .sql
            .query_map(
                "SELECT json_extract(payload, '$.uid') FROM webhook_deliveries ORDER BY id",
                [],
                |row| row.get(0),
            )
            .await
            .unwrap();
        assert_eq!(uids, vec![101, 102, 103]);

        // Re-committing the same batch emits nothing new.
        let batch = vec![fetched(101, "a"), fetched(102, "b"), fetched(103, "c")];
        let created = unit.commit_batch(&folder, batch).await.unwrap();
        assert_eq!(created, 0);
        let count: i64 = t
            .ctx
            .sql
            .query_row("SELECT COUNT(*) FROM webhook_deliveries", [], |row| {
                row.get(0)
            })
            .await
            .unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_flag_change_emits_message_updated() {
        let t = TestContext::new().await;
        let account_id = t.add_account("alice").await;
        Subscription::create(
            &t.ctx,
            "app",
            "https://example.org/hook",
            "s",
            &[Trigger::MessageUpdated],
        )
        .await
        .unwrap();
        let folder = Folder::load_or_create(&t.ctx, account_id, "INBOX")
            .await
            .unwrap();
        let unit = test_unit(&t, account_id).await;

        unit.commit_batch(&folder, vec![fetched(7, "x")])
            .await
            .unwrap();

        // Same flags: silent. New flags: one message.updated.
        unit.apply_flag_changes(&folder, vec![(7, String::new())])
            .await
            .unwrap();
        unit.apply_flag_changes(&folder, vec![(7, "\\Seen".to_string())])
            .await
            .unwrap();
        // UIDs outside the index are ignored.
        unit.apply_flag_changes(&folder, vec![(9999, "\\Seen".to_string())])
            .await
            .unwrap();

        let due = Delivery::next_due(&t.ctx, None, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].trigger, Trigger::MessageUpdated);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_folder_updated_event() {
        let t = TestContext::new().await;
        let account_id = t.add_account("alice").await;
        Subscription::create(
            &t.ctx,
            "app",
            "https://example.org/hook",
            "s",
            &[Trigger::FolderUpdated],
        )
        .await
        .unwrap();
        let folder = Folder::load_or_create(&t.ctx, account_id, "INBOX")
            .await
            .unwrap();
        let unit = test_unit(&t, account_id).await;

        unit.enqueue_folder_updated(&folder, "uidvalidity_change")
            .await
            .unwrap();

        let due = Delivery::next_due(&t.ctx, None, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        let payload: serde_json::Value = serde_json::from_str(&due[0].payload).unwrap();
        assert_eq!(payload["reason"], "uidvalidity_change");
        assert_eq!(payload["folder"], "INBOX");
    }
}
