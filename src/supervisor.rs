//! Account supervisor.
//!
//! Owns all folder sync units of one account: discovers folders, launches one
//! unit task per folder, reacts to unit exits and account lifecycle changes.
//! A supervisor is single-tenant; the only state shared with other accounts
//! is the global connection pool with its per-host gates.

use std::time::Duration;

use anyhow::{Context as _, Result};
use async_channel::{self as channel, Sender};
use tokio::task;
use tokio_util::sync::CancellationToken;

use crate::account::{Account, AccountId, AccountState};
use crate::context::Context;
use crate::folder::{Folder, FolderSyncState};
use crate::imap;
use crate::log::LogExt;
use crate::sync::{FolderSyncUnit, UnitExit};
use crate::tools::{backoff_with_jitter, duration_to_str};
use crate::webhook::{enqueue_event, Trigger};

const BOOTSTRAP_BACKOFF_BASE: Duration = Duration::from_secs(2);
const BOOTSTRAP_BACKOFF_CAP: Duration = Duration::from_secs(5 * 60);

/// Handle to a running supervisor, owned by the worker.
#[derive(Debug)]
pub(crate) struct SupervisorHandle {
    pub account_id: AccountId,

    /// The generation this supervisor was started with; the worker replaces
    /// the supervisor when the coordinator bumps it.
    pub generation: i64,

    cancel: CancellationToken,
    handle: task::JoinHandle<()>,
}

impl SupervisorHandle {
    /// Requests shutdown and waits up to `grace` for the supervisor to
    /// finish its current atomic steps.
    pub(crate) async fn stop(self, context: &Context, grace: Duration) {
        self.cancel.cancel();
        if tokio::time::timeout(grace, self.handle).await.is_err() {
            warn!(
                context,
                "{}: supervisor did not stop within {}",
                self.account_id,
                duration_to_str(grace)
            );
        }
    }
}

/// Starts a supervisor task for the account.
pub(crate) fn start(
    context: &Context,
    account: Account,
    worker_id: String,
    parent_cancel: &CancellationToken,
) -> SupervisorHandle {
    let cancel = parent_cancel.child_token();
    let account_id = account.id;
    let generation = account.generation;
    let handle = {
        let context = context.clone();
        let cancel = cancel.clone();
        task::spawn(async move {
            supervise(context, account, worker_id, cancel).await;
        })
    };
    SupervisorHandle {
        account_id,
        generation,
        cancel,
        handle,
    }
}

async fn supervise(
    context: Context,
    account: Account,
    worker_id: String,
    cancel: CancellationToken,
) {
    info!(context, "{}: starting supervisor", account.id);

    // Discover folders, retrying transient failures with backoff. Auth
    // failures quiesce the account right away.
    let folders = {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return;
            }
            match bootstrap_folders(&context, &account, &cancel).await {
                Ok(Some(folders)) => break folders,
                Ok(None) => return,
                Err(err) => {
                    if let Some(imap::Error::LoginFailed(msg)) = err.downcast_ref::<imap::Error>()
                    {
                        handle_auth_failure(&context, &account, msg).await;
                        return;
                    }
                    let backoff =
                        backoff_with_jitter(attempt, BOOTSTRAP_BACKOFF_BASE, BOOTSTRAP_BACKOFF_CAP);
                    warn!(
                        context,
                        "{}: folder discovery failed, retrying in {}: {:#}",
                        account.id,
                        duration_to_str(backoff),
                        err
                    );
                    attempt = attempt.saturating_add(1);
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => (),
                    }
                }
            }
        }
    };

    // The account is reachable: report it connected.
    if account.state != AccountState::Active {
        Account::set_state(&context, account.id, AccountState::Active)
            .await
            .ok_or_log(&context);
        enqueue_account_event(
            &context,
            &account,
            Trigger::AccountConnected,
            serde_json::json!({ "grant_id": account.grant_id }),
        )
        .await
        .ok_or_log(&context);
    }

    // One unit task per folder, each with an IDLE interrupt channel.
    let (exit_tx, exit_rx) = channel::bounded(folders.len().max(1));
    let mut interrupters: Vec<Sender<()>> = Vec::new();
    let mut handles = Vec::new();
    for folder_name in folders {
        let (interrupt_tx, interrupt_rx) = channel::bounded(1);
        interrupters.push(interrupt_tx);
        let unit = FolderSyncUnit::new(
            context.clone(),
            account.clone(),
            folder_name.clone(),
            cancel.child_token(),
            interrupt_rx,
        );
        let exit_tx = exit_tx.clone();
        handles.push(task::spawn(async move {
            let exit = unit.run().await;
            exit_tx.send((folder_name, exit)).await.ok();
        }));
    }
    drop(exit_tx);

    let mut running = handles.len();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            exit = exit_rx.recv() => {
                match exit {
                    Ok((folder, UnitExit::AuthFailed(msg))) => {
                        warn!(
                            context,
                            "{} {:?}: authentication failed, quiescing account",
                            account.id,
                            folder
                        );
                        handle_auth_failure(&context, &account, &msg).await;
                        break;
                    }
                    Ok((folder, UnitExit::Orphaned)) => {
                        info!(context, "{} {:?}: unit stopped, folder gone", account.id, folder);
                        running = running.saturating_sub(1);
                    }
                    Ok((_, UnitExit::Cancelled)) | Err(_) => {
                        running = running.saturating_sub(1);
                        if running == 0 {
                            break;
                        }
                    }
                }
            }
            _ = tokio::time::sleep(context.config.poll_interval) => {
                if !still_owned(&context, &account, &worker_id).await {
                    break;
                }
            }
        }
    }

    // Shutdown: interrupt IDLE waits, cancel units, wait for the grace
    // deadline, then abort stragglers.
    cancel.cancel();
    for interrupter in &interrupters {
        interrupter.try_send(()).ok();
    }
    let grace = context.config.grace_deadline;
    for handle in handles {
        if tokio::time::timeout(grace, handle).await.is_err() {
            warn!(context, "{}: unit did not stop in time, aborting", account.id);
        }
    }
    context.pool.drop_account(account.id).await;
    info!(context, "{}: supervisor stopped", account.id);
}

/// Lists folders on the server and persists new ones.
///
/// Returns `None` when cancelled while waiting for a session.
async fn bootstrap_folders(
    context: &Context,
    account: &Account,
    cancel: &CancellationToken,
) -> Result<Option<Vec<String>>> {
    let Some((mut session, lease)) = context.pool.borrow(context, account, cancel).await? else {
        return Ok(None);
    };

    let res = tokio::time::timeout(
        context.config.imap_timeout,
        session.list_folders(context),
    )
    .await
    .context("LIST timed out")
    .and_then(|res| res);

    let mut folders = match res {
        Ok(folders) => folders,
        Err(err) => {
            context.pool.discard(session, lease).await;
            return Err(err);
        }
    };
    context.pool.recycle(context, session, lease).await;

    // Cap the tracked folders to keep resource use bounded; providers
    // report dozens of virtual folders on some accounts.
    let cap = context.config.folders_per_account;
    if folders.len() > cap {
        warn!(
            context,
            "{}: limiting to first {} of {} folders",
            account.id,
            cap,
            folders.len()
        );
        folders.truncate(cap);
    }

    for name in &folders {
        Folder::load_or_create(context, account.id, name).await?;
    }

    // Folders that vanished from the hierarchy while we were away.
    for folder in Folder::load_all(context, account.id).await? {
        if !folders.contains(&folder.name) && folder.state != FolderSyncState::Orphaned {
            let mut folder = folder;
            folder
                .set_state(context, FolderSyncState::Orphaned)
                .await
                .ok_or_log(context);
        }
    }

    Ok(Some(folders))
}

/// Transitions the account to `auth_error` and notifies the tenant.
async fn handle_auth_failure(context: &Context, account: &Account, message: &str) {
    Account::set_state(context, account.id, AccountState::AuthError)
        .await
        .ok_or_log(context);
    Account::set_error(context, account.id, message)
        .await
        .ok_or_log(context);
    enqueue_account_event(
        context,
        account,
        Trigger::AccountInvalidCredentials,
        serde_json::json!({
            "grant_id": account.grant_id,
            "error": message,
        }),
    )
    .await
    .ok_or_log(context);
}

/// Returns false when the account moved away from this worker, its
/// assignment generation was bumped, or it left the `active` state.
async fn still_owned(context: &Context, account: &Account, worker_id: &str) -> bool {
    let current = match Account::load(context, account.id).await {
        Ok(current) => current,
        Err(err) => {
            warn!(context, "{}: cannot re-check ownership: {:#}", account.id, err);
            return true;
        }
    };
    if current.generation != account.generation {
        info!(
            context,
            "{}: assignment generation {} superseded by {}, yielding",
            account.id,
            account.generation,
            current.generation
        );
        return false;
    }
    if current.assigned_worker.as_deref() != Some(worker_id) {
        info!(context, "{}: no longer assigned to {}, yielding", account.id, worker_id);
        return false;
    }
    if !matches!(current.state, AccountState::Active) {
        info!(
            context,
            "{}: left active state ({}), quiescing",
            account.id,
            current.state
        );
        quiesce_folders(context, account.id).await;
        return false;
    }
    true
}

/// Moves all folders of the account to `orphaned`, e.g. when the account is
/// disabled or deleted.
async fn quiesce_folders(context: &Context, account_id: AccountId) {
    if let Ok(folders) = Folder::load_all(context, account_id).await {
        for mut folder in folders {
            folder
                .set_state(context, FolderSyncState::Orphaned)
                .await
                .ok_or_log(context);
        }
    }
}

/// Enqueues an account-level notification for every matching subscription.
async fn enqueue_account_event(
    context: &Context,
    account: &Account,
    trigger: Trigger,
    object: serde_json::Value,
) -> Result<()> {
    let app_id = account.app_id.clone();
    let account_id = account.id;
    context
        .sql
        .transaction(move |tx| {
            enqueue_event(tx, &app_id, account_id, trigger, &object)?;
            Ok(())
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestContext;
    use crate::webhook::{Delivery, Subscription};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_auth_failure_quiesces_and_notifies() {
        let t = TestContext::new().await;
        let account_id = t.add_account("alice").await;
        Subscription::create(
            &t.ctx,
            "app",
            "https://example.org/hook",
            "s",
            &[Trigger::AccountInvalidCredentials],
        )
        .await
        .unwrap();
        let account = Account::load(&t.ctx, account_id).await.unwrap();

        handle_auth_failure(&t.ctx, &account, "LOGIN failed").await;

        let account = Account::load(&t.ctx, account_id).await.unwrap();
        assert_eq!(account.state, AccountState::AuthError);
        assert_eq!(account.last_error.as_deref(), Some("LOGIN failed"));

        let due = Delivery::next_due(&t.ctx, None, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].trigger, Trigger::AccountInvalidCredentials);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_still_owned_generation_fencing() {
        let t = TestContext::new().await;
        let account_id = t.add_account("alice").await;
        t.ctx
            .sql
            .execute(
                "UPDATE accounts SET assigned_worker='w1', state='active' WHERE id=?",
                (account_id,),
            )
            .await
            .unwrap();
        let account = Account::load(&t.ctx, account_id).await.unwrap();

        assert!(still_owned(&t.ctx, &account, "w1").await);
        assert!(!still_owned(&t.ctx, &account, "w2").await);

        // A bumped generation fences the old supervisor out.
        t.ctx
            .sql
            .execute(
                "UPDATE accounts SET generation=generation+1 WHERE id=?",
                (account_id,),
            )
            .await
            .unwrap();
        assert!(!still_owned(&t.ctx, &account, "w1").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disabled_account_quiesces_folders() {
        let t = TestContext::new().await;
        let account_id = t.add_account("alice").await;
        t.ctx
            .sql
            .execute(
                "UPDATE accounts SET assigned_worker='w1', state='active' WHERE id=?",
                (account_id,),
            )
            .await
            .unwrap();
        let account = Account::load(&t.ctx, account_id).await.unwrap();
        let mut folder = Folder::load_or_create(&t.ctx, account_id, "INBOX")
            .await
            .unwrap();
        folder
            .set_state(&t.ctx, FolderSyncState::Live)
            .await
            .unwrap();

        Account::set_state(&t.ctx, account_id, AccountState::Disabled)
            .await
            .unwrap();
        assert!(!still_owned(&t.ctx, &account, "w1").await);

        let folder = Folder::load(&t.ctx, account_id, "INBOX")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(folder.state, FolderSyncState::Orphaned);
    }
}
