//! Worker process.
//!
//! A worker hosts the supervisors of the accounts assigned to it, heartbeats
//! its lease, runs the webhook dispatcher for its accounts and, in cluster
//! mode, participates in coordinator leadership election. In single mode it
//! simply claims every active account.

use std::collections::HashMap;

use anyhow::Result;
use futures::future::join_all;
use tokio::task;
use tokio_util::sync::CancellationToken;

use crate::account::{Account, AccountId};
use crate::config::Mode;
use crate::context::Context;
use crate::coordinator;
use crate::dispatcher;
use crate::log::LogExt;
use crate::supervisor::{self, SupervisorHandle};
use crate::tools::time;

/// Counters for the operational surface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Supervisors currently hosted.
    pub accounts: usize,

    /// Folders in `live` state across those accounts.
    pub live_folders: usize,

    /// Webhook deliveries still pending.
    pub pending_deliveries: usize,
}

/// One worker process.
#[derive(Debug)]
pub struct Worker {
    context: Context,
    worker_id: String,
    cancel: CancellationToken,
}

impl Worker {
    pub fn new(context: Context, cancel: CancellationToken) -> Self {
        let worker_id = context.config.worker_id.clone();
        Self {
            context,
            worker_id,
            cancel,
        }
    }

    /// Runs the worker until the cancellation token fires, then shuts down
    /// gracefully within the configured grace deadline.
    pub async fn run(&self) -> Result<()> {
        let ctx = &self.context;
        info!(ctx, "{}: starting worker ({:?} mode)", self.worker_id, ctx.config.mode);

        let heartbeat_handle = {
            let context = ctx.clone();
            let worker_id = self.worker_id.clone();
            let cancel = self.cancel.clone();
            task::spawn(heartbeat_loop(context, worker_id, cancel))
        };

        let dispatcher_handle = {
            let context = ctx.clone();
            let worker_id = self.worker_id.clone();
            let cancel = self.cancel.child_token();
            task::spawn(dispatcher::dispatcher_loop(
                context,
                Some(worker_id),
                cancel,
            ))
        };

        let coordinator_handle = match ctx.config.mode {
            Mode::Cluster => {
                let context = ctx.clone();
                let worker_id = self.worker_id.clone();
                let cancel = self.cancel.child_token();
                Some(task::spawn(coordinator::coordinator_loop(
                    context, worker_id, cancel,
                )))
            }
            Mode::Single => None,
        };

        let mut supervisors: HashMap<AccountId, SupervisorHandle> = HashMap::new();
        loop {
            self.reconcile_assignments(&mut supervisors)
                .await
                .ok_or_log_msg(ctx, "assignment reconciliation failed");

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(ctx.config.poll_interval) => (),
            }
        }

        // Graceful shutdown: stop all supervisors in parallel within the
        // grace deadline, then the background loops.
        info!(ctx, "{}: shutting down {} supervisors", self.worker_id, supervisors.len());
        let grace = ctx.config.grace_deadline;
        join_all(
            supervisors
                .into_values()
                .map(|handle| handle.stop(ctx, grace)),
        )
        .await;

        heartbeat_handle.await.ok();
        dispatcher_handle.await.ok();
        if let Some(handle) = coordinator_handle {
            handle.await.ok();
        }
        ctx.pool.drain(ctx).await;
        info!(ctx, "{}: worker stopped", self.worker_id);
        Ok(())
    }

    /// Starts supervisors for newly assigned accounts and stops the ones
    /// that moved away, changed generation or left the active states.
    async fn reconcile_assignments(
        &self,
        supervisors: &mut HashMap<AccountId, SupervisorHandle>,
    ) -> Result<()> {
        let ctx = &self.context;

        if ctx.config.mode == Mode::Single {
            // No coordinator: this worker owns every syncable account.
            ctx.sql
                .execute(
                    "UPDATE accounts SET assigned_worker=? \
                     WHERE state IN ('provisioning', 'active') \
                       AND (assigned_worker IS NULL OR assigned_worker != ?)",
                    (&self.worker_id, &self.worker_id),
                )
                .await?;
        }

        let mut assigned = Account::load_assigned(ctx, &self.worker_id).await?;
        let cap = ctx.config.accounts_per_worker;
        if assigned.len() > cap {
            warn!(
                ctx,
                "{}: assigned {} accounts, hosting only the first {}",
                self.worker_id,
                assigned.len(),
                cap
            );
            assigned.truncate(cap);
        }

        // Stop supervisors whose assignment vanished or was superseded.
        let mut stale: Vec<AccountId> = Vec::new();
        for (account_id, handle) in supervisors.iter() {
            match assigned.iter().find(|a| a.id == *account_id) {
                Some(account) if account.generation == handle.generation => (),
                _ => stale.push(*account_id),
            }
        }
        for account_id in stale {
            if let Some(handle) = supervisors.remove(&account_id) {
                info!(ctx, "{}: releasing {}", self.worker_id, account_id);
                handle.stop(ctx, ctx.config.grace_deadline).await;
            }
        }

        // Start the missing ones.
        for account in assigned {
            if supervisors.contains_key(&account.id) {
                continue;
            }
            info!(ctx, "{}: taking over {}", self.worker_id, account.id);
            let handle = supervisor::start(
                ctx,
                account,
                self.worker_id.clone(),
                &self.cancel,
            );
            supervisors.insert(handle.account_id, handle);
        }
        Ok(())
    }

    /// Snapshot of the worker's health for the operational surface.
    pub async fn stats(&self) -> Result<WorkerStats> {
        let ctx = &self.context;
        let accounts: i64 = ctx
            .sql
            .query_row(
                "SELECT COUNT(*) FROM accounts WHERE assigned_worker=?",
                (&self.worker_id,),
                |row| row.get(0),
            )
            .await?;
        let live_folders: i64 = ctx
            .sql
            .query_row(
                "SELECT COUNT(*) FROM folders WHERE state='live' AND account_id IN \
                 (SELECT id FROM accounts WHERE assigned_worker=?)",
                (&self.worker_id,),
                |row| row.get(0),
            )
            .await?;
        let pending_deliveries: i64 = ctx
            .sql
            .query_row(
                "SELECT COUNT(*) FROM webhook_deliveries WHERE state='pending'",
                [],
                |row| row.get(0),
            )
            .await?;
        Ok(WorkerStats {
            accounts: accounts as usize,
            live_folders: live_folders as usize,
            pending_deliveries: pending_deliveries as usize,
        })
    }
}

/// Writes the worker's lease row at every heartbeat interval.
async fn heartbeat_loop(context: Context, worker_id: String, cancel: CancellationToken) {
    loop {
        context
            .sql
            .execute(
                "INSERT INTO worker_leases (worker_id, heartbeat_at) VALUES (?, ?) \
                 ON CONFLICT(worker_id) DO UPDATE SET heartbeat_at=excluded.heartbeat_at",
                (&worker_id, time()),
            )
            .await
            .ok_or_log_msg(&context, "failed to write heartbeat");

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(context.config.heartbeat_interval) => (),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_utils::TestContext;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_heartbeat_writes_lease() {
        let t = TestContext::new().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        // One pass even when already cancelled.
        heartbeat_loop(t.ctx.clone(), "w1".to_string(), cancel).await;

        let heartbeat: i64 = t
            .ctx
            .sql
            .query_row(
                "SELECT heartbeat_at FROM worker_leases WHERE worker_id='w1'",
                [],
                |row| row.get(0),
            )
            .await
            .unwrap();
        assert!(heartbeat > 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_single_mode_claims_all_accounts() {
        let t = TestContext::new().await;
        let a = t.add_account("alice").await;
        let b = t.add_account("bob").await;
        t.ctx
            .sql
            .execute("UPDATE accounts SET state='active'", [])
            .await
            .unwrap();

        let worker = Worker::new(t.ctx.clone(), CancellationToken::new());
        let mut supervisors = HashMap::new();
        worker
            .reconcile_assignments(&mut supervisors)
            .await
            .unwrap();

        assert_eq!(supervisors.len(), 2);
        assert!(supervisors.contains_key(&a));
        assert!(supervisors.contains_key(&b));
        for account in [a, b] {
            let assigned: Option<String> = t
                .ctx
                .sql
                .query_get_value(
                    "SELECT assigned_worker FROM accounts WHERE id=?",
                    (account,),
                )
                .await
                .unwrap();
            assert_eq!(assigned.as_deref(), Some(t.ctx.config.worker_id.as_str()));
        }

        // Cleanup: the spawned supervisors try to reach 127.0.0.1 and fail;
        // stop them so the test ends promptly.
        for (_, handle) in supervisors {
            handle.stop(&t.ctx, Duration::from_secs(1)).await;
        }
    }
}
