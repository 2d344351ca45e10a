//! Cluster coordinator.
//!
//! Fleet membership is tracked through the worker lease table: every worker
//! heartbeats its row, and a lease missing two consecutive heartbeats marks
//! the worker dead. The coordinator itself is a leader-elected singleton on
//! a TTL lease row; any worker may attempt to acquire leadership.
//!
//! Accounts are placed with rendezvous (highest-random-weight) hashing over
//! the live workers, capped at ±10% of the mean load. Every reassignment
//! bumps the account's generation so a stale supervisor fences itself out.

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use anyhow::Result;

use crate::account::AccountId;
use crate::context::Context;
use crate::events::EventType;
use crate::log::LogExt;
use crate::tools::time;

/// Key of the coordinator leadership lease row.
const COORDINATOR_LEASE: &str = "!coordinator";

/// Load cap over the mean, per the bounded-load variant.
const LOAD_SLACK: f64 = 1.1;

/// Runs leadership election and rebalancing until cancelled.
///
/// Every worker in `cluster` mode runs this loop; only the current leader
/// performs rebalancing ticks.
pub(crate) async fn coordinator_loop(context: Context, worker_id: String, cancel: CancellationToken) {
    info!(context, "{}: starting coordinator loop", worker_id);
    let mut was_leader = false;
    loop {
        match try_acquire_leadership(&context, &worker_id).await {
            Ok(true) => {
                if !was_leader {
                    info!(context, "{}: acquired coordinator leadership", worker_id);
                    was_leader = true;
                }
                rebalance_tick(&context)
                    .await
                    .ok_or_log_msg(&context, "rebalance tick failed");
            }
            Ok(false) => {
                if was_leader {
                    info!(context, "{}: lost coordinator leadership", worker_id);
                    was_leader = false;
                }
            }
            Err(err) => {
                warn!(context, "leadership check failed: {:#}", err);
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(context.config.heartbeat_interval) => (),
        }
    }
    info!(context, "{}: coordinator loop stopped", worker_id);
}

/// Tries to take or renew the leadership lease. Returns true if this worker
/// is the leader afterwards.
pub(crate) async fn try_acquire_leadership(context: &Context, worker_id: &str) -> Result<bool> {
    let ttl = context.config.lease_ttl.as_secs() as i64;
    let worker_id = worker_id.to_string();
    context
        .sql
        .transaction(move |tx| {
            let now = time();
            let row: Option<(String, i64)> = rusqlite::OptionalExtension::optional(tx.query_row(
                "SELECT holder, heartbeat_at FROM worker_leases WHERE worker_id=?",
                (COORDINATOR_LEASE,),
                |row| Ok((row.get::<_, Option<String>>(0)?.unwrap_or_default(), row.get(1)?)),
            ))?;

            match row {
                None => {
                    tx.execute(
                        "INSERT INTO worker_leases (worker_id, heartbeat_at, holder) \
                         VALUES (?, ?, ?)",
                        (COORDINATOR_LEASE, now, &worker_id),
                    )?;
                    Ok(true)
                }
                Some((holder, heartbeat_at)) if holder == worker_id || heartbeat_at + ttl < now => {
                    tx.execute(
                        "UPDATE worker_leases SET holder=?, heartbeat_at=?, \
                         generation=generation+1 WHERE worker_id=?",
                        (&worker_id, now, COORDINATOR_LEASE),
                    )?;
                    Ok(true)
                }
                Some(_) => Ok(false),
            }
        })
        .await
}

/// One rebalancing pass: unassign accounts of dead workers and place every
/// unplaced account onto a live worker.
pub(crate) async fn rebalance_tick(context: &Context) -> Result<usize> {
    let dead_cutoff = time() - 2 * context.config.heartbeat_interval.as_secs() as i64;

    let live_workers: Vec<String> = context
        .sql
        .query_map(
            "SELECT worker_id FROM worker_leases \
             WHERE worker_id != ? AND heartbeat_at >= ? ORDER BY worker_id",
            (COORDINATOR_LEASE, dead_cutoff),
            |row| row.get(0),
        )
        .await?;
    if live_workers.is_empty() {
        return Ok(0);
    }

    let accounts: Vec<(AccountId, Option<String>)> = context
        .sql
        .query_map(
            "SELECT id, assigned_worker FROM accounts \
             WHERE state IN ('provisioning', 'active') ORDER BY id",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .await?;

    let moves = plan_rebalance(&accounts, &live_workers);
    let moved = moves.len();
    for (account_id, worker) in moves {
        context
            .sql
            .execute(
                "UPDATE accounts SET assigned_worker=?, generation=generation+1 WHERE id=?",
                (&worker, account_id),
            )
            .await?;
    }

    if moved > 0 {
        info!(context, "rebalanced {} accounts across {} workers", moved, live_workers.len());
        context.emit_event(EventType::AccountsRebalanced { moved });
    }
    Ok(moved)
}

/// Computes the set of reassignments. Pure so the placement policy can be
/// tested without a database.
///
/// Accounts already on a live worker stay put while that worker is under the
/// load cap; everything else is placed by rendezvous hashing onto the
/// highest-ranked live worker with remaining capacity.
pub(crate) fn plan_rebalance(
    accounts: &[(AccountId, Option<String>)],
    live_workers: &[String],
) -> Vec<(AccountId, String)> {
    use std::collections::HashMap;

    if live_workers.is_empty() || accounts.is_empty() {
        return Vec::new();
    }
    let mean = accounts.len() as f64 / live_workers.len() as f64;
    let cap = (mean * LOAD_SLACK).ceil().max(1.0) as usize;

    let mut load: HashMap<&str, usize> = HashMap::new();
    let mut unplaced: Vec<AccountId> = Vec::new();

    // Keep existing placements on live, under-cap workers to avoid churn.
    for (account_id, assigned) in accounts {
        let keep = assigned
            .as_deref()
            .filter(|w| live_workers.iter().any(|l| l == w))
            .filter(|w| load.get(w).copied().unwrap_or(0) < cap);
        match keep {
            Some(worker) => {
                *load.entry(worker).or_default() += 1;
            }
            None => unplaced.push(*account_id),
        }
    }

    let mut moves = Vec::new();
    for account_id in unplaced {
        let mut ranked: Vec<&String> = live_workers.iter().collect();
        ranked.sort_by_key(|worker| std::cmp::Reverse(rendezvous_rank(account_id, worker)));
        let target = ranked
            .iter()
            .find(|worker| load.get(worker.as_str()).copied().unwrap_or(0) < cap)
            .copied()
            // All workers at cap can only happen through rounding; fall
            // back to the top-ranked worker.
            .unwrap_or(ranked[0]);
        *load.entry(target.as_str()).or_default() += 1;
        moves.push((account_id, target.clone()));
    }
    moves
}

fn rendezvous_rank(account_id: AccountId, worker: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(worker.as_bytes());
    hasher.update(b"\x00");
    hasher.update(account_id.to_u32().to_be_bytes());
    let digest = hasher.finalize();
    u64::from_be_bytes(digest[..8].try_into().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestContext;

    fn ids(n: u32) -> Vec<(AccountId, Option<String>)> {
        (1..=n).map(|i| (AccountId::new(i), None)).collect()
    }

    #[test]
    fn test_plan_rebalance_is_balanced() {
        let workers = vec!["w1".to_string(), "w2".to_string(), "w3".to_string()];
        let moves = plan_rebalance(&ids(99), &workers);
        assert_eq!(moves.len(), 99);

        let mut load = std::collections::HashMap::new();
        for (_, worker) in &moves {
            *load.entry(worker.clone()).or_insert(0usize) += 1;
        }
        // Bounded at ±10% of the mean (33), i.e. at most 37 per worker.
        for (_, count) in load {
            assert!(count <= 37);
        }
    }

    #[test]
    fn test_plan_rebalance_is_stable_and_deterministic() {
        let workers = vec!["w1".to_string(), "w2".to_string()];
        let first = plan_rebalance(&ids(10), &workers);
        let second = plan_rebalance(&ids(10), &workers);
        assert_eq!(first, second);

        // Accounts already placed on live workers stay put.
        let placed: Vec<(AccountId, Option<String>)> = first
            .iter()
            .map(|(id, w)| (*id, Some(w.clone())))
            .collect();
        assert!(plan_rebalance(&placed, &workers).is_empty());
    }

    #[test]
    fn test_plan_rebalance_moves_accounts_of_dead_workers() {
        let workers = vec!["w2".to_string()];
        let accounts: Vec<(AccountId, Option<String>)> = (1..=4)
            .map(|i| (AccountId::new(i), Some("w1".to_string())))
            .collect();
        let moves = plan_rebalance(&accounts, &workers);
        assert_eq!(moves.len(), 4);
        assert!(moves.iter().all(|(_, w)| w == "w2"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_leadership_is_exclusive_until_expiry() {
        let t = TestContext::new().await;

        assert!(try_acquire_leadership(&t.ctx, "w1").await.unwrap());
        // Renewal by the holder works, a rival is rejected.
        assert!(try_acquire_leadership(&t.ctx, "w1").await.unwrap());
        assert!(!try_acquire_leadership(&t.ctx, "w2").await.unwrap());

        // After the TTL expires, the rival takes over.
        let expired = time() - t.ctx.config.lease_ttl.as_secs() as i64 - 1;
        t.ctx
            .sql
            .execute(
                "UPDATE worker_leases SET heartbeat_at=? WHERE worker_id=?",
                (expired, "!coordinator"),
            )
            .await
            .unwrap();
        assert!(try_acquire_leadership(&t.ctx, "w2").await.unwrap());
        assert!(!try_acquire_leadership(&t.ctx, "w1").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rebalance_assigns_and_bumps_generation() {
        let t = TestContext::new().await;
        let account_id = t.add_account("alice").await;
        t.ctx
            .sql
            .execute("UPDATE accounts SET state='active' WHERE id=?", (account_id,))
            .await
            .unwrap();

        // One live worker.
        t.ctx
            .sql
            .execute(
                "INSERT INTO worker_leases (worker_id, heartbeat_at) VALUES ('w1', ?)",
                (time(),),
            )
            .await
            .unwrap();

        let moved = rebalance_tick(&t.ctx).await.unwrap();
        assert_eq!(moved, 1);
        let (worker, generation): (Option<String>, i64) = t
            .ctx
            .sql
            .query_row(
                "SELECT assigned_worker, generation FROM accounts WHERE id=?",
                (account_id,),
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .await
            .unwrap();
        assert_eq!(worker.as_deref(), Some("w1"));
        assert_eq!(generation, 1);

        // A second tick with an unchanged fleet moves nothing.
        assert_eq!(rebalance_tick(&t.ctx).await.unwrap(), 0);
    }
}
