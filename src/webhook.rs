//! Webhook subscriptions and the durable delivery queue.
//!
//! Every change notification becomes one delivery row per matching
//! subscription, written in the same transaction as the index mutation that
//! caused it. The dispatcher later turns pending rows into signed HTTP POSTs;
//! the row id doubles as the per-account event sequence.

use std::fmt;

use anyhow::Result;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

use crate::account::AccountId;
use crate::context::Context;
use crate::tools::time;

/// A named event kind a tenant may subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    MessageCreated,
    MessageUpdated,
    FolderUpdated,
    AccountConnected,
    AccountInvalidCredentials,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::MessageCreated => "message.created",
            Trigger::MessageUpdated => "message.updated",
            Trigger::FolderUpdated => "folder.updated",
            Trigger::AccountConnected => "account.connected",
            Trigger::AccountInvalidCredentials => "account.invalid_credentials",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "message.created" => Ok(Trigger::MessageCreated),
            "message.updated" => Ok(Trigger::MessageUpdated),
            "folder.updated" => Ok(Trigger::FolderUpdated),
            "account.connected" => Ok(Trigger::AccountConnected),
            "account.invalid_credentials" => Ok(Trigger::AccountInvalidCredentials),
            other => Err(anyhow::anyhow!("unknown trigger {other:?}")),
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A tenant-registered webhook endpoint.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: i64,
    pub app_id: String,
    pub url: String,
    pub secret: String,
    pub triggers: Vec<Trigger>,
    pub enabled: bool,
}

impl Subscription {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Subscription> {
        let triggers: String = row.get(4)?;
        Ok(Subscription {
            id: row.get(0)?,
            app_id: row.get(1)?,
            url: row.get(2)?,
            secret: row.get(3)?,
            triggers: triggers
                .split(',')
                .filter_map(|t| Trigger::from_str(t.trim()).ok())
                .collect(),
            enabled: row.get::<_, i64>(5)? != 0,
        })
    }

    /// Registers a subscription. Used by the provisioning layer and tests.
    pub async fn create(
        context: &Context,
        app_id: &str,
        url: &str,
        secret: &str,
        triggers: &[Trigger],
    ) -> Result<i64> {
        let triggers = triggers
            .iter()
            .map(|t| t.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let id = context
            .sql
            .insert(
                "INSERT INTO webhook_subscriptions (app_id, url, secret, triggers) \
                 VALUES (?, ?, ?, ?)",
                (app_id, url, secret, triggers),
            )
            .await?;
        Ok(id)
    }

    /// Loads a subscription by id.
    pub async fn load(context: &Context, id: i64) -> Result<Option<Subscription>> {
        context
            .sql
            .query_row_optional(
                "SELECT id, app_id, url, secret, triggers, enabled \
                 FROM webhook_subscriptions WHERE id=?",
                (id,),
                Subscription::from_row,
            )
            .await
    }

    /// Returns the enabled subscriptions of an application that subscribe to
    /// the given trigger. Runs on a plain connection so it can participate
    /// in the enqueue transaction.
    pub(crate) fn find_matching(
        conn: &rusqlite::Connection,
        app_id: &str,
        trigger: Trigger,
    ) -> Result<Vec<Subscription>> {
        let mut stmt = conn.prepare(
            "SELECT id, app_id, url, secret, triggers, enabled \
             FROM webhook_subscriptions WHERE app_id=? AND enabled=1",
        )?;
        let subscriptions = stmt
            .query_map((app_id,), Subscription::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(subscriptions
            .into_iter()
            .filter(|s| s.triggers.contains(&trigger))
            .collect())
    }
}

/// Terminal and non-terminal delivery states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Delivered,
    Expired,
    PermanentlyFailed,
}

impl DeliveryState {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryState::Pending => "pending",
            DeliveryState::Delivered => "delivered",
            DeliveryState::Expired => "expired",
            DeliveryState::PermanentlyFailed => "permanently_failed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(DeliveryState::Pending),
            "delivered" => Ok(DeliveryState::Delivered),
            "expired" => Ok(DeliveryState::Expired),
            "permanently_failed" => Ok(DeliveryState::PermanentlyFailed),
            other => Err(anyhow::anyhow!("unknown delivery state {other:?}")),
        }
    }

    /// A delivery in a terminal state is never retried.
    pub fn is_terminal(self) -> bool {
        !matches!(self, DeliveryState::Pending)
    }
}

/// One (subscription, event) pair on the durable queue.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: i64,
    pub subscription_id: i64,
    pub account_id: AccountId,
    pub trigger: Trigger,

    /// The trigger-specific `object` body, frozen at enqueue time.
    pub payload: String,

    pub attempts: u32,
    pub next_attempt_at: i64,
    pub state: DeliveryState,
    pub last_status: Option<u16>,
    pub last_error: Option<String>,
    pub created_at: i64,
}

const DELIVERY_COLUMNS: &str = "id, subscription_id, account_id, trigger_kind, payload, \
                                attempts, next_attempt_at, state, last_status, last_error, \
                                created_at";

impl Delivery {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Delivery> {
        let trigger: String = row.get(3)?;
        let state: String = row.get(7)?;
        Ok(Delivery {
            id: row.get(0)?,
            subscription_id: row.get(1)?,
            account_id: row.get(2)?,
            trigger: Trigger::from_str(&trigger)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(e.into()))?,
            payload: row.get(4)?,
            attempts: row.get(5)?,
            next_attempt_at: row.get(6)?,
            state: DeliveryState::from_str(&state)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(e.into()))?,
            last_status: row.get(8)?,
            last_error: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    /// Loads a delivery by id.
    pub async fn load(context: &Context, id: i64) -> Result<Option<Delivery>> {
        context
            .sql
            .query_row_optional(
                &format!("SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries WHERE id=?"),
                (id,),
                Delivery::from_row,
            )
            .await
    }

    /// Returns the due deliveries that are each the oldest pending one of
    /// their (account, subscription) pair: the dispatcher keeps at most one
    /// delivery of a pair in flight and a later event never overtakes an
    /// earlier pending one.
    ///
    /// With `worker` set, only deliveries of accounts assigned to that
    /// worker are returned, so that exactly one dispatcher in the fleet owns
    /// each pair.
    pub(crate) async fn next_due(
        context: &Context,
        worker: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Delivery>> {
        let worker_filter = match worker {
            Some(_) => {
                "AND d.account_id IN (SELECT id FROM accounts WHERE assigned_worker=?2)"
            }
            None => "",
        };
        let query = format!(
            "SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries d \
             WHERE state='pending' AND next_attempt_at<=?1 \
               AND id=(SELECT MIN(id) FROM webhook_deliveries d2 \
                       WHERE d2.state='pending' \
                         AND d2.account_id=d.account_id \
                         AND d2.subscription_id=d.subscription_id) \
               {worker_filter} \
             ORDER BY id LIMIT {limit}"
        );
        match worker {
            Some(worker) => {
                context
                    .sql
                    .query_map(&query, (time(), worker), Delivery::from_row)
                    .await
            }
            None => {
                context
                    .sql
                    .query_map(&query, (time(),), Delivery::from_row)
                    .await
            }
        }
    }

    /// Marks the delivery delivered.
    pub(crate) async fn mark_delivered(
        &self,
        context: &Context,
        attempts: u32,
        status: u16,
    ) -> Result<()> {
        context
            .sql
            .execute(
                "UPDATE webhook_deliveries \
                 SET state='delivered', attempts=?, last_status=?, last_error=NULL \
                 WHERE id=? AND state='pending'",
                (attempts, status, self.id),
            )
            .await?;
        Ok(())
    }

    /// Marks the delivery terminally failed.
    pub(crate) async fn mark_failed(
        &self,
        context: &Context,
        state: DeliveryState,
        attempts: u32,
        status: Option<u16>,
        error: &str,
    ) -> Result<()> {
        context
            .sql
            .execute(
                "UPDATE webhook_deliveries \
                 SET state=?, attempts=?, last_status=?, last_error=? \
                 WHERE id=? AND state='pending'",
                (state.as_str(), attempts, status, error, self.id),
            )
            .await?;
        Ok(())
    }

    /// Schedules the next retry.
    pub(crate) async fn schedule_retry(
        &self,
        context: &Context,
        attempts: u32,
        next_attempt_at: i64,
        status: Option<u16>,
        error: &str,
    ) -> Result<()> {
        context
            .sql
            .execute(
                "UPDATE webhook_deliveries \
                 SET attempts=?, next_attempt_at=?, last_status=?, last_error=? \
                 WHERE id=? AND state='pending'",
                (attempts, next_attempt_at, status, error, self.id),
            )
            .await?;
        Ok(())
    }
}

/// Enqueues one event for every matching subscription of the application.
///
/// Runs on an open connection so that callers can enqueue in the same
/// transaction that commits the index mutation, which is what makes the
/// enqueue exactly-once. Returns the number of deliveries created.
pub(crate) fn enqueue_event(
    conn: &rusqlite::Connection,
    app_id: &str,
    account_id: AccountId,
    trigger: Trigger,
    object: &serde_json::Value,
) -> Result<usize> {
    let subscriptions = Subscription::find_matching(conn, app_id, trigger)?;
    let payload = serde_json::to_string(object)?;
    let now = time();
    for subscription in &subscriptions {
        conn.execute(
            "INSERT INTO webhook_deliveries \
             (subscription_id, account_id, trigger_kind, payload, next_attempt_at, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
            (
                subscription.id,
                account_id,
                trigger.as_str(),
                &payload,
                now,
                now,
            ),
        )?;
    }
    Ok(subscriptions.len())
}

/// The JSON envelope POSTed to the tenant endpoint.
#[derive(Debug, Serialize)]
pub struct WebhookPayload<'a> {
    /// Delivery id; doubles as the per-account sequence number.
    pub id: i64,

    /// Trigger kind, e.g. `message.created`.
    #[serde(rename = "type")]
    pub typ: &'a str,

    /// Unix seconds of event creation.
    pub created_at: i64,

    pub application_id: &'a str,

    /// Trigger-specific body.
    pub object: serde_json::Value,
}

/// Builds the raw request body for a delivery.
///
/// All envelope fields are immutable row attributes, so retries always send
/// a byte-identical body.
pub(crate) fn build_body(delivery: &Delivery, app_id: &str) -> Result<Vec<u8>> {
    let payload = WebhookPayload {
        id: delivery.id,
        typ: delivery.trigger.as_str(),
        created_at: delivery.created_at,
        application_id: app_id,
        object: serde_json::from_str(&delivery.payload)?,
    };
    Ok(serde_json::to_vec(&payload)?)
}

/// Computes the `X-Signature` header value: HMAC-SHA256 of the raw body
/// under the subscription secret, hex-encoded.
pub(crate) fn sign_body(secret: &str, body: &[u8]) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestContext;

    #[test]
    fn test_sign_body_known_vector() {
        // HMAC-SHA256("key", "The quick brown fox jumps over the lazy dog")
        let signature = sign_body("key", b"The quick brown fox jumps over the lazy dog");
        assert_eq!(
            signature,
            "sha256=f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_enqueue_respects_trigger_filter() {
        let t = TestContext::new().await;
        let account_id = t.add_account("alice").await;

        Subscription::create(
            &t.ctx,
            "app",
            "https://example.org/hook",
            "s3cr3t",
            &[Trigger::MessageCreated],
        )
        .await
        .unwrap();
        Subscription::create(
            &t.ctx,
            "app",
            "https://example.org/other",
            "s3cr3t",
            &[Trigger::FolderUpdated],
        )
        .await
        .unwrap();

        let object = serde_json::json!({"uid": 101});
        let created = t
            .ctx
            .sql
            .call(|conn| enqueue_event(conn, "app", account_id, Trigger::MessageCreated, &object))
            .await
            .unwrap();
        assert_eq!(created, 1);

        let due = Delivery::next_due(&t.ctx, None, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].trigger, Trigger::MessageCreated);
        assert_eq!(due[0].state, DeliveryState::Pending);
        assert_eq!(due[0].attempts, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_next_due_serializes_per_pair() {
        let t = TestContext::new().await;
        let account_id = t.add_account("alice").await;
        Subscription::create(
            &t.ctx,
            "app",
            "https://example.org/hook",
            "s3cr3t",
            &[Trigger::MessageCreated],
        )
        .await
        .unwrap();

        for uid in [101, 102, 103] {
            let object = serde_json::json!({ "uid": uid });
            t.ctx
                .sql
                .call(|conn| {
                    enqueue_event(conn, "app", account_id, Trigger::MessageCreated, &object)
                })
                .await
                .unwrap();
        }

        // Only the oldest delivery of the pair is handed out.
        let due = Delivery::next_due(&t.ctx, None, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        let first_id = due[0].id;

        due[0].mark_delivered(&t.ctx, 1, 200).await.unwrap();
        let due = Delivery::next_due(&t.ctx, None, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert!(due[0].id > first_id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_terminal_states_are_final() {
        let t = TestContext::new().await;
        let account_id = t.add_account("alice").await;
        Subscription::create(
            &t.ctx,
            "app",
            "https://example.org/hook",
            "s3cr3t",
            &[Trigger::MessageCreated],
        )
        .await
        .unwrap();
        let object = serde_json::json!({"uid": 1});
        t.ctx
            .sql
            .call(|conn| enqueue_event(conn, "app", account_id, Trigger::MessageCreated, &object))
            .await
            .unwrap();

        let due = Delivery::next_due(&t.ctx, None, 10).await.unwrap();
        due[0]
            .mark_failed(&t.ctx, DeliveryState::PermanentlyFailed, 1, Some(404), "404")
            .await
            .unwrap();

        // A terminal delivery never becomes due again, and a later event to
        // the same subscription is not blocked by it.
        assert!(Delivery::next_due(&t.ctx, None, 10).await.unwrap().is_empty());
        t.ctx
            .sql
            .call(|conn| enqueue_event(conn, "app", account_id, Trigger::MessageCreated, &object))
            .await
            .unwrap();
        assert_eq!(Delivery::next_due(&t.ctx, None, 10).await.unwrap().len(), 1);
    }
}
