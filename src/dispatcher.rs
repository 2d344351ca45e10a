//! Webhook dispatcher.
//!
//! Polls the durable delivery queue and POSTs each due delivery to its
//! subscription endpoint with an HMAC signature of the raw body. Retry
//! scheduling is persisted on the row, so a dispatcher restart never loses
//! or duplicates an attempt that reached a terminal state.

use std::time::Duration;

use anyhow::{Context as _, Result};
use futures::future::join_all;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::events::EventType;
use crate::log::LogExt;
use crate::tools::{backoff_ceiling, time};
use crate::webhook::{sign_body, build_body, Delivery, DeliveryState, Subscription};

/// Deliveries attempted per poll round; pairs beyond this wait a round.
const BATCH_LIMIT: usize = 32;

/// How one HTTP outcome is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// HTTP 2xx.
    Delivered,

    /// HTTP 4xx other than 408/429: the request itself is bad and a retry
    /// can never succeed.
    Permanent,

    /// 5xx, 408, 429 and network errors.
    Retry,
}

pub(crate) fn classify_status(status: u16) -> Disposition {
    match status {
        200..=299 => Disposition::Delivered,
        408 | 429 => Disposition::Retry,
        400..=499 => Disposition::Permanent,
        _ => Disposition::Retry,
    }
}

/// Computes the delay before retry number `attempts`, in seconds.
///
/// The schedule is the backoff ceiling (base 30 s, factor 2, cap 1 h) plus
/// up to 25% jitter so that retries of many deliveries do not align.
pub(crate) fn retry_delay(context: &Context, attempts: u32) -> Duration {
    let ceiling = backoff_ceiling(
        attempts.saturating_sub(1),
        context.config.webhook_backoff_base,
        context.config.webhook_backoff_cap,
    );
    let jitter = rand::thread_rng().gen_range(0..=ceiling.as_secs() / 4);
    ceiling + Duration::from_secs(jitter)
}

/// Runs the dispatcher until cancelled.
///
/// `worker` scopes the queue to accounts assigned to this worker so that at
/// most one dispatcher in the fleet touches a given (account, subscription)
/// pair.
pub(crate) async fn dispatcher_loop(
    context: Context,
    worker: Option<String>,
    cancel: CancellationToken,
) {
    info!(context, "starting webhook dispatcher");
    loop {
        let dispatched = dispatch_round(&context, worker.as_deref())
            .await
            .ok_or_log_msg(&context, "webhook dispatch round failed")
            .unwrap_or(0);

        // Drain back-to-back while there is work; otherwise poll.
        if dispatched == 0 {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(context.config.poll_interval) => (),
            }
        } else if cancel.is_cancelled() {
            break;
        }
    }
    info!(context, "shutting down webhook dispatcher");
}

/// Attempts every due delivery once. Returns the number of attempts made.
pub(crate) async fn dispatch_round(context: &Context, worker: Option<&str>) -> Result<usize> {
    let due = Delivery::next_due(context, worker, BATCH_LIMIT).await?;
    if due.is_empty() {
        return Ok(0);
    }
    let count = due.len();

    // Different pairs are independent; attempt them concurrently. Within a
    // pair, `next_due` only ever hands out the oldest pending delivery.
    join_all(due.into_iter().map(|delivery| async move {
        attempt_delivery(context, &delivery)
            .await
            .ok_or_log_msg(context, "webhook attempt failed");
    }))
    .await;

    Ok(count)
}

/// Makes one POST attempt for the delivery and persists the outcome.
pub(crate) async fn attempt_delivery(context: &Context, delivery: &Delivery) -> Result<()> {
    let subscription = match Subscription::load(context, delivery.subscription_id).await? {
        Some(subscription) if subscription.enabled => subscription,
        _ => {
            // The tenant removed or disabled the endpoint under us.
            delivery
                .mark_failed(
                    context,
                    DeliveryState::PermanentlyFailed,
                    delivery.attempts,
                    None,
                    "subscription removed or disabled",
                )
                .await?;
            return Ok(());
        }
    };

    let body = build_body(delivery, &subscription.app_id)?;
    let signature = sign_body(&subscription.secret, &body);
    let attempts = delivery.attempts + 1;

    let response = context
        .http
        .post(&subscription.url)
        .header("Content-Type", "application/json")
        .header("X-Signature", signature)
        .body(body)
        .send()
        .await;

    match response {
        Ok(response) => {
            let status = response.status().as_u16();
            match classify_status(status) {
                Disposition::Delivered => {
                    delivery.mark_delivered(context, attempts, status).await?;
                    context.emit_event(EventType::WebhookDelivered {
                        delivery_id: delivery.id,
                        attempts,
                    });
                }
                Disposition::Permanent => {
                    delivery
                        .mark_failed(
                            context,
                            DeliveryState::PermanentlyFailed,
                            attempts,
                            Some(status),
                            &format!("HTTP {status}"),
                        )
                        .await?;
                    give_up(context, delivery, attempts);
                }
                Disposition::Retry => {
                    schedule_or_expire(
                        context,
                        delivery,
                        attempts,
                        Some(status),
                        &format!("HTTP {status}"),
                    )
                    .await?;
                }
            }
        }
        Err(err) => {
            schedule_or_expire(context, delivery, attempts, None, &format!("{err:#}")).await?;
        }
    }
    Ok(())
}

async fn schedule_or_expire(
    context: &Context,
    delivery: &Delivery,
    attempts: u32,
    status: Option<u16>,
    error: &str,
) -> Result<()> {
    if attempts >= context.config.webhook_max_attempts {
        delivery
            .mark_failed(context, DeliveryState::Expired, attempts, status, error)
            .await?;
        give_up(context, delivery, attempts);
        return Ok(());
    }
    let delay = retry_delay(context, attempts);
    info!(
        context,
        "delivery {} attempt {} failed ({}), retrying in {}",
        delivery.id,
        attempts,
        error,
        crate::tools::duration_to_str(delay),
    );
    delivery
        .schedule_retry(context, attempts, time() + delay.as_secs() as i64, status, error)
        .await
}

fn give_up(context: &Context, delivery: &Delivery, attempts: u32) {
    warn!(
        context,
        "giving up on delivery {} after {} attempts",
        delivery.id,
        attempts
    );
    context.emit_event(EventType::WebhookGivenUp {
        delivery_id: delivery.id,
        attempts,
    });
}

/// Sends a probe event to a subscription endpoint, bypassing the queue.
///
/// Used by operators to verify that a freshly registered endpoint is
/// reachable and checks the signature correctly.
pub async fn send_test_webhook(context: &Context, subscription_id: i64) -> Result<bool> {
    let subscription = Subscription::load(context, subscription_id)
        .await?
        .context("no such subscription")?;

    let body = serde_json::to_vec(&serde_json::json!({
        "id": 0,
        "type": "test",
        "created_at": time(),
        "application_id": subscription.app_id,
        "object": { "probe": true },
    }))?;
    let signature = sign_body(&subscription.secret, &body);

    let response = context
        .http
        .post(&subscription.url)
        .header("Content-Type", "application/json")
        .header("X-Signature", signature)
        .body(body)
        .send()
        .await;
    Ok(matches!(response, Ok(r) if r.status().is_success()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestContext;

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(200), Disposition::Delivered);
        assert_eq!(classify_status(204), Disposition::Delivered);
        assert_eq!(classify_status(400), Disposition::Permanent);
        assert_eq!(classify_status(404), Disposition::Permanent);
        assert_eq!(classify_status(408), Disposition::Retry);
        assert_eq!(classify_status(429), Disposition::Retry);
        assert_eq!(classify_status(500), Disposition::Retry);
        assert_eq!(classify_status(503), Disposition::Retry);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_retry_delay_schedule() {
        let t = TestContext::new().await;

        // Attempts 1, 2, 3 retry after roughly 30, 60, 120 seconds.
        for (attempts, expected_secs) in [(1u32, 30u64), (2, 60), (3, 120)] {
            let delay = retry_delay(&t.ctx, attempts);
            assert!(delay >= Duration::from_secs(expected_secs));
            assert!(delay <= Duration::from_secs(expected_secs + expected_secs / 4));
        }

        // And the schedule is capped at one hour (plus jitter).
        let delay = retry_delay(&t.ctx, 100);
        assert!(delay >= Duration::from_secs(3600));
        assert!(delay <= Duration::from_secs(3600 + 900));
    }
}
