use std::time::Duration;

use anyhow::{Context as _, Result};
use async_channel::Receiver;
use async_imap::extensions::idle::IdleResponse;
use futures_lite::FutureExt;

use super::session::Session;
use crate::context::Context;

/// How an IDLE wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IdleOutcome {
    /// The server pushed a change notification.
    NewData,

    /// The renewal ceiling elapsed without server data.
    Timeout,

    /// The wait was interrupted locally, e.g. by shutdown.
    Interrupted,
}

impl Session {
    /// Waits inside IMAP IDLE until the server notifies, `timeout` elapses or
    /// the interrupt channel fires. The folder to watch must already be
    /// selected.
    ///
    /// Consumes and returns the session: a failed DONE handshake leaves the
    /// connection in an unusable state, so it must not be handed back.
    pub(crate) async fn idle(
        self,
        context: &Context,
        idle_interrupt_receiver: Receiver<()>,
        folder: &str,
        timeout: Duration,
    ) -> Result<(Self, IdleOutcome)> {
        use futures::future::FutureExt as _;

        let Session {
            inner,
            capabilities,
            selected_folder,
            selected_mailbox,
        } = self;

        if let Ok(()) = idle_interrupt_receiver.try_recv() {
            info!(context, "skip IDLE in {folder:?} because we got interrupt");
            return Ok((
                Session {
                    inner,
                    capabilities,
                    selected_folder,
                    selected_mailbox,
                },
                IdleOutcome::Interrupted,
            ));
        }

        let mut handle = inner.idle();
        handle
            .init()
            .await
            .with_context(|| format!("IMAP IDLE protocol failed to init in folder {folder:?}"))?;

        let (idle_wait, interrupt) = handle.wait_with_timeout(timeout);

        enum Event {
            IdleResponse(IdleResponse),
            Interrupt,
        }

        info!(
            context,
            "IDLE entering wait-on-remote state in folder {folder:?}."
        );
        let fut = idle_wait.map(|ev| ev.map(Event::IdleResponse)).race(async {
            idle_interrupt_receiver.recv().await.ok();

            // Cancel the IDLE wait properly so that DONE is sent below.
            drop(interrupt);

            Ok(Event::Interrupt)
        });

        let outcome = match fut.await {
            Ok(Event::IdleResponse(IdleResponse::NewData(x))) => {
                info!(context, "{folder:?}: IDLE has NewData {x:?}");
                IdleOutcome::NewData
            }
            Ok(Event::IdleResponse(IdleResponse::Timeout)) => {
                info!(context, "{folder:?}: IDLE timeout, renewing.");
                IdleOutcome::Timeout
            }
            Ok(Event::IdleResponse(IdleResponse::ManualInterrupt)) => {
                info!(context, "{folder:?}: IDLE wait was interrupted manually.");
                IdleOutcome::Interrupted
            }
            Ok(Event::Interrupt) => {
                info!(context, "{folder:?}: IDLE wait was interrupted.");
                IdleOutcome::Interrupted
            }
            Err(err) => {
                // The connection dropped inside IDLE; the session is broken.
                return Err(anyhow::Error::new(err)
                    .context(format!("{folder}: IDLE wait errored, dropping session")));
            }
        };

        let inner = tokio::time::timeout(Duration::from_secs(15), handle.done())
            .await
            .with_context(|| format!("{folder}: IMAP IDLE protocol timed out"))?
            .with_context(|| format!("{folder}: IMAP IDLE failed"))?;

        Ok((
            Session {
                inner,
                capabilities,
                selected_folder,
                selected_mailbox,
            },
            outcome,
        ))
    }
}
