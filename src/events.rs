//! # Events specification.
//!
//! The sync engine reports its progress through an in-process event channel.
//! The daemon binary drains the channel and forwards events to the process
//! log; embedders may attach their own consumer instead.

use anyhow::Result;
use tokio::sync::Mutex;

use crate::account::{AccountId, AccountState};
use crate::folder::FolderSyncState;

/// Event channel.
#[derive(Debug, Clone)]
pub struct Events {
    /// Unused receiver to prevent the channel from closing.
    _receiver: async_broadcast::InactiveReceiver<Event>,

    /// Sender side of the event channel.
    sender: async_broadcast::Sender<Event>,
}

impl Default for Events {
    fn default() -> Self {
        Self::new()
    }
}

impl Events {
    /// Creates a new event channel.
    pub fn new() -> Self {
        let (mut sender, _receiver) = async_broadcast::broadcast(1_000);

        // We only keep this receiver around
        // to prevent the channel from closing.
        let _receiver = _receiver.deactivate();

        // Remove oldest event on overflow.
        sender.set_overflow(true);

        Self { _receiver, sender }
    }

    /// Emits an event into the event channel.
    ///
    /// If the channel is full, deletes the oldest event first.
    pub fn emit(&self, event: Event) {
        self.sender.try_broadcast(event).ok();
    }

    /// Creates an event emitter.
    pub fn get_emitter(&self) -> EventEmitter {
        EventEmitter(Mutex::new(self.sender.new_receiver()))
    }
}

/// A receiver of events from a [`Context`].
///
/// [`Context`]: crate::context::Context
#[derive(Debug)]
pub struct EventEmitter(Mutex<async_broadcast::Receiver<Event>>);

impl EventEmitter {
    /// Async recv of an event. Returns `None` if the `Sender` has been dropped.
    pub async fn recv(&self) -> Option<Event> {
        let mut lock = self.0.lock().await;
        loop {
            match lock.recv().await {
                Err(async_broadcast::RecvError::Overflowed(_)) => {
                    // Some events have been lost,
                    // but the channel is not closed.
                    continue;
                }
                Err(async_broadcast::RecvError::Closed) => return None,
                Ok(event) => return Some(event),
            }
        }
    }

    /// Tries to receive an event without blocking.
    ///
    /// Returns an error if no events are available for reception
    /// or if the receiver mutex is locked by a concurrent call to [`recv`].
    ///
    /// [`recv`]: Self::recv
    pub fn try_recv(&self) -> Result<Event> {
        let mut lock = self.0.try_lock()?;
        loop {
            match lock.try_recv() {
                Err(async_broadcast::TryRecvError::Overflowed(_)) => {
                    continue;
                }
                res @ (Err(async_broadcast::TryRecvError::Empty)
                | Err(async_broadcast::TryRecvError::Closed)
                | Ok(_)) => return Ok(res?),
            }
        }
    }
}

/// The event emitted through an [`EventEmitter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// The event payload.
    pub typ: EventType,
}

/// Event payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventType {
    /// The library-user may write an informational string to the log.
    Info(String),

    /// The library-user may write a warning string to the log.
    Warning(String),

    /// The library-user should write an error string to the log.
    Error(String),

    /// An account changed its lifecycle state.
    AccountStateChanged {
        account_id: AccountId,
        state: AccountState,
    },

    /// A folder changed its sync state.
    FolderStateChanged {
        account_id: AccountId,
        folder: String,
        state: FolderSyncState,
    },

    /// New messages were indexed in a folder.
    NewMessages {
        account_id: AccountId,
        folder: String,
        count: usize,
    },

    /// A webhook delivery reached its `delivered` state.
    WebhookDelivered { delivery_id: i64, attempts: u32 },

    /// A webhook delivery reached a terminal failure state.
    ///
    /// This is the internal alert required for `permanently_failed` and
    /// `expired` deliveries; later events to the same subscription are not
    /// blocked by it.
    WebhookGivenUp { delivery_id: i64, attempts: u32 },

    /// The coordinator moved accounts between workers.
    AccountsRebalanced { moved: usize },
}
