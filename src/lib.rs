//! # mailhook
//!
//! A headless, multi-tenant email ingestion engine: it keeps persistent IMAP
//! sessions against remote mailboxes, detects new messages in near real time
//! and delivers signed change notifications to tenant-registered webhook
//! endpoints.
//!
//! The crate is the sync core only. Account provisioning, the tenant HTTP
//! API and schema migrations live outside and talk to the core through the
//! shared database; the [`Worker`] is the embedding surface, the
//! `mailhook-daemon` binary the reference embedding.

#![forbid(unsafe_code)]
#![warn(
    clippy::correctness,
    missing_debug_implementations,
    clippy::wildcard_imports
)]

#[macro_use]
mod log;

pub mod account;
pub mod config;
pub mod context;
mod coordinator;
pub mod dispatcher;
pub mod events;
pub mod folder;
mod http;
mod imap;
mod message;
mod net;
mod pool;
mod ratelimit;
mod sql;
mod supervisor;
mod sync;
mod threading;
pub mod tools;
pub mod webhook;
pub mod worker;

#[cfg(test)]
mod test_utils;

pub use crate::config::{Config, Mode};
pub use crate::context::Context;
pub use crate::events::{Event, EventEmitter, EventType};
pub use crate::worker::{Worker, WorkerStats};
