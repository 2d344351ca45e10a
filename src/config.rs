//! # Engine configuration.
//!
//! All knobs are read once from the environment at startup and passed around
//! by handle; there is no module-level mutable state. Every variable is
//! prefixed with `MAILHOOK_`.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, Result};

/// Process mode, see the `single` and `cluster` operational modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// One in-process worker which claims every active account; no
    /// coordinator. Meant for development and small deployments.
    Single,

    /// One of N worker processes plus coordinator leadership election.
    Cluster,
}

impl Mode {
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "single" => Ok(Mode::Single),
            "cluster" => Ok(Mode::Cluster),
            other => Err(anyhow::anyhow!("invalid mode {other:?}")),
        }
    }
}

/// Engine configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the SQLite database file.
    pub db_path: PathBuf,

    /// Process mode.
    pub mode: Mode,

    /// Stable identifier of this worker process within the fleet.
    pub worker_id: String,

    /// Maximum number of account supervisors hosted by one worker.
    pub accounts_per_worker: usize,

    /// Maximum number of parallel IMAP sessions opened for one account.
    ///
    /// Commercial servers commonly cap simultaneous sessions per user at
    /// around 15; folder sync units multiplex over this many.
    pub sessions_per_account: usize,

    /// Maximum number of concurrent sessions against one IMAP host.
    pub sessions_per_host: usize,

    /// Maximum number of new connections per minute against one IMAP host.
    pub connects_per_minute_per_host: f64,

    /// Number of messages fetched per backfill batch.
    pub backfill_batch_size: u32,

    /// Backfill horizon: only the most recent N messages of a folder are
    /// enumerated on first sync. `None` backfills all history. A per-account
    /// override may be stored on the account row.
    pub backfill_horizon: Option<u32>,

    /// Maximum number of folders tracked per account.
    pub folders_per_account: usize,

    /// Maximum webhook delivery attempts before a delivery expires.
    pub webhook_max_attempts: u32,

    /// Base delay of the webhook retry schedule.
    pub webhook_backoff_base: Duration,

    /// Ceiling of the webhook retry schedule.
    pub webhook_backoff_cap: Duration,

    /// Timeout of a single webhook HTTP request.
    pub webhook_timeout: Duration,

    /// Interval between worker heartbeats.
    pub heartbeat_interval: Duration,

    /// Age after which a worker lease is considered dead.
    pub lease_ttl: Duration,

    /// Timeout applied to every IMAP command.
    pub imap_timeout: Duration,

    /// How long a single IDLE waits before it is renewed. Kept under the
    /// 29-minute ceiling of RFC 2177.
    pub idle_interval: Duration,

    /// Idle sessions older than this are discarded instead of reused.
    pub session_ttl: Duration,

    /// Interval between polls of the assignment and delivery tables.
    pub poll_interval: Duration,

    /// How long a graceful shutdown waits for in-flight work.
    pub grace_deadline: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("mailhook.db"),
            mode: Mode::Single,
            worker_id: format!("worker-{}", std::process::id()),
            accounts_per_worker: 200,
            sessions_per_account: 4,
            sessions_per_host: 50,
            connects_per_minute_per_host: 60.0,
            backfill_batch_size: 200,
            backfill_horizon: None,
            folders_per_account: 15,
            webhook_max_attempts: 12,
            webhook_backoff_base: Duration::from_secs(30),
            webhook_backoff_cap: Duration::from_secs(3600),
            webhook_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(5),
            lease_ttl: Duration::from_secs(15),
            imap_timeout: Duration::from_secs(60),
            idle_interval: Duration::from_secs(28 * 60),
            session_ttl: Duration::from_secs(10 * 60),
            poll_interval: Duration::from_secs(2),
            grace_deadline: Duration::from_secs(20),
        }
    }
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(name) {
        Some(v) => {
            let parsed = v
                .parse()
                .with_context(|| format!("cannot parse {name}={v:?}"))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

fn secs_var(name: &str) -> Result<Option<Duration>> {
    Ok(parse_var::<u64>(name)?.map(Duration::from_secs))
}

impl Config {
    /// Reads configuration from `MAILHOOK_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Some(path) = var("MAILHOOK_DB") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(mode) = var("MAILHOOK_MODE") {
            config.mode = Mode::from_str(&mode)?;
        }
        if let Some(id) = var("MAILHOOK_WORKER_ID") {
            config.worker_id = id;
        }
        if let Some(v) = parse_var("MAILHOOK_ACCOUNTS_PER_WORKER")? {
            config.accounts_per_worker = v;
        }
        if let Some(v) = parse_var("MAILHOOK_SESSIONS_PER_ACCOUNT")? {
            config.sessions_per_account = v;
        }
        if let Some(v) = parse_var("MAILHOOK_SESSIONS_PER_HOST")? {
            config.sessions_per_host = v;
        }
        if let Some(v) = parse_var("MAILHOOK_CONNECTS_PER_MINUTE")? {
            config.connects_per_minute_per_host = v;
        }
        if let Some(v) = parse_var("MAILHOOK_BACKFILL_BATCH")? {
            config.backfill_batch_size = v;
        }
        if let Some(v) = parse_var::<u32>("MAILHOOK_BACKFILL_HORIZON")? {
            // 0 means unlimited history.
            config.backfill_horizon = (v > 0).then_some(v);
        }
        if let Some(v) = parse_var("MAILHOOK_FOLDERS_PER_ACCOUNT")? {
            config.folders_per_account = v;
        }
        if let Some(v) = parse_var("MAILHOOK_WEBHOOK_MAX_ATTEMPTS")? {
            config.webhook_max_attempts = v;
        }
        if let Some(v) = secs_var("MAILHOOK_WEBHOOK_BACKOFF_BASE")? {
            config.webhook_backoff_base = v;
        }
        if let Some(v) = secs_var("MAILHOOK_WEBHOOK_BACKOFF_CAP")? {
            config.webhook_backoff_cap = v;
        }
        if let Some(v) = secs_var("MAILHOOK_WEBHOOK_TIMEOUT")? {
            config.webhook_timeout = v;
        }
        if let Some(v) = secs_var("MAILHOOK_HEARTBEAT_INTERVAL")? {
            config.heartbeat_interval = v;
        }
        if let Some(v) = secs_var("MAILHOOK_LEASE_TTL")? {
            config.lease_ttl = v;
        }
        if let Some(v) = secs_var("MAILHOOK_IMAP_TIMEOUT")? {
            config.imap_timeout = v;
        }
        if let Some(v) = secs_var("MAILHOOK_IDLE_INTERVAL")? {
            config.idle_interval = v;
        }
        if let Some(v) = secs_var("MAILHOOK_SESSION_TTL")? {
            config.session_ttl = v;
        }
        if let Some(v) = secs_var("MAILHOOK_POLL_INTERVAL")? {
            config.poll_interval = v;
        }
        if let Some(v) = secs_var("MAILHOOK_GRACE_DEADLINE")? {
            config.grace_deadline = v;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.sessions_per_account, 4);
        assert_eq!(config.webhook_max_attempts, 12);
        assert_eq!(config.idle_interval, Duration::from_secs(1680));
        assert!(config.idle_interval < Duration::from_secs(29 * 60));
        assert_eq!(config.mode, Mode::Single);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(Mode::from_str("single").unwrap(), Mode::Single);
        assert_eq!(Mode::from_str("cluster").unwrap(), Mode::Cluster);
        assert!(Mode::from_str("fleet").is_err());
    }
}
