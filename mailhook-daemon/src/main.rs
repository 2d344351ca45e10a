//! mailhook sync daemon.
//!
//! Reads its configuration from `MAILHOOK_*` environment variables, runs one
//! worker process (plus coordinator election in `cluster` mode) and forwards
//! core events to the process log.
//!
//! Exit codes: 0 on a clean shutdown, 1 on a fatal startup error, 2 on an
//! unrecoverable runtime error.

use anyhow::Result;
use mailhook::{Config, Context, EventType, Worker};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[cfg(target_family = "unix")]
use tokio::signal::unix as signal_unix;

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    // `MAILHOOK_LOG` takes the usual `RUST_LOG` filter syntax.
    env_logger::Builder::from_env(env_logger::Env::new().filter_or("MAILHOOK_LOG", "info")).init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            log::error!("invalid configuration: {err:#}");
            std::process::exit(1);
        }
    };

    let context = match Context::new(config).await {
        Ok(context) => context,
        Err(err) => {
            log::error!("startup failed: {err:#}");
            std::process::exit(1);
        }
    };

    let code = match run(context).await {
        Ok(()) => 0,
        Err(err) => {
            log::error!("unrecoverable runtime error: {err:#}");
            2
        }
    };
    std::process::exit(code);
}

async fn run(context: Context) -> Result<()> {
    let cancel = CancellationToken::new();

    // Install signal handlers early so that shutdown is graceful from here.
    let signal_task: JoinHandle<()> = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            cancel.cancel();
        })
    };

    // Events task forwards core events to the process log.
    let events = context.get_event_emitter();
    let events_task: JoinHandle<()> = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event.typ {
                EventType::Info(msg) => log::info!("{msg}"),
                EventType::Warning(msg) => log::warn!("{msg}"),
                EventType::Error(msg) => log::error!("{msg}"),
                other => log::info!("{other:?}"),
            }
        }
    });

    let worker = Worker::new(context.clone(), cancel.clone());
    let res = worker.run().await;

    context.stop().await;
    signal_task.abort();
    // The events task ends once the last Context clone is gone.
    drop(worker);
    drop(context);
    events_task.await.ok();
    res
}

async fn wait_for_shutdown_signal() {
    #[cfg(target_family = "unix")]
    {
        let mut sigterm = match signal_unix::signal(signal_unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                log::error!("cannot install SIGTERM handler: {err}");
                let _ = tokio::signal::ctrl_c().await;
                log::info!("got SIGINT, shutting down");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => log::info!("got SIGINT, shutting down"),
            _ = sigterm.recv() => log::info!("got SIGTERM, shutting down"),
        }
    }
    #[cfg(not(target_family = "unix"))]
    {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("got ctrl-c, shutting down");
    }
}
