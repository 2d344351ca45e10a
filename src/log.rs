//! # Logging macros.
//!
//! Log lines are emitted as [`EventType::Info`], [`EventType::Warning`] and
//! [`EventType::Error`] events through the context event channel, so that all
//! per-account output ends up on the same stream the daemon is draining.
//!
//! [`EventType::Info`]: crate::EventType::Info
//! [`EventType::Warning`]: crate::EventType::Warning
//! [`EventType::Error`]: crate::EventType::Error

#[macro_export]
macro_rules! info {
    ($ctx:expr, $msg:expr) => {
        $crate::info!($ctx, $msg,)
    };
    ($ctx:expr, $msg:expr, $($args:expr),* $(,)?) => {{
        let formatted = format!($msg, $($args),*);
        let full = format!("{file}:{line}: {msg}",
                           file = file!(),
                           line = line!(),
                           msg = &formatted);
        $ctx.emit_event($crate::EventType::Info(full));
    }};
}

#[macro_export]
macro_rules! warn {
    ($ctx:expr, $msg:expr) => {
        $crate::warn!($ctx, $msg,)
    };
    ($ctx:expr, $msg:expr, $($args:expr),* $(,)?) => {{
        let formatted = format!($msg, $($args),*);
        let full = format!("{file}:{line}: {msg}",
                           file = file!(),
                           line = line!(),
                           msg = &formatted);
        $ctx.emit_event($crate::EventType::Warning(full));
    }};
}

#[macro_export]
macro_rules! error {
    ($ctx:expr, $msg:expr) => {
        $crate::error!($ctx, $msg,)
    };
    ($ctx:expr, $msg:expr, $($args:expr),* $(,)?) => {{
        let formatted = format!($msg, $($args),*);
        $ctx.emit_event($crate::EventType::Error(formatted));
    }};
}

use crate::context::Context;

/// Extension methods to log a [`Result`] without propagating it.
pub(crate) trait LogExt<T> {
    /// Logs the error with a warning and converts the result to an `Option`.
    fn ok_or_log(self, context: &Context) -> Option<T>;

    /// Like [`LogExt::ok_or_log`] with an additional message prefix.
    fn ok_or_log_msg(self, context: &Context, msg: &str) -> Option<T>;
}

impl<T, E: std::fmt::Display> LogExt<T> for Result<T, E> {
    fn ok_or_log(self, context: &Context) -> Option<T> {
        match self {
            Ok(t) => Some(t),
            Err(err) => {
                warn!(context, "{:#}", err);
                None
            }
        }
    }

    fn ok_or_log_msg(self, context: &Context, msg: &str) -> Option<T> {
        match self {
            Ok(t) => Some(t),
            Err(err) => {
                warn!(context, "{}: {:#}", msg, err);
                None
            }
        }
    }
}
