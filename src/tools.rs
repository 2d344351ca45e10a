//! Small utilities used across the crate.

use std::time::Duration;

pub use std::time::SystemTime as Time;
use std::time::SystemTime;

use rand::Rng;

/// Returns the current unix timestamp in seconds.
pub(crate) fn time() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

pub(crate) fn time_elapsed(time: &Time) -> Duration {
    time.elapsed().unwrap_or_default()
}

/// Converts duration to string representation suitable for logs.
pub fn duration_to_str(duration: Duration) -> String {
    let secs = duration.as_secs();
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = (secs % 3600) % 60;
    format!("{h}h {m}m {s}s")
}

/// Full-jitter exponential backoff: a uniformly random delay in
/// `[0, min(cap, base * 2^attempt)]`.
///
/// `attempt` starts at 0 for the first retry.
pub(crate) fn backoff_with_jitter(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let ceiling = base
        .saturating_mul(2u32.saturating_pow(attempt.min(24)))
        .min(cap);
    if ceiling.is_zero() {
        return ceiling;
    }
    let millis = rand::thread_rng().gen_range(0..=ceiling.as_millis() as u64);
    Duration::from_millis(millis)
}

/// Deterministic ceiling of [`backoff_with_jitter`], used where the schedule
/// itself is persisted and jitter is applied on top.
pub(crate) fn backoff_ceiling(attempt: u32, base: Duration, cap: Duration) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.min(24)))
        .min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_ceiling() {
        let base = Duration::from_secs(30);
        let cap = Duration::from_secs(3600);
        assert_eq!(backoff_ceiling(0, base, cap), Duration::from_secs(30));
        assert_eq!(backoff_ceiling(1, base, cap), Duration::from_secs(60));
        assert_eq!(backoff_ceiling(2, base, cap), Duration::from_secs(120));
        // Capped at one hour no matter how many attempts were made.
        assert_eq!(backoff_ceiling(11, base, cap), cap);
        assert_eq!(backoff_ceiling(100, base, cap), cap);
    }

    #[test]
    fn test_backoff_with_jitter_bounds() {
        let base = Duration::from_secs(2);
        let cap = Duration::from_secs(300);
        for attempt in 0..16 {
            let delay = backoff_with_jitter(attempt, base, cap);
            assert!(delay <= backoff_ceiling(attempt, base, cap));
        }
    }

    #[test]
    fn test_duration_to_str() {
        assert_eq!(duration_to_str(Duration::from_secs(0)), "0h 0m 0s");
        assert_eq!(duration_to_str(Duration::from_secs(59)), "0h 0m 59s");
        assert_eq!(duration_to_str(Duration::from_secs(3602)), "1h 0m 2s");
    }
}
