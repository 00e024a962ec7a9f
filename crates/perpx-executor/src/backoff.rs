//! Exponential backoff with jitter.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Delay before retry `attempt` (1-based).
///
/// Doubles from `base_ms` per attempt up to `max_ms`, then adds up to
/// `jitter_ms` of jitter.
pub fn delay(attempt: u32, base_ms: u64, max_ms: u64, jitter_ms: u64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(10);
    let delay = base_ms.saturating_mul(1u64 << exponent).min(max_ms);
    Duration::from_millis(delay + rand_jitter(jitter_ms))
}

fn rand_jitter(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    // Simple jitter using system time nanos
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos as u64) % max_ms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_until_cap() {
        assert_eq!(delay(1, 100, 1_000, 0), Duration::from_millis(100));
        assert_eq!(delay(2, 100, 1_000, 0), Duration::from_millis(200));
        assert_eq!(delay(4, 100, 1_000, 0), Duration::from_millis(800));
        assert_eq!(delay(5, 100, 1_000, 0), Duration::from_millis(1_000));
        assert_eq!(delay(60, 100, 1_000, 0), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_bounded() {
        for _ in 0..20 {
            let d = delay(1, 100, 1_000, 50);
            assert!(d >= Duration::from_millis(100));
            assert!(d < Duration::from_millis(150));
        }
    }
}
