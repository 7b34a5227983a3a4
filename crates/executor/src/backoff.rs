//! Retry backoff: exponential with base 1s and factor 2, bounded.

use std::time::Duration;

/// Upper bound so a long retry chain never sleeps absurdly long.
const MAX_BACKOFF_MS: u64 = 5 * 60 * 1_000;

/// Delay before retry number `retry_count` (1-based after the first
/// failure): `base * 2^(retry_count - 1)`, capped at 5 minutes.
pub fn backoff_delay(base_ms: u64, retry_count: u32) -> Duration {
    if retry_count == 0 {
        return Duration::from_millis(0);
    }
    let exp = (retry_count - 1).min(20);
    let ms = base_ms
        .checked_mul(1u64 << exp)
        .unwrap_or(MAX_BACKOFF_MS)
        .min(MAX_BACKOFF_MS);
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_per_attempt() {
        assert_eq!(backoff_delay(1_000, 1), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(1_000, 2), Duration::from_millis(2_000));
        assert_eq!(backoff_delay(1_000, 3), Duration::from_millis(4_000));
    }

    #[test]
    fn zero_retries_means_no_delay() {
        assert_eq!(backoff_delay(1_000, 0), Duration::ZERO);
    }

    #[test]
    fn capped_at_five_minutes() {
        assert_eq!(backoff_delay(1_000, 30), Duration::from_millis(MAX_BACKOFF_MS));
    }
}
