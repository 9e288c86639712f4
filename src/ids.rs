// =============================================================================
// Clock and identifier helpers shared across the execution pipeline
// =============================================================================

use rand::Rng;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Generate a fresh request/task identifier.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Milliseconds since the Unix epoch, used for dedup-window bucketing and
/// wire timestamps. Falls back to 0 only if the system clock is before the
/// epoch, which never happens outside of a misconfigured container.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Uniform random jitter in `[0, max)`, used to stagger reconnects and
/// initial WS connects so a fleet restart doesn't thunder against the
/// broker all at once.
pub fn jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let millis = max.as_millis().max(1) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..millis))
}

/// Multiplicative jitter around a base delay, e.g. `backoff_jitter(base, 0.1)`
/// returns a value in `[base * 0.9, base * 1.1)`.
pub fn backoff_jitter(base: Duration, fraction: f64) -> Duration {
    let fraction = fraction.clamp(0.0, 1.0);
    let base_ms = base.as_millis() as f64;
    let spread = base_ms * fraction;
    let delta = rand::thread_rng().gen_range(-spread..=spread);
    let result_ms = (base_ms + delta).max(0.0);
    Duration::from_millis(result_ms as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_id_is_unique_and_uuid_shaped() {
        let a = new_id();
        let b = new_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }

    #[test]
    fn jitter_stays_within_bound() {
        let max = Duration::from_millis(500);
        for _ in 0..100 {
            let j = jitter(max);
            assert!(j < max);
        }
    }

    #[test]
    fn jitter_of_zero_is_zero() {
        assert_eq!(jitter(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn backoff_jitter_stays_within_fraction() {
        let base = Duration::from_secs(4);
        for _ in 0..100 {
            let d = backoff_jitter(base, 0.1);
            assert!(d.as_millis() >= 3600 && d.as_millis() <= 4400);
        }
    }
}
