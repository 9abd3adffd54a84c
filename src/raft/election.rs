//! Election timeout jitter (SPEC_FULL.md §4.6 Timers).

use rand::Rng;
use std::time::Duration;

/// Uniformly random duration in `[min, max]`, recomputed before every wait so
/// peers don't resynchronize into a permanent split vote.
pub fn random_election_timeout(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let span = (max - min).as_millis() as u64;
    let jitter = rand::thread_rng().gen_range(0..=span);
    min + Duration::from_millis(jitter)
}
