//! Shared utilities for the simulcast crate.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter.
///
/// `initial_ms * 2^(attempt-1)` capped at `max_ms`, with +/- 25% jitter so
/// destinations that dropped together do not reconnect together.
#[must_use]
pub fn backoff_delay(attempt: u32, initial_ms: u64, max_ms: u64) -> Duration {
    let base = initial_ms.saturating_mul(1u64 << attempt.min(16).saturating_sub(1));
    let capped = base.min(max_ms);
    let jitter_range = capped / 4;
    let random_offset = if jitter_range > 0 {
        rand::rng().random_range(0..=(jitter_range * 2))
    } else {
        0
    };
    let delay = (capped.saturating_sub(jitter_range) + random_offset).min(max_ms);
    Duration::from_millis(delay)
}

/// Mask a stream key for logs, keeping only a short prefix.
#[must_use]
pub fn redact_credential(credential: &str) -> String {
    if credential.is_empty() {
        return String::new();
    }
    if credential.chars().count() <= 4 {
        return "****".to_string();
    }
    let prefix: String = credential.chars().take(2).collect();
    format!("{prefix}****")
}
