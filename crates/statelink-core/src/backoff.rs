//! Exponential backoff with optional jitter.
//!
//! The recovery manager waits `delay(attempt)` before each reconnection
//! attempt, where `attempt` is 1-based:
//!
//! ```text
//! delay = min(max_delay, initial_delay * multiplier^(attempt - 1))
//! ```
//!
//! With jitter enabled the delay is scaled by a random factor in
//! `[1 - jitter_factor, 1 + jitter_factor]`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default maximum reconnection attempts.
pub const DEFAULT_MAX_RETRIES: u32 = 5;
/// Default delay before the first attempt in milliseconds.
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 1000;
/// Default delay cap in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
/// Default growth factor between attempts.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
/// Default jitter band (±20%).
pub const DEFAULT_JITTER_FACTOR: f64 = 0.2;

/// Backoff parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffConfig {
    /// Attempts allowed before giving up.
    pub max_retries: u32,
    /// Delay before attempt 1, in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound on any delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Growth factor per attempt.
    pub backoff_multiplier: f64,
    /// Randomize delays within the jitter band.
    pub jitter_enabled: bool,
    /// Half-width of the jitter band as a fraction of the delay.
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter_enabled: true,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl BackoffConfig {
    /// Pre-jitter delay before `attempt` (1-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(calculate_backoff_delay(
            attempt,
            self.initial_delay_ms,
            self.max_delay_ms,
            self.backoff_multiplier,
        ))
    }

    /// Delay before `attempt`, jittered when enabled.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = calculate_backoff_delay(
            attempt,
            self.initial_delay_ms,
            self.max_delay_ms,
            self.backoff_multiplier,
        );
        if !self.jitter_enabled {
            return Duration::from_millis(base);
        }
        Duration::from_millis(apply_jitter(base, self.jitter_factor, rand::random::<f64>()))
    }
}

/// `min(max_delay_ms, initial_delay_ms * multiplier^(attempt - 1))`.
///
/// Attempt 0 is treated as attempt 1.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap
)]
pub fn calculate_backoff_delay(
    attempt: u32,
    initial_delay_ms: u64,
    max_delay_ms: u64,
    multiplier: f64,
) -> u64 {
    let exponent = attempt.saturating_sub(1).min(64) as i32;
    let raw = (initial_delay_ms as f64) * multiplier.max(1.0).powi(exponent);
    if !raw.is_finite() || raw >= max_delay_ms as f64 {
        return max_delay_ms;
    }
    raw.round() as u64
}

/// Scale `delay_ms` by `1 + (random * 2 - 1) * jitter_factor`.
///
/// `random` should be in `[0.0, 1.0)`.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn apply_jitter(delay_ms: u64, jitter_factor: f64, random: f64) -> u64 {
    let factor = 1.0 + (random * 2.0 - 1.0) * jitter_factor.clamp(0.0, 1.0);
    ((delay_ms as f64) * factor).round().max(0.0) as u64
}
