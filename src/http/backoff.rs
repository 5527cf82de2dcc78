//! Backoff policy for retrying transient failures
//!
//! Exponential backoff with proportional jitter, capped at a maximum delay.
//! A positive server hint (Retry-After) takes precedence over the computed
//! delay. The random source is supplied by the caller so delays are
//! reproducible in tests.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

use crate::config::RetryConfig;

/// Where a backoff delay came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelaySource {
    /// Retry-After hint plus the fixed buffer
    ServerHint,
    /// Exponential term plus jitter
    Computed,
}

/// Result of consulting the policy after a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffDecision {
    /// Always at most the configured max delay
    pub delay: Duration,
    pub source: DelaySource,
    /// Whether another attempt fits in the retry budget
    pub retry_permitted: bool,
}

/// Backoff policy with exponential growth and jitter
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    config: RetryConfig,
}

impl BackoffPolicy {
    /// Create a new BackoffPolicy with the given configuration
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Create a BackoffPolicy with default configuration
    pub fn with_defaults() -> Self {
        Self::new(RetryConfig::default())
    }

    /// Get the retry configuration
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before the retry following attempt `attempt` (0-based)
    ///
    /// * hint present and positive: `min(hint + buffer, max_delay)`
    /// * otherwise: `min(base * 2^attempt + jitter, max_delay)` where jitter is
    ///   uniform in `[0, jitter_fraction * base * 2^attempt)`
    pub fn compute_delay<R: Rng + ?Sized>(
        &self,
        attempt: u32,
        retry_after_hint: Option<Duration>,
        rng: &mut R,
    ) -> Duration {
        let max_delay = Duration::from_millis(self.config.max_delay_ms);

        if let Some(hint) = retry_after_hint.filter(|h| !h.is_zero()) {
            let buffered = hint + Duration::from_millis(self.config.retry_after_buffer_ms);
            return buffered.min(max_delay);
        }

        let max_secs = max_delay.as_secs_f64();
        let base_secs = self.config.base_delay_ms as f64 / 1000.0;
        // Exponent clamped so the term stays finite; anything this large is past the cap
        let exponential = (base_secs * 2f64.powi(attempt.min(64) as i32)).min(max_secs);
        let jitter = exponential * self.config.jitter_fraction.max(0.0) * rng.gen::<f64>();

        Duration::from_secs_f64((exponential + jitter).min(max_secs))
    }

    /// Full decision for the retry following attempt `attempt`
    pub fn decide<R: Rng + ?Sized>(
        &self,
        attempt: u32,
        retry_after_hint: Option<Duration>,
        max_retries: u32,
        rng: &mut R,
    ) -> BackoffDecision {
        let source = match retry_after_hint {
            Some(hint) if !hint.is_zero() => DelaySource::ServerHint,
            _ => DelaySource::Computed,
        };

        BackoffDecision {
            delay: self.compute_delay(attempt, retry_after_hint, rng),
            source,
            retry_permitted: attempt < max_retries,
        }
    }
}

/// Parse a Retry-After header value
///
/// Accepts delta-seconds or an HTTP-date. Unparsable, zero, negative, or past
/// values yield `None`.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();

    if let Ok(secs) = value.parse::<i64>() {
        return (secs > 0).then(|| Duration::from_secs(secs as u64));
    }

    let date = DateTime::parse_from_rfc2822(value).ok()?;
    let remaining = date.with_timezone(&Utc) - now;
    remaining
        .to_std()
        .ok()
        .filter(|d| !d.is_zero())
}
