//! Retry and backoff configuration with jitter support.

use rand::Rng;
use std::time::Duration;

/// Error returned when a `RetryConfig` is constructed with invalid values.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RetryConfigError {
    #[error("max_retries must be representable as a non-negative count")]
    NegativeMaxRetries,
    #[error("initial_backoff must be greater than zero")]
    NonPositiveInitial,
    #[error("max_backoff ({max:?}) must be >= initial_backoff ({initial:?})")]
    MaxBelowInitial { initial: Duration, max: Duration },
    #[error("multiplier must be >= 1.0, got {0}")]
    MultiplierBelowOne(f64),
}

/// HTTP statuses that are always safe to retry.
pub const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// HTTP statuses that must never be retried.
pub const NON_RETRYABLE_STATUSES: [u16; 6] = [400, 401, 403, 404, 409, 410];

/// Retry/backoff configuration.
///
/// **Important**: Retries are only safe for idempotent operations:
/// - GET/HEAD requests: Always safe to retry
/// - POST append with IdempotentProducer: Safe (has Producer-Id/Epoch/Seq)
/// - Plain POST append: NOT safe to retry (can cause duplicates)
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub max_retries: u32,
    /// Jitter mode for backoff delays (prevents thundering herd)
    pub jitter: JitterMode,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(60),
            multiplier: 1.3,
            max_retries: 10,
            jitter: JitterMode::Full,
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set initial backoff delay
    pub fn with_initial_backoff(mut self, delay: Duration) -> Self {
        self.initial_backoff = delay;
        self
    }

    /// Set maximum backoff delay
    pub fn with_max_backoff(mut self, delay: Duration) -> Self {
        self.max_backoff = delay;
        self
    }

    /// Set backoff multiplier
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set maximum retry attempts
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set jitter mode
    pub fn with_jitter(mut self, jitter: JitterMode) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate the next backoff delay with jitter
    pub fn next_backoff(&self, attempt: u32, current_delay: Duration) -> Duration {
        let base_delay = if attempt == 0 {
            self.initial_backoff
        } else {
            let multiplied = current_delay.as_secs_f64() * self.multiplier;
            Duration::from_secs_f64(multiplied.min(self.max_backoff.as_secs_f64()))
        };

        let delay = apply_jitter(base_delay, &self.jitter);
        #[cfg(feature = "tracing")]
        tracing::trace!(attempt, ?delay, "computed backoff delay");
        delay
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Validate the configuration.
    ///
    /// `RetryConfig` is a plain struct that callers may build by hand (the
    /// builders call this before accepting a config), so validation is a
    /// separate step rather than enforced in a constructor.
    pub fn validate(&self) -> Result<(), RetryConfigError> {
        if self.initial_backoff <= Duration::ZERO {
            return Err(RetryConfigError::NonPositiveInitial);
        }
        if self.max_backoff < self.initial_backoff {
            return Err(RetryConfigError::MaxBelowInitial {
                initial: self.initial_backoff,
                max: self.max_backoff,
            });
        }
        if self.multiplier < 1.0 {
            return Err(RetryConfigError::MultiplierBelowOne(self.multiplier));
        }
        Ok(())
    }
}

/// Whether an HTTP status code is retryable.
///
/// Transport-level failures (DNS, connect, reset) are retryable too, but
/// those never reach this function - they are mapped to
/// [`StreamError::is_retryable`](crate::error::StreamError::is_retryable)
/// before a status code exists.
pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

/// Jitter mode for retry backoff (following AWS SDK patterns).
#[derive(Clone, Debug, Default)]
pub enum JitterMode {
    /// No jitter - use exact backoff delay
    None,
    /// Full jitter: random delay between 0 and calculated backoff
    #[default]
    Full,
    /// Equal jitter: half fixed + half random
    Equal,
    /// Decorrelated jitter (AWS recommended)
    Decorrelated,
}

/// Apply jitter to a backoff delay.
pub fn apply_jitter(delay: Duration, mode: &JitterMode) -> Duration {
    let mut rng = rand::thread_rng();

    match mode {
        JitterMode::None => delay,
        JitterMode::Full => {
            // Random between 0 and delay
            Duration::from_secs_f64(rng.gen::<f64>() * delay.as_secs_f64())
        }
        JitterMode::Equal => {
            // Half fixed + half random
            let half = delay.as_secs_f64() / 2.0;
            Duration::from_secs_f64(half + rng.gen::<f64>() * half)
        }
        JitterMode::Decorrelated => {
            // AWS-style: min(max_delay, random_between(base, delay * 3))
            let base = delay.as_secs_f64() / 3.0;
            let upper = delay.as_secs_f64() * 3.0;
            Duration::from_secs_f64(base + rng.gen::<f64>() * (upper - base))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_positive_initial_backoff() {
        let cfg = RetryConfig::new().with_initial_backoff(Duration::ZERO);
        assert!(matches!(
            cfg.validate(),
            Err(RetryConfigError::NonPositiveInitial)
        ));
    }

    #[test]
    fn rejects_max_below_initial() {
        let cfg = RetryConfig::new()
            .with_initial_backoff(Duration::from_secs(5))
            .with_max_backoff(Duration::from_secs(1));
        assert!(matches!(
            cfg.validate(),
            Err(RetryConfigError::MaxBelowInitial { .. })
        ));
    }

    #[test]
    fn rejects_multiplier_below_one() {
        let cfg = RetryConfig::new().with_multiplier(0.5);
        assert!(matches!(
            cfg.validate(),
            Err(RetryConfigError::MultiplierBelowOne(_))
        ));
    }

    #[test]
    fn default_config_is_valid() {
        assert!(RetryConfig::default().validate().is_ok());
    }

    #[test]
    fn retryable_status_table_matches_spec() {
        for status in RETRYABLE_STATUSES {
            assert!(is_retryable_status(status));
        }
        for status in NON_RETRYABLE_STATUSES {
            assert!(!is_retryable_status(status));
        }
    }

    #[test]
    fn should_retry_respects_max_retries() {
        let cfg = RetryConfig::new().with_max_retries(2);
        assert!(cfg.should_retry(0));
        assert!(cfg.should_retry(1));
        assert!(!cfg.should_retry(2));
    }
}
