//! Retry utilities with configurable backoff and jitter strategies.
//!
//! Operations driven by [`retry_notify`] classify each failure as
//! [`RetryError::Permanent`] (stop now) or [`RetryError::Transient`] (retry
//! while the [`Backoff`] policy yields another delay).

use crate::errors::EngineError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^attempt
    #[default]
    Exponential,
    /// delay = base * (attempt + 1)
    Linear,
    /// delay = base (constant)
    Constant,
}

/// Jitter strategy to prevent thundering herd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    None,
    /// Random from 0 to delay
    #[default]
    Full,
    /// Half fixed, half random
    Equal,
    /// min(max, random(base, prev * 3))
    Decorrelated,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts, including the first one.
    pub max_attempts: usize,
    /// Base delay between retries in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff strategy.
    pub backoff_strategy: BackoffStrategy,
    /// Jitter strategy.
    pub jitter_strategy: JitterStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_strategy: BackoffStrategy::Exponential,
            jitter_strategy: JitterStrategy::Full,
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter_strategy = strategy;
        self
    }

    /// Builds a fresh backoff policy from this config.
    #[must_use]
    pub fn backoff(&self) -> PolicyBackoff {
        PolicyBackoff::new(self.clone())
    }
}

/// State tracking for retry operations.
#[derive(Debug, Default)]
pub struct RetryState {
    /// Retries handed out so far.
    pub attempt: usize,
    /// Previous delay, for decorrelated jitter.
    previous_delay: Option<u64>,
}

impl RetryState {
    /// Creates a new retry state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets the state for a new operation.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.previous_delay = None;
    }

    /// Calculates the delay for the current attempt.
    #[must_use]
    pub fn calculate_delay(&mut self, config: &RetryConfig) -> Duration {
        let base = config.base_delay_ms;
        let max = config.max_delay_ms;
        let attempt = u32::try_from(self.attempt).unwrap_or(u32::MAX);

        let delay = match config.backoff_strategy {
            BackoffStrategy::Exponential => {
                base.saturating_mul(2u64.saturating_pow(attempt)).min(max)
            }
            BackoffStrategy::Linear => base.saturating_mul(u64::from(attempt) + 1).min(max),
            BackoffStrategy::Constant => base.min(max),
        };

        let jittered = match config.jitter_strategy {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
            JitterStrategy::Decorrelated => {
                let prev = self.previous_delay.unwrap_or(base);
                let upper = prev.saturating_mul(3).min(max);
                let next = if upper <= base {
                    base
                } else {
                    rand::thread_rng().gen_range(base..=upper)
                };
                self.previous_delay = Some(next);
                next
            }
        };

        Duration::from_millis(jittered)
    }

    /// Returns true if retries are exhausted.
    #[must_use]
    pub fn is_exhausted(&self, config: &RetryConfig) -> bool {
        self.attempt + 1 >= config.max_attempts
    }
}

/// A retry-delay policy: "next delay or stop" plus reset.
///
/// Policies are stateful; create one per operation and never share one
/// between concurrent operations.
pub trait Backoff: Send {
    /// Returns the delay before the next attempt, or `None` to stop.
    fn next_backoff(&mut self) -> Option<Duration>;

    /// Restores the policy to its initial state.
    fn reset(&mut self);
}

/// [`Backoff`] driven by a [`RetryConfig`].
#[derive(Debug)]
pub struct PolicyBackoff {
    config: RetryConfig,
    state: RetryState,
}

impl PolicyBackoff {
    /// Creates a policy from a config.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            state: RetryState::new(),
        }
    }
}

impl Backoff for PolicyBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        if self.state.is_exhausted(&self.config) {
            return None;
        }
        let delay = self.state.calculate_delay(&self.config);
        self.state.attempt += 1;
        Some(delay)
    }

    fn reset(&mut self) {
        self.state.reset();
    }
}

/// Failure classification for a single attempt.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Retrying cannot help.
    Permanent(E),
    /// Worth another attempt.
    Transient(E),
}

impl<E> RetryError<E> {
    /// Unwraps the inner error.
    pub fn into_inner(self) -> E {
        match self {
            Self::Permanent(e) | Self::Transient(e) => e,
        }
    }
}

impl RetryError<EngineError> {
    /// Classifies an engine error by [`EngineError::is_permanent`].
    #[must_use]
    pub fn classify(error: EngineError) -> Self {
        if error.is_permanent() {
            Self::Permanent(error)
        } else {
            Self::Transient(error)
        }
    }
}

/// Runs `operation` until it succeeds, fails permanently, or the policy stops.
///
/// The policy is reset before the first attempt. The last error is returned
/// once retries are exhausted.
pub async fn retry_notify<T, E, B, F, Fut>(backoff: &mut B, mut operation: F) -> Result<T, E>
where
    B: Backoff + ?Sized,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RetryError<E>>>,
    E: Display,
{
    backoff.reset();
    let mut attempt = 1usize;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(RetryError::Permanent(e)) => return Err(e),
            Err(RetryError::Transient(e)) => match backoff.next_backoff() {
                Some(delay) => {
                    warn!(
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Retrying after error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.base_delay_ms, 1000);
        assert_eq!(config.max_delay_ms, 30000);
        assert_eq!(config.backoff_strategy, BackoffStrategy::Exponential);
    }

    #[test]
    fn test_retry_config_deserialize_partial() {
        let config: RetryConfig =
            serde_json::from_str(r#"{"max_attempts": 2, "jitter_strategy": "none"}"#).unwrap();
        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.jitter_strategy, JitterStrategy::None);
        assert_eq!(config.base_delay_ms, 1000);
    }

    #[test]
    fn test_calculate_delay_exponential_no_jitter() {
        let config = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_jitter(JitterStrategy::None);
        let mut state = RetryState::new();

        state.attempt = 0;
        assert_eq!(state.calculate_delay(&config), Duration::from_millis(100));
        state.attempt = 1;
        assert_eq!(state.calculate_delay(&config), Duration::from_millis(200));
        state.attempt = 2;
        assert_eq!(state.calculate_delay(&config), Duration::from_millis(400));
    }

    #[test]
    fn test_calculate_delay_linear_no_jitter() {
        let config = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Linear)
            .with_jitter(JitterStrategy::None);
        let mut state = RetryState::new();

        state.attempt = 2;
        assert_eq!(state.calculate_delay(&config), Duration::from_millis(300));
    }

    #[test]
    fn test_calculate_delay_capped_at_max() {
        let config = RetryConfig::new()
            .with_base_delay_ms(1000)
            .with_max_delay_ms(5000)
            .with_jitter(JitterStrategy::None);
        let mut state = RetryState::new();

        state.attempt = 10;
        assert_eq!(state.calculate_delay(&config), Duration::from_millis(5000));
    }

    #[test]
    fn test_full_jitter_bounded() {
        let config = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Constant);
        let mut state = RetryState::new();

        for _ in 0..10 {
            assert!(state.calculate_delay(&config) <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_policy_backoff_stops_after_max_attempts() {
        let mut backoff = RetryConfig::new()
            .with_max_attempts(3)
            .with_jitter(JitterStrategy::None)
            .backoff();

        assert!(backoff.next_backoff().is_some());
        assert!(backoff.next_backoff().is_some());
        assert!(backoff.next_backoff().is_none());
        assert_eq!(backoff.state.attempt, 2);

        backoff.reset();
        assert_eq!(backoff.state.attempt, 0);
        assert!(backoff.next_backoff().is_some());
    }

    /// Retries immediately, up to a fixed number of attempts.
    #[derive(Debug, Clone)]
    struct ZeroBackoff {
        max_attempts: usize,
        attempt: usize,
    }

    impl ZeroBackoff {
        fn new(max_attempts: usize) -> Self {
            Self {
                max_attempts,
                attempt: 0,
            }
        }
    }

    impl Backoff for ZeroBackoff {
        fn next_backoff(&mut self) -> Option<Duration> {
            if self.attempt + 1 >= self.max_attempts {
                return None;
            }
            self.attempt += 1;
            Some(Duration::ZERO)
        }

        fn reset(&mut self) {
            self.attempt = 0;
        }
    }

    #[tokio::test]
    async fn test_retry_success_after_transient_failures() {
        let mut backoff = ZeroBackoff::new(5);
        let calls = AtomicUsize::new(0);

        let result: Result<u32, String> = retry_notify(&mut backoff, || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(RetryError::Transient(format!("attempt {n}")))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_attempts() {
        let mut backoff = ZeroBackoff::new(5);
        let calls = Arc::new(AtomicUsize::new(0));

        let result: Result<(), String> = retry_notify(&mut backoff, || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RetryError::Transient("always fails".to_string()))
            }
        })
        .await;

        assert_eq!(result, Err("always fails".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_permanent_error_stops_immediately() {
        let mut backoff = ZeroBackoff::new(5);
        let calls = AtomicUsize::new(0);

        let result: Result<(), String> = retry_notify(&mut backoff, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RetryError::Permanent("bad credentials".to_string())) }
        })
        .await;

        assert_eq!(result, Err("bad credentials".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
