//! Retry delays - backoff and jitter composition for transient failures
//!
//! This module provides configurable retry delays for handling transient
//! failures during pipeline execution: item retries inside the Parallel
//! strategy and node restarts inside the Resilient strategy both draw their
//! delays from here.
//!
//! # Overview
//!
//! A delay is composed from two independent axes:
//!
//! - **Backoff** - how the raw delay grows with the attempt index:
//!   fixed, linear (`base + n × step`), or exponential
//!   (`base × multiplier^n`), always capped at `max` and saturating on
//!   numeric overflow.
//! - **Jitter** - how randomness is applied on top: none, full jitter
//!   (uniform in `[0, delay]`), or decorrelated jitter
//!   (`uniform(base, prev × multiplier)` clamped to `max`, stateful across
//!   attempts).
//!
//! ```text
//! attempt index ──> Backoff ──> cap at max ──> Jitter ──> Duration
//!                   (fixed/linear/exponential)  (none/full/decorrelated)
//! ```
//!
//! # Why Jitter Matters
//!
//! Without jitter, every worker that failed at the same moment retries at
//! the same moment, producing a thundering herd against the system that
//! just recovered. Full jitter spreads retries uniformly; decorrelated
//! jitter additionally decouples consecutive delays from the attempt index.
//!
//! # Quick Start
//!
//! ```rust
//! use npipeline_core::retry::{BackoffKind, JitterKind, RetryOptions, RetryPolicy};
//! use std::time::Duration;
//!
//! let options = RetryOptions::new(5)
//!     .with_base(Duration::from_millis(100))
//!     .with_max(Duration::from_secs(10))
//!     .with_backoff(BackoffKind::Exponential { multiplier: 2.0 })
//!     .with_jitter(JitterKind::None);
//! options.validate().unwrap();
//!
//! let policy = RetryPolicy::new(options);
//! assert_eq!(policy.delay_for(0), Duration::from_millis(100));
//! assert_eq!(policy.delay_for(1), Duration::from_millis(200));
//! assert_eq!(policy.delay_for(2), Duration::from_millis(400));
//! assert!(policy.should_retry(4));
//! assert!(!policy.should_retry(5));
//! ```
//!
//! # See Also
//!
//! - [`crate::strategy`] - the strategies consuming these delays
//! - [`crate::breaker`] - give up entirely when a node is consistently down

use crate::error::{PipelineError, Result};
use rand::Rng;
use std::sync::Mutex;
use std::time::Duration;

/// How the raw delay grows with the attempt index
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffKind {
    /// Constant delay of `base` for every attempt
    Fixed,
    /// `base + n × step`, saturating, capped at `max`
    Linear {
        /// Increment added per attempt
        step: Duration,
    },
    /// `base × multiplier^n`, saturating, capped at `max`
    Exponential {
        /// Growth factor per attempt; must be `>= 1`
        multiplier: f64,
    },
}

/// Randomness applied on top of the backoff delay
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JitterKind {
    /// Use the backoff delay as-is
    None,
    /// Uniform in `[0, delay]`
    Full,
    /// `uniform(base, prev × multiplier)` clamped to `max`; stateful across
    /// attempts and thread-safe
    Decorrelated {
        /// Spread factor applied to the previous delay; must be `>= 1`
        multiplier: f64,
    },
}

/// Configuration for retry delays
///
/// Validation enforces `base > 0`, `max >= base`, and `multiplier >= 1`.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,

    /// Starting delay
    pub base: Duration,

    /// Upper bound every computed delay is clamped to
    pub max: Duration,

    /// Delay growth axis
    pub backoff: BackoffKind,

    /// Randomness axis
    pub jitter: JitterKind,
}

impl RetryOptions {
    /// Create retry options with the given attempt budget and defaults:
    /// 500 ms base, 128 s cap, exponential ×2 backoff, no jitter.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base: Duration::from_millis(500),
            max: Duration::from_secs(128),
            backoff: BackoffKind::Exponential { multiplier: 2.0 },
            jitter: JitterKind::None,
        }
    }

    /// Set the starting delay
    pub fn with_base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    /// Set the delay cap
    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    /// Set the backoff kind
    pub fn with_backoff(mut self, backoff: BackoffKind) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the jitter kind
    pub fn with_jitter(mut self, jitter: JitterKind) -> Self {
        self.jitter = jitter;
        self
    }

    /// Check the configuration invariants
    pub fn validate(&self) -> Result<()> {
        if self.base.is_zero() {
            return Err(PipelineError::configuration(
                "retry base delay must be greater than zero",
            ));
        }
        if self.max < self.base {
            return Err(PipelineError::configuration(
                "retry max delay must be at least the base delay",
            ));
        }
        if let BackoffKind::Exponential { multiplier } = self.backoff {
            if multiplier < 1.0 {
                return Err(PipelineError::configuration(
                    "exponential backoff multiplier must be at least 1",
                ));
            }
        }
        if let JitterKind::Decorrelated { multiplier } = self.jitter {
            if multiplier < 1.0 {
                return Err(PipelineError::configuration(
                    "decorrelated jitter multiplier must be at least 1",
                ));
            }
        }
        Ok(())
    }
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Computes per-attempt delays from [`RetryOptions`]
///
/// Delay computation never fails: invalid intermediate values saturate at
/// the configured `max`. The decorrelated-jitter state is internal and
/// thread-safe, so one policy instance can be shared across workers.
#[derive(Debug)]
pub struct RetryPolicy {
    options: RetryOptions,
    /// Previous delay handed out, for decorrelated jitter
    prev: Mutex<Duration>,
}

impl RetryPolicy {
    /// Create a policy over the given options
    pub fn new(options: RetryOptions) -> Self {
        let prev = Mutex::new(options.base);
        Self { options, prev }
    }

    /// The options this policy was built from
    pub fn options(&self) -> &RetryOptions {
        &self.options
    }

    /// Whether another attempt is allowed after `attempts` have been made
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.options.max_attempts
    }

    /// Compute the delay before retry `attempt` (0-indexed)
    ///
    /// The computation saturates: overflowing backoff values clamp to the
    /// configured `max` instead of failing.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let raw = match self.options.backoff {
            BackoffKind::Fixed => self.options.base,
            BackoffKind::Linear { step } => self
                .options
                .base
                .saturating_add(step.saturating_mul(attempt)),
            BackoffKind::Exponential { multiplier } => {
                let secs = self.options.base.as_secs_f64() * multiplier.powi(attempt as i32);
                if secs.is_finite() && secs >= 0.0 {
                    Duration::try_from_secs_f64(secs).unwrap_or(self.options.max)
                } else {
                    self.options.max
                }
            }
        };
        let capped = raw.min(self.options.max);

        match self.options.jitter {
            JitterKind::None => capped,
            JitterKind::Full => {
                if capped.is_zero() {
                    capped
                } else {
                    let mut rng = rand::thread_rng();
                    Duration::from_secs_f64(rng.gen_range(0.0..=capped.as_secs_f64()))
                }
            }
            JitterKind::Decorrelated { multiplier } => {
                let mut prev = self.prev.lock().expect("retry policy lock poisoned");
                let low = self.options.base.as_secs_f64();
                let high = (prev.as_secs_f64() * multiplier).max(low);
                let mut rng = rand::thread_rng();
                let picked = Duration::from_secs_f64(rng.gen_range(low..=high))
                    .min(self.options.max);
                *prev = picked;
                picked
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_options_defaults() {
        let options = RetryOptions::default();
        assert_eq!(options.max_attempts, 3);
        assert_eq!(options.base, Duration::from_millis(500));
        assert!(matches!(
            options.backoff,
            BackoffKind::Exponential { multiplier } if multiplier == 2.0
        ));
        assert_eq!(options.jitter, JitterKind::None);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_configs() {
        let zero_base = RetryOptions::new(3).with_base(Duration::ZERO);
        assert!(zero_base.validate().is_err());

        let max_below_base = RetryOptions::new(3)
            .with_base(Duration::from_secs(10))
            .with_max(Duration::from_secs(1));
        assert!(max_below_base.validate().is_err());

        let shrinking = RetryOptions::new(3)
            .with_backoff(BackoffKind::Exponential { multiplier: 0.5 });
        assert!(shrinking.validate().is_err());
    }

    #[test]
    fn test_fixed_backoff_is_constant() {
        let policy = RetryPolicy::new(
            RetryOptions::new(5)
                .with_base(Duration::from_millis(50))
                .with_backoff(BackoffKind::Fixed),
        );

        for attempt in 0..5 {
            assert_eq!(policy.delay_for(attempt), Duration::from_millis(50));
        }
    }

    #[test]
    fn test_linear_backoff_caps_at_max() {
        let policy = RetryPolicy::new(
            RetryOptions::new(10)
                .with_base(Duration::from_millis(100))
                .with_max(Duration::from_millis(350))
                .with_backoff(BackoffKind::Linear {
                    step: Duration::from_millis(100),
                }),
        );

        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(300));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(100), Duration::from_millis(350));
    }

    #[test]
    fn test_exponential_backoff_saturates_on_overflow() {
        let policy = RetryPolicy::new(
            RetryOptions::new(u32::MAX)
                .with_base(Duration::from_secs(1))
                .with_max(Duration::from_secs(60))
                .with_backoff(BackoffKind::Exponential { multiplier: 10.0 }),
        );

        // 1s * 10^1000 is far beyond f64 range; the delay clamps to max.
        assert_eq!(policy.delay_for(1000), Duration::from_secs(60));
    }

    #[test]
    fn test_full_jitter_stays_within_envelope() {
        let policy = RetryPolicy::new(
            RetryOptions::new(5)
                .with_base(Duration::from_millis(100))
                .with_backoff(BackoffKind::Exponential { multiplier: 2.0 })
                .with_jitter(JitterKind::Full),
        );

        // Attempt 2 envelope: [0, 400ms]
        for _ in 0..50 {
            let delay = policy.delay_for(2);
            assert!(delay <= Duration::from_millis(400));
        }
    }

    #[test]
    fn test_decorrelated_jitter_respects_bounds() {
        let base = Duration::from_millis(10);
        let max = Duration::from_millis(500);
        let policy = RetryPolicy::new(
            RetryOptions::new(20)
                .with_base(base)
                .with_max(max)
                .with_jitter(JitterKind::Decorrelated { multiplier: 3.0 }),
        );

        for attempt in 0..20 {
            let delay = policy.delay_for(attempt);
            assert!(delay >= base, "delay {:?} below base", delay);
            assert!(delay <= max, "delay {:?} above max", delay);
        }
    }

    #[test]
    fn test_should_retry_budget() {
        let policy = RetryPolicy::new(RetryOptions::new(3));
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    proptest! {
        /// Exponential backoff without jitter is monotonically non-decreasing
        /// up to the cap, for any multiplier >= 1.
        #[test]
        fn prop_exponential_delay_monotonic(
            base_ms in 1u64..1000,
            multiplier in 1.0f64..8.0,
            attempt in 0u32..40,
        ) {
            let policy = RetryPolicy::new(
                RetryOptions::new(u32::MAX)
                    .with_base(Duration::from_millis(base_ms))
                    .with_max(Duration::from_secs(3600))
                    .with_backoff(BackoffKind::Exponential { multiplier }),
            );

            prop_assert!(policy.delay_for(attempt + 1) >= policy.delay_for(attempt));
        }

        /// Every computed delay respects the configured cap.
        #[test]
        fn prop_delay_never_exceeds_max(
            base_ms in 1u64..1000,
            max_ms in 1000u64..10_000,
            attempt in 0u32..64,
        ) {
            let policy = RetryPolicy::new(
                RetryOptions::new(u32::MAX)
                    .with_base(Duration::from_millis(base_ms))
                    .with_max(Duration::from_millis(max_ms))
                    .with_backoff(BackoffKind::Exponential { multiplier: 3.0 }),
            );

            prop_assert!(policy.delay_for(attempt) <= Duration::from_millis(max_ms));
        }
    }
}
