// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Exponential backoff for connection establishment and recovery.
//!
//! The schedule itself is pure: it computes delays and decides whether
//! another attempt is allowed. The reconnection loop in the client owns
//! the sleeping.
//!
//! Delay formula: `min(initial_delay * multiplier^(attempt-1), max_delay)`,
//! then jittered by `± jitter * delay`.
//!
//! # Example
//!
//! ```
//! use trellis_core::retry::{BackoffConfig, ExponentialBackoff, RetryDecision, RetryLimit};
//! use std::time::Duration;
//!
//! let backoff = ExponentialBackoff::new(BackoffConfig {
//!     initial_delay: Duration::from_millis(100),
//!     max_delay: Duration::from_secs(2),
//!     max_retry: RetryLimit::Limited(2),
//!     ..Default::default()
//! });
//!
//! assert!(matches!(backoff.decide(1), RetryDecision::Retry(_)));
//! assert!(matches!(backoff.decide(2), RetryDecision::Retry(_)));
//! assert_eq!(backoff.decide(3), RetryDecision::DoNotRetry);
//! ```

use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// =============================================================================
// RetryLimit
// =============================================================================

/// How many retries a backoff schedule permits.
///
/// Serialized as an integer; any negative value means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryLimit {
    /// Retry forever.
    Unbounded,
    /// Retry at most this many times after the first attempt.
    Limited(u32),
}

impl RetryLimit {
    /// Builds a limit from a signed value, negative meaning unbounded.
    pub fn from_signed(value: i64) -> Self {
        if value < 0 {
            Self::Unbounded
        } else {
            Self::Limited(u32::try_from(value).unwrap_or(u32::MAX))
        }
    }

    /// Returns the signed representation, `-1` for unbounded.
    pub fn to_signed(self) -> i64 {
        match self {
            Self::Unbounded => -1,
            Self::Limited(n) => i64::from(n),
        }
    }

    /// Returns `true` if a retry is allowed after `failures` failed attempts.
    #[inline]
    pub fn allows(&self, failures: u32) -> bool {
        match self {
            Self::Unbounded => true,
            Self::Limited(n) => failures <= *n,
        }
    }

    /// Returns `true` if there is no limit.
    #[inline]
    pub const fn is_unbounded(&self) -> bool {
        matches!(self, Self::Unbounded)
    }
}

impl Default for RetryLimit {
    fn default() -> Self {
        Self::Limited(3)
    }
}

impl fmt::Display for RetryLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unbounded => f.write_str("unbounded"),
            Self::Limited(n) => write!(f, "{}", n),
        }
    }
}

impl Serialize for RetryLimit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_signed().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RetryLimit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        i64::deserialize(deserializer).map(Self::from_signed)
    }
}

// =============================================================================
// BackoffConfig
// =============================================================================

/// Configuration for [`ExponentialBackoff`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    #[serde(default = "default_initial_delay", with = "humantime_duration")]
    pub initial_delay: Duration,

    /// Upper bound for any single delay.
    #[serde(default = "default_max_delay", with = "humantime_duration")]
    pub max_delay: Duration,

    /// Growth factor between consecutive delays.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Jitter factor in `0.0..=1.0`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Retry budget.
    #[serde(default)]
    pub max_retry: RetryLimit,
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
            max_retry: RetryLimit::default(),
        }
    }
}

impl BackoffConfig {
    /// Checks the configuration, returning a description of the first problem.
    pub fn validate(&self) -> Result<(), String> {
        if self.initial_delay.is_zero() {
            return Err("initial_delay must be greater than zero".into());
        }
        if self.max_delay < self.initial_delay {
            return Err("max_delay must not be smaller than initial_delay".into());
        }
        if !(self.multiplier >= 1.0) {
            return Err("multiplier must be at least 1.0".into());
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err("jitter must be within 0.0..=1.0".into());
        }
        Ok(())
    }
}

mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        humantime::format_duration(*duration)
            .to_string()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Retry Decision
// =============================================================================

/// Decision on whether to make another attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry(Duration),
    /// Stop retrying.
    DoNotRetry,
}

// =============================================================================
// ExponentialBackoff
// =============================================================================

/// Exponentially increasing delays with optional jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
}

impl ExponentialBackoff {
    /// Creates a new backoff schedule.
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Returns the same schedule with the retry budget lifted.
    pub fn unbounded(&self) -> Self {
        Self {
            config: BackoffConfig {
                max_retry: RetryLimit::Unbounded,
                ..self.config.clone()
            },
        }
    }

    /// Returns the un-jittered delay before retry number `attempt` (1-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let millis = self.config.initial_delay.as_millis() as f64
            * self.config.multiplier.powi(exponent);
        let capped = millis.min(self.config.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Returns the jittered delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        apply_jitter(self.base_delay(attempt), self.config.jitter)
    }

    /// Decides whether retry number `attempt` (1-based) may happen.
    pub fn decide(&self, attempt: u32) -> RetryDecision {
        if self.config.max_retry.allows(attempt) {
            RetryDecision::Retry(self.delay_for(attempt))
        } else {
            RetryDecision::DoNotRetry
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let millis = duration.as_millis() as f64;
    let spread = millis * jitter_factor.min(1.0);
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_millis((millis + offset).max(0.0) as u64)
}

// =============================================================================
// Tests
// =============================================================================
