//! Bounded exponential backoff
//!
//! Shared by the connection loop, the provider client and the terminate path.
//! The delay before attempt `n + 1` is `base * multiplier^n`, capped at the
//! ceiling, jittered downwards, and never shorter than the previous delay.

use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Classify;

/// Backoff configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay after the first failed attempt (ms)
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    /// Upper bound for any single delay (ms)
    #[serde(default = "default_ceiling_ms")]
    pub ceiling_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Fraction of the raw delay that may be shaved off at random, 0.0..=1.0
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_base_ms() -> u64 {
    1000
}

fn default_ceiling_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.2
}

fn default_max_attempts() -> u32 {
    10
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            ceiling_ms: default_ceiling_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl BackoffPolicy {
    /// Policy used for the cloud API
    pub fn provider() -> Self {
        Self {
            base_ms: 2000,
            ceiling_ms: 20_000,
            multiplier: 1.5,
            jitter: 0.2,
            max_attempts: 3,
        }
    }

    /// Policy used for terminate: more attempts, same ceiling
    pub fn terminate(max_attempts: u32) -> Self {
        Self {
            base_ms: 1000,
            ceiling_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.1,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Raw, unjittered delay after failed attempt `attempt` (0-based)
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let ms = (self.base_ms as f64 * exp).min(self.ceiling_ms as f64);
        Duration::from_millis(ms as u64)
    }

    pub fn ceiling(&self) -> Duration {
        Duration::from_millis(self.ceiling_ms)
    }

    /// Start a fresh delay schedule
    pub fn schedule(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            failed: 0,
            last: Duration::ZERO,
        }
    }

    /// Worst-case total sleep across the whole budget
    pub fn max_total_delay(&self) -> Duration {
        (0..self.max_attempts.saturating_sub(1))
            .map(|a| self.raw_delay(a))
            .sum()
    }
}

/// Stateful delay schedule for one retry loop
#[derive(Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    failed: u32,
    last: Duration,
}

impl Backoff {
    /// Record a failed attempt and return the delay before the next one, or
    /// `None` when the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failed += 1;
        if self.failed >= self.policy.max_attempts {
            return None;
        }

        let raw = self.policy.raw_delay(self.failed - 1);
        let jitter = self.policy.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            1.0 - rand::thread_rng().gen_range(0.0..jitter)
        } else {
            1.0
        };
        let jittered = raw.mul_f64(factor).min(self.policy.ceiling());

        // Monotone: jitter may not pull a delay below the previous one
        let delay = jittered.max(self.last);
        self.last = delay;
        Some(delay)
    }

    /// Number of failed attempts recorded so far
    pub fn failed_attempts(&self) -> u32 {
        self.failed
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget runs out. `op` receives the 1-based attempt number.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &BackoffPolicy,
    label: &str,
    mut op: F,
) -> Result<T, E>
where
    E: Classify + std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let started = Instant::now();
    let mut backoff = policy.schedule();
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} succeeded on attempt {}", label, attempt);
                }
                return Ok(value);
            }
            Err(e) if !e.class().is_retryable() => {
                debug!("{} failed with non-retryable error: {}", label, e);
                return Err(e);
            }
            Err(e) => match backoff.next_delay() {
                Some(delay) => {
                    warn!(
                        "{} attempt {}/{} failed after {:?}: {}. Retrying in {:?}",
                        label,
                        attempt,
                        policy.max_attempts,
                        started.elapsed(),
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => {
                    warn!(
                        "{} gave up after {} attempts ({:?}): {}",
                        label,
                        attempt,
                        started.elapsed(),
                        e
                    );
                    return Err(e);
                }
            },
        }
    }
}
