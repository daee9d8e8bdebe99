// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retry policy and restart rate limiting.

use std::future::Future;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Errors that can stop a retry loop early.
///
/// Non-fatal errors are retried until the policy runs out of attempts.
pub trait Fatal {
    fn is_fatal(&self) -> bool;
}

/// Marker the retry loop converts into the caller's error when the
/// governing token is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// Retry policy for operation blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// When false, a single attempt is made.
    pub enabled: bool,
    /// Retries after the first attempt.
    pub retries_count: u32,
    /// Base delay between attempts.
    pub delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Scale the delay by `2^(attempt-1)`.
    pub exponential: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retries_count: 3,
            delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(300),
            exponential: false,
        }
    }
}

impl RetryConfig {
    /// Policy that makes exactly one attempt.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Total number of attempts this policy allows.
    pub fn attempts(&self) -> u32 {
        if self.enabled {
            self.retries_count.saturating_add(1)
        } else {
            1
        }
    }

    /// Delay before the given retry (1-indexed: 1 is the first retry).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = if self.exponential {
            let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
            self.delay.saturating_mul(multiplier)
        } else {
            self.delay
        };
        delay.min(self.max_delay)
    }
}

/// Run `f` under `config`, sleeping between failed attempts.
///
/// Returns the first success, the first fatal error, or the last error once
/// attempts are exhausted. Cancelling `ctx` aborts immediately, including
/// mid-sleep.
pub async fn retry<T, E, F, Fut>(ctx: &CancellationToken, config: &RetryConfig, mut f: F) -> Result<T, E>
where
    E: Fatal + From<Cancelled> + std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = config.attempts();
    let mut attempt = 0;

    loop {
        if ctx.is_cancelled() {
            return Err(Cancelled.into());
        }

        attempt += 1;
        let err = match f(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if err.is_fatal() || attempt >= attempts {
            return Err(err);
        }

        let delay = config.delay_for_attempt(attempt);
        debug!(attempt, attempts, delay_ms = delay.as_millis() as u64, error = %err, "attempt failed, retrying");

        tokio::select! {
            _ = ctx.cancelled() => return Err(Cancelled.into()),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Token bucket bounding how often a crashed worker is respawned.
///
/// Holds up to `capacity` tokens; one token is added every `refill`.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill: Duration,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            refill,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take a token, waiting for one to be refilled if the bucket is empty.
    pub async fn acquire(&self, ctx: &CancellationToken) -> Result<(), Cancelled> {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                self.refill_locked(&mut state);
                if state.tokens > 0 {
                    state.tokens -= 1;
                    return Ok(());
                }
                (state.last_refill + self.refill).saturating_duration_since(Instant::now())
            };

            tokio::select! {
                _ = ctx.cancelled() => return Err(Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Tokens currently available.
    pub async fn available(&self) -> u32 {
        let mut state = self.state.lock().await;
        self.refill_locked(&mut state);
        state.tokens
    }

    fn refill_locked(&self, state: &mut BucketState) {
        if self.refill.is_zero() {
            state.tokens = self.capacity;
            return;
        }
        let elapsed = state.last_refill.elapsed();
        let earned = (elapsed.as_nanos() / self.refill.as_nanos()) as u32;
        if earned == 0 {
            return;
        }
        state.tokens = state.tokens.saturating_add(earned).min(self.capacity);
        state.last_refill += self.refill * earned;
        if state.tokens == self.capacity {
            state.last_refill = Instant::now();
        }
    }
}
