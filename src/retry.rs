//! Backoff policy and the retry driver used by the enrichment client.
//!
//! The policy is a pure function of the attempt number and the failure kind; sleeping and
//! jitter live in [`retry`], so the decision can be tested without a clock.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use reqwest::StatusCode;
use tokio::time::sleep;

use crate::error::FetchError;

/// Longest server `Retry-After` hint honoured. Hints may exceed the backoff cap up to this bound.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(300);

/// Coarse classification of a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Connection, timeout, or body transfer failure.
    Network,
    /// The API answered with a 5xx status.
    Server,
    /// The API asked us to slow down.
    RateLimited,
    /// The API rejected the request itself (4xx, unknown API error code).
    Client,
    /// The response body could not be decoded.
    Decode,
}

impl FailureKind {
    /// Whether another attempt could plausibly succeed.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Network | Self::Server | Self::RateLimited)
    }

    /// Classifies a non-success HTTP status.
    pub fn from_status(status: StatusCode) -> Self {
        if status == StatusCode::TOO_MANY_REQUESTS {
            Self::RateLimited
        } else if status.is_server_error() {
            Self::Server
        } else {
            Self::Client
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Network => "network",
            Self::Server => "server",
            Self::RateLimited => "rate-limit",
            Self::Client => "client",
            Self::Decode => "decode",
        };
        f.write_str(label)
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for (roughly) the given delay and try again.
    Retry(Duration),
    /// Stop and report the last failure.
    GiveUp,
}

/// Exponential backoff bounded by an attempt count and a delay cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl RetryPolicy {
    /// Creates a policy; `max_attempts` is raised to at least one.
    pub fn new(max_attempts: u32, backoff_base: Duration, backoff_cap: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_base,
            backoff_cap: backoff_cap.max(backoff_base),
        }
    }

    /// Maximum number of attempts, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Upper bound on any single delay.
    pub fn backoff_cap(&self) -> Duration {
        self.backoff_cap
    }

    /// Decides whether attempt number `attempt` (1-based) should be followed by another.
    pub fn decide(&self, attempt: u32, kind: FailureKind) -> RetryDecision {
        if !kind.is_transient() || attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.backoff(attempt))
    }

    /// Un-jittered delay after attempt number `attempt`: `base * 2^(attempt - 1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.backoff_base
            .checked_mul(1u32 << exponent)
            .map_or(self.backoff_cap, |delay| delay.min(self.backoff_cap))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(500), Duration::from_secs(30))
    }
}

/// Outcome of a retried operation together with the number of attempts spent.
#[derive(Debug)]
pub struct Attempted<T> {
    /// Final result; an error is the last failure observed.
    pub result: Result<T, FetchError>,
    /// Attempts made, at least one.
    pub attempts: u32,
}

/// Keeps half the delay and randomizes the other half.
pub fn with_jitter<R: Rng + ?Sized>(delay: Duration, rng: &mut R) -> Duration {
    let half = delay / 2;
    let spread = half.as_millis().min(u64::MAX as u128) as u64;
    half + Duration::from_millis(rng.gen_range(0..=spread))
}

/// Runs `op` until it succeeds or the policy gives up. `op` receives the 1-based attempt number.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Attempted<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut attempt = 1;
    loop {
        let err = match op(attempt).await {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(err) => err,
        };
        match policy.decide(attempt, err.kind()) {
            RetryDecision::GiveUp => {
                return Attempted {
                    result: Err(err),
                    attempts: attempt,
                }
            }
            RetryDecision::Retry(delay) => {
                let mut delay = with_jitter(delay, &mut rand::thread_rng());
                if let Some(hint) = err.retry_after() {
                    delay = delay.max(hint.min(MAX_RETRY_AFTER));
                }
                tracing::warn!(
                    attempt,
                    kind = %err.kind(),
                    delay_ms = delay.as_millis() as u64,
                    "request failed, retrying: {}",
                    err.message()
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
