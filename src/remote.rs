use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::RarityError;
use crate::pool::{ConnectionPool, Connector};
use crate::throttle::RateBudget;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The peer reset the connection; the whole pool is presumed poisoned.
    ConnectionReset,
    /// Timeouts, refused connects, 429 and 5xx responses.
    Transient,
    /// Not worth retrying (other 4xx, undecodable body).
    Permanent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl CallFailure {
    pub fn reset(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::ConnectionReset,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay after the `failed`-th failed attempt (zero-based): base, 2×base, 4×base, …
    pub fn backoff(&self, failed: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(failed.min(16)))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
        }
    }
}

/// Runs remote operations under the shared [`RateBudget`] and
/// [`ConnectionPool`]. Cheap to clone; every clone shares the same budget and
/// pool.
pub struct ResilientClient<C: Connector> {
    pool: Arc<ConnectionPool<C>>,
    budget: Arc<RateBudget>,
    retry: RetryPolicy,
}

impl<C: Connector> Clone for ResilientClient<C> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            budget: Arc::clone(&self.budget),
            retry: self.retry,
        }
    }
}

impl<C: Connector> ResilientClient<C> {
    pub fn new(pool: Arc<ConnectionPool<C>>, budget: Arc<RateBudget>, retry: RetryPolicy) -> Self {
        Self {
            pool,
            budget,
            retry,
        }
    }

    pub fn budget(&self) -> &RateBudget {
        &self.budget
    }

    pub fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    /// Performs `op` for `key`, waiting at the admission and rate gates before
    /// every attempt. Gives up after `max_attempts` with
    /// [`RarityError::RemoteCallExhausted`]; cancellation of the budget
    /// surfaces as [`RarityError::Cancelled`].
    pub fn call<T, F>(&self, key: &str, op: F) -> Result<T, RarityError>
    where
        F: Fn(&C::Connection) -> Result<T, CallFailure>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempts = 0u32;
        let mut last_failure = None;

        while attempts < max_attempts {
            if attempts > 0 {
                self.budget.pause(self.retry.backoff(attempts - 1))?;
            }
            attempts += 1;

            let (outcome, generation) = {
                let _admission = self.budget.admit()?;
                self.budget.acquire_slot()?;
                match self.pool.checkout() {
                    Ok(lease) => (op(&lease.connection), Some(lease.generation)),
                    Err(err) => (
                        Err(CallFailure::transient(format!("connection pool unavailable: {err}"))),
                        None,
                    ),
                }
            };

            let failure = match outcome {
                Ok(value) => return Ok(value),
                Err(failure) => failure,
            };
            tracing::debug!(
                key,
                attempt = attempts,
                kind = ?failure.kind,
                "remote call failed: {failure}"
            );

            match failure.kind {
                FailureKind::ConnectionReset => {
                    if let Some(generation) = generation {
                        if let Err(err) = self.pool.report_reset(generation) {
                            tracing::warn!(key, "connection pool rebuild failed: {err}");
                        }
                    }
                }
                FailureKind::Transient => {}
                FailureKind::Permanent => {
                    last_failure = Some(failure);
                    break;
                }
            }
            last_failure = Some(failure);
        }

        Err(RarityError::RemoteCallExhausted {
            key: key.to_string(),
            attempts,
            last_error: last_failure
                .map(|failure| failure.message)
                .unwrap_or_else(|| "no attempt was made".to_string()),
        })
    }
}
