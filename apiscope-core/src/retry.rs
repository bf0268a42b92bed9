//! Retry combinators for store writes.
//!
//! - [`retry_step`] runs one write step of an open transaction inside a
//!   savepoint; a transient failure rolls back to the savepoint and the step
//!   runs again after a jittered exponential delay.
//! - [`retry_transient`] retries a standalone pool operation.
//!
//! Only [`is_transient`] errors are retried. Everything else, including
//! unique violations, is returned on the first failure.

use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use sqlx::{Connection, PgConnection};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::config::RetryConfig;
use crate::error::is_transient;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            attempts: config.attempts.max(1),
            base_delay_ms: config.base_delay_ms.max(1),
            max_delay_ms: config.max_delay_ms,
        }
    }

    /// Delays between attempts: one fewer than `attempts`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(self.base_delay_ms)
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .map(jitter)
            .take(self.attempts.saturating_sub(1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Run `step` against `conn` inside a savepoint, retrying transient failures.
///
/// The closure is called once per attempt and must own what its future
/// captures.
pub async fn retry_step<T, F>(
    conn: &mut PgConnection,
    policy: &RetryPolicy,
    step: &'static str,
    mut f: F,
) -> Result<T, sqlx::Error>
where
    F: for<'c> FnMut(&'c mut PgConnection) -> BoxFuture<'c, Result<T, sqlx::Error>>,
{
    let mut delays = policy.delays();
    let mut attempt = 1;
    loop {
        let mut savepoint = conn.begin().await?;
        match f(&mut *savepoint).await {
            Ok(value) => {
                savepoint.commit().await?;
                return Ok(value);
            }
            Err(e) => {
                savepoint.rollback().await?;
                if !is_transient(&e) {
                    return Err(e);
                }
                match delays.next() {
                    Some(delay) => {
                        tracing::warn!(step, attempt, error = %e, "Transient store error, retrying step");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => {
                        tracing::error!(step, attempts = attempt, error = %e, "Step failed after retries");
                        return Err(e);
                    }
                }
            }
        }
    }
}

/// Retry a pool-level operation on transient failures.
pub async fn retry_transient<T, A, Fut>(policy: &RetryPolicy, action: A) -> Result<T, sqlx::Error>
where
    A: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    RetryIf::spawn(policy.delays(), action, |e: &sqlx::Error| is_transient(e)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            attempts: 5,
            base_delay_ms: 1,
            max_delay_ms: 2,
        }
    }

    #[test]
    fn one_delay_fewer_than_attempts() {
        assert_eq!(fast().delays().count(), 4);
        let single = RetryPolicy {
            attempts: 1,
            ..fast()
        };
        assert_eq!(single.delays().count(), 0);
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let result = retry_transient(&fast(), move || {
            let c = Arc::clone(&c);
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(sqlx::Error::PoolTimedOut)
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_the_attempt_bound() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let result: Result<(), _> = retry_transient(&fast(), move || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err(sqlx::Error::PoolTimedOut) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let result: Result<(), _> = retry_transient(&fast(), move || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;
        assert!(matches!(result, Err(sqlx::Error::RowNotFound)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
