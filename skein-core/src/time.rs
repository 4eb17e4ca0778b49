//! Time provider abstraction.
//!
//! Request timeouts, reconnect backoff and keep-alive intervals all go
//! through a [`TimeProvider`] so tests can run them on a paused clock.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during time operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeError {
    /// The operation timed out.
    #[error("operation timed out")]
    Elapsed,

    /// The time provider has been shut down and is no longer accessible.
    #[error("time provider shut down")]
    Shutdown,
}

/// Provider trait for time operations.
#[async_trait(?Send)]
pub trait TimeProvider: Clone {
    /// Sleep for the specified duration.
    async fn sleep(&self, duration: Duration) -> Result<(), TimeError>;

    /// Monotonic time elapsed since the provider was created.
    fn now(&self) -> Duration;

    /// Run a future with a timeout.
    ///
    /// Returns `Ok(result)` if the future completes within the timeout,
    /// or `Err(TimeError::Elapsed)` if it times out.
    async fn timeout<F, T>(&self, duration: Duration, future: F) -> Result<T, TimeError>
    where
        F: std::future::Future<Output = T>;
}

/// Real time provider using Tokio's time facilities.
///
/// Uses `tokio::time::Instant`, so a paused test runtime
/// (`#[tokio::test(start_paused = true)]`) drives it deterministically.
#[derive(Debug, Clone)]
pub struct TokioTimeProvider {
    start_time: tokio::time::Instant,
}

impl TokioTimeProvider {
    /// Create a new Tokio time provider.
    pub fn new() -> Self {
        Self {
            start_time: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl TimeProvider for TokioTimeProvider {
    async fn sleep(&self, duration: Duration) -> Result<(), TimeError> {
        tokio::time::sleep(duration).await;
        Ok(())
    }

    fn now(&self) -> Duration {
        self.start_time.elapsed()
    }

    async fn timeout<F, T>(&self, duration: Duration, future: F) -> Result<T, TimeError>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::time::timeout(duration, future)
            .await
            .map_err(|_| TimeError::Elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_advances_now() {
        let time = TokioTimeProvider::new();
        let before = time.now();
        time.sleep(Duration::from_secs(3)).await.expect("sleep");
        assert!(time.now() - before >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_elapsed() {
        let time = TokioTimeProvider::new();
        let result = time
            .timeout(Duration::from_millis(10), std::future::pending::<()>())
            .await;
        assert_eq!(result, Err(TimeError::Elapsed));
    }

    #[tokio::test]
    async fn test_timeout_ready() {
        let time = TokioTimeProvider::new();
        let result = time.timeout(Duration::from_secs(1), async { 7 }).await;
        assert_eq!(result, Ok(7));
    }
}
