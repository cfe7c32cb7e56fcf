//! Bounded retry with a fixed delay between attempts.
//!
//! Used by every write path of the persistent store. The caller decides which
//! errors are worth another attempt; anything else short-circuits.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_DELAY,
        }
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E: std::error::Error + 'static> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error(transparent)]
    Fatal(E),
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Run `op` until it succeeds, fails with an error `is_transient` rejects,
    /// or `max_attempts` have been made.
    pub async fn run<T, E, F, Fut>(
        &self,
        is_transient: impl Fn(&E) -> bool,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: std::error::Error + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !is_transient(&e) => return Err(RetryError::Fatal(e)),
                Err(e) if attempt >= self.max_attempts => {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    tracing::debug!(
                        error = %e,
                        attempt,
                        max_attempts = self.max_attempts,
                        "Transient failure, retrying after delay"
                    );
                    metrics::counter!("store_write_retries_total").increment(1);
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
