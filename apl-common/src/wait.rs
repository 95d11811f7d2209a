//! Bounded polling.
//!
//! Every "wait until the appliance is X" in the crate funnels through
//! [`WaitFor`]: evaluate a predicate, sleep, repeat, until it succeeds or the
//! time budget runs out. Sleeping goes through `tokio::time`, so tests can run
//! under a paused clock.

use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, trace};

use crate::errors::WaitError;

/// Values a predicate may return. Truthy means "done waiting".
pub trait Truthy {
    fn is_truthy(&self) -> bool;
}

impl Truthy for bool {
    fn is_truthy(&self) -> bool {
        *self
    }
}

impl<T> Truthy for Option<T> {
    fn is_truthy(&self) -> bool {
        self.is_some()
    }
}

impl<T> Truthy for Vec<T> {
    fn is_truthy(&self) -> bool {
        !self.is_empty()
    }
}

impl Truthy for String {
    fn is_truthy(&self) -> bool {
        !self.is_empty()
    }
}

impl Truthy for &str {
    fn is_truthy(&self) -> bool {
        !self.is_empty()
    }
}

macro_rules! truthy_int {
    ($($t:ty),*) => {
        $(impl Truthy for $t {
            fn is_truthy(&self) -> bool {
                *self != 0
            }
        })*
    };
}

truthy_int!(i32, i64, u32, u64, usize);

/// The value that satisfied the predicate and how long it took.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitOutcome<T> {
    pub value: T,
    pub elapsed: Duration,
    pub attempts: u32,
}

/// Polling parameters.
///
/// ```ignore
/// let up = WaitFor::new("appliance.is_ssh_running")
///     .delay(Duration::from_secs(5))
///     .timeout(Duration::from_secs(600))
///     .until(|| async { Ok::<_, Infallible>(probe().await) })
///     .await?;
/// ```
#[derive(Debug, Clone)]
pub struct WaitFor {
    message: String,
    delay: Duration,
    timeout: Duration,
    handle_exception: bool,
}

impl WaitFor {
    pub const DEFAULT_DELAY: Duration = Duration::from_secs(1);
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            delay: Self::DEFAULT_DELAY,
            timeout: Self::DEFAULT_TIMEOUT,
            handle_exception: false,
        }
    }

    /// Minimum interval between predicate evaluations.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Treat predicate errors as "not yet" instead of failing the wait.
    pub fn handle_exception(mut self, handle: bool) -> Self {
        self.handle_exception = handle;
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Poll until the predicate returns a truthy value.
    pub async fn until<F, Fut, T, E>(&self, predicate: F) -> Result<WaitOutcome<T>, WaitError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: Truthy,
        E: std::fmt::Display,
    {
        self.poll(predicate, Truthy::is_truthy).await
    }

    /// Poll until the predicate returns anything other than `fail_condition`.
    pub async fn until_not<F, Fut, T, E>(
        &self,
        fail_condition: T,
        predicate: F,
    ) -> Result<WaitOutcome<T>, WaitError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: PartialEq,
        E: std::fmt::Display,
    {
        self.poll(predicate, |value| *value != fail_condition).await
    }

    async fn poll<F, Fut, T, E, A>(
        &self,
        mut predicate: F,
        accept: A,
    ) -> Result<WaitOutcome<T>, WaitError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        A: Fn(&T) -> bool,
        E: std::fmt::Display,
    {
        let start = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match predicate().await {
                Ok(value) if accept(&value) => {
                    let elapsed = start.elapsed();
                    debug!(
                        message = %self.message,
                        attempts,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Wait satisfied"
                    );
                    return Ok(WaitOutcome {
                        value,
                        elapsed,
                        attempts,
                    });
                }
                Ok(_) => {
                    trace!(message = %self.message, attempts, "Wait condition not met yet");
                }
                Err(e) if self.handle_exception => {
                    debug!(
                        message = %self.message,
                        attempts,
                        error = %e,
                        "Predicate failed, treating as not ready"
                    );
                }
                Err(source) => {
                    return Err(WaitError::Predicate {
                        message: self.message.clone(),
                        source,
                    });
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= self.timeout {
                return Err(WaitError::Timeout {
                    message: self.message.clone(),
                    elapsed,
                    timeout: self.timeout,
                });
            }
            // Never sleep past the deadline; the final evaluation lands on it.
            sleep(self.delay.min(self.timeout - elapsed)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_some_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let outcome = WaitFor::new("counter reaches 3")
            .delay(Duration::from_secs(5))
            .timeout(Duration::from_secs(60))
            .until(move || {
                let counter = counter.clone();
                async move { Ok::<_, Infallible>(counter.fetch_add(1, Ordering::SeqCst) + 1 >= 3) }
            })
            .await
            .unwrap();

        assert!(outcome.value);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.elapsed, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_bounded_by_one_delay() {
        let timeout = Duration::from_secs(30);
        let delay = Duration::from_secs(7);
        let err = WaitFor::new("never")
            .delay(delay)
            .timeout(timeout)
            .until(|| async { Ok::<_, Infallible>(false) })
            .await
            .unwrap_err();

        match err {
            WaitError::Timeout { elapsed, .. } => {
                assert!(elapsed >= timeout);
                assert!(elapsed <= timeout + delay);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_until_not_fail_condition() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let outcome = WaitFor::new("status changes")
            .timeout(Duration::from_secs(10))
            .until_not("starting".to_string(), move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, Infallible>(if n < 2 { "starting" } else { "" }.to_string())
                }
            })
            .await
            .unwrap();

        // An empty string is falsy, but it still differs from the fail condition.
        assert_eq!(outcome.value, "");
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_predicate_error_propagates_by_default() {
        let err = WaitFor::new("broken")
            .until(|| async { Err::<bool, _>("connection refused") })
            .await
            .unwrap_err();
        assert!(matches!(err, WaitError::Predicate { source: "connection refused", .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_exception_keeps_polling() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let outcome = WaitFor::new("flaky")
            .handle_exception(true)
            .timeout(Duration::from_secs(10))
            .until(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err("reset by peer")
                    } else {
                        Ok(true)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 2);
    }

    #[test]
    fn test_truthiness() {
        assert!(Some(0).is_truthy());
        assert!(!None::<u8>.is_truthy());
        assert!(!Vec::<u8>::new().is_truthy());
        assert!(!"".is_truthy());
        assert!(5u32.is_truthy());
        assert!(!0i64.is_truthy());
    }
}
