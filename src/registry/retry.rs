use std::{thread, time::Duration};

use crate::{cancel::CancelToken, error::Error, EventHandler};

/// Upper limit for the delay between two attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Policy to repeat requests that failed with a transient error.
///
/// The delay after the first failure is `backoff`, and it is doubled
/// after every attempt.
#[derive(Clone, Debug)]
pub struct Retry {
    /// Maximum number of attempts, including the first one.
    pub attempts: u32,

    pub backoff: Duration,
}

impl Default for Retry {
    fn default() -> Self {
        Retry {
            attempts: 5,
            backoff: Duration::from_millis(250),
        }
    }
}

impl Retry {
    /// Run `f` until it succeeds, or fails with a non-retryable error.
    ///
    /// When the attempts are exhausted, it returns
    /// [`Error::RetriesExhausted`] with the last error.
    pub(crate) fn run<T>(
        &self,
        what: &str,
        cancel: &CancelToken,
        event_handler: &dyn EventHandler,
        mut f: impl FnMut() -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut delay = self.backoff;
        let mut attempt = 1;

        loop {
            cancel.check()?;

            let error = match f() {
                Err(e) if e.is_retryable() => e,
                result => return result,
            };

            if attempt >= self.attempts.max(1) {
                return Err(Error::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(error),
                });
            }

            log::warn!("{what}: attempt {attempt} failed: {error}");
            event_handler.retry(what, attempt, &error);

            thread::sleep(delay);
            delay = delay.saturating_mul(2).min(MAX_BACKOFF);
            attempt += 1;
        }
    }
}
