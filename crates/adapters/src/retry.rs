use std::thread;
use std::time::Duration;

use log::warn;
use novel_core::llm::ErrorKind;

use crate::error::AdapterError;

const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub sleep: Duration,
    /// First wait after a rate-limited attempt; doubles per attempt, capped at 60s.
    pub rate_limit_sleep: Duration,
}

impl RetryConfig {
    pub const fn new(max_retries: usize, sleep: Duration) -> Self {
        Self {
            max_retries,
            sleep,
            rate_limit_sleep: Duration::from_secs(4),
        }
    }

    pub fn with_rate_limit_sleep(mut self, sleep: Duration) -> Self {
        self.rate_limit_sleep = sleep;
        self
    }

    fn delay_for(&self, error: &AdapterError, attempt: usize) -> Duration {
        if error.is_rate_limited() {
            let factor = 1u32.checked_shl(attempt.saturating_sub(1) as u32).unwrap_or(u32::MAX);
            self.rate_limit_sleep
                .checked_mul(factor)
                .unwrap_or(MAX_RATE_LIMIT_WAIT)
                .min(MAX_RATE_LIMIT_WAIT)
        } else {
            self.sleep
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2))
    }
}

fn is_permanent(error: &AdapterError) -> bool {
    matches!(
        error,
        AdapterError::InvalidConfig(_) | AdapterError::Config(_)
    ) || error.kind() == ErrorKind::Authentication
}

/// Runs `f` until it succeeds or `max_retries` attempts are spent.
///
/// Configuration and authentication failures are returned at once. Rate-limited
/// attempts back off exponentially; everything else waits `sleep`.
pub fn call_with_retry<F, T>(mut f: F, config: &RetryConfig) -> Result<T, AdapterError>
where
    F: FnMut() -> Result<T, AdapterError>,
{
    let attempts = config.max_retries.max(1);
    let mut attempt = 1;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if is_permanent(&err) => return Err(err),
            Err(err) if attempt >= attempts => {
                return Err(AdapterError::retry_exhausted(attempts, err));
            }
            Err(err) => {
                let delay = config.delay_for(&err, attempt);
                let label = if err.is_rate_limited() { "（限流）" } else { "" };
                warn!(
                    "[call_with_retry] attempt {attempt}/{attempts} failed{label}: {err}; retrying in {delay:?}"
                );
                thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use reqwest::StatusCode;

    use super::*;

    fn http(code: u16) -> AdapterError {
        AdapterError::HttpStatus {
            status: StatusCode::from_u16(code).unwrap(),
            body: String::new(),
        }
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let calls = Cell::new(0);
        let config = RetryConfig::new(3, Duration::ZERO).with_rate_limit_sleep(Duration::ZERO);
        let value = call_with_retry(
            || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err(http(503))
                } else {
                    Ok("vector")
                }
            },
            &config,
        )
        .unwrap();
        assert_eq!(value, "vector");
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn authentication_failures_are_not_retried() {
        let calls = Cell::new(0);
        let result: Result<(), _> = call_with_retry(
            || {
                calls.set(calls.get() + 1);
                Err(http(401))
            },
            &RetryConfig::new(5, Duration::ZERO),
        );
        assert!(matches!(result, Err(AdapterError::HttpStatus { .. })));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn exhausted_retries_keep_the_last_error() {
        let config = RetryConfig::new(2, Duration::ZERO).with_rate_limit_sleep(Duration::ZERO);
        let err = call_with_retry(|| -> Result<(), _> { Err(http(429)) }, &config).unwrap_err();
        assert!(matches!(err, AdapterError::RetryExhausted { attempts: 2, .. }));
        assert!(err.is_rate_limited());
    }

    #[test]
    fn rate_limit_waits_double_and_cap() {
        let config = RetryConfig::default();
        let limited = http(429);
        assert_eq!(config.delay_for(&limited, 1), Duration::from_secs(4));
        assert_eq!(config.delay_for(&limited, 2), Duration::from_secs(8));
        assert_eq!(config.delay_for(&limited, 5), Duration::from_secs(60));
        assert_eq!(config.delay_for(&http(500), 3), Duration::from_secs(2));
    }
}
