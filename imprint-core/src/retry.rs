use crate::error::DeviceError;
use log::warn;
use std::time::Duration;

/// Bounded retries with exponential backoff for transient device errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Duration::ZERO,
        }
    }

    pub fn from_options(opts: &crate::config::JobOptions) -> Self {
        Self {
            max_retries: opts.max_retries,
            backoff: opts.retry_backoff(),
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(1 << attempt.min(16))
    }

    /// Runs `op`, retrying while it fails transiently and the budget lasts.
    pub fn run<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> Result<T, DeviceError>,
    ) -> Result<T, DeviceError> {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = self.delay(attempt);
                    attempt += 1;
                    warn!(
                        "{what} failed ({e}); retry {attempt}/{} in {delay:?}",
                        self.max_retries
                    );
                    std::thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn transient() -> DeviceError {
        DeviceError::Io {
            device: "/dev/sdx".into(),
            source: io::Error::other("flaky"),
        }
    }

    #[test]
    fn recovers_within_budget() {
        let policy = RetryPolicy {
            max_retries: 2,
            backoff: Duration::ZERO,
        };
        let mut calls = 0;
        let res = policy.run("write", || {
            calls += 1;
            if calls < 3 { Err(transient()) } else { Ok(calls) }
        });
        assert_eq!(res.unwrap(), 3);
    }

    #[test]
    fn gives_up_after_budget() {
        let policy = RetryPolicy {
            max_retries: 2,
            backoff: Duration::ZERO,
        };
        let mut calls = 0;
        let res: Result<(), _> = policy.run("write", || {
            calls += 1;
            Err(transient())
        });
        assert!(res.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn fatal_errors_are_not_retried() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff: Duration::ZERO,
        };
        let mut calls = 0;
        let res: Result<(), _> = policy.run("write", || {
            calls += 1;
            Err(DeviceError::Removed("/dev/sdx".into()))
        });
        assert!(matches!(res, Err(DeviceError::Removed(_))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy {
            max_retries: 3,
            backoff: Duration::from_millis(100),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
    }
}
