//! Bounded retry for blob I/O
//!
//! An operation is tried up to `attempts` times with a fixed pause between
//! tries. Every failed attempt is logged as `attempt n/N`. Errors the
//! caller marks as permanent end the loop at once.

use std::fmt::Display;
use std::thread;
use std::time::Duration;

use crate::observability::{log_event_with_fields, Event};

pub const RETRY_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(delay: Duration) -> Self {
        Self {
            attempts: RETRY_ATTEMPTS,
            delay,
        }
    }

    /// Same attempt count, no pause. Used where waiting buys nothing.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Runs `op` until it succeeds, fails permanently, or the attempts
    /// run out. Returns the last error.
    pub fn run<T, E, F, P>(&self, operation: &str, is_transient: P, mut op: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Result<T, E>,
        P: Fn(&E) -> bool,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if attempt < attempts && is_transient(&err) => {
                    log_event_with_fields(
                        Event::RetryAttemptFailed,
                        &[
                            ("operation", operation),
                            ("attempt", &format!("{}/{}", attempt, attempts)),
                            ("error", &err.to_string()),
                        ],
                    );
                    if !self.delay.is_zero() {
                        thread::sleep(self.delay);
                    }
                    attempt += 1;
                }
                Err(err) => {
                    if is_transient(&err) {
                        log_event_with_fields(
                            Event::RetryExhausted,
                            &[
                                ("operation", operation),
                                ("attempt", &format!("{}/{}", attempt, attempts)),
                                ("error", &err.to_string()),
                            ],
                        );
                    }
                    return Err(err);
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(2000))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Debug, PartialEq)]
    enum Failure {
        Flaky,
        Fatal,
    }

    impl Display for Failure {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    fn transient(e: &Failure) -> bool {
        *e == Failure::Flaky
    }

    #[test]
    fn test_recovers_after_transient_failures() {
        let calls = Cell::new(0);
        let result = RetryPolicy::immediate().run("put", transient, || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(Failure::Flaky)
            } else {
                Ok(calls.get())
            }
        });
        assert_eq!(result, Ok(3));
    }

    #[test]
    fn test_gives_up_after_five_attempts() {
        let calls = Cell::new(0);
        let result: Result<(), _> = RetryPolicy::immediate().run("put", transient, || {
            calls.set(calls.get() + 1);
            Err(Failure::Flaky)
        });
        assert_eq!(result, Err(Failure::Flaky));
        assert_eq!(calls.get(), RETRY_ATTEMPTS);
    }

    #[test]
    fn test_permanent_error_is_not_retried() {
        let calls = Cell::new(0);
        let result: Result<(), _> = RetryPolicy::immediate().run("read", transient, || {
            calls.set(calls.get() + 1);
            Err(Failure::Fatal)
        });
        assert_eq!(result, Err(Failure::Fatal));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_delay_applies_between_attempts() {
        let policy = RetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(20),
        };
        let started = std::time::Instant::now();
        let _: Result<(), _> = policy.run("read", transient, || Err(Failure::Flaky));
        assert!(started.elapsed() >= Duration::from_millis(40));
    }
}
