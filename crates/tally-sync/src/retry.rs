//! # Retry Policy
//!
//! Delays between reconcile attempts within one sync pass.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  retry_attempts = 3 (total attempts)                                    │
//! │                                                                         │
//! │  Fixed(1000ms):                                                         │
//! │    attempt 1 ──► 1000ms ──► attempt 2 ──► 1000ms ──► attempt 3          │
//! │                                                                         │
//! │  Exponential{1000ms, ×2, max 30s}:                                      │
//! │    attempt 1 ──► 1000ms ──► attempt 2 ──► 2000ms ──► attempt 3          │
//! │                                                                         │
//! │  No delay after the final attempt.                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use backoff::backoff::{Backoff, Constant};
use backoff::ExponentialBackoff;

/// How long to wait between reconcile attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryPolicy {
    /// Same delay every time.
    Fixed { delay: Duration },
    /// Delay grows by `multiplier` per attempt, capped at `max`. No jitter.
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Fixed {
            delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// Starts a fresh delay schedule for one sync pass.
    pub fn schedule(&self) -> RetrySchedule {
        let inner: Box<dyn Backoff + Send> = match self {
            RetryPolicy::Fixed { delay } => Box::new(Constant::new(*delay)),
            RetryPolicy::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let mut backoff = ExponentialBackoff {
                    initial_interval: *initial,
                    max_interval: *max,
                    multiplier: *multiplier,
                    randomization_factor: 0.0,
                    max_elapsed_time: None,
                    ..Default::default()
                };
                // current_interval starts from the library default otherwise
                backoff.reset();
                Box::new(backoff)
            }
        };

        RetrySchedule { inner }
    }
}

/// Iterator-like source of successive retry delays.
pub struct RetrySchedule {
    inner: Box<dyn Backoff + Send>,
}

impl RetrySchedule {
    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.inner.next_backoff().unwrap_or(Duration::ZERO)
    }
}

impl std::fmt::Debug for RetrySchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrySchedule").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_schedule() {
        let mut schedule = RetryPolicy::Fixed {
            delay: Duration::from_millis(250),
        }
        .schedule();

        for _ in 0..5 {
            assert_eq!(schedule.next_delay(), Duration::from_millis(250));
        }
    }

    #[test]
    fn test_exponential_schedule_is_capped() {
        let mut schedule = RetryPolicy::Exponential {
            initial: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_millis(350),
        }
        .schedule();

        assert_eq!(schedule.next_delay(), Duration::from_millis(100));
        assert_eq!(schedule.next_delay(), Duration::from_millis(200));
        assert_eq!(schedule.next_delay(), Duration::from_millis(350));
        assert_eq!(schedule.next_delay(), Duration::from_millis(350));
    }
}
