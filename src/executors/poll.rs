// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 seqflow contributors

//! Status polling with exponential backoff
//!
//! Polls start at the minimum interval and ramp towards the maximum over
//! the backoff period, so short jobs get quick completion detection while
//! long jobs stop hammering the scheduler.

use std::time::{Duration, Instant};

use crate::config::RunConfig;

/// Consecutive status failures tolerated before a wait fails hard
pub const MAX_STATUS_ERRORS: u32 = 4;

/// Pause between retries after a transient status failure
pub const STATUS_RETRY_GAP: Duration = Duration::from_millis(100);

/// Poll interval tuning, taken from the run configuration
#[derive(Debug, Clone, Copy)]
pub struct PollTuning {
    /// Smallest sleep between polls (ms)
    pub min_ms: u64,
    /// Cap on the growth term added to the minimum (ms)
    pub max_ms: u64,
    /// Time over which the interval ramps to its maximum (ms)
    pub backoff_period_ms: u64,
}

impl PollTuning {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            min_ms: config.min_poll_interval_ms,
            max_ms: config.max_poll_interval_ms,
            backoff_period_ms: config.backoff_period_ms,
        }
    }
}

impl Default for PollTuning {
    fn default() -> Self {
        Self {
            min_ms: 2000,
            max_ms: 5000,
            backoff_period_ms: 180_000,
        }
    }
}

/// One wait's polling schedule
#[derive(Debug)]
pub struct PollSchedule {
    tuning: PollTuning,
    started: Instant,
}

impl PollSchedule {
    /// Start a schedule; elapsed time is measured from this moment.
    pub fn start(tuning: PollTuning) -> Self {
        Self {
            tuning,
            started: Instant::now(),
        }
    }

    /// The next sleep for a given elapsed time:
    /// `min + min(max, exp(factor * elapsed))` with
    /// `factor = ln(max - min) / backoff_period`.
    ///
    /// Bounded by `[min, min + max]` for any elapsed value.
    pub fn sleep_for_elapsed(&self, elapsed_ms: u64) -> Duration {
        let PollTuning {
            min_ms,
            max_ms,
            backoff_period_ms,
        } = self.tuning;

        if max_ms <= min_ms || backoff_period_ms == 0 {
            return Duration::from_millis(min_ms);
        }

        let factor = ((max_ms - min_ms) as f64).ln() / backoff_period_ms as f64;
        let growth = (factor * elapsed_ms as f64).exp().min(max_ms as f64);

        Duration::from_millis(min_ms + growth as u64)
    }

    /// Sleep until the next poll is due.
    pub async fn pause(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        tokio::time::sleep(self.sleep_for_elapsed(elapsed)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_bounds() {
        let schedule = PollSchedule::start(PollTuning::default());

        for elapsed in [0u64, 1, 1000, 90_000, 180_000, 360_000, u32::MAX as u64] {
            let sleep = schedule.sleep_for_elapsed(elapsed).as_millis() as u64;
            assert!(sleep >= 2000, "sleep {} below minimum at {}", sleep, elapsed);
            assert!(sleep <= 7000, "sleep {} above bound at {}", sleep, elapsed);
        }
    }

    #[test]
    fn test_backoff_reaches_maximum_at_period_end() {
        let schedule = PollSchedule::start(PollTuning::default());

        // exp(factor * backoff_period) == max - min, so the sleep is max
        let at_period = schedule.sleep_for_elapsed(180_000).as_millis() as u64;
        assert!((4900..=5100).contains(&at_period), "got {}", at_period);
    }

    #[test]
    fn test_backoff_monotonic() {
        let schedule = PollSchedule::start(PollTuning::default());

        let mut last = Duration::ZERO;
        for elapsed in (0..360_000).step_by(10_000) {
            let sleep = schedule.sleep_for_elapsed(elapsed);
            assert!(sleep >= last);
            last = sleep;
        }
    }

    #[test]
    fn test_degenerate_tuning_pins_to_minimum() {
        let schedule = PollSchedule::start(PollTuning {
            min_ms: 100,
            max_ms: 100,
            backoff_period_ms: 1000,
        });
        assert_eq!(schedule.sleep_for_elapsed(5000), Duration::from_millis(100));
    }
}
