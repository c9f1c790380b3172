// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Stopwatch for tracking how long runs and tests take.
//!
//! Runs and tests need to track a start time and a duration. For that we use a combination of a
//! `DateTime` (realtime clock) and an `Instant` (monotonic clock). Once the stopwatch is
//! snapshotted, we report the elapsed time using the monotonic clock.

use chrono::{DateTime, FixedOffset, Local};
use std::time::{Duration, Instant};

pub(crate) fn stopwatch() -> StopwatchStart {
    StopwatchStart::new()
}

/// The start state of a stopwatch.
#[derive(Clone, Debug)]
pub(crate) struct StopwatchStart {
    start_time: DateTime<Local>,
    instant: Instant,
}

impl StopwatchStart {
    fn new() -> Self {
        Self {
            // These two syscalls will happen imperceptibly close to each other, which is good
            // enough for our purposes.
            start_time: Local::now(),
            instant: Instant::now(),
        }
    }

    pub(crate) fn start_time(&self) -> DateTime<Local> {
        self.start_time
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.instant.elapsed()
    }

    pub(crate) fn snapshot(&self) -> StopwatchSnapshot {
        StopwatchSnapshot {
            start_time: self.start_time,
            duration: self.instant.elapsed(),
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct StopwatchSnapshot {
    pub(crate) start_time: DateTime<Local>,
    pub(crate) duration: Duration,
}

impl StopwatchSnapshot {
    pub(crate) fn start_time_fixed(&self) -> DateTime<FixedOffset> {
        self.start_time.fixed_offset()
    }

    pub(crate) fn end_time(&self) -> DateTime<Local> {
        self.start_time + self.duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopwatch_measures_elapsed() {
        let start = stopwatch();
        std::thread::sleep(Duration::from_millis(50));
        let end = start.snapshot();

        assert!(
            end.duration >= Duration::from_millis(50),
            "duration ({:?}) is at least 50ms",
            end.duration
        );
        assert!(end.end_time() >= end.start_time);
        assert_eq!(end.start_time_fixed(), start.start_time().fixed_offset());
    }
}
