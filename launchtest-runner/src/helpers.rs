// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Helpers shared across modules.

use std::{fmt, time::Duration};

/// Utilities for pluralizing various words based on count or plurality.
pub mod plural {
    /// Returns "test" if `count` is 1, otherwise "tests".
    pub fn tests_str(count: usize) -> &'static str {
        if count == 1 { "test" } else { "tests" }
    }

    /// Returns "worker" if `count` is 1, otherwise "workers".
    pub fn workers_str(count: usize) -> &'static str {
        if count == 1 { "worker" } else { "workers" }
    }

    /// Returns "suite" if `count` is 1, otherwise "suites".
    pub fn suites_str(count: usize) -> &'static str {
        if count == 1 { "suite" } else { "suites" }
    }

    /// Returns "file" if `count` is 1, otherwise "files".
    pub fn files_str(count: usize) -> &'static str {
        if count == 1 { "file" } else { "files" }
    }
}

pub(crate) struct DisplayBracketedDuration(pub(crate) Duration);

impl fmt::Display for DisplayBracketedDuration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // * > means right-align.
        // * 8 is the number of characters to pad to.
        // * .3 means print three digits after the decimal point.
        write!(f, "[{:>8.3?}s] ", self.0.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bracketed_duration_is_padded() {
        assert_eq!(
            DisplayBracketedDuration(Duration::from_millis(1500)).to_string(),
            "[   1.500s] "
        );
    }
}
