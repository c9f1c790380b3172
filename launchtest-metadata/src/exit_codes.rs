// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

/// Documented exit codes for `launchtest` failures.
///
/// `launchtest` runs may fail for a variety of reasons. This structure documents the exit codes
/// that may occur in case of expected failures.
///
/// Unknown/unexpected failures will always result in exit code 1.
pub enum LaunchtestExitCode {}

impl LaunchtestExitCode {
    /// No errors occurred and launchtest exited normally.
    pub const OK: i32 = 0;

    /// No tests were selected to run, but no other errors occurred.
    pub const NO_TESTS_RUN: i32 = 4;

    /// A user issue happened while setting up a launchtest invocation, for example an invalid
    /// suite file or an exhausted isolation id range.
    pub const SETUP_ERROR: i32 = 96;

    /// One or more tests failed or errored, or a run was cancelled.
    ///
    /// `launchtest show-results` also uses this code if the aggregated results contain errors or
    /// failures.
    pub const TEST_RUN_FAILED: i32 = 100;

    /// One or more workers failed to start.
    pub const LAUNCH_FAILED: i32 = 101;

    /// Writing data to stdout or stderr, or writing a report file, produced an error.
    pub const WRITE_OUTPUT_ERROR: i32 = 110;
}
