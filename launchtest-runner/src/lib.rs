// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core functionality for launchtest: launch-style integration tests for long-running worker
//! processes.
//!
//! The basic flow of a run is:
//!
//! 1. A [`Suite`](suite::Suite) is loaded from a suite file by [`config`], or built in code.
//! 2. The [`TestRunner`](runner::TestRunner) leases an isolation id for each suite
//!    ([`isolation`]), starts its workers ([`launcher`]), and runs active tests against them.
//! 3. Workers are shut down, and post-shutdown tests inspect how they exited.
//! 4. Each run produces a report, which [`reporter`] displays and persists.
//! 5. Later, [`results`] aggregates persisted reports into a summary.

pub mod cancel;
pub mod config;
pub mod errors;
pub mod helpers;
pub mod isolation;
pub mod launcher;
pub mod output;
pub mod reporter;
pub mod results;
pub mod routine;
pub mod runner;
pub mod signal;
pub mod suite;
pub mod test_filter;
mod time;
pub mod transport;
