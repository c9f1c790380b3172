// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Launch-style integration tests for long-running worker processes.
//!
//! `launchtest run-tests` starts the workers described by one or more suite files, runs active
//! tests against them, shuts them down, runs post-shutdown tests, and writes a report per run.
//! `launchtest show-results` aggregates those reports.

#![warn(missing_docs)]

mod dispatch;
mod errors;
mod output;

#[doc(hidden)]
pub use dispatch::*;
#[doc(hidden)]
pub use errors::*;
#[doc(hidden)]
pub use output::{OutputContext, OutputWriter, StderrStyles};
