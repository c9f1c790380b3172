// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The suite runner.
//!
//! The main type here is [`TestRunner`], which is constructed via a [`TestRunnerBuilder`].
//!
//! Each suite is one isolated run: an isolation id is leased, workers are launched and given
//! time to become ready, active tests run against them in order, the workers are shut down, and
//! post-shutdown tests run against how they exited. The result is a
//! [`RunReportSummary`](launchtest_metadata::RunReportSummary) per suite.

mod imp;

pub use imp::*;
