// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Structured access to launchtest's machine-readable output.
//!
//! This crate contains the documented exit codes of the `launchtest` binary
//! and the native report format written once per isolated run.

#![warn(missing_docs)]

mod exit_codes;
mod report;

pub use exit_codes::*;
pub use report::*;
