// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Command-line parsing and command execution.

mod app;
mod cli;
mod execution;

pub use app::LaunchtestApp;
