// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Suite files.
//!
//! A suite file is a TOML file (by default `launchtest.toml`) describing workers and the tests to
//! run against them. It is layered on top of an embedded default configuration, so only the suite
//! name is required.

mod elements;
mod imp;

pub use imp::*;
