// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Report the results of a run in human and machine-readable formats.
//!
//! [`Displayer`] renders [`RunEvent`](events::RunEvent)s for a terminal, and [`write_reports`]
//! persists a finished run as a native JSON report and an XUnit report.

mod displayer;
pub mod events;
mod writer;

pub use displayer::*;
pub use writer::*;
