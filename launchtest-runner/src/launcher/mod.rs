// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Starting and stopping workers.
//!
//! Workers move through three typestate handles: [`StartedWorkers`] right after spawning,
//! [`RunningWorkers`] once the readiness delay has elapsed, and [`TerminatedWorkers`] after
//! shutdown. Post-shutdown tests can only be run against a `TerminatedWorkers`, so every worker is
//! guaranteed to have exited by then.

mod imp;

#[cfg(unix)]
#[path = "unix.rs"]
mod os;

#[cfg(not(unix))]
#[path = "other.rs"]
mod os;

pub use imp::*;
