// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{ShutdownSignal, WorkerExitStatus};
use tokio::process::Child;

pub(super) fn set_process_group(_cmd: &mut tokio::process::Command) {}

// There are no graceful signals here: every shutdown step terminates the process.
pub(super) fn send_signal(child: &mut Child, _signal: ShutdownSignal) {
    _ = child.start_kill();
}

pub(super) fn exit_status(status: std::process::ExitStatus) -> WorkerExitStatus {
    match status.code() {
        Some(code) => WorkerExitStatus::Code(code),
        None => WorkerExitStatus::Unknown,
    }
}

pub(super) fn signal_name(_signal: i32) -> Option<&'static str> {
    None
}
