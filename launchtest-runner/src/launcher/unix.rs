// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{ShutdownSignal, WorkerExitStatus};
use nix::{
    sys::signal::{Signal, killpg},
    unistd::Pid,
};
use std::os::unix::process::ExitStatusExt;
use tokio::process::Child;
use tracing::debug;

/// Each worker runs in its own process group, so that signals reach its children too.
pub(super) fn set_process_group(cmd: &mut tokio::process::Command) {
    cmd.process_group(0);
}

pub(super) fn send_signal(child: &mut Child, signal: ShutdownSignal) {
    // The child was already reaped: its process group may have been reused.
    let Some(pid) = child.id() else {
        return;
    };
    let Ok(pid) = i32::try_from(pid) else {
        return;
    };
    let signal = match signal {
        ShutdownSignal::Interrupt => Signal::SIGINT,
        ShutdownSignal::Terminate => Signal::SIGTERM,
        ShutdownSignal::Kill => Signal::SIGKILL,
    };
    // The process group id is the same as the pid of the leader.
    if let Err(errno) = killpg(Pid::from_raw(pid), signal) {
        debug!(pid, %signal, %errno, "failed to signal process group");
        if signal == Signal::SIGKILL {
            _ = child.start_kill();
        }
    }
}

pub(super) fn exit_status(status: std::process::ExitStatus) -> WorkerExitStatus {
    match (status.code(), status.signal()) {
        (Some(code), _) => WorkerExitStatus::Code(code),
        (None, Some(signal)) => WorkerExitStatus::Signal(signal),
        (None, None) => WorkerExitStatus::Unknown,
    }
}

pub(super) fn signal_name(signal: i32) -> Option<&'static str> {
    Signal::try_from(signal).ok().map(Signal::as_str)
}
