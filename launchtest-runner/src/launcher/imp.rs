// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::os;
use crate::{
    cancel::{CancelReason, CancelToken},
    errors::LaunchError,
    isolation::IsolationEnv,
    output::{OutputBuffer, OutputStream},
    reporter::events::{EventSink, RunEventKind},
};
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use std::{fmt, process::Stdio, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Child,
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, warn};

/// How long to wait for output pumps to drain after a worker has exited.
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// The description of a worker process.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorkerSpec {
    name: String,
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    cwd: Option<Utf8PathBuf>,
    expected_exit_codes: Vec<i32>,
}

impl WorkerSpec {
    /// Creates a new worker running `program`, expected to exit with code 0.
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            expected_exit_codes: vec![0],
        }
    }

    /// Appends arguments.
    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Adds an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets the working directory.
    pub fn cwd(mut self, cwd: impl Into<Utf8PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Sets the exit codes considered successful after shutdown.
    pub fn expected_exit_codes(mut self, codes: impl IntoIterator<Item = i32>) -> Self {
        self.expected_exit_codes = codes.into_iter().collect();
        self
    }

    /// Returns the name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the program.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Returns the arguments.
    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Returns the extra environment.
    pub fn environment(&self) -> &[(String, String)] {
        &self.env
    }

    /// Returns the working directory.
    pub fn working_dir(&self) -> Option<&Utf8Path> {
        self.cwd.as_deref()
    }

    /// Returns the expected exit codes.
    pub fn expected_codes(&self) -> &[i32] {
        &self.expected_exit_codes
    }

    /// Returns the command line, for display.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Grace periods for worker shutdown.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ShutdownSettings {
    /// The time to wait after SIGINT before sending SIGTERM.
    pub sigint_grace: Duration,

    /// The time to wait after SIGTERM before sending SIGKILL.
    pub sigterm_grace: Duration,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            sigint_grace: Duration::from_secs(5),
            sigterm_grace: Duration::from_secs(5),
        }
    }
}

/// A signal sent to workers during shutdown.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShutdownSignal {
    /// SIGINT on Unix.
    Interrupt,
    /// SIGTERM on Unix.
    Terminate,
    /// SIGKILL on Unix, process termination elsewhere.
    Kill,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => f.write_str("SIGINT"),
            Self::Terminate => f.write_str("SIGTERM"),
            Self::Kill => f.write_str("SIGKILL"),
        }
    }
}

/// How a worker process ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkerExitStatus {
    /// The process exited with a code.
    Code(i32),

    /// The process was killed by a signal.
    Signal(i32),

    /// The exit status couldn't be determined.
    Unknown,
}

impl WorkerExitStatus {
    /// Returns the status as a single code, with signals as negative numbers (e.g. `-15` for
    /// SIGTERM).
    pub fn code(self) -> Option<i32> {
        match self {
            Self::Code(code) => Some(code),
            Self::Signal(signal) => Some(-signal),
            Self::Unknown => None,
        }
    }

    pub(super) fn from_exit_status(status: std::process::ExitStatus) -> Self {
        os::exit_status(status)
    }
}

impl fmt::Display for WorkerExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "exit code {code}"),
            Self::Signal(signal) => match os::signal_name(*signal) {
                Some(name) => write!(f, "signal {signal} ({name})"),
                None => write!(f, "signal {signal}"),
            },
            Self::Unknown => f.write_str("unknown status"),
        }
    }
}

/// The lifecycle state of a worker.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkerState {
    /// Spawned, readiness delay not yet elapsed.
    Starting,
    /// Ready and running.
    Running,
    /// Exited.
    Terminated(WorkerExitStatus),
}

/// The final state of a worker after shutdown.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorkerExit {
    /// The worker.
    pub name: String,

    /// The process id, if it was known.
    pub pid: Option<u32>,

    /// How the process ended.
    pub status: WorkerExitStatus,

    /// The exit codes the worker is expected to exit with.
    pub expected_exit_codes: Vec<i32>,

    /// The last signal sent before the worker exited, or `None` if it exited on its own.
    pub last_signal: Option<ShutdownSignal>,
}

impl WorkerExit {
    /// Returns true if the exit code is one of `allowed`.
    pub fn is_allowed(&self, allowed: &[i32]) -> bool {
        self.status.code().is_some_and(|code| allowed.contains(&code))
    }

    /// Returns true if the exit code is one of the worker's expected exit codes.
    pub fn is_expected(&self) -> bool {
        self.is_allowed(&self.expected_exit_codes)
    }
}

/// Starts workers.
#[derive(Clone, Debug)]
pub struct Launcher {
    isolation: IsolationEnv,
    sink: Option<EventSink>,
    stream_output: bool,
}

impl Launcher {
    /// Creates a launcher that runs workers under `isolation`.
    pub fn new(isolation: IsolationEnv) -> Self {
        Self {
            isolation,
            sink: None,
            stream_output: false,
        }
    }

    pub(crate) fn with_events(mut self, sink: EventSink, stream_output: bool) -> Self {
        self.sink = Some(sink);
        self.stream_output = stream_output;
        self
    }

    /// Spawns every worker.
    ///
    /// If any spawn fails, workers that were already started are killed and the error is
    /// returned.
    pub fn start(&self, specs: &[WorkerSpec]) -> Result<StartedWorkers, LaunchError> {
        let mut workers = Vec::with_capacity(specs.len());
        for spec in specs {
            match self.spawn(spec) {
                Ok(worker) => workers.push(worker),
                Err(error) => {
                    for mut worker in workers {
                        worker.kill_now();
                    }
                    return Err(error);
                }
            }
        }
        Ok(StartedWorkers { workers })
    }

    fn spawn(&self, spec: &WorkerSpec) -> Result<WorkerProcess, LaunchError> {
        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args)
            .env("PYTHONUNBUFFERED", "1")
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // The isolation id always wins over worker env.
        self.isolation.apply(&mut cmd);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        os::set_process_group(&mut cmd);

        let mut child = cmd.spawn().map_err(|error| LaunchError::Spawn {
            worker: spec.name.clone(),
            command: spec.command_line(),
            error,
        })?;
        let pid = child.id();
        debug!(worker = %spec.name, ?pid, "spawned worker");
        if let Some(sink) = &self.sink {
            sink.send(RunEventKind::WorkerStarted {
                worker: spec.name.clone(),
                pid,
            });
        }

        let output = Arc::new(OutputBuffer::new(2));
        let forward = self
            .sink
            .as_ref()
            .filter(|_| self.stream_output)
            .map(|sink| (sink.clone(), spec.name.clone()));
        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump(
                stdout,
                OutputStream::Stdout,
                output.clone(),
                forward.clone(),
            )));
        } else {
            output.close_stream();
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump(
                stderr,
                OutputStream::Stderr,
                output.clone(),
                forward,
            )));
        } else {
            output.close_stream();
        }

        Ok(WorkerProcess {
            spec: spec.clone(),
            child,
            pid,
            state: WorkerState::Starting,
            last_signal: None,
            output,
            pumps,
        })
    }
}

async fn pump<R: AsyncRead + Unpin>(
    reader: R,
    stream: OutputStream,
    buffer: Arc<OutputBuffer>,
    forward: Option<(EventSink, String)>,
) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                if let Some((sink, worker)) = &forward {
                    sink.send(RunEventKind::WorkerOutput {
                        worker: worker.clone(),
                        stream,
                        line: line.to_owned(),
                    });
                }
                buffer.push(stream, line);
            }
            Err(error) => {
                debug!(%stream, %error, "error reading worker output");
                break;
            }
        }
    }
    buffer.close_stream();
}

#[derive(Debug)]
struct WorkerProcess {
    spec: WorkerSpec,
    child: Child,
    pid: Option<u32>,
    state: WorkerState,
    last_signal: Option<ShutdownSignal>,
    output: Arc<OutputBuffer>,
    pumps: Vec<JoinHandle<()>>,
}

impl WorkerProcess {
    fn is_terminated(&self) -> bool {
        matches!(self.state, WorkerState::Terminated(_))
    }

    fn record_exit(&mut self, result: std::io::Result<std::process::ExitStatus>) {
        let status = match result {
            Ok(status) => WorkerExitStatus::from_exit_status(status),
            Err(error) => {
                warn!(worker = %self.spec.name, %error, "error waiting for worker");
                WorkerExitStatus::Unknown
            }
        };
        debug!(worker = %self.spec.name, %status, "worker exited");
        self.state = WorkerState::Terminated(status);
    }

    fn try_reap(&mut self) -> Option<WorkerExitStatus> {
        if self.is_terminated() {
            return None;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.record_exit(Ok(status));
            }
            Ok(None) => return None,
            Err(error) => self.record_exit(Err(error)),
        }
        match self.state {
            WorkerState::Terminated(status) => Some(status),
            _ => None,
        }
    }

    fn signal(&mut self, signal: ShutdownSignal) {
        if self.is_terminated() {
            return;
        }
        debug!(worker = %self.spec.name, %signal, "signalling worker");
        os::send_signal(&mut self.child, signal);
        self.last_signal = Some(signal);
    }

    fn kill_now(&mut self) {
        self.signal(ShutdownSignal::Kill);
    }

    fn to_exit(&self) -> WorkerExit {
        let status = match self.state {
            WorkerState::Terminated(status) => status,
            WorkerState::Starting | WorkerState::Running => WorkerExitStatus::Unknown,
        };
        WorkerExit {
            name: self.spec.name.clone(),
            pid: self.pid,
            status,
            expected_exit_codes: self.spec.expected_exit_codes.clone(),
            last_signal: self.last_signal,
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        // Covers early returns and panics: never leave a process group behind.
        self.kill_now();
    }
}

/// Workers that have been spawned, but whose readiness delay hasn't elapsed.
#[derive(Debug)]
pub struct StartedWorkers {
    workers: Vec<WorkerProcess>,
}

/// The result of [`StartedWorkers::wait_ready`].
#[derive(Debug)]
pub enum ReadyOutcome {
    /// The readiness delay elapsed.
    Ready(RunningWorkers),

    /// The run was cancelled during the readiness delay.
    Cancelled {
        /// The workers, which should be killed.
        workers: RunningWorkers,
        /// The reason.
        reason: CancelReason,
    },
}

impl StartedWorkers {
    /// Returns the number of workers.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Returns true if there are no workers.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Waits for the readiness delay and hands out the running workers.
    pub async fn wait_ready(self, delay: Duration, cancel: &CancelToken) -> ReadyOutcome {
        let cancelled = tokio::select! {
            biased;
            reason = cancel.cancelled() => Some(reason),
            () = tokio::time::sleep(delay) => None,
        };
        let mut workers = self.workers;
        for worker in &mut workers {
            if worker.state == WorkerState::Starting {
                worker.state = WorkerState::Running;
            }
        }
        let running = RunningWorkers { workers };
        match cancelled {
            Some(reason) => ReadyOutcome::Cancelled {
                workers: running,
                reason,
            },
            None => ReadyOutcome::Ready(running),
        }
    }
}

/// Workers that are ready for active tests.
#[derive(Debug)]
pub struct RunningWorkers {
    workers: Vec<WorkerProcess>,
}

impl RunningWorkers {
    /// Returns the output buffers of every worker, in worker order.
    pub fn outputs(&self) -> IndexMap<String, Arc<OutputBuffer>> {
        self.workers
            .iter()
            .map(|worker| (worker.spec.name.clone(), worker.output.clone()))
            .collect()
    }

    /// Returns the state of every worker, in worker order.
    pub fn states(&self) -> Vec<(&str, WorkerState)> {
        self.workers
            .iter()
            .map(|worker| (worker.spec.name.as_str(), worker.state))
            .collect()
    }

    /// Checks for workers that exited on their own, returning the ones that exited since the
    /// last call.
    pub fn reap_exited(&mut self) -> Vec<(String, WorkerExitStatus)> {
        self.workers
            .iter_mut()
            .filter_map(|worker| {
                worker
                    .try_reap()
                    .map(|status| (worker.spec.name.clone(), status))
            })
            .collect()
    }

    /// Shuts workers down gracefully: SIGINT, then SIGTERM, then SIGKILL, with the configured
    /// grace periods in between.
    ///
    /// If `cancel` fires during a grace period, the remaining workers are killed right away.
    pub async fn terminate(
        mut self,
        settings: &ShutdownSettings,
        cancel: &CancelToken,
    ) -> TerminatedWorkers {
        self.reap_exited();
        for (signal, grace) in [
            (ShutdownSignal::Interrupt, settings.sigint_grace),
            (ShutdownSignal::Terminate, settings.sigterm_grace),
        ] {
            if self.all_terminated() || cancel.is_cancelled() {
                break;
            }
            for worker in &mut self.workers {
                worker.signal(signal);
            }
            tokio::select! {
                () = wait_all(&mut self.workers, Some(grace)) => {}
                reason = cancel.cancelled() => {
                    debug!(%reason, "cancelled during graceful shutdown, killing workers");
                }
            }
        }
        self.kill().await
    }

    /// Kills workers immediately.
    pub async fn kill(mut self) -> TerminatedWorkers {
        self.reap_exited();
        for worker in &mut self.workers {
            worker.kill_now();
        }
        wait_all(&mut self.workers, None).await;

        for worker in &mut self.workers {
            for pump in &mut worker.pumps {
                if tokio::time::timeout(PUMP_DRAIN_TIMEOUT, &mut *pump)
                    .await
                    .is_err()
                {
                    // A grandchild outside the process group may still hold the pipe open.
                    debug!(worker = %worker.spec.name, "output pump did not drain");
                    pump.abort();
                }
            }
        }

        TerminatedWorkers::new(
            self.workers.iter().map(WorkerProcess::to_exit).collect(),
            self.outputs(),
        )
    }

    fn all_terminated(&self) -> bool {
        self.workers.iter().all(WorkerProcess::is_terminated)
    }
}

async fn wait_all(workers: &mut [WorkerProcess], grace: Option<Duration>) {
    let deadline = grace.map(|grace| Instant::now() + grace);
    let waits = workers
        .iter_mut()
        .filter(|worker| !worker.is_terminated())
        .map(|worker| async move {
            let result = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, worker.child.wait()).await {
                        Ok(result) => result,
                        Err(_) => return,
                    }
                }
                None => worker.child.wait().await,
            };
            worker.record_exit(result);
        });
    futures::future::join_all(waits).await;
}

/// Workers that have all exited. Required for post-shutdown tests.
#[derive(Clone, Debug)]
pub struct TerminatedWorkers {
    exits: Vec<WorkerExit>,
    outputs: IndexMap<String, Arc<OutputBuffer>>,
}

impl TerminatedWorkers {
    pub(crate) fn new(exits: Vec<WorkerExit>, outputs: IndexMap<String, Arc<OutputBuffer>>) -> Self {
        Self { exits, outputs }
    }

    /// Returns the exits, in worker order.
    pub fn exits(&self) -> &[WorkerExit] {
        &self.exits
    }

    /// Returns the exit of the named worker.
    pub fn exit(&self, name: &str) -> Option<&WorkerExit> {
        self.exits.iter().find(|exit| exit.name == name)
    }

    /// Returns the final output of every worker.
    pub fn outputs(&self) -> &IndexMap<String, Arc<OutputBuffer>> {
        &self.outputs
    }
}
