// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Deserialized forms of the suite file tables.

use crate::output::StreamSelector;
use camino::Utf8PathBuf;
use serde::Deserialize;
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(super) struct SuiteConfigDeserialize {
    pub(super) suite: SuiteTable,
    pub(super) isolation: IsolationTable,
    pub(super) shutdown: ShutdownTable,
    pub(super) transport: TransportTable,
    #[serde(default, rename = "worker")]
    pub(super) workers: Vec<WorkerTable>,
    #[serde(default, rename = "test")]
    pub(super) active_tests: Vec<ActiveTestTable>,
    #[serde(default, rename = "post-shutdown")]
    pub(super) post_shutdown_tests: Vec<PostShutdownTestTable>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(super) struct SuiteTable {
    pub(super) name: String,
    #[serde(with = "humantime_serde")]
    pub(super) ready_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub(super) test_timeout: Duration,
    #[serde(default, with = "humantime_serde::option")]
    pub(super) global_timeout: Option<Duration>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(super) struct IsolationTable {
    pub(super) env_var: String,
    pub(super) id_range: IdRange,
    pub(super) lock_port_base: u16,
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub(super) struct IdRange {
    pub(super) start: u32,
    pub(super) end: u32,
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(super) struct ShutdownTable {
    #[serde(with = "humantime_serde")]
    pub(super) sigint_grace: Duration,
    #[serde(with = "humantime_serde")]
    pub(super) sigterm_grace: Duration,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(super) struct TransportTable {
    pub(super) echo_command: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(super) struct WorkerTable {
    pub(super) name: String,
    pub(super) command: Vec<String>,
    // A list of KEY=VALUE strings rather than a table, so that keys keep their case.
    #[serde(default)]
    pub(super) env: Vec<String>,
    #[serde(default)]
    pub(super) cwd: Option<Utf8PathBuf>,
    #[serde(default = "default_exit_codes")]
    pub(super) expected_exit_codes: Vec<i32>,
}

fn default_exit_codes() -> Vec<i32> {
    vec![0]
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct ActiveTestTable {
    pub(super) name: String,
    #[serde(flatten)]
    pub(super) kind: ActiveTestKind,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub(super) enum ActiveTestKind {
    WaitForOutput {
        worker: String,
        pattern: String,
        #[serde(default)]
        stream: StreamSelector,
        #[serde(default = "default_wait_timeout", with = "humantime_serde")]
        timeout: Duration,
    },
    MessageCount {
        topic: String,
        #[serde(with = "humantime_serde")]
        window: Duration,
        #[serde(default = "default_capacity")]
        capacity: usize,
        #[serde(default)]
        min_count: Option<usize>,
        #[serde(default)]
        max_count: Option<usize>,
        #[serde(default)]
        contains: Option<String>,
    },
}

fn default_wait_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_capacity() -> usize {
    1024
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct PostShutdownTestTable {
    pub(super) name: String,
    #[serde(flatten)]
    pub(super) kind: PostShutdownTestKind,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub(super) enum PostShutdownTestKind {
    ExitCodes {
        #[serde(default)]
        workers: Option<Vec<String>>,
        #[serde(default)]
        allowed: Option<Vec<i32>>,
    },
    OutputContains {
        worker: String,
        pattern: String,
        #[serde(default)]
        stream: StreamSelector,
    },
}
