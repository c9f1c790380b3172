// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::elements::{
    ActiveTestKind, ActiveTestTable, PostShutdownTestKind, PostShutdownTestTable,
    SuiteConfigDeserialize, WorkerTable,
};
use crate::{
    errors::{ConfigParseError, ConfigParseErrorKind, SuiteValidationError},
    isolation::IsolationSettings,
    launcher::{ShutdownSettings, WorkerSpec},
    routine::{ExitCodes, MessageCount, OutputContains, WaitForOutput},
    suite::{Suite, SuiteSettings},
    transport::{CommandTransport, MAX_SUBSCRIPTION_CAPACITY},
};
use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, ConfigBuilder, ConfigError, File, FileFormat, builder::DefaultState};
use regex::Regex;
use std::{collections::BTreeSet, num::NonZeroUsize, sync::Arc};
use tracing::warn;

/// Trait for handling configuration warnings.
///
/// This trait allows for different warning handling strategies, such as logging warnings
/// (the default behavior) or collecting them for testing purposes.
pub trait ConfigWarnings {
    /// Handle unknown configuration keys found in a suite file.
    fn unknown_config_keys(&mut self, config_file: &Utf8Path, unknown: &BTreeSet<String>);
}

/// Default implementation of ConfigWarnings that logs warnings using the tracing crate.
pub struct DefaultConfigWarnings;

impl ConfigWarnings for DefaultConfigWarnings {
    fn unknown_config_keys(&mut self, config_file: &Utf8Path, unknown: &BTreeSet<String>) {
        let mut unknown_str = String::new();
        if let [key] = unknown.iter().collect::<Vec<_>>().as_slice() {
            // Print this on the same line.
            unknown_str.push_str("key: ");
            unknown_str.push_str(key);
        } else {
            unknown_str.push_str("keys:\n");
            for ignored_key in unknown {
                unknown_str.push('\n');
                unknown_str.push_str("  - ");
                unknown_str.push_str(ignored_key);
            }
        }

        warn!("in suite file {config_file}, ignoring unknown configuration {unknown_str}")
    }
}

/// A suite loaded from a suite file.
#[derive(Clone, Debug)]
pub struct SuiteConfig {
    config_file: Utf8PathBuf,
    suite: Suite,
}

impl SuiteConfig {
    /// The default configuration, layered underneath every suite file.
    pub const DEFAULT_CONFIG: &'static str = include_str!("../../default-config.toml");

    /// The suite file read if none is specified.
    pub const DEFAULT_FILE_NAME: &'static str = "launchtest.toml";

    /// Reads a suite file from disk.
    ///
    /// Relative worker working directories are resolved against the directory containing the
    /// suite file.
    pub fn from_path(
        config_file: impl Into<Utf8PathBuf>,
        warnings: &mut impl ConfigWarnings,
    ) -> Result<Self, ConfigParseError> {
        let config_file = config_file.into();
        let builder = Self::make_default_config()
            .add_source(File::new(config_file.as_str(), FileFormat::Toml));
        Self::build(config_file, builder, warnings)
    }

    /// Parses a suite file from a string. `config_file` is used for error messages and to resolve
    /// relative paths.
    pub fn from_contents(
        config_file: impl Into<Utf8PathBuf>,
        contents: &str,
        warnings: &mut impl ConfigWarnings,
    ) -> Result<Self, ConfigParseError> {
        let builder =
            Self::make_default_config().add_source(File::from_str(contents, FileFormat::Toml));
        Self::build(config_file.into(), builder, warnings)
    }

    /// Returns the suite file this suite was read from.
    pub fn config_file(&self) -> &Utf8Path {
        &self.config_file
    }

    /// Returns the suite.
    pub fn suite(&self) -> &Suite {
        &self.suite
    }

    /// Consumes `self`, returning the suite.
    pub fn into_suite(self) -> Suite {
        self.suite
    }

    fn build(
        config_file: Utf8PathBuf,
        builder: ConfigBuilder<DefaultState>,
        warnings: &mut impl ConfigWarnings,
    ) -> Result<Self, ConfigParseError> {
        let (config, unknown) = match Self::build_and_deserialize_config(&builder) {
            Ok(result) => result,
            Err(kind) => return Err(ConfigParseError::new(config_file, kind)),
        };
        if !unknown.is_empty() {
            warnings.unknown_config_keys(&config_file, &unknown);
        }

        let base_dir = config_file
            .parent()
            .map(Utf8Path::to_path_buf)
            .unwrap_or_default();
        match convert(config, &base_dir) {
            Ok(suite) => Ok(Self { config_file, suite }),
            Err(error) => Err(ConfigParseError::new(
                config_file,
                ConfigParseErrorKind::Validation(error),
            )),
        }
    }

    fn make_default_config() -> ConfigBuilder<DefaultState> {
        Config::builder().add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
    }

    /// This returns a tuple of (config, ignored paths).
    fn build_and_deserialize_config(
        builder: &ConfigBuilder<DefaultState>,
    ) -> Result<(SuiteConfigDeserialize, BTreeSet<String>), ConfigParseErrorKind> {
        let config = builder
            .build_cloned()
            .map_err(|error| ConfigParseErrorKind::BuildError(Box::new(error)))?;

        let mut ignored = BTreeSet::new();
        let mut cb = |path: serde_ignored::Path| {
            ignored.insert(path.to_string());
        };
        let ignored_de = serde_ignored::Deserializer::new(config, &mut cb);
        let config: SuiteConfigDeserialize = serde_path_to_error::deserialize(ignored_de)
            .map_err(|error| {
                // Both serde_path_to_error and the config crate report the key. We drop the key
                // from the config error for consistency.
                let path = error.path().clone();
                let config_error = error.into_inner();
                let error = match config_error {
                    ConfigError::At { error, .. } => *error,
                    other => other,
                };
                ConfigParseErrorKind::DeserializeError(Box::new(serde_path_to_error::Error::new(
                    path, error,
                )))
            })?;

        Ok((config, ignored))
    }
}

fn convert(config: SuiteConfigDeserialize, base_dir: &Utf8Path) -> Result<Suite, SuiteValidationError> {
    let mut builder = Suite::builder(config.suite.name);
    builder
        .settings(SuiteSettings {
            ready_delay: config.suite.ready_delay,
            test_timeout: config.suite.test_timeout,
            global_timeout: config.suite.global_timeout,
        })
        .isolation(IsolationSettings::new(
            config.isolation.env_var,
            config.isolation.id_range.start..=config.isolation.id_range.end,
            config.isolation.lock_port_base,
        ))
        .shutdown(ShutdownSettings {
            sigint_grace: config.shutdown.sigint_grace,
            sigterm_grace: config.shutdown.sigterm_grace,
        });

    if config.transport.echo_command.is_empty() {
        return Err(SuiteValidationError::EmptyEchoCommand);
    }
    builder.transport(Arc::new(CommandTransport::new(
        config.transport.echo_command,
    )));

    let worker_names: BTreeSet<_> = config
        .workers
        .iter()
        .map(|worker| worker.name.clone())
        .collect();
    let check_worker = |test: &str, worker: &str| {
        if worker_names.contains(worker) {
            Ok(())
        } else {
            Err(SuiteValidationError::UnknownWorker {
                test: test.to_owned(),
                worker: worker.to_owned(),
            })
        }
    };

    for worker in config.workers {
        builder.worker(convert_worker(worker, base_dir)?);
    }

    for ActiveTestTable { name, kind } in config.active_tests {
        match kind {
            ActiveTestKind::WaitForOutput {
                worker,
                pattern,
                stream,
                timeout,
            } => {
                check_worker(&name, &worker)?;
                let pattern = compile(&name, &pattern)?;
                builder.active_test(
                    name,
                    WaitForOutput {
                        worker,
                        pattern,
                        stream,
                        timeout,
                    },
                );
            }
            ActiveTestKind::MessageCount {
                topic,
                window,
                capacity,
                min_count,
                max_count,
                contains,
            } => {
                let capacity = NonZeroUsize::new(capacity)
                    .ok_or_else(|| SuiteValidationError::ZeroCapacity { test: name.clone() })?;
                if capacity.get() > MAX_SUBSCRIPTION_CAPACITY {
                    return Err(SuiteValidationError::CapacityTooLarge {
                        test: name,
                        capacity: capacity.get(),
                    });
                }
                if let (Some(min), Some(max)) = (min_count, max_count) {
                    if min > max {
                        return Err(SuiteValidationError::CountRange {
                            test: name,
                            min,
                            max,
                        });
                    }
                }
                builder.active_test(
                    name,
                    MessageCount {
                        topic,
                        window,
                        capacity,
                        min_count,
                        max_count,
                        contains,
                    },
                );
            }
        }
    }

    for PostShutdownTestTable { name, kind } in config.post_shutdown_tests {
        match kind {
            PostShutdownTestKind::ExitCodes { workers, allowed } => {
                for worker in workers.iter().flatten() {
                    check_worker(&name, worker)?;
                }
                builder.post_shutdown_test(name, ExitCodes { workers, allowed });
            }
            PostShutdownTestKind::OutputContains {
                worker,
                pattern,
                stream,
            } => {
                check_worker(&name, &worker)?;
                let pattern = compile(&name, &pattern)?;
                builder.post_shutdown_test(
                    name,
                    OutputContains {
                        worker,
                        pattern,
                        stream,
                    },
                );
            }
        }
    }

    builder.build()
}

fn convert_worker(worker: WorkerTable, base_dir: &Utf8Path) -> Result<WorkerSpec, SuiteValidationError> {
    let mut command = worker.command.into_iter();
    let program = command
        .next()
        .ok_or_else(|| SuiteValidationError::EmptyCommand {
            worker: worker.name.clone(),
        })?;
    let mut spec = WorkerSpec::new(worker.name.clone(), program)
        .args(command)
        .expected_exit_codes(worker.expected_exit_codes);
    for entry in worker.env {
        match entry.split_once('=') {
            Some((key, value)) if !key.is_empty() => spec = spec.env(key, value),
            _ => {
                return Err(SuiteValidationError::InvalidEnv {
                    worker: worker.name,
                    entry,
                });
            }
        }
    }
    if let Some(cwd) = worker.cwd {
        spec = spec.cwd(base_dir.join(cwd));
    }
    Ok(spec)
}

fn compile(test: &str, pattern: &str) -> Result<Regex, SuiteValidationError> {
    Regex::new(pattern).map_err(|error| SuiteValidationError::InvalidPattern {
        test: test.to_owned(),
        error,
    })
}
