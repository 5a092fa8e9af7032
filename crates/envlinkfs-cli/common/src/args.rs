// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::prelude::*;

#[cfg(test)]
#[path = "./args_test.rs"]
mod args_test;

const ENVLINKFS_LOG: &str = "ENVLINKFS_LOG";

/// Command line flags for configuring logging
#[derive(Debug, Clone, clap::Args)]
pub struct Logging {
    /// Make output more verbose, can be specified more than once
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Also write all logs to the given file
    #[clap(long, global = true, env = "ENVLINKFS_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Also send logs to syslog, for processes that
    /// will move into the background
    #[clap(skip)]
    pub syslog: bool,
}

impl Logging {
    pub fn configure(&self) -> Result<()> {
        configure_logging(self.verbose as usize, self.syslog, self.log_file.as_deref())
    }
}

/// The filter directives for a verbosity level.
///
/// At the default verbosity an existing `ENVLINKFS_LOG` value is
/// used as is. Any `RUST_LOG` directives are always appended.
pub fn log_filter(verbosity: usize, existing: Option<&str>, overrides: Option<&str>) -> String {
    let mut config = match verbosity {
        0 => existing.unwrap_or("envlinkfs=info,warn").to_string(),
        1 => "envlinkfs=debug,info".to_string(),
        2 => "envlinkfs=trace,info".to_string(),
        3 => "envlinkfs=trace,fuser=debug,info".to_string(),
        _ => "trace".to_string(),
    };
    if let Some(overrides) = overrides.filter(|o| !o.is_empty()) {
        config.push(',');
        config.push_str(overrides);
    }
    config
}

/// Where log records are written, besides any log file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    Stderr,
    Syslog,
}

/// The writers to install for a process that may move into
/// the background.
///
/// Stderr is always kept, so that failures before the process
/// detaches still reach the terminal. Detaching points it at
/// `/dev/null`, after which only syslog receives anything.
pub fn log_targets(syslog: bool) -> Vec<LogTarget> {
    let mut targets = vec![LogTarget::Stderr];
    if syslog {
        targets.push(LogTarget::Syslog);
    }
    targets
}

/// Install the global logger.
///
/// Records emitted through the `log` crate, such as those
/// from the fuse session itself, are captured as well.
pub fn configure_logging(verbosity: usize, syslog: bool, log_file: Option<&Path>) -> Result<()> {
    let existing = std::env::var(ENVLINKFS_LOG).ok();
    let overrides = std::env::var("RUST_LOG").ok();
    let config = log_filter(verbosity, existing.as_deref(), overrides.as_deref());

    let mut stderr_log = None;
    let mut syslog_log = None;
    for target in log_targets(syslog) {
        match target {
            LogTarget::Stderr => {
                stderr_log = Some(
                    tracing_subscriber::fmt::layer()
                        .without_time()
                        .with_target(verbosity > 2)
                        .with_writer(std::io::stderr)
                        .with_filter(EnvFilter::new(&config)),
                )
            }
            LogTarget::Syslog => {
                let (options, facility) = Default::default();
                match syslog_tracing::Syslog::new(c"envlinkfs", options, facility) {
                    Some(writer) => {
                        syslog_log = Some(
                            tracing_subscriber::fmt::layer()
                                .without_time()
                                .with_target(verbosity > 2)
                                .with_ansi(false)
                                .with_writer(writer)
                                .with_filter(EnvFilter::new(&config)),
                        )
                    }
                    None => eprintln!("WARNING: syslog is already claimed, logging to stderr only"),
                }
            }
        }
    }

    let file_log = match log_file {
        None => None,
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file))
                    .with_filter(EnvFilter::new(&config)),
            )
        }
    };

    tracing_subscriber::registry()
        .with(stderr_log)
        .with(syslog_log)
        .with(file_log)
        .try_init()
        .context("Failed to install the logger")
}

#[macro_export]
macro_rules! handle_result {
    ($result:ident) => {{
        match $result {
            Err(err) => {
                tracing::error!("{err:?}");
                1
            }
            Ok(code) => code,
        }
    }};
}
