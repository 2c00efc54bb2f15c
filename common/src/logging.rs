// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/

//! Log initialization shared by the daemon and its tests.

use std::fmt;
use std::fs::OpenOptions;
use std::str::FromStr;

use anyhow::Context;
use slog::Drain;

/// How log records are rendered.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Unstructured text for a human at a terminal.
    Human,
    /// Bunyan-format json, one record per line.
    #[default]
    Json,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid log format (expected \"human\" or \"json\")")]
pub struct LogFormatError;

impl FromStr for LogFormat {
    type Err = LogFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "human" => Ok(LogFormat::Human),
            "json" => Ok(LogFormat::Json),
            _ => Err(LogFormatError),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LogFormat::Human => write!(f, "human"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

fn async_root<D>(drain: D, name: &str, level: slog::Level) -> slog::Logger
where
    D: Drain<Ok = (), Err = slog::Never> + Send + 'static,
{
    let drain = drain.filter_level(level).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, slog::o!("unit" => name.to_string()))
}

/// Build the root logger for a daemon.  Records go to `log_file` if one is
/// given and to stdout otherwise, rendered according to `log_format`.
pub fn init(
    name: &str,
    log_file: &Option<String>,
    log_format: LogFormat,
) -> anyhow::Result<slog::Logger> {
    init_with_level(name, log_file, log_format, slog::Level::Debug)
}

/// [`init`], with records below `level` dropped at the drain.
pub fn init_with_level(
    name: &str,
    log_file: &Option<String>,
    log_format: LogFormat,
    level: slog::Level,
) -> anyhow::Result<slog::Logger> {
    let name: &'static str = Box::leak(name.to_string().into_boxed_str());
    let log = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {path}"))?;
            match log_format {
                LogFormat::Human => {
                    let dec = slog_term::PlainDecorator::new(file);
                    let drain =
                        slog_term::FullFormat::new(dec).build().fuse();
                    async_root(drain, name, level)
                }
                LogFormat::Json => {
                    let drain = slog_bunyan::with_name(name, file)
                        .build()
                        .fuse();
                    async_root(drain, name, level)
                }
            }
        }
        None => match log_format {
            LogFormat::Human => {
                let dec = slog_term::TermDecorator::new().build();
                let drain = slog_term::FullFormat::new(dec).build().fuse();
                async_root(drain, name, level)
            }
            LogFormat::Json => {
                let drain =
                    slog_bunyan::with_name(name, std::io::stdout())
                        .build()
                        .fuse();
                async_root(drain, name, level)
            }
        },
    };
    Ok(log)
}

/// A synchronous stdout logger for unit tests, where the async drain's
/// buffering would swallow records emitted right before a panic.
pub fn test_logger() -> slog::Logger {
    let dec = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(dec).build().fuse();
    slog::Logger::root(drain, slog::o!())
}
