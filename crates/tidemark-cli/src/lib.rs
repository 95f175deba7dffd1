//! Tidemark CLI Library
//!
//! The `tidemark` binary runs one phase of a dataset's lifecycle per
//! invocation:
//!
//! - **setup**: onboard a dataset from its config and resource archive
//! - **load**: scheduled incremental load of new source directories
//! - **replay**: reload an operator supplied list of source directories
//! - **rollback**: reverse committed partitions listed in a file
//! - **cleanup**: remove everything setup and loads created
//! - **monitor**: publish the dataset's dashboard and alerts

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod commands;
pub mod error;

pub use error::{CliError, Result};

use chrono::Local;
use clap::{Parser, ValueEnum};
use std::fmt;
use std::path::PathBuf;
use tidemark_common::logging::{init_logging, LogConfig, LogGuard, LogOutput};
use tidemark_engine::RunConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Phase {
    Setup,
    Load,
    Cleanup,
    Rollback,
    Replay,
    Monitor,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Setup => "setup",
            Phase::Load => "load",
            Phase::Cleanup => "cleanup",
            Phase::Rollback => "rollback",
            Phase::Replay => "replay",
            Phase::Monitor => "monitor",
        };
        f.write_str(name)
    }
}

/// Tidemark - incremental warehouse loader
#[derive(Parser, Debug)]
#[command(name = "tidemark")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Phase to run
    #[arg(long, value_enum)]
    pub phase: Phase,

    /// Dataset config file
    #[arg(long, value_name = "FILE")]
    pub data_config: PathBuf,

    /// Environment config file
    #[arg(long, value_name = "FILE")]
    pub env_config: PathBuf,

    /// Resource archive for setup
    #[arg(long, value_name = "ZIP", required_if_eq("phase", "setup"), value_parser = zip_archive)]
    pub resources: Option<PathBuf>,

    /// File listing partitions to roll back, one relative path per line
    #[arg(long, value_name = "FILE", required_if_eq("phase", "rollback"))]
    pub partitions: Option<PathBuf>,

    /// File listing source directories to replay, one name per line
    #[arg(long, value_name = "FILE", required_if_eq("phase", "replay"), value_parser = existing_file)]
    pub replay_dirs: Option<PathBuf>,
}

fn zip_archive(value: &str) -> std::result::Result<PathBuf, String> {
    if value.ends_with(".zip") {
        Ok(PathBuf::from(value))
    } else {
        Err(format!("'{}' is not a .zip archive", value))
    }
}

fn existing_file(value: &str) -> std::result::Result<PathBuf, String> {
    let path = PathBuf::from(value);
    if path.is_file() {
        Ok(path)
    } else {
        Err(format!("'{}' does not exist", value))
    }
}

/// A phase together with the inputs only that phase needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Setup { resources: PathBuf },
    Load,
    Replay { dirs_file: PathBuf },
    Rollback { partitions: PathBuf },
    Cleanup,
    Monitor,
}

impl Cli {
    /// Pair the phase with its required flag
    pub fn invocation(&self) -> Result<Invocation> {
        let required = |value: &Option<PathBuf>, flag: &'static str| {
            value.clone().ok_or(CliError::MissingArgument { phase: self.phase, flag })
        };

        Ok(match self.phase {
            Phase::Setup => Invocation::Setup {
                resources: required(&self.resources, "--resources")?,
            },
            Phase::Load => Invocation::Load,
            Phase::Replay => Invocation::Replay {
                dirs_file: required(&self.replay_dirs, "--replay-dirs")?,
            },
            Phase::Rollback => Invocation::Rollback {
                partitions: required(&self.partitions, "--partitions")?,
            },
            Phase::Cleanup => Invocation::Cleanup,
            Phase::Monitor => Invocation::Monitor,
        })
    }
}

/// Start logging to a per-run file in the dataset's log directory, plus the
/// console. `LOG_*` environment variables override the defaults.
pub fn start_logging(config: &RunConfig) -> Result<LogGuard> {
    let defaults = LogConfig::builder()
        .output(LogOutput::Both)
        .log_dir(&config.paths.log_dir)
        .file_name(LogConfig::run_file_name(&config.dataset_name, Local::now().naive_local()))
        .build();
    let log_config = defaults.clone().with_env_overrides().unwrap_or(defaults);
    Ok(init_logging(&log_config)?)
}
