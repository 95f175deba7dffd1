//! Error types for the Tidemark CLI

use thiserror::Error;
use tidemark_common::ConfigError;
use tidemark_engine::load::LoadError;
use tidemark_engine::metadata::MetadataError;
use tidemark_engine::monitor::MonitorError;
use tidemark_engine::reversal::ReversalError;
use tidemark_engine::setup::SetupError;

use crate::Phase;

/// Result type alias for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Phase {phase} requires {flag}")]
    MissingArgument { phase: Phase, flag: &'static str },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Metadata store unavailable: {0}")]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error("Load failed: {0}")]
    Load(#[from] LoadError),

    #[error("Rollback failed: {0}")]
    Reversal(#[from] ReversalError),

    #[error("Monitor setup failed: {0}")]
    Monitor(#[from] MonitorError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
