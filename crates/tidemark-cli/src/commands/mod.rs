//! Phase implementations
//!
//! Each phase has its own module with a `run` function. [`run`] wires the
//! production collaborators and dispatches.

pub mod cleanup;
pub mod load;
pub mod monitor;
pub mod rollback;
pub mod setup;

use std::sync::Arc;
use tidemark_engine::external::ShellRunner;
use tidemark_engine::load::DirectorySource;
use tidemark_engine::{Collaborators, RunConfig};

use crate::error::Result;
use crate::Invocation;

/// Run one phase against the production collaborators
pub async fn run(invocation: Invocation, config: Arc<RunConfig>) -> Result<()> {
    // Monitoring only talks to the REST API
    if invocation == Invocation::Monitor {
        return monitor::run(config).await;
    }

    let collaborators = Collaborators::connect(&config, Arc::new(ShellRunner)).await?;
    match invocation {
        Invocation::Setup { resources } => setup::run(config, collaborators, resources).await,
        Invocation::Load => load::run(config, collaborators, DirectorySource::Scheduled).await,
        Invocation::Replay { dirs_file } => {
            load::run(config, collaborators, DirectorySource::Replay { dirs_file }).await
        }
        Invocation::Rollback { partitions } => rollback::run(config, collaborators, &partitions).await,
        Invocation::Cleanup => {
            cleanup::run(config, collaborators).await;
            Ok(())
        }
        Invocation::Monitor => monitor::run(config).await,
    }
}
