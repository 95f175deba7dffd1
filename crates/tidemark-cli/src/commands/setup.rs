//! `tidemark --phase setup`

use std::path::PathBuf;
use std::sync::Arc;
use tidemark_engine::setup::SetupOrchestrator;
use tidemark_engine::{Collaborators, RunConfig};
use tracing::info;

use crate::error::Result;

pub async fn run(config: Arc<RunConfig>, collaborators: Collaborators, resources: PathBuf) -> Result<()> {
    info!(resources = %resources.display(), "Setting up dataset");
    SetupOrchestrator::new(config, collaborators, resources).execute().await?;
    info!("Setup complete");
    Ok(())
}
