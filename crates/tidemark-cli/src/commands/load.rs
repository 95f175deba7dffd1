//! `tidemark --phase load` and `tidemark --phase replay`

use std::sync::Arc;
use tidemark_engine::load::{DirectorySource, LoadOrchestrator, LoadOutcome};
use tidemark_engine::partition::Partition;
use tidemark_engine::{Collaborators, RunConfig};
use tracing::info;

use crate::error::Result;

pub async fn run(config: Arc<RunConfig>, collaborators: Collaborators, source: DirectorySource) -> Result<()> {
    let outcome = LoadOrchestrator::new(config, collaborators, source).execute().await?;

    match outcome {
        LoadOutcome::Skipped(reason) => info!(%reason, "Nothing loaded"),
        LoadOutcome::Completed { partitions, mirrored } => {
            let paths: Vec<String> = partitions.iter().map(Partition::relative_path).collect();
            info!(partitions = ?paths, mirrored, "Load complete");
        }
    }
    Ok(())
}
