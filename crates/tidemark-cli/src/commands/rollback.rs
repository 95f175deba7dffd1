//! `tidemark --phase rollback`

use std::path::Path;
use std::sync::Arc;
use tidemark_engine::reversal::{read_partition_list, ReversalOrchestrator};
use tidemark_engine::{Collaborators, RunConfig};
use tracing::info;

use crate::error::Result;

pub async fn run(config: Arc<RunConfig>, collaborators: Collaborators, partitions: &Path) -> Result<()> {
    let partitions = read_partition_list(partitions).await?;
    if partitions.is_empty() {
        info!("Partition list is empty, nothing to roll back");
        return Ok(());
    }

    let report = ReversalOrchestrator::new(config, collaborators)
        .execute(&partitions)
        .await?;
    info!(
        partitions = report.partitions,
        purged = report.purged,
        rows_deleted = report.rows_deleted,
        "Rollback finished"
    );
    Ok(())
}
