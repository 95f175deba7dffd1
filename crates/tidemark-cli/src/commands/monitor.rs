//! `tidemark --phase monitor`

use std::sync::Arc;
use tidemark_engine::monitor::MonitorOrchestrator;
use tidemark_engine::RunConfig;

use crate::error::Result;

pub async fn run(config: Arc<RunConfig>) -> Result<()> {
    MonitorOrchestrator::new(config)?.execute().await?;
    Ok(())
}
