//! `tidemark --phase cleanup`
//!
//! Best effort: failed steps are logged and the phase still succeeds.

use std::sync::Arc;
use tidemark_engine::cleanup::{CleanupOrchestrator, CleanupReport, StepStatus};
use tidemark_engine::{Collaborators, RunConfig};
use tracing::{info, warn};

pub async fn run(config: Arc<RunConfig>, collaborators: Collaborators) -> CleanupReport {
    let report = CleanupOrchestrator::new(config, collaborators).execute().await;

    for result in &report.steps {
        match &result.status {
            StepStatus::Done => info!(step = %result.step, "Removed"),
            StepStatus::Skipped => info!(step = %result.step, "Not applicable"),
            StepStatus::Failed(reason) => warn!(step = %result.step, %reason, "Manual cleanup needed"),
        }
    }
    report
}
