//! Removal of everything setup and loads created for a dataset
//!
//! Cleanup is best effort. Every step runs even when an earlier one failed;
//! failures are reported as warnings and never fail the phase.

use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::collaborators::Collaborators;
use crate::settings::RunConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupStep {
    Local,
    Hdfs,
    Warehouse,
    Mirror,
    Metadata,
}

impl CleanupStep {
    pub const ALL: [CleanupStep; 5] = [
        CleanupStep::Local,
        CleanupStep::Hdfs,
        CleanupStep::Warehouse,
        CleanupStep::Mirror,
        CleanupStep::Metadata,
    ];
}

impl fmt::Display for CleanupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CleanupStep::Local => "local",
            CleanupStep::Hdfs => "hdfs",
            CleanupStep::Warehouse => "hive",
            CleanupStep::Mirror => "vertica",
            CleanupStep::Metadata => "metadata",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Done,
    Skipped,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepResult {
    pub step: CleanupStep,
    pub status: StepStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub steps: Vec<StepResult>,
}

impl CleanupReport {
    pub fn failed(&self) -> impl Iterator<Item = &StepResult> {
        self.steps
            .iter()
            .filter(|r| matches!(r.status, StepStatus::Failed(_)))
    }

    pub fn is_clean(&self) -> bool {
        self.failed().next().is_none()
    }

    pub fn status(&self, step: CleanupStep) -> Option<&StepStatus> {
        self.steps.iter().find(|r| r.step == step).map(|r| &r.status)
    }
}

pub struct CleanupOrchestrator {
    config: Arc<RunConfig>,
    collaborators: Collaborators,
}

impl CleanupOrchestrator {
    pub fn new(config: Arc<RunConfig>, collaborators: Collaborators) -> Self {
        Self { config, collaborators }
    }

    pub async fn execute(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        for step in CleanupStep::ALL {
            let status = match self.run_step(step).await {
                Ok(true) => {
                    info!(%step, "Cleanup step complete");
                    StepStatus::Done
                }
                Ok(false) => StepStatus::Skipped,
                Err(message) => {
                    warn!(%step, error = %message, "Cleanup step failed");
                    StepStatus::Failed(message)
                }
            };
            report.steps.push(StepResult { step, status });
        }

        let failed: Vec<String> = report.failed().map(|r| r.step.to_string()).collect();
        info!(
            dataset = %self.config.dataset_name,
            steps = report.steps.len(),
            failed = ?failed,
            "Cleanup finished"
        );
        report
    }

    /// `Ok(false)` when the step does not apply to this dataset
    async fn run_step(&self, step: CleanupStep) -> Result<bool, String> {
        let config = &self.config;
        let collaborators = &self.collaborators;
        match step {
            CleanupStep::Local => {
                let dir = &config.paths.dataset_dir;
                match tokio::fs::remove_dir_all(dir).await {
                    Ok(()) => Ok(true),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
                    Err(e) => Err(format!("{}: {}", dir.display(), e)),
                }
            }
            CleanupStep::Hdfs => {
                collaborators
                    .fs
                    .remove_dir(&config.workflow.hdfs_resource_path)
                    .await
                    .map_err(|e| e.to_string())?;
                collaborators
                    .fs
                    .remove_dir(&config.target_root)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(true)
            }
            CleanupStep::Warehouse => {
                collaborators.warehouse.drop_table().await.map_err(|e| e.to_string())?;
                Ok(true)
            }
            CleanupStep::Mirror => {
                if !config.mirror_enabled {
                    return Ok(false);
                }
                let settings = config.mirror_settings().map_err(|e| e.to_string())?;
                let loader = collaborators.mirror_loader().map_err(|e| e.to_string())?;
                loader
                    .drop_table(&settings.schema, &settings.table)
                    .await
                    .map_err(|e| e.to_string())?;
                loader
                    .drop_table(&settings.schema, &settings.rejected_table)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(true)
            }
            CleanupStep::Metadata => {
                collaborators
                    .store
                    .purge(&config.dataset_name)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(true)
            }
        }
    }
}
