//! Reversal of committed partitions
//!
//! For each listed partition the rows it contributed to the analytics store
//! are deleted by key, then its files, its warehouse registration and its
//! load record are removed. Rows are matched through a scratch table named
//! `<table>__rollback__` that holds one partition at a time and is dropped
//! when the run ends.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tidemark_common::ConfigError;
use tracing::{error, info, warn};

use crate::collaborators::Collaborators;
use crate::external::{CopyMode, HdfsError, MirrorError, RegistryError};
use crate::load::{MirrorCopier, MirrorCopyError};
use crate::metadata::MetadataError;
use crate::partition::{Partition, PartitionError};
use crate::settings::RunConfig;

const SCRATCH_SUFFIX: &str = "__rollback__";

#[derive(Error, Debug)]
pub enum ReversalError {
    #[error("Failed to read partition list {path}: {source}")]
    PartitionFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid partition in list at line {line}: {source}")]
    InvalidPartition {
        line: usize,
        #[source]
        source: PartitionError,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Hdfs(#[from] HdfsError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Copy(#[from] MirrorCopyError),

    #[error("Analytics store {step} failed for partition {partition}: {source}")]
    Mirror {
        step: &'static str,
        partition: String,
        #[source]
        source: MirrorError,
    },

    #[error("Failed to drop scratch table {table}: {source}")]
    ScratchTable {
        table: String,
        #[source]
        source: MirrorError,
    },

    #[error("No primary namenode reachable")]
    NoPrimaryNamenode,

    #[error("Rollback aborted unexpectedly: {0}")]
    Unexpected(String),
}

/// Parse a partition list: one `YYYY/MM/DD/HH/seq` per line, blank lines skipped
pub fn parse_partition_list(text: &str) -> Result<Vec<Partition>, ReversalError> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            Partition::from_relative(line).map_err(|source| ReversalError::InvalidPartition { line: idx + 1, source })
        })
        .collect()
}

pub async fn read_partition_list(path: &Path) -> Result<Vec<Partition>, ReversalError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ReversalError::PartitionFile {
            path: path.display().to_string(),
            source,
        })?;
    parse_partition_list(&text)
}

/// Summary of a finished reversal
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReversalReport {
    pub partitions: usize,
    /// Partitions whose files were still present and were purged from the analytics store
    pub purged: usize,
    pub rows_deleted: u64,
}

pub struct ReversalOrchestrator {
    config: Arc<RunConfig>,
    collaborators: Collaborators,
}

impl ReversalOrchestrator {
    pub fn new(config: Arc<RunConfig>, collaborators: Collaborators) -> Self {
        Self { config, collaborators }
    }

    pub async fn execute(&self, partitions: &[Partition]) -> Result<ReversalReport, ReversalError> {
        let settings = self.config.mirror_settings()?;
        let rollback_key = settings.rollback_key()?;
        let loader = self.collaborators.mirror_loader()?;
        let copier = MirrorCopier::for_dataset(&self.config, &self.collaborators)?;

        let primary_namenode = self
            .collaborators
            .fs
            .primary_namenode(
                &self.config.namenodes,
                &self.config.namenode_probe_path,
                &self.config.hdfs_user,
            )
            .await?
            .ok_or(ReversalError::NoPrimaryNamenode)?;

        let schema = settings.schema.as_str();
        let scratch_table = format!("{}{}", settings.table, SCRATCH_SUFFIX);
        info!(partitions = partitions.len(), scratch_table = %scratch_table, "Starting rollback");

        let pass = AssertUnwindSafe(async {
            loader
                .clone_schema(schema, &settings.table, schema, &scratch_table)
                .await
                .map_err(|source| ReversalError::Mirror {
                    step: "clone schema",
                    partition: String::new(),
                    source,
                })?;

            let mut report = ReversalReport::default();
            for partition in partitions {
                let deleted = self
                    .reverse_partition(partition, &copier, &primary_namenode, &scratch_table, rollback_key)
                    .await?;
                report.partitions += 1;
                if let Some(rows) = deleted {
                    report.purged += 1;
                    report.rows_deleted += rows;
                }
            }
            Ok::<_, ReversalError>(report)
        })
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_default();
            Err(ReversalError::Unexpected(message))
        });

        let dropped = loader.drop_table(schema, &scratch_table).await;

        match (pass, dropped) {
            (Ok(report), Ok(())) => {
                info!(report = ?report, "Rollback complete");
                Ok(report)
            }
            (Ok(_), Err(source)) => Err(ReversalError::ScratchTable {
                table: format!("{}.{}", schema, scratch_table),
                source,
            }),
            (Err(e), Ok(())) => {
                error!(error = %e, "Rollback error");
                Err(e)
            }
            (Err(e), Err(drop_error)) => {
                error!(error = %e, "Rollback error");
                warn!(error = %drop_error, table = %scratch_table, "Failed to drop scratch table");
                Err(e)
            }
        }
    }

    /// Returns the analytics store rows deleted, or `None` when the partition
    /// files were already gone
    async fn reverse_partition(
        &self,
        partition: &Partition,
        copier: &MirrorCopier,
        primary_namenode: &str,
        scratch_table: &str,
        rollback_key: &str,
    ) -> Result<Option<u64>, ReversalError> {
        let settings = self.config.mirror_settings()?;
        let loader = self.collaborators.mirror_loader()?;
        let schema = settings.schema.as_str();
        let relative = partition.relative_path();
        let path = partition.location(&self.config.target_root);
        info!(partition = %partition, "Rolling back partition");

        let mut deleted = None;
        if self.collaborators.fs.path_exists(&path).await? {
            info!(partition = %path, "Proceeding with analytics store rollback");

            let staged = match copier
                .copy(primary_namenode, &relative, schema, scratch_table, CopyMode::Direct)
                .await
            {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(error = %e, "Direct copy failed, retrying with decompression");
                    copier
                        .copy(primary_namenode, &relative, schema, scratch_table, CopyMode::Decompress)
                        .await?
                }
            };
            info!(partition = %partition, rows = staged, "Staged partition rows");

            let mirror_step = |step: &'static str| {
                let partition = relative.clone();
                move |source| ReversalError::Mirror { step, partition, source }
            };
            let rows = loader
                .rollback(schema, &settings.table, schema, scratch_table, rollback_key)
                .await
                .map_err(mirror_step("rollback"))?;
            loader
                .truncate(schema, scratch_table)
                .await
                .map_err(mirror_step("truncate"))?;
            self.collaborators.fs.remove_dir(&path).await?;
            deleted = Some(rows);
        } else {
            info!(partition = %path, "Partition files already removed");
        }

        self.collaborators.registry().detach(partition).await?;
        self.collaborators
            .store
            .delete_partition(&self.config.dataset_name, &relative)
            .await?;
        Ok(deleted)
    }
}
