//! Copying warehouse partitions into the analytics store

use std::sync::Arc;
use thiserror::Error;
use tidemark_common::ConfigError;
use tracing::info;

use crate::collaborators::Collaborators;
use crate::external::{CopyMode, Hdfs, HdfsError, MirrorError, MirrorLoader};
use crate::partition::join_path;
use crate::settings::RunConfig;

const SCRATCH_ROOT: &str = "/tmp/tidemark";
const SCRATCH_FILE: &str = "partition_data.txt";

#[derive(Error, Debug)]
pub enum MirrorCopyError {
    #[error("Failed to stage partition {partition} for copy: {source}")]
    Staging {
        partition: String,
        #[source]
        source: HdfsError,
    },

    #[error("Failed to copy partition {partition} ({mode}): {source}")]
    Copy {
        partition: String,
        mode: CopyMode,
        #[source]
        source: MirrorError,
    },
}

/// Copies one partition's files into an analytics store table
pub struct MirrorCopier {
    fs: Arc<dyn Hdfs>,
    loader: Arc<dyn MirrorLoader>,
    target_root: String,
    scratch_dir: String,
    reject_table: String,
}

impl MirrorCopier {
    pub fn new(
        fs: Arc<dyn Hdfs>,
        loader: Arc<dyn MirrorLoader>,
        target_root: impl Into<String>,
        scratch_dir: impl Into<String>,
        reject_table: impl Into<String>,
    ) -> Self {
        Self {
            fs,
            loader,
            target_root: target_root.into(),
            scratch_dir: scratch_dir.into(),
            reject_table: reject_table.into(),
        }
    }

    /// Copier for the dataset's configured analytics store target
    pub fn for_dataset(config: &RunConfig, collaborators: &Collaborators) -> Result<Self, ConfigError> {
        let settings = config.mirror_settings()?;
        Ok(Self::new(
            collaborators.fs.clone(),
            collaborators.mirror_loader()?,
            &config.target_root,
            format!("{}/{}/{}", SCRATCH_ROOT, config.hive_db, config.hive_table),
            &settings.rejected_table,
        ))
    }

    /// Copy the partition at relative path `partition` into `schema.table`.
    ///
    /// `Direct` reads the compressed part files in place. `Decompress` first
    /// writes them as one plain text file under the scratch directory.
    pub async fn copy(
        &self,
        primary_node: &str,
        partition: &str,
        schema: &str,
        table: &str,
        mode: CopyMode,
    ) -> Result<u64, MirrorCopyError> {
        info!(partition, schema, table, %mode, "Performing analytics store copy");
        let part_files = join_path(&join_path(&self.target_root, partition), "*");

        let source = match mode {
            CopyMode::Direct => part_files,
            CopyMode::Decompress => self
                .stage_plain_text(partition, &part_files)
                .await
                .map_err(|source| MirrorCopyError::Staging {
                    partition: partition.to_string(),
                    source,
                })?,
        };

        self.loader
            .copy(primary_node, &source, schema, table, &self.reject_table, mode)
            .await
            .map_err(|source| MirrorCopyError::Copy {
                partition: partition.to_string(),
                mode,
                source,
            })
    }

    async fn stage_plain_text(&self, partition: &str, part_files: &str) -> Result<String, HdfsError> {
        if self.fs.path_exists(&self.scratch_dir).await? {
            self.fs.remove_dir(&self.scratch_dir).await?;
        }
        self.fs.make_dir(&self.scratch_dir).await?;

        let staging_dir = join_path(&self.scratch_dir, partition);
        self.fs.make_dir(&staging_dir).await?;
        info!(directory = %staging_dir, "Created scratch directory");

        let data_file = join_path(&staging_dir, SCRATCH_FILE);
        self.fs.decompress(part_files, &data_file).await?;
        Ok(data_file)
    }
}

/// Percentage of `source` rows missing from `target`; zero when `source` is empty
pub fn percent_loss(target: i64, source: i64) -> f64 {
    if source == 0 {
        return 0.0;
    }
    100.0 * (source - target) as f64 / source as f64
}
