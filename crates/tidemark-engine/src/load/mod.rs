//! Incremental load orchestration
//!
//! One run of [`LoadOrchestrator::execute`] moves every eligible source
//! directory into the warehouse:
//!
//! 1. Decide: the dataset lock is free, there are new directories, and a
//!    namenode answers as primary. Any "no" ends the run as
//!    [`LoadOutcome::Skipped`].
//! 2. Lock the dataset.
//! 3. Group the directories into chunks and, per chunk in time order, run
//!    the batch job into a fresh partition, attach it, open its permissions,
//!    record it, and mirror pending partitions when mirroring is enabled.
//! 4. Release the lock, whatever happened in step 3.
//!
//! The first failure aborts the run. Partitions committed before it stay
//! committed and recorded.

mod mirror;
mod source;

pub use mirror::{percent_loss, MirrorCopier, MirrorCopyError};
pub use source::{replay_directories, DirectorySource};

use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tidemark_common::ConfigError;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::catalog::{self, ChunkLabel, SourceDirectory};
use crate::collaborators::Collaborators;
use crate::external::{BatchJobError, CopyMode, HdfsError, JobId, RegistryError, TerminalState};
use crate::lock::{LockDecision, LockError, LockManager};
use crate::metadata::{MetadataError, MirrorStage, NewLoadRecord};
use crate::partition::{join_path, next_sequence, Partition};
use crate::settings::RunConfig;

/// Mirror stage status written on success
pub const MIRROR_SUCCESS: &str = "SUCCESS";

#[derive(Error, Debug)]
pub enum LoadError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Hdfs(#[from] HdfsError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Batch job client error: {0}")]
    BatchJob(#[from] BatchJobError),

    #[error("Batch job {job} failed at step {step} with status {status}")]
    JobFailed { job: JobId, step: String, status: String },

    #[error(transparent)]
    Mirror(#[from] MirrorCopyError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to read replay directory list {}: {source}", path.display())]
    ReplayFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Load aborted unexpectedly: {0}")]
    Unexpected(String),
}

/// Why a run ended without loading anything
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Busy { release_attempts: i64 },
    NoNewDirectories,
    NoPrimaryNamenode,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Busy { release_attempts } => {
                write!(f, "dataset locked by another load (release attempts: {})", release_attempts)
            }
            SkipReason::NoNewDirectories => write!(f, "no new source directories"),
            SkipReason::NoPrimaryNamenode => write!(f, "no primary namenode reachable"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    Skipped(SkipReason),
    Completed { partitions: Vec<Partition>, mirrored: usize },
}

/// What a run decided to load
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub load_id: String,
    pub directories: Vec<SourceDirectory>,
    pub primary_namenode: String,
}

#[derive(Debug, Clone)]
pub enum Decision {
    Proceed(RunPlan),
    Skip(SkipReason),
}

pub struct LoadOrchestrator {
    config: Arc<RunConfig>,
    collaborators: Collaborators,
    source: DirectorySource,
    lock: LockManager,
}

impl LoadOrchestrator {
    pub fn new(config: Arc<RunConfig>, collaborators: Collaborators, source: DirectorySource) -> Self {
        let lock = LockManager::new(
            collaborators.store.clone(),
            config.dataset_name.clone(),
            config.unlock_policy,
        );
        Self {
            config,
            collaborators,
            source,
            lock,
        }
    }

    /// Decide whether this run loads anything
    pub async fn proceed(&self) -> Result<Decision, LoadError> {
        if let LockDecision::Busy { release_attempts } = self.lock.try_acquire().await? {
            return Ok(Decision::Skip(SkipReason::Busy { release_attempts }));
        }

        let directories = self.source.directories(&self.config, &self.collaborators).await?;
        if directories.is_empty() {
            info!("No new source directories to process");
            return Ok(Decision::Skip(SkipReason::NoNewDirectories));
        }

        let primary = self
            .collaborators
            .fs
            .primary_namenode(
                &self.config.namenodes,
                &self.config.namenode_probe_path,
                &self.config.hdfs_user,
            )
            .await?;
        let Some(primary_namenode) = primary else {
            return Ok(Decision::Skip(SkipReason::NoPrimaryNamenode));
        };

        Ok(Decision::Proceed(RunPlan {
            load_id: Uuid::new_v4().to_string(),
            directories,
            primary_namenode,
        }))
    }

    pub async fn execute(&self) -> Result<LoadOutcome, LoadError> {
        let load_type = self.source.load_type();
        info!(dataset = %self.config.dataset_name, %load_type, "Starting load");

        let plan = match self.proceed().await? {
            Decision::Proceed(plan) => plan,
            Decision::Skip(reason) => {
                info!(%reason, "Ending load");
                return Ok(LoadOutcome::Skipped(reason));
            }
        };
        info!(
            load_id = %plan.load_id,
            directories = plan.directories.len(),
            primary_namenode = %plan.primary_namenode,
            "Proceeding with load"
        );

        self.lock.acquire().await?;

        let result = AssertUnwindSafe(self.run(&plan))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(LoadError::Unexpected(panic_message(panic))));

        info!(dataset = %self.config.dataset_name, "Releasing lock");
        let released = self.lock.release().await;

        match (result, released) {
            (Ok(outcome), Ok(())) => {
                info!(dataset = %self.config.dataset_name, "Ending load");
                Ok(outcome)
            }
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release_error)) => {
                error!(error = %release_error, "Failed to release lock after load failure");
                Err(e)
            }
        }
    }

    async fn run(&self, plan: &RunPlan) -> Result<LoadOutcome, LoadError> {
        let chunks = catalog::chunk(&plan.directories, self.config.chunk_granularity);
        let mut partitions = Vec::with_capacity(chunks.len());
        let mut mirrored = 0;

        for (label, dirs) in &chunks {
            partitions.push(self.load_chunk(plan, label, dirs).await?);

            if self.config.mirror_enabled {
                mirrored += self.mirror_pending(plan).await?;
            } else {
                info!(dataset = %self.config.dataset_name, "Analytics store load not requested");
            }
        }

        Ok(LoadOutcome::Completed { partitions, mirrored })
    }

    async fn load_chunk(
        &self,
        plan: &RunPlan,
        label: &ChunkLabel,
        dirs: &[SourceDirectory],
    ) -> Result<Partition, LoadError> {
        let config = &self.config;
        let registry = self.collaborators.registry();
        let hive_start_ts = config.scheduler.now();

        let parent = join_path(&config.target_root, &label.to_string());
        let seq = if registry.path_exists(&parent).await? {
            next_sequence(&registry.list_child_names(&parent).await?)
        } else {
            0
        };
        let partition = Partition::for_label(label, seq);
        let partition_path = partition.location(&config.target_root);

        let names: Vec<&str> = dirs.iter().map(SourceDirectory::name).collect();
        info!(chunk = %label, directories = ?names, output = %partition_path, "Triggering batch job");

        let jobs = &self.collaborators.jobs;
        let job = jobs.submit(dirs, &partition_path).await?;
        if let TerminalState::Failed { step, status } = jobs.await_terminal(&job, config.poll_interval).await? {
            return Err(LoadError::JobFailed { job, step, status });
        }
        let counters = jobs.counters(&job).await?;
        info!(
            job = %job,
            map_input_records = counters.map_input_records,
            map_output_records = counters.map_output_records,
            reduce_input_records = counters.reduce_input_records,
            reduce_output_records = counters.reduce_output_records,
            skipped = counters.skipped,
            "Batch job succeeded"
        );

        registry.attach(&partition_path).await?;

        self.collaborators.fs.grant_all("rx", &config.target_root).await?;
        info!(path = %config.target_root, "Granted read/execute permissions");

        let last_folder = dirs.last().map(|d| d.name().to_string());
        self.collaborators
            .store
            .insert_load(&NewLoadRecord {
                load_id: plan.load_id.clone(),
                dataset_name: config.dataset_name.clone(),
                load_type: self.source.load_type(),
                hive_db: config.hive_db.clone(),
                hive_table: config.hive_table.clone(),
                hive_start_ts,
                hive_end_ts: config.scheduler.now(),
                last_load_folder: last_folder.clone(),
                hive_last_partition: partition.relative_path(),
                records_processed: counters.records_processed(),
                rows_committed: counters.map_output_records,
            })
            .await?;
        info!(
            partition = %partition,
            last_processed_dir = last_folder.as_deref().unwrap_or("-"),
            "Recorded warehouse load"
        );

        Ok(partition)
    }

    /// Copy every recorded but unmirrored partition into the analytics store
    async fn mirror_pending(&self, plan: &RunPlan) -> Result<usize, LoadError> {
        let config = &self.config;
        let settings = config.mirror_settings()?;
        let copier = MirrorCopier::for_dataset(config, &self.collaborators)?;
        let store = &self.collaborators.store;

        let pending = store
            .get_unprocessed_partitions(&config.hive_db, &config.hive_table)
            .await?;
        let names: Vec<&str> = pending.iter().map(|p| p.partition.as_str()).collect();
        info!(partitions = ?names, "Partitions pending for analytics store");

        for row in &pending {
            let start_ts = config.scheduler.now();
            let rows = copier
                .copy(
                    &plan.primary_namenode,
                    &row.partition,
                    &settings.schema,
                    &settings.table,
                    CopyMode::Direct,
                )
                .await?;

            store
                .update_mirror_stage(
                    &row.load_id,
                    &row.partition,
                    &MirrorStage {
                        vertica_db: settings.connection.db.clone(),
                        vertica_schema: settings.schema.clone(),
                        vertica_table: settings.table.clone(),
                        start_ts,
                        end_ts: config.scheduler.now(),
                        rows_loaded: rows,
                        status: MIRROR_SUCCESS.to_string(),
                    },
                )
                .await?;

            let mirrored_rows = i64::try_from(rows).unwrap_or(i64::MAX);
            info!(
                partition = %row.partition,
                records_processed = row.records_processed,
                hive_rows_loaded = row.hive_rows_loaded,
                vertica_rows_loaded = rows,
                percent_loss_hive = percent_loss(row.hive_rows_loaded, row.records_processed),
                percent_loss_vertica = percent_loss(mirrored_rows, row.hive_rows_loaded),
                "load summary"
            );
        }

        Ok(pending.len())
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic with non-string payload".to_string());
    warn!(panic = %message, "Caught panic during load");
    message
}
