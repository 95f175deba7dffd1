//! Partition registry
//!
//! Pairs the filesystem view of the target root with the warehouse catalog, so
//! a partition is only attached when its data is in place and it is not
//! attached already.

use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use super::hdfs::{Hdfs, HdfsError};
use super::hive::{Warehouse, WarehouseError};
use crate::partition::{Partition, PartitionError};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Partition path does not exist: {0}")]
    PathMissing(String),

    #[error("Partition {0} is already attached")]
    AlreadyAttached(Partition),

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error(transparent)]
    Hdfs(#[from] HdfsError),

    #[error(transparent)]
    Warehouse(#[from] WarehouseError),
}

#[derive(Clone)]
pub struct PartitionRegistry {
    fs: Arc<dyn Hdfs>,
    warehouse: Arc<dyn Warehouse>,
}

impl PartitionRegistry {
    pub fn new(fs: Arc<dyn Hdfs>, warehouse: Arc<dyn Warehouse>) -> Self {
        Self { fs, warehouse }
    }

    pub async fn path_exists(&self, path: &str) -> Result<bool, RegistryError> {
        Ok(self.fs.path_exists(path).await?)
    }

    /// Base names of the entries directly under `parent`
    pub async fn list_child_names(&self, parent: &str) -> Result<Vec<String>, RegistryError> {
        let children = self.fs.list(parent).await?;
        Ok(children
            .iter()
            .filter_map(|child| child.trim_end_matches('/').rsplit('/').next())
            .map(str::to_string)
            .collect())
    }

    /// Numeric child names of `parent`; other entries are ignored
    pub async fn list_child_numeric_names(&self, parent: &str) -> Result<Vec<u32>, RegistryError> {
        Ok(self
            .list_child_names(parent)
            .await?
            .iter()
            .filter_map(|name| name.parse::<u32>().ok())
            .collect())
    }

    /// Register the partition stored at `partition_path` with the warehouse
    pub async fn attach(&self, partition_path: &str) -> Result<Partition, RegistryError> {
        let partition = Partition::from_path(partition_path)?;

        if !self.fs.path_exists(partition_path).await? {
            return Err(RegistryError::PathMissing(partition_path.to_string()));
        }

        let spec = partition.hive_spec();
        let attached = self.warehouse.show_partitions().await?;
        if attached.iter().any(|existing| existing.trim() == spec) {
            return Err(RegistryError::AlreadyAttached(partition));
        }

        self.warehouse.add_partition(&partition, partition_path).await?;
        info!(partition = %partition, path = partition_path, "Attached partition");
        Ok(partition)
    }

    pub async fn detach(&self, partition: &Partition) -> Result<(), RegistryError> {
        self.warehouse.drop_partition(partition).await?;
        Ok(())
    }
}
