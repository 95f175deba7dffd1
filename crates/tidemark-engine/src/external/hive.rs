//! Warehouse catalog access through the `hive` CLI

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use super::shell::{CommandRunner, ShellError};
use crate::partition::Partition;

#[derive(Error, Debug)]
pub enum WarehouseError {
    #[error("Hive {operation} failed on {table}: {source}")]
    Command {
        operation: &'static str,
        table: String,
        #[source]
        source: ShellError,
    },
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Partition specs currently registered, in `year=YYYY/.../part=N` form
    async fn show_partitions(&self) -> Result<Vec<String>, WarehouseError>;

    async fn add_partition(&self, partition: &Partition, location: &str) -> Result<(), WarehouseError>;

    /// Drop a partition; dropping an unknown partition is not an error
    async fn drop_partition(&self, partition: &Partition) -> Result<(), WarehouseError>;

    async fn run_script(&self, path: &Path) -> Result<(), WarehouseError>;

    async fn drop_table(&self) -> Result<(), WarehouseError>;
}

/// `hive` CLI bound to one database table
pub struct HiveCli {
    runner: Arc<dyn CommandRunner>,
    database: String,
    table: String,
}

impl HiveCli {
    pub fn new(runner: Arc<dyn CommandRunner>, database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            runner,
            database: database.into(),
            table: table.into(),
        }
    }

    fn qualified(&self) -> String {
        format!("{}.{}", self.database, self.table)
    }

    async fn execute(&self, operation: &'static str, statement: &str) -> Result<String, WarehouseError> {
        let command = format!("hive -e \"use {}; {}\"", self.database, statement);
        self.runner
            .run_checked(&command)
            .await
            .map(|output| output.stdout)
            .map_err(|source| WarehouseError::Command {
                operation,
                table: self.qualified(),
                source,
            })
    }
}

#[async_trait]
impl Warehouse for HiveCli {
    async fn show_partitions(&self) -> Result<Vec<String>, WarehouseError> {
        let stdout = self
            .execute("show partitions", &format!("show partitions {}", self.table))
            .await?;
        Ok(parse_partitions(&stdout))
    }

    async fn add_partition(&self, partition: &Partition, location: &str) -> Result<(), WarehouseError> {
        let statement = format!(
            "alter table {} add partition ({}) location '{}';",
            self.table,
            partition.hive_clause(),
            location
        );
        self.execute("add partition", &statement).await?;
        info!(table = %self.qualified(), partition = %partition, "Added warehouse partition");
        Ok(())
    }

    async fn drop_partition(&self, partition: &Partition) -> Result<(), WarehouseError> {
        let statement = format!(
            "alter table {} drop if exists partition ({})",
            self.table,
            partition.hive_clause()
        );
        self.execute("drop partition", &statement).await?;
        info!(table = %self.qualified(), partition = %partition, "Dropped warehouse partition");
        Ok(())
    }

    async fn run_script(&self, path: &Path) -> Result<(), WarehouseError> {
        let command = format!("hive -f {}", path.display());
        self.runner
            .run_checked(&command)
            .await
            .map_err(|source| WarehouseError::Command {
                operation: "run script",
                table: self.qualified(),
                source,
            })?;
        Ok(())
    }

    async fn drop_table(&self) -> Result<(), WarehouseError> {
        self.execute("drop table", &format!("drop table if exists {}", self.table))
            .await?;
        Ok(())
    }
}

/// Partition lines of `show partitions` output; status chatter is dropped
pub fn parse_partitions(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("year="))
        .map(str::to_string)
        .collect()
}
