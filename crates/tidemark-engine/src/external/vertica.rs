//! Analytics store access through `vsql`

use async_trait::async_trait;
use regex::Regex;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use super::shell::{CommandRunner, ShellError};
use crate::partition::join_path;

#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("vsql {operation} failed: {source}")]
    Command {
        operation: &'static str,
        #[source]
        source: ShellError,
    },

    #[error("Unexpected {what} output: {output}")]
    MalformedOutput { what: &'static str, output: String },

    #[error("Invalid output pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// How partition files are read by COPY
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    /// Gzip compressed job output, read in place
    Direct,
    /// Plain text produced by a decompression pass
    Decompress,
}

impl fmt::Display for CopyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CopyMode::Direct => write!(f, "direct"),
            CopyMode::Decompress => write!(f, "decompress"),
        }
    }
}

/// Privileges handed out after the schema is created
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grant {
    SchemaUsage { schema: String, to: String },
    SchemaSelect { schema: String, to: String },
    TableSelect { schema: String, table: String, to: String },
}

impl Grant {
    fn statement(&self) -> String {
        match self {
            Grant::SchemaUsage { schema, to } => format!("grant USAGE on schema {} to {}", schema, to),
            Grant::SchemaSelect { schema, to } => {
                format!("grant SELECT on all tables in schema {} to {}", schema, to)
            }
            Grant::TableSelect { schema, table, to } => {
                format!("grant SELECT on table {}.{} to {}", schema, table, to)
            }
        }
    }
}

#[async_trait]
pub trait MirrorLoader: Send + Sync {
    /// Copy an HDFS path into `schema.table` and return the rows loaded
    async fn copy(
        &self,
        primary_node: &str,
        source_path: &str,
        schema: &str,
        table: &str,
        reject_table: &str,
        mode: CopyMode,
    ) -> Result<u64, MirrorError>;

    /// Recreate `dst` as an empty table with the columns of `src`
    async fn clone_schema(
        &self,
        src_schema: &str,
        src_table: &str,
        dst_schema: &str,
        dst_table: &str,
    ) -> Result<(), MirrorError>;

    /// Delete rows of `schema.table` whose `key` appears in the rollback table
    async fn rollback(
        &self,
        schema: &str,
        table: &str,
        rb_schema: &str,
        rb_table: &str,
        key: &str,
    ) -> Result<u64, MirrorError>;

    async fn truncate(&self, schema: &str, table: &str) -> Result<(), MirrorError>;

    async fn drop_table(&self, schema: &str, table: &str) -> Result<(), MirrorError>;

    async fn run_script(&self, path: &Path) -> Result<(), MirrorError>;

    async fn grant(&self, grant: &Grant) -> Result<(), MirrorError>;
}

/// Connection flags for `vsql` with Kerberos authentication
#[derive(Debug, Clone)]
pub struct VerticaConnection {
    pub vsql_path: String,
    pub krb_svcname: String,
    pub krb_host: String,
    pub host: String,
    pub port: String,
    pub db: String,
    pub user: String,
}

pub struct VerticaCli {
    runner: Arc<dyn CommandRunner>,
    connection: VerticaConnection,
}

impl VerticaCli {
    pub fn new(runner: Arc<dyn CommandRunner>, connection: VerticaConnection) -> Self {
        Self { runner, connection }
    }

    fn vsql(&self) -> String {
        let c = &self.connection;
        // Scheduler sessions do not inherit a UTF-8 locale
        format!(
            "export LC_ALL='en_US.UTF-8' && {} -k {} -K {} -h {} -p {} -d {} -U {}",
            c.vsql_path, c.krb_svcname, c.krb_host, c.host, c.port, c.db, c.user
        )
    }

    async fn execute(&self, operation: &'static str, statement: &str) -> Result<String, MirrorError> {
        let command = format!("{} -c \"{}\"", self.vsql(), statement);
        self.runner
            .run_checked(&command)
            .await
            .map(|output| output.stdout)
            .map_err(|source| MirrorError::Command { operation, source })
    }

    /// COPY statement loading `source_path` through the WebHDFS connector
    pub fn copy_statement(
        &self,
        primary_node: &str,
        source_path: &str,
        schema: &str,
        table: &str,
        reject_table: &str,
        mode: CopyMode,
    ) -> String {
        let url = join_path(primary_node, source_path);
        let filter = match mode {
            CopyMode::Direct => " FILTER GZIP()",
            CopyMode::Decompress => "",
        };
        format!(
            "COPY {schema}.{table} SOURCE Hdfs(url='{url}', username='{user}', low_speed_limit=1048576){filter} \
             DELIMITER E'\\001' REJECTMAX 0 REJECTED DATA AS TABLE {schema}.{reject_table} DIRECT COMMIT",
            user = self.connection.user,
        )
    }
}

#[async_trait]
impl MirrorLoader for VerticaCli {
    async fn copy(
        &self,
        primary_node: &str,
        source_path: &str,
        schema: &str,
        table: &str,
        reject_table: &str,
        mode: CopyMode,
    ) -> Result<u64, MirrorError> {
        let statement = self.copy_statement(primary_node, source_path, schema, table, reject_table, mode);
        let stdout = self.execute("copy", &statement).await?;
        let rows = parse_rows(&stdout)?;
        info!(source_path, schema, table, %mode, rows, "Copied partition into analytics store");
        Ok(rows)
    }

    async fn clone_schema(
        &self,
        src_schema: &str,
        src_table: &str,
        dst_schema: &str,
        dst_table: &str,
    ) -> Result<(), MirrorError> {
        let statement = format!(
            "drop table if exists {dst_schema}.{dst_table}; \
             create table {dst_schema}.{dst_table} as select * from {src_schema}.{src_table} where false;"
        );
        self.execute("clone schema", &statement).await?;
        info!(
            source = %format!("{}.{}", src_schema, src_table),
            destination = %format!("{}.{}", dst_schema, dst_table),
            "Cloned table schema"
        );
        Ok(())
    }

    async fn rollback(
        &self,
        schema: &str,
        table: &str,
        rb_schema: &str,
        rb_table: &str,
        key: &str,
    ) -> Result<u64, MirrorError> {
        let statement = format!(
            "set session autocommit to on; \
             delete from {schema}.{table} where {key} in (select {key} from {rb_schema}.{rb_table});"
        );
        let stdout = self.execute("rollback", &statement).await?;
        let rows = parse_rows(&stdout)?;
        info!(schema, table, rows, "Rolled back rows");
        Ok(rows)
    }

    async fn truncate(&self, schema: &str, table: &str) -> Result<(), MirrorError> {
        self.execute("truncate", &format!("truncate table {}.{};", schema, table))
            .await?;
        Ok(())
    }

    async fn drop_table(&self, schema: &str, table: &str) -> Result<(), MirrorError> {
        self.execute("drop table", &format!("drop table if exists {}.{}", schema, table))
            .await?;
        info!(schema, table, "Dropped table");
        Ok(())
    }

    async fn run_script(&self, path: &Path) -> Result<(), MirrorError> {
        let command = format!("{} -f '{}'", self.vsql(), path.display());
        self.runner
            .run_checked(&command)
            .await
            .map_err(|source| MirrorError::Command {
                operation: "run script",
                source,
            })?;
        info!(script = %path.display(), "Executed vsql script");
        Ok(())
    }

    async fn grant(&self, grant: &Grant) -> Result<(), MirrorError> {
        self.execute("grant", &grant.statement()).await?;
        info!(grant = ?grant, "Granted privileges");
        Ok(())
    }
}

/// Row count reported by vsql for COPY, DELETE, or `count(*)`.
///
/// vsql prints a one-column table: the header, a dashed rule, then the value.
pub fn parse_rows(output: &str) -> Result<u64, MirrorError> {
    let rows_pattern = Regex::new(r"(?:Rows Loaded|count|OUTPUT)[\s\-+]*?(\d+)")?;
    rows_pattern
        .captures(output)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .ok_or_else(|| MirrorError::MalformedOutput {
            what: "vsql row count",
            output: output.to_string(),
        })
}
