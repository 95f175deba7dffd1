//! Distributed filesystem access through `hadoop fs`

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::shell::{CommandRunner, ShellError};
use crate::partition::join_path;

#[derive(Error, Debug)]
pub enum HdfsError {
    #[error("HDFS {operation} failed for '{path}': {source}")]
    Command {
        operation: &'static str,
        path: String,
        #[source]
        source: ShellError,
    },

    #[error("Unexpected {what} output: {output}")]
    MalformedOutput { what: &'static str, output: String },
}

#[async_trait]
pub trait Hdfs: Send + Sync {
    /// Full paths of the entries directly under `path`
    async fn list(&self, path: &str) -> Result<Vec<String>, HdfsError>;

    async fn path_exists(&self, path: &str) -> Result<bool, HdfsError>;

    async fn make_dir(&self, path: &str) -> Result<(), HdfsError>;

    /// Recursive delete that bypasses the trash
    async fn remove_dir(&self, path: &str) -> Result<(), HdfsError>;

    async fn put(&self, local: &str, remote: &str) -> Result<(), HdfsError>;

    /// Write the decoded text of `src` into the single file `dst`
    async fn decompress(&self, src: &str, dst: &str) -> Result<(), HdfsError>;

    /// Add `perms` for all users, recursively
    async fn grant_all(&self, perms: &str, path: &str) -> Result<(), HdfsError>;

    /// First candidate namenode that answers a status probe for `probe_path`
    async fn primary_namenode(
        &self,
        candidates: &[String],
        probe_path: &str,
        user: &str,
    ) -> Result<Option<String>, HdfsError>;
}

/// `hadoop fs` backed filesystem client
pub struct HadoopFs {
    runner: Arc<dyn CommandRunner>,
}

impl HadoopFs {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn checked(&self, operation: &'static str, path: &str, command: String) -> Result<String, HdfsError> {
        self.runner
            .run_checked(&command)
            .await
            .map(|output| output.stdout)
            .map_err(|source| HdfsError::Command {
                operation,
                path: path.to_string(),
                source,
            })
    }
}

#[async_trait]
impl Hdfs for HadoopFs {
    async fn list(&self, path: &str) -> Result<Vec<String>, HdfsError> {
        let stdout = self.checked("list", path, format!("hadoop fs -ls {}", path)).await?;
        parse_listing(&stdout)
    }

    async fn path_exists(&self, path: &str) -> Result<bool, HdfsError> {
        let command = format!("hadoop fs -test -e {}", path);
        let output = self.runner.run(&command).await.map_err(|source| HdfsError::Command {
            operation: "test",
            path: path.to_string(),
            source,
        })?;
        debug!(path, exists = output.success(), "Checked HDFS path");
        Ok(output.success())
    }

    async fn make_dir(&self, path: &str) -> Result<(), HdfsError> {
        self.checked("mkdir", path, format!("hadoop fs -mkdir -p {}", path)).await?;
        Ok(())
    }

    async fn remove_dir(&self, path: &str) -> Result<(), HdfsError> {
        self.checked("remove", path, format!("hadoop fs -rm -r -skipTrash {}", path))
            .await?;
        info!(path, "Removed HDFS path");
        Ok(())
    }

    async fn put(&self, local: &str, remote: &str) -> Result<(), HdfsError> {
        self.checked("put", remote, format!("hadoop fs -put {} {}", local, remote))
            .await?;
        Ok(())
    }

    async fn decompress(&self, src: &str, dst: &str) -> Result<(), HdfsError> {
        let command = format!("hadoop fs -text {} | hadoop fs -put - {}", src, dst);
        self.checked("decompress", src, command).await?;
        Ok(())
    }

    async fn grant_all(&self, perms: &str, path: &str) -> Result<(), HdfsError> {
        self.checked("chmod", path, format!("hadoop fs -chmod -R a+{} {}", perms, path))
            .await?;
        Ok(())
    }

    async fn primary_namenode(
        &self,
        candidates: &[String],
        probe_path: &str,
        user: &str,
    ) -> Result<Option<String>, HdfsError> {
        for candidate in candidates {
            let url = format!("{}?op=GETFILESTATUS", join_path(candidate, probe_path));
            let command = format!("curl --negotiate -u:{} '{}'", user, url);
            let output = self.runner.run(&command).await.map_err(|source| HdfsError::Command {
                operation: "probe",
                path: candidate.clone(),
                source,
            })?;

            if output.success() && output.stdout.contains("FileStatus") {
                info!(namenode = %candidate, "Found primary namenode");
                return Ok(Some(candidate.clone()));
            }
            debug!(namenode = %candidate, status = output.status, "Namenode is not primary");
        }

        warn!(candidates = candidates.len(), "No namenode answered the status probe");
        Ok(None)
    }
}

/// Extract entry paths from `hadoop fs -ls` output.
///
/// The `Found N items` header is skipped. Entry lines carry eight or more
/// whitespace separated fields with the path last.
pub fn parse_listing(output: &str) -> Result<Vec<String>, HdfsError> {
    let mut entries = Vec::new();
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if line.starts_with("Found ") && line.ends_with("items") {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.last() {
            Some(path) if fields.len() >= 8 => entries.push((*path).to_string()),
            _ => {
                return Err(HdfsError::MalformedOutput {
                    what: "hadoop fs -ls",
                    output: line.to_string(),
                })
            }
        }
    }
    Ok(entries)
}
