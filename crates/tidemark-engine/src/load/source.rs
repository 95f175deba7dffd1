//! Where a load run finds its source directories

use std::path::PathBuf;
use tracing::info;

use super::LoadError;
use crate::catalog::{self, SourceDirectory};
use crate::collaborators::Collaborators;
use crate::metadata::LoadType;
use crate::settings::RunConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectorySource {
    /// Directories that arrived since the last scheduled load and have aged
    /// past the processing delay
    Scheduled,
    /// Directories listed one per line in an operator supplied file
    Replay { dirs_file: PathBuf },
}

impl DirectorySource {
    pub fn load_type(&self) -> LoadType {
        match self {
            DirectorySource::Scheduled => LoadType::Scheduled,
            DirectorySource::Replay { .. } => LoadType::Replay,
        }
    }

    /// Directories this run should process, oldest first
    pub async fn directories(
        &self,
        config: &RunConfig,
        collaborators: &Collaborators,
    ) -> Result<Vec<SourceDirectory>, LoadError> {
        match self {
            DirectorySource::Scheduled => {
                let last = collaborators
                    .store
                    .get_lastdir(&config.dataset_name, &config.hive_table, LoadType::Scheduled)
                    .await?;
                let all = catalog::list_directories(collaborators.fs.as_ref(), &config.source_root).await?;
                let new = catalog::new_since(&all, last.as_deref());
                info!(
                    last_processed = last.as_deref().unwrap_or("-"),
                    listed = all.len(),
                    new = new.len(),
                    "Listed source directories"
                );
                Ok(config.scheduler.filter_by_delay(new, config.processing_delay_hours))
            }
            DirectorySource::Replay { dirs_file } => {
                let text = tokio::fs::read_to_string(dirs_file)
                    .await
                    .map_err(|source| LoadError::ReplayFile {
                        path: dirs_file.clone(),
                        source,
                    })?;
                Ok(replay_directories(&text))
            }
        }
    }
}

/// Directories named in a replay file; lines without a directory name are skipped
pub fn replay_directories(text: &str) -> Vec<SourceDirectory> {
    catalog::sorted_directories(text.lines())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_directories() {
        let dirs = replay_directories("d_20160819-1410\n\n# comment\nd_20160819-1400\nnot-a-dir\nd_20160819-1400\n");
        let names: Vec<&str> = dirs.iter().map(SourceDirectory::name).collect();
        assert_eq!(names, vec!["d_20160819-1400", "d_20160819-1410"]);
    }

    #[test]
    fn test_load_type() {
        assert_eq!(DirectorySource::Scheduled.load_type(), LoadType::Scheduled);
        assert_eq!(
            DirectorySource::Replay {
                dirs_file: PathBuf::from("dirs.txt")
            }
            .load_type(),
            LoadType::Replay
        );
    }
}
