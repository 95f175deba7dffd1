//! Row types of the metadata store

use chrono::NaiveDateTime;
use std::fmt;
use std::str::FromStr;

use super::MetadataError;

/// Timestamp format of every `*_ts` column
pub const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn format_ts(ts: NaiveDateTime) -> String {
    ts.format(TS_FORMAT).to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadType {
    Scheduled,
    Replay,
}

impl LoadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadType::Scheduled => "scheduled",
            LoadType::Replay => "replay",
        }
    }
}

impl fmt::Display for LoadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadType {
    type Err = MetadataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(LoadType::Scheduled),
            "replay" => Ok(LoadType::Replay),
            other => Err(MetadataError::InvalidLoadType(other.to_string())),
        }
    }
}

/// Dataset onboarding row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupRecord {
    pub dataset_name: String,
    pub hive_db: String,
    pub hive_table: String,
    pub hive_ddl: String,
    pub vertica_db: Option<String>,
    pub vertica_schema: Option<String>,
    pub vertica_table: Option<String>,
    pub vertica_ddl: Option<String>,
    pub mapper: String,
}

/// Warehouse stage of one loaded partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLoadRecord {
    pub load_id: String,
    pub dataset_name: String,
    pub load_type: LoadType,
    pub hive_db: String,
    pub hive_table: String,
    pub hive_start_ts: NaiveDateTime,
    pub hive_end_ts: NaiveDateTime,
    pub last_load_folder: Option<String>,
    /// Relative partition path; empty for the marker row written at setup
    pub hive_last_partition: String,
    pub records_processed: u64,
    pub rows_committed: u64,
}

/// Mirror stage written once a partition has been copied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorStage {
    pub vertica_db: String,
    pub vertica_schema: String,
    pub vertica_table: String,
    pub start_ts: NaiveDateTime,
    pub end_ts: NaiveDateTime,
    pub rows_loaded: u64,
    pub status: String,
}

/// Partition committed to the warehouse but not yet mirrored
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct UnprocessedPartition {
    pub load_id: String,
    #[sqlx(rename = "hive_last_partition")]
    pub partition: String,
    pub hive_rows_loaded: i64,
    #[sqlx(rename = "hadoop_records_processed")]
    pub records_processed: i64,
}

/// Full `tidemark_load_metadata` row
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct LoadRecord {
    pub load_id: String,
    pub dataset_name: String,
    pub load_type: String,
    pub hive_db: String,
    pub hive_table: String,
    pub hive_start_ts: String,
    pub hive_end_ts: String,
    pub last_load_folder: Option<String>,
    pub hive_last_partition: String,
    pub hadoop_records_processed: i64,
    pub hive_rows_loaded: i64,
    pub vertica_db: Option<String>,
    pub vertica_schema: Option<String>,
    pub vertica_table: Option<String>,
    pub vertica_start_ts: Option<String>,
    pub vertica_end_ts: Option<String>,
    pub vertica_last_partition: Option<String>,
    pub vertica_rows_loaded: Option<i64>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockStatus {
    pub locked: bool,
    pub release_attempts: i64,
}
