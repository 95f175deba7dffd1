//! Load metadata store
//!
//! Uses SQLite for the per-partition load history, the dataset onboarding
//! record and the advisory dataset lock. Every statement commits on its own.

mod models;

pub use models::{
    format_ts, LoadRecord, LoadType, LockStatus, MirrorStage, NewLoadRecord, SetupRecord, UnprocessedPartition,
    TS_FORMAT,
};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("Metadata {operation} failed: {source}")]
    Query {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("Failed to open metadata store: {0}")]
    Connect(#[from] sqlx::Error),

    #[error("Metadata migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("No lock row for dataset '{dataset}'. Check that the dataset is set up")]
    MissingLockRow { dataset: String },

    #[error("Unknown load type '{0}'")]
    InvalidLoadType(String),
}

fn query_failed(operation: &'static str) -> impl FnOnce(sqlx::Error) -> MetadataError {
    move |source| MetadataError::Query { operation, source }
}

/// Metadata store with SQLite backend
#[derive(Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    /// Open the store at `url` and apply pending migrations
    pub async fn connect(url: &str) -> Result<Self, MetadataError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(30));

        // One connection keeps `sqlite::memory:` a single database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    /// Wrap an existing pool and apply pending migrations
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, MetadataError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn insert_setup(&self, record: &SetupRecord) -> Result<(), MetadataError> {
        sqlx::query(
            r#"
            INSERT INTO tidemark_setup (dataset_name, hive_db, hive_table, hive_ddl,
                vertica_db, vertica_schema, vertica_table, vertica_ddl, mapper)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&record.dataset_name)
        .bind(&record.hive_db)
        .bind(&record.hive_table)
        .bind(&record.hive_ddl)
        .bind(&record.vertica_db)
        .bind(&record.vertica_schema)
        .bind(&record.vertica_table)
        .bind(&record.vertica_ddl)
        .bind(&record.mapper)
        .execute(&self.pool)
        .await
        .map_err(query_failed("insert setup"))?;

        info!(dataset = %record.dataset_name, "Recorded dataset setup");
        Ok(())
    }

    /// Create the unlocked lock row of a dataset
    pub async fn insert_lock(&self, dataset: &str) -> Result<(), MetadataError> {
        sqlx::query(
            r#"
            INSERT INTO tidemark_dataset_lock (dataset_name, locked, release_attempts)
            VALUES (?1, 0, 0)
            "#,
        )
        .bind(dataset)
        .execute(&self.pool)
        .await
        .map_err(query_failed("insert lock"))?;

        Ok(())
    }

    pub async fn insert_load(&self, record: &NewLoadRecord) -> Result<(), MetadataError> {
        sqlx::query(
            r#"
            INSERT INTO tidemark_load_metadata (load_id, dataset_name, load_type, hive_db, hive_table,
                hive_start_ts, hive_end_ts, last_load_folder, hive_last_partition,
                hadoop_records_processed, hive_rows_loaded)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(&record.load_id)
        .bind(&record.dataset_name)
        .bind(record.load_type.as_str())
        .bind(&record.hive_db)
        .bind(&record.hive_table)
        .bind(format_ts(record.hive_start_ts))
        .bind(format_ts(record.hive_end_ts))
        .bind(&record.last_load_folder)
        .bind(&record.hive_last_partition)
        .bind(record.records_processed as i64)
        .bind(record.rows_committed as i64)
        .execute(&self.pool)
        .await
        .map_err(query_failed("insert load"))?;

        debug!(
            load_id = %record.load_id,
            partition = %record.hive_last_partition,
            "Recorded warehouse stage"
        );
        Ok(())
    }

    /// Last source directory loaded by the most recent run of `load_type`
    pub async fn get_lastdir(
        &self,
        dataset: &str,
        hive_table: &str,
        load_type: LoadType,
    ) -> Result<Option<String>, MetadataError> {
        let row = sqlx::query(
            r#"
            SELECT last_load_folder FROM tidemark_load_metadata
            WHERE dataset_name = ?1 AND hive_table = ?2 AND load_type = ?3
            ORDER BY hive_end_ts DESC
            LIMIT 1
            "#,
        )
        .bind(dataset)
        .bind(hive_table)
        .bind(load_type.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(query_failed("get last directory"))?;

        Ok(row.and_then(|r| r.get::<Option<String>, _>("last_load_folder")))
    }

    /// Partitions committed to the warehouse that have no mirror stage yet
    pub async fn get_unprocessed_partitions(
        &self,
        hive_db: &str,
        hive_table: &str,
    ) -> Result<Vec<UnprocessedPartition>, MetadataError> {
        sqlx::query_as::<_, UnprocessedPartition>(
            r#"
            SELECT load_id, hive_last_partition, hive_rows_loaded, hadoop_records_processed
            FROM tidemark_load_metadata
            WHERE hive_db = ?1 AND hive_table = ?2
              AND hive_last_partition <> ''
              AND vertica_last_partition IS NULL
            ORDER BY hive_end_ts, hive_last_partition
            "#,
        )
        .bind(hive_db)
        .bind(hive_table)
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("get unprocessed partitions"))
    }

    pub async fn update_mirror_stage(
        &self,
        load_id: &str,
        partition: &str,
        stage: &MirrorStage,
    ) -> Result<(), MetadataError> {
        sqlx::query(
            r#"
            UPDATE tidemark_load_metadata
            SET vertica_db = ?1, vertica_schema = ?2, vertica_table = ?3,
                vertica_start_ts = ?4, vertica_end_ts = ?5, vertica_last_partition = ?6,
                vertica_rows_loaded = ?7, status = ?8
            WHERE load_id = ?9 AND hive_last_partition = ?6
            "#,
        )
        .bind(&stage.vertica_db)
        .bind(&stage.vertica_schema)
        .bind(&stage.vertica_table)
        .bind(format_ts(stage.start_ts))
        .bind(format_ts(stage.end_ts))
        .bind(partition)
        .bind(stage.rows_loaded as i64)
        .bind(&stage.status)
        .bind(load_id)
        .execute(&self.pool)
        .await
        .map_err(query_failed("update mirror stage"))?;

        Ok(())
    }

    pub async fn lock_status(&self, dataset: &str) -> Result<LockStatus, MetadataError> {
        let row = sqlx::query(
            r#"
            SELECT locked, release_attempts FROM tidemark_dataset_lock WHERE dataset_name = ?1
            "#,
        )
        .bind(dataset)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_failed("get lock status"))?
        .ok_or_else(|| MetadataError::MissingLockRow {
            dataset: dataset.to_string(),
        })?;

        Ok(LockStatus {
            locked: row.get::<i64, _>("locked") != 0,
            release_attempts: row.get("release_attempts"),
        })
    }

    /// Lock the dataset and reset its release attempts
    pub async fn set_locked(&self, dataset: &str) -> Result<(), MetadataError> {
        self.update_lock(
            "set lock",
            "UPDATE tidemark_dataset_lock SET locked = 1, release_attempts = 0 WHERE dataset_name = ?1",
            dataset,
        )
        .await
    }

    /// Unlock the dataset; release attempts are left as they are
    pub async fn release(&self, dataset: &str) -> Result<(), MetadataError> {
        self.update_lock(
            "release lock",
            "UPDATE tidemark_dataset_lock SET locked = 0 WHERE dataset_name = ?1",
            dataset,
        )
        .await
    }

    /// Unlock the dataset and reset its release attempts
    pub async fn force_unlock(&self, dataset: &str) -> Result<(), MetadataError> {
        self.update_lock(
            "force unlock",
            "UPDATE tidemark_dataset_lock SET locked = 0, release_attempts = 0 WHERE dataset_name = ?1",
            dataset,
        )
        .await
    }

    pub async fn increment_release_attempts(&self, dataset: &str) -> Result<(), MetadataError> {
        self.update_lock(
            "increment release attempts",
            "UPDATE tidemark_dataset_lock SET release_attempts = release_attempts + 1 WHERE dataset_name = ?1",
            dataset,
        )
        .await
    }

    async fn update_lock(&self, operation: &'static str, sql: &str, dataset: &str) -> Result<(), MetadataError> {
        let result = sqlx::query(sql)
            .bind(dataset)
            .execute(&self.pool)
            .await
            .map_err(query_failed(operation))?;

        if result.rows_affected() == 0 {
            return Err(MetadataError::MissingLockRow {
                dataset: dataset.to_string(),
            });
        }
        Ok(())
    }

    /// Remove the load rows of one partition
    pub async fn delete_partition(&self, dataset: &str, partition: &str) -> Result<u64, MetadataError> {
        let result = sqlx::query(
            r#"
            DELETE FROM tidemark_load_metadata WHERE dataset_name = ?1 AND hive_last_partition = ?2
            "#,
        )
        .bind(dataset)
        .bind(partition)
        .execute(&self.pool)
        .await
        .map_err(query_failed("delete partition"))?;

        info!(dataset, partition, rows = result.rows_affected(), "Removed partition metadata");
        Ok(result.rows_affected())
    }

    /// Remove every row of a dataset from all metadata tables
    pub async fn purge(&self, dataset: &str) -> Result<(), MetadataError> {
        for sql in [
            "DELETE FROM tidemark_setup WHERE dataset_name = ?1",
            "DELETE FROM tidemark_load_metadata WHERE dataset_name = ?1",
            "DELETE FROM tidemark_dataset_lock WHERE dataset_name = ?1",
        ] {
            sqlx::query(sql)
                .bind(dataset)
                .execute(&self.pool)
                .await
                .map_err(query_failed("purge"))?;
        }

        info!(dataset, "Purged dataset metadata");
        Ok(())
    }

    /// Load history of a dataset, oldest first
    pub async fn load_records(&self, dataset: &str) -> Result<Vec<LoadRecord>, MetadataError> {
        sqlx::query_as::<_, LoadRecord>(
            r#"
            SELECT load_id, dataset_name, load_type, hive_db, hive_table, hive_start_ts, hive_end_ts,
                last_load_folder, hive_last_partition, hadoop_records_processed, hive_rows_loaded,
                vertica_db, vertica_schema, vertica_table, vertica_start_ts, vertica_end_ts,
                vertica_last_partition, vertica_rows_loaded, status
            FROM tidemark_load_metadata
            WHERE dataset_name = ?1
            ORDER BY hive_end_ts, hive_last_partition
            "#,
        )
        .bind(dataset)
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("list load records"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};

    async fn create_test_store() -> MetadataStore {
        MetadataStore::connect("sqlite::memory:").await.unwrap()
    }

    fn ts(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2016, 8, 19)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn load(load_id: &str, partition: &str, folder: &str, end: NaiveDateTime, load_type: LoadType) -> NewLoadRecord {
        NewLoadRecord {
            load_id: load_id.to_string(),
            dataset_name: "clicks".to_string(),
            load_type,
            hive_db: "events".to_string(),
            hive_table: "clicks".to_string(),
            hive_start_ts: end,
            hive_end_ts: end,
            last_load_folder: Some(folder.to_string()),
            hive_last_partition: partition.to_string(),
            records_processed: 100,
            rows_committed: 90,
        }
    }

    #[tokio::test]
    async fn test_get_lastdir_takes_latest_of_type() {
        let store = create_test_store().await;
        assert_eq!(store.get_lastdir("clicks", "clicks", LoadType::Scheduled).await.unwrap(), None);

        store
            .insert_load(&load("a", "2016/08/19/13/0", "d_20160819-1350", ts(14, 0), LoadType::Scheduled))
            .await
            .unwrap();
        store
            .insert_load(&load("b", "2016/08/19/14/0", "d_20160819-1450", ts(15, 0), LoadType::Scheduled))
            .await
            .unwrap();
        store
            .insert_load(&load("c", "2016/08/19/10/1", "d_20160819-1010", ts(16, 0), LoadType::Replay))
            .await
            .unwrap();

        assert_eq!(
            store.get_lastdir("clicks", "clicks", LoadType::Scheduled).await.unwrap().as_deref(),
            Some("d_20160819-1450")
        );
        assert_eq!(
            store.get_lastdir("clicks", "clicks", LoadType::Replay).await.unwrap().as_deref(),
            Some("d_20160819-1010")
        );
    }

    #[tokio::test]
    async fn test_duplicate_partition_in_load_is_rejected() {
        let store = create_test_store().await;
        let record = load("a", "2016/08/19/13/0", "d_20160819-1350", ts(14, 0), LoadType::Scheduled);
        store.insert_load(&record).await.unwrap();
        assert!(store.insert_load(&record).await.is_err());
    }

    #[tokio::test]
    async fn test_unprocessed_partitions_and_mirror_stage() {
        let store = create_test_store().await;
        let mut marker = load("setup", "", "d_20160819-1200", ts(12, 0), LoadType::Scheduled);
        marker.records_processed = 0;
        store.insert_load(&marker).await.unwrap();
        store
            .insert_load(&load("a", "2016/08/19/13/0", "d_20160819-1350", ts(14, 0), LoadType::Scheduled))
            .await
            .unwrap();

        let pending = store.get_unprocessed_partitions("events", "clicks").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].partition, "2016/08/19/13/0");
        assert_eq!(pending[0].records_processed, 100);
        assert_eq!(pending[0].hive_rows_loaded, 90);

        let stage = MirrorStage {
            vertica_db: "analytics".to_string(),
            vertica_schema: "events".to_string(),
            vertica_table: "clicks".to_string(),
            start_ts: ts(14, 1),
            end_ts: ts(14, 2),
            rows_loaded: 90,
            status: "SUCCESS".to_string(),
        };
        store.update_mirror_stage("a", "2016/08/19/13/0", &stage).await.unwrap();
        assert!(store.get_unprocessed_partitions("events", "clicks").await.unwrap().is_empty());

        let records = store.load_records("clicks").await.unwrap();
        let mirrored = records.iter().find(|r| r.load_id == "a").unwrap();
        assert_eq!(mirrored.vertica_last_partition.as_deref(), Some("2016/08/19/13/0"));
        assert_eq!(mirrored.vertica_rows_loaded, Some(90));
        assert_eq!(mirrored.vertica_end_ts.as_deref(), Some("2016-08-19 14:02:00"));
        assert_eq!(mirrored.status.as_deref(), Some("SUCCESS"));
    }

    #[tokio::test]
    async fn test_lock_row_lifecycle() {
        let store = create_test_store().await;
        assert!(matches!(
            store.lock_status("clicks").await,
            Err(MetadataError::MissingLockRow { .. })
        ));

        store.insert_lock("clicks").await.unwrap();
        store.increment_release_attempts("clicks").await.unwrap();
        assert_eq!(
            store.lock_status("clicks").await.unwrap(),
            LockStatus {
                locked: false,
                release_attempts: 1
            }
        );

        store.set_locked("clicks").await.unwrap();
        assert_eq!(
            store.lock_status("clicks").await.unwrap(),
            LockStatus {
                locked: true,
                release_attempts: 0
            }
        );

        store.increment_release_attempts("clicks").await.unwrap();
        store.release("clicks").await.unwrap();
        assert_eq!(
            store.lock_status("clicks").await.unwrap(),
            LockStatus {
                locked: false,
                release_attempts: 1
            }
        );
    }

    #[tokio::test]
    async fn test_delete_partition_and_purge() {
        let store = create_test_store().await;
        store.insert_lock("clicks").await.unwrap();
        store
            .insert_setup(&SetupRecord {
                dataset_name: "clicks".to_string(),
                hive_db: "events".to_string(),
                hive_table: "clicks".to_string(),
                hive_ddl: "create table clicks (...)".to_string(),
                vertica_db: None,
                vertica_schema: None,
                vertica_table: None,
                vertica_ddl: None,
                mapper: "mapper.py".to_string(),
            })
            .await
            .unwrap();
        store
            .insert_load(&load("a", "2016/08/19/13/0", "d_20160819-1350", ts(14, 0), LoadType::Scheduled))
            .await
            .unwrap();
        store
            .insert_load(&load("a", "2016/08/19/14/0", "d_20160819-1450", ts(15, 0), LoadType::Scheduled))
            .await
            .unwrap();

        assert_eq!(store.delete_partition("clicks", "2016/08/19/13/0").await.unwrap(), 1);
        assert_eq!(store.load_records("clicks").await.unwrap().len(), 1);

        store.purge("clicks").await.unwrap();
        assert!(store.load_records("clicks").await.unwrap().is_empty());
        assert!(store.lock_status("clicks").await.is_err());
    }

    #[test]
    fn test_load_type_parse() {
        assert_eq!("replay".parse::<LoadType>().unwrap(), LoadType::Replay);
        assert!("nightly".parse::<LoadType>().is_err());
    }
}
