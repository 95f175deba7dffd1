//! Typed run configuration
//!
//! A run is configured by two INI documents: the dataset config (what to
//! load and where) and the environment config (metadata store, lock policy,
//! monitoring credentials). [`RunConfig`] validates both once at startup and
//! is then shared read-only as `Arc<RunConfig>`.

use chrono_tz::Tz;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tidemark_common::config::IniDocument;
use tidemark_common::ConfigError;

use crate::catalog::{Granularity, SchedulerClock};
use crate::external::{VerticaConnection, WorkflowSettings};
use crate::lock::UnlockPolicy;
use crate::partition::join_path;

const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
const DEFAULT_SKIPPED_COUNTER_GROUP: &str = "THRIVE";

/// Analytics store target of a dataset
#[derive(Debug, Clone)]
pub struct MirrorSettings {
    pub connection: VerticaConnection,
    pub schema: String,
    pub table: String,
    pub rejected_table: String,
    pub rollback_key: Option<String>,
}

impl MirrorSettings {
    fn from_document(data: &IniDocument) -> Result<Self, ConfigError> {
        Ok(Self {
            connection: VerticaConnection {
                vsql_path: data.main("vertica_vsql_path")?.to_string(),
                krb_svcname: data.main("vertica_krb_svcname")?.to_string(),
                krb_host: data.main("vertica_krb_host")?.to_string(),
                host: data.main("vertica_host")?.to_string(),
                port: data.main("vertica_port")?.to_string(),
                db: data.main("vertica_db")?.to_string(),
                user: data.main("vertica_user")?.to_string(),
            },
            schema: data.main("vertica_schema")?.to_string(),
            table: data.main("vertica_table")?.to_string(),
            rejected_table: data.main("vertica_rejected_data_table")?.to_string(),
            rollback_key: data.main_opt("vertica_rollback_key").map(str::to_string),
        })
    }

    pub fn rollback_key(&self) -> Result<&str, ConfigError> {
        self.rollback_key.as_deref().ok_or_else(|| ConfigError::MissingKey {
            section: tidemark_common::config::MAIN_SECTION.to_string(),
            key: "vertica_rollback_key".to_string(),
        })
    }
}

/// Batch workflow coordinates
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub jobtracker: String,
    pub namenode: String,
    pub workflow_xml: String,
    pub hdfs_resource_path: String,
    pub num_reducers: String,
}

/// Local (NFS) directories of a dataset
#[derive(Debug, Clone)]
pub struct LocalPaths {
    pub dataset_dir: PathBuf,
    pub resource_dir: PathBuf,
    pub workflow_properties_dir: PathBuf,
    pub jobinput_properties_dir: PathBuf,
    pub log_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub dataset_name: String,
    pub hive_db: String,
    pub hive_table: String,
    pub source_root: String,
    pub target_root: String,

    /// WebHDFS roots of the namenode candidates, in probe order
    pub namenodes: Vec<String>,
    pub namenode_probe_path: String,
    pub hdfs_user: String,

    pub processing_delay_hours: f64,
    pub chunk_granularity: Granularity,

    pub mirror_enabled: bool,
    pub mirror: Option<MirrorSettings>,

    pub workflow: WorkflowConfig,
    pub paths: LocalPaths,

    pub metadata_url: String,
    pub unlock_policy: UnlockPolicy,
    pub scheduler: SchedulerClock,
    pub skipped_counter_group: String,
    pub poll_interval: Duration,

    data: IniDocument,
    env: IniDocument,
}

impl RunConfig {
    /// Load and validate both config files
    pub fn load(data_config: impl AsRef<Path>, env_config: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_documents(IniDocument::load(data_config)?, IniDocument::load(env_config)?)
    }

    pub fn from_documents(data: IniDocument, env: IniDocument) -> Result<Self, ConfigError> {
        let text = |key: &str| data.main(key).map(str::to_string);

        let delay = data.main("folder_processing_delay")?;
        let processing_delay_hours = delay
            .parse::<f64>()
            .ok()
            .filter(|hours| hours.is_finite() && *hours >= 0.0)
            .ok_or_else(|| {
                ConfigError::invalid("folder_processing_delay", delay, "expected a non-negative number of hours")
            })?;

        let granularity = data.main("mr_chunk_size")?;
        let chunk_granularity = Granularity::from_str(granularity)
            .map_err(|e| ConfigError::invalid("mr_chunk_size", granularity, e.to_string()))?;

        let mirror_enabled = parse_bool("vertica_load", data.main("vertica_load")?)?;
        let mirror = match data.main_opt("vertica_db") {
            Some(_) => Some(MirrorSettings::from_document(&data)?),
            None if mirror_enabled => return Err(missing("vertica_db")),
            None => None,
        };

        let namenodes: Vec<String> = data
            .main("webhdfs_root")?
            .split(',')
            .map(str::trim)
            .filter(|nn| !nn.is_empty())
            .map(str::to_string)
            .collect();
        if namenodes.is_empty() {
            return Err(ConfigError::invalid("webhdfs_root", "", "no namenode listed"));
        }

        let attempts = env.main("max_unlock_attempts")?;
        let unlock_policy = attempts
            .parse::<i64>()
            .ok()
            .and_then(|n| UnlockPolicy::try_from(n).ok())
            .ok_or_else(|| ConfigError::invalid("max_unlock_attempts", attempts, "expected -1 or a non-negative integer"))?;

        let scheduler = match env.main_opt("scheduler_timezone") {
            Some(zone) => SchedulerClock::Zone(
                zone.parse::<Tz>()
                    .map_err(|e| ConfigError::invalid("scheduler_timezone", zone, e.to_string()))?,
            ),
            None => SchedulerClock::Local,
        };

        let poll_interval = match data.main_opt("job_poll_interval") {
            Some(secs) => Duration::from_secs(
                secs.parse()
                    .map_err(|_| ConfigError::invalid("job_poll_interval", secs, "expected whole seconds"))?,
            ),
            None => Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
        };

        Ok(Self {
            dataset_name: text("dataset_name")?,
            hive_db: text("hive_db")?,
            hive_table: text("hive_table")?,
            source_root: text("source_root")?,
            target_root: text("target_root")?,
            namenodes,
            namenode_probe_path: text("hdfs_root")?,
            hdfs_user: text("hdfs_user")?,
            processing_delay_hours,
            chunk_granularity,
            mirror_enabled,
            mirror,
            workflow: WorkflowConfig {
                jobtracker: text("jobtracker")?,
                namenode: text("namenode")?,
                workflow_xml: text("workflow_xml")?,
                hdfs_resource_path: text("hdfs_resource_path")?,
                num_reducers: text("mr_num_reducers")?,
            },
            paths: LocalPaths {
                dataset_dir: PathBuf::from(data.main("nfs_dataset_path")?),
                resource_dir: PathBuf::from(data.main("nfs_resource_path")?),
                workflow_properties_dir: PathBuf::from(data.main("nfs_workflow_properties_path")?),
                jobinput_properties_dir: PathBuf::from(data.main("nfs_jobinput_properties_path")?),
                log_dir: PathBuf::from(data.main("nfs_log_path")?),
            },
            metadata_url: env.main("metadata_url")?.to_string(),
            unlock_policy,
            scheduler,
            skipped_counter_group: data
                .main_opt("skipped_counter_group")
                .unwrap_or(DEFAULT_SKIPPED_COUNTER_GROUP)
                .to_string(),
            poll_interval,
            data,
            env,
        })
    }

    /// Dataset config document, for phase specific keys
    pub fn data(&self) -> &IniDocument {
        &self.data
    }

    /// Environment config document, for phase specific keys
    pub fn env(&self) -> &IniDocument {
        &self.env
    }

    /// Mirror settings, required by phases that touch the analytics store
    pub fn mirror_settings(&self) -> Result<&MirrorSettings, ConfigError> {
        self.mirror.as_ref().ok_or_else(|| missing("vertica_db"))
    }

    /// HDFS path of the workflow definition
    pub fn workflow_xml_path(&self) -> String {
        join_path(
            &join_path(&self.workflow.hdfs_resource_path, "workflow"),
            &self.workflow.workflow_xml,
        )
    }

    pub fn workflow_settings(&self) -> WorkflowSettings {
        WorkflowSettings {
            jobtracker: self.workflow.jobtracker.clone(),
            namenode: self.workflow.namenode.clone(),
            workflow_xml: self.workflow_xml_path(),
            num_reducers: self.workflow.num_reducers.clone(),
            source_root: self.source_root.clone(),
            resource_dir: self.paths.resource_dir.clone(),
            properties_dir: self.paths.workflow_properties_dir.clone(),
            skipped_counter_group: self.skipped_counter_group.clone(),
        }
    }
}

fn missing(key: &str) -> ConfigError {
    ConfigError::MissingKey {
        section: tidemark_common::config::MAIN_SECTION.to_string(),
        key: key.to_string(),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ConfigError::invalid(key, value, "expected true or false")),
    }
}


#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_from_documents() {
        let (data, env) = documents(DATA, ENV);
        let config = RunConfig::from_documents(data, env).unwrap();

        assert_eq!(config.dataset_name, "clicks");
        assert_eq!(config.namenodes.len(), 2);
        assert_eq!(config.namenodes[1], "http://nn2:50070/webhdfs/v1");
        assert_eq!(config.chunk_granularity, Granularity::Hour);
        assert!((config.processing_delay_hours - 0.5).abs() < f64::EPSILON);
        assert!(config.mirror_enabled);
        assert_eq!(config.unlock_policy, UnlockPolicy::After(3));
        assert_eq!(config.scheduler, SchedulerClock::Local);
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.skipped_counter_group, "THRIVE");
        assert_eq!(config.workflow_xml_path(), "/apps/clicks/workflow/workflow.xml");
        assert_eq!(config.mirror_settings().unwrap().rollback_key().unwrap(), "event_id");
    }

    #[test]
    fn test_rejects_unknown_granularity() {
        let (data, env) = documents(&DATA.replace("mr_chunk_size = hour", "mr_chunk_size = week"), ENV);
        let err = RunConfig::from_documents(data, env).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "mr_chunk_size"));
    }

    #[test]
    fn test_rejects_bad_delay_and_attempts() {
        let (data, env) = documents(
            &DATA.replace("folder_processing_delay = 0.5", "folder_processing_delay = soon"),
            ENV,
        );
        assert!(RunConfig::from_documents(data, env).is_err());

        let (data, env) = documents(DATA, "metadata_url = sqlite::memory:\nmax_unlock_attempts = -2\n");
        assert!(RunConfig::from_documents(data, env).is_err());
    }

    #[test]
    fn test_rejects_non_finite_or_negative_delay() {
        for delay in ["NaN", "inf", "-inf", "-1", "-0.5"] {
            let (data, env) = documents(
                &DATA.replace("folder_processing_delay = 0.5", &format!("folder_processing_delay = {}", delay)),
                ENV,
            );
            let err = RunConfig::from_documents(data, env).unwrap_err();
            assert!(
                matches!(&err, ConfigError::InvalidValue { key, .. } if key == "folder_processing_delay"),
                "{}: {}",
                delay,
                err
            );
        }

        let (data, env) = documents(
            &DATA.replace("folder_processing_delay = 0.5", "folder_processing_delay = 0"),
            ENV,
        );
        assert_eq!(RunConfig::from_documents(data, env).unwrap().processing_delay_hours, 0.0);
    }

    #[test]
    fn test_never_unlock_and_timezone() {
        let (data, env) = documents(
            DATA,
            "metadata_url = sqlite::memory:\nmax_unlock_attempts = -1\nscheduler_timezone = America/Los_Angeles\n",
        );
        let config = RunConfig::from_documents(data, env).unwrap();
        assert_eq!(config.unlock_policy, UnlockPolicy::Never);
        assert_eq!(config.scheduler, SchedulerClock::Zone(Tz::America__Los_Angeles));
    }

    #[test]
    fn test_mirror_settings_required_when_enabled() {
        let data: String = DATA
            .lines()
            .filter(|line| !line.starts_with("vertica_db"))
            .map(|line| format!("{}\n", line))
            .collect();
        let (data, env) = documents(&data, ENV);
        let err = RunConfig::from_documents(data, env).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey { ref key, .. } if key == "vertica_db"));
    }

    #[test]
    fn test_mirror_disabled_without_settings() {
        let data: String = DATA
            .lines()
            .filter(|line| !line.starts_with("vertica_") || line.starts_with("vertica_load"))
            .map(|line| format!("{}\n", line.replace("vertica_load = True", "vertica_load = false")))
            .collect();
        let (data, env) = documents(&data, ENV);
        let config = RunConfig::from_documents(data, env).unwrap();
        assert!(!config.mirror_enabled);
        assert!(config.mirror_settings().is_err());
    }
}
