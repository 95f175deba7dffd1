//! One-time onboarding of a dataset
//!
//! Steps run in order and the first failure stops the phase:
//!
//! 1. Local tree: directories, resources extracted from the zip archive,
//!    generated DDL and workflow definition.
//! 2. Metadata rows: setup record, initial scheduled load, unlocked lock.
//! 3. Warehouse table.
//! 4. Analytics store table and grants, when mirroring.
//! 5. HDFS resource tree the batch workflow reads from.

use chrono::NaiveDateTime;
use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tidemark_common::template::materialize;
use tidemark_common::ConfigError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::catalog::SourceDirectory;
use crate::collaborators::Collaborators;
use crate::external::{Grant, HdfsError, MirrorError, WarehouseError};
use crate::metadata::{LoadType, MetadataError, NewLoadRecord, SetupRecord};
use crate::partition::join_path;
use crate::settings::RunConfig;

const HIVE_TEMPLATE: &str = "hive_schema_template.sql";
const VERTICA_TEMPLATE: &str = "vertica_schema_template.sql";
const WORKFLOW_TEMPLATE: &str = "workflow_template.xml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStep {
    Local,
    Metadata,
    Warehouse,
    Mirror,
    Hdfs,
}

impl fmt::Display for SetupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SetupStep::Local => "local",
            SetupStep::Metadata => "metadata",
            SetupStep::Warehouse => "hive",
            SetupStep::Mirror => "vertica",
            SetupStep::Hdfs => "hdfs",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
#[error("{step} setup failed: {source}")]
pub struct SetupError {
    pub step: SetupStep,
    #[source]
    pub source: SetupFailure,
}

#[derive(Error, Debug)]
pub enum SetupFailure {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read resource archive {}: {source}", path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("Resource archive {} has no entry named {name}", archive.display())]
    MissingResource { archive: PathBuf, name: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Warehouse(#[from] WarehouseError),

    #[error(transparent)]
    Mirror(#[from] MirrorError),

    #[error(transparent)]
    Hdfs(#[from] HdfsError),
}

fn io_failed(path: &Path) -> impl FnOnce(std::io::Error) -> SetupFailure + '_ {
    move |source| SetupFailure::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Optional clauses of the analytics store DDL, empty when the key is unset
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableClauses {
    pub projection: String,
    pub segmentation: String,
    pub partition: String,
}

impl TableClauses {
    pub fn new(projection_keys: Option<&str>, segmentation_keys: Option<&str>, partition_expr: Option<&str>) -> Self {
        let clause = |value: Option<&str>, render: fn(&str) -> String| {
            value
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(render)
                .unwrap_or_default()
        };
        Self {
            projection: clause(projection_keys, |k| format!("order by {} ", k)),
            segmentation: clause(segmentation_keys, |k| format!("segmented by modularhash({}) all nodes", k)),
            partition: clause(partition_expr, |e| format!("partition by {}", e)),
        }
    }
}

/// Column definitions, one per non-blank line, joined for a `CREATE TABLE`
pub fn column_mappings(columns: &str) -> String {
    columns
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(",\n")
}

/// Extract the named entries of a zip archive into `dest`, flattening any
/// directories inside the archive
pub fn extract_resources(archive: &Path, names: &[&str], dest: &Path) -> Result<Vec<PathBuf>, SetupFailure> {
    let archive_failed = |source| SetupFailure::Archive {
        path: archive.to_path_buf(),
        source,
    };
    let file = std::fs::File::open(archive).map_err(io_failed(archive))?;
    let mut zip = zip::ZipArchive::new(file).map_err(archive_failed)?;

    let mut found: HashMap<String, Vec<u8>> = HashMap::new();
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(archive_failed)?;
        if entry.is_dir() {
            continue;
        }
        let full_name = entry.name().to_string();
        let basename = full_name.rsplit('/').next().unwrap_or(&full_name).to_string();
        if names.contains(&basename.as_str()) {
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents).map_err(io_failed(archive))?;
            debug!(entry = %full_name, bytes = contents.len(), "Extracted resource");
            found.insert(basename, contents);
        }
    }

    let mut written = Vec::with_capacity(names.len());
    for name in names {
        let contents = found.remove(*name).ok_or_else(|| SetupFailure::MissingResource {
            archive: archive.to_path_buf(),
            name: name.to_string(),
        })?;
        let out = dest.join(name);
        std::fs::write(&out, contents).map_err(io_failed(&out))?;
        written.push(out);
    }
    Ok(written)
}

/// `a+r` on every file in `dir`, plus `a+x` on python scripts
#[cfg(unix)]
fn open_permissions(dir: &Path) -> Result<(), SetupFailure> {
    use std::os::unix::fs::PermissionsExt;

    for entry in std::fs::read_dir(dir).map_err(io_failed(dir))? {
        let path = entry.map_err(io_failed(dir))?.path();
        let metadata = std::fs::metadata(&path).map_err(io_failed(&path))?;
        let mut mode = metadata.permissions().mode() | 0o444;
        if path.extension().is_some_and(|ext| ext == "py") {
            mode |= 0o111;
        }
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).map_err(io_failed(&path))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn open_permissions(_dir: &Path) -> Result<(), SetupFailure> {
    Ok(())
}

pub struct SetupOrchestrator {
    config: Arc<RunConfig>,
    collaborators: Collaborators,
    resources: PathBuf,
}

impl SetupOrchestrator {
    /// `resources` is the zip archive holding the column files and mapper
    pub fn new(config: Arc<RunConfig>, collaborators: Collaborators, resources: impl Into<PathBuf>) -> Self {
        Self {
            config,
            collaborators,
            resources: resources.into(),
        }
    }

    pub async fn execute(&self) -> Result<(), SetupError> {
        let steps = [
            SetupStep::Local,
            SetupStep::Metadata,
            SetupStep::Warehouse,
            SetupStep::Mirror,
            SetupStep::Hdfs,
        ];
        for step in steps {
            if step == SetupStep::Mirror && !self.config.mirror_enabled {
                info!("Analytics store setup not requested");
                continue;
            }
            let result = match step {
                SetupStep::Local => self.setup_local(),
                SetupStep::Metadata => self.setup_metadata().await,
                SetupStep::Warehouse => self.setup_warehouse().await,
                SetupStep::Mirror => self.setup_mirror().await,
                SetupStep::Hdfs => self.setup_hdfs().await,
            };
            match result {
                Ok(()) => info!(%step, "Setup step complete"),
                Err(source) => {
                    error!(%step, error = %source, "Setup step failed");
                    return Err(SetupError { step, source });
                }
            }
        }
        Ok(())
    }

    fn data(&self, key: &str) -> Result<&str, SetupFailure> {
        Ok(self.config.data().main(key)?)
    }

    fn dataset_file(&self, key: &str) -> Result<PathBuf, SetupFailure> {
        Ok(self.config.paths.dataset_dir.join(self.data(key)?))
    }

    fn setup_local(&self) -> Result<(), SetupFailure> {
        let paths = &self.config.paths;
        for dir in [
            &paths.dataset_dir,
            &paths.workflow_properties_dir,
            &paths.jobinput_properties_dir,
        ] {
            std::fs::create_dir_all(dir).map_err(io_failed(dir))?;
        }

        let mut names = vec![self.data("hive_columns")?, self.data("mapper")?];
        if self.config.mirror_enabled {
            names.push(self.data("vertica_columns")?);
        }
        extract_resources(&self.resources, &names, &paths.dataset_dir)?;

        self.write_schema(
            "hive_columns",
            HIVE_TEMPLATE,
            "hive_ddl",
            &[
                ("@DATABASE", self.config.hive_db.as_str()),
                ("@TABLE", self.config.hive_table.as_str()),
            ],
        )?;

        if self.config.mirror_enabled {
            let settings = self.config.mirror_settings()?;
            let data = self.config.data();
            let clauses = TableClauses::new(
                data.main_opt("vertica_projection_keys"),
                data.main_opt("vertica_segmentation_keys"),
                data.main_opt("vertica_partition_expr"),
            );
            self.write_schema(
                "vertica_columns",
                VERTICA_TEMPLATE,
                "vertica_ddl",
                &[
                    ("@VSCHEMA", settings.schema.as_str()),
                    ("@TABLE", settings.table.as_str()),
                    ("@PROJECTION_CLAUSE", clauses.projection.as_str()),
                    ("@SEGMENTATION_CLAUSE", clauses.segmentation.as_str()),
                    ("@PARTITION_CLAUSE", clauses.partition.as_str()),
                ],
            )?;
        }

        let mapper = self.data("mapper")?;
        let mapper_hdfs = join_path(&join_path(&self.config.workflow.hdfs_resource_path, "script"), mapper);
        self.render(
            WORKFLOW_TEMPLATE,
            &self.config.paths.dataset_dir.join(&self.config.workflow.workflow_xml),
            &[
                ("@MAPPER", mapper),
                ("@HDFS_PATH", mapper_hdfs.as_str()),
                ("@CODEC", self.data("mr_output_codec")?),
            ],
        )?;

        open_permissions(&paths.dataset_dir)?;
        info!(path = %paths.dataset_dir.display(), "Local project tree ready");
        Ok(())
    }

    fn write_schema(
        &self,
        columns_key: &str,
        template: &str,
        ddl_key: &str,
        substitutions: &[(&str, &str)],
    ) -> Result<(), SetupFailure> {
        let columns_file = self.dataset_file(columns_key)?;
        let columns = std::fs::read_to_string(&columns_file).map_err(io_failed(&columns_file))?;
        let mappings = column_mappings(&columns);

        let mut all = substitutions.to_vec();
        all.push(("@COLUMNMAPPINGS", mappings.as_str()));
        self.render(template, &self.dataset_file(ddl_key)?, &all)
    }

    fn render(&self, template: &str, out: &Path, substitutions: &[(&str, &str)]) -> Result<(), SetupFailure> {
        let template_path = self.config.paths.resource_dir.join(template);
        let text = std::fs::read_to_string(&template_path).map_err(io_failed(&template_path))?;
        std::fs::write(out, materialize(&text, substitutions)).map_err(io_failed(out))?;
        debug!(template, out = %out.display(), "Materialized template");
        Ok(())
    }

    async fn setup_metadata(&self) -> Result<(), SetupFailure> {
        let config = &self.config;
        let store = &self.collaborators.store;
        let data = config.data();

        let mirror = config.mirror.as_ref();
        store
            .insert_setup(&SetupRecord {
                dataset_name: config.dataset_name.clone(),
                hive_db: config.hive_db.clone(),
                hive_table: config.hive_table.clone(),
                hive_ddl: self.data("hive_ddl")?.to_string(),
                vertica_db: mirror.map(|m| m.connection.db.clone()),
                vertica_schema: mirror.map(|m| m.schema.clone()),
                vertica_table: mirror.map(|m| m.table.clone()),
                vertica_ddl: data.main_opt("vertica_ddl").map(str::to_string),
                mapper: self.data("mapper")?.to_string(),
            })
            .await?;

        let now = config.scheduler.now();
        store
            .insert_load(&initial_load(config, data.main_opt("hive_last_load_folder"), now))
            .await?;
        store.insert_lock(&config.dataset_name).await?;
        Ok(())
    }

    async fn setup_warehouse(&self) -> Result<(), SetupFailure> {
        let ddl = self.dataset_file("hive_ddl")?;
        self.collaborators.warehouse.run_script(&ddl).await?;
        Ok(())
    }

    async fn setup_mirror(&self) -> Result<(), SetupFailure> {
        let settings = self.config.mirror_settings()?;
        let loader = self.collaborators.mirror_loader()?;
        let ddl = self.dataset_file("vertica_ddl")?;
        loader.run_script(&ddl).await?;

        let roles = self.data("vertica_roles")?;
        loader
            .grant(&Grant::SchemaUsage {
                schema: settings.schema.clone(),
                to: roles.to_string(),
            })
            .await?;
        loader
            .grant(&Grant::SchemaSelect {
                schema: settings.schema.clone(),
                to: roles.to_string(),
            })
            .await?;
        Ok(())
    }

    async fn setup_hdfs(&self) -> Result<(), SetupFailure> {
        let resource_root = &self.config.workflow.hdfs_resource_path;
        let dataset_dir = &self.config.paths.dataset_dir;
        let uploads = [
            ("workflow", dataset_dir.join(&self.config.workflow.workflow_xml)),
            ("script", dataset_dir.join(self.data("mapper")?)),
        ];

        let fs = &self.collaborators.fs;
        for (dir, local) in &uploads {
            let remote = join_path(resource_root, dir);
            fs.make_dir(&remote).await?;
            fs.put(&local.to_string_lossy(), &remote).await?;
        }
        fs.grant_all("rx", resource_root).await?;
        Ok(())
    }
}

/// Load row that seeds the scheduled directory cursor
fn initial_load(config: &RunConfig, last_folder: Option<&str>, now: NaiveDateTime) -> NewLoadRecord {
    let last_load_folder = match last_folder {
        Some(name) if SourceDirectory::parse(name).is_some_and(|d| d.name() == name.trim()) => {
            Some(name.trim().to_string())
        }
        Some(name) => {
            warn!(folder = name, "Ignoring last load folder that is not a source directory name");
            None
        }
        None => None,
    };

    NewLoadRecord {
        load_id: Uuid::new_v4().to_string(),
        dataset_name: config.dataset_name.clone(),
        load_type: LoadType::Scheduled,
        hive_db: config.hive_db.clone(),
        hive_table: config.hive_table.clone(),
        hive_start_ts: now,
        hive_end_ts: now,
        last_load_folder,
        hive_last_partition: String::new(),
        records_processed: 0,
        rows_committed: 0,
    }
}
