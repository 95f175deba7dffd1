//! Wiring of the external systems a phase talks to

use std::sync::Arc;
use tidemark_common::ConfigError;

use crate::external::{
    BatchJobClient, CommandRunner, HadoopFs, Hdfs, HiveCli, MirrorLoader, OozieClient, PartitionRegistry,
    VerticaCli, Warehouse,
};
use crate::metadata::{MetadataError, MetadataStore};
use crate::settings::RunConfig;

/// Trait objects for every external system, plus the metadata store
#[derive(Clone)]
pub struct Collaborators {
    pub fs: Arc<dyn Hdfs>,
    pub warehouse: Arc<dyn Warehouse>,
    pub jobs: Arc<dyn BatchJobClient>,
    pub mirror: Option<Arc<dyn MirrorLoader>>,
    pub store: MetadataStore,
}

impl Collaborators {
    /// Production wiring: vendor CLIs through `runner`, metadata at `metadata_url`
    pub async fn connect(config: &RunConfig, runner: Arc<dyn CommandRunner>) -> Result<Self, MetadataError> {
        let store = MetadataStore::connect(&config.metadata_url).await?;

        let mirror = config.mirror.as_ref().map(|settings| {
            Arc::new(VerticaCli::new(runner.clone(), settings.connection.clone())) as Arc<dyn MirrorLoader>
        });

        Ok(Self {
            fs: Arc::new(HadoopFs::new(runner.clone())),
            warehouse: Arc::new(HiveCli::new(runner.clone(), &config.hive_db, &config.hive_table)),
            jobs: Arc::new(OozieClient::new(runner, config.workflow_settings())),
            mirror,
            store,
        })
    }

    pub fn registry(&self) -> PartitionRegistry {
        PartitionRegistry::new(self.fs.clone(), self.warehouse.clone())
    }

    /// Analytics store client, required by phases that mirror
    pub fn mirror_loader(&self) -> Result<Arc<dyn MirrorLoader>, ConfigError> {
        self.mirror.clone().ok_or_else(|| ConfigError::MissingKey {
            section: tidemark_common::config::MAIN_SECTION.to_string(),
            key: "vertica_db".to_string(),
        })
    }
}
