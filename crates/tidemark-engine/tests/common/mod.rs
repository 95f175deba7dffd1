//! In-memory stand-ins for the external systems
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tidemark_common::config::IniDocument;
use tidemark_engine::catalog::SourceDirectory;
use tidemark_engine::external::{
    BatchJobClient, BatchJobError, CopyMode, Grant, Hdfs, HdfsError, JobCounters, JobId, MirrorError,
    MirrorLoader, ShellError, TerminalState, Warehouse, WarehouseError,
};
use tidemark_engine::metadata::MetadataStore;
use tidemark_engine::partition::Partition;
use tidemark_engine::{Collaborators, RunConfig};

pub const SOURCE_ROOT: &str = "/data/clicks";
pub const TARGET_ROOT: &str = "/warehouse/clicks";
pub const NAMENODE: &str = "http://nn1:50070/webhdfs/v1";

pub fn data_config(mirror: bool) -> String {
    format!(
        "\
dataset_name = clicks
hive_db = events
hive_table = clicks
source_root = {SOURCE_ROOT}
target_root = {TARGET_ROOT}
webhdfs_root = {NAMENODE}
hdfs_root = /user/etl
hdfs_user = etl
folder_processing_delay = 0
mr_chunk_size = hour
vertica_load = {mirror}
vertica_db = analytics
vertica_vsql_path = /opt/vertica/bin/vsql
vertica_krb_svcname = vertica
vertica_krb_host = vertica.example.com
vertica_host = vertica.example.com
vertica_port = 5433
vertica_user = etl
vertica_schema = events
vertica_table = clicks
vertica_rejected_data_table = clicks_rejected
vertica_rollback_key = event_id
jobtracker = jt:8032
namenode = hdfs://nameservice1
workflow_xml = workflow.xml
hdfs_resource_path = /apps/clicks
mr_num_reducers = 4
nfs_dataset_path = /nfs/tidemark/clicks
nfs_resource_path = /nfs/tidemark/clicks/resources
nfs_workflow_properties_path = /nfs/tidemark/clicks/workflow
nfs_jobinput_properties_path = /nfs/tidemark/clicks/jobinput
nfs_log_path = /nfs/tidemark/clicks/logs
"
    )
}

pub const ENV_CONFIG: &str = "\
metadata_url = sqlite::memory:
max_unlock_attempts = 3
";

pub fn run_config(mirror: bool) -> Arc<RunConfig> {
    let data = IniDocument::parse("clicks.cfg", &data_config(mirror)).unwrap();
    let env = IniDocument::parse("env.cfg", ENV_CONFIG).unwrap();
    Arc::new(RunConfig::from_documents(data, env).unwrap())
}

fn shell_failure(command: String) -> ShellError {
    ShellError::NonZeroExit {
        command,
        status: 1,
        stderr: "injected failure".to_string(),
    }
}

/// Directory tree held in memory
#[derive(Default)]
pub struct FakeHdfs {
    dirs: Mutex<BTreeSet<String>>,
    calls: Mutex<Vec<String>>,
    pub primary: Mutex<Option<String>>,
}

impl FakeHdfs {
    pub fn new() -> Arc<Self> {
        let fs = Self::default();
        *fs.primary.lock().unwrap() = Some(NAMENODE.to_string());
        Arc::new(fs)
    }

    pub fn add_dir(&self, path: &str) {
        let mut dirs = self.dirs.lock().unwrap();
        let mut prefix = String::new();
        for part in path.trim_matches('/').split('/') {
            prefix.push('/');
            prefix.push_str(part);
            dirs.insert(prefix.clone());
        }
    }

    /// Remove a tree without recording a call
    pub fn delete(&self, path: &str) {
        let root = path.trim_end_matches('/').to_string();
        let prefix = format!("{}/", root);
        self.dirs
            .lock()
            .unwrap()
            .retain(|d| *d != root && !d.starts_with(&prefix));
    }

    pub fn exists(&self, path: &str) -> bool {
        self.dirs.lock().unwrap().contains(path.trim_end_matches('/'))
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Hdfs for FakeHdfs {
    async fn list(&self, path: &str) -> Result<Vec<String>, HdfsError> {
        let parent = path.trim_end_matches('/');
        let prefix = format!("{}/", parent);
        Ok(self
            .dirs
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.starts_with(&prefix) && !d[prefix.len()..].contains('/'))
            .cloned()
            .collect())
    }

    async fn path_exists(&self, path: &str) -> Result<bool, HdfsError> {
        Ok(self.exists(path))
    }

    async fn make_dir(&self, path: &str) -> Result<(), HdfsError> {
        self.record(format!("mkdir {}", path));
        self.add_dir(path);
        Ok(())
    }

    async fn remove_dir(&self, path: &str) -> Result<(), HdfsError> {
        self.record(format!("rm {}", path));
        self.delete(path);
        Ok(())
    }

    async fn put(&self, local: &str, remote: &str) -> Result<(), HdfsError> {
        self.record(format!("put {} {}", local, remote));
        Ok(())
    }

    async fn decompress(&self, src: &str, dst: &str) -> Result<(), HdfsError> {
        self.record(format!("decompress {} {}", src, dst));
        self.add_dir(dst);
        Ok(())
    }

    async fn grant_all(&self, perms: &str, path: &str) -> Result<(), HdfsError> {
        self.record(format!("chmod {} {}", perms, path));
        Ok(())
    }

    async fn primary_namenode(
        &self,
        _candidates: &[String],
        _probe_path: &str,
        _user: &str,
    ) -> Result<Option<String>, HdfsError> {
        Ok(self.primary.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct FakeWarehouse {
    partitions: Mutex<Vec<String>>,
    calls: Mutex<Vec<String>>,
}

impl FakeWarehouse {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn partitions(&self) -> Vec<String> {
        self.partitions.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Warehouse for FakeWarehouse {
    async fn show_partitions(&self) -> Result<Vec<String>, WarehouseError> {
        Ok(self.partitions())
    }

    async fn add_partition(&self, partition: &Partition, location: &str) -> Result<(), WarehouseError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("add {} {}", partition, location));
        self.partitions.lock().unwrap().push(partition.hive_spec());
        Ok(())
    }

    async fn drop_partition(&self, partition: &Partition) -> Result<(), WarehouseError> {
        self.calls.lock().unwrap().push(format!("drop {}", partition));
        let spec = partition.hive_spec();
        self.partitions.lock().unwrap().retain(|p| *p != spec);
        Ok(())
    }

    async fn run_script(&self, path: &Path) -> Result<(), WarehouseError> {
        self.calls.lock().unwrap().push(format!("script {}", path.display()));
        Ok(())
    }

    async fn drop_table(&self) -> Result<(), WarehouseError> {
        self.calls.lock().unwrap().push("drop table".to_string());
        Ok(())
    }
}

/// Batch job that writes its output directory and reports fixed counters
pub struct FakeJobs {
    fs: Arc<FakeHdfs>,
    pub counters: JobCounters,
    pub outcome: Mutex<TerminalState>,
    pub panic_on_submit: Mutex<bool>,
    submissions: Mutex<Vec<(Vec<String>, String)>>,
}

impl FakeJobs {
    pub fn new(fs: Arc<FakeHdfs>) -> Arc<Self> {
        Arc::new(Self {
            fs,
            counters: JobCounters {
                map_input_records: 100,
                map_output_records: 95,
                reduce_input_records: 95,
                reduce_output_records: 95,
                skipped: 5,
            },
            outcome: Mutex::new(TerminalState::Succeeded),
            panic_on_submit: Mutex::new(false),
            submissions: Mutex::new(Vec::new()),
        })
    }

    /// `(input directory names, output path)` per submitted job
    pub fn submissions(&self) -> Vec<(Vec<String>, String)> {
        self.submissions.lock().unwrap().clone()
    }
}

#[async_trait]
impl BatchJobClient for FakeJobs {
    async fn submit(&self, input_dirs: &[SourceDirectory], output_path: &str) -> Result<JobId, BatchJobError> {
        if *self.panic_on_submit.lock().unwrap() {
            panic!("batch client crashed");
        }
        let names = input_dirs.iter().map(|d| d.name().to_string()).collect();
        let mut submissions = self.submissions.lock().unwrap();
        submissions.push((names, output_path.to_string()));
        self.fs.add_dir(output_path);
        Ok(JobId::new(format!("{:07}-oozie-W", submissions.len())))
    }

    async fn await_terminal(&self, _job: &JobId, _poll_interval: Duration) -> Result<TerminalState, BatchJobError> {
        Ok(self.outcome.lock().unwrap().clone())
    }

    async fn counters(&self, _job: &JobId) -> Result<JobCounters, BatchJobError> {
        Ok(self.counters)
    }
}

/// A single failure injected into the `nth` call (1-based) of one kind
struct InjectedFailure {
    kind: String,
    nth: usize,
}

pub struct FakeMirror {
    pub rows_per_copy: u64,
    pub fail_direct: Mutex<bool>,
    failures: Mutex<Vec<InjectedFailure>>,
    calls: Mutex<Vec<String>>,
}

impl FakeMirror {
    pub fn new(rows_per_copy: u64) -> Arc<Self> {
        Arc::new(Self {
            rows_per_copy,
            fail_direct: Mutex::new(false),
            failures: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Fail the `nth` call of `kind` (`copy`, `rollback`, `truncate`, ...),
    /// counted over the fake's lifetime. The failure fires once.
    pub fn fail_call(&self, kind: &str, nth: usize) {
        self.failures.lock().unwrap().push(InjectedFailure {
            kind: kind.to_string(),
            nth,
        });
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls whose log line starts with `kind`
    pub fn calls_of(&self, kind: &str) -> Vec<String> {
        let prefix = format!("{} ", kind);
        self.calls().into_iter().filter(|c| c.starts_with(&prefix)).collect()
    }

    fn record(&self, call: String) -> Result<(), MirrorError> {
        self.calls.lock().unwrap().push(call.clone());

        let mut failures = self.failures.lock().unwrap();
        let fired = failures
            .iter()
            .position(|f| call.starts_with(&format!("{} ", f.kind)) && self.calls_of(&f.kind).len() == f.nth);
        match fired {
            Some(idx) => {
                failures.remove(idx);
                Err(MirrorError::Command {
                    operation: "vsql",
                    source: shell_failure(call),
                })
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MirrorLoader for FakeMirror {
    async fn copy(
        &self,
        _primary_node: &str,
        source_path: &str,
        schema: &str,
        table: &str,
        _reject_table: &str,
        mode: CopyMode,
    ) -> Result<u64, MirrorError> {
        self.record(format!("copy {} {}.{} {}", source_path, schema, table, mode))?;
        if mode == CopyMode::Direct && *self.fail_direct.lock().unwrap() {
            return Err(MirrorError::Command {
                operation: "copy",
                source: shell_failure("vsql copy".to_string()),
            });
        }
        Ok(self.rows_per_copy)
    }

    async fn clone_schema(
        &self,
        src_schema: &str,
        src_table: &str,
        dst_schema: &str,
        dst_table: &str,
    ) -> Result<(), MirrorError> {
        self.record(format!("clone {}.{} {}.{}", src_schema, src_table, dst_schema, dst_table))?;
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
        self.record(format!("rollback {}.{} {}.{} {}", schema, table, rb_schema, rb_table, key))?;
        Ok(self.rows_per_copy)
    }

    async fn truncate(&self, schema: &str, table: &str) -> Result<(), MirrorError> {
        self.record(format!("truncate {}.{}", schema, table))?;
        Ok(())
    }

    async fn drop_table(&self, schema: &str, table: &str) -> Result<(), MirrorError> {
        self.record(format!("drop {}.{}", schema, table))?;
        Ok(())
    }

    async fn run_script(&self, path: &Path) -> Result<(), MirrorError> {
        self.record(format!("script {}", path.display()))?;
        Ok(())
    }

    async fn grant(&self, grant: &Grant) -> Result<(), MirrorError> {
        self.record(format!("grant {:?}", grant))?;
        Ok(())
    }
}

/// Every fake plus the collaborators wired from them
pub struct Harness {
    pub fs: Arc<FakeHdfs>,
    pub warehouse: Arc<FakeWarehouse>,
    pub jobs: Arc<FakeJobs>,
    pub mirror: Arc<FakeMirror>,
    pub collaborators: Collaborators,
}

impl Harness {
    /// Fresh in-memory store with the dataset's lock row
    pub async fn new() -> Self {
        let fs = FakeHdfs::new();
        let warehouse = FakeWarehouse::new();
        let jobs = FakeJobs::new(fs.clone());
        let mirror = FakeMirror::new(95);
        let store = MetadataStore::connect("sqlite::memory:").await.unwrap();
        store.insert_lock("clicks").await.unwrap();

        let collaborators = Collaborators {
            fs: fs.clone(),
            warehouse: warehouse.clone(),
            jobs: jobs.clone(),
            mirror: Some(mirror.clone()),
            store,
        };
        Self {
            fs,
            warehouse,
            jobs,
            mirror,
            collaborators,
        }
    }

    pub fn add_source_dirs(&self, names: &[&str]) {
        for name in names {
            self.fs.add_dir(&format!("{}/{}", SOURCE_ROOT, name));
        }
    }
}
