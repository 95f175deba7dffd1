//! Batch job submission and tracking through the `oozie` CLI
//!
//! A load chunk runs as one workflow job. The client renders the job
//! properties from the dataset's template, launches the job, polls it to a
//! terminal state, and reads the record counters of its parse step.

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tidemark_common::template;
use tracing::{error, info};

use super::shell::{CommandRunner, ShellError};
use crate::catalog::SourceDirectory;

/// Workflow action that reports record counters
const COUNTER_ACTION: &str = "parse-json";
const TASK_COUNTER_GROUP: &str = "org.apache.hadoop.mapreduce.TaskCounter";
const PROPERTIES_TEMPLATE: &str = "workflow_template.properties";

#[derive(Error, Debug)]
pub enum BatchJobError {
    #[error("Oozie {operation} failed: {source}")]
    Command {
        operation: &'static str,
        #[source]
        source: ShellError,
    },

    #[error("Failed to render job properties {}: {source}", path.display())]
    Properties {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unexpected {what} output: {output}")]
    MalformedOutput { what: &'static str, output: String },

    #[error("Invalid output pattern: {0}")]
    Pattern(#[from] regex::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalState {
    Succeeded,
    Failed { step: String, status: String },
}

/// Record counters of a finished job; absent counters are zero
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounters {
    pub map_input_records: u64,
    pub map_output_records: u64,
    pub reduce_input_records: u64,
    pub reduce_output_records: u64,
    pub skipped: u64,
}

impl JobCounters {
    /// Input records minus the ones the mapper skipped, never below zero
    pub fn records_processed(&self) -> u64 {
        self.map_input_records.saturating_sub(self.skipped)
    }
}

#[async_trait]
pub trait BatchJobClient: Send + Sync {
    async fn submit(&self, input_dirs: &[SourceDirectory], output_path: &str) -> Result<JobId, BatchJobError>;

    /// Poll while the job is `PREP` or `RUNNING`, sleeping `poll_interval`
    /// between polls. Only `SUCCEEDED` with no failed step is a success.
    async fn await_terminal(&self, job: &JobId, poll_interval: Duration) -> Result<TerminalState, BatchJobError>;

    async fn counters(&self, job: &JobId) -> Result<JobCounters, BatchJobError>;
}

/// Values substituted into the job properties template
#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub jobtracker: String,
    pub namenode: String,
    /// HDFS path of the workflow definition
    pub workflow_xml: String,
    pub num_reducers: String,
    pub source_root: String,
    /// Local directory holding `workflow_template.properties`
    pub resource_dir: PathBuf,
    /// Local directory receiving the rendered properties files
    pub properties_dir: PathBuf,
    /// Counter group carrying the mapper's `SKIPPED` counter
    pub skipped_counter_group: String,
}

pub struct OozieClient {
    runner: Arc<dyn CommandRunner>,
    settings: WorkflowSettings,
}

impl OozieClient {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: WorkflowSettings) -> Self {
        Self { runner, settings }
    }

    /// Render the job properties file for `input_dirs` and return its path
    pub fn write_properties(
        &self,
        input_dirs: &[SourceDirectory],
        output_path: &str,
        now: NaiveDateTime,
    ) -> Result<PathBuf, BatchJobError> {
        let settings = &self.settings;
        let input_files = input_files(&settings.source_root, input_dirs);
        let path = settings
            .properties_dir
            .join(format!("workflow_{}.properties", now.format("%Y%m%d-%H")));

        template::materialize_file(
            &settings.resource_dir.join(PROPERTIES_TEMPLATE),
            &[
                ("@JOBTRACKER", settings.jobtracker.as_str()),
                ("@WORKFLOWXML", settings.workflow_xml.as_str()),
                ("@NAMENODE", settings.namenode.as_str()),
                ("@INPUTFILES", input_files.as_str()),
                ("@OUTPUTDIR", output_path),
                ("@NUM_REDUCERS", settings.num_reducers.as_str()),
            ],
            &path,
        )
        .map_err(|source| BatchJobError::Properties {
            path: path.clone(),
            source,
        })?;

        Ok(path)
    }

    async fn query(&self, operation: &'static str, command: String) -> Result<String, BatchJobError> {
        self.runner
            .run_checked(&command)
            .await
            .map(|output| output.stdout)
            .map_err(|source| BatchJobError::Command { operation, source })
    }

    async fn log_trace(&self, job: &JobId) -> Result<String, BatchJobError> {
        self.query("log", format!("oozie job -log {}", job)).await
    }
}

#[async_trait]
impl BatchJobClient for OozieClient {
    async fn submit(&self, input_dirs: &[SourceDirectory], output_path: &str) -> Result<JobId, BatchJobError> {
        let properties = self.write_properties(input_dirs, output_path, Local::now().naive_local())?;
        let stdout = self
            .query("launch", format!("oozie job -config {} -run", properties.display()))
            .await?;

        let job = parse_job_id(&stdout)?;
        info!(job = %job, dirs = input_dirs.len(), output = output_path, "Launched batch job");
        Ok(job)
    }

    async fn await_terminal(&self, job: &JobId, poll_interval: Duration) -> Result<TerminalState, BatchJobError> {
        let state = loop {
            let stdout = self.query("info", format!("oozie job -info {}", job)).await?;
            let status = parse_status(job, &stdout)?;
            info!(job = %job, overall = %status.overall, steps = ?status.steps, "Polled batch job");

            match status.terminal_state() {
                Some(state) => break state,
                None => tokio::time::sleep(poll_interval).await,
            }
        };

        if let TerminalState::Failed { step, status } = &state {
            error!(job = %job, step = %step, status = %status, "Batch job failed");
            let trace = self.log_trace(job).await?;
            info!(job = %job, log_trace = %trace, "Batch job log trace");
        }
        Ok(state)
    }

    async fn counters(&self, job: &JobId) -> Result<JobCounters, BatchJobError> {
        let stdout = self
            .query("counters", format!("oozie job -info {}@{} -verbose", job, COUNTER_ACTION))
            .await?;
        let counters = parse_counters(&stdout, &self.settings.skipped_counter_group)?;
        info!(job = %job, counters = ?counters, "Fetched batch job counters");
        Ok(counters)
    }
}

/// `root/{d1\\,d2}` glob handed to the workflow as its input paths
pub fn input_files(source_root: &str, dirs: &[SourceDirectory]) -> String {
    let names: Vec<&str> = dirs.iter().map(SourceDirectory::name).collect();
    format!("{}/{{{}}}", source_root.trim_end_matches('/'), names.join("\\\\,"))
}

/// Job id from `job: <id>` launch output
pub fn parse_job_id(output: &str) -> Result<JobId, BatchJobError> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("job:"))
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(JobId::new)
        .ok_or_else(|| BatchJobError::MalformedOutput {
            what: "oozie job -run",
            output: output.to_string(),
        })
}

/// Overall and per-step status of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub overall: String,
    pub steps: BTreeMap<String, String>,
}

impl JobStatus {
    /// First step that reports a failure
    pub fn failure(&self) -> Option<(&str, &str)> {
        let failed = |status: &str| {
            let status = status.to_uppercase();
            status.contains("FAIL") || status.contains("ERROR") || status.contains("KILLED")
        };

        self.steps
            .iter()
            .map(|(step, status)| (step.as_str(), status.as_str()))
            .find(|(_, status)| failed(status))
    }

    /// Outcome once the job has settled, `None` while it is queued or running
    pub fn terminal_state(&self) -> Option<TerminalState> {
        let overall = self.overall.to_uppercase();
        if overall == "PREP" || overall == "RUNNING" {
            return None;
        }

        let state = match (overall.as_str(), self.failure()) {
            ("SUCCEEDED", None) => TerminalState::Succeeded,
            (_, Some((step, status))) => TerminalState::Failed {
                step: step.to_string(),
                status: status.to_string(),
            },
            // KILLED, FAILED, SUSPENDED and anything unknown
            (_, None) => TerminalState::Failed {
                step: "overall".to_string(),
                status: self.overall.clone(),
            },
        };
        Some(state)
    }
}

/// Parse `oozie job -info` output
pub fn parse_status(job: &JobId, output: &str) -> Result<JobStatus, BatchJobError> {
    let status_pattern = Regex::new(r"Status\s*:\s*(\w+)")?;
    let overall = status_pattern
        .captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| BatchJobError::MalformedOutput {
            what: "oozie job -info status",
            output: output.to_string(),
        })?;

    let step_prefix = format!("{}@", job);
    let mut steps = BTreeMap::new();
    for line in output.lines() {
        let Some(idx) = line.find(&step_prefix) else {
            continue;
        };
        let fields: Vec<&str> = line[idx + step_prefix.len()..].split_whitespace().collect();
        let [step, status, ..] = fields.as_slice() else {
            return Err(BatchJobError::MalformedOutput {
                what: "oozie job -info step",
                output: line.to_string(),
            });
        };
        steps.insert((*step).to_string(), (*status).to_string());
    }

    Ok(JobStatus { overall, steps })
}

/// Parse the counter JSON printed by `oozie job -info <id>@<action> -verbose`
pub fn parse_counters(output: &str, skipped_group: &str) -> Result<JobCounters, BatchJobError> {
    let malformed = || BatchJobError::MalformedOutput {
        what: "oozie counters",
        output: output.to_string(),
    };

    let object_pattern = Regex::new(r"\{.*\}")?;
    let json = object_pattern.find(output).ok_or_else(malformed)?;
    let counters: Value = serde_json::from_str(json.as_str()).map_err(|_| malformed())?;

    let read = |group: &str, name: &str| -> Result<u64, BatchJobError> {
        match counters.get(group).and_then(|g| g.get(name)) {
            None | Some(Value::Null) => Ok(0),
            Some(Value::Number(n)) => n.as_u64().ok_or_else(malformed),
            Some(Value::String(s)) => s.trim().parse().map_err(|_| malformed()),
            Some(_) => Err(malformed()),
        }
    };

    Ok(JobCounters {
        map_input_records: read(TASK_COUNTER_GROUP, "MAP_INPUT_RECORDS")?,
        map_output_records: read(TASK_COUNTER_GROUP, "MAP_OUTPUT_RECORDS")?,
        reduce_input_records: read(TASK_COUNTER_GROUP, "REDUCE_INPUT_RECORDS")?,
        reduce_output_records: read(TASK_COUNTER_GROUP, "REDUCE_OUTPUT_RECORDS")?,
        skipped: read(skipped_group, "SKIPPED")?,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::external::shell::scripted::ScriptedRunner;
    use crate::external::shell::CommandOutput;
    use chrono::NaiveDate;

    const JOB: &str = "0000042-160819120000000-oozie-oozi-W";

    fn info_output(overall: &str, step_status: &str) -> String {
        format!(
            "Job ID : {job}\n\
             Workflow Name : clicks-load\n\
             Status        : {overall}\n\
             ------------------------------------------------------------\n\
             ID                                              Status    Ext ID\n\
             {job}@:start:          OK        -\n\
             {job}@parse-json       {step}    job_1471608000000_0042\n",
            job = JOB,
            overall = overall,
            step = step_status
        )
    }

    fn dirs(names: &[&str]) -> Vec<SourceDirectory> {
        names.iter().map(|n| SourceDirectory::parse(n).unwrap()).collect()
    }

    fn settings(resource_dir: PathBuf, properties_dir: PathBuf) -> WorkflowSettings {
        WorkflowSettings {
            jobtracker: "jt:8032".to_string(),
            namenode: "hdfs://nn".to_string(),
            workflow_xml: "/apps/clicks/workflow/workflow.xml".to_string(),
            num_reducers: "4".to_string(),
            source_root: "/data/clicks".to_string(),
            resource_dir,
            properties_dir,
            skipped_counter_group: "THRIVE".to_string(),
        }
    }

    #[test]
    fn test_input_files_escapes_separators() {
        let input = input_files("/data/clicks/", &dirs(&["d_20160819-1400", "d_20160819-1410"]));
        assert_eq!(input, r"/data/clicks/{d_20160819-1400\\,d_20160819-1410}");
    }

    #[test]
    fn test_parse_job_id() {
        assert_eq!(parse_job_id(&format!("job: {}\n", JOB)).unwrap().as_str(), JOB);
        assert!(parse_job_id("Error: E0501").is_err());
    }

    #[test]
    fn test_parse_status() {
        let status = parse_status(&JobId::new(JOB), &info_output("SUCCEEDED", "OK")).unwrap();
        assert_eq!(status.overall, "SUCCEEDED");
        assert_eq!(status.steps.get("parse-json").map(String::as_str), Some("OK"));
        assert_eq!(status.steps.get(":start:").map(String::as_str), Some("OK"));
        assert_eq!(status.failure(), None);
    }

    #[test]
    fn test_parse_status_detects_failed_step() {
        let status = parse_status(&JobId::new(JOB), &info_output("KILLED", "ERROR")).unwrap();
        assert_eq!(status.failure(), Some(("parse-json", "ERROR")));
    }

    fn terminal(overall: &str, step_status: &str) -> Option<TerminalState> {
        parse_status(&JobId::new(JOB), &info_output(overall, step_status))
            .unwrap()
            .terminal_state()
    }

    fn failed(step: &str, status: &str) -> Option<TerminalState> {
        Some(TerminalState::Failed {
            step: step.to_string(),
            status: status.to_string(),
        })
    }

    #[test]
    fn test_terminal_state_keeps_polling_while_queued_or_running() {
        assert_eq!(terminal("PREP", "PREP"), None);
        assert_eq!(terminal("RUNNING", "RUNNING"), None);
        // A failed step does not end the poll while the job still runs
        assert_eq!(terminal("RUNNING", "ERROR"), None);
    }

    #[test]
    fn test_terminal_state_succeeded() {
        assert_eq!(terminal("SUCCEEDED", "OK"), Some(TerminalState::Succeeded));
    }

    #[test]
    fn test_terminal_state_succeeded_with_failed_step() {
        assert_eq!(terminal("SUCCEEDED", "FAILED"), failed("parse-json", "FAILED"));
    }

    #[test]
    fn test_terminal_state_killed() {
        assert_eq!(terminal("KILLED", "OK"), failed("overall", "KILLED"));
        assert_eq!(terminal("KILLED", "KILLED"), failed("parse-json", "KILLED"));
    }

    #[test]
    fn test_terminal_state_failed() {
        assert_eq!(terminal("FAILED", "OK"), failed("overall", "FAILED"));
    }

    #[test]
    fn test_terminal_state_suspended() {
        assert_eq!(terminal("SUSPENDED", "OK"), failed("overall", "SUSPENDED"));
    }

    #[test]
    fn test_parse_status_rejects_missing_status() {
        let err = parse_status(&JobId::new(JOB), "Error: E0604 job does not exist").unwrap_err();
        assert!(matches!(err, BatchJobError::MalformedOutput { .. }));
    }

    #[test]
    fn test_parse_counters_accepts_strings_and_numbers() {
        let output = r#"Name : parse-json
External Stats : {"org.apache.hadoop.mapreduce.TaskCounter":{"MAP_INPUT_RECORDS":"1200","MAP_OUTPUT_RECORDS":1150},"THRIVE":{"SKIPPED":"50"}}
"#;
        let counters = parse_counters(output, "THRIVE").unwrap();
        assert_eq!(counters.map_input_records, 1200);
        assert_eq!(counters.map_output_records, 1150);
        assert_eq!(counters.reduce_output_records, 0);
        assert_eq!(counters.skipped, 50);
        assert_eq!(counters.records_processed(), 1150);
    }

    #[test]
    fn test_records_processed_saturates() {
        let counters = JobCounters {
            map_input_records: 10,
            skipped: 20,
            ..Default::default()
        };
        assert_eq!(counters.records_processed(), 0);
    }

    #[test]
    fn test_parse_counters_without_json() {
        assert!(parse_counters("Name : parse-json", "THRIVE").is_err());
    }

    #[test]
    fn test_write_properties() {
        let resources = tempfile::tempdir().unwrap();
        let properties = tempfile::tempdir().unwrap();
        std::fs::write(
            resources.path().join(PROPERTIES_TEMPLATE),
            "jobTracker=@JOBTRACKER\nnameNode=@NAMENODE\napp=@WORKFLOWXML\ninput=@INPUTFILES\noutput=@OUTPUTDIR\nreducers=@NUM_REDUCERS\n",
        )
        .unwrap();

        let client = OozieClient::new(
            Arc::new(ScriptedRunner::new()),
            settings(resources.path().to_path_buf(), properties.path().to_path_buf()),
        );
        let now = NaiveDate::from_ymd_opt(2016, 8, 19).unwrap().and_hms_opt(14, 30, 0).unwrap();
        let path = client
            .write_properties(&dirs(&["d_20160819-1400"]), "/warehouse/clicks/2016/08/19/14/0", now)
            .unwrap();

        assert_eq!(path.file_name().unwrap(), "workflow_20160819-14.properties");
        let rendered = std::fs::read_to_string(path).unwrap();
        assert!(rendered.contains("jobTracker=jt:8032\n"));
        assert!(rendered.contains("app=/apps/clicks/workflow/workflow.xml\n"));
        assert!(rendered.contains("input=/data/clicks/{d_20160819-1400}\n"));
        assert!(rendered.contains("output=/warehouse/clicks/2016/08/19/14/0\n"));
        assert!(rendered.contains("reducers=4\n"));
    }

    #[tokio::test]
    async fn test_await_terminal_polls_until_done() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("oozie job -info", CommandOutput::ok(info_output("PREP", "PREP")))
                .on("oozie job -info", CommandOutput::ok(info_output("RUNNING", "RUNNING")))
                .on("oozie job -info", CommandOutput::ok(info_output("SUCCEEDED", "OK"))),
        );
        let client = OozieClient::new(runner.clone(), settings(PathBuf::new(), PathBuf::new()));

        let state = client.await_terminal(&JobId::new(JOB), Duration::ZERO).await.unwrap();
        assert_eq!(state, TerminalState::Succeeded);
        assert_eq!(runner.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_await_terminal_reports_failure_and_fetches_log() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("oozie job -info", CommandOutput::ok(info_output("KILLED", "ERROR")))
                .on("oozie job -log", CommandOutput::ok("java.lang.RuntimeException")),
        );
        let client = OozieClient::new(runner.clone(), settings(PathBuf::new(), PathBuf::new()));

        let state = client.await_terminal(&JobId::new(JOB), Duration::ZERO).await.unwrap();
        assert_eq!(
            state,
            TerminalState::Failed {
                step: "parse-json".to_string(),
                status: "ERROR".to_string()
            }
        );
        assert!(runner.calls()[1].starts_with("oozie job -log"));
    }

    #[tokio::test]
    async fn test_await_terminal_treats_suspended_as_failure() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("oozie job -info", CommandOutput::ok(info_output("SUSPENDED", "OK")))
                .on("oozie job -log", CommandOutput::ok("suspended by operator")),
        );
        let client = OozieClient::new(runner.clone(), settings(PathBuf::new(), PathBuf::new()));

        let state = client.await_terminal(&JobId::new(JOB), Duration::ZERO).await.unwrap();
        assert_eq!(Some(state), failed("overall", "SUSPENDED"));
        assert_eq!(runner.calls().len(), 2);
    }
}
