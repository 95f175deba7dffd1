//! Monitoring dashboard and alerts for a dataset
//!
//! Every data-config section whose name starts with `alert` defines one
//! saved-search alert over the dataset's run logs. A run of the phase
//! replaces whatever exists: it deletes the dataset's alerts and dashboard,
//! then recreates and shares them.

mod splunk;

pub use splunk::{owner_from_acl, parse_titles, AlertRequest, SplunkClient};

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tidemark_common::template::materialize;
use tidemark_common::ConfigError;
use tracing::info;

use crate::settings::RunConfig;

const QUERY_FILE: &str = "splunk_qry_str.json";
const MESSAGE_FILE: &str = "splunk_message_body.json";
const DASHBOARD_TEMPLATE: &str = "splunk_dashboard_template.xml";
const MESSAGE_PARAM: &str = "action.email.message.alert";

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Splunk request '{operation}' failed: {source}")]
    Http {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("Splunk request '{operation}' for {name} returned {status}: {body}")]
    Status {
        operation: &'static str,
        name: String,
        status: u16,
        body: String,
    },

    #[error("Failed to read monitoring resource {}: {source}", path.display())]
    Resource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid monitoring resource {}: {reason}", path.display())]
    InvalidResource { path: PathBuf, reason: String },

    #[error("Alert section [{section}] is missing '{key}'")]
    IncompleteAlert { section: String, key: &'static str },

    #[error("Alert section [{section}] has type '{kind}' with no entry in {file}")]
    UnknownAlertType {
        section: String,
        kind: String,
        file: &'static str,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Monitoring coordinates of a dataset
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub env: String,
    pub index: String,
    pub url: String,
    pub app: String,
    pub user: String,
    pub password: String,
}

impl MonitorSettings {
    pub fn from_config(config: &RunConfig) -> Result<Self, ConfigError> {
        let data = config.data();
        let env = config.env();
        Ok(Self {
            env: data.main("splunk_env")?.to_string(),
            index: data.main("splunk_index")?.to_string(),
            url: data.main("splunk_url")?.to_string(),
            app: data.main("splunk_app")?.to_string(),
            user: env.main("splunk_user")?.to_string(),
            password: env.main("splunk_passwd")?.to_string(),
        })
    }

    /// Dashboard name, also the prefix of every alert name
    pub fn base_name(&self, dataset: &str) -> String {
        format!("{}_{}", self.env, dataset)
    }
}

/// One `[alert*]` section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertDefinition {
    pub section: String,
    pub kind: String,
    pub time_window: String,
    /// Every other key of the section, passed through to the saved search
    pub params: BTreeMap<String, String>,
}

pub fn alert_definitions(config: &RunConfig) -> Result<Vec<AlertDefinition>, MonitorError> {
    let data = config.data();
    data.sections()
        .filter(|name| name.to_ascii_lowercase().starts_with("alert"))
        .map(|name| -> Result<AlertDefinition, MonitorError> {
            let mut params = data.section(name)?.clone();
            let mut take = |key: &'static str| {
                params.remove(key).ok_or_else(|| MonitorError::IncompleteAlert {
                    section: name.to_string(),
                    key,
                })
            };
            let kind = take("type")?;
            let time_window = take("time_window")?;
            Ok(AlertDefinition {
                section: name.to_string(),
                kind,
                time_window,
                params,
            })
        })
        .collect()
}

pub fn search_string(index: &str, log_dir: &str, time_window: &str, query: &str) -> String {
    format!("index={} source={}/* earliest=-{} {}", index, log_dir, time_window, query)
}

/// Search queries and message bodies per alert type
#[derive(Debug, Clone, Default)]
pub struct AlertTemplates {
    queries: HashMap<String, String>,
    messages: HashMap<String, String>,
}

impl AlertTemplates {
    pub fn load(resource_dir: &Path) -> Result<Self, MonitorError> {
        Ok(Self {
            queries: read_catalog(&resource_dir.join(QUERY_FILE))?,
            messages: read_catalog(&resource_dir.join(MESSAGE_FILE))?,
        })
    }

    pub fn from_maps(queries: HashMap<String, String>, messages: HashMap<String, String>) -> Self {
        Self { queries, messages }
    }

    pub fn request(
        &self,
        alert: &AlertDefinition,
        settings: &MonitorSettings,
        dataset: &str,
        log_dir: &str,
    ) -> Result<AlertRequest, MonitorError> {
        let lookup = |catalog: &HashMap<String, String>, file: &'static str| {
            catalog
                .get(&alert.kind)
                .cloned()
                .ok_or_else(|| MonitorError::UnknownAlertType {
                    section: alert.section.clone(),
                    kind: alert.kind.clone(),
                    file,
                })
        };
        let query = lookup(&self.queries, QUERY_FILE)?;
        let message = lookup(&self.messages, MESSAGE_FILE)?;

        let mut params: Vec<(String, String)> = alert.params.clone().into_iter().collect();
        params.push((MESSAGE_PARAM.to_string(), message));

        Ok(AlertRequest {
            name: format!("{}_{}", settings.base_name(dataset), alert.section),
            search: search_string(&settings.index, log_dir, &alert.time_window, &query),
            params,
        })
    }
}

/// JSON object of alert type to text; array values are concatenated
fn read_catalog(path: &Path) -> Result<HashMap<String, String>, MonitorError> {
    let text = std::fs::read_to_string(path).map_err(|source| MonitorError::Resource {
        path: path.to_path_buf(),
        source,
    })?;
    parse_catalog(&text).map_err(|reason| MonitorError::InvalidResource {
        path: path.to_path_buf(),
        reason,
    })
}

fn parse_catalog(text: &str) -> Result<HashMap<String, String>, String> {
    let value: Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
    let Value::Object(entries) = value else {
        return Err("expected a JSON object".to_string());
    };
    entries
        .into_iter()
        .map(|(kind, value)| -> Result<(String, String), String> {
            let text = match value {
                Value::String(s) => s,
                Value::Array(parts) => parts
                    .iter()
                    .map(|p| p.as_str().ok_or_else(|| format!("non-string part in '{}'", kind)))
                    .collect::<Result<String, String>>()?,
                _ => return Err(format!("entry '{}' is neither a string nor a list of strings", kind)),
            };
            Ok((kind, text))
        })
        .collect()
}

pub struct MonitorOrchestrator {
    config: Arc<RunConfig>,
    settings: MonitorSettings,
    client: SplunkClient,
}

impl MonitorOrchestrator {
    pub fn new(config: Arc<RunConfig>) -> Result<Self, MonitorError> {
        let settings = MonitorSettings::from_config(&config)?;
        let client = SplunkClient::new(&settings.url, &settings.user, &settings.password, &settings.app)?;
        Ok(Self::with_client(config, settings, client))
    }

    pub fn with_client(config: Arc<RunConfig>, settings: MonitorSettings, client: SplunkClient) -> Self {
        Self {
            config,
            settings,
            client,
        }
    }

    pub async fn execute(&self) -> Result<(), MonitorError> {
        let dataset = &self.config.dataset_name;
        let base_name = self.settings.base_name(dataset);
        let log_dir = self.config.paths.log_dir.display().to_string();
        let resource_dir = &self.config.paths.resource_dir;

        let templates = AlertTemplates::load(resource_dir)?;
        let alerts = alert_definitions(&self.config)?
            .iter()
            .map(|alert| templates.request(alert, &self.settings, dataset, &log_dir))
            .collect::<Result<Vec<_>, _>>()?;
        info!(dataset = %dataset, alerts = alerts.len(), "Read alert definitions");

        let existing = self.client.saved_searches(&format!("{}_", base_name)).await?;
        if existing.is_empty() {
            info!(dataset = %dataset, "No alerts to clean up");
        }
        for alert in &existing {
            self.client.delete_alert(alert).await?;
        }
        self.client.delete_dashboard(&base_name).await?;

        let template_path = resource_dir.join(DASHBOARD_TEMPLATE);
        let template = std::fs::read_to_string(&template_path).map_err(|source| MonitorError::Resource {
            path: template_path.clone(),
            source,
        })?;
        let dashboard = materialize(
            &template,
            &[
                ("@DATASETNAME", dataset.as_str()),
                ("@ENV", self.settings.env.as_str()),
                ("@INDEX", self.settings.index.as_str()),
                ("@LOGDIR", log_dir.as_str()),
            ],
        );
        self.client.create_dashboard(&base_name, &dashboard).await?;
        self.client.share_dashboard(&base_name).await?;

        for alert in &alerts {
            self.client.create_alert(alert).await?;
            self.client.share_alert(&alert.name).await?;
        }
        info!(dataset = %dataset, dashboard = %base_name, alerts = alerts.len(), "Monitoring set up");
        Ok(())
    }
}
