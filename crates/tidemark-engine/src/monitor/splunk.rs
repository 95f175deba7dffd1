//! Splunk REST client for dashboards and saved-search alerts
//!
//! Every resource lives under `<base_url>/<owner>/<app>/`. Objects created by
//! this client are owned by the configured user; once shared at app level an
//! object may report `nobody` as its owner, which changes its URL.

use regex::Regex;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::time::Duration;
use tracing::{debug, info};

use super::MonitorError;

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const SHARED_OWNER: &str = "nobody";
const SHARING_LEVEL: &str = "app";

const VIEWS: &str = "data/ui/views";
const SAVED_SEARCHES: &str = "saved/searches";

/// A saved search to create, with its alert parameters as form fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertRequest {
    pub name: String,
    pub search: String,
    pub params: Vec<(String, String)>,
}

pub struct SplunkClient {
    http: Client,
    base_url: String,
    user: String,
    password: String,
    app: String,
}

impl SplunkClient {
    pub fn new(
        base_url: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        app: impl Into<String>,
    ) -> Result<Self, MonitorError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|source| MonitorError::Http {
                operation: "build client",
                source,
            })?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user: user.into(),
            password: password.into(),
            app: app.into(),
        })
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    fn endpoint(&self, owner: &str, path: &str) -> String {
        format!("{}/{}/{}/{}", self.base_url, owner, self.app, path)
    }

    async fn send(&self, operation: &'static str, request: RequestBuilder) -> Result<Response, MonitorError> {
        request
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await
            .map_err(|source| MonitorError::Http { operation, source })
    }

    /// Fail on any non-success status, except 404 when `missing_ok`
    async fn check(
        operation: &'static str,
        name: &str,
        response: Response,
        missing_ok: bool,
    ) -> Result<Option<Response>, MonitorError> {
        let status = response.status();
        if status.is_success() {
            return Ok(Some(response));
        }
        if missing_ok && status == StatusCode::NOT_FOUND {
            debug!(operation, name, "Resource not found");
            return Ok(None);
        }
        Err(MonitorError::Status {
            operation,
            name: name.to_string(),
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        })
    }

    /// Owner segment of the dashboard URL: `nobody` once shared, else the user
    pub async fn dashboard_owner(&self, dashboard: &str) -> Result<String, MonitorError> {
        let url = self.endpoint(&self.user, &format!("{}/{}/acl", VIEWS, dashboard));
        let response = self.send("get dashboard acl", self.http.get(&url)).await?;
        let acl = match Self::check("get dashboard acl", dashboard, response, true).await? {
            Some(response) => response.text().await.map_err(|source| MonitorError::Http {
                operation: "read dashboard acl",
                source,
            })?,
            None => return Ok(self.user.clone()),
        };
        Ok(owner_from_acl(&acl, &self.user))
    }

    /// Returns false when there was no dashboard to delete
    pub async fn delete_dashboard(&self, dashboard: &str) -> Result<bool, MonitorError> {
        let owner = self.dashboard_owner(dashboard).await?;
        let url = self.endpoint(&owner, &format!("{}/{}", VIEWS, dashboard));
        let response = self.send("delete dashboard", self.http.delete(&url)).await?;
        let deleted = Self::check("delete dashboard", dashboard, response, true).await?.is_some();
        if deleted {
            info!(dashboard, "Removed dashboard");
        }
        Ok(deleted)
    }

    pub async fn create_dashboard(&self, dashboard: &str, xml: &str) -> Result<(), MonitorError> {
        let url = self.endpoint(&self.user, VIEWS);
        let form = [("name", dashboard), ("eai:data", xml)];
        let response = self.send("create dashboard", self.http.post(&url).form(&form)).await?;
        Self::check("create dashboard", dashboard, response, false).await?;
        info!(dashboard, "Created dashboard");
        Ok(())
    }

    pub async fn share_dashboard(&self, dashboard: &str) -> Result<(), MonitorError> {
        self.share("share dashboard", &format!("{}/{}/acl", VIEWS, dashboard), dashboard)
            .await
    }

    /// Names of saved searches starting with `prefix`
    pub async fn saved_searches(&self, prefix: &str) -> Result<Vec<String>, MonitorError> {
        let url = self.endpoint(&self.user, SAVED_SEARCHES);
        let request = self
            .http
            .get(&url)
            .query(&[("search", format!("{}*", prefix)), ("count", "0".to_string())]);
        let response = self.send("list saved searches", request).await?;
        let body = match Self::check("list saved searches", prefix, response, true).await? {
            Some(response) => response.text().await.map_err(|source| MonitorError::Http {
                operation: "read saved searches",
                source,
            })?,
            None => return Ok(Vec::new()),
        };
        parse_titles(&body, prefix)
    }

    pub async fn delete_alert(&self, alert: &str) -> Result<bool, MonitorError> {
        let url = self.endpoint(&self.user, &format!("{}/{}", SAVED_SEARCHES, alert));
        let response = self.send("delete alert", self.http.delete(&url)).await?;
        let deleted = Self::check("delete alert", alert, response, true).await?.is_some();
        if deleted {
            info!(alert, "Removed alert");
        }
        Ok(deleted)
    }

    pub async fn create_alert(&self, alert: &AlertRequest) -> Result<(), MonitorError> {
        let url = self.endpoint(&self.user, SAVED_SEARCHES);
        let mut form: Vec<(&str, &str)> = vec![("name", alert.name.as_str()), ("search", alert.search.as_str())];
        form.extend(alert.params.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        let response = self.send("create alert", self.http.post(&url).form(&form)).await?;
        Self::check("create alert", &alert.name, response, false).await?;
        info!(alert = %alert.name, "Created alert");
        Ok(())
    }

    pub async fn share_alert(&self, alert: &str) -> Result<(), MonitorError> {
        self.share("share alert", &format!("{}/{}/acl", SAVED_SEARCHES, alert), alert)
            .await
    }

    async fn share(&self, operation: &'static str, acl_path: &str, name: &str) -> Result<(), MonitorError> {
        let url = self.endpoint(&self.user, acl_path);
        let form = [("sharing", SHARING_LEVEL), ("owner", self.user.as_str())];
        let response = self.send(operation, self.http.post(&url).form(&form)).await?;
        Self::check(operation, name, response, false).await?;
        Ok(())
    }
}

/// `nobody` when the ACL document mentions it, otherwise `user`
pub fn owner_from_acl(acl: &str, user: &str) -> String {
    if acl.contains(SHARED_OWNER) {
        SHARED_OWNER.to_string()
    } else {
        user.to_string()
    }
}

/// Every `<title>` value that starts with `prefix` and is longer than it
pub fn parse_titles(xml: &str, prefix: &str) -> Result<Vec<String>, MonitorError> {
    let pattern = Regex::new(&format!("<title>({}.+?)</title>", regex::escape(prefix)))?;
    Ok(pattern
        .captures_iter(xml)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect())
}
