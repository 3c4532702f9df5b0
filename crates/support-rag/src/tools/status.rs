use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use super::{SupportTool, ToolKind, ToolOutput};

const API_BASE: &str = "https://api.stripe.com/v1";
const CACHE_TTL: Duration = Duration::from_secs(5 * 60);

const COMPONENTS: &[(&str, &str)] = &[
    ("API", "/charges"),
    ("Webhooks", "/webhook_endpoints"),
    ("Payments", "/payment_methods?type=card"),
    ("Customers", "/customers"),
    ("Products", "/products"),
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComponentStatus {
    pub name: String,
    pub operational: bool,
    pub http_status: Option<u16>,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub overall: String,
    pub components: Vec<ComponentStatus>,
    pub checked_at: chrono::DateTime<chrono::Utc>,
}

impl StatusReport {
    fn from_components(components: Vec<ComponentStatus>) -> Self {
        let up = components.iter().filter(|c| c.operational).count();
        let overall = if up == components.len() {
            "operational"
        } else if up == 0 {
            "major_outage"
        } else {
            "partial_outage"
        };
        Self {
            overall: overall.to_string(),
            components,
            checked_at: chrono::Utc::now(),
        }
    }

    fn summary(&self) -> String {
        let degraded: Vec<&str> = self
            .components
            .iter()
            .filter(|c| !c.operational)
            .map(|c| c.name.as_str())
            .collect();
        match self.overall.as_str() {
            "operational" => format!(
                "All {} monitored API components are operational.",
                self.components.len()
            ),
            _ => format!(
                "API status: {}. Affected components: {}.",
                self.overall.replace('_', " "),
                degraded.join(", ")
            ),
        }
    }
}

/// Probes payment API endpoints with the account's secret key.
pub struct StatusCheckerTool {
    client: reqwest::Client,
    api_key: Option<String>,
    cache: Mutex<Option<(Instant, StatusReport)>>,
}

impl StatusCheckerTool {
    pub fn new(client: reqwest::Client, api_key: Option<String>) -> Self {
        Self {
            client,
            api_key,
            cache: Mutex::new(None),
        }
    }

    pub fn from_env(client: reqwest::Client) -> Self {
        let api_key = std::env::var("STRIPE_SECRET_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty());
        Self::new(client, api_key)
    }

    fn cached(&self) -> Option<StatusReport> {
        let cache = self.cache.lock();
        cache
            .as_ref()
            .filter(|(at, _)| at.elapsed() < CACHE_TTL)
            .map(|(_, report)| report.clone())
    }

    async fn check_component(&self, api_key: &str, name: &str, path: &str) -> ComponentStatus {
        let started = Instant::now();
        let response = self
            .client
            .get(format!("{}{}", API_BASE, path))
            .basic_auth(api_key, Some(""))
            .query(&[("limit", "1")])
            .timeout(Duration::from_secs(10))
            .send()
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match response {
            Ok(resp) => {
                let status = resp.status();
                ComponentStatus {
                    name: name.to_string(),
                    operational: !status.is_server_error(),
                    http_status: Some(status.as_u16()),
                    latency_ms,
                }
            }
            Err(e) => {
                tracing::warn!(component = name, error = %e, "Status check failed");
                ComponentStatus {
                    name: name.to_string(),
                    operational: false,
                    http_status: None,
                    latency_ms,
                }
            }
        }
    }

    async fn fetch(&self, api_key: &str) -> StatusReport {
        let checks = COMPONENTS.iter().map(|(name, path)| self.check_component(api_key, name, path));
        let components = futures::future::join_all(checks).await;
        StatusReport::from_components(components)
    }
}

#[async_trait]
impl SupportTool for StatusCheckerTool {
    fn name(&self) -> &str {
        ToolKind::StatusChecker.id()
    }

    fn description(&self) -> &str {
        ToolKind::StatusChecker.description()
    }

    fn should_use(&self, query: &str) -> bool {
        ToolKind::StatusChecker.matches(query)
    }

    async fn execute(&self, _query: &str) -> Result<ToolOutput> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Ok(ToolOutput::failure("STRIPE_SECRET_KEY is not set"));
        };

        let report = match self.cached() {
            Some(report) => report,
            None => {
                let report = self.fetch(api_key).await;
                *self.cache.lock() = Some((Instant::now(), report.clone()));
                report
            }
        };

        let answered = report.components.iter().filter(|c| c.http_status.is_some()).count();
        let confidence = if answered == report.components.len() { 0.9 } else { 0.7 };
        Ok(ToolOutput::success(
            confidence,
            report.summary(),
            serde_json::to_value(&report)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn component(name: &str, operational: bool) -> ComponentStatus {
        ComponentStatus {
            name: name.into(),
            operational,
            http_status: Some(if operational { 200 } else { 503 }),
            latency_ms: 10,
        }
    }

    #[test]
    fn test_overall_status() {
        let report = StatusReport::from_components(vec![component("API", true), component("Webhooks", true)]);
        assert_eq!(report.overall, "operational");

        let report = StatusReport::from_components(vec![component("API", true), component("Webhooks", false)]);
        assert_eq!(report.overall, "partial_outage");
        assert!(report.summary().contains("Webhooks"));

        let report = StatusReport::from_components(vec![component("API", false)]);
        assert_eq!(report.overall, "major_outage");
    }

    #[tokio::test]
    async fn test_missing_key_is_handled_miss() {
        let tool = StatusCheckerTool::new(reqwest::Client::new(), None);
        let out = tool.execute("is the api down?").await.unwrap();
        assert!(!out.success);
        assert!(out.error.unwrap().contains("STRIPE_SECRET_KEY"));
    }
}
