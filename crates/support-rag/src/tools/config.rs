//! Persisted tool enablement.
//!
//! The configuration is read far more often than it changes. Readers take an
//! `Arc` snapshot and keep it for the whole request. Writers build a new
//! document, persist it, then swap the snapshot in one step.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;

use super::ToolKind;
use crate::error::{SupportError, SupportResult};

const CONFIG_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub enabled: bool,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Environment variables the tool needs.
    #[serde(rename = "apiKeys", default)]
    pub api_keys: Vec<String>,
}

impl ToolDescriptor {
    fn for_kind(kind: ToolKind) -> Self {
        Self {
            enabled: true,
            name: kind.display_name().to_string(),
            description: kind.description().to_string(),
            dependencies: kind.dependencies().iter().map(|d| d.to_string()).collect(),
            api_keys: kind.required_secrets().iter().map(|k| k.to_string()).collect(),
        }
    }

    pub fn missing_secrets(&self, is_set: impl Fn(&str) -> bool) -> Vec<String> {
        self.api_keys.iter().filter(|k| !is_set(k.as_str())).cloned().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolConfigFile {
    pub tools: BTreeMap<String, ToolDescriptor>,
    #[serde(rename = "lastUpdated")]
    pub last_updated: DateTime<Utc>,
    pub version: String,
}

impl Default for ToolConfigFile {
    fn default() -> Self {
        Self {
            tools: ToolKind::ALL
                .into_iter()
                .map(|k| (k.id().to_string(), ToolDescriptor::for_kind(k)))
                .collect(),
            last_updated: Utc::now(),
            version: CONFIG_VERSION.to_string(),
        }
    }
}

impl ToolConfigFile {
    pub fn enabled_tools(&self) -> Vec<String> {
        self.tools
            .iter()
            .filter(|(_, t)| t.enabled)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Enabled tools whose declared secrets are all present.
    pub fn available_tools(&self, is_set: impl Fn(&str) -> bool) -> Vec<String> {
        self.tools
            .iter()
            .filter(|(_, t)| t.enabled && t.missing_secrets(&is_set).is_empty())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Adds shipped tools missing from an older file. Returns whether anything
    /// was added.
    fn fill_missing_tools(&mut self) -> bool {
        let mut added = false;
        for kind in ToolKind::ALL {
            if !self.tools.contains_key(kind.id()) {
                self.tools.insert(kind.id().to_string(), ToolDescriptor::for_kind(kind));
                added = true;
            }
        }
        added
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolStatus {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub available: bool,
    pub missing_secrets: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolStatusSummary {
    pub enabled: usize,
    pub disabled: usize,
    pub total: usize,
    pub last_updated: DateTime<Utc>,
    pub tools: Vec<ToolStatus>,
}

pub fn env_is_set(name: &str) -> bool {
    std::env::var(name).map(|v| !v.trim().is_empty()).unwrap_or(false)
}

pub struct ToolConfigManager {
    path: PathBuf,
    snapshot: RwLock<Arc<ToolConfigFile>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl ToolConfigManager {
    /// Load from disk, writing defaults (every tool enabled) when the file is
    /// absent.
    pub async fn load(path: impl Into<PathBuf>) -> SupportResult<Self> {
        let path = path.into();
        let config = if fs::try_exists(&path).await? {
            let content = fs::read_to_string(&path).await?;
            let mut config: ToolConfigFile = serde_json::from_str(&content).map_err(|e| {
                SupportError::Config(format!("{}: {}", path.display(), e))
            })?;
            if config.fill_missing_tools() {
                persist(&path, &config).await?;
            }
            config
        } else {
            tracing::info!(path = %path.display(), "No tool config found, writing defaults");
            let config = ToolConfigFile::default();
            persist(&path, &config).await?;
            config
        };

        Ok(Self {
            path,
            snapshot: RwLock::new(Arc::new(config)),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Consistent view of the whole configuration.
    pub fn snapshot(&self) -> Arc<ToolConfigFile> {
        Arc::clone(&self.snapshot.read())
    }

    pub fn enabled_tools(&self) -> Vec<String> {
        self.snapshot().enabled_tools()
    }

    pub fn available_tools(&self) -> Vec<String> {
        self.snapshot().available_tools(env_is_set)
    }

    pub async fn enable(&self, id: &str) -> SupportResult<Arc<ToolConfigFile>> {
        self.update(id, |t| t.enabled = true).await
    }

    pub async fn disable(&self, id: &str) -> SupportResult<Arc<ToolConfigFile>> {
        self.update(id, |t| t.enabled = false).await
    }

    pub async fn toggle(&self, id: &str) -> SupportResult<Arc<ToolConfigFile>> {
        self.update(id, |t| t.enabled = !t.enabled).await
    }

    pub async fn reset(&self) -> SupportResult<Arc<ToolConfigFile>> {
        let _guard = self.write_lock.lock().await;
        let config = ToolConfigFile::default();
        self.replace(config).await
    }

    pub fn status_summary(&self) -> ToolStatusSummary {
        let config = self.snapshot();
        let tools: Vec<ToolStatus> = config
            .tools
            .iter()
            .map(|(id, t)| {
                let missing = t.missing_secrets(env_is_set);
                ToolStatus {
                    id: id.clone(),
                    name: t.name.clone(),
                    enabled: t.enabled,
                    available: t.enabled && missing.is_empty(),
                    missing_secrets: missing,
                }
            })
            .collect();
        let enabled = tools.iter().filter(|t| t.enabled).count();
        ToolStatusSummary {
            enabled,
            disabled: tools.len() - enabled,
            total: tools.len(),
            last_updated: config.last_updated,
            tools,
        }
    }

    async fn update(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut ToolDescriptor),
    ) -> SupportResult<Arc<ToolConfigFile>> {
        let _guard = self.write_lock.lock().await;
        let mut next = (*self.snapshot()).clone();
        let descriptor = next
            .tools
            .get_mut(id)
            .ok_or_else(|| SupportError::UnknownTool(id.to_string()))?;
        mutate(descriptor);
        let enabled = descriptor.enabled;
        next.last_updated = Utc::now();

        let snapshot = self.replace(next).await?;
        tracing::info!(tool = id, enabled, "Tool configuration updated");
        Ok(snapshot)
    }

    /// Caller holds `write_lock`.
    async fn replace(&self, config: ToolConfigFile) -> SupportResult<Arc<ToolConfigFile>> {
        persist(&self.path, &config).await?;
        let snapshot = Arc::new(config);
        *self.snapshot.write() = Arc::clone(&snapshot);
        Ok(snapshot)
    }
}

/// Write through a temp file so a crash never leaves a truncated document.
async fn persist(path: &Path, config: &ToolConfigFile) -> SupportResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let content = serde_json::to_string_pretty(config)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tool-config.json");
        let manager = ToolConfigManager::load(&path).await.unwrap();

        assert!(path.exists());
        assert_eq!(manager.enabled_tools().len(), ToolKind::ALL.len());

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["version"], "1.0.0");
        assert!(raw["lastUpdated"].is_string());
        assert_eq!(raw["tools"]["web_search"]["apiKeys"][0], "GOOGLE_SEARCH_API_KEY");
        assert_eq!(raw["tools"]["calculator"]["enabled"], true);
    }

    #[tokio::test]
    async fn test_disable_persists_and_swaps_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool-config.json");
        let manager = ToolConfigManager::load(&path).await.unwrap();

        let before = manager.snapshot();
        manager.disable("calculator").await.unwrap();

        assert!(before.tools["calculator"].enabled);
        assert!(!manager.snapshot().tools["calculator"].enabled);
        assert!(!manager.enabled_tools().contains(&"calculator".to_string()));

        let reloaded = ToolConfigManager::load(&path).await.unwrap();
        assert!(!reloaded.snapshot().tools["calculator"].enabled);
    }

    #[tokio::test]
    async fn test_toggle_and_reset() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ToolConfigManager::load(dir.path().join("c.json")).await.unwrap();

        manager.toggle("datetime").await.unwrap();
        assert!(!manager.snapshot().tools["datetime"].enabled);
        manager.toggle("datetime").await.unwrap();
        assert!(manager.snapshot().tools["datetime"].enabled);

        manager.disable("web_search").await.unwrap();
        manager.reset().await.unwrap();
        assert_eq!(manager.enabled_tools().len(), ToolKind::ALL.len());
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ToolConfigManager::load(dir.path().join("c.json")).await.unwrap();
        let err = manager.enable("weather").await.unwrap_err();
        assert!(matches!(err, SupportError::UnknownTool(ref t) if t == "weather"));
    }

    #[test]
    fn test_available_requires_secrets() {
        let config = ToolConfigFile::default();
        let available = config.available_tools(|_| false);
        assert!(available.contains(&"calculator".to_string()));
        assert!(!available.contains(&"status_checker".to_string()));
        assert!(!available.contains(&"web_search".to_string()));

        let available = config.available_tools(|k| k == "STRIPE_SECRET_KEY");
        assert!(available.contains(&"status_checker".to_string()));
        assert!(!available.contains(&"web_search".to_string()));
    }

    #[tokio::test]
    async fn test_older_file_gains_new_tools() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.json");
        std::fs::write(
            &path,
            r#"{"tools":{"calculator":{"enabled":false,"name":"Calculator","description":"math"}},
                "lastUpdated":"2024-05-01T00:00:00Z","version":"1.0.0"}"#,
        )
        .unwrap();

        let manager = ToolConfigManager::load(&path).await.unwrap();
        let snapshot = manager.snapshot();
        assert!(!snapshot.tools["calculator"].enabled);
        assert_eq!(snapshot.tools.len(), ToolKind::ALL.len());
    }
}
