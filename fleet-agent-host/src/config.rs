//! Agent configuration
//!
//! Handles:
//! - MQTT broker settings
//! - Simulation parameters (instance count, heartbeat cadence, registration backoff)
//! - Name prefix resolution (`POD_NAME`, then hostname, then a random id)
//! - Cross-platform storage (`$FLEET_AGENT_CONFIG` or the OS config dir)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

pub const CONFIG_ENV: &str = "FLEET_AGENT_CONFIG";
pub const POD_NAME_ENV: &str = "POD_NAME";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub mqtt: MqttConfig,
    pub agent: AgentSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub keep_alive_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Overrides the resolved prefix when set
    pub name_prefix: Option<String>,
    pub instances: usize,
    pub heartbeat_interval_secs: u64,
    pub registration_backoff_secs: u64,
    pub spawn_interval_ms: u64,
    pub persistent_dir: PathBuf,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "127.0.0.1".to_string(),
            broker_port: 1883,
            keep_alive_secs: 60,
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            name_prefix: None,
            instances: 1,
            heartbeat_interval_secs: 120,
            registration_backoff_secs: 10,
            spawn_interval_ms: 500,
            persistent_dir: PathBuf::from("./data/agent"),
        }
    }
}

impl AgentSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn registration_backoff(&self) -> Duration {
        Duration::from_secs(self.registration_backoff_secs)
    }

    pub fn spawn_interval(&self) -> Duration {
        Duration::from_millis(self.spawn_interval_ms)
    }
}

impl AgentConfig {
    /// Load config from `$FLEET_AGENT_CONFIG` or the OS-specific location.
    /// A missing file yields the defaults.
    pub async fn load() -> Result<Self> {
        let config_path = Self::config_file_path()?;
        Self::load_from(&config_path).await
    }

    pub async fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            info!("no agent config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let config: AgentConfig =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        info!("agent config loaded from {}", path.display());
        Ok(config)
    }

    /// Save config to the given location
    pub async fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    /// Get config file path: env override, else OS config dir
    pub fn config_file_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        path.push("fleet-agent");
        path.push("config.toml");
        Ok(path)
    }

    /// Prefix for instance names: config, then `POD_NAME`, then hostname, then a uuid.
    pub fn name_prefix(&self) -> String {
        if let Some(prefix) = self.agent.name_prefix.as_ref().filter(|p| !p.is_empty()) {
            return prefix.clone();
        }
        if let Ok(pod) = std::env::var(POD_NAME_ENV) {
            if !pod.is_empty() {
                return pod;
            }
        }
        match hostname::get().map(|h| h.to_string_lossy().to_string()) {
            Ok(host) if !host.is_empty() => host,
            _ => uuid::Uuid::new_v4().to_string(),
        }
    }
}
