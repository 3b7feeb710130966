/**
 * CONFIG KERNEL - Chargement de la configuration YAML du contrôleur
 *
 * RÔLE : Paramètres MQTT, timeouts heartbeat, snapshot (namespace, codec,
 * taille de chunk, retries store), pool de publication, écoute HTTP et
 * définitions de workloads initiales.
 *
 * FONCTIONNEMENT : fichier `$FLEET_KERNEL_CONFIG` (défaut `kernel.yaml`).
 * Fichier absent = valeurs par défaut ; fichier illisible ou invalide = erreur fatale.
 * `NAME_SPACE` surcharge le namespace des snapshots.
 */

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

use crate::codec::Codec;
use crate::models::WorkloadDefinition;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub mqtt: MqttConf,
    pub heartbeat_timeout_secs: u64,
    pub snapshot_interval_secs: u64,
    pub snapshot: SnapshotConf,
    pub publish: PublishConf,
    pub http: HttpConf,
    pub workloads: Vec<WorkloadDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConf {
    pub namespace: String,
    pub store_dir: PathBuf,
    pub codec: Codec,
    /// Taille max d'un chunk, avant découpage
    pub max_chunk_bytes: usize,
    pub store_concurrency: usize,
    pub store_retries: u32,
    pub store_retry_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConf {
    pub workers: usize,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConf {
    pub listen: String,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConf::default(),
            heartbeat_timeout_secs: 300,
            snapshot_interval_secs: 60,
            snapshot: SnapshotConf::default(),
            publish: PublishConf::default(),
            http: HttpConf::default(),
            workloads: Vec::new(),
        }
    }
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "fleet-kernel".into(),
            keep_alive_secs: 15,
        }
    }
}

impl Default for SnapshotConf {
    fn default() -> Self {
        Self {
            namespace: "fleet".into(),
            store_dir: PathBuf::from("./data/snapshots"),
            codec: Codec::None,
            max_chunk_bytes: 1_000_000,
            store_concurrency: 16,
            store_retries: 3,
            store_retry_delay_ms: 10,
        }
    }
}

impl Default for PublishConf {
    fn default() -> Self {
        Self { workers: 8, queue_capacity: 10_000 }
    }
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { listen: "0.0.0.0:8080".into() }
    }
}

impl KernelConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    pub fn from_yaml(path: &Path, txt: &str) -> Result<Self, ConfigError> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(txt).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Un ack ne part qu'au sweep : un intervalle de snapshot plus long que le
    /// timeout heartbeat allonge chaque handshake au-delà du backoff des agents.
    pub fn slow_handshake(&self) -> bool {
        self.snapshot_interval_secs > self.heartbeat_timeout_secs
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slow_handshake() {
            warn!(
                "snapshot_interval_secs ({}) exceeds heartbeat_timeout_secs ({}): registrations wait up to one full interval for their ack",
                self.snapshot_interval_secs, self.heartbeat_timeout_secs
            );
        }
        if self.snapshot.max_chunk_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "snapshot.max_chunk_bytes",
                reason: "must be > 0".into(),
            });
        }
        if self.snapshot_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "snapshot_interval_secs",
                reason: "must be > 0".into(),
            });
        }
        if self.publish.workers == 0 || self.publish.queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "publish",
                reason: "workers and queue_capacity must be > 0".into(),
            });
        }
        if self.snapshot.namespace.is_empty() {
            return Err(ConfigError::Invalid {
                field: "snapshot.namespace",
                reason: "empty".into(),
            });
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(ns) = std::env::var("NAME_SPACE") {
            if !ns.is_empty() {
                self.snapshot.namespace = ns;
            }
        }
    }
}

pub async fn load_config() -> Result<KernelConfig, ConfigError> {
    let path = std::env::var("FLEET_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    load_config_from(Path::new(&path)).await
}

pub async fn load_config_from(path: &Path) -> Result<KernelConfig, ConfigError> {
    let mut cfg = if path.exists() {
        let txt = fs::read_to_string(path).await.map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        KernelConfig::from_yaml(path, &txt)?
    } else {
        info!("no config at {}, using defaults", path.display());
        KernelConfig::default()
    };
    cfg.apply_env();
    cfg.validate()?;
    Ok(cfg)
}
