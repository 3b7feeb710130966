/**
 * CHUNK STORE - Stockage durable des chunks de snapshot
 *
 * RÔLE : interface list/create/delete vers le store d'objets déclaratif
 * qui conserve les snapshots entre deux redémarrages du kernel.
 *
 * FONCTIONNEMENT :
 * - SnapshotChunk = {namespace, name "<génération>-<index>", labels, data, index}
 * - labels : identifier = génération, summary = "true", maxNum = nombre total de chunks
 * - ChunkStore trait async : une implémentation fichier, une en mémoire pour les tests
 *
 * Jamais lu sur le chemin chaud : uniquement au démarrage (restore) et par le cycle de snapshot.
 */

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod file;
pub mod memory;

pub use file::FileChunkStore;
pub use memory::MemoryChunkStore;

pub const LABEL_IDENTIFIER: &str = "identifier";
pub const LABEL_SUMMARY: &str = "summary";
pub const LABEL_MAX_NUM: &str = "maxNum";

/// Erreurs possibles côté store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("chunk not found: {0}")]
    NotFound(String),
    #[error("chunk already exists: {0}")]
    AlreadyExists(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Un morceau de snapshot tel qu'il est persisté
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotChunk {
    pub namespace: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    /// Octets bruts (compressés ou non), base64 sur disque
    #[serde(with = "b64")]
    pub data: Vec<u8>,
    pub index: usize,
}

impl SnapshotChunk {
    pub fn new(namespace: &str, generation: u64, index: usize, total: usize, data: Vec<u8>) -> Self {
        let labels = BTreeMap::from([
            (LABEL_IDENTIFIER.to_string(), generation.to_string()),
            (LABEL_SUMMARY.to_string(), "true".to_string()),
            (LABEL_MAX_NUM.to_string(), total.to_string()),
        ]);
        Self {
            namespace: namespace.to_string(),
            name: chunk_name(generation, index),
            labels,
            data,
            index,
        }
    }

    pub fn generation(&self) -> Option<u64> {
        self.labels.get(LABEL_IDENTIFIER)?.parse().ok()
    }

    pub fn total(&self) -> Option<usize> {
        self.labels.get(LABEL_MAX_NUM)?.parse().ok()
    }

    pub fn is_summary(&self) -> bool {
        self.labels.get(LABEL_SUMMARY).map(String::as_str) == Some("true")
    }
}

pub fn chunk_name(generation: u64, index: usize) -> String {
    format!("{}-{}", generation, index)
}

/// Interface commune aux stores de chunks
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Tous les chunks du namespace, dans un ordre quelconque
    async fn list(&self, namespace: &str) -> Result<Vec<SnapshotChunk>, StoreError>;

    async fn create(&self, chunk: &SnapshotChunk) -> Result<(), StoreError>;

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let txt = String::deserialize(d)?;
        STANDARD.decode(txt.as_bytes()).map_err(serde::de::Error::custom)
    }
}
