//! Workload specs and the sync/delete commands pushed on `data/<name>`

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use time::OffsetDateTime;

/// Key of a workload on one agent: `<namespace>-<name>`.
pub fn workload_key(namespace: &str, name: &str) -> String {
    format!("{}-{}", namespace, name)
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Agents whose labels contain every pair receive the workload.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
}

impl WorkloadSpec {
    pub fn selects(&self, labels: &BTreeMap<String, String>) -> bool {
        self.node_selector
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }
}

/// Hex SHA-256 of the spec's JSON form; BTreeMaps keep it stable.
pub fn spec_hash(spec: &WorkloadSpec) -> Result<String, serde_json::Error> {
    let data = serde_json::to_vec(spec)?;
    Ok(hex::encode(Sha256::digest(&data)))
}

/// One command on an agent's data topic. `spec` set means create/update,
/// `delete_timestamp` set means delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadCommand {
    pub hash: String,
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<WorkloadSpec>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub delete_timestamp: Option<OffsetDateTime>,
}

impl WorkloadCommand {
    pub fn sync(hash: impl Into<String>, name: impl Into<String>, namespace: impl Into<String>, spec: WorkloadSpec) -> Self {
        Self {
            hash: hash.into(),
            name: name.into(),
            namespace: namespace.into(),
            spec: Some(spec),
            delete_timestamp: None,
        }
    }

    pub fn delete(hash: impl Into<String>, name: impl Into<String>, namespace: impl Into<String>, at: OffsetDateTime) -> Self {
        Self {
            hash: hash.into(),
            name: name.into(),
            namespace: namespace.into(),
            spec: None,
            delete_timestamp: Some(at),
        }
    }

    pub fn is_delete(&self) -> bool {
        self.delete_timestamp.is_some()
    }

    pub fn key(&self) -> String {
        workload_key(&self.namespace, &self.name)
    }

    pub fn from_slice(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}
