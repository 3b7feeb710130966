//! Heartbeat and acknowledgement payloads
//!
//! `HeartbeatRecord` is emitted by agents on the `heartbeat` topic; `Ack` answers
//! a registering agent on `ctl/<name>`. Only the hash of each running workload's
//! spec travels in a heartbeat, never the spec itself.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::workload::workload_key;

/// Lifecycle of an agent as seen by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NodeState {
    #[default]
    Registering,
    // older agents spell it "Registerd"
    #[serde(alias = "Registerd")]
    Registered,
    Offline,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Registering => "Registering",
            NodeState::Registered => "Registered",
            NodeState::Offline => "Offline",
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Periodic state report of one agent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Emission time, unix milliseconds.
    #[serde(default)]
    pub timestamp: i64,
    /// Correlation identifier, fresh for every heartbeat.
    #[serde(default)]
    pub identifier: String,
    /// Per-agent sequence number, persisted across agent restarts.
    #[serde(default)]
    pub seqnum: u64,
    #[serde(default)]
    pub state: NodeState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<NodeStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pods: Vec<WorkloadSummary>,
}

impl HeartbeatRecord {
    pub fn from_slice(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<Address>,
    /// Resources the scheduler may hand out on this node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocatable: Option<Resources>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<Resources>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_info: Option<NodeInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressType {
    #[serde(rename = "InternalIP")]
    InternalIp,
    HostName,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub address: String,
    #[serde(rename = "type")]
    pub address_type: AddressType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Resources {
    /// millicores
    #[serde(default)]
    pub cpu: u64,
    /// KiB
    #[serde(default)]
    pub memory: u64,
    /// workload slots
    #[serde(default)]
    pub pods: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub architecture: String,
    pub agent_version: String,
    pub kernel_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WorkloadPhase {
    Pending,
    #[default]
    Running,
    Succeeded,
    Failed,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkloadStatus {
    pub phase: WorkloadPhase,
}

/// What an agent reports about one running workload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkloadSummary {
    pub hash: String,
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<WorkloadStatus>,
}

impl WorkloadSummary {
    pub fn key(&self) -> String {
        workload_key(&self.namespace, &self.name)
    }
}

/// Registration acknowledgement published by the kernel on `ctl/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Ack {
    pub identifier: String,
    #[serde(default)]
    pub registerd: bool,
    /// Routing only, never on the wire.
    #[serde(skip)]
    pub agent_name: String,
}

impl Ack {
    pub fn from_slice(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}
