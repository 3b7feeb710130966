//! Fleet protocol - types and plumbing shared by the kernel and its agents
//!
//! - Heartbeat / ack / workload command payloads (JSON over MQTT)
//! - Topic naming for the heartbeat, control and data channels
//! - `CorrelationCache`: blocking-wait-with-timeout store bridging a publish to its ack
//! - `Publisher`: the transport seam, implemented for `rumqttc::AsyncClient`

pub mod models;
pub mod timeout_cache;
pub mod topics;
pub mod transport;
pub mod workload;

pub use models::{
    Ack, Address, AddressType, HeartbeatRecord, NodeInfo, NodeState, NodeStatus, Resources,
    WorkloadPhase, WorkloadStatus, WorkloadSummary,
};
pub use timeout_cache::CorrelationCache;
pub use transport::{publish_json, Publisher, TransportError};
pub use workload::{spec_hash, workload_key, WorkloadCommand, WorkloadSpec};

/// Current unix time in milliseconds, the unit of `HeartbeatRecord::timestamp`.
pub fn unix_millis() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
