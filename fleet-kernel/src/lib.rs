//! Fleet controller: heartbeat ingestion, node state machine, workload
//! reconciliation and chunked snapshot persistence over MQTT.

pub mod agents;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod filter;
pub mod health;
pub mod http;
pub mod models;
pub mod mqtt;
pub mod observed;
pub mod query;
pub mod reconciler;
pub mod snapshot;
pub mod state;
pub mod store;

pub use agents::{AgentRegistry, AgentsMap, Arrival, SweepOutcome, SweepStats};
pub use codec::Codec;
pub use config::KernelConfig;
pub use dispatch::Dispatcher;
pub use filter::{FilterDecision, HeartbeatFilter};
pub use reconciler::Reconciler;
pub use snapshot::{SnapshotEngine, SnapshotSettings};
pub use state::FleetState;
pub use store::{ChunkStore, FileChunkStore, MemoryChunkStore};
