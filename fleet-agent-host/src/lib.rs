//! Fleet agent host - simulated edge agents for the fleet kernel
//!
//! - Registration handshake over MQTT with ack correlation
//! - Periodic heartbeats carrying host status and local workloads
//! - Workload commands applied to an in-memory store
//! - Sequence number persisted across restarts

pub mod agent;
pub mod config;
pub mod discovery;
pub mod metrics;
pub mod persist;
pub mod registration;
pub mod workloads;

pub use agent::{spawn_instance, AgentInstance, SharedStatus};
pub use config::AgentConfig;
pub use registration::{Registrar, RegistrationError};
pub use workloads::{Applied, LocalWorkloads};
