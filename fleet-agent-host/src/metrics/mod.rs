//! Resource status reported in heartbeats
//!
//! Provides cross-platform host sampling:
//! - CPU capacity in millicores, allocatable share from current usage
//! - Memory capacity and availability in KiB
//! - Node info (architecture, agent version, kernel version)
//!
//! Simulated instances on one host share a single sample.

use fleet_proto::{Address, NodeInfo, NodeStatus, Resources};
use sysinfo::System;
use tracing::debug;

/// Workload slots advertised by every simulated agent
pub const POD_SLOTS: u32 = 110;

/// Raw host sample before conversion to wire units
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostSample {
    pub core_count: usize,
    pub cpu_percent: f32,
    pub total_memory_bytes: u64,
    pub available_memory_bytes: u64,
}

impl HostSample {
    /// Sample CPU and memory. Blocking, call from `spawn_blocking`.
    pub fn collect() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        sys.refresh_cpu();
        sys.refresh_memory();

        let sample = HostSample {
            core_count: sys.cpus().len(),
            cpu_percent: sys.global_cpu_info().cpu_usage(),
            total_memory_bytes: sys.total_memory(),
            available_memory_bytes: sys.available_memory(),
        };
        debug!("host sample: {:?}", sample);
        sample
    }

    pub fn capacity(&self) -> Resources {
        Resources {
            cpu: self.core_count as u64 * 1000,
            memory: self.total_memory_bytes / 1024,
            pods: POD_SLOTS,
        }
    }

    pub fn allocatable(&self) -> Resources {
        let idle = (100.0 - self.cpu_percent.clamp(0.0, 100.0)) / 100.0;
        Resources {
            cpu: (self.capacity().cpu as f64 * idle as f64) as u64,
            memory: self.available_memory_bytes.min(self.total_memory_bytes) / 1024,
            pods: POD_SLOTS,
        }
    }
}

pub fn node_info() -> NodeInfo {
    NodeInfo {
        architecture: std::env::consts::ARCH.to_string(),
        agent_version: format!("v{}", env!("CARGO_PKG_VERSION")),
        kernel_version: System::kernel_version().unwrap_or_default(),
    }
}

pub fn node_status(sample: &HostSample, addresses: Vec<Address>) -> NodeStatus {
    NodeStatus {
        addresses,
        allocatable: Some(sample.allocatable()),
        capacity: Some(sample.capacity()),
        node_info: Some(node_info()),
    }
}

/// Full status for this host, sampled off the async runtime.
pub async fn collect_status() -> NodeStatus {
    let addresses = crate::discovery::discover_addresses();
    let sample = tokio::task::spawn_blocking(HostSample::collect)
        .await
        .unwrap_or(HostSample {
            core_count: 0,
            cpu_percent: 0.0,
            total_memory_bytes: 0,
            available_memory_bytes: 0,
        });
    node_status(&sample, addresses)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_units_and_allocatable_share() {
        let sample = HostSample {
            core_count: 8,
            cpu_percent: 25.0,
            total_memory_bytes: 16 * 1024 * 1024 * 1024,
            available_memory_bytes: 4 * 1024 * 1024 * 1024,
        };
        assert_eq!(sample.capacity().cpu, 8000);
        assert_eq!(sample.capacity().memory, 16 * 1024 * 1024);
        assert_eq!(sample.allocatable().cpu, 6000);
        assert_eq!(sample.allocatable().memory, 4 * 1024 * 1024);
        assert_eq!(sample.allocatable().pods, POD_SLOTS);
    }

    #[test]
    fn test_cpu_usage_out_of_range_is_clamped() {
        let sample = HostSample {
            core_count: 2,
            cpu_percent: 140.0,
            total_memory_bytes: 1024,
            available_memory_bytes: 4096,
        };
        assert_eq!(sample.allocatable().cpu, 0);
        assert_eq!(sample.allocatable().memory, 1);
    }

    #[tokio::test]
    async fn test_collect_status() {
        let status = collect_status().await;
        assert!(status.capacity.unwrap().cpu > 0);
        assert!(!status.node_info.unwrap().architecture.is_empty());
        assert!(!status.addresses.is_empty());
    }
}
