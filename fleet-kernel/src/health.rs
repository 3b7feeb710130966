/**
 * HEALTH - Santé du contrôleur exposée sur /health
 *
 * RÔLE : uptime, état de la connexion MQTT, reconnexions, dernier cycle de
 * snapshot, compteurs d'ingestion et de publication.
 *
 * FONCTIONNEMENT : HealthTracker est cloné dans le listener MQTT et la boucle
 * de snapshot, qui y reportent leurs événements ; get_health agrège le tout.
 */

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::dispatch::{DispatchStats, Dispatcher};
use crate::snapshot::CycleReport;
use crate::state::{FleetState, IngestStats};

#[derive(Debug, Serialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub agents_tracked: usize,
    pub definitions_loaded: usize,
    pub memory_usage_mb: Option<f32>,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
    pub heartbeats: IngestStats,
    pub publish: DispatchStats,
    pub last_snapshot: Option<CycleReport>,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Arc<Mutex<String>>,
    last_snapshot: Arc<Mutex<Option<CycleReport>>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: Arc::new(Mutex::new("connecting".to_string())),
            last_snapshot: Arc::new(Mutex::new(None)),
        }
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn mark_mqtt_disconnected(&self) {
        *self.mqtt_status.lock() = "disconnected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn record_snapshot(&self, report: CycleReport) {
        *self.last_snapshot.lock() = Some(report);
    }

    pub fn mqtt_status(&self) -> String {
        self.mqtt_status.lock().clone()
    }

    pub fn get_health(&self, state: &FleetState, dispatcher: &Dispatcher) -> KernelHealth {
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            agents_tracked: state.agents.len(),
            definitions_loaded: state.reconciler.definitions().len(),
            memory_usage_mb: memory_usage_mb(),
            mqtt_status: self.mqtt_status(),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
            heartbeats: state.ingest_stats(),
            publish: dispatcher.stats(),
            last_snapshot: self.last_snapshot.lock().clone(),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// RSS du process, Linux uniquement
fn memory_usage_mb() -> Option<f32> {
    #[cfg(target_os = "linux")]
    {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        let kb: u64 = status
            .lines()
            .find(|l| l.starts_with("VmRSS:"))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()?;
        Some(kb as f32 / 1024.0)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_devkit::MockMqttClient;

    #[tokio::test]
    async fn test_health_reports_mqtt_transitions() {
        let tracker = HealthTracker::new();
        let state = FleetState::new();
        let (dispatcher, _) = Dispatcher::spawn(Arc::new(MockMqttClient::new()), 1, 4);

        assert_eq!(tracker.get_health(&state, &dispatcher).mqtt_status, "connecting");
        tracker.mark_mqtt_connected();
        tracker.increment_reconnects();
        let health = tracker.get_health(&state, &dispatcher);
        assert_eq!(health.mqtt_status, "reconnecting");
        assert_eq!(health.mqtt_reconnects, 1);
        assert!(health.last_snapshot.is_none());

        tracker.record_snapshot(CycleReport { generation: 3, ..Default::default() });
        assert_eq!(tracker.get_health(&state, &dispatcher).last_snapshot.unwrap().generation, 3);
    }
}
