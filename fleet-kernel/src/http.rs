/**
 * API REST FLEET - Surface HTTP du contrôleur
 *
 * RÔLE :
 * Lecture de l'état de la flotte (santé, projection des nœuds) et gestion
 * des définitions de workloads fleet-wide.
 *
 * FONCTIONNEMENT :
 * - Serveur Axum, réponses JSON
 * - GET /health, GET /nodes, GET /nodes/{name}
 * - GET /workloads, PUT /workloads, DELETE /workloads/{namespace}/{name}
 * - GET /workloads joint à chaque définition le décompte desired / scheduled / ready
 * - Les routes de modification exigent le header x-api-key quand FLEET_API_KEY est défini
 * - Les commandes issues d'un changement de définition partent par le dispatcher
 *
 * /nodes lit la projection reconstruite à chaque sweep, jamais le cache vivant.
 */

use axum::extract::{Path, Request, State};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get};
use axum::{Json, Router};
use fleet_proto::{NodeState, WorkloadSummary};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use tracing::{info, warn};

use crate::dispatch::Dispatcher;
use crate::health::{HealthTracker, KernelHealth};
use crate::models::{NodeQueryStatus, WorkloadDefinition, WorkloadView};
use crate::reconciler::{DesiredEntry, Outbound};
use crate::state::FleetState;

pub const API_KEY_ENV: &str = "FLEET_API_KEY";

#[derive(Clone)]
pub struct AppState {
    pub state: Arc<FleetState>,
    pub dispatcher: Dispatcher,
    pub health: HealthTracker,
}

#[derive(Debug, Serialize)]
pub struct NodeView {
    pub name: String,
    pub state: NodeState,
    /// dernier heartbeat reçu, RFC3339
    pub last_seen: Option<String>,
    pub seqnum: Option<u64>,
    pub labels: BTreeMap<String, String>,
    pub observed: Vec<WorkloadSummary>,
    pub desired: Vec<DesiredEntry>,
}

#[derive(Debug, Serialize)]
pub struct ChangeResult {
    pub key: String,
    pub commands_queued: usize,
}

async fn require_api_key(req: Request, next: Next) -> Result<Response, StatusCode> {
    if req.method() == Method::GET {
        return Ok(next.run(req).await);
    }

    let expected = std::env::var(API_KEY_ENV).unwrap_or_default();
    if expected.is_empty() {
        return Ok(next.run(req).await);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected);
    if !ok {
        warn!("rejected {} {}: bad or missing api key", req.method(), req.uri().path());
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/nodes", get(list_nodes))
        .route("/nodes/{name}", get(get_node))
        .route("/workloads", get(list_workloads).put(put_workload))
        .route("/workloads/{namespace}/{name}", delete(delete_workload))
        .with_state(app_state)
        .layer(middleware::from_fn(require_api_key))
}

// GET /health
async fn get_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health.get_health(&app.state, &app.dispatcher))
}

// GET /nodes
async fn list_nodes(State(app): State<AppState>) -> Json<Vec<NodeQueryStatus>> {
    Json(app.state.query.list())
}

// GET /nodes/{name}
async fn get_node(State(app): State<AppState>, Path(name): Path<String>) -> Result<Json<NodeView>, StatusCode> {
    let status = app.state.query.get(&name).ok_or(StatusCode::NOT_FOUND)?;
    let entry = app.state.agents.get(&name);

    let mut desired: Vec<DesiredEntry> = app
        .state
        .reconciler
        .desired_for(&name)
        .map(|m| m.into_values().collect())
        .unwrap_or_default();
    desired.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));

    Ok(Json(NodeView {
        name: status.name,
        state: status.state,
        last_seen: entry.as_ref().and_then(|e| e.last_seen.format(&Rfc3339).ok()),
        seqnum: entry.as_ref().map(|e| e.record.seqnum),
        labels: entry.as_ref().map(|e| e.record.labels.clone()).unwrap_or_default(),
        observed: entry.map(|e| e.record.pods).unwrap_or_default(),
        desired,
    }))
}

// GET /workloads
async fn list_workloads(State(app): State<AppState>) -> Json<Vec<WorkloadView>> {
    Json(app.state.workload_rollup())
}

// PUT /workloads
async fn put_workload(
    State(app): State<AppState>,
    Json(def): Json<WorkloadDefinition>,
) -> Result<Json<ChangeResult>, (StatusCode, String)> {
    if def.name.is_empty() || def.namespace.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "name and namespace are required".into()));
    }
    let key = def.key();
    let outbound = app
        .state
        .reconciler
        .apply_definition(def)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let commands_queued = dispatch_outbound(&app.dispatcher, &outbound);
    info!("workload {} applied via HTTP, {} commands queued", key, commands_queued);
    Ok(Json(ChangeResult { key, commands_queued }))
}

// DELETE /workloads/{namespace}/{name}
async fn delete_workload(
    State(app): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<ChangeResult>, StatusCode> {
    let outbound = app
        .state
        .reconciler
        .delete_definition(&namespace, &name)
        .ok_or(StatusCode::NOT_FOUND)?;
    let commands_queued = dispatch_outbound(&app.dispatcher, &outbound);
    let key = WorkloadDefinition { name, namespace, spec: Default::default() }.key();
    info!("workload {} deleted via HTTP, {} commands queued", key, commands_queued);
    Ok(Json(ChangeResult { key, commands_queued }))
}

fn dispatch_outbound(dispatcher: &Dispatcher, outbound: &[Outbound]) -> usize {
    outbound
        .iter()
        .filter(|(agent, cmd)| dispatcher.dispatch_command(agent, cmd))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_devkit::{HeartbeatBuilder, MockMqttClient};
    use fleet_proto::WorkloadSpec;
    use std::time::Duration;
    use time::OffsetDateTime;

    fn app() -> (AppState, Arc<MockMqttClient>) {
        let mock = Arc::new(MockMqttClient::new());
        let (dispatcher, _) = Dispatcher::spawn(mock.clone(), 1, 64);
        let state = Arc::new(FleetState::new());
        let now = OffsetDateTime::now_utc();
        state.consume_heartbeat(HeartbeatBuilder::new("edge-1").label("zone", "a").build(), now);
        state.consume_heartbeat(HeartbeatBuilder::new("edge-2").label("zone", "b").build(), now);
        let sweep = state.agents.sweep(now, Duration::from_secs(300)).unwrap();
        state.query.reset(sweep.statuses);
        (AppState { state, dispatcher, health: HealthTracker::new() }, mock)
    }

    fn zoned_web(zone: &str) -> WorkloadDefinition {
        let mut spec = WorkloadSpec { image: "nginx".into(), ..Default::default() };
        spec.node_selector.insert("zone".into(), zone.into());
        WorkloadDefinition { name: "web".into(), namespace: "fleet".into(), spec }
    }

    #[tokio::test]
    async fn test_nodes_listing_and_detail() {
        let (app, _) = app();
        let Json(nodes) = list_nodes(State(app.clone())).await;
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].name, "edge-1");
        assert_eq!(nodes[0].state, NodeState::Registered);

        let Json(view) = get_node(State(app.clone()), Path("edge-2".into())).await.unwrap();
        assert_eq!(view.labels["zone"], "b");
        assert!(view.last_seen.is_some());

        let missing = get_node(State(app), Path("nope".into())).await;
        assert_eq!(missing.unwrap_err(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_put_workload_targets_selected_agents() {
        let (app, _) = app();
        let Json(res) = put_workload(State(app.clone()), Json(zoned_web("a"))).await.unwrap();
        assert_eq!(res.key, "fleet-fleetset-web");
        assert_eq!(res.commands_queued, 1);

        // same spec again: nothing to publish
        let Json(again) = put_workload(State(app.clone()), Json(zoned_web("a"))).await.unwrap();
        assert_eq!(again.commands_queued, 0);

        let Json(view) = get_node(State(app.clone()), Path("edge-1".into())).await.unwrap();
        assert_eq!(view.desired.len(), 1);
        let Json(defs) = list_workloads(State(app)).await;
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].status.desired, 1);
    }

    #[tokio::test]
    async fn test_workloads_listing_reports_rollout() {
        let (app, _) = app();
        put_workload(State(app.clone()), Json(zoned_web("a"))).await.unwrap();
        let Json(view) = get_node(State(app.clone()), Path("edge-1".into())).await.unwrap();
        let hash = view.desired[0].hash.clone();

        app.state.consume_heartbeat(
            HeartbeatBuilder::new("edge-1")
                .seq(2)
                .label("zone", "a")
                .running("fleet", "fleetset-web", &hash)
                .build(),
            OffsetDateTime::now_utc(),
        );

        let Json(defs) = list_workloads(State(app)).await;
        assert_eq!(defs[0].definition.name, "web");
        assert_eq!(defs[0].hash, hash);
        assert_eq!(defs[0].status.desired, 1);
        assert_eq!(defs[0].status.scheduled, 1);
        assert_eq!(defs[0].status.ready, 1);

        let json = serde_json::to_value(&defs[0]).unwrap();
        assert_eq!(json["namespace"], "fleet");
        assert_eq!(json["status"]["ready"], 1);
    }

    #[tokio::test]
    async fn test_put_rejects_missing_names() {
        let (app, _) = app();
        let mut def = zoned_web("a");
        def.namespace.clear();
        let err = put_workload(State(app), Json(def)).await.unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_delete_workload_sends_tombstones() {
        let (app, mock) = app();
        put_workload(State(app.clone()), Json(zoned_web("b"))).await.unwrap();

        let Json(res) = delete_workload(State(app.clone()), Path(("fleet".into(), "web".into())))
            .await
            .unwrap();
        assert_eq!(res.commands_queued, 1);

        for _ in 0..100 {
            if mock.find_messages_by_topic("data/edge-2").len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let last: serde_json::Value = mock.get_last_json_message("data/edge-2").unwrap().unwrap();
        assert!(last["deleteTimestamp"].is_string(), "{last}");

        let gone = delete_workload(State(app), Path(("fleet".into(), "web".into()))).await;
        assert_eq!(gone.unwrap_err(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_counts_agents() {
        let (app, _) = app();
        let Json(health) = get_health(State(app)).await;
        assert_eq!(health.agents_tracked, 2);
        assert_eq!(health.heartbeats.accepted, 2);
    }
}
