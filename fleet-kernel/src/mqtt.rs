/**
 * MQTT LISTENER - Connexion broker et ingestion des heartbeats
 *
 * RÔLE : connexion initiale bloquante (échec = arrêt du kernel), abonnement
 * au topic `heartbeat`, puis une tâche par message reçu.
 *
 * FONCTIONNEMENT :
 * - connect : poll de l'eventloop jusqu'au ConnAck, borné dans le temps
 * - spawn_listener : boucle poll ; chaque publish `heartbeat` part dans sa
 *   propre tâche (filtre -> état -> commandes au dispatcher)
 * - reconnexion gérée par rumqttc, réabonnement à chaque ConnAck
 * - arrêt propre sur le canal watch de shutdown
 */

use fleet_proto::topics::HEARTBEAT_TOPIC;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::MqttConf;
use crate::dispatch::Dispatcher;
use crate::health::HealthTracker;
use crate::state::{FleetState, Ingest};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_PAUSE: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    #[error("connection to broker failed: {0}")]
    Connection(#[from] rumqttc::ConnectionError),
    #[error("broker refused connection: {0:?}")]
    Refused(ConnectReturnCode),
    #[error("no ConnAck within {0:?}")]
    ConnectTimeout(Duration),
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
}

pub fn mqtt_options(cfg: &MqttConf) -> MqttOptions {
    let mut opts = MqttOptions::new(&cfg.client_id, &cfg.host, cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs));
    opts.set_clean_session(true);
    opts
}

/// Connexion initiale : attend le ConnAck puis s'abonne aux heartbeats.
pub async fn connect(cfg: &MqttConf) -> Result<(AsyncClient, EventLoop), MqttError> {
    let (client, mut eventloop) = AsyncClient::new(mqtt_options(cfg), 100);
    info!("connecting to MQTT broker {}:{}", cfg.host, cfg.port);

    let wait_ack = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    return match ack.code {
                        ConnectReturnCode::Success => Ok(()),
                        code => Err(MqttError::Refused(code)),
                    };
                }
                Ok(other) => debug!("waiting for ConnAck, got {:?}", other),
                Err(e) => return Err(MqttError::from(e)),
            }
        }
    };
    tokio::time::timeout(CONNECT_TIMEOUT, wait_ack)
        .await
        .map_err(|_| MqttError::ConnectTimeout(CONNECT_TIMEOUT))??;

    client.subscribe(HEARTBEAT_TOPIC, QoS::AtLeastOnce).await?;
    info!("connected, subscribed to {}", HEARTBEAT_TOPIC);
    Ok((client, eventloop))
}

/// Traite un payload `heartbeat` et confie les commandes au dispatcher.
pub fn handle_heartbeat(state: &FleetState, dispatcher: &Dispatcher, payload: &[u8]) {
    let Some((name, outcome)) = state.ingest_payload(payload, OffsetDateTime::now_utc()) else {
        return;
    };
    match outcome {
        Ingest::Rejected(decision) => debug!("heartbeat from {} rejected: {:?}", name, decision),
        Ingest::Accepted { commands, .. } => {
            if !commands.is_empty() {
                let sent = dispatcher.dispatch_commands(&name, &commands);
                debug!("{} commands queued for {} ({} produced)", sent, name, commands.len());
            }
        }
    }
}

pub fn spawn_listener(
    client: AsyncClient,
    mut eventloop: EventLoop,
    state: Arc<FleetState>,
    dispatcher: Dispatcher,
    health: HealthTracker,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    health.mark_mqtt_connected();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("MQTT listener stopping");
                    if let Err(e) = client.disconnect().await {
                        warn!("MQTT disconnect failed: {}", e);
                    }
                    break;
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::Publish(p))) if p.topic == HEARTBEAT_TOPIC => {
                        let state = state.clone();
                        let dispatcher = dispatcher.clone();
                        tokio::spawn(async move {
                            handle_heartbeat(&state, &dispatcher, &p.payload);
                        });
                    }
                    Ok(Event::Incoming(Incoming::Publish(p))) => {
                        debug!("ignoring publish on {}", p.topic);
                    }
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!("MQTT reconnected, resubscribing");
                        health.mark_mqtt_connected();
                        let client = client.clone();
                        tokio::spawn(async move {
                            if let Err(e) = client.subscribe(HEARTBEAT_TOPIC, QoS::AtLeastOnce).await {
                                error!("resubscribe failed: {}", e);
                            }
                        });
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT error: {}", e);
                        health.increment_reconnects();
                        tokio::time::sleep(RECONNECT_PAUSE).await;
                    }
                }
            }
        }
        health.mark_mqtt_disconnected();
    })
}
