//! The operator dashboard socket and its broadcaster.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use switchyard_autoscale::Autoscaler;
use switchyard_core::epoch_millis;
use switchyard_registry::InstanceRegistry;
use switchyard_sessions::SessionStore;

use crate::commands::{Command, parse_command};
use crate::state::{DashboardState, RegistrySection, SessionsSection, SystemSection};

/// Route path for operator connections.
pub const DASHBOARD_PATH: &str = "/registry-dashboard";

/// Buffered deltas per operator before it is considered lagging.
const UPDATE_CAPACITY: usize = 32;

/// Live view over the registry and session store, plus operator commands.
pub struct Dashboard {
    registry: Arc<InstanceRegistry>,
    sessions: Arc<SessionStore>,
    autoscaler: Arc<Autoscaler>,
    broadcast_interval: Duration,
    updates: broadcast::Sender<String>,
    operators: AtomicUsize,
    started: Instant,
    started_at: u64,
}

/// Counts an operator socket for as long as it lives.
struct OperatorGuard<'a>(&'a AtomicUsize);

impl<'a> OperatorGuard<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::AcqRel);
        Self(count)
    }
}

impl Drop for OperatorGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Dashboard {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        sessions: Arc<SessionStore>,
        autoscaler: Arc<Autoscaler>,
        broadcast_interval: Duration,
    ) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        Self {
            registry,
            sessions,
            autoscaler,
            broadcast_interval,
            updates,
            operators: AtomicUsize::new(0),
            started: Instant::now(),
            started_at: epoch_millis(),
        }
    }

    /// Axum routes serving [`DASHBOARD_PATH`].
    pub fn routes(self: Arc<Self>) -> Router {
        Router::new()
            .route(DASHBOARD_PATH, get(dashboard_ws))
            .with_state(self)
    }

    /// Connected operator sockets.
    pub fn operators(&self) -> usize {
        self.operators.load(Ordering::Acquire)
    }

    /// Receive every `state-delta` frame the broadcaster emits.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.updates.subscribe()
    }

    pub fn snapshot(&self) -> DashboardState {
        let sessions = self.sessions.sessions();
        DashboardState {
            registry: RegistrySection {
                instances: self.registry.instances(),
                strategy: self.registry.strategy(),
                max_instances: self.registry.max_instances(),
                max_connections_per_instance: self.registry.max_connections_per_instance(),
                total_connections: self.registry.total_connections(),
            },
            sessions: SessionsSection {
                count: sessions.len(),
                sessions,
            },
            system: SystemSection {
                version: env!("CARGO_PKG_VERSION"),
                pid: std::process::id(),
                started_at: self.started_at,
                uptime_secs: self.started.elapsed().as_secs(),
                auto_scaling: self.autoscaler.config().enabled,
                operators: self.operators(),
            },
        }
    }

    // ── Commands ───────────────────────────────────────────────────

    /// Handle one operator frame and produce the reply frame.
    pub async fn handle_text(&self, text: &str) -> Value {
        match parse_command(text) {
            Ok(command) => {
                let name = command.name();
                let result = self.execute(command).await;
                json!({ "type": "command-result", "command": name, "result": result })
            }
            Err(e) => {
                debug!(error = %e, "rejected operator frame");
                json!({ "type": "error", "error": e.to_string() })
            }
        }
    }

    async fn execute(&self, command: Command) -> Value {
        match command {
            Command::ScaleUp { count } => {
                let result = self.autoscaler.scale_up(count).await;
                info!(requested = count, created = result.instances.len(), "operator scale-up");
                with_success(result.error.is_none(), json!(result))
            }
            Command::ScaleDown { count } => {
                let result = self.autoscaler.scale_down(count);
                info!(requested = count, draining = result.instances.len(), "operator scale-down");
                with_success(result.error.is_none(), json!(result))
            }
            Command::SetStrategy(strategy) => {
                self.registry.set_strategy(strategy);
                with_success(true, json!({ "strategy": strategy }))
            }
            Command::RemoveInstance(id) => match self.autoscaler.remove_instance(&id).await {
                Some(instance) => {
                    info!(instance_id = %id, "instance removed by operator");
                    with_success(true, json!({ "instance": instance }))
                }
                None => with_success(false, json!({ "error": format!("Instance not found: {id}") })),
            },
        }
    }

    // ── Broadcaster ────────────────────────────────────────────────

    /// Compare against the last broadcast state and emit a delta if
    /// anything changed. Returns whether a frame was sent.
    fn broadcast_changes(&self, last: &mut DashboardState) -> bool {
        let next = self.snapshot();
        let Some(delta) = next.delta_from(last) else {
            return false;
        };
        *last = next;
        let frame = json!({
            "type": "state-delta",
            "data": delta,
            "timestamp": epoch_millis(),
        });
        // No receivers is fine; operators get a full state on connect.
        let _ = self.updates.send(frame.to_string());
        true
    }

    /// Emit deltas on every registry change and every broadcast interval.
    pub async fn run_broadcaster(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut revisions = self.registry.subscribe();
        let mut ticker = tokio::time::interval(self.broadcast_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last = self.snapshot();

        info!(interval = ?self.broadcast_interval, "dashboard broadcaster started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = revisions.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    info!("dashboard broadcaster shutting down");
                    return;
                }
            }
            self.broadcast_changes(&mut last);
        }
    }

    // ── Socket ─────────────────────────────────────────────────────

    async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let _operator = OperatorGuard::enter(&self.operators);
        let mut updates = self.updates.subscribe();
        let (mut sink, mut stream) = socket.split();
        info!(operators = self.operators(), "operator connected");

        if send(&mut sink, &self.initial_state()).await.is_err() {
            return;
        }

        loop {
            tokio::select! {
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = self.handle_text(text.as_str()).await;
                        if send(&mut sink, &reply).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(error = %e, "operator socket error");
                        break;
                    }
                    Some(Ok(_)) => {}
                },
                update = updates.recv() => match update {
                    Ok(frame) => {
                        if sink.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "operator lagging, resending full state");
                        if send(&mut sink, &self.initial_state()).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        info!("operator disconnected");
    }

    fn initial_state(&self) -> Value {
        json!({ "type": "initial-state", "data": self.snapshot() })
    }
}

fn with_success(success: bool, data: Value) -> Value {
    let mut result = match data {
        Value::Object(map) => map,
        other => {
            let mut map = serde_json::Map::new();
            map.insert("data".to_string(), other);
            map
        }
    };
    result.insert("success".to_string(), Value::Bool(success));
    Value::Object(result)
}

async fn dashboard_ws(
    ws: WebSocketUpgrade,
    State(dashboard): State<Arc<Dashboard>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| dashboard.handle_socket(socket))
}

async fn send(
    sink: &mut futures::stream::SplitSink<WebSocket, Message>,
    frame: &Value,
) -> Result<(), axum::Error> {
    sink.send(Message::Text(frame.to_string().into())).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_core::config::AutoScalingConfig;
    use switchyard_core::{InstanceMetadata, LoadBalancingStrategy, SessionClaims};

    fn dashboard(max_instances: usize) -> Arc<Dashboard> {
        let registry = Arc::new(InstanceRegistry::with_limits(max_instances, 10));
        let sessions = Arc::new(SessionStore::new(Duration::from_secs(60)));
        let autoscaler = Arc::new(Autoscaler::new(
            registry.clone(),
            AutoScalingConfig {
                min_instances: 0,
                retry_backoff: "1ms".to_string(),
                ..Default::default()
            },
        ));
        Arc::new(Dashboard::new(
            registry,
            sessions,
            autoscaler,
            Duration::from_millis(20),
        ))
    }

    #[test]
    fn snapshot_reflects_registry_and_sessions() {
        let dash = dashboard(5);
        dash.registry.create_instance(InstanceMetadata::new()).unwrap();
        dash.sessions
            .get_or_create_session(&SessionClaims::new("alice", None));

        let state = dash.snapshot();
        assert_eq!(state.registry.instances.len(), 1);
        assert_eq!(state.registry.max_instances, 5);
        assert_eq!(state.sessions.count, 1);
        assert_eq!(state.system.operators, 0);
    }

    #[tokio::test]
    async fn scale_up_command_respects_capacity() {
        let dash = dashboard(2);
        let reply = dash
            .handle_text(r#"{"type":"command","command":"scaleUp","params":{"count":3}}"#)
            .await;

        assert_eq!(reply["type"], "command-result");
        assert_eq!(reply["command"], "scaleUp");
        assert_eq!(reply["result"]["success"], false);
        assert_eq!(reply["result"]["instances"].as_array().unwrap().len(), 2);
        assert_eq!(dash.registry.len(), 2);
    }

    #[tokio::test]
    async fn set_strategy_command() {
        let dash = dashboard(2);
        let reply = dash
            .handle_text(r#"{"type":"command","command":"setStrategy","params":{"type":"roundRobin"}}"#)
            .await;
        assert_eq!(reply["result"]["success"], true);
        assert_eq!(reply["result"]["strategy"], "roundRobin");
        assert_eq!(dash.registry.strategy(), LoadBalancingStrategy::RoundRobin);
    }

    #[tokio::test]
    async fn remove_instance_command() {
        let dash = dashboard(2);
        let inst = dash.registry.create_instance(InstanceMetadata::new()).unwrap();

        let text = format!(
            r#"{{"type":"command","command":"removeInstance","params":{{"id":"{}"}}}}"#,
            inst.id
        );
        let reply = dash.handle_text(&text).await;
        assert_eq!(reply["result"]["success"], true);
        assert!(dash.registry.is_empty());

        let reply = dash.handle_text(&text).await;
        assert_eq!(reply["result"]["success"], false);
    }

    #[tokio::test]
    async fn bad_frames_get_error_replies() {
        let dash = dashboard(2);
        let reply = dash.handle_text("{not json").await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["error"], "Invalid message format");

        let reply = dash
            .handle_text(r#"{"type":"command","command":"selfDestruct"}"#)
            .await;
        assert_eq!(reply["error"], "Unknown command: selfDestruct");
    }

    #[test]
    fn broadcast_changes_sends_only_on_change() {
        let dash = dashboard(2);
        let mut rx = dash.subscribe();
        let mut last = dash.snapshot();

        assert!(!dash.broadcast_changes(&mut last));

        dash.registry.set_strategy(LoadBalancingStrategy::RoundRobin);
        assert!(dash.broadcast_changes(&mut last));

        let frame: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame["type"], "state-delta");
        assert!(frame["data"].get("registry").is_some());
        assert!(frame["data"].get("sessions").is_none());

        assert!(!dash.broadcast_changes(&mut last));
    }

    #[tokio::test]
    async fn broadcaster_pushes_registry_changes() {
        let dash = dashboard(2);
        let mut rx = dash.subscribe();
        let (tx, shutdown) = watch::channel(false);
        let task = tokio::spawn(dash.clone().run_broadcaster(shutdown));

        tokio::time::sleep(Duration::from_millis(30)).await;
        dash.registry.create_instance(InstanceMetadata::new()).unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let frame: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(frame["data"]["registry"]["instances"].as_array().unwrap().len(), 1);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
