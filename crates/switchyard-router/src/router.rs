//! ConnectionRouter — the `/mcp-router` WebSocket front door.
//!
//! Per connection:
//!
//! ```text
//! upgrade ─► ack {connection} ─► validate token ─► resolve session
//!         ─► bind instance (sticky, else balancer, one retry)
//!         ─► open upstream ─► ack {routing} ─► proxy frames
//!         ─► release binding + detach from session
//! ```
//!
//! Frames flow in two directions at once: client to instance, and
//! instance (plus local replies) to client. Both directions and the
//! upstream link share a `CancellationToken`; whichever closes first
//! stops the others. A frame that cannot be queued within the stall
//! timeout closes the connection instead of blocking it forever.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use switchyard_core::auth::parse_bearer;
use switchyard_core::{
    ConnectionInfo, Instance, RoutingContext, Session, TokenValidator, epoch_millis,
};
use switchyard_registry::{InstanceRegistry, RegistryError, RegistryResult};
use switchyard_sessions::SessionStore;

use crate::connections::ConnectionTable;
use crate::frames::{
    AUTHENTICATION_FAILED, ClientFrame, INSTANCE_UNAVAILABLE, INVALID_MESSAGE_FORMAT,
    NO_INSTANCES_AVAILABLE, ServerFrame, UNKNOWN_MESSAGE_TYPE, classify,
};
use crate::upstream::{InstanceConnector, UpstreamLink, WsConnector};

/// Route path for client connections.
pub const ROUTER_PATH: &str = "/mcp-router";

/// Local replies (pong, errors) queued for the client.
const REPLY_CAPACITY: usize = 16;

type ClientSink = SplitSink<WebSocket, Message>;
type ClientStream = SplitStream<WebSocket>;

/// Accepts client WebSockets and binds each to an instance.
pub struct ConnectionRouter {
    registry: Arc<InstanceRegistry>,
    sessions: Arc<SessionStore>,
    validator: Arc<dyn TokenValidator>,
    connector: Arc<dyn InstanceConnector>,
    connections: Arc<ConnectionTable>,
    retry_delay: Duration,
    stall_timeout: Duration,
}

impl ConnectionRouter {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        sessions: Arc<SessionStore>,
        validator: Arc<dyn TokenValidator>,
    ) -> Self {
        Self {
            registry,
            sessions,
            validator,
            connector: Arc::new(WsConnector::default()),
            connections: Arc::new(ConnectionTable::new()),
            retry_delay: Duration::from_millis(250),
            stall_timeout: Duration::from_secs(10),
        }
    }

    /// Replace how upstream links are opened.
    pub fn with_connector(mut self, connector: Arc<dyn InstanceConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// Delay before the single retry when no instance is available.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// How long a frame may wait for room in a full channel before the
    /// connection is closed.
    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    /// Live routed connections, shared with the REST surface.
    pub fn connections(&self) -> Arc<ConnectionTable> {
        self.connections.clone()
    }

    /// Axum routes serving [`ROUTER_PATH`].
    pub fn routes(self: Arc<Self>) -> Router {
        Router::new()
            .route(ROUTER_PATH, get(ws_handler))
            .with_state(self)
    }

    // ── Per-connection flow ────────────────────────────────────────

    async fn handle_socket(self: Arc<Self>, socket: WebSocket, token: String) {
        let connection_id = format!("conn-{}", Uuid::new_v4());
        let (mut sink, mut stream) = socket.split();

        if send(&mut sink, &ServerFrame::connected(&connection_id)).await.is_err() {
            return;
        }

        let claims = match self.validator.validate(&token).await {
            Ok(claims) => claims,
            Err(e) => {
                warn!(%connection_id, error = %e, "authentication failed");
                reject(&mut sink, AUTHENTICATION_FAILED).await;
                return;
            }
        };

        let session = self.sessions.get_or_create_session(&claims);
        let context = RoutingContext {
            session_id: Some(session.id.clone()),
            user_id: Some(claims.user_id.clone()),
        };

        let instance = match self.bind(&session, &context, &connection_id).await {
            Ok(instance) => instance,
            Err(e) => {
                warn!(%connection_id, session_id = %session.id, error = %e, "no instance for connection");
                reject(&mut sink, NO_INSTANCES_AVAILABLE).await;
                return;
            }
        };

        self.sessions.set_sticky_instance(&session.id, &instance.id);
        self.sessions.add_connection(&session.id, &connection_id);
        self.connections.insert(ConnectionInfo {
            id: connection_id.clone(),
            session_id: session.id.clone(),
            instance_id: instance.id.clone(),
            opened_at: epoch_millis(),
        });

        let cancel = CancellationToken::new();
        let link = match self.connector.connect(&instance, cancel.clone()).await {
            Ok(link) => link,
            Err(e) => {
                warn!(%connection_id, instance_id = %instance.id, error = %e, "upstream connect failed");
                self.release(&instance.id, &session.id, &connection_id);
                reject(&mut sink, INSTANCE_UNAVAILABLE).await;
                return;
            }
        };

        if send(&mut sink, &ServerFrame::routed(&instance.id, &connection_id))
            .await
            .is_ok()
        {
            info!(
                %connection_id,
                session_id = %session.id,
                user_id = %claims.user_id,
                instance_id = %instance.id,
                "connection routed"
            );
            proxy(&mut sink, &mut stream, link, &cancel, self.stall_timeout).await;
        }

        cancel.cancel();
        self.release(&instance.id, &session.id, &connection_id);
        let _ = tokio::time::timeout(self.stall_timeout, sink.send(Message::Close(None))).await;
    }

    /// Bind the connection to the session's sticky instance if it can
    /// take it, otherwise to whatever the balancer picks. A pool with no
    /// eligible instance gets one retry after `retry_delay`.
    async fn bind(
        &self,
        session: &Session,
        context: &RoutingContext,
        connection_id: &str,
    ) -> RegistryResult<Instance> {
        if let Some(sticky) = &session.metadata.sticky_instance {
            match self.registry.bind_connection(sticky, connection_id) {
                Ok(instance) => {
                    debug!(%connection_id, instance_id = %sticky, "sticky instance reused");
                    return Ok(instance);
                }
                Err(e) => debug!(%connection_id, instance_id = %sticky, error = %e, "sticky instance skipped"),
            }
        }

        match self.registry.route_connection(context, connection_id) {
            Err(RegistryError::NoAvailableInstance) => {
                debug!(%connection_id, delay_ms = self.retry_delay.as_millis() as u64, "no instance available, retrying");
                tokio::time::sleep(self.retry_delay).await;
                self.registry.route_connection(context, connection_id)
            }
            other => other,
        }
    }

    fn release(&self, instance_id: &str, session_id: &str, connection_id: &str) {
        self.registry.release_connection(instance_id, connection_id);
        self.sessions.remove_connection(session_id, connection_id);
        self.connections.remove(connection_id);
        info!(%connection_id, %instance_id, "connection closed");
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(router): State<Arc<ConnectionRouter>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let token = bearer_token(&headers, &params).unwrap_or_default();
    ws.on_upgrade(move |socket| router.handle_socket(socket, token))
}

/// Token from `Authorization: Bearer …`, falling back to `?token=`.
fn bearer_token(headers: &HeaderMap, params: &HashMap<String, String>) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_bearer)
        .map(str::to_string)
        .or_else(|| params.get("token").cloned())
}

/// Shuttle frames both ways until either side closes.
async fn proxy(
    sink: &mut ClientSink,
    stream: &mut ClientStream,
    link: UpstreamLink,
    cancel: &CancellationToken,
    stall: Duration,
) {
    let UpstreamLink { outbound, inbound } = link;
    let (reply_tx, reply_rx) = mpsc::channel(REPLY_CAPACITY);
    tokio::join!(
        client_to_instance(stream, outbound, reply_tx, cancel, stall),
        to_client(sink, inbound, reply_rx, cancel),
    );
}

/// Read client frames. Requests go upstream; pings and bad frames are
/// answered locally through `replies`.
async fn client_to_instance(
    stream: &mut ClientStream,
    outbound: mpsc::Sender<String>,
    replies: mpsc::Sender<ServerFrame>,
    cancel: &CancellationToken,
    stall: Duration,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = stream.next() => msg,
        };
        let reply = match msg {
            Some(Ok(Message::Text(text))) => match classify(text.as_str()) {
                ClientFrame::Forward => {
                    if !forward(&outbound, text.as_str().to_owned(), cancel, stall).await {
                        break;
                    }
                    continue;
                }
                ClientFrame::Ping => ServerFrame::Pong,
                ClientFrame::Invalid => ServerFrame::error(INVALID_MESSAGE_FORMAT),
                ClientFrame::Unknown => ServerFrame::error(UNKNOWN_MESSAGE_TYPE),
            },
            Some(Ok(Message::Binary(_))) => ServerFrame::error(INVALID_MESSAGE_FORMAT),
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                debug!(error = %e, "client read failed");
                break;
            }
            // Ping/pong are answered by axum.
            Some(Ok(_)) => continue,
        };
        if !forward(&replies, reply, cancel, stall).await {
            break;
        }
    }
    cancel.cancel();
}

/// Write instance frames and local replies to the client.
async fn to_client(
    sink: &mut ClientSink,
    mut inbound: mpsc::Receiver<String>,
    mut replies: mpsc::Receiver<ServerFrame>,
    cancel: &CancellationToken,
) {
    loop {
        let text = tokio::select! {
            _ = cancel.cancelled() => break,
            Some(frame) = replies.recv() => frame.to_json(),
            up = inbound.recv() => match up {
                Some(text) => text,
                None => {
                    debug!("upstream closed");
                    break;
                }
            },
        };
        let sent = tokio::select! {
            _ = cancel.cancelled() => break,
            sent = sink.send(Message::Text(text.into())) => sent,
        };
        if sent.is_err() {
            break;
        }
    }
    cancel.cancel();
}

/// Queue `item` on a bounded channel. Returns false when `cancel` fires,
/// the receiver is gone, or no room opens up within `stall`.
async fn forward<T>(
    tx: &mpsc::Sender<T>,
    item: T,
    cancel: &CancellationToken,
    stall: Duration,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tokio::time::timeout(stall, tx.send(item)) => match sent {
            Ok(Ok(())) => true,
            Ok(Err(_)) => false,
            Err(_) => {
                warn!(stall_ms = stall.as_millis() as u64, "peer stopped reading, closing connection");
                false
            }
        },
    }
}

async fn send(sink: &mut ClientSink, frame: &ServerFrame) -> Result<(), axum::Error> {
    sink.send(Message::Text(frame.to_json().into())).await
}

/// Send an error frame and close.
async fn reject(sink: &mut ClientSink, error: &'static str) {
    let _ = send(sink, &ServerFrame::error(error)).await;
    let _ = sink.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_core::{BoxFuture, InstanceMetadata, SessionClaims, StaticTokenValidator};

    fn router(max_instances: usize) -> ConnectionRouter {
        ConnectionRouter::new(
            Arc::new(InstanceRegistry::with_limits(max_instances, 10)),
            Arc::new(SessionStore::new(Duration::from_secs(60))),
            Arc::new(StaticTokenValidator::new()),
        )
        .with_retry_delay(Duration::from_millis(50))
    }

    #[test]
    fn bearer_header_wins_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer header-token".parse().unwrap());
        let mut params = HashMap::new();
        params.insert("token".to_string(), "query-token".to_string());

        assert_eq!(bearer_token(&headers, &params).as_deref(), Some("header-token"));
        assert_eq!(
            bearer_token(&HeaderMap::new(), &params).as_deref(),
            Some("query-token")
        );
        assert_eq!(bearer_token(&HeaderMap::new(), &HashMap::new()), None);
    }

    #[tokio::test]
    async fn bind_prefers_sticky_instance() {
        let r = router(3);
        let a = r.registry.create_instance(InstanceMetadata::new()).unwrap();
        let b = r.registry.create_instance(InstanceMetadata::new()).unwrap();
        // Make `b` the busier one so the balancer alone would pick `a`.
        r.registry.bind_connection(&b.id, "other").unwrap();
        assert_eq!(
            r.registry.get_instance_for_connection(&RoutingContext::default()).unwrap().id,
            a.id
        );

        let session = r.sessions.get_or_create_session(&SessionClaims::new("alice", None));
        r.sessions.set_sticky_instance(&session.id, &b.id);
        let session = r.sessions.get_session(&session.id).unwrap();

        let bound = r.bind(&session, &RoutingContext::default(), "c1").await.unwrap();
        assert_eq!(bound.id, b.id);
        assert_eq!(r.registry.connection_count(&b.id), Some(2));
    }

    #[tokio::test]
    async fn bind_falls_back_when_sticky_unusable() {
        let r = router(3);
        let a = r.registry.create_instance(InstanceMetadata::new()).unwrap();
        let b = r.registry.create_instance(InstanceMetadata::new()).unwrap();
        r.registry.mark_draining(&b.id).unwrap();

        let session = r.sessions.get_or_create_session(&SessionClaims::new("alice", None));
        r.sessions.set_sticky_instance(&session.id, &b.id);
        let session = r.sessions.get_session(&session.id).unwrap();

        let bound = r.bind(&session, &RoutingContext::default(), "c1").await.unwrap();
        assert_eq!(bound.id, a.id);
    }

    #[tokio::test]
    async fn bind_retries_once_after_delay() {
        let r = Arc::new(router(3));
        let session = r.sessions.get_or_create_session(&SessionClaims::new("alice", None));

        let registry = r.registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            registry.create_instance(InstanceMetadata::new()).unwrap();
        });

        let bound = r.bind(&session, &RoutingContext::default(), "c1").await.unwrap();
        assert_eq!(bound.connections, 1);
    }

    #[tokio::test]
    async fn bind_gives_up_after_retry() {
        let r = router(3);
        let session = r.sessions.get_or_create_session(&SessionClaims::new("alice", None));
        assert_eq!(
            r.bind(&session, &RoutingContext::default(), "c1").await.unwrap_err(),
            RegistryError::NoAvailableInstance
        );
    }

    /// Hands out links whose instance side is held open but never read.
    #[derive(Default)]
    struct StalledConnector {
        held: parking_lot::Mutex<Vec<(mpsc::Receiver<String>, mpsc::Sender<String>)>>,
    }

    impl InstanceConnector for StalledConnector {
        fn connect<'a>(
            &'a self,
            _instance: &'a Instance,
            _cancel: CancellationToken,
        ) -> BoxFuture<'a, anyhow::Result<UpstreamLink>> {
            Box::pin(async move {
                let (link, to_instance, from_instance) = UpstreamLink::pair();
                self.held.lock().push((to_instance, from_instance));
                Ok(link)
            })
        }
    }

    #[tokio::test]
    async fn client_close_releases_connection_when_instance_stalls() {
        use tokio_tungstenite::tungstenite::Message as WsMessage;

        let registry = Arc::new(InstanceRegistry::with_limits(1, 10));
        let instance = registry.create_instance(InstanceMetadata::new()).unwrap();
        let validator =
            StaticTokenValidator::new().with_token("tok", SessionClaims::new("alice", None));
        let router = Arc::new(
            ConnectionRouter::new(
                registry.clone(),
                Arc::new(SessionStore::new(Duration::from_secs(60))),
                Arc::new(validator),
            )
            .with_connector(Arc::new(StalledConnector::default()))
            .with_stall_timeout(Duration::from_millis(200)),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router.routes()).await.unwrap() });

        let (mut ws, _) =
            tokio_tungstenite::connect_async(format!("ws://{addr}{ROUTER_PATH}?token=tok"))
                .await
                .unwrap();
        // connection ack, then routing ack
        for _ in 0..2 {
            ws.next().await.unwrap().unwrap();
        }
        assert_eq!(registry.connection_count(&instance.id), Some(1));

        // More requests than the link buffers, then hang up.
        for id in 0..100 {
            let frame = serde_json::json!({"type": "request", "id": id}).to_string();
            let _ = ws.send(WsMessage::Text(frame.into())).await;
        }
        let _ = ws.close(None).await;

        tokio::time::timeout(Duration::from_secs(3), async {
            while registry.connection_count(&instance.id) != Some(0) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("connection was never released");
    }

    #[tokio::test]
    async fn forward_gives_up_on_stall_or_cancel() {
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let stall = Duration::from_millis(50);

        assert!(forward(&tx, 1, &cancel, stall).await);
        // Full channel nobody drains.
        assert!(!forward(&tx, 2, &cancel, stall).await);

        cancel.cancel();
        let (tx, _rx) = mpsc::channel(1);
        assert!(!forward(&tx, 3, &cancel, Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn release_unwinds_every_record() {
        let r = router(1);
        let a = r.registry.create_instance(InstanceMetadata::new()).unwrap();
        let session = r.sessions.get_or_create_session(&SessionClaims::new("alice", None));
        r.registry.bind_connection(&a.id, "c1").unwrap();
        r.sessions.add_connection(&session.id, "c1");
        r.connections.insert(ConnectionInfo {
            id: "c1".to_string(),
            session_id: session.id.clone(),
            instance_id: a.id.clone(),
            opened_at: 1,
        });

        r.release(&a.id, &session.id, "c1");
        r.release(&a.id, &session.id, "c1");
        assert_eq!(r.registry.connection_count(&a.id), Some(0));
        assert!(r.sessions.get_session(&session.id).unwrap().connections.is_empty());
        assert!(r.connections.is_empty());
    }
}
