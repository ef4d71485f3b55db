//! Upstream links from the router to instances.
//!
//! A link is a pair of channels: text frames sent on `outbound` reach the
//! instance, frames from the instance arrive on `inbound`. The connector
//! owns one task per direction, so a stalled reader never blocks the
//! writer. When either side goes away the shared cancellation token
//! fires and `inbound` closes.

use std::time::Duration;

use anyhow::{Context, anyhow};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use switchyard_core::{BoxFuture, Instance};

/// Buffered frames per direction.
const LINK_CAPACITY: usize = 64;

/// Upper bound on the closing handshake with an unresponsive instance.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Channels to one instance connection.
pub struct UpstreamLink {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

impl UpstreamLink {
    /// Create a link plus the instance-side ends of its channels.
    pub fn pair() -> (Self, mpsc::Receiver<String>, mpsc::Sender<String>) {
        let (out_tx, out_rx) = mpsc::channel(LINK_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(LINK_CAPACITY);
        (
            Self {
                outbound: out_tx,
                inbound: in_rx,
            },
            out_rx,
            in_tx,
        )
    }
}

/// Opens links to instances.
pub trait InstanceConnector: Send + Sync {
    /// Connect to `instance`. The link shuts down when `cancel` fires.
    fn connect<'a>(
        &'a self,
        instance: &'a Instance,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, anyhow::Result<UpstreamLink>>;
}

/// Connects to the instance's WebSocket endpoint.
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl InstanceConnector for WsConnector {
    fn connect<'a>(
        &'a self,
        instance: &'a Instance,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, anyhow::Result<UpstreamLink>> {
        Box::pin(async move {
            let endpoint = instance
                .endpoint
                .as_deref()
                .ok_or_else(|| anyhow!("instance {} has no endpoint", instance.id))?;

            let (ws, _) = tokio::time::timeout(self.connect_timeout, connect_async(endpoint))
                .await
                .with_context(|| format!("connect to {endpoint} timed out"))?
                .with_context(|| format!("connect to {endpoint} failed"))?;
            debug!(instance_id = %instance.id, %endpoint, "upstream connected");

            let (link, mut to_instance, from_instance) = UpstreamLink::pair();
            let (mut sink, mut stream) = ws.split();

            // Writer: router frames to the instance.
            let writer_cancel = cancel.clone();
            let instance_id = instance.id.clone();
            tokio::spawn(async move {
                loop {
                    let text = tokio::select! {
                        _ = writer_cancel.cancelled() => break,
                        out = to_instance.recv() => match out {
                            Some(text) => text,
                            None => break,
                        },
                    };
                    let sent = tokio::select! {
                        _ = writer_cancel.cancelled() => break,
                        sent = sink.send(Message::Text(text.into())) => sent,
                    };
                    if let Err(e) = sent {
                        warn!(%instance_id, error = %e, "upstream send failed");
                        break;
                    }
                }
                writer_cancel.cancel();
                let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.send(Message::Close(None))).await;
            });

            // Reader: instance frames back to the router.
            let instance_id = instance.id.clone();
            tokio::spawn(async move {
                loop {
                    let msg = tokio::select! {
                        _ = cancel.cancelled() => break,
                        msg = stream.next() => msg,
                    };
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            let queued = tokio::select! {
                                _ = cancel.cancelled() => break,
                                queued = from_instance.send(text.as_str().to_owned()) => queued,
                            };
                            if queued.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Binary(_))) => {
                            debug!(%instance_id, "binary frame from instance dropped");
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            debug!(%instance_id, error = %e, "upstream read failed");
                            break;
                        }
                        Some(Ok(_)) => {}
                    }
                }
                cancel.cancel();
                debug!(%instance_id, "upstream link closed");
            });

            Ok(link)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_core::{InstanceMetadata, InstanceStatus, ResourceUsage};

    fn inst(endpoint: Option<&str>) -> Instance {
        Instance {
            id: "inst-1".to_string(),
            status: InstanceStatus::Active,
            metadata: InstanceMetadata::new(),
            endpoint: endpoint.map(str::to_string),
            connections: 0,
            resource_usage: ResourceUsage::default(),
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn missing_endpoint_fails() {
        let connector = WsConnector::default();
        let Err(err) = connector.connect(&inst(None), CancellationToken::new()).await else {
            panic!("expected an error");
        };
        assert!(err.to_string().contains("no endpoint"));
    }

    #[tokio::test]
    async fn refused_endpoint_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = WsConnector::new(Duration::from_secs(2));
        let endpoint = format!("ws://{addr}/");
        let result = connector
            .connect(&inst(Some(&endpoint)), CancellationToken::new())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn pair_channels_are_connected() {
        let (mut link, mut to_instance, from_instance) = UpstreamLink::pair();
        link.outbound.send("hello".to_string()).await.unwrap();
        assert_eq!(to_instance.recv().await.as_deref(), Some("hello"));

        from_instance.send("world".to_string()).await.unwrap();
        assert_eq!(link.inbound.recv().await.as_deref(), Some("world"));

        drop(from_instance);
        assert!(link.inbound.recv().await.is_none());
    }
}
