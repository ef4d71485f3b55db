//! Shared domain types used across Switchyard crates.
//!
//! Everything here crosses a crate boundary or the wire. Wire-facing
//! structs serialize with camelCase field names so dashboard and router
//! frames match what browser clients expect.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Unique identifier for a backend instance.
pub type InstanceId = String;

/// Unique identifier for a client session.
pub type SessionId = String;

/// Unique identifier for a live client connection.
pub type ConnectionId = String;

/// Free-form tags attached to an instance at creation.
pub type InstanceMetadata = HashMap<String, String>;

/// Metadata tag that carries a worker's WebSocket endpoint.
pub const ENDPOINT_TAG: &str = "endpoint";

// ── Instance ───────────────────────────────────────────────────────

/// Lifecycle status of a backend instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Slot reserved, worker still launching.
    Provisioning,
    /// Accepting new connections.
    Active,
    /// Finishing existing connections, refusing new ones.
    Draining,
    /// Failed health or usage reporting. Never routed to.
    Error,
    /// Detached from the registry.
    Removed,
}

impl InstanceStatus {
    /// Whether new connections may be routed to an instance in this status.
    pub fn is_routable(self) -> bool {
        self == InstanceStatus::Active
    }

    /// Live means the instance still exists and is not failed.
    pub fn is_live(self) -> bool {
        !matches!(self, InstanceStatus::Error | InstanceStatus::Removed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Provisioning => "provisioning",
            InstanceStatus::Active => "active",
            InstanceStatus::Draining => "draining",
            InstanceStatus::Error => "error",
            InstanceStatus::Removed => "removed",
        }
    }
}

/// Latest resource usage reported by (or polled from) an instance.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceUsage {
    /// CPU utilisation in percent (0–100).
    pub cpu: f64,
    /// Memory utilisation in percent (0–100).
    pub memory: f64,
    /// Connections as seen by the instance itself.
    pub connections: u32,
    /// Messages per second handled by the instance.
    pub throughput: f64,
}

/// A managed backend worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: InstanceId,
    pub status: InstanceStatus,
    pub metadata: InstanceMetadata,
    /// WebSocket URL the router forwards client traffic to.
    pub endpoint: Option<String>,
    /// Client connections currently bound to this instance.
    pub connections: u32,
    pub resource_usage: ResourceUsage,
    /// Unix timestamp (milliseconds) when the instance was created.
    pub created_at: u64,
}

// ── Session ────────────────────────────────────────────────────────

/// Identity claims produced by a successful token validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionClaims {
    pub user_id: String,
    #[serde(default)]
    pub organization_id: Option<String>,
}

impl SessionClaims {
    pub fn new(user_id: impl Into<String>, organization_id: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            organization_id,
        }
    }
}

/// Mutable per-session attributes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    /// Instance this session prefers for new connections.
    pub sticky_instance: Option<InstanceId>,
}

/// A TTL-bounded identity binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub user_id: String,
    pub organization_id: Option<String>,
    pub connections: Vec<ConnectionId>,
    pub metadata: SessionMetadata,
    /// Unix timestamp (milliseconds).
    pub created_at: u64,
    /// Unix timestamp (milliseconds) after which the session is gone.
    pub expires_at: u64,
}

impl Session {
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }

    /// Whether this session belongs to the identity in `claims`.
    pub fn matches(&self, claims: &SessionClaims) -> bool {
        self.user_id == claims.user_id && self.organization_id == claims.organization_id
    }
}

// ── Connection ─────────────────────────────────────────────────────

/// A live routed client connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub session_id: SessionId,
    pub instance_id: InstanceId,
    /// Unix timestamp (milliseconds).
    pub opened_at: u64,
}

/// Who is asking for an instance. Carried into selection for logging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingContext {
    pub session_id: Option<SessionId>,
    pub user_id: Option<String>,
}

// ── Load balancing ─────────────────────────────────────────────────

/// How the registry picks an instance for a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LoadBalancingStrategy {
    #[default]
    LeastConnections,
    RoundRobin,
}

impl LoadBalancingStrategy {
    /// Parse the wire name (`leastConnections`, `roundRobin`).
    ///
    /// Snake case spellings are accepted as well so TOML and CLI input
    /// can use either form.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "leastConnections" | "least_connections" | "least-connections" => {
                Some(LoadBalancingStrategy::LeastConnections)
            }
            "roundRobin" | "round_robin" | "round-robin" => Some(LoadBalancingStrategy::RoundRobin),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LoadBalancingStrategy::LeastConnections => "leastConnections",
            LoadBalancingStrategy::RoundRobin => "roundRobin",
        }
    }
}

/// The `host:port` part of an endpoint URL such as `ws://10.0.0.1:9000/mcp`.
pub fn endpoint_authority(endpoint: &str) -> Option<&str> {
    let rest = endpoint
        .split_once("://")
        .map_or(endpoint, |(_, rest)| rest);
    let authority = rest.split(['/', '?']).next()?;
    (!authority.is_empty()).then_some(authority)
}

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
