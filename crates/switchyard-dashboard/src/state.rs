//! Dashboard state snapshots and deltas.

use serde::Serialize;
use serde_json::{Map, Value};

use switchyard_core::{Instance, LoadBalancingStrategy, Session};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySection {
    pub instances: Vec<Instance>,
    pub strategy: LoadBalancingStrategy,
    pub max_instances: usize,
    pub max_connections_per_instance: u32,
    pub total_connections: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionsSection {
    pub count: usize,
    pub sessions: Vec<Session>,
}

/// Process-level facts about the control plane itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSection {
    pub version: &'static str,
    pub pid: u32,
    /// Unix timestamp (milliseconds).
    pub started_at: u64,
    pub uptime_secs: u64,
    pub auto_scaling: bool,
    pub operators: usize,
}

impl SystemSection {
    /// Equal apart from the uptime clock.
    fn same_as(&self, other: &SystemSection) -> bool {
        SystemSection {
            uptime_secs: other.uptime_secs,
            ..self.clone()
        } == *other
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardState {
    pub registry: RegistrySection,
    pub sessions: SessionsSection,
    pub system: SystemSection,
}

impl DashboardState {
    /// Sections of `self` that differ from `previous`, or `None` when
    /// nothing changed.
    pub fn delta_from(&self, previous: &DashboardState) -> Option<Map<String, Value>> {
        let mut delta = Map::new();
        if self.registry != previous.registry {
            delta.insert("registry".to_string(), to_value(&self.registry));
        }
        if self.sessions != previous.sessions {
            delta.insert("sessions".to_string(), to_value(&self.sessions));
        }
        if !self.system.same_as(&previous.system) {
            delta.insert("system".to_string(), to_value(&self.system));
        }
        (!delta.is_empty()).then_some(delta)
    }
}

fn to_value<T: Serialize>(section: &T) -> Value {
    serde_json::to_value(section).unwrap_or(Value::Null)
}
