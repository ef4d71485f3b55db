//! switchyard.toml configuration parser.
//!
//! Every section is optional; missing keys fall back to the defaults
//! documented on each field. Durations are written as strings such as
//! `"500ms"`, `"30s"`, `"5m"` or `"1h"`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::LoadBalancingStrategy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchyardConfig {
    pub http: HttpConfig,
    pub registry: RegistryConfig,
    pub sessions: SessionsConfig,
    pub dashboard: DashboardConfig,
    pub auth: AuthConfig,
    pub usage: UsageConfig,
    pub provisioner: Option<ProvisionerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Hard cap on registered instances, in any status.
    pub max_instances: usize,
    /// An instance with this many connections is skipped by the balancer.
    pub max_connections_per_instance: u32,
    /// Initial balancing strategy; operators can switch it at runtime.
    pub strategy: LoadBalancingStrategy,
    pub auto_scaling: AutoScalingConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_instances: 10,
            max_connections_per_instance: 100,
            strategy: LoadBalancingStrategy::LeastConnections,
            auto_scaling: AutoScalingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoScalingConfig {
    pub enabled: bool,
    /// Scale-down never goes below this many instances.
    pub min_instances: usize,
    /// Evaluation tick period.
    pub interval: String,
    /// CPU percent at or above which an instance counts as hot.
    pub cpu_threshold: f64,
    /// Memory percent at or above which an instance counts as hot.
    pub memory_threshold: f64,
    /// Fraction of `max_connections_per_instance` that counts as hot.
    pub connection_ratio: f64,
    /// CPU percent below which an instance with no connections is idle.
    pub idle_cpu_threshold: f64,
    /// How long an instance must stay idle before it is drained.
    pub idle_grace: String,
    /// Upper bound on how long a draining instance keeps its connections.
    pub drain_timeout: String,
    pub max_create_retries: u32,
    /// First retry delay; doubles on each further attempt.
    pub retry_backoff: String,
}

impl Default for AutoScalingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_instances: 1,
            interval: "10s".to_string(),
            cpu_threshold: 80.0,
            memory_threshold: 85.0,
            connection_ratio: 0.9,
            idle_cpu_threshold: 10.0,
            idle_grace: "5m".to_string(),
            drain_timeout: "60s".to_string(),
            max_create_retries: 3,
            retry_backoff: "500ms".to_string(),
        }
    }
}

impl AutoScalingConfig {
    pub fn interval(&self) -> Duration {
        parse_duration(&self.interval).unwrap_or(Duration::from_secs(10))
    }

    pub fn idle_grace(&self) -> Duration {
        parse_duration(&self.idle_grace).unwrap_or(Duration::from_secs(300))
    }

    pub fn drain_timeout(&self) -> Duration {
        parse_duration(&self.drain_timeout).unwrap_or(Duration::from_secs(60))
    }

    pub fn retry_backoff(&self) -> Duration {
        parse_duration(&self.retry_backoff).unwrap_or(Duration::from_millis(500))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub ttl: String,
    /// Record session lifecycle events in a redb file at `path`.
    pub persist_sessions: bool,
    pub path: PathBuf,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            ttl: "1h".to_string(),
            persist_sessions: false,
            path: PathBuf::from("switchyard-sessions.redb"),
        }
    }
}

impl SessionsConfig {
    pub fn ttl(&self) -> Duration {
        parse_duration(&self.ttl).unwrap_or(Duration::from_secs(3600))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    pub enabled: bool,
    /// When equal to `http.port` the dashboard shares the main listener.
    pub port: u16,
    /// Period of the state-delta broadcast.
    pub broadcast_interval: String,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 3001,
            broadcast_interval: "2s".to_string(),
        }
    }
}

impl DashboardConfig {
    pub fn broadcast_interval(&self) -> Duration {
        parse_duration(&self.broadcast_interval).unwrap_or(Duration::from_secs(2))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub tokens: Vec<StaticToken>,
}

/// One accepted bearer token and the identity it maps to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticToken {
    pub token: String,
    pub user_id: String,
    #[serde(default)]
    pub organization_id: Option<String>,
}

/// Poll-based usage ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageConfig {
    pub enabled: bool,
    /// HTTP path on the instance host that returns a resource usage report.
    pub path: String,
    pub interval: String,
    pub timeout: String,
    /// Consecutive failed polls before an instance is marked as errored.
    pub unhealthy_threshold: u32,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "/usage".to_string(),
            interval: "10s".to_string(),
            timeout: "2s".to_string(),
            unhealthy_threshold: 3,
        }
    }
}

impl UsageConfig {
    pub fn interval(&self) -> Duration {
        parse_duration(&self.interval).unwrap_or(Duration::from_secs(10))
    }

    pub fn timeout(&self) -> Duration {
        parse_duration(&self.timeout).unwrap_or(Duration::from_secs(2))
    }
}

/// How new instances come into existence during scale-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProvisionerConfig {
    /// Hand out endpoints of workers that are already running.
    Static { endpoints: Vec<String> },
    /// Spawn one worker process per instance.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        /// First port handed to a spawned worker; later workers count up.
        base_port: u16,
        /// Endpoint URL with a `{port}` placeholder.
        #[serde(default = "default_endpoint_template")]
        endpoint_template: String,
        /// Time allowed for the worker to start accepting connections.
        #[serde(default = "default_startup_timeout")]
        startup_timeout: String,
    },
}

fn default_endpoint_template() -> String {
    "ws://127.0.0.1:{port}".to_string()
}

fn default_startup_timeout() -> String {
    "10s".to_string()
}

impl SwitchyardConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SwitchyardConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject settings that would make the registry unusable.
    pub fn validate(&self) -> anyhow::Result<()> {
        let registry = &self.registry;
        if registry.max_instances == 0 {
            anyhow::bail!("registry.max_instances must be at least 1");
        }
        if registry.max_connections_per_instance == 0 {
            anyhow::bail!("registry.max_connections_per_instance must be at least 1");
        }
        if registry.auto_scaling.min_instances > registry.max_instances {
            anyhow::bail!(
                "registry.auto_scaling.min_instances ({}) exceeds max_instances ({})",
                registry.auto_scaling.min_instances,
                registry.max_instances
            );
        }
        let scaling = &registry.auto_scaling;
        positive("sessions.ttl", &self.sessions.ttl)?;
        positive("registry.auto_scaling.interval", &scaling.interval)?;
        parseable("registry.auto_scaling.idle_grace", &scaling.idle_grace)?;
        parseable("registry.auto_scaling.drain_timeout", &scaling.drain_timeout)?;
        parseable("registry.auto_scaling.retry_backoff", &scaling.retry_backoff)?;
        positive("dashboard.broadcast_interval", &self.dashboard.broadcast_interval)?;
        positive("usage.interval", &self.usage.interval)?;
        positive("usage.timeout", &self.usage.timeout)?;
        Ok(())
    }
}

/// Periodic tasks tick on these values; zero would panic the ticker.
fn positive(key: &str, value: &str) -> anyhow::Result<()> {
    if parse_duration(value).is_none_or(|d| d.is_zero()) {
        anyhow::bail!("{key} must be a positive duration, got {value:?}");
    }
    Ok(())
}

fn parseable(key: &str, value: &str) -> anyhow::Result<()> {
    if parse_duration(value).is_none() {
        anyhow::bail!("{key} is not a duration, got {value:?}");
    }
    Ok(())
}

/// Parse a duration string like "500ms", "30s", "5m", "1h".
///
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
