//! Provisioners bring worker processes into existence for new instances.
//!
//! The autoscaler reserves a registry slot, asks the provisioner to
//! launch a worker for it, then activates the slot with the endpoint the
//! provisioner returns. After removal it asks the provisioner to tear the
//! worker down.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use switchyard_core::config::ProvisionerConfig;
use switchyard_core::{BoxFuture, Instance, InstanceId, endpoint_authority, parse_duration};

/// Launches and terminates workers for registry instances.
pub trait Provisioner: Send + Sync {
    /// Start a worker for `instance` and return its WebSocket endpoint.
    fn launch<'a>(&'a self, instance: &'a Instance) -> BoxFuture<'a, anyhow::Result<String>>;

    /// Stop the worker backing `instance`. Unknown instances are a no-op.
    fn terminate<'a>(&'a self, instance: &'a Instance) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// Build the provisioner described by the `[provisioner]` section.
pub fn from_config(config: &ProvisionerConfig) -> anyhow::Result<Arc<dyn Provisioner>> {
    match config {
        ProvisionerConfig::Static { endpoints } => {
            if endpoints.is_empty() {
                bail!("static provisioner needs at least one endpoint");
            }
            Ok(Arc::new(StaticProvisioner::new(endpoints.clone())))
        }
        ProvisionerConfig::Command {
            program,
            args,
            base_port,
            endpoint_template,
            startup_timeout,
        } => {
            let timeout = parse_duration(startup_timeout)
                .with_context(|| format!("invalid startup_timeout {startup_timeout:?}"))?;
            Ok(Arc::new(
                CommandProvisioner::new(program, *base_port)
                    .with_args(args.clone())
                    .with_endpoint_template(endpoint_template)
                    .with_startup_timeout(timeout),
            ))
        }
    }
}

// ── Static ─────────────────────────────────────────────────────────

/// Hands out endpoints of workers that are already running.
///
/// Each endpoint backs at most one instance at a time.
pub struct StaticProvisioner {
    endpoints: Vec<String>,
    assigned: Mutex<HashMap<InstanceId, String>>,
}

impl StaticProvisioner {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            assigned: Mutex::new(HashMap::new()),
        }
    }

    /// Endpoints not currently assigned to an instance.
    pub fn available(&self) -> usize {
        self.endpoints.len() - self.assigned.lock().len()
    }
}

impl Provisioner for StaticProvisioner {
    fn launch<'a>(&'a self, instance: &'a Instance) -> BoxFuture<'a, anyhow::Result<String>> {
        Box::pin(async move {
            let mut assigned = self.assigned.lock();
            let free = self
                .endpoints
                .iter()
                .find(|ep| !assigned.values().any(|used| used == *ep))
                .cloned();
            match free {
                Some(endpoint) => {
                    assigned.insert(instance.id.clone(), endpoint.clone());
                    debug!(instance_id = %instance.id, %endpoint, "static endpoint assigned");
                    Ok(endpoint)
                }
                None => bail!("all {} static endpoints are in use", self.endpoints.len()),
            }
        })
    }

    fn terminate<'a>(&'a self, instance: &'a Instance) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            if let Some(endpoint) = self.assigned.lock().remove(&instance.id) {
                debug!(instance_id = %instance.id, %endpoint, "static endpoint released");
            }
            Ok(())
        })
    }
}

// ── Command ────────────────────────────────────────────────────────

/// A worker slot. The port is held from reservation on; `child` is set
/// once the process has spawned.
struct Worker {
    port: u16,
    child: Option<Child>,
}

/// Spawns one worker process per instance.
///
/// The worker receives `PORT` and `SWITCHYARD_INSTANCE_ID` in its
/// environment and must accept TCP connections on that port within the
/// startup timeout.
pub struct CommandProvisioner {
    program: String,
    args: Vec<String>,
    base_port: u16,
    endpoint_template: String,
    startup_timeout: Duration,
    workers: Mutex<HashMap<InstanceId, Worker>>,
}

impl CommandProvisioner {
    pub fn new(program: impl Into<String>, base_port: u16) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            base_port,
            endpoint_template: "ws://127.0.0.1:{port}".to_string(),
            startup_timeout: Duration::from_secs(10),
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_endpoint_template(mut self, template: &str) -> Self {
        self.endpoint_template = template.to_string();
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Number of worker processes currently owned.
    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Claim the lowest port at or above `base_port` not held by another
    /// worker. Choosing and recording happen under one lock so concurrent
    /// launches never share a port.
    fn reserve_port(&self, instance_id: &str) -> anyhow::Result<u16> {
        let mut workers = self.workers.lock();
        let port = (self.base_port..=u16::MAX)
            .find(|p| !workers.values().any(|w| w.port == *p))
            .context("no free worker port")?;
        workers.insert(instance_id.to_string(), Worker { port, child: None });
        Ok(port)
    }

    async fn wait_ready(&self, instance_id: &str, authority: &str) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + self.startup_timeout;
        loop {
            if TcpStream::connect(authority).await.is_ok() {
                return Ok(());
            }

            let exited = {
                let mut workers = self.workers.lock();
                match workers.get_mut(instance_id).and_then(|w| w.child.as_mut()) {
                    Some(child) => child.try_wait()?,
                    None => bail!("worker for {instance_id} was terminated during startup"),
                }
            };
            if let Some(status) = exited {
                bail!("worker exited before accepting connections ({status})");
            }

            if tokio::time::Instant::now() >= deadline {
                bail!(
                    "worker did not accept connections on {authority} within {:?}",
                    self.startup_timeout
                );
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// Substitute `{port}` in an endpoint template.
pub fn render_endpoint(template: &str, port: u16) -> String {
    template.replace("{port}", &port.to_string())
}

impl Provisioner for CommandProvisioner {
    fn launch<'a>(&'a self, instance: &'a Instance) -> BoxFuture<'a, anyhow::Result<String>> {
        Box::pin(async move {
            let port = self.reserve_port(&instance.id)?;
            let endpoint = render_endpoint(&self.endpoint_template, port);
            let spawned = endpoint_authority(&endpoint)
                .with_context(|| format!("endpoint {endpoint:?} has no host"))
                .and_then(|authority| {
                    let child = Command::new(&self.program)
                        .args(&self.args)
                        .env("PORT", port.to_string())
                        .env("SWITCHYARD_INSTANCE_ID", &instance.id)
                        .stdin(Stdio::null())
                        .kill_on_drop(true)
                        .spawn()
                        .with_context(|| format!("failed to spawn {}", self.program))?;
                    Ok((authority.to_string(), child))
                });
            let (authority, child) = match spawned {
                Ok(spawned) => spawned,
                Err(e) => {
                    self.workers.lock().remove(&instance.id);
                    return Err(e);
                }
            };

            info!(
                instance_id = %instance.id,
                program = %self.program,
                pid = child.id().unwrap_or_default(),
                port,
                "worker spawned"
            );
            if let Some(worker) = self.workers.lock().get_mut(&instance.id) {
                worker.child = Some(child);
            }

            if let Err(e) = self.wait_ready(&instance.id, &authority).await {
                // Dropping the child kills it.
                self.workers.lock().remove(&instance.id);
                warn!(instance_id = %instance.id, error = %e, "worker failed to start");
                return Err(e);
            }

            Ok(endpoint)
        })
    }

    fn terminate<'a>(&'a self, instance: &'a Instance) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let worker = self.workers.lock().remove(&instance.id);
            if let Some(Worker {
                port,
                child: Some(mut child),
            }) = worker
            {
                child
                    .kill()
                    .await
                    .with_context(|| format!("failed to kill worker for {}", instance.id))?;
                info!(instance_id = %instance.id, port, "worker terminated");
            }
            Ok(())
        })
    }
}
