//! Autoscaler — usage-driven pool sizing.
//!
//! Each tick takes a registry snapshot, decides on at most one action
//! and performs it. Scale-up creates one instance (through the
//! provisioner when one is configured). Scale-down marks one instance
//! draining; a background task removes it once its connections reach
//! zero or the drain timeout elapses.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use switchyard_core::config::AutoScalingConfig;
use switchyard_core::{Instance, InstanceId, InstanceMetadata, InstanceStatus};
use switchyard_registry::{InstanceRegistry, Provisioner, RegistryError};

/// Why the autoscaler wants another instance.
#[derive(Debug, Clone, PartialEq)]
pub enum ScaleUpReason {
    /// Fewer serving instances than `min_instances`.
    BelowMinimum { serving: usize },
    Cpu { instance_id: InstanceId, cpu: f64 },
    Memory { instance_id: InstanceId, memory: f64 },
    Connections { instance_id: InstanceId, connections: u32 },
}

/// Outcome of evaluating one registry snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum ScaleDecision {
    ScaleUp(ScaleUpReason),
    /// Drain and remove this instance.
    ScaleDown(InstanceId),
    NoChange,
}

/// What a call to [`Autoscaler::tick`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// A previous evaluation was still running.
    Skipped,
    Evaluated(ScaleDecision),
}

/// Reasons a single instance creation failed.
#[derive(Debug, Error)]
pub enum ScaleError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("provisioning failed: {0:#}")]
    Provision(anyhow::Error),
}

/// Result of an operator scale command.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleResult {
    pub requested: usize,
    /// Instances created (scale-up) or put into draining (scale-down).
    pub instances: Vec<InstanceId>,
    /// Registry size after the command.
    pub instance_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Resets the evaluation flag when a tick finishes, even on early return.
struct EvalGuard<'a>(&'a AtomicBool);

impl Drop for EvalGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Grows and shrinks the instance pool from reported usage.
pub struct Autoscaler {
    registry: Arc<InstanceRegistry>,
    config: AutoScalingConfig,
    provisioner: Option<Arc<dyn Provisioner>>,
    evaluating: AtomicBool,
    /// When each currently idle instance was first seen idle.
    idle_since: Mutex<HashMap<InstanceId, Instant>>,
}

impl Autoscaler {
    pub fn new(registry: Arc<InstanceRegistry>, config: AutoScalingConfig) -> Self {
        Self {
            registry,
            config,
            provisioner: None,
            evaluating: AtomicBool::new(false),
            idle_since: Mutex::new(HashMap::new()),
        }
    }

    /// Launch workers through `provisioner` instead of registering bare
    /// instances.
    pub fn with_provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    pub fn config(&self) -> &AutoScalingConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    // ── Evaluation ─────────────────────────────────────────────────

    /// Decide what to do with this snapshot. Updates idle tracking.
    pub fn evaluate(&self, instances: &[Instance], now: Instant) -> ScaleDecision {
        let cfg = &self.config;
        let max_connections = self.registry.max_connections_per_instance();
        let headroom = instances.len() < self.registry.max_instances();
        let serving = instances
            .iter()
            .filter(|i| matches!(i.status, InstanceStatus::Active | InstanceStatus::Provisioning))
            .count();

        self.track_idle(instances, now);

        // Scale up.
        let pressure = if serving < cfg.min_instances {
            Some(ScaleUpReason::BelowMinimum { serving })
        } else {
            instances
                .iter()
                .filter(|i| i.status == InstanceStatus::Active)
                .find_map(|i| self.hot_reason(i, max_connections))
        };
        if let Some(reason) = pressure {
            if headroom {
                debug!(?reason, serving, "scale-up triggered");
                return ScaleDecision::ScaleUp(reason);
            }
            debug!(?reason, max = self.registry.max_instances(), "scale-up wanted but pool is full");
        }

        // Scale down. Failed instances go first; they never count as serving.
        if let Some(failed) = instances.iter().find(|i| i.status == InstanceStatus::Error) {
            return ScaleDecision::ScaleDown(failed.id.clone());
        }
        if serving <= cfg.min_instances {
            return ScaleDecision::NoChange;
        }

        let grace = cfg.idle_grace();
        let idle = self.idle_since.lock();
        let victim = instances
            .iter()
            .filter(|i| i.status == InstanceStatus::Active)
            .filter_map(|i| idle.get(&i.id).map(|since| (i, *since)))
            .filter(|(_, since)| now.saturating_duration_since(*since) >= grace)
            .min_by_key(|(_, since)| *since)
            .map(|(i, _)| i.id.clone());

        match victim {
            Some(id) => {
                debug!(instance_id = %id, "scale-down triggered");
                ScaleDecision::ScaleDown(id)
            }
            None => ScaleDecision::NoChange,
        }
    }

    fn hot_reason(&self, instance: &Instance, max_connections: u32) -> Option<ScaleUpReason> {
        let cfg = &self.config;
        let usage = &instance.resource_usage;
        if usage.cpu >= cfg.cpu_threshold {
            return Some(ScaleUpReason::Cpu {
                instance_id: instance.id.clone(),
                cpu: usage.cpu,
            });
        }
        if usage.memory >= cfg.memory_threshold {
            return Some(ScaleUpReason::Memory {
                instance_id: instance.id.clone(),
                memory: usage.memory,
            });
        }
        if f64::from(instance.connections) >= cfg.connection_ratio * f64::from(max_connections) {
            return Some(ScaleUpReason::Connections {
                instance_id: instance.id.clone(),
                connections: instance.connections,
            });
        }
        None
    }

    fn track_idle(&self, instances: &[Instance], now: Instant) {
        let mut idle = self.idle_since.lock();
        idle.retain(|id, _| instances.iter().any(|i| &i.id == id));
        for inst in instances {
            let is_idle = inst.status == InstanceStatus::Active
                && inst.connections == 0
                && inst.resource_usage.cpu < self.config.idle_cpu_threshold;
            if is_idle {
                idle.entry(inst.id.clone()).or_insert(now);
            } else {
                idle.remove(&inst.id);
            }
        }
    }

    // ── Tick ───────────────────────────────────────────────────────

    /// Evaluate once and act on the decision.
    pub async fn tick(&self) -> TickOutcome {
        if self
            .evaluating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("previous evaluation still running, tick skipped");
            return TickOutcome::Skipped;
        }
        let _guard = EvalGuard(&self.evaluating);

        let snapshot = self.registry.instances();
        let decision = self.evaluate(&snapshot, Instant::now());

        match &decision {
            ScaleDecision::ScaleUp(reason) => {
                if let Some(inst) = self.create_with_retry().await {
                    info!(instance_id = %inst.id, ?reason, "scaled up");
                }
            }
            ScaleDecision::ScaleDown(id) => {
                if let Err(e) = self.drain(id) {
                    warn!(instance_id = %id, error = %e, "scale-down failed");
                }
            }
            ScaleDecision::NoChange => {}
        }

        TickOutcome::Evaluated(decision)
    }

    /// Run the evaluation loop until `shutdown` flips.
    ///
    /// Returns immediately when auto-scaling is disabled.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("auto-scaling disabled");
            return;
        }

        let interval = self.config.interval();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval_ms = interval.as_millis() as u64, "autoscaler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        this.tick().await;
                    });
                }
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
        }
    }

    // ── Creation ───────────────────────────────────────────────────

    /// Create one instance, retrying with exponential backoff.
    ///
    /// A full registry is not retried. Exhausted retries raise an alert
    /// and return `None`.
    async fn create_with_retry(&self) -> Option<Instance> {
        let mut backoff = self.config.retry_backoff();
        let mut attempt = 0u32;
        loop {
            match self.create_one().await {
                Ok(inst) => return Some(inst),
                Err(ScaleError::Registry(RegistryError::CapacityExceeded { max })) => {
                    warn!(max, "instance creation skipped, registry full");
                    return None;
                }
                Err(e) if attempt >= self.config.max_create_retries => {
                    error!(
                        attempts = attempt + 1,
                        error = %e,
                        "instance creation failed, giving up"
                    );
                    return None;
                }
                Err(e) => {
                    attempt += 1;
                    warn!(attempt, error = %e, backoff_ms = backoff.as_millis() as u64, "instance creation failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
            }
        }
    }

    /// Create one instance. With a provisioner the slot is reserved,
    /// launched, then activated; a failed launch frees the slot.
    async fn create_one(&self) -> Result<Instance, ScaleError> {
        let mut metadata = InstanceMetadata::new();
        metadata.insert("createdBy".to_string(), "autoscaler".to_string());

        let Some(provisioner) = &self.provisioner else {
            return Ok(self.registry.create_instance(metadata)?);
        };

        let reserved = self.registry.reserve_instance(metadata)?;
        let endpoint = match provisioner.launch(&reserved).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.registry.remove_instance(&reserved.id);
                return Err(ScaleError::Provision(e));
            }
        };

        match self.registry.activate(&reserved.id, Some(endpoint)) {
            Ok(inst) => Ok(inst),
            Err(e) => {
                // Removed while launching.
                if let Err(term) = provisioner.terminate(&reserved).await {
                    warn!(instance_id = %reserved.id, error = %term, "failed to terminate orphaned worker");
                }
                Err(e.into())
            }
        }
    }

    // ── Removal ────────────────────────────────────────────────────

    /// Mark an instance draining and remove it in the background once
    /// its connections reach zero or the drain timeout elapses.
    pub fn drain(&self, id: &str) -> Result<JoinHandle<()>, RegistryError> {
        self.registry.mark_draining(id)?;
        self.idle_since.lock().remove(id);

        let registry = self.registry.clone();
        let provisioner = self.provisioner.clone();
        let timeout = self.config.drain_timeout();
        let id = id.to_string();

        Ok(tokio::spawn(async move {
            let mut revisions = registry.subscribe();
            let drained = async {
                loop {
                    match registry.connection_count(&id) {
                        None | Some(0) => return,
                        Some(_) => {}
                    }
                    if revisions.changed().await.is_err() {
                        return;
                    }
                }
            };
            if tokio::time::timeout(timeout, drained).await.is_err() {
                warn!(
                    instance_id = %id,
                    connections = registry.connection_count(&id).unwrap_or(0),
                    "drain timed out, removing with open connections"
                );
            }

            if let Some(removed) = registry.remove_instance(&id) {
                terminate(provisioner.as_deref(), &removed).await;
                info!(instance_id = %id, "drained instance removed");
            }
        }))
    }

    /// Operator command: create up to `count` instances.
    pub async fn scale_up(&self, count: usize) -> ScaleResult {
        let mut result = ScaleResult {
            requested: count,
            ..Default::default()
        };
        for _ in 0..count {
            match self.create_one().await {
                Ok(inst) => {
                    info!(instance_id = %inst.id, "instance created by operator");
                    result.instances.push(inst.id);
                }
                Err(e) => {
                    warn!(error = %e, "operator scale-up stopped");
                    result.error = Some(e.to_string());
                    break;
                }
            }
        }
        result.instance_count = self.registry.len();
        result
    }

    /// Operator command: drain up to `count` instances.
    ///
    /// Failed instances go first, then the active instances with the
    /// fewest connections, newest first. Serving instances are never
    /// taken below `min_instances`.
    pub fn scale_down(&self, count: usize) -> ScaleResult {
        let snapshot = self.registry.instances();
        let mut failed: Vec<&Instance> = snapshot
            .iter()
            .filter(|i| i.status == InstanceStatus::Error)
            .collect();
        let mut active: Vec<&Instance> = snapshot
            .iter()
            .filter(|i| i.status == InstanceStatus::Active)
            .collect();
        active.sort_by(|a, b| {
            a.connections
                .cmp(&b.connections)
                .then(b.created_at.cmp(&a.created_at))
        });
        let spare_active = active.len().saturating_sub(self.config.min_instances);
        failed.extend(active.into_iter().take(spare_active));

        let mut result = ScaleResult {
            requested: count,
            ..Default::default()
        };
        for victim in failed.into_iter().take(count) {
            match self.drain(&victim.id) {
                Ok(_) => result.instances.push(victim.id.clone()),
                Err(e) => warn!(instance_id = %victim.id, error = %e, "operator drain failed"),
            }
        }
        if result.instances.len() < count {
            result.error = Some(format!(
                "only {} instance(s) could be drained without going below min_instances",
                result.instances.len()
            ));
        }
        result.instance_count = self.registry.len();
        result
    }

    /// Operator command: remove an instance immediately.
    pub async fn remove_instance(&self, id: &str) -> Option<Instance> {
        let removed = self.registry.remove_instance(id)?;
        self.idle_since.lock().remove(id);
        terminate(self.provisioner.as_deref(), &removed).await;
        Some(removed)
    }
}

async fn terminate(provisioner: Option<&dyn Provisioner>, instance: &Instance) {
    if let Some(p) = provisioner
        && let Err(e) = p.terminate(instance).await
    {
        warn!(instance_id = %instance.id, error = %e, "failed to terminate worker");
    }
}
