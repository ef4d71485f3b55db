//! InstanceRegistry — the single owner of the instance pool.
//!
//! The registry:
//! - Enforces the `max_instances` cap on creation
//! - Tracks instance lifecycle (provisioning → active → draining/error → removed)
//! - Holds the process-wide load balancing strategy
//! - Binds client connections to instances, one entry per connection id
//! - Publishes a revision counter so watchers can react to mutations
//!
//! Every mutation goes through one mutex. Readers get cloned snapshots.

use std::collections::HashSet;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use switchyard_core::config::RegistryConfig;
use switchyard_core::{
    epoch_millis, ConnectionId, Instance, InstanceMetadata, InstanceStatus, LoadBalancingStrategy,
    ResourceUsage, RoutingContext, ENDPOINT_TAG,
};

use crate::error::{RegistryError, RegistryResult};
use crate::load_balancer::LoadBalancer;

/// An instance plus the connection ids bound to it.
struct InstanceSlot {
    instance: Instance,
    bound: HashSet<ConnectionId>,
}

impl InstanceSlot {
    fn sync_count(&mut self) {
        self.instance.connections = self.bound.len() as u32;
    }
}

struct Inner {
    /// Creation order.
    slots: Vec<InstanceSlot>,
    strategy: LoadBalancingStrategy,
}

impl Inner {
    fn slot_mut(&mut self, id: &str) -> Option<&mut InstanceSlot> {
        self.slots.iter_mut().find(|s| s.instance.id == id)
    }

    fn slot(&self, id: &str) -> Option<&InstanceSlot> {
        self.slots.iter().find(|s| s.instance.id == id)
    }
}

/// Tracks the instance pool: lifecycle, health, capacity.
pub struct InstanceRegistry {
    inner: Mutex<Inner>,
    balancer: LoadBalancer,
    max_instances: usize,
    max_connections_per_instance: u32,
    revision: watch::Sender<u64>,
}

impl InstanceRegistry {
    /// Create a registry from the `[registry]` config section.
    pub fn new(config: &RegistryConfig) -> Self {
        Self::with_limits(config.max_instances, config.max_connections_per_instance)
            .with_strategy(config.strategy)
    }

    /// Create a registry with explicit limits and the default strategy.
    pub fn with_limits(max_instances: usize, max_connections_per_instance: u32) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                strategy: LoadBalancingStrategy::default(),
            }),
            balancer: LoadBalancer::new(),
            max_instances,
            max_connections_per_instance,
            revision,
        }
    }

    pub fn with_strategy(self, strategy: LoadBalancingStrategy) -> Self {
        self.inner.lock().strategy = strategy;
        self
    }

    pub fn max_instances(&self) -> usize {
        self.max_instances
    }

    pub fn max_connections_per_instance(&self) -> u32 {
        self.max_connections_per_instance
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Register a new, immediately routable instance.
    ///
    /// An `endpoint` tag in `metadata` becomes the instance endpoint.
    pub fn create_instance(&self, metadata: InstanceMetadata) -> RegistryResult<Instance> {
        self.insert(metadata, InstanceStatus::Active)
    }

    /// Reserve a slot for an instance that is still launching.
    ///
    /// The slot counts toward `max_instances` but is never routed to until
    /// [`activate`](Self::activate) is called.
    pub fn reserve_instance(&self, metadata: InstanceMetadata) -> RegistryResult<Instance> {
        self.insert(metadata, InstanceStatus::Provisioning)
    }

    fn insert(
        &self,
        metadata: InstanceMetadata,
        status: InstanceStatus,
    ) -> RegistryResult<Instance> {
        let instance = {
            let mut inner = self.inner.lock();
            if inner.slots.len() >= self.max_instances {
                warn!(max = self.max_instances, "instance capacity exceeded");
                return Err(RegistryError::CapacityExceeded {
                    max: self.max_instances,
                });
            }

            let instance = Instance {
                id: format!("inst-{}", Uuid::new_v4()),
                status,
                endpoint: metadata.get(ENDPOINT_TAG).cloned(),
                metadata,
                connections: 0,
                resource_usage: ResourceUsage::default(),
                created_at: epoch_millis(),
            };
            inner.slots.push(InstanceSlot {
                instance: instance.clone(),
                bound: HashSet::new(),
            });
            instance
        };

        self.bump();
        info!(
            instance_id = %instance.id,
            status = instance.status.as_str(),
            endpoint = instance.endpoint.as_deref().unwrap_or("-"),
            "instance created"
        );
        Ok(instance)
    }

    /// Move a provisioning instance to active, recording its endpoint.
    pub fn activate(&self, id: &str, endpoint: Option<String>) -> RegistryResult<Instance> {
        let instance = {
            let mut inner = self.inner.lock();
            let slot = inner
                .slot_mut(id)
                .ok_or_else(|| RegistryError::InstanceNotFound(id.to_string()))?;
            if endpoint.is_some() {
                slot.instance.endpoint = endpoint;
            }
            slot.instance.status = InstanceStatus::Active;
            slot.instance.clone()
        };
        self.bump();
        info!(instance_id = %id, "instance activated");
        Ok(instance)
    }

    /// Detach an instance. Unknown ids are a no-op.
    ///
    /// Connections still bound to the instance are not touched; the
    /// returned snapshot (status `removed`) reports how many there were.
    pub fn remove_instance(&self, id: &str) -> Option<Instance> {
        let removed = {
            let mut inner = self.inner.lock();
            let pos = inner.slots.iter().position(|s| s.instance.id == id)?;
            let mut slot = inner.slots.remove(pos);
            slot.instance.status = InstanceStatus::Removed;
            slot.instance
        };
        self.bump();
        info!(
            instance_id = %id,
            connections = removed.connections,
            "instance removed"
        );
        Some(removed)
    }

    /// Replace the latest resource usage for an instance.
    pub fn report_usage(&self, id: &str, usage: ResourceUsage) -> RegistryResult<()> {
        {
            let mut inner = self.inner.lock();
            let slot = inner
                .slot_mut(id)
                .ok_or_else(|| RegistryError::InstanceNotFound(id.to_string()))?;
            slot.instance.resource_usage = usage;
        }
        self.bump();
        debug!(instance_id = %id, cpu = usage.cpu, memory = usage.memory, "usage reported");
        Ok(())
    }

    /// Exclude an instance from routing after a failure.
    ///
    /// Existing connections stay bound. The instance is not removed.
    pub fn mark_error(&self, id: &str) -> RegistryResult<()> {
        self.set_status(id, InstanceStatus::Error)?;
        warn!(instance_id = %id, "instance marked as error");
        Ok(())
    }

    /// Stop routing new connections to an instance ahead of removal.
    pub fn mark_draining(&self, id: &str) -> RegistryResult<()> {
        self.set_status(id, InstanceStatus::Draining)?;
        info!(instance_id = %id, "instance draining");
        Ok(())
    }

    fn set_status(&self, id: &str, status: InstanceStatus) -> RegistryResult<()> {
        {
            let mut inner = self.inner.lock();
            let slot = inner
                .slot_mut(id)
                .ok_or_else(|| RegistryError::InstanceNotFound(id.to_string()))?;
            slot.instance.status = status;
        }
        self.bump();
        Ok(())
    }

    // ── Snapshots ──────────────────────────────────────────────────

    /// Snapshot of every instance, in creation order.
    pub fn instances(&self) -> Vec<Instance> {
        let inner = self.inner.lock();
        inner.slots.iter().map(|s| s.instance.clone()).collect()
    }

    pub fn get_instance(&self, id: &str) -> Option<Instance> {
        self.inner.lock().slot(id).map(|s| s.instance.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an instance exists and has not failed.
    pub fn is_live(&self, id: &str) -> bool {
        self.inner
            .lock()
            .slot(id)
            .is_some_and(|s| s.instance.status.is_live())
    }

    pub fn connection_count(&self, id: &str) -> Option<u32> {
        self.inner.lock().slot(id).map(|s| s.instance.connections)
    }

    pub fn total_connections(&self) -> u32 {
        self.inner
            .lock()
            .slots
            .iter()
            .map(|s| s.instance.connections)
            .sum()
    }

    // ── Strategy ───────────────────────────────────────────────────

    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.inner.lock().strategy
    }

    /// Switch strategy. Only future selections are affected.
    pub fn set_strategy(&self, strategy: LoadBalancingStrategy) {
        let previous = {
            let mut inner = self.inner.lock();
            std::mem::replace(&mut inner.strategy, strategy)
        };
        self.bump();
        info!(
            from = previous.as_str(),
            to = strategy.as_str(),
            "load balancing strategy changed"
        );
    }

    // ── Routing ────────────────────────────────────────────────────

    /// Pick an instance for a new connection without binding it.
    pub fn get_instance_for_connection(&self, context: &RoutingContext) -> RegistryResult<Instance> {
        let inner = self.inner.lock();
        self.balancer
            .select(
                inner.slots.iter().map(|s| &s.instance),
                inner.strategy,
                self.max_connections_per_instance,
                context,
            )
            .cloned()
    }

    /// Pick an instance and bind `connection_id` to it in one step.
    pub fn route_connection(
        &self,
        context: &RoutingContext,
        connection_id: &str,
    ) -> RegistryResult<Instance> {
        let instance = {
            let mut inner = self.inner.lock();
            let chosen = self
                .balancer
                .select(
                    inner.slots.iter().map(|s| &s.instance),
                    inner.strategy,
                    self.max_connections_per_instance,
                    context,
                )?
                .id
                .clone();
            Self::bind_slot(&mut inner, &chosen, connection_id)?
        };
        self.bump();
        Ok(instance)
    }

    /// Bind `connection_id` to a specific instance (sticky reuse).
    ///
    /// Fails unless the instance is active and below its connection limit.
    pub fn bind_connection(&self, instance_id: &str, connection_id: &str) -> RegistryResult<Instance> {
        let instance = {
            let mut inner = self.inner.lock();
            let slot = inner
                .slot(instance_id)
                .ok_or_else(|| RegistryError::InstanceNotFound(instance_id.to_string()))?;
            if !slot.instance.status.is_routable() {
                return Err(RegistryError::NotRoutable {
                    id: instance_id.to_string(),
                    status: slot.instance.status,
                });
            }
            if slot.instance.connections >= self.max_connections_per_instance
                && !slot.bound.contains(connection_id)
            {
                return Err(RegistryError::AtCapacity(instance_id.to_string()));
            }
            Self::bind_slot(&mut inner, instance_id, connection_id)?
        };
        self.bump();
        Ok(instance)
    }

    fn bind_slot(
        inner: &mut Inner,
        instance_id: &str,
        connection_id: &str,
    ) -> RegistryResult<Instance> {
        let slot = inner
            .slot_mut(instance_id)
            .ok_or_else(|| RegistryError::InstanceNotFound(instance_id.to_string()))?;
        slot.bound.insert(connection_id.to_string());
        slot.sync_count();
        debug!(
            %instance_id,
            %connection_id,
            connections = slot.instance.connections,
            "connection bound"
        );
        Ok(slot.instance.clone())
    }

    /// Unbind a connection. Returns false if it was not bound, so repeated
    /// releases for the same connection never decrement twice.
    pub fn release_connection(&self, instance_id: &str, connection_id: &str) -> bool {
        let released = {
            let mut inner = self.inner.lock();
            match inner.slot_mut(instance_id) {
                Some(slot) => {
                    let removed = slot.bound.remove(connection_id);
                    slot.sync_count();
                    removed
                }
                None => false,
            }
        };
        if released {
            self.bump();
            debug!(%instance_id, %connection_id, "connection released");
        }
        released
    }

    // ── Change feed ────────────────────────────────────────────────

    /// Receive a new revision number after every mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Current revision.
    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }
}
