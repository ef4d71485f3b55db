//! Instance selection.
//!
//! A pure decision over a set of instances: filter out everything that
//! cannot take a new connection, then apply the strategy. The only state
//! is the round-robin cursor, an `AtomicUsize` shared by every caller so
//! the rotation persists across calls.

use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use switchyard_core::{Instance, LoadBalancingStrategy, RoutingContext};

use crate::error::{RegistryError, RegistryResult};

/// Picks instances for new connections.
pub struct LoadBalancer {
    cursor: AtomicUsize,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
        }
    }

    /// Select an instance for a new connection.
    ///
    /// `instances` must be in creation order. Instances that are not
    /// active, or already hold `max_connections` connections, are skipped.
    pub fn select<'a, I>(
        &self,
        instances: I,
        strategy: LoadBalancingStrategy,
        max_connections: u32,
        context: &RoutingContext,
    ) -> RegistryResult<&'a Instance>
    where
        I: IntoIterator<Item = &'a Instance>,
    {
        let eligible: Vec<&Instance> = instances
            .into_iter()
            .filter(|i| i.status.is_routable() && i.connections < max_connections)
            .collect();

        if eligible.is_empty() {
            return Err(RegistryError::NoAvailableInstance);
        }

        let chosen = match strategy {
            // `min_by` keeps the first of equal elements, so creation order
            // breaks ties between equal timestamps.
            LoadBalancingStrategy::LeastConnections => eligible
                .iter()
                .copied()
                .min_by(|a, b| {
                    a.connections
                        .cmp(&b.connections)
                        .then(a.created_at.cmp(&b.created_at))
                })
                .ok_or(RegistryError::NoAvailableInstance)?,
            LoadBalancingStrategy::RoundRobin => {
                let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % eligible.len();
                eligible[idx]
            }
        };

        debug!(
            instance_id = %chosen.id,
            strategy = strategy.as_str(),
            eligible = eligible.len(),
            session_id = context.session_id.as_deref().unwrap_or("-"),
            "instance selected"
        );
        Ok(chosen)
    }

    /// Current cursor value (for diagnostics).
    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_core::{InstanceMetadata, InstanceStatus, ResourceUsage};

    fn inst(id: &str, connections: u32, created_at: u64) -> Instance {
        Instance {
            id: id.to_string(),
            status: InstanceStatus::Active,
            metadata: InstanceMetadata::new(),
            endpoint: None,
            connections,
            resource_usage: ResourceUsage::default(),
            created_at,
        }
    }

    fn ctx() -> RoutingContext {
        RoutingContext::default()
    }

    #[test]
    fn least_connections_picks_fewest() {
        let lb = LoadBalancer::new();
        let pool = vec![inst("a", 5, 1), inst("b", 2, 2)];

        for _ in 0..5 {
            let chosen = lb
                .select(&pool, LoadBalancingStrategy::LeastConnections, 100, &ctx())
                .unwrap();
            assert_eq!(chosen.id, "b");
        }
    }

    #[test]
    fn least_connections_tie_breaks_on_creation() {
        let lb = LoadBalancer::new();
        let pool = vec![inst("late", 1, 20), inst("early", 1, 10)];
        let chosen = lb
            .select(&pool, LoadBalancingStrategy::LeastConnections, 100, &ctx())
            .unwrap();
        assert_eq!(chosen.id, "early");

        // Equal timestamps fall back to slice order.
        let pool = vec![inst("first", 0, 10), inst("second", 0, 10)];
        let chosen = lb
            .select(&pool, LoadBalancingStrategy::LeastConnections, 100, &ctx())
            .unwrap();
        assert_eq!(chosen.id, "first");
    }

    #[test]
    fn round_robin_alternates() {
        let lb = LoadBalancer::new();
        let pool = vec![inst("a", 0, 1), inst("b", 0, 2)];

        let picks: Vec<String> = (0..4)
            .map(|_| {
                lb.select(&pool, LoadBalancingStrategy::RoundRobin, 100, &ctx())
                    .unwrap()
                    .id
                    .clone()
            })
            .collect();
        assert_eq!(picks, vec!["a", "b", "a", "b"]);
        assert_eq!(lb.cursor(), 4);
    }

    #[test]
    fn skips_unroutable_and_full_instances() {
        let lb = LoadBalancer::new();
        let mut errored = inst("errored", 0, 1);
        errored.status = InstanceStatus::Error;
        let mut draining = inst("draining", 0, 2);
        draining.status = InstanceStatus::Draining;
        let mut provisioning = inst("provisioning", 0, 3);
        provisioning.status = InstanceStatus::Provisioning;
        let full = inst("full", 10, 4);
        let ok = inst("ok", 7, 5);
        let pool = vec![errored, draining, provisioning, full, ok];

        for strategy in [
            LoadBalancingStrategy::LeastConnections,
            LoadBalancingStrategy::RoundRobin,
        ] {
            for _ in 0..3 {
                let chosen = lb.select(&pool, strategy, 10, &ctx()).unwrap();
                assert_eq!(chosen.id, "ok");
            }
        }
    }

    #[test]
    fn empty_pool_is_no_available_instance() {
        let lb = LoadBalancer::new();
        let pool: Vec<Instance> = vec![];
        assert_eq!(
            lb.select(&pool, LoadBalancingStrategy::RoundRobin, 10, &ctx())
                .unwrap_err(),
            RegistryError::NoAvailableInstance
        );
    }

    #[test]
    fn all_full_is_no_available_instance() {
        let lb = LoadBalancer::new();
        let pool = vec![inst("a", 3, 1), inst("b", 3, 2)];
        assert_eq!(
            lb.select(&pool, LoadBalancingStrategy::LeastConnections, 3, &ctx())
                .unwrap_err(),
            RegistryError::NoAvailableInstance
        );
    }

    #[test]
    fn round_robin_concurrent_safety() {
        use std::sync::Arc;
        use std::thread;

        let lb = Arc::new(LoadBalancer::new());
        let pool = Arc::new(vec![inst("a", 0, 1), inst("b", 0, 2), inst("c", 0, 3)]);
        let mut handles = vec![];

        for _ in 0..4 {
            let lb = lb.clone();
            let pool = pool.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    lb.select(pool.iter(), LoadBalancingStrategy::RoundRobin, 10, &ctx())
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(lb.cursor(), 400);
    }
}
