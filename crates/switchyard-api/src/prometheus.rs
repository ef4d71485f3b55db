//! Prometheus text exposition for the instance pool.

use switchyard_core::{Instance, InstanceStatus, LoadBalancingStrategy};

const STATUSES: [InstanceStatus; 4] = [
    InstanceStatus::Provisioning,
    InstanceStatus::Active,
    InstanceStatus::Draining,
    InstanceStatus::Error,
];

/// Inputs for one scrape.
pub struct PoolMetrics<'a> {
    pub instances: &'a [Instance],
    pub sessions: usize,
    pub strategy: LoadBalancingStrategy,
    pub max_instances: usize,
    pub uptime_secs: u64,
}

/// Render pool state in Prometheus text exposition format.
pub fn render_prometheus(m: &PoolMetrics<'_>) -> String {
    let mut out = String::new();

    out.push_str("# HELP switchyard_instances Instances by lifecycle status.\n");
    out.push_str("# TYPE switchyard_instances gauge\n");
    for status in STATUSES {
        let count = m.instances.iter().filter(|i| i.status == status).count();
        out.push_str(&format!(
            "switchyard_instances{{status=\"{}\"}} {}\n",
            status.as_str(),
            count
        ));
    }

    out.push_str("# HELP switchyard_max_instances Configured instance cap.\n");
    out.push_str("# TYPE switchyard_max_instances gauge\n");
    out.push_str(&format!("switchyard_max_instances {}\n", m.max_instances));

    out.push_str("# HELP switchyard_connections Client connections bound to each instance.\n");
    out.push_str("# TYPE switchyard_connections gauge\n");
    for i in m.instances {
        out.push_str(&format!(
            "switchyard_connections{{instance=\"{}\"}} {}\n",
            i.id, i.connections
        ));
    }

    out.push_str("# HELP switchyard_instance_cpu_percent Last reported CPU utilisation.\n");
    out.push_str("# TYPE switchyard_instance_cpu_percent gauge\n");
    for i in m.instances {
        out.push_str(&format!(
            "switchyard_instance_cpu_percent{{instance=\"{}\"}} {:.2}\n",
            i.id, i.resource_usage.cpu
        ));
    }

    out.push_str("# HELP switchyard_instance_memory_percent Last reported memory utilisation.\n");
    out.push_str("# TYPE switchyard_instance_memory_percent gauge\n");
    for i in m.instances {
        out.push_str(&format!(
            "switchyard_instance_memory_percent{{instance=\"{}\"}} {:.2}\n",
            i.id, i.resource_usage.memory
        ));
    }

    out.push_str("# HELP switchyard_sessions Live sessions.\n");
    out.push_str("# TYPE switchyard_sessions gauge\n");
    out.push_str(&format!("switchyard_sessions {}\n", m.sessions));

    out.push_str("# HELP switchyard_strategy_info Active load balancing strategy.\n");
    out.push_str("# TYPE switchyard_strategy_info gauge\n");
    out.push_str(&format!(
        "switchyard_strategy_info{{strategy=\"{}\"}} 1\n",
        m.strategy.as_str()
    ));

    out.push_str("# HELP switchyard_uptime_seconds Seconds since the control plane started.\n");
    out.push_str("# TYPE switchyard_uptime_seconds counter\n");
    out.push_str(&format!("switchyard_uptime_seconds {}\n", m.uptime_secs));

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_core::{InstanceMetadata, ResourceUsage};

    fn inst(id: &str, status: InstanceStatus, connections: u32) -> Instance {
        Instance {
            id: id.to_string(),
            status,
            metadata: InstanceMetadata::new(),
            endpoint: None,
            connections,
            resource_usage: ResourceUsage {
                cpu: 12.5,
                ..Default::default()
            },
            created_at: 0,
        }
    }

    #[test]
    fn renders_status_counts_and_per_instance_gauges() {
        let instances = vec![
            inst("inst-a", InstanceStatus::Active, 3),
            inst("inst-b", InstanceStatus::Active, 0),
            inst("inst-c", InstanceStatus::Draining, 1),
        ];
        let text = render_prometheus(&PoolMetrics {
            instances: &instances,
            sessions: 2,
            strategy: LoadBalancingStrategy::RoundRobin,
            max_instances: 10,
            uptime_secs: 5,
        });

        assert!(text.contains("switchyard_instances{status=\"active\"} 2\n"));
        assert!(text.contains("switchyard_instances{status=\"draining\"} 1\n"));
        assert!(text.contains("switchyard_instances{status=\"error\"} 0\n"));
        assert!(text.contains("switchyard_connections{instance=\"inst-a\"} 3\n"));
        assert!(text.contains("switchyard_instance_cpu_percent{instance=\"inst-b\"} 12.50\n"));
        assert!(text.contains("switchyard_sessions 2\n"));
        assert!(text.contains("switchyard_strategy_info{strategy=\"roundRobin\"} 1\n"));
    }

    #[test]
    fn empty_pool_still_declares_metrics() {
        let text = render_prometheus(&PoolMetrics {
            instances: &[],
            sessions: 0,
            strategy: LoadBalancingStrategy::LeastConnections,
            max_instances: 1,
            uptime_secs: 0,
        });
        assert!(text.contains("# TYPE switchyard_connections gauge"));
        assert!(!text.contains("switchyard_connections{"));
    }
}
