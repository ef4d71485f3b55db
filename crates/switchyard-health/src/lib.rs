//! switchyard-health — resource usage polling for instances.
//!
//! Instances may push usage through the REST API or expose it on an
//! HTTP endpoint that this crate polls. Consecutive probe failures back
//! off exponentially and, past `unhealthy_threshold`, mark the instance
//! as `error` in the registry.
//!
//! # Architecture
//!
//! ```text
//! UsageMonitor (interval loop)
//!   ├── InstanceRegistry (targets, report_usage, mark_error)
//!   └── per-instance UsageTracker
//!         └── http_usage_probe (GET http://{host:port}{path})
//! ```

pub mod checker;
pub mod monitor;

pub use checker::{http_usage_probe, ProbeResult, ReportingStatus, UsageTracker};
pub use monitor::UsageMonitor;
