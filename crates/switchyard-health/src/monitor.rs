//! Usage monitor — background task that polls every instance's usage
//! endpoint and feeds the registry.
//!
//! Each tick probes the instances whose backoff has elapsed, concurrently.
//! Reports replace the instance's `resourceUsage`. An instance that fails
//! `unhealthy_threshold` probes in a row is marked `error`, which removes
//! it from routing and makes it the autoscaler's preferred victim.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use switchyard_core::config::UsageConfig;
use switchyard_core::{endpoint_authority, InstanceId, InstanceStatus};
use switchyard_registry::InstanceRegistry;

use crate::checker::{http_usage_probe, ProbeResult, ReportingStatus, UsageTracker};

struct TrackerSlot {
    tracker: UsageTracker,
    next_due: Instant,
}

/// Polls instance usage endpoints on an interval.
pub struct UsageMonitor {
    registry: Arc<InstanceRegistry>,
    path: String,
    interval: Duration,
    timeout: Duration,
    unhealthy_threshold: u32,
    trackers: Mutex<HashMap<InstanceId, TrackerSlot>>,
}

impl UsageMonitor {
    pub fn new(registry: Arc<InstanceRegistry>, config: &UsageConfig) -> Self {
        Self {
            registry,
            path: config.path.clone(),
            interval: config.interval(),
            timeout: config.timeout(),
            unhealthy_threshold: config.unhealthy_threshold,
            trackers: Mutex::new(HashMap::new()),
        }
    }

    /// Probe every due instance once. Returns how many were probed.
    pub async fn poll_once(&self, now: Instant) -> usize {
        let targets: Vec<(InstanceId, String)> = self
            .registry
            .instances()
            .into_iter()
            .filter(|i| matches!(i.status, InstanceStatus::Active | InstanceStatus::Draining))
            .filter_map(|i| {
                let authority = endpoint_authority(i.endpoint.as_deref()?)?.to_string();
                Some((i.id, authority))
            })
            .collect();

        let due: Vec<(InstanceId, String)> = {
            let mut trackers = self.trackers.lock();
            trackers.retain(|id, _| targets.iter().any(|(t, _)| t == id));
            targets
                .into_iter()
                .filter(|(id, _)| trackers.get(id).is_none_or(|slot| slot.next_due <= now))
                .collect()
        };

        let mut probes = JoinSet::new();
        for (id, authority) in &due {
            let (id, authority) = (id.clone(), authority.clone());
            let path = self.path.clone();
            let timeout = self.timeout;
            probes.spawn(async move {
                let result = http_usage_probe(&authority, &path, timeout).await;
                (id, result)
            });
        }

        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((id, result)) => self.apply(&id, result, now),
                Err(e) => warn!(error = %e, "usage probe task failed"),
            }
        }
        due.len()
    }

    fn apply(&self, id: &str, result: ProbeResult, now: Instant) {
        let (previous, status) = {
            let mut trackers = self.trackers.lock();
            let slot = trackers.entry(id.to_string()).or_insert_with(|| TrackerSlot {
                tracker: UsageTracker::new(self.unhealthy_threshold, self.interval),
                next_due: now,
            });
            let previous = slot.tracker.status();
            let status = slot.tracker.record(&result);
            slot.next_due = now + slot.tracker.next_interval();
            (previous, status)
        };

        if let ProbeResult::Reported(usage) = result
            && let Err(e) = self.registry.report_usage(id, usage)
        {
            debug!(instance_id = %id, error = %e, "usage for vanished instance dropped");
        }

        if status == ReportingStatus::Failing && previous != ReportingStatus::Failing {
            match self.registry.mark_error(id) {
                Ok(()) => warn!(instance_id = %id, "instance marked as error after failed usage probes"),
                Err(e) => debug!(instance_id = %id, error = %e, "failing instance already gone"),
            }
        }
    }

    /// Number of instances currently tracked.
    pub fn tracked(&self) -> usize {
        self.trackers.lock().len()
    }

    /// Poll on the configured interval until `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(path = %self.path, interval_ms = self.interval.as_millis() as u64, "usage monitor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once(Instant::now()).await;
                }
                _ = shutdown.changed() => {
                    debug!("usage monitor shutting down");
                    break;
                }
            }
        }
    }
}
