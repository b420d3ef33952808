//! Active core-count constraint aggregation
//!
//! Subsystems contribute independent min/max requests per cluster; the
//! effective bound is their intersection (max of all mins, min of all
//! maxes). A request may carry a deadline after which it drops out on
//! its own. Any change fires the registered watchers so the control
//! loop re-evaluates immediately instead of waiting for its timer.

use crate::topology::{Cluster, Topology};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Requester id for the daemon's own boot-time floor
pub const REQ_BOOT: &str = "boot";
/// Requester id for the display-driven performance ceiling
pub const REQ_DISPLAY: &str = "display";
/// Requester id for user overrides arriving over IPC
pub const REQ_USER: &str = "user";

/// Which side of the bound a request constrains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundKind {
    Min,
    Max,
}

/// Effective per-cluster bound. `min > max` is representable and
/// signals conflicting requests; the decision layer prefers `min`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: usize,
    pub max: usize,
}

#[derive(Debug, Clone)]
struct Request {
    value: usize,
    deadline: Option<Instant>,
}

type RequestKey = (Cluster, BoundKind, String);

/// Core-count constraint aggregator
pub struct CoreCountQos {
    topology: Topology,
    requests: Mutex<HashMap<RequestKey, Request>>,
    watchers: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
}

impl CoreCountQos {
    pub fn new(topology: Topology) -> Self {
        Self {
            topology,
            requests: Mutex::new(HashMap::new()),
            watchers: Mutex::new(Vec::new()),
        }
    }

    /// Register a change watcher. Watchers run on the updating thread
    /// and must not block.
    pub fn subscribe(&self, watcher: impl Fn() + Send + Sync + 'static) {
        self.watchers.lock().unwrap().push(Box::new(watcher));
    }

    /// Add or replace a request
    pub fn update(&self, requester: &str, cluster: Cluster, kind: BoundKind, value: usize) {
        debug!("{} requests {} {:?} = {}", requester, cluster, kind, value);
        self.requests.lock().unwrap().insert(
            (cluster, kind, requester.to_string()),
            Request {
                value,
                deadline: None,
            },
        );
        self.notify();
    }

    /// Add or replace a request that expires after `ttl`
    pub fn update_with_timeout(
        &self,
        requester: &str,
        cluster: Cluster,
        kind: BoundKind,
        value: usize,
        ttl: Duration,
    ) {
        debug!(
            "{} requests {} {:?} = {} for {:?}",
            requester, cluster, kind, value, ttl
        );
        self.requests.lock().unwrap().insert(
            (cluster, kind, requester.to_string()),
            Request {
                value,
                deadline: Some(Instant::now() + ttl),
            },
        );
        self.notify();
    }

    /// Drop a request; no-op if absent
    pub fn remove(&self, requester: &str, cluster: Cluster, kind: BoundKind) {
        let removed = self
            .requests
            .lock()
            .unwrap()
            .remove(&(cluster, kind, requester.to_string()))
            .is_some();
        if removed {
            self.notify();
        }
    }

    /// Current effective bound for a cluster. Expired requests are
    /// pruned here; expiry does not fire watchers, the next decision
    /// cycle picks it up.
    pub fn bounds(&self, cluster: Cluster) -> Bounds {
        let size = self.topology.layout(cluster).core_count;
        let now = Instant::now();

        let mut requests = self.requests.lock().unwrap();
        requests.retain(|_, r| r.deadline.map_or(true, |d| d > now));

        let mut bounds = Bounds { min: 0, max: size };
        for ((c, kind, _), request) in requests.iter() {
            if *c != cluster {
                continue;
            }
            match kind {
                BoundKind::Min => bounds.min = bounds.min.max(request.value),
                BoundKind::Max => bounds.max = bounds.max.min(request.value),
            }
        }
        bounds
    }

    fn notify(&self) {
        for watcher in self.watchers.lock().unwrap().iter() {
            watcher();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopologyConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn qos() -> CoreCountQos {
        let topology = Topology::from_config(&TopologyConfig::default()).unwrap();
        CoreCountQos::new(topology)
    }

    #[test]
    fn test_default_bounds() {
        let qos = qos();
        assert_eq!(qos.bounds(Cluster::Performance), Bounds { min: 0, max: 4 });
    }

    #[test]
    fn test_intersection() {
        let qos = qos();
        qos.update("a", Cluster::Performance, BoundKind::Min, 1);
        qos.update("b", Cluster::Performance, BoundKind::Min, 2);
        qos.update("a", Cluster::Performance, BoundKind::Max, 3);
        qos.update("b", Cluster::Performance, BoundKind::Max, 4);

        assert_eq!(qos.bounds(Cluster::Performance), Bounds { min: 2, max: 3 });
        // Other cluster untouched.
        assert_eq!(qos.bounds(Cluster::Efficiency), Bounds { min: 0, max: 4 });
    }

    #[test]
    fn test_replace_and_remove() {
        let qos = qos();
        qos.update("a", Cluster::Efficiency, BoundKind::Max, 2);
        assert_eq!(qos.bounds(Cluster::Efficiency).max, 2);

        qos.update("a", Cluster::Efficiency, BoundKind::Max, 3);
        assert_eq!(qos.bounds(Cluster::Efficiency).max, 3);

        qos.remove("a", Cluster::Efficiency, BoundKind::Max);
        assert_eq!(qos.bounds(Cluster::Efficiency).max, 4);
    }

    #[test]
    fn test_min_above_max_is_representable() {
        let qos = qos();
        qos.update("a", Cluster::Performance, BoundKind::Min, 3);
        qos.update("b", Cluster::Performance, BoundKind::Max, 2);
        assert_eq!(qos.bounds(Cluster::Performance), Bounds { min: 3, max: 2 });
    }

    #[test]
    fn test_timeout_expiry() {
        let qos = qos();
        qos.update_with_timeout(
            "boot",
            Cluster::Performance,
            BoundKind::Min,
            4,
            Duration::ZERO,
        );
        assert_eq!(qos.bounds(Cluster::Performance).min, 0);
    }

    #[test]
    fn test_watcher_fires_on_change() {
        let qos = qos();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        qos.subscribe(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        qos.update("a", Cluster::Performance, BoundKind::Min, 1);
        qos.remove("a", Cluster::Performance, BoundKind::Min);
        qos.remove("a", Cluster::Performance, BoundKind::Min);

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
