//! Decision policy
//!
//! Translates the externally written target feed into a per-cluster
//! core count, clamped to the aggregated bounds and damped by the
//! performance cluster's stay-on counter.

use crate::qos::Bounds;
use crate::topology::Cluster;
use serde::{Deserialize, Serialize};
use tracing::error;

/// Operating mode selected by display state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerMode {
    Normal,
    LowPower,
}

/// Cluster targets written by the external policy feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetFeed {
    /// Whether the performance cluster should be on at all
    pub performance_on: bool,
    /// Requested efficiency cluster core count
    pub efficiency_target: usize,
}

impl TargetFeed {
    /// Safe defaults used until the feed is first written
    pub fn initial(efficiency_size: usize) -> Self {
        Self {
            performance_on: true,
            efficiency_target: efficiency_size,
        }
    }
}

/// Compute the final core-count target for one cluster.
///
/// Pure: the result depends only on the arguments. `stay_on` is the
/// current value of the performance stay-on counter; the caller
/// decrements it separately, once per cycle.
pub fn decide(
    cluster: Cluster,
    cluster_size: usize,
    feed: TargetFeed,
    bounds: Bounds,
    mode: PowerMode,
    stay_on: u32,
) -> usize {
    if bounds.min > bounds.max {
        error!(
            "inconsistent bounds on {} cluster (min {} > max {}), preferring min",
            cluster, bounds.min, bounds.max
        );
        return bounds.min;
    }

    match cluster {
        Cluster::Performance => {
            if stay_on > 0 {
                return bounds.max;
            }
            let proposed = if feed.performance_on { cluster_size } else { 0 };
            proposed.clamp(bounds.min, bounds.max)
        }
        // While the display is on, every efficiency core stays
        // available; the feed's count only applies in low-power mode.
        Cluster::Efficiency => match mode {
            PowerMode::Normal => bounds.max,
            PowerMode::LowPower => feed.efficiency_target.clamp(bounds.min, bounds.max),
        },
    }
}
