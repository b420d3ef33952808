//! Cluster topology model
//!
//! The two clusters are fixed at daemon startup from configuration and
//! never change afterwards. Core ids are global, and contiguous within
//! a cluster.

use crate::config::{ClusterConfig, TopologyConfig};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// Global core identifier
pub type CoreId = usize;

/// Power-performance class of a core group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cluster {
    Efficiency,
    Performance,
}

impl Cluster {
    pub const ALL: [Cluster; 2] = [Cluster::Efficiency, Cluster::Performance];
}

impl fmt::Display for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cluster::Efficiency => write!(f, "efficiency"),
            Cluster::Performance => write!(f, "performance"),
        }
    }
}

/// Static layout of one cluster
#[derive(Debug, Clone)]
pub struct ClusterLayout {
    /// First core id in the cluster
    pub first_core: CoreId,
    /// Number of cores in the cluster
    pub core_count: usize,
    /// Core this daemon never takes offline, if any
    pub primary: Option<CoreId>,
    /// Maximum frequency of the cluster's domain (kHz)
    pub max_freq_khz: u64,
}

impl ClusterLayout {
    /// Core ids belonging to the cluster, ascending
    pub fn cores(&self) -> Range<CoreId> {
        self.first_core..self.first_core + self.core_count
    }

    pub fn contains(&self, core: CoreId) -> bool {
        self.cores().contains(&core)
    }
}

/// Fixed two-cluster topology
#[derive(Debug, Clone)]
pub struct Topology {
    efficiency: ClusterLayout,
    performance: ClusterLayout,
}

impl Topology {
    /// Build and validate the topology from configuration
    pub fn from_config(config: &TopologyConfig) -> Result<Self> {
        let efficiency = layout_from("efficiency", &config.efficiency)?;
        let performance = layout_from("performance", &config.performance)?;

        if efficiency.cores().any(|c| performance.contains(c)) {
            return Err(anyhow!("cluster core ranges overlap"));
        }

        Ok(Self {
            efficiency,
            performance,
        })
    }

    pub fn layout(&self, cluster: Cluster) -> &ClusterLayout {
        match cluster {
            Cluster::Efficiency => &self.efficiency,
            Cluster::Performance => &self.performance,
        }
    }

    /// Cluster a core belongs to, if any
    pub fn cluster_of(&self, core: CoreId) -> Option<Cluster> {
        Cluster::ALL
            .into_iter()
            .find(|&cluster| self.layout(cluster).contains(core))
    }
}

fn layout_from(name: &str, config: &ClusterConfig) -> Result<ClusterLayout> {
    if config.core_count == 0 {
        return Err(anyhow!("{} cluster has no cores", name));
    }
    if config.max_freq_khz == 0 {
        return Err(anyhow!("{} cluster max frequency must be non-zero", name));
    }

    let layout = ClusterLayout {
        first_core: config.first_core,
        core_count: config.core_count,
        primary: config.primary,
        max_freq_khz: config.max_freq_khz,
    };

    if let Some(primary) = config.primary {
        if !layout.contains(primary) {
            return Err(anyhow!(
                "{} cluster primary core {} outside range {}..{}",
                name,
                primary,
                layout.first_core,
                layout.first_core + layout.core_count
            ));
        }
    }

    Ok(layout)
}
