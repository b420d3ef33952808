//! Configuration for the Phalanx hotplug daemon

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhalanxConfig {
    /// Cluster topology
    #[serde(default)]
    pub topology: TopologyConfig,

    /// Control loop settings
    #[serde(default)]
    pub control: ControlConfig,

    /// Daemon settings
    #[serde(default)]
    pub daemon: DaemonConfig,
}

/// Cluster topology configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Efficiency (little) cluster
    #[serde(default = "default_efficiency_cluster")]
    pub efficiency: ClusterConfig,

    /// Performance (big) cluster
    #[serde(default = "default_performance_cluster")]
    pub performance: ClusterConfig,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            efficiency: default_efficiency_cluster(),
            performance: default_performance_cluster(),
        }
    }
}

/// One cluster's core range and frequency domain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// First core id in the cluster
    pub first_core: usize,

    /// Number of cores in the cluster
    pub core_count: usize,

    /// Core never taken offline by the daemon, if any
    #[serde(default)]
    pub primary: Option<usize>,

    /// Maximum frequency of the cluster's domain (kHz)
    pub max_freq_khz: u64,
}

/// Control loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Polling period while the display is on (milliseconds)
    #[serde(default = "default_normal_poll_ms")]
    pub normal_poll_ms: u64,

    /// Polling period while the display is off (milliseconds)
    #[serde(default = "default_lowpower_poll_ms")]
    pub lowpower_poll_ms: u64,

    /// Decision cycles the performance cluster stays at max after a
    /// heavy-task-migration boost
    #[serde(default = "default_stay_on_cycles")]
    pub stay_on_cycles: u32,

    /// Seconds both clusters are pinned to full size after boot
    #[serde(default = "default_boot_floor_secs")]
    pub boot_floor_secs: u64,

    /// Log every applied decision at info level
    #[serde(default)]
    pub log_decisions: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            normal_poll_ms: default_normal_poll_ms(),
            lowpower_poll_ms: default_lowpower_poll_ms(),
            stay_on_cycles: default_stay_on_cycles(),
            boot_floor_secs: default_boot_floor_secs(),
            log_decisions: false,
        }
    }
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Socket path
    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            log_level: default_log_level(),
        }
    }
}

// Default value functions
fn default_efficiency_cluster() -> ClusterConfig {
    ClusterConfig {
        first_core: 0,
        core_count: 4,
        primary: Some(0),
        max_freq_khz: 1_586_000,
    }
}

fn default_performance_cluster() -> ClusterConfig {
    ClusterConfig {
        first_core: 4,
        core_count: 4,
        primary: None,
        max_freq_khz: 2_100_000,
    }
}

fn default_normal_poll_ms() -> u64 {
    100
}

fn default_lowpower_poll_ms() -> u64 {
    500
}

fn default_stay_on_cycles() -> u32 {
    20
}

fn default_boot_floor_secs() -> u64 {
    40
}

fn default_socket_path() -> String {
    "/run/phalanx/phalanx.sock".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl PhalanxConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = serde_yaml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate tunables before use
    pub fn validate(&self) -> Result<()> {
        if self.control.normal_poll_ms == 0 || self.control.lowpower_poll_ms == 0 {
            return Err(anyhow!("polling periods must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PhalanxConfig::default();
        assert_eq!(config.control.normal_poll_ms, 100);
        assert_eq!(config.control.lowpower_poll_ms, 500);
        assert_eq!(config.control.stay_on_cycles, 20);
        assert_eq!(config.topology.efficiency.primary, Some(0));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_poll_rejected() {
        let mut config = PhalanxConfig::default();
        config.control.normal_poll_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = "control:\n  lowpower_poll_ms: 250\n";
        let config: PhalanxConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.control.lowpower_poll_ms, 250);
        assert_eq!(config.control.normal_poll_ms, 100);
    }
}
