//! Per-core load accounting
//!
//! Busy time is the wall delta minus the idle delta since the previous
//! sample, scaled by the core's current frequency against the cluster
//! maximum: a half-speed core at 100% busy reads as 50. Cluster load is
//! the sum over its online cores, in `0..=100 * core_count`.

use crate::topology::{Cluster, CoreId, Topology};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex};

/// Cumulative time counters for one core
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    /// Total wall time (scheduler ticks)
    pub wall: u64,
    /// Idle time, including iowait
    pub idle: u64,
}

/// Source of per-core busy/idle counters
pub trait CpuStats: Send + Sync {
    /// Counters for every core the platform currently reports.
    /// Offline cores may be absent from the map.
    fn snapshot(&self) -> Result<HashMap<CoreId, CpuTimes>>;
}

/// `/proc/stat` backed counter source
pub struct ProcStatReader {
    path: String,
}

impl ProcStatReader {
    pub fn new() -> Self {
        Self {
            path: "/proc/stat".to_string(),
        }
    }
}

impl Default for ProcStatReader {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuStats for ProcStatReader {
    fn snapshot(&self) -> Result<HashMap<CoreId, CpuTimes>> {
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path))?;
        Ok(parse_proc_stat(&content))
    }
}

/// Parse per-cpu lines of /proc/stat ("cpuN user nice system idle iowait ...")
fn parse_proc_stat(content: &str) -> HashMap<CoreId, CpuTimes> {
    let mut map = HashMap::new();

    for line in content.lines() {
        let mut fields = line.split_whitespace();
        let Some(name) = fields.next() else { continue };
        let Some(id) = name.strip_prefix("cpu").and_then(|s| s.parse::<usize>().ok()) else {
            continue;
        };

        let ticks: Vec<u64> = fields.filter_map(|f| f.parse().ok()).collect();
        if ticks.len() < 5 {
            continue;
        }

        let wall: u64 = ticks.iter().sum();
        let idle = ticks[3] + ticks[4];
        map.insert(id, CpuTimes { wall, idle });
    }

    map
}

/// One cluster's aggregated load sample
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterLoad {
    /// Sum of per-core scaled loads
    pub load: u32,
    /// Scaled load of each core that contributed
    pub core_loads: Vec<(CoreId, u32)>,
}

#[derive(Debug, Clone, Copy)]
struct CoreAccounting {
    prev: CpuTimes,
    /// Whether `prev` holds a valid baseline for delta computation
    latched: bool,
    cur_freq_khz: u64,
}

/// Cluster load sampler with per-core counter memory
pub struct LoadMonitor {
    topology: Topology,
    stats: Arc<dyn CpuStats>,
    cores: Mutex<HashMap<CoreId, CoreAccounting>>,
}

impl LoadMonitor {
    pub fn new(topology: Topology, stats: Arc<dyn CpuStats>) -> Self {
        Self {
            topology,
            stats,
            cores: Mutex::new(HashMap::new()),
        }
    }

    /// Sample the load of one cluster across its currently-online
    /// cores. The first sample after construction, a reset, or a core
    /// reappearing only latches counters and contributes zero.
    pub fn sample_cluster(&self, cluster: Cluster, online: &[CoreId]) -> Result<ClusterLoad> {
        let snapshot = self.stats.snapshot()?;
        let layout = self.topology.layout(cluster);

        let mut cores = self.cores.lock().unwrap();
        let mut total = 0u32;
        let mut core_loads = Vec::new();

        for &core in online {
            if !layout.contains(core) {
                continue;
            }

            let acc = cores.entry(core).or_insert_with(|| CoreAccounting {
                prev: CpuTimes::default(),
                latched: false,
                cur_freq_khz: layout.max_freq_khz,
            });

            let Some(&times) = snapshot.get(&core) else {
                // Went offline mid-sample: contributes nothing this
                // cycle, and the stale baseline is dropped.
                acc.latched = false;
                continue;
            };

            let prev = acc.prev;
            let had_baseline = acc.latched;
            acc.prev = times;
            acc.latched = true;

            if !had_baseline {
                continue;
            }

            let wall_delta = times.wall.saturating_sub(prev.wall);
            if wall_delta == 0 {
                continue;
            }
            let idle_delta = times.idle.saturating_sub(prev.idle).min(wall_delta);

            let busy = 100 * (wall_delta - idle_delta) / wall_delta;
            let scaled = (busy * acc.cur_freq_khz / layout.max_freq_khz) as u32;

            total += scaled;
            core_loads.push((core, scaled));
        }

        Ok(ClusterLoad {
            load: total,
            core_loads,
        })
    }

    /// Re-latch a core's counters so the next sample sees no delta
    /// spanning an online/offline transition.
    pub fn reset_core(&self, core: CoreId) {
        let snapshot = self.stats.snapshot().ok();
        let mut cores = self.cores.lock().unwrap();
        let freq = self.default_freq(core);
        let acc = cores.entry(core).or_insert_with(|| CoreAccounting {
            prev: CpuTimes::default(),
            latched: false,
            cur_freq_khz: freq,
        });
        relatch(acc, snapshot.as_ref(), core);
    }

    /// Record a frequency change for a core and flush its counters,
    /// so load before the change is not scaled by the new frequency.
    pub fn set_core_freq(&self, core: CoreId, khz: u64) {
        let snapshot = self.stats.snapshot().ok();
        let mut cores = self.cores.lock().unwrap();
        let freq = self.default_freq(core);
        let acc = cores.entry(core).or_insert_with(|| CoreAccounting {
            prev: CpuTimes::default(),
            latched: false,
            cur_freq_khz: freq,
        });
        acc.cur_freq_khz = khz;
        relatch(acc, snapshot.as_ref(), core);
    }

    fn default_freq(&self, core: CoreId) -> u64 {
        self.topology
            .cluster_of(core)
            .map(|c| self.topology.layout(c).max_freq_khz)
            .unwrap_or(1)
    }
}

fn relatch(acc: &mut CoreAccounting, snapshot: Option<&HashMap<CoreId, CpuTimes>>, core: CoreId) {
    match snapshot.and_then(|s| s.get(&core)) {
        Some(&times) => {
            acc.prev = times;
            acc.latched = true;
        }
        None => acc.latched = false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopologyConfig;
    use anyhow::anyhow;

    struct FakeStats {
        times: Mutex<HashMap<CoreId, CpuTimes>>,
        fail: Mutex<bool>,
    }

    impl FakeStats {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                times: Mutex::new(HashMap::new()),
                fail: Mutex::new(false),
            })
        }

        fn set(&self, core: CoreId, wall: u64, idle: u64) {
            self.times
                .lock()
                .unwrap()
                .insert(core, CpuTimes { wall, idle });
        }

        fn remove(&self, core: CoreId) {
            self.times.lock().unwrap().remove(&core);
        }

        fn set_fail(&self, fail: bool) {
            *self.fail.lock().unwrap() = fail;
        }
    }

    impl CpuStats for FakeStats {
        fn snapshot(&self) -> Result<HashMap<CoreId, CpuTimes>> {
            if *self.fail.lock().unwrap() {
                return Err(anyhow!("counters unavailable"));
            }
            Ok(self.times.lock().unwrap().clone())
        }
    }

    fn monitor() -> (LoadMonitor, Arc<FakeStats>) {
        let topology = Topology::from_config(&TopologyConfig::default()).unwrap();
        let stats = FakeStats::new();
        for core in 0..8 {
            stats.set(core, 0, 0);
        }
        (LoadMonitor::new(topology, Arc::clone(&stats) as Arc<dyn CpuStats>), stats)
    }

    #[test]
    fn test_first_sample_is_zero() {
        let (monitor, _stats) = monitor();
        let load = monitor.sample_cluster(Cluster::Efficiency, &[0, 1, 2, 3]).unwrap();
        assert_eq!(load.load, 0);
        assert!(load.core_loads.is_empty());
    }

    #[test]
    fn test_busy_delta() {
        let (monitor, stats) = monitor();
        monitor.sample_cluster(Cluster::Efficiency, &[0, 1]).unwrap();

        // Core 0 fully busy, core 1 half busy.
        stats.set(0, 100, 0);
        stats.set(1, 100, 50);
        let load = monitor.sample_cluster(Cluster::Efficiency, &[0, 1]).unwrap();
        assert_eq!(load.load, 150);
        assert_eq!(load.core_loads, vec![(0, 100), (1, 50)]);
    }

    #[test]
    fn test_frequency_scaling() {
        let (monitor, stats) = monitor();
        monitor.sample_cluster(Cluster::Efficiency, &[1]).unwrap();

        // Half the cluster max frequency: full busy reads as 50.
        monitor.set_core_freq(1, 1_586_000 / 2);
        stats.set(1, 100, 0);
        let load = monitor.sample_cluster(Cluster::Efficiency, &[1]).unwrap();
        assert_eq!(load.load, 50);
    }

    #[test]
    fn test_reset_drops_stale_delta() {
        let (monitor, stats) = monitor();
        monitor.sample_cluster(Cluster::Efficiency, &[1]).unwrap();

        // A busy burst happens, then the core is reset (offline/online
        // round trip). Only activity after the reset may count.
        stats.set(1, 1000, 0);
        monitor.reset_core(1);
        stats.set(1, 1100, 100);
        let load = monitor.sample_cluster(Cluster::Efficiency, &[1]).unwrap();
        assert_eq!(load.load, 0, "burst before reset leaked into the sample");
    }

    #[test]
    fn test_core_vanishing_mid_sample() {
        let (monitor, stats) = monitor();
        monitor.sample_cluster(Cluster::Efficiency, &[1]).unwrap();

        stats.remove(1);
        let load = monitor.sample_cluster(Cluster::Efficiency, &[1]).unwrap();
        assert_eq!(load.load, 0);

        // When it comes back, the first sample only re-latches.
        stats.set(1, 5000, 0);
        let load = monitor.sample_cluster(Cluster::Efficiency, &[1]).unwrap();
        assert_eq!(load.load, 0);

        stats.set(1, 5100, 50);
        let load = monitor.sample_cluster(Cluster::Efficiency, &[1]).unwrap();
        assert_eq!(load.load, 50);
    }

    #[test]
    fn test_snapshot_failure_propagates() {
        let (monitor, stats) = monitor();
        stats.set_fail(true);
        assert!(monitor.sample_cluster(Cluster::Efficiency, &[0]).is_err());
    }

    #[test]
    fn test_parse_proc_stat() {
        let content = "cpu  100 0 100 700 50 0 0 0 0 0\n\
                       cpu0 50 0 50 350 25 0 0 0 0 0\n\
                       cpu1 50 0 50 350 25 0 0 0 0 0\n\
                       intr 12345\n";
        let map = parse_proc_stat(content);
        assert_eq!(map.len(), 2);
        assert_eq!(map[&0], CpuTimes { wall: 475, idle: 375 });
    }
}
