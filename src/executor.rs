//! Core transition execution
//!
//! All online/offline sequencing for a cluster happens under that
//! cluster's lock, one core at a time. Growth fills the lowest unused
//! ids first; shrinking releases the highest ids first and never
//! touches the cluster's primary core. A failing core halts the
//! sequence at the last good state; the next decision cycle retries.

use crate::load::LoadMonitor;
use crate::topology::{Cluster, CoreId, Topology};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

/// Platform primitive for powering a single core on or off.
/// May block for milliseconds and may fail; callers check the current
/// state first rather than relying on idempotence.
pub trait CpuControl: Send + Sync {
    fn is_online(&self, core: CoreId) -> bool;
    fn bring_online(&self, core: CoreId) -> io::Result<()>;
    fn take_offline(&self, core: CoreId) -> io::Result<()>;
}

/// sysfs-backed core control
pub struct SysfsCpuControl {
    root: PathBuf,
}

impl SysfsCpuControl {
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("/sys/devices/system/cpu"),
        }
    }

    fn online_path(&self, core: CoreId) -> PathBuf {
        self.root.join(format!("cpu{}", core)).join("online")
    }
}

impl Default for SysfsCpuControl {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuControl for SysfsCpuControl {
    fn is_online(&self, core: CoreId) -> bool {
        // The boot core exposes no online attribute; it is always up.
        match fs::read_to_string(self.online_path(core)) {
            Ok(s) => s.trim() == "1",
            Err(_) => true,
        }
    }

    fn bring_online(&self, core: CoreId) -> io::Result<()> {
        fs::write(self.online_path(core), "1")
    }

    fn take_offline(&self, core: CoreId) -> io::Result<()> {
        fs::write(self.online_path(core), "0")
    }
}

/// A halted transition sequence
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("bringing core {core} online failed: {source}")]
    Online { core: CoreId, source: io::Error },
    #[error("taking core {core} offline failed: {source}")]
    Offline { core: CoreId, source: io::Error },
}

/// Transition state of one cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Growing,
    Shrinking,
}

#[derive(Debug)]
struct ClusterState {
    online: BTreeSet<CoreId>,
    phase: Phase,
    /// Whether any core of the cluster is online; recomputed from the
    /// true online set after every transition, never assumed.
    active: bool,
}

/// Per-cluster serialized core bring-up/bring-down
pub struct TransitionExecutor {
    topology: Topology,
    control: Arc<dyn CpuControl>,
    load: Arc<LoadMonitor>,
    efficiency: Mutex<ClusterState>,
    performance: Mutex<ClusterState>,
}

impl TransitionExecutor {
    /// Seed each cluster's online set from the platform's view
    pub fn new(topology: Topology, control: Arc<dyn CpuControl>, load: Arc<LoadMonitor>) -> Self {
        let seed = |cluster: Cluster| {
            let online: BTreeSet<CoreId> = topology
                .layout(cluster)
                .cores()
                .filter(|&c| control.is_online(c))
                .collect();
            ClusterState {
                active: !online.is_empty(),
                online,
                phase: Phase::Idle,
            }
        };

        Self {
            efficiency: Mutex::new(seed(Cluster::Efficiency)),
            performance: Mutex::new(seed(Cluster::Performance)),
            topology,
            control,
            load,
        }
    }

    fn state(&self, cluster: Cluster) -> &Mutex<ClusterState> {
        match cluster {
            Cluster::Efficiency => &self.efficiency,
            Cluster::Performance => &self.performance,
        }
    }

    pub fn online_count(&self, cluster: Cluster) -> usize {
        self.state(cluster).lock().unwrap().online.len()
    }

    pub fn online_cores(&self, cluster: Cluster) -> Vec<CoreId> {
        self.state(cluster)
            .lock()
            .unwrap()
            .online
            .iter()
            .copied()
            .collect()
    }

    /// Whether the cluster has any core online
    pub fn is_active(&self, cluster: Cluster) -> bool {
        self.state(cluster).lock().unwrap().active
    }

    pub fn phase(&self, cluster: Cluster) -> Phase {
        self.state(cluster).lock().unwrap().phase
    }

    /// Drive the cluster to `target` online cores. On failure the
    /// cluster is left at whatever count was reached and the error is
    /// returned; reaching the target returns the resulting count.
    pub fn apply_target(&self, cluster: Cluster, target: usize) -> Result<usize, TransitionError> {
        let layout = self.topology.layout(cluster);
        let target = target.min(layout.core_count);

        let mut st = self.state(cluster).lock().unwrap();

        let result = if target > st.online.len() {
            st.phase = Phase::Growing;
            self.grow(cluster, &mut st, target)
        } else if target < st.online.len() {
            st.phase = Phase::Shrinking;
            self.shrink(cluster, &mut st, target)
        } else {
            Ok(())
        };

        st.phase = Phase::Idle;
        st.active = !st.online.is_empty();

        match result {
            Ok(()) => Ok(st.online.len()),
            Err(e) => {
                warn!(
                    "{} cluster transition halted at {} cores: {}",
                    cluster,
                    st.online.len(),
                    e
                );
                Err(e)
            }
        }
    }

    fn grow(
        &self,
        cluster: Cluster,
        st: &mut ClusterState,
        target: usize,
    ) -> Result<(), TransitionError> {
        let layout = self.topology.layout(cluster);
        for core in layout.cores() {
            if st.online.len() >= target {
                break;
            }
            if st.online.contains(&core) {
                continue;
            }
            self.control
                .bring_online(core)
                .map_err(|source| TransitionError::Online { core, source })?;
            st.online.insert(core);
            self.load.reset_core(core);
            debug!("core {} online", core);
        }
        Ok(())
    }

    fn shrink(
        &self,
        cluster: Cluster,
        st: &mut ClusterState,
        target: usize,
    ) -> Result<(), TransitionError> {
        let layout = self.topology.layout(cluster);
        for core in layout.cores().rev() {
            if st.online.len() <= target {
                break;
            }
            if layout.primary == Some(core) {
                continue;
            }
            if !st.online.contains(&core) {
                continue;
            }
            self.control
                .take_offline(core)
                .map_err(|source| TransitionError::Offline { core, source })?;
            st.online.remove(&core);
            self.load.reset_core(core);
            debug!("core {} offline", core);
        }
        Ok(())
    }

    /// Force every non-primary core of both clusters offline for
    /// system sleep, returning the cores that were online beforehand.
    /// Individual failures are logged and skipped.
    pub fn force_offline_for_sleep(&self) -> Vec<CoreId> {
        let mut stored = Vec::new();

        for cluster in [Cluster::Performance, Cluster::Efficiency] {
            let layout = self.topology.layout(cluster);
            let mut st = self.state(cluster).lock().unwrap();

            for core in layout.cores().rev() {
                if !st.online.contains(&core) {
                    continue;
                }
                if layout.primary == Some(core) {
                    continue;
                }
                stored.push(core);
                match self.control.take_offline(core) {
                    Ok(()) => {
                        st.online.remove(&core);
                        self.load.reset_core(core);
                    }
                    Err(e) => warn!("failed to park core {} for sleep: {}", core, e),
                }
            }
            st.active = !st.online.is_empty();
        }

        stored
    }

    /// Best-effort restore of the recorded pre-sleep online set
    pub fn restore_after_sleep(&self, cores: &[CoreId]) {
        let mut cores: Vec<CoreId> = cores.to_vec();
        cores.sort_unstable();

        for core in cores {
            let Some(cluster) = self.topology.cluster_of(core) else {
                continue;
            };
            let mut st = self.state(cluster).lock().unwrap();
            if st.online.contains(&core) {
                continue;
            }
            match self.control.bring_online(core) {
                Ok(()) => {
                    st.online.insert(core);
                    st.active = true;
                    self.load.reset_core(core);
                }
                Err(e) => warn!("failed to restore core {} after sleep: {}", core, e),
            }
        }
    }
}
