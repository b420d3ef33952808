//! Control loop
//!
//! One decision cycle samples per-cluster load, aggregates the active
//! constraints, computes a target core count for each cluster and
//! drives the executor toward it. Cycles run on a timer whose period
//! depends on the power mode, and immediately when a constraint, the
//! target feed, or a power event changes. A cycle never overlaps
//! another: suspend and shutdown serialize against in-flight cycles
//! through the same lock.

use crate::config::ControlConfig;
use crate::events::{EventBus, PowerEvent};
use crate::executor::TransitionExecutor;
use crate::load::LoadMonitor;
use crate::policy::{self, PowerMode, TargetFeed};
use crate::qos::{BoundKind, CoreCountQos, REQ_DISPLAY};
use crate::topology::{Cluster, CoreId, Topology};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Why the loop was woken outside its timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    ConstraintChange,
    TargetChange,
    ModeChange,
    Boost,
    TunableChange,
    Resume,
}

/// Runtime-adjustable knobs, seeded from configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Tunables {
    pub normal_poll_ms: u64,
    pub lowpower_poll_ms: u64,
    pub stay_on_cycles: u32,
    pub log_decisions: bool,
}

impl Tunables {
    fn from_config(config: &ControlConfig) -> Self {
        Self {
            normal_poll_ms: config.normal_poll_ms,
            lowpower_poll_ms: config.lowpower_poll_ms,
            stay_on_cycles: config.stay_on_cycles,
            log_decisions: config.log_decisions,
        }
    }
}

#[derive(Debug)]
struct ControlState {
    enabled: bool,
    suspended: bool,
    mode: PowerMode,
    feed: TargetFeed,
    /// Remaining decision cycles the performance cluster is boosted
    stay_on: u32,
    /// Cores parked by suspend, restored on resume
    presleep: Vec<CoreId>,
    last_load: HashMap<Cluster, u32>,
    last_target: HashMap<Cluster, usize>,
    cycles: u64,
}

/// One cluster's slice of the status report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub cluster: Cluster,
    pub online: Vec<CoreId>,
    pub target: Option<usize>,
    pub min: usize,
    pub max: usize,
    pub load: u32,
}

/// Full controller status for the IPC surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerStatus {
    pub enabled: bool,
    pub suspended: bool,
    pub mode: PowerMode,
    pub feed: TargetFeed,
    pub stay_on_remaining: u32,
    pub cycles: u64,
    pub tunables: Tunables,
    pub clusters: Vec<ClusterStatus>,
}

/// Core-count controller
pub struct Controller {
    topology: Topology,
    qos: Arc<CoreCountQos>,
    load: Arc<LoadMonitor>,
    executor: Arc<TransitionExecutor>,
    bus: EventBus,
    tunables: Mutex<Tunables>,
    state: Mutex<ControlState>,
    /// Serializes decision cycles against suspend and shutdown
    cycle_lock: Mutex<()>,
    wake_tx: mpsc::UnboundedSender<WakeReason>,
    wake_rx: Mutex<Option<mpsc::UnboundedReceiver<WakeReason>>>,
}

impl Controller {
    pub fn new(
        topology: Topology,
        qos: Arc<CoreCountQos>,
        load: Arc<LoadMonitor>,
        executor: Arc<TransitionExecutor>,
        bus: EventBus,
        config: &ControlConfig,
    ) -> Arc<Self> {
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let efficiency_size = topology.layout(Cluster::Efficiency).core_count;

        let controller = Arc::new(Self {
            topology,
            qos,
            load,
            executor,
            bus,
            tunables: Mutex::new(Tunables::from_config(config)),
            state: Mutex::new(ControlState {
                enabled: true,
                suspended: false,
                mode: PowerMode::Normal,
                feed: TargetFeed::initial(efficiency_size),
                stay_on: 0,
                presleep: Vec::new(),
                last_load: HashMap::new(),
                last_target: HashMap::new(),
                cycles: 0,
            }),
            cycle_lock: Mutex::new(()),
            wake_tx,
            wake_rx: Mutex::new(Some(wake_rx)),
        });

        let tx = controller.wake_tx.clone();
        controller.qos.subscribe(move || {
            let _ = tx.send(WakeReason::ConstraintChange);
        });

        controller
    }

    fn wake(&self, reason: WakeReason) {
        let _ = self.wake_tx.send(reason);
    }

    /// Period until the next scheduled cycle. None means the loop is
    /// parked and only external wakes advance it.
    fn poll_period(&self) -> Option<Duration> {
        let state = self.state.lock().unwrap();
        if !state.enabled || state.suspended {
            return None;
        }
        let tunables = self.tunables.lock().unwrap();
        let ms = match state.mode {
            PowerMode::Normal => tunables.normal_poll_ms,
            PowerMode::LowPower => tunables.lowpower_poll_ms,
        };
        Some(Duration::from_millis(ms))
    }

    /// Run one decision cycle. Does nothing while the controller is
    /// disabled or the system is suspending.
    pub fn run_cycle(&self) {
        let _cycle = self.cycle_lock.lock().unwrap();

        let (feed, mode, stay_on, log_decisions) = {
            let state = self.state.lock().unwrap();
            if !state.enabled || state.suspended {
                return;
            }
            let tunables = self.tunables.lock().unwrap();
            (state.feed, state.mode, state.stay_on, tunables.log_decisions)
        };

        // Load sampling is advisory; a failed read never stalls the
        // decision itself.
        for cluster in Cluster::ALL {
            let online = self.executor.online_cores(cluster);
            match self.load.sample_cluster(cluster, &online) {
                Ok(sample) => {
                    self.state
                        .lock()
                        .unwrap()
                        .last_load
                        .insert(cluster, sample.load);
                }
                Err(e) => warn!("{} load sample failed: {:#}", cluster, e),
            }
        }

        // Performance first: shrinking it frees headroom before the
        // efficiency side is resized.
        for cluster in [Cluster::Performance, Cluster::Efficiency] {
            let size = self.topology.layout(cluster).core_count;
            let bounds = self.qos.bounds(cluster);
            let target = policy::decide(cluster, size, feed, bounds, mode, stay_on);
            self.state
                .lock()
                .unwrap()
                .last_target
                .insert(cluster, target);

            let before = self.executor.online_count(cluster);
            match self.executor.apply_target(cluster, target) {
                Ok(count) => {
                    if log_decisions && count != before {
                        info!(
                            "{} cluster {} -> {} cores (bounds {}..{})",
                            cluster, before, count, bounds.min, bounds.max
                        );
                    }
                }
                // Already logged by the executor; retried next cycle.
                Err(_) => {}
            }
        }

        let expired = {
            let mut state = self.state.lock().unwrap();
            state.cycles += 1;
            if state.stay_on > 0 {
                state.stay_on -= 1;
                state.stay_on == 0
            } else {
                false
            }
        };
        if expired {
            self.bus.publish(PowerEvent::BoostExpired);
        }
    }

    /// Timer- and wake-driven cycle loop. Runs until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let rx = self.wake_rx.lock().unwrap().take();
        let Some(mut wake) = rx else {
            error!("controller loop started twice");
            return;
        };

        loop {
            self.run_cycle();

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                reason = wake.recv() => {
                    match reason {
                        Some(reason) => debug!("woken: {:?}", reason),
                        None => break,
                    }
                }
                _ = idle_or_sleep(self.poll_period()) => {}
            }
        }
        info!("control loop stopped");
    }

    /// Replace the externally fed cluster targets
    pub fn set_targets(&self, feed: TargetFeed) {
        let efficiency_size = self.topology.layout(Cluster::Efficiency).core_count;
        let mut feed = feed;
        feed.efficiency_target = feed.efficiency_target.min(efficiency_size);

        self.state.lock().unwrap().feed = feed;
        self.wake(WakeReason::TargetChange);
    }

    /// Arm the performance stay-on window
    pub fn boost(&self) {
        let cycles = self.tunables.lock().unwrap().stay_on_cycles;
        self.state.lock().unwrap().stay_on = cycles;
        self.wake(WakeReason::Boost);
    }

    /// Track display blank state. A blanked display caps the
    /// performance cluster at zero cores through the aggregator, so
    /// other subsystems' min requests still win by intersection.
    /// Unblanking lifts the cap and requests a re-evaluation.
    pub fn set_display(&self, blank: bool) {
        let mode = if blank {
            PowerMode::LowPower
        } else {
            PowerMode::Normal
        };

        {
            let mut state = self.state.lock().unwrap();
            if state.mode == mode {
                return;
            }
            state.mode = mode;
        }

        if blank {
            self.qos
                .update(REQ_DISPLAY, Cluster::Performance, BoundKind::Max, 0);
        } else {
            self.qos
                .remove(REQ_DISPLAY, Cluster::Performance, BoundKind::Max);
        }

        info!("display {}", if blank { "blank" } else { "unblank" });
        self.wake(WakeReason::ModeChange);
    }

    /// Enter suspend: wait out any in-flight cycle, then park every
    /// non-primary core. Further cycles no-op until resume.
    pub fn suspend_prepare(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.suspended = true;
            state.stay_on = 0;
        }
        let _cycle = self.cycle_lock.lock().unwrap();

        let parked = self.executor.force_offline_for_sleep();
        info!("suspend: parked {} cores", parked.len());
        self.state.lock().unwrap().presleep = parked;
    }

    /// Resume from suspend: restore the pre-sleep online set and
    /// release the loop.
    pub fn post_suspend(&self) {
        let parked = std::mem::take(&mut self.state.lock().unwrap().presleep);
        self.executor.restore_after_sleep(&parked);
        info!("resume: restored {} cores", parked.len());

        self.state.lock().unwrap().suspended = false;
        self.wake(WakeReason::Resume);
    }

    /// Reboot or power-off: stop making decisions for the remaining
    /// process lifetime. Core state is left exactly as the last cycle
    /// set it, no restoration.
    pub fn shutdown_prepare(&self) {
        self.state.lock().unwrap().enabled = false;
        let _cycle = self.cycle_lock.lock().unwrap();
        info!("shutdown: controller stopped");
    }

    /// Enable or disable decision cycles at runtime
    pub fn set_enabled(&self, enabled: bool) {
        self.state.lock().unwrap().enabled = enabled;
        info!("controller {}", if enabled { "enabled" } else { "disabled" });
        if enabled {
            self.wake(WakeReason::TunableChange);
        }
    }

    /// Adjust polling periods; zero is rejected
    pub fn set_polling(&self, normal_ms: u64, lowpower_ms: u64) -> anyhow::Result<()> {
        if normal_ms == 0 || lowpower_ms == 0 {
            anyhow::bail!("polling periods must be non-zero");
        }
        let mut tunables = self.tunables.lock().unwrap();
        tunables.normal_poll_ms = normal_ms;
        tunables.lowpower_poll_ms = lowpower_ms;
        drop(tunables);
        self.wake(WakeReason::TunableChange);
        Ok(())
    }

    pub fn set_stay_on_cycles(&self, cycles: u32) {
        self.tunables.lock().unwrap().stay_on_cycles = cycles;
    }

    pub fn set_decision_log(&self, enabled: bool) {
        self.tunables.lock().unwrap().log_decisions = enabled;
    }

    /// Record an out-of-cycle frequency change. Only refreshes the
    /// load accounting; the loop is not woken for it.
    pub fn handle_frequency_change(&self, core: CoreId, khz: u64) {
        if self.topology.cluster_of(core).is_none() {
            warn!("frequency change for unknown core {}", core);
            return;
        }
        self.load.set_core_freq(core, khz);
    }

    pub fn status(&self) -> ControllerStatus {
        let state = self.state.lock().unwrap();
        let tunables = *self.tunables.lock().unwrap();

        let clusters = Cluster::ALL
            .into_iter()
            .map(|cluster| {
                let bounds = self.qos.bounds(cluster);
                ClusterStatus {
                    cluster,
                    online: self.executor.online_cores(cluster),
                    target: state.last_target.get(&cluster).copied(),
                    min: bounds.min,
                    max: bounds.max,
                    load: state.last_load.get(&cluster).copied().unwrap_or(0),
                }
            })
            .collect();

        ControllerStatus {
            enabled: state.enabled,
            suspended: state.suspended,
            mode: state.mode,
            feed: state.feed,
            stay_on_remaining: state.stay_on,
            cycles: state.cycles,
            tunables,
            clusters,
        }
    }
}

async fn idle_or_sleep(period: Option<Duration>) {
    match period {
        Some(period) => tokio::time::sleep(period).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopologyConfig;
    use crate::executor::CpuControl;
    use crate::load::{CpuStats, CpuTimes};
    use anyhow::Result;
    use std::collections::BTreeSet;
    use std::io;

    struct FakeStats;

    impl CpuStats for FakeStats {
        fn snapshot(&self) -> Result<HashMap<CoreId, CpuTimes>> {
            Ok((0..8).map(|c| (c, CpuTimes::default())).collect())
        }
    }

    struct FakeCpu {
        online: Mutex<BTreeSet<CoreId>>,
    }

    impl CpuControl for FakeCpu {
        fn is_online(&self, core: CoreId) -> bool {
            self.online.lock().unwrap().contains(&core)
        }

        fn bring_online(&self, core: CoreId) -> io::Result<()> {
            self.online.lock().unwrap().insert(core);
            Ok(())
        }

        fn take_offline(&self, core: CoreId) -> io::Result<()> {
            self.online.lock().unwrap().remove(&core);
            Ok(())
        }
    }

    fn controller() -> (Arc<Controller>, EventBus) {
        controller_with(Arc::new(FakeCpu {
            online: Mutex::new((0..8).collect()),
        }))
    }

    fn controller_with(cpu: Arc<dyn CpuControl>) -> (Arc<Controller>, EventBus) {
        let topology = Topology::from_config(&TopologyConfig::default()).unwrap();
        let load = Arc::new(LoadMonitor::new(topology.clone(), Arc::new(FakeStats)));
        let executor = Arc::new(TransitionExecutor::new(
            topology.clone(),
            cpu,
            Arc::clone(&load),
        ));
        let qos = Arc::new(CoreCountQos::new(topology.clone()));
        let bus = EventBus::new(16);
        let config = ControlConfig {
            stay_on_cycles: 3,
            ..ControlConfig::default()
        };
        let ctl = Controller::new(topology, qos, load, executor, bus.clone(), &config);
        (ctl, bus)
    }

    fn online(ctl: &Controller, cluster: Cluster) -> usize {
        ctl.executor.online_count(cluster)
    }

    #[test]
    fn test_performance_cluster_follows_feed_to_zero() {
        let (ctl, _bus) = controller();
        ctl.set_targets(TargetFeed {
            performance_on: false,
            efficiency_target: 4,
        });
        ctl.run_cycle();
        assert_eq!(online(&ctl, Cluster::Performance), 0);
        assert_eq!(online(&ctl, Cluster::Efficiency), 4);
    }

    #[test]
    fn test_min_floor_keeps_cores_up() {
        let (ctl, _bus) = controller();
        ctl.qos
            .update("test", Cluster::Performance, BoundKind::Min, 2);
        ctl.set_targets(TargetFeed {
            performance_on: false,
            efficiency_target: 4,
        });
        ctl.run_cycle();
        assert_eq!(online(&ctl, Cluster::Performance), 2);
    }

    #[test]
    fn test_conflicting_bounds_prefer_min() {
        let (ctl, _bus) = controller();
        ctl.qos
            .update("a", Cluster::Performance, BoundKind::Min, 3);
        ctl.qos
            .update("b", Cluster::Performance, BoundKind::Max, 1);
        assert_eq!(
            ctl.qos.bounds(Cluster::Performance),
            crate::qos::Bounds { min: 3, max: 1 }
        );

        ctl.set_targets(TargetFeed {
            performance_on: false,
            efficiency_target: 4,
        });
        ctl.run_cycle();
        assert_eq!(online(&ctl, Cluster::Performance), 3);
    }

    #[test]
    fn test_efficiency_follows_feed_only_when_blanked() {
        let (ctl, _bus) = controller();
        ctl.set_targets(TargetFeed {
            performance_on: true,
            efficiency_target: 2,
        });

        ctl.run_cycle();
        assert_eq!(online(&ctl, Cluster::Efficiency), 4);

        ctl.set_display(true);
        ctl.run_cycle();
        assert_eq!(online(&ctl, Cluster::Efficiency), 2);

        ctl.set_display(false);
        ctl.run_cycle();
        assert_eq!(online(&ctl, Cluster::Efficiency), 4);
    }

    #[test]
    fn test_unblank_only_lifts_the_cap() {
        let (ctl, _bus) = controller();
        ctl.set_targets(TargetFeed {
            performance_on: false,
            efficiency_target: 4,
        });
        ctl.set_display(true);
        ctl.run_cycle();
        assert_eq!(online(&ctl, Cluster::Performance), 0);

        // Unblank restores the default bounds and nothing more; the
        // feed still holds the cluster off.
        ctl.set_display(false);
        ctl.run_cycle();
        assert_eq!(online(&ctl, Cluster::Performance), 0);
        assert_eq!(
            ctl.qos.bounds(Cluster::Performance),
            crate::qos::Bounds { min: 0, max: 4 }
        );
    }

    #[test]
    fn test_blank_caps_performance_cluster() {
        let (ctl, _bus) = controller();
        ctl.run_cycle();
        assert_eq!(online(&ctl, Cluster::Performance), 4);

        ctl.set_display(true);
        ctl.run_cycle();
        assert_eq!(online(&ctl, Cluster::Performance), 0);

        // A min floor from another subsystem still wins by
        // intersection (the conflict prefers min).
        ctl.qos.update("touch", Cluster::Performance, BoundKind::Min, 2);
        ctl.run_cycle();
        assert_eq!(online(&ctl, Cluster::Performance), 2);
    }

    #[tokio::test]
    async fn test_boost_holds_for_configured_cycles() {
        let (ctl, bus) = controller();
        let mut events = bus.subscribe();

        ctl.set_targets(TargetFeed {
            performance_on: false,
            efficiency_target: 4,
        });
        ctl.run_cycle();
        assert_eq!(online(&ctl, Cluster::Performance), 0);

        // stay_on_cycles is 3: three cycles at max, then release.
        ctl.boost();
        for _ in 0..3 {
            ctl.run_cycle();
            assert_eq!(online(&ctl, Cluster::Performance), 4);
        }
        assert_eq!(events.try_recv().unwrap(), PowerEvent::BoostExpired);

        ctl.run_cycle();
        assert_eq!(online(&ctl, Cluster::Performance), 0);
    }

    #[test]
    fn test_disabled_controller_changes_nothing() {
        let (ctl, _bus) = controller();
        ctl.set_enabled(false);
        ctl.set_targets(TargetFeed {
            performance_on: false,
            efficiency_target: 0,
        });
        ctl.run_cycle();
        assert_eq!(online(&ctl, Cluster::Performance), 4);
        assert_eq!(online(&ctl, Cluster::Efficiency), 4);

        ctl.set_enabled(true);
        ctl.run_cycle();
        assert_eq!(online(&ctl, Cluster::Performance), 0);
    }

    #[test]
    fn test_blank_with_external_ceiling() {
        let (ctl, _bus) = controller();
        ctl.run_cycle();

        // Another subsystem caps efficiency at 2, the feed asks for 1,
        // and the display blanks: 1 wins, shrinking from the top.
        ctl.qos
            .update("thermal", Cluster::Efficiency, BoundKind::Max, 2);
        ctl.set_targets(TargetFeed {
            performance_on: true,
            efficiency_target: 1,
        });
        ctl.set_display(true);
        ctl.run_cycle();
        assert_eq!(ctl.executor.online_cores(Cluster::Efficiency), vec![0]);
    }

    #[test]
    fn test_suspend_parks_and_resume_restores() {
        let (ctl, _bus) = controller();
        ctl.run_cycle();

        ctl.suspend_prepare();
        assert_eq!(online(&ctl, Cluster::Performance), 0);
        assert_eq!(ctl.executor.online_cores(Cluster::Efficiency), vec![0]);

        // Cycles while suspended are inert.
        ctl.run_cycle();
        assert_eq!(online(&ctl, Cluster::Performance), 0);

        ctl.post_suspend();
        assert_eq!(online(&ctl, Cluster::Performance), 4);
        assert_eq!(online(&ctl, Cluster::Efficiency), 4);
    }

    #[test]
    fn test_shutdown_stops_and_touches_nothing() {
        let (ctl, _bus) = controller();
        ctl.qos
            .update("thermal", Cluster::Performance, BoundKind::Max, 2);
        ctl.run_cycle();
        assert_eq!(online(&ctl, Cluster::Performance), 2);

        ctl.shutdown_prepare();
        // No restoration: the count stays within the bounds last in
        // effect, and further cycles are inert.
        assert_eq!(online(&ctl, Cluster::Performance), 2);
        ctl.run_cycle();
        assert_eq!(online(&ctl, Cluster::Performance), 2);
    }

    #[test]
    fn test_expired_boot_floor_releases() {
        let (ctl, _bus) = controller();
        ctl.qos.update_with_timeout(
            crate::qos::REQ_BOOT,
            Cluster::Performance,
            BoundKind::Min,
            4,
            Duration::ZERO,
        );
        ctl.set_targets(TargetFeed {
            performance_on: false,
            efficiency_target: 4,
        });
        ctl.run_cycle();
        assert_eq!(online(&ctl, Cluster::Performance), 0);
    }

    #[test]
    fn test_status_reflects_state() {
        let (ctl, _bus) = controller();
        ctl.set_targets(TargetFeed {
            performance_on: false,
            efficiency_target: 4,
        });
        ctl.run_cycle();

        let status = ctl.status();
        assert!(status.enabled);
        assert_eq!(status.cycles, 1);
        assert_eq!(status.mode, PowerMode::Normal);

        let perf = status
            .clusters
            .iter()
            .find(|c| c.cluster == Cluster::Performance)
            .unwrap();
        assert_eq!(perf.target, Some(0));
        assert!(perf.online.is_empty());
    }

    /// Core control that parks inside `take_offline` for one chosen
    /// core until released, so a shrink can be held mid-flight.
    struct StallCpu {
        online: Mutex<BTreeSet<CoreId>>,
        ops: Mutex<Vec<CoreId>>,
        stall_core: CoreId,
        stalled: Mutex<bool>,
        entered_tx: std::sync::mpsc::Sender<()>,
        release_rx: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl CpuControl for StallCpu {
        fn is_online(&self, core: CoreId) -> bool {
            self.online.lock().unwrap().contains(&core)
        }

        fn bring_online(&self, core: CoreId) -> io::Result<()> {
            self.online.lock().unwrap().insert(core);
            Ok(())
        }

        fn take_offline(&self, core: CoreId) -> io::Result<()> {
            let mut stalled = self.stalled.lock().unwrap();
            if core == self.stall_core && !*stalled {
                *stalled = true;
                drop(stalled);
                self.entered_tx.send(()).unwrap();
                self.release_rx.lock().unwrap().recv().unwrap();
            }
            self.ops.lock().unwrap().push(core);
            self.online.lock().unwrap().remove(&core);
            Ok(())
        }
    }

    #[test]
    fn test_suspend_waits_for_inflight_shrink() {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let cpu = Arc::new(StallCpu {
            online: Mutex::new((0..8).collect()),
            ops: Mutex::new(Vec::new()),
            stall_core: 6,
            stalled: Mutex::new(false),
            entered_tx,
            release_rx: Mutex::new(release_rx),
        });
        let (ctl, _bus) = controller_with(Arc::clone(&cpu) as Arc<dyn CpuControl>);
        ctl.set_targets(TargetFeed {
            performance_on: false,
            efficiency_target: 4,
        });

        std::thread::scope(|s| {
            let c = &ctl;
            let worker = s.spawn(move || c.run_cycle());
            // The shrink took core 7 down and is now parked on core 6.
            entered_rx.recv().unwrap();

            let coordinator = s.spawn(move || c.suspend_prepare());
            while !c.state.lock().unwrap().suspended {
                std::thread::yield_now();
            }

            release_tx.send(()).unwrap();
            worker.join().unwrap();
            coordinator.join().unwrap();
        });

        // The cycle's shrink ran to completion (7..4) before the
        // coordinator touched any core (3..1, primary 0 retained).
        let ops = cpu.ops.lock().unwrap().clone();
        assert_eq!(ops, vec![7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(ctl.executor.online_cores(Cluster::Efficiency), vec![0]);

        // Resume restores only the cores the coordinator parked; the
        // performance cluster was already offline before suspend.
        ctl.post_suspend();
        assert_eq!(
            ctl.executor.online_cores(Cluster::Efficiency),
            vec![0, 1, 2, 3]
        );
        assert_eq!(online(&ctl, Cluster::Performance), 0);
    }

    #[test]
    fn test_concurrent_stress_keeps_invariants() {
        let (ctl, _bus) = controller();

        std::thread::scope(|s| {
            let c = &ctl;
            s.spawn(move || {
                for i in 0..200 {
                    c.qos
                        .update("stress", Cluster::Performance, BoundKind::Min, i % 5);
                    c.qos.remove("stress", Cluster::Performance, BoundKind::Min);
                }
            });
            s.spawn(move || {
                for i in 0..100 {
                    c.set_display(i % 2 == 0);
                }
            });
            s.spawn(move || {
                for _ in 0..25 {
                    c.suspend_prepare();
                    c.post_suspend();
                }
            });
            s.spawn(move || {
                for _ in 0..200 {
                    c.run_cycle();
                }
            });
        });

        // Settle back to Normal mode with no outstanding requests and
        // verify both clusters converge to a consistent full-size state.
        ctl.set_display(false);
        ctl.run_cycle();
        assert_eq!(online(&ctl, Cluster::Efficiency), 4);
        assert_eq!(online(&ctl, Cluster::Performance), 4);
    }

    #[test]
    fn test_invalid_polling_rejected() {
        let (ctl, _bus) = controller();
        assert!(ctl.set_polling(0, 500).is_err());
        assert!(ctl.set_polling(100, 250).is_ok());
    }
}
