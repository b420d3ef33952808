//! Phalanx - Dynamic core-count control daemon
//!
//! Provides:
//! - Per-cluster core bring-up/bring-down toward externally fed targets
//! - Min/max core-count constraint aggregation across subsystems
//! - Display-driven power modes with distinct polling rates
//! - Heavy-task boost with a stay-on hold window
//! - Suspend and shutdown coordination

mod config;
mod control;
mod events;
mod executor;
mod ipc;
mod load;
mod policy;
mod qos;
mod topology;

use crate::config::PhalanxConfig;
use crate::control::{Controller, ControllerStatus};
use crate::events::{EventBus, PowerEvent};
use crate::executor::{SysfsCpuControl, TransitionExecutor};
use crate::ipc::{IpcHandler, IpcServer};
use crate::load::{LoadMonitor, ProcStatReader};
use crate::policy::TargetFeed;
use crate::qos::{BoundKind, CoreCountQos, REQ_BOOT, REQ_USER};
use crate::topology::{Cluster, Topology};
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Phalanx - core-count control daemon
#[derive(Parser, Debug)]
#[command(name = "phalanxd", version, about)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "/grimoire/system/phalanx.yaml")]
    config: PathBuf,

    /// Socket path override
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Debug mode
    #[arg(short, long)]
    debug: bool,
}

/// Daemon state
struct PhalanxState {
    topology: Topology,
    controller: Arc<Controller>,
    qos: Arc<CoreCountQos>,
    bus: EventBus,
}

impl IpcHandler for PhalanxState {
    fn get_status(&self) -> ControllerStatus {
        self.controller.status()
    }

    fn set_targets(&self, feed: TargetFeed) {
        self.controller.set_targets(feed);
    }

    fn boost(&self) {
        self.controller.boost();
    }

    fn set_bound(&self, cluster: Cluster, kind: BoundKind, value: usize) -> Result<()> {
        let size = self.topology.layout(cluster).core_count;
        if value > size {
            anyhow::bail!("{} cluster has only {} cores", cluster, size);
        }
        self.qos.update(REQ_USER, cluster, kind, value);
        Ok(())
    }

    fn clear_bound(&self, cluster: Cluster, kind: BoundKind) {
        self.qos.remove(REQ_USER, cluster, kind);
    }

    fn set_polling(&self, normal_ms: u64, lowpower_ms: u64) -> Result<()> {
        self.controller.set_polling(normal_ms, lowpower_ms)
    }

    fn set_stay_on_cycles(&self, cycles: u32) {
        self.controller.set_stay_on_cycles(cycles);
    }

    fn set_decision_log(&self, enabled: bool) {
        self.controller.set_decision_log(enabled);
    }

    fn set_enabled(&self, enabled: bool) {
        self.controller.set_enabled(enabled);
    }

    fn notify(&self, event: PowerEvent) {
        self.bus.publish(event);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = PhalanxConfig::load(&args.config)?;
    config.validate()?;

    let log_level = if args.debug {
        "debug"
    } else {
        config.daemon.log_level.as_str()
    };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    info!("Phalanx v{} starting", env!("CARGO_PKG_VERSION"));

    let topology = Topology::from_config(&config.topology)?;
    let load = Arc::new(LoadMonitor::new(
        topology.clone(),
        Arc::new(ProcStatReader::new()),
    ));
    let executor = Arc::new(TransitionExecutor::new(
        topology.clone(),
        Arc::new(SysfsCpuControl::new()),
        Arc::clone(&load),
    ));
    let qos = Arc::new(CoreCountQos::new(topology.clone()));
    let bus = EventBus::new(64);

    let controller = Controller::new(
        topology.clone(),
        Arc::clone(&qos),
        Arc::clone(&load),
        executor,
        bus.clone(),
        &config.control,
    );

    // Pin both clusters fully online for the boot window so early
    // userspace is never starved by a stale target feed.
    if config.control.boot_floor_secs > 0 {
        let floor = Duration::from_secs(config.control.boot_floor_secs);
        for cluster in Cluster::ALL {
            let size = topology.layout(cluster).core_count;
            qos.update_with_timeout(REQ_BOOT, cluster, BoundKind::Min, size, floor);
        }
        info!("boot floor armed for {:?}", floor);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let loop_controller = Arc::clone(&controller);
    tokio::spawn(async move {
        loop_controller.run(shutdown_rx).await;
    });

    let event_controller = Arc::clone(&controller);
    let event_rx = bus.subscribe();
    tokio::spawn(async move {
        event_loop(event_controller, event_rx, shutdown_tx).await;
    });

    let state = Arc::new(PhalanxState {
        topology,
        controller,
        qos,
        bus,
    });

    let socket_path = args
        .socket
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|| config.daemon.socket_path.clone());
    let server = IpcServer::new(socket_path, state);

    info!("Phalanx ready");
    server.run().await
}

/// Dispatch power events to the controller
async fn event_loop(
    controller: Arc<Controller>,
    mut events: tokio::sync::broadcast::Receiver<PowerEvent>,
    shutdown: watch::Sender<bool>,
) {
    while let Ok(event) = events.recv().await {
        match event {
            PowerEvent::DisplayBlank => controller.set_display(true),
            PowerEvent::DisplayUnblank => controller.set_display(false),
            PowerEvent::SuspendPrepare => controller.suspend_prepare(),
            PowerEvent::PostSuspend => controller.post_suspend(),
            PowerEvent::Shutdown => {
                controller.shutdown_prepare();
                let _ = shutdown.send(true);
            }
            PowerEvent::FrequencyChanged { core, khz } => {
                controller.handle_frequency_change(core, khz);
            }
            PowerEvent::HeavyTaskMigration => controller.boost(),
            PowerEvent::BoostExpired => debug!("boost window expired"),
        }
    }
}
