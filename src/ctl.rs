//! phalanxctl - Phalanx control utility

mod config;
mod control;
mod events;
mod executor;
mod ipc;
mod load;
mod policy;
mod qos;
mod topology;

use crate::events::PowerEvent;
use crate::ipc::{IpcClient, IpcRequest};
use crate::qos::BoundKind;
use crate::topology::Cluster;
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};

/// Phalanx control utility
#[derive(Parser)]
#[command(name = "phalanxctl", version, about = "Control the Phalanx core daemon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Socket path
    #[arg(long, default_value = "/run/phalanx/phalanx.sock")]
    socket: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Show controller status
    Status,

    /// Set the cluster target feed
    Target {
        /// Performance cluster power: on or off
        performance: String,

        /// Efficiency cluster core count
        efficiency: usize,
    },

    /// Arm the performance boost window
    Boost,

    /// Core-count bound management
    Bound {
        #[command(subcommand)]
        command: BoundCommands,
    },

    /// Runtime tunables
    Tune {
        #[command(subcommand)]
        command: TuneCommands,
    },

    /// Enable the controller
    Enable,

    /// Disable the controller
    Disable,

    /// Inject a power event
    Notify {
        #[command(subcommand)]
        command: NotifyCommands,
    },
}

#[derive(Subcommand)]
enum BoundCommands {
    /// Set a min or max bound on a cluster
    Set {
        /// Cluster: efficiency or performance
        cluster: String,

        /// Bound kind: min or max
        kind: String,

        /// Core count
        value: usize,
    },

    /// Clear a previously set bound
    Clear {
        /// Cluster: efficiency or performance
        cluster: String,

        /// Bound kind: min or max
        kind: String,
    },
}

#[derive(Subcommand)]
enum TuneCommands {
    /// Set polling periods in milliseconds
    Polling { normal_ms: u64, lowpower_ms: u64 },

    /// Set how many cycles a boost holds
    StayOn { cycles: u32 },

    /// Toggle per-decision logging: on or off
    LogDecisions { state: String },
}

#[derive(Subcommand)]
enum NotifyCommands {
    /// Display turned off
    Blank,

    /// Display turned on
    Unblank,

    /// System suspend is starting
    Suspend,

    /// System resumed
    Resume,

    /// Reboot or power-off in progress
    Shutdown,

    /// A heavy task migrated to the performance cluster
    Migration,

    /// A core changed frequency
    Freq {
        /// Core id
        core: usize,

        /// New frequency in kHz
        khz: u64,
    },
}

fn parse_cluster(s: &str) -> Result<Cluster> {
    match s {
        "efficiency" => Ok(Cluster::Efficiency),
        "performance" => Ok(Cluster::Performance),
        other => Err(anyhow!("unknown cluster '{}'", other)),
    }
}

fn parse_kind(s: &str) -> Result<BoundKind> {
    match s {
        "min" => Ok(BoundKind::Min),
        "max" => Ok(BoundKind::Max),
        other => Err(anyhow!("unknown bound kind '{}'", other)),
    }
}

fn parse_switch(s: &str) -> Result<bool> {
    match s {
        "on" => Ok(true),
        "off" => Ok(false),
        other => Err(anyhow!("expected 'on' or 'off', got '{}'", other)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = IpcClient::new(&cli.socket);

    match cli.command {
        Commands::Status => {
            let status = client.get_status().await?;

            println!("Phalanx Controller Status");
            println!("=========================");
            println!(
                "Controller:    {}",
                if status.enabled { "enabled" } else { "disabled" }
            );
            println!("Suspended:     {}", if status.suspended { "yes" } else { "no" });
            println!("Mode:          {:?}", status.mode);
            println!("Cycles:        {}", status.cycles);
            println!(
                "Feed:          performance {}, efficiency {}",
                if status.feed.performance_on { "on" } else { "off" },
                status.feed.efficiency_target
            );
            if status.stay_on_remaining > 0 {
                println!("Boost:         {} cycles remaining", status.stay_on_remaining);
            }
            println!();

            for cluster in &status.clusters {
                println!("{} cluster:", cluster.cluster);
                let cores: Vec<String> =
                    cluster.online.iter().map(|c| c.to_string()).collect();
                println!(
                    "  Online:      {} [{}]",
                    cluster.online.len(),
                    cores.join(", ")
                );
                if let Some(target) = cluster.target {
                    println!("  Target:      {}", target);
                }
                println!("  Bounds:      {}..{}", cluster.min, cluster.max);
                println!("  Load:        {}", cluster.load);
            }
            println!();

            println!("Tunables:");
            println!("  Normal poll:   {} ms", status.tunables.normal_poll_ms);
            println!("  Lowpower poll: {} ms", status.tunables.lowpower_poll_ms);
            println!("  Stay-on:       {} cycles", status.tunables.stay_on_cycles);
            println!(
                "  Decision log:  {}",
                if status.tunables.log_decisions { "on" } else { "off" }
            );
        }

        Commands::Target {
            performance,
            efficiency,
        } => {
            let performance_on = parse_switch(&performance)?;
            client
                .expect_success(IpcRequest::SetTargets {
                    performance_on,
                    efficiency_target: efficiency,
                })
                .await?;
            println!(
                "Targets set: performance {}, efficiency {}",
                performance, efficiency
            );
        }

        Commands::Boost => {
            client.expect_success(IpcRequest::Boost).await?;
            println!("Boost armed");
        }

        Commands::Bound { command } => match command {
            BoundCommands::Set {
                cluster,
                kind,
                value,
            } => {
                let cluster = parse_cluster(&cluster)?;
                let kind = parse_kind(&kind)?;
                client
                    .expect_success(IpcRequest::SetBound {
                        cluster,
                        kind,
                        value,
                    })
                    .await?;
                println!("Bound set: {} {:?} = {}", cluster, kind, value);
            }

            BoundCommands::Clear { cluster, kind } => {
                let cluster = parse_cluster(&cluster)?;
                let kind = parse_kind(&kind)?;
                client
                    .expect_success(IpcRequest::ClearBound { cluster, kind })
                    .await?;
                println!("Bound cleared: {} {:?}", cluster, kind);
            }
        },

        Commands::Tune { command } => match command {
            TuneCommands::Polling {
                normal_ms,
                lowpower_ms,
            } => {
                client
                    .expect_success(IpcRequest::SetPolling {
                        normal_ms,
                        lowpower_ms,
                    })
                    .await?;
                println!("Polling set: {} ms / {} ms", normal_ms, lowpower_ms);
            }

            TuneCommands::StayOn { cycles } => {
                client
                    .expect_success(IpcRequest::SetStayOnCycles { cycles })
                    .await?;
                println!("Stay-on set: {} cycles", cycles);
            }

            TuneCommands::LogDecisions { state } => {
                let enabled = parse_switch(&state)?;
                client
                    .expect_success(IpcRequest::SetDecisionLog { enabled })
                    .await?;
                println!("Decision log: {}", state);
            }
        },

        Commands::Enable => {
            client
                .expect_success(IpcRequest::SetEnabled { enabled: true })
                .await?;
            println!("Controller enabled");
        }

        Commands::Disable => {
            client
                .expect_success(IpcRequest::SetEnabled { enabled: false })
                .await?;
            println!("Controller disabled");
        }

        Commands::Notify { command } => {
            let event = match command {
                NotifyCommands::Blank => PowerEvent::DisplayBlank,
                NotifyCommands::Unblank => PowerEvent::DisplayUnblank,
                NotifyCommands::Suspend => PowerEvent::SuspendPrepare,
                NotifyCommands::Resume => PowerEvent::PostSuspend,
                NotifyCommands::Shutdown => PowerEvent::Shutdown,
                NotifyCommands::Migration => PowerEvent::HeavyTaskMigration,
                NotifyCommands::Freq { core, khz } => {
                    PowerEvent::FrequencyChanged { core, khz }
                }
            };
            client.expect_success(IpcRequest::Notify { event }).await?;
            println!("Event delivered");
        }
    }

    Ok(())
}
