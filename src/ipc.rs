//! IPC interface for Phalanx

use crate::control::ControllerStatus;
use crate::events::PowerEvent;
use crate::policy::TargetFeed;
use crate::qos::BoundKind;
use crate::topology::Cluster;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

/// IPC request types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IpcRequest {
    /// Get full controller status
    GetStatus,

    /// Replace the cluster target feed
    SetTargets {
        performance_on: bool,
        efficiency_target: usize,
    },

    /// Arm the performance stay-on window
    Boost,

    /// Set a user min/max bound on a cluster's core count
    SetBound {
        cluster: Cluster,
        kind: BoundKind,
        value: usize,
    },

    /// Drop a previously set user bound
    ClearBound { cluster: Cluster, kind: BoundKind },

    /// Change the polling periods
    SetPolling { normal_ms: u64, lowpower_ms: u64 },

    /// Change the boost hold length
    SetStayOnCycles { cycles: u32 },

    /// Toggle per-decision logging
    SetDecisionLog { enabled: bool },

    /// Enable or disable the controller
    SetEnabled { enabled: bool },

    /// Inject a power event from platform glue
    Notify { event: PowerEvent },
}

/// IPC response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum IpcResponse {
    Success { data: serde_json::Value },
    Error { message: String },
}

/// IPC handler trait
pub trait IpcHandler: Send + Sync {
    fn get_status(&self) -> ControllerStatus;
    fn set_targets(&self, feed: TargetFeed);
    fn boost(&self);
    fn set_bound(&self, cluster: Cluster, kind: BoundKind, value: usize) -> Result<()>;
    fn clear_bound(&self, cluster: Cluster, kind: BoundKind);
    fn set_polling(&self, normal_ms: u64, lowpower_ms: u64) -> Result<()>;
    fn set_stay_on_cycles(&self, cycles: u32);
    fn set_decision_log(&self, enabled: bool);
    fn set_enabled(&self, enabled: bool);
    fn notify(&self, event: PowerEvent);
}

/// IPC server
pub struct IpcServer<H: IpcHandler> {
    socket_path: String,
    handler: Arc<H>,
}

impl<H: IpcHandler + 'static> IpcServer<H> {
    pub fn new(socket_path: impl Into<String>, handler: Arc<H>) -> Self {
        Self {
            socket_path: socket_path.into(),
            handler,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let _ = std::fs::remove_file(&self.socket_path);

        if let Some(parent) = std::path::Path::new(&self.socket_path).parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        tracing::info!("Phalanx IPC listening on {}", self.socket_path);

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let handler = Arc::clone(&self.handler);
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, handler).await {
                            tracing::error!("Client error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                }
            }
        }
    }
}

async fn handle_client<H: IpcHandler>(stream: UnixStream, handler: Arc<H>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let response = match serde_json::from_str::<IpcRequest>(&line) {
            Ok(request) => process_request(request, handler.as_ref()),
            Err(e) => IpcResponse::Error {
                message: format!("Invalid request: {}", e),
            },
        };

        let response_json = serde_json::to_string(&response)?;
        writer.write_all(response_json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        line.clear();
    }

    Ok(())
}

fn process_request<H: IpcHandler>(request: IpcRequest, handler: &H) -> IpcResponse {
    match request {
        IpcRequest::GetStatus => IpcResponse::Success {
            data: serde_json::to_value(handler.get_status()).unwrap(),
        },

        IpcRequest::SetTargets {
            performance_on,
            efficiency_target,
        } => {
            handler.set_targets(TargetFeed {
                performance_on,
                efficiency_target,
            });
            IpcResponse::Success {
                data: serde_json::json!({
                    "performance_on": performance_on,
                    "efficiency_target": efficiency_target,
                }),
            }
        }

        IpcRequest::Boost => {
            handler.boost();
            IpcResponse::Success {
                data: serde_json::json!({"action": "boost"}),
            }
        }

        IpcRequest::SetBound {
            cluster,
            kind,
            value,
        } => match handler.set_bound(cluster, kind, value) {
            Ok(()) => IpcResponse::Success {
                data: serde_json::json!({"cluster": cluster, "kind": kind, "value": value}),
            },
            Err(e) => IpcResponse::Error {
                message: e.to_string(),
            },
        },

        IpcRequest::ClearBound { cluster, kind } => {
            handler.clear_bound(cluster, kind);
            IpcResponse::Success {
                data: serde_json::json!({"cluster": cluster, "kind": kind}),
            }
        }

        IpcRequest::SetPolling {
            normal_ms,
            lowpower_ms,
        } => match handler.set_polling(normal_ms, lowpower_ms) {
            Ok(()) => IpcResponse::Success {
                data: serde_json::json!({"normal_ms": normal_ms, "lowpower_ms": lowpower_ms}),
            },
            Err(e) => IpcResponse::Error {
                message: e.to_string(),
            },
        },

        IpcRequest::SetStayOnCycles { cycles } => {
            handler.set_stay_on_cycles(cycles);
            IpcResponse::Success {
                data: serde_json::json!({"cycles": cycles}),
            }
        }

        IpcRequest::SetDecisionLog { enabled } => {
            handler.set_decision_log(enabled);
            IpcResponse::Success {
                data: serde_json::json!({"log_decisions": enabled}),
            }
        }

        IpcRequest::SetEnabled { enabled } => {
            handler.set_enabled(enabled);
            IpcResponse::Success {
                data: serde_json::json!({"enabled": enabled}),
            }
        }

        IpcRequest::Notify { event } => {
            handler.notify(event);
            IpcResponse::Success {
                data: serde_json::json!({"delivered": event}),
            }
        }
    }
}

/// IPC client
pub struct IpcClient {
    socket_path: String,
}

impl IpcClient {
    pub fn new(socket_path: impl Into<String>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub async fn send(&self, request: IpcRequest) -> Result<IpcResponse> {
        let mut stream = UnixStream::connect(&self.socket_path).await?;

        let request_json = serde_json::to_string(&request)?;
        stream.write_all(request_json.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;

        Ok(serde_json::from_str(&line)?)
    }

    pub async fn get_status(&self) -> Result<ControllerStatus> {
        match self.send(IpcRequest::GetStatus).await? {
            IpcResponse::Success { data } => Ok(serde_json::from_value(data)?),
            IpcResponse::Error { message } => Err(anyhow::anyhow!(message)),
        }
    }

    pub async fn expect_success(&self, request: IpcRequest) -> Result<serde_json::Value> {
        match self.send(request).await? {
            IpcResponse::Success { data } => Ok(data),
            IpcResponse::Error { message } => Err(anyhow::anyhow!(message)),
        }
    }
}
