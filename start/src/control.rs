//! Control socket for communicating with a running supervisor.
//!
//! This module provides IPC between the `ukmsdn` CLI and the supervisor
//! via a Unix domain socket speaking newline-delimited JSON.

use crate::error::{Error, Result};
use crate::service::ServiceStatus;
use crate::supervisor::Supervisor;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Default path for the control socket
pub const DEFAULT_CONTROL_SOCKET: &str = "/run/ukmsdn/control.sock";

/// Pause after a failed accept, since EMFILE persists until descriptors free up
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Commands that can be sent to the supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlCommand {
    /// Get status of a specific service
    GetServiceStatus { name: String },
    /// Get status of all services
    GetAllStatus,
    /// Zero the restart accounting and revive a failed service
    ResetService { name: String },
    /// Last lines of a service's output log
    GetLogs { name: String, lines: usize },
    /// Stop every service and exit, as on SIGTERM
    Shutdown,
    /// Ping to check if the supervisor is responding
    Ping,
}

/// Response from the supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlResponse {
    /// Command succeeded
    Success { message: String },
    /// Command failed
    Error { message: String },
    /// Service status response
    Status { services: Vec<ServiceStatus> },
    /// Output log lines
    Logs { name: String, lines: Vec<String> },
    /// Pong response
    Pong,
}

/// Write one value as a JSON line.
async fn send_line<T: Serialize>(stream: &mut UnixStream, value: &T) -> Result<()> {
    let mut json = serde_json::to_vec(value)?;
    json.push(b'\n');
    stream.write_all(&json).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one JSON line; `what` names the value in parse errors.
async fn recv_line<T: DeserializeOwned>(stream: &mut UnixStream, what: &str) -> Result<T> {
    let mut line = String::new();
    let read = BufReader::new(stream).read_line(&mut line).await?;
    if read == 0 {
        return Err(Error::Control(format!("Connection closed before {}", what)));
    }
    serde_json::from_str(line.trim())
        .map_err(|e| Error::Control(format!("Failed to parse {}: {}", what, e)))
}

/// Control socket server (runs in the supervisor process)
pub struct ControlServer {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
}

impl ControlServer {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            listener: None,
        }
    }

    /// Bind the socket, replacing a stale one, with mode 0660.
    pub async fn start(&mut self) -> Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // A previous supervisor may have left its socket behind
        match std::fs::remove_file(&self.socket_path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o660))?;
        info!(path = %self.socket_path.display(), "Control socket listening");

        self.listener = Some(listener);
        Ok(())
    }

    /// Wait for the next client.
    pub async fn accept(&self) -> Result<UnixStream> {
        let Some(listener) = self.listener.as_ref() else {
            return Err(Error::Control("Control server not started".to_string()));
        };
        let (stream, _addr) = listener.accept().await?;
        debug!("Accepted control connection");
        Ok(stream)
    }

    pub async fn read_command(stream: &mut UnixStream) -> Result<ControlCommand> {
        let command = recv_line(stream, "command").await?;
        debug!(command = ?command, "Received control command");
        Ok(command)
    }

    pub async fn write_response(stream: &mut UnixStream, response: &ControlResponse) -> Result<()> {
        send_line(stream, response).await?;
        debug!(response = ?response, "Sent control response");
        Ok(())
    }

    /// Serve connections until the task is dropped.
    ///
    /// `Shutdown` requests are forwarded on `shutdown_tx`.
    pub async fn serve(
        self,
        supervisor: Arc<Supervisor>,
        shutdown_tx: mpsc::Sender<()>,
    ) -> Result<()> {
        loop {
            let mut stream = match self.accept().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "Failed to accept control connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            let supervisor = Arc::clone(&supervisor);
            let shutdown_tx = shutdown_tx.clone();
            tokio::spawn(async move {
                let response = match Self::read_command(&mut stream).await {
                    Ok(command) => handle_command(&supervisor, &shutdown_tx, command).await,
                    Err(e) => ControlResponse::Error {
                        message: e.to_string(),
                    },
                };
                if let Err(e) = Self::write_response(&mut stream, &response).await {
                    debug!(error = %e, "Control client went away");
                }
            });
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        if self.listener.is_some() && self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(error = %e, "Failed to remove control socket");
            }
        }
    }
}

/// Execute one control command against the supervisor.
pub async fn handle_command(
    supervisor: &Arc<Supervisor>,
    shutdown_tx: &mpsc::Sender<()>,
    command: ControlCommand,
) -> ControlResponse {
    let result = match command {
        ControlCommand::Ping => return ControlResponse::Pong,
        ControlCommand::GetAllStatus => Ok(ControlResponse::Status {
            services: supervisor.statuses().await,
        }),
        ControlCommand::GetServiceStatus { name } => supervisor
            .status(&name)
            .await
            .map(|status| ControlResponse::Status {
                services: vec![status],
            }),
        ControlCommand::ResetService { name } => {
            supervisor
                .reset(&name)
                .await
                .map(|status| ControlResponse::Success {
                    message: format!("{} reset, now {}", status.name, status.state),
                })
        }
        ControlCommand::GetLogs { name, lines } => match supervisor.status(&name).await {
            Ok(_) => Ok(ControlResponse::Logs {
                lines: supervisor.launcher().journal().tail(&name, lines).await,
                name,
            }),
            Err(e) => Err(e),
        },
        ControlCommand::Shutdown => {
            info!("Shutdown requested over control socket");
            // A full channel means a request is already pending
            let _ = shutdown_tx.try_send(());
            Ok(ControlResponse::Success {
                message: "shutdown initiated".to_string(),
            })
        }
    };

    result.unwrap_or_else(|e| ControlResponse::Error {
        message: e.to_string(),
    })
}

/// Control socket client (used by the `ukmsdn` CLI)
pub struct ControlClient {
    socket_path: PathBuf,
}

impl ControlClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    pub fn with_default_path() -> Self {
        Self::new(DEFAULT_CONTROL_SOCKET)
    }

    /// Whether a socket file exists at the configured path.
    pub fn is_available(&self) -> bool {
        self.socket_path.exists()
    }

    pub async fn connect(&self) -> Result<UnixStream> {
        UnixStream::connect(&self.socket_path).await.map_err(|e| {
            Error::Control(format!(
                "Cannot reach supervisor at {}: {}",
                self.socket_path.display(),
                e
            ))
        })
    }

    /// One request, one response, one connection.
    pub async fn send_command(&self, command: ControlCommand) -> Result<ControlResponse> {
        let mut stream = self.connect().await?;
        send_line(&mut stream, &command).await?;
        recv_line(&mut stream, "response").await
    }

    pub async fn get_service_status(&self, name: &str) -> Result<ControlResponse> {
        self.send_command(ControlCommand::GetServiceStatus {
            name: name.to_string(),
        })
        .await
    }

    pub async fn get_all_status(&self) -> Result<ControlResponse> {
        self.send_command(ControlCommand::GetAllStatus).await
    }

    pub async fn reset_service(&self, name: &str) -> Result<ControlResponse> {
        self.send_command(ControlCommand::ResetService {
            name: name.to_string(),
        })
        .await
    }

    pub async fn get_logs(&self, name: &str, lines: usize) -> Result<ControlResponse> {
        self.send_command(ControlCommand::GetLogs {
            name: name.to_string(),
            lines,
        })
        .await
    }

    pub async fn shutdown(&self) -> Result<ControlResponse> {
        self.send_command(ControlCommand::Shutdown).await
    }

    /// True only if the supervisor answered with `Pong`.
    pub async fn ping(&self) -> Result<bool> {
        Ok(matches!(
            self.send_command(ControlCommand::Ping).await,
            Ok(ControlResponse::Pong)
        ))
    }
}
