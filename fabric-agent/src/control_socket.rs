//! The local control socket (§6): a Unix stream socket accepting
//! newline-delimited JSON-RPC requests, restarted automatically on accept
//! errors with a fresh listener.

use serde::{Deserialize, Serialize};
use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{UnixListener, UnixStream},
    sync::RwLock,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Starting,
    WaitingForAuth,
    Running,
    Unknown,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Status {
    pub state: AgentState,
    pub message: String,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: AgentState::Starting,
            message: String::new(),
        }
    }
}

/// Shared, mutable status the driver loop updates and the control socket
/// reads. Cheap to clone; all handles share the same underlying lock.
#[derive(Clone, Default)]
pub struct SharedStatus(Arc<RwLock<Status>>);

impl SharedStatus {
    pub async fn set(&self, state: AgentState, message: impl Into<String>) {
        let mut guard = self.0.write().await;
        guard.state = state;
        guard.message = message.into();
    }

    pub async fn get(&self) -> Status {
        self.0.read().await.clone()
    }
}

#[derive(Deserialize)]
#[serde(tag = "method", rename_all = "PascalCase")]
enum Request {
    Status,
    Version,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Response {
    Status(Status),
    Version(String),
    Error { error: String },
}

/// Serves the control socket until canceled. Recreates the listener (and
/// the socket file, with `0o660` permissions) if `accept` ever fails.
pub async fn serve(
    path: PathBuf,
    status: SharedStatus,
    cancel: tokio_util::sync::CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        match bind(&path) {
            Ok(listener) => run_accept_loop(listener, status.clone(), cancel.clone()).await,
            Err(e) => {
                log::error!("failed to bind control socket at {}: {e}", path.display());
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            },
        }
    }
}

fn bind(path: &Path) -> std::io::Result<UnixListener> {
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660))?;
    Ok(listener)
}

async fn run_accept_loop(
    listener: UnixListener,
    status: SharedStatus,
    cancel: tokio_util::sync::CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let status = status.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, status).await {
                                log::debug!("control socket connection ended: {e}");
                            }
                        });
                    },
                    Err(e) => {
                        log::warn!("control socket accept error, restarting listener: {e}");
                        return;
                    },
                }
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, status: SharedStatus) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(Request::Status) => Response::Status(status.get().await),
            Ok(Request::Version) => Response::Version(env!("CARGO_PKG_VERSION").to_string()),
            Err(e) => Response::Error {
                error: format!("invalid request: {e}"),
            },
        };
        let mut encoded = serde_json::to_vec(&response).unwrap_or_default();
        encoded.push(b'\n');
        write_half.write_all(&encoded).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shared_status_round_trips() {
        let status = SharedStatus::default();
        status.set(AgentState::Running, "converged").await;
        let snapshot = status.get().await;
        assert_eq!(snapshot.state, AgentState::Running);
        assert_eq!(snapshot.message, "converged");
    }
}
