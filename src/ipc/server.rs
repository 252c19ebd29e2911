// IPC Server - Accepts control-socket connections and dispatches requests

use crate::error::{Result, ShepherdError};
use crate::ipc::{Command, Request, Response};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

/// IPC server for handling client connections
pub struct IpcServer {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
}

impl IpcServer {
    /// Create a server for the given socket path. Nothing is bound until [`start`](Self::start).
    pub fn with_socket_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            socket_path: path.as_ref().to_path_buf(),
            listener: None,
        }
    }

    /// Bind the Unix socket. Must be called inside a tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        if let Some(parent) = self.socket_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                ShepherdError::Ipc(format!("Failed to create socket directory: {}", e))
            })?;
        }

        // Remove a stale socket left by a previous run
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| {
                ShepherdError::Ipc(format!("Failed to remove existing socket: {}", e))
            })?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .map_err(|e| ShepherdError::Ipc(format!("Failed to bind to socket: {}", e)))?;

        // Set socket permissions to be accessible only by owner (0600)
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.socket_path, permissions).map_err(|e| {
                ShepherdError::Ipc(format!("Failed to set socket permissions: {}", e))
            })?;
        }

        tracing::info!("Control socket listening on {}", self.socket_path.display());
        self.listener = Some(listener);
        Ok(())
    }

    /// Run the accept loop, answering each connection on its own task.
    ///
    /// Only returns on a listener error; callers usually race it against a
    /// shutdown signal.
    pub async fn run<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(Command) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response>> + Send,
    {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| ShepherdError::Ipc("Server not started".to_string()))?;
        let handler = Arc::new(handler);

        loop {
            let stream = match listener.accept().await {
                Ok((stream, _addr)) => stream,
                Err(e) => {
                    tracing::warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, handler.as_ref()).await {
                    tracing::warn!("Control connection failed: {}", e);
                }
            });
        }
    }

    /// Stop the server and clean up the socket file
    pub fn stop(&mut self) -> Result<()> {
        self.listener = None;

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| {
                ShepherdError::Ipc(format!("Failed to remove socket file: {}", e))
            })?;
        }

        Ok(())
    }

    /// Get the socket path being used
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        // Only clean up a socket this server actually bound
        if self.listener.is_some() {
            let _ = self.stop();
        }
    }
}

/// Read one request, run it through `handler` and write the response
async fn handle_connection<F, Fut>(stream: UnixStream, handler: &F) -> Result<()>
where
    F: Fn(Command) -> Fut,
    Fut: Future<Output = Result<Response>>,
{
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut request_line = String::new();
    reader
        .read_line(&mut request_line)
        .await
        .map_err(|e| ShepherdError::Ipc(format!("Failed to read request: {}", e)))?;

    let response = match serde_json::from_str::<Request>(&request_line) {
        Ok(request) => match handler(request.command).await {
            // Ensure response ID matches request ID
            Ok(resp) => Response {
                id: request.id,
                result: resp.result,
            },
            Err(e) => Response::error(request.id, e.to_string()),
        },
        Err(e) => Response::error(0, format!("Malformed request: {}", e)),
    };

    let mut response_json = serde_json::to_string(&response).map_err(|e| {
        ShepherdError::Serialization(format!("Failed to serialize response: {}", e))
    })?;
    response_json.push('\n');

    writer
        .write_all(response_json.as_bytes())
        .await
        .map_err(|e| ShepherdError::Ipc(format!("Failed to write response: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| ShepherdError::Ipc(format!("Failed to flush stream: {}", e)))?;

    Ok(())
}
