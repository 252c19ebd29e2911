// IPC Client - Talks to a running supervisor over its control socket

use crate::error::{Result, ShepherdError};
use crate::ipc::{Command, Request, Response};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Maximum number of connection retry attempts
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Delay between retry attempts
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Upper bound on waiting for an answer; stopping a process can take a while
const READ_TIMEOUT: Duration = Duration::from_secs(120);

/// IPC client for communicating with the supervisor
pub struct IpcClient {
    socket_path: PathBuf,
    request_id: AtomicU64,
}

impl IpcClient {
    /// Create a new IPC client for the given socket path
    pub fn with_socket_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            socket_path: path.as_ref().to_path_buf(),
            request_id: AtomicU64::new(1),
        }
    }

    /// Send a command and wait for a response
    ///
    /// Only connection failures are retried. Once a request has been written
    /// it is never sent again, so `restart` cannot run twice.
    pub fn send_command(&self, command: Command) -> Result<Response> {
        let request_id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let request = Request::new(request_id, command);

        let stream = self.connect_with_retry()?;
        let response = Self::exchange(stream, &request)?;

        if response.id != request_id {
            return Err(ShepherdError::Protocol(format!(
                "Response ID mismatch: expected {}, got {}",
                request_id, response.id
            )));
        }
        Ok(response)
    }

    fn connect_with_retry(&self) -> Result<UnixStream> {
        let mut last_error = None;
        for attempt in 1..=MAX_RETRY_ATTEMPTS {
            match self.connect() {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    last_error = Some(e);
                    if attempt < MAX_RETRY_ATTEMPTS {
                        std::thread::sleep(RETRY_DELAY);
                    }
                }
            }
        }

        Err(last_error.unwrap_or(ShepherdError::DaemonNotRunning))
    }

    fn exchange(mut stream: UnixStream, request: &Request) -> Result<Response> {
        let request_json = serde_json::to_string(request).map_err(|e| {
            ShepherdError::Serialization(format!("Failed to serialize request: {}", e))
        })?;

        writeln!(stream, "{}", request_json)
            .map_err(|e| ShepherdError::Ipc(format!("Failed to write request: {}", e)))?;
        stream
            .flush()
            .map_err(|e| ShepherdError::Ipc(format!("Failed to flush stream: {}", e)))?;
        stream
            .set_read_timeout(Some(READ_TIMEOUT))
            .map_err(|e| ShepherdError::Ipc(format!("Failed to set read timeout: {}", e)))?;

        let mut reader = BufReader::new(stream);
        let mut response_line = String::new();
        reader
            .read_line(&mut response_line)
            .map_err(|e| ShepherdError::Ipc(format!("Failed to read response: {}", e)))?;

        if response_line.is_empty() {
            return Err(ShepherdError::Protocol(
                "Supervisor closed the connection without answering".to_string(),
            ));
        }

        serde_json::from_str(&response_line).map_err(|e| {
            ShepherdError::Serialization(format!("Failed to deserialize response: {}", e))
        })
    }

    /// Establish a connection to the supervisor's Unix socket
    fn connect(&self) -> Result<UnixStream> {
        if !self.socket_path.exists() {
            return Err(ShepherdError::DaemonNotRunning);
        }

        UnixStream::connect(&self.socket_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::ConnectionRefused
                || e.kind() == std::io::ErrorKind::NotFound
            {
                ShepherdError::DaemonNotRunning
            } else {
                ShepherdError::Ipc(format!("Failed to connect to supervisor: {}", e))
            }
        })
    }

    /// Get the socket path being used
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}
