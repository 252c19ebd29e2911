// Supervisor runtime - ties the supervisor, control socket and signals together

use crate::config::Registry;
use crate::error::{Result, ShepherdError};
use crate::ipc::{Command, IpcServer, Response, ResponseData};
use crate::process::{ProcessStatus, Supervisor};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::Notify;

/// A supervisor serving its control socket until told to stop
pub struct Daemon {
    supervisor: Arc<Supervisor>,
    socket_path: PathBuf,
}

impl Daemon {
    /// Build the runtime for a loaded registry. Must be called inside a tokio runtime.
    ///
    /// # Arguments
    /// * `registry` - Validated process specs
    /// * `socket_path` - Control socket; defaults to the registry's setting
    pub fn new(registry: Registry, socket_path: Option<PathBuf>) -> Self {
        let socket_path = socket_path.unwrap_or_else(|| registry.settings().control_socket());
        Self {
            supervisor: Arc::new(Supervisor::new(registry)),
            socket_path,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Start every process, then serve requests until SIGINT, SIGTERM or a
    /// `Shutdown` command. Every process is stopped before this returns.
    pub async fn run(self) -> Result<Vec<ProcessStatus>> {
        let sigterm = signal(SignalKind::terminate())
            .map_err(|e| ShepherdError::Signal(format!("Failed to install SIGTERM handler: {}", e)))?;
        let sigint = signal(SignalKind::interrupt())
            .map_err(|e| ShepherdError::Signal(format!("Failed to install SIGINT handler: {}", e)))?;

        let mut server = IpcServer::with_socket_path(&self.socket_path);
        server.start()?;

        let statuses = self.supervisor.start_all().await;
        tracing::info!("Supervising {} process(es)", statuses.len());

        let shutdown = Arc::new(Notify::new());
        let supervisor = Arc::clone(&self.supervisor);
        let requested = Arc::clone(&shutdown);
        let handler = move |command: Command| {
            let supervisor = Arc::clone(&supervisor);
            let requested = Arc::clone(&requested);
            async move { handle_command(command, &supervisor, &requested).await }
        };

        tokio::select! {
            result = server.run(handler) => {
                if let Err(e) = result {
                    tracing::error!("Control socket failed: {}", e);
                }
            }
            _ = wait_for_signal(sigterm, sigint) => {}
            _ = shutdown.notified() => {
                tracing::info!("Shutdown requested over the control socket");
            }
        }

        tracing::info!("Shutting down, stopping all processes...");
        let statuses = self.supervisor.stop_all().await;

        if let Err(e) = server.stop() {
            tracing::warn!("{}", e);
        }
        tracing::info!("Supervisor stopped");

        Ok(statuses)
    }
}

async fn wait_for_signal(mut sigterm: Signal, mut sigint: Signal) {
    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        _ = sigint.recv() => tracing::info!("Received SIGINT"),
    }
}

/// Handle a command from a control-socket client
async fn handle_command(
    command: Command,
    supervisor: &Supervisor,
    shutdown: &Notify,
) -> Result<Response> {
    tracing::debug!("Control command: {:?}", command);

    let data = match command {
        Command::StartAll => ResponseData::ProcessList(supervisor.start_all().await),
        Command::Start { name } => ResponseData::Status(supervisor.start(&name).await?),
        Command::Stop { name } => ResponseData::Status(supervisor.stop(&name).await?),
        Command::Restart { name } => ResponseData::Status(supervisor.restart(&name).await?),
        Command::Status { name } => ResponseData::Status(supervisor.status(&name).await?),
        Command::List => ResponseData::ProcessList(supervisor.list().await),
        Command::Shutdown => {
            shutdown.notify_one();
            ResponseData::Success("Supervisor shutting down".to_string())
        }
    };

    // The server fills in the request id
    Ok(Response::success(0, data))
}
