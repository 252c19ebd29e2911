// Health monitor - owns one OS process for the length of a single life

use super::types::{LifeReport, TerminationEvent};
use std::io;
use std::process::ExitStatus;
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;

/// Samples resident memory of single processes
pub struct MemorySampler {
    system: System,
}

impl MemorySampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    /// Resident memory of `pid` in bytes, or `None` if it cannot be read
    pub fn sample(&mut self, pid: u32) -> Option<u64> {
        let sys_pid = Pid::from_u32(pid);
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );
        self.system.process(sys_pid).map(|p| p.memory())
    }
}

impl Default for MemorySampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Terminate a child: graceful signal first, forced kill after `grace`
///
/// # Arguments
/// * `child` - Process to terminate
/// * `name` - Process name, for logging
/// * `grace` - How long to wait after SIGTERM before SIGKILL
///
/// # Returns
/// The child's final exit status
pub async fn terminate(child: &mut Child, name: &str, grace: Duration) -> io::Result<ExitStatus> {
    if let Some(pid) = child.id() {
        send_graceful_signal(pid, name);

        tracing::debug!("Waiting {:?} for process {} to exit gracefully", grace, name);
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(result) => return result,
            Err(_) => {
                tracing::warn!(
                    "Process {} did not exit within {:?}, sending SIGKILL",
                    name,
                    grace
                );
            }
        }
    }

    // start_kill is a no-op error if the process is already reaped
    if let Err(e) = child.start_kill() {
        tracing::debug!("SIGKILL for process {} not delivered: {}", name, e);
    }
    child.wait().await
}

#[cfg(unix)]
fn send_graceful_signal(pid: u32, name: &str) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid as NixPid;

    tracing::info!("Gracefully stopping process {} (PID: {}) with SIGTERM", name, pid);
    if let Err(e) = signal::kill(NixPid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::debug!("SIGTERM for process {} not delivered: {}", name, e);
    }
}

#[cfg(not(unix))]
fn send_graceful_signal(_pid: u32, _name: &str) {}

/// Everything the monitor needs to watch one life
pub struct LifeWatch {
    pub name: String,
    pub child: Child,
    pub pid: u32,
    pub max_memory_bytes: Option<u64>,
    pub sample_interval: Duration,
    pub grace_period: Duration,
}

enum Step {
    Exited(io::Result<ExitStatus>),
    TerminateRequested,
    Sample,
}

impl LifeWatch {
    /// Watch the process until it dies.
    ///
    /// Resolves when the process exits on its own, when `terminate` fires
    /// (or its sender is dropped), or after the monitor kills it for going
    /// over its memory limit. `on_sample` receives every memory reading.
    pub async fn run<F>(mut self, mut terminate_rx: oneshot::Receiver<()>, mut on_sample: F) -> LifeReport
    where
        F: FnMut(u64) + Send,
    {
        let mut sampler = MemorySampler::new();
        let mut last_sample = None;

        let mut ticker = tokio::time::interval(self.sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let step = tokio::select! {
                status = self.child.wait() => Step::Exited(status),
                _ = &mut terminate_rx => Step::TerminateRequested,
                _ = ticker.tick() => Step::Sample,
            };

            match step {
                Step::Exited(status) => return self.report(status, last_sample),
                Step::TerminateRequested => {
                    let status = terminate(&mut self.child, &self.name, self.grace_period).await;
                    return self.report(status, last_sample);
                }
                Step::Sample => {
                    let Some(bytes) = sampler.sample(self.pid) else {
                        // Probably exiting; wait() will tell
                        tracing::debug!("No memory sample for process {} (PID: {})", self.name, self.pid);
                        continue;
                    };
                    last_sample = Some(bytes);
                    on_sample(bytes);

                    if let Some(limit) = self.max_memory_bytes {
                        if bytes > limit {
                            tracing::warn!(
                                "Process {} (PID: {}) uses {} bytes, over its limit of {} bytes",
                                self.name,
                                self.pid,
                                bytes,
                                limit
                            );
                            let status =
                                terminate(&mut self.child, &self.name, self.grace_period).await;
                            let mut report = self.report(status, last_sample);
                            report.event = TerminationEvent::MemoryLimitExceeded(bytes);
                            return report;
                        }
                    }
                }
            }
        }
    }

    fn report(&self, status: io::Result<ExitStatus>, memory: Option<u64>) -> LifeReport {
        match status {
            Ok(status) => {
                let event = TerminationEvent::from_status(&status);
                let (exit_code, signal) = match &event {
                    TerminationEvent::NormalExit(code) => (Some(*code), None),
                    TerminationEvent::CrashExit { code, signal } => (*code, *signal),
                    TerminationEvent::MemoryLimitExceeded(_) => (None, None),
                };
                LifeReport {
                    event,
                    exit_code,
                    signal,
                    memory_usage_bytes: memory,
                }
            }
            Err(e) => {
                tracing::error!("Lost track of process {} (PID: {}): {}", self.name, self.pid, e);
                LifeReport {
                    event: TerminationEvent::unreachable(),
                    exit_code: None,
                    signal: None,
                    memory_usage_bytes: memory,
                }
            }
        }
    }
}
