use crate::config::ProcessSpec;
use serde::{Deserialize, Serialize};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
    RestartBackoff,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Stopped => write!(f, "stopped"),
            ProcessState::Starting => write!(f, "starting"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Stopping => write!(f, "stopping"),
            ProcessState::Crashed => write!(f, "crashed"),
            ProcessState::RestartBackoff => write!(f, "backoff"),
        }
    }
}

/// Why a process life ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationEvent {
    /// Exit with status 0
    NormalExit(i32),
    /// Non-zero exit, death by signal, or an OS handle that became unreachable
    CrashExit {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// Resident memory went over the spec's limit; the supervisor killed it
    MemoryLimitExceeded(u64),
}

impl TerminationEvent {
    pub fn from_status(status: &ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        match status.code() {
            Some(0) => TerminationEvent::NormalExit(0),
            code => TerminationEvent::CrashExit { code, signal },
        }
    }

    /// A life that could not be observed to its end
    pub fn unreachable() -> Self {
        TerminationEvent::CrashExit {
            code: None,
            signal: None,
        }
    }

    pub fn is_memory_breach(&self) -> bool {
        matches!(self, TerminationEvent::MemoryLimitExceeded(_))
    }
}

impl std::fmt::Display for TerminationEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationEvent::NormalExit(code) => write!(f, "exited with code {}", code),
            TerminationEvent::CrashExit {
                code: Some(code), ..
            } => write!(f, "crashed with code {}", code),
            TerminationEvent::CrashExit {
                signal: Some(signal),
                ..
            } => write!(f, "killed by signal {}", signal),
            TerminationEvent::CrashExit { .. } => write!(f, "lost"),
            TerminationEvent::MemoryLimitExceeded(bytes) => {
                write!(f, "exceeded memory limit at {} bytes", bytes)
            }
        }
    }
}

/// Everything observed about one finished life
#[derive(Debug, Clone)]
pub struct LifeReport {
    pub event: TerminationEvent,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub memory_usage_bytes: Option<u64>,
}

/// Live OS process attached to an instance
#[derive(Debug)]
pub struct OsHandle {
    pub pid: u32,
    terminate: Option<oneshot::Sender<()>>,
}

impl OsHandle {
    pub fn new(pid: u32, terminate: oneshot::Sender<()>) -> Self {
        Self {
            pid,
            terminate: Some(terminate),
        }
    }

    /// Ask the monitor to terminate the process. Returns false if already asked.
    pub fn request_termination(&mut self) -> bool {
        match self.terminate.take() {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }
}

/// Point-in-time view of an instance, safe to hand to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessStatus {
    pub name: String,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub last_exit_code: Option<i32>,
    pub last_signal: Option<i32>,
    pub last_started_at: Option<SystemTime>,
    pub last_exited_at: Option<SystemTime>,
    pub memory_usage_bytes: Option<u64>,
}

impl ProcessStatus {
    /// Time since the current life started, if it is running
    pub fn uptime(&self) -> Option<Duration> {
        match (self.state, self.last_started_at) {
            (ProcessState::Running, Some(started)) => SystemTime::now().duration_since(started).ok(),
            _ => None,
        }
    }
}

/// Runtime record for one spec. Owned by the supervisor's per-instance task.
#[derive(Debug)]
pub struct ProcessInstance {
    pub spec: Arc<ProcessSpec>,
    pub state: ProcessState,
    pub os_handle: Option<OsHandle>,
    pub restart_count: u32,
    /// Backoff input; separate from the operator-visible restart count
    pub consecutive_failures: u32,
    pub last_started_at: Option<SystemTime>,
    pub last_exited_at: Option<SystemTime>,
    pub last_exit_code: Option<i32>,
    pub last_signal: Option<i32>,
    pub memory_usage_bytes: Option<u64>,
}

impl ProcessInstance {
    pub fn new(spec: Arc<ProcessSpec>) -> Self {
        Self {
            spec,
            state: ProcessState::Stopped,
            os_handle: None,
            restart_count: 0,
            consecutive_failures: 0,
            last_started_at: None,
            last_exited_at: None,
            last_exit_code: None,
            last_signal: None,
            memory_usage_bytes: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.os_handle.as_ref().map(|h| h.pid)
    }

    pub fn mark_starting(&mut self) {
        self.state = ProcessState::Starting;
        self.last_started_at = Some(SystemTime::now());
    }

    pub fn mark_running(&mut self, handle: OsHandle) {
        self.os_handle = Some(handle);
        self.state = ProcessState::Running;
    }

    pub fn mark_stopping(&mut self) {
        self.state = ProcessState::Stopping;
    }

    pub fn mark_stopped(&mut self) {
        self.state = ProcessState::Stopped;
    }

    pub fn mark_backoff(&mut self) {
        self.state = ProcessState::RestartBackoff;
    }

    /// A launch that never produced a process
    pub fn mark_launch_failed(&mut self) {
        self.os_handle = None;
        self.state = ProcessState::Crashed;
        self.last_exited_at = Some(SystemTime::now());
        self.last_exit_code = None;
        self.last_signal = None;
    }

    /// Fold a finished life into the record. The state is left to the caller.
    pub fn record_exit(&mut self, report: &LifeReport) {
        self.os_handle = None;
        self.last_exited_at = Some(SystemTime::now());
        self.last_exit_code = report.exit_code;
        self.last_signal = report.signal;
        if report.memory_usage_bytes.is_some() {
            self.memory_usage_bytes = report.memory_usage_bytes;
        }
    }

    /// How long the most recent life lasted
    pub fn last_run_duration(&self) -> Option<Duration> {
        let started = self.last_started_at?;
        let exited = self.last_exited_at?;
        exited.duration_since(started).ok()
    }

    pub fn status(&self) -> ProcessStatus {
        ProcessStatus {
            name: self.spec.name.clone(),
            state: self.state,
            pid: self.pid(),
            restart_count: self.restart_count,
            last_exit_code: self.last_exit_code,
            last_signal: self.last_signal,
            last_started_at: self.last_started_at,
            last_exited_at: self.last_exited_at,
            memory_usage_bytes: self.memory_usage_bytes,
        }
    }
}
