// Process module - Launching, watching and restarting supervised processes

pub mod monitor;
pub mod restart;
pub mod spawner;
mod supervisor;
pub mod types;
pub mod watch;

pub use monitor::{LifeWatch, MemorySampler};
pub use restart::{backoff_delay, RestartDecision, RestartPolicy};
pub use spawner::{spawn_process, SpawnedProcess};
pub use supervisor::Supervisor;
pub use types::{LifeReport, ProcessInstance, ProcessState, ProcessStatus, TerminationEvent};
