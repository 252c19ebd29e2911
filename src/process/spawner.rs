use crate::config::ProcessSpec;
use crate::error::{Result, ShepherdError};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::debug;

/// A freshly launched OS process
#[derive(Debug)]
pub struct SpawnedProcess {
    /// The child process handle, with stdout/stderr still attached
    pub child: Child,

    /// Process ID assigned by the OS
    pub pid: u32,
}

/// Launch one life of a process spec
///
/// The command line comes from [`ProcessSpec::command_line`], so specs with an
/// interpreter run as `interpreter command args...`. The child inherits the
/// supervisor's environment with the spec's resolved variables layered on top,
/// and both output streams are piped for the log pipe to consume.
///
/// # Arguments
/// * `spec` - Validated process spec
///
/// # Returns
/// * `Ok(SpawnedProcess)` - Process is running
/// * `Err(ShepherdError::Launch)` - The OS refused to start it
pub fn spawn_process(spec: &ProcessSpec) -> Result<SpawnedProcess> {
    let (program, args) = spec.command_line();

    let mut command = Command::new(&program);
    command.args(&args);

    if let Some(ref cwd) = spec.working_directory {
        command.current_dir(cwd);
    }

    command.envs(&spec.environment);

    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    // Never leave an orphan behind if the owning task goes away
    command.kill_on_drop(true);

    let child = command.spawn().map_err(|e| {
        ShepherdError::Launch(format!(
            "'{}' ({}): {}",
            spec.name,
            program.display(),
            e
        ))
    })?;

    let pid = child.id().ok_or_else(|| {
        ShepherdError::Launch(format!("'{}' exited before a PID was assigned", spec.name))
    })?;

    debug!(process = %spec.name, pid, program = %program.display(), "spawned");

    Ok(SpawnedProcess { child, pid })
}
