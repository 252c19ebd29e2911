// Configuration file loading and the validated process registry

mod registry;
mod units;

pub use registry::{ProcessSpec, Registry};
pub(crate) use registry::normalize_path;
pub use units::{parse_memory, resolve_date_format, to_strftime, MemoryLimit, DEFAULT_DATE_FORMAT};

use crate::error::{ConfigError, ConfigErrorKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Supervisor-wide settings (the `[supervisor]` table)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisorSettings {
    /// Directory for default log destinations
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Environment applied to every process before its own `env`
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Grace period between the polite and the forced termination
    #[serde(default = "default_kill_timeout")]
    pub kill_timeout_ms: u64,

    /// Resident memory sampling interval
    #[serde(default = "default_memory_check_interval")]
    pub memory_check_interval_ms: u64,

    /// Initial restart backoff
    #[serde(default = "default_restart_delay")]
    pub restart_delay_ms: u64,

    /// Upper bound for restart backoff
    #[serde(default = "default_max_restart_delay")]
    pub max_restart_delay_ms: u64,

    /// Uptime after which the consecutive-failure count resets
    #[serde(default = "default_min_uptime")]
    pub min_uptime_ms: u64,

    /// Operator control socket path
    #[serde(default)]
    pub control_socket: Option<PathBuf>,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_kill_timeout() -> u64 {
    1600
}

fn default_memory_check_interval() -> u64 {
    1000
}

fn default_restart_delay() -> u64 {
    100
}

fn default_max_restart_delay() -> u64 {
    15_000
}

fn default_min_uptime() -> u64 {
    30_000
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            env: HashMap::new(),
            kill_timeout_ms: default_kill_timeout(),
            memory_check_interval_ms: default_memory_check_interval(),
            restart_delay_ms: default_restart_delay(),
            max_restart_delay_ms: default_max_restart_delay(),
            min_uptime_ms: default_min_uptime(),
            control_socket: None,
        }
    }
}

impl SupervisorSettings {
    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    pub fn memory_check_interval(&self) -> Duration {
        Duration::from_millis(self.memory_check_interval_ms.max(1))
    }

    /// Path of the operator socket, defaulting to `<log_dir>/shepherd.sock`
    pub fn control_socket(&self) -> PathBuf {
        self.control_socket
            .clone()
            .unwrap_or_else(|| self.log_dir.join("shepherd.sock"))
    }
}

/// One process entry as written in the config file, before validation.
///
/// Field aliases accept the ecosystem-file vocabulary (`script`, `cwd`,
/// `max_memory_restart`, `out_file`, ...).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessConfig {
    #[serde(default)]
    pub name: String,

    #[serde(default, alias = "script")]
    pub command: String,

    #[serde(default)]
    pub interpreter: Option<String>,

    #[serde(default, alias = "args")]
    pub arguments: Vec<String>,

    #[serde(default, alias = "cwd")]
    pub working_directory: Option<PathBuf>,

    #[serde(default, alias = "env")]
    pub environment: HashMap<String, String>,

    #[serde(default = "default_autorestart")]
    pub autorestart: bool,

    #[serde(default, alias = "max_memory_restart")]
    pub max_memory_bytes: Option<MemoryLimit>,

    #[serde(default, alias = "watch")]
    pub watch_enabled: bool,

    #[serde(default, alias = "out_file")]
    pub stdout_path: Option<PathBuf>,

    #[serde(default, alias = "error_file")]
    pub stderr_path: Option<PathBuf>,

    #[serde(default)]
    pub merge_logs: bool,

    #[serde(default, alias = "time")]
    pub timestamp_enabled: bool,

    #[serde(default, alias = "log_date_format")]
    pub date_format: Option<String>,
}

fn default_autorestart() -> bool {
    true
}

impl ProcessConfig {
    /// Minimal config for a named command, all other fields defaulted
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            autorestart: default_autorestart(),
            ..Default::default()
        }
    }

    /// Expand `$VAR` and `${VAR}` references from the supervisor environment
    fn expand_env_vars(&mut self) {
        self.command = expand_env_in_string(&self.command);
        self.interpreter = self.interpreter.as_deref().map(expand_env_in_string);

        if let Some(ref cwd) = self.working_directory {
            self.working_directory = Some(expand_env_in_path(cwd));
        }

        self.arguments = self
            .arguments
            .iter()
            .map(|arg| expand_env_in_string(arg))
            .collect();

        self.environment = self
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), expand_env_in_string(v)))
            .collect();
    }
}

/// Top-level shape of a config file
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    supervisor: SupervisorSettings,
    #[serde(default, alias = "apps")]
    processes: Vec<ProcessConfig>,
}

/// Supported config file encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    /// Pick the format from a file extension
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        match path.extension().and_then(|s| s.to_str()).unwrap_or("") {
            "toml" => Ok(ConfigFormat::Toml),
            "json" => Ok(ConfigFormat::Json),
            other => Err(ConfigError::new(
                ConfigErrorKind::Unreadable,
                format!("Unsupported file format: '{}'. Use .toml or .json", other),
            )),
        }
    }
}

/// Parse config file contents into settings and raw process entries
pub fn parse(
    contents: &str,
    format: ConfigFormat,
) -> Result<(SupervisorSettings, Vec<ProcessConfig>), ConfigError> {
    let file: ConfigFile = match format {
        ConfigFormat::Toml => toml::from_str(contents).map_err(|e| {
            ConfigError::new(ConfigErrorKind::Malformed, format!("Failed to parse TOML: {}", e))
        })?,
        ConfigFormat::Json => serde_json::from_str(contents).map_err(|e| {
            ConfigError::new(ConfigErrorKind::Malformed, format!("Failed to parse JSON: {}", e))
        })?,
    };

    if file.processes.is_empty() {
        return Err(ConfigError::new(
            ConfigErrorKind::Malformed,
            "No process configuration found in file",
        ));
    }

    let processes = file
        .processes
        .into_iter()
        .map(|mut config| {
            config.expand_env_vars();
            config
        })
        .collect();

    let mut settings = file.supervisor;
    settings.env = settings
        .env
        .iter()
        .map(|(k, v)| (k.clone(), expand_env_in_string(v)))
        .collect();

    Ok((settings, processes))
}

/// Expand environment variables in a string. Unknown variables are kept verbatim.
fn expand_env_in_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(pos) = rest.find('$') {
        result.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        match std::env::var(name) {
            Ok(value) if !name.is_empty() => result.push_str(&value),
            _ => result.push_str(&rest[pos..pos + 1 + consumed]),
        }
        rest = &after[consumed..];
    }

    result.push_str(rest);
    result
}

fn expand_env_in_path(path: &Path) -> PathBuf {
    PathBuf::from(expand_env_in_string(&path.to_string_lossy()))
}
