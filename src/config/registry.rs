use super::units::{resolve_date_format, DEFAULT_DATE_FORMAT};
use super::{parse, ConfigFormat, ProcessConfig, SupervisorSettings};
use crate::error::{ConfigError, ConfigErrorKind, Result};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Validated, immutable description of one supervised process
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessSpec {
    pub name: String,
    pub command: PathBuf,
    pub interpreter: Option<PathBuf>,
    pub arguments: Vec<String>,
    pub working_directory: Option<PathBuf>,
    /// Supervisor defaults overlaid with the process's own variables
    pub environment: BTreeMap<String, String>,
    pub autorestart: bool,
    pub max_memory_bytes: Option<u64>,
    pub watch_enabled: bool,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub merge_logs: bool,
    pub timestamp_enabled: bool,
    /// strftime pattern used when `timestamp_enabled` is set
    pub date_format: String,
}

impl ProcessSpec {
    /// Program and argument vector in launch order
    pub fn command_line(&self) -> (PathBuf, Vec<String>) {
        match &self.interpreter {
            Some(interpreter) => {
                let mut args = Vec::with_capacity(self.arguments.len() + 1);
                args.push(self.command.to_string_lossy().into_owned());
                args.extend(self.arguments.iter().cloned());
                (interpreter.clone(), args)
            }
            None => (self.command.clone(), self.arguments.clone()),
        }
    }
}

/// The full, validated set of process specs plus supervisor settings.
/// Read-only once loaded.
#[derive(Debug, Clone)]
pub struct Registry {
    settings: SupervisorSettings,
    specs: Vec<Arc<ProcessSpec>>,
}

impl Registry {
    /// Load and validate a config file (TOML or JSON)
    pub fn load(path: &Path) -> Result<Self> {
        let format = ConfigFormat::from_path(path)?;
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::new(
                ConfigErrorKind::Unreadable,
                format!("Failed to read config file {}: {}", path.display(), e),
            )
        })?;

        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Self::from_contents(&contents, format, &base_dir)
    }

    /// Parse and validate config contents; relative paths resolve against `base_dir`
    pub fn from_contents(contents: &str, format: ConfigFormat, base_dir: &Path) -> Result<Self> {
        let (settings, configs) = parse(contents, format)?;
        Self::from_configs(settings, configs, base_dir)
    }

    /// Validate raw entries into specs. Any failure rejects the whole set.
    pub fn from_configs(
        mut settings: SupervisorSettings,
        configs: Vec<ProcessConfig>,
        base_dir: &Path,
    ) -> Result<Self> {
        settings.log_dir = resolve(base_dir, &settings.log_dir);
        if let Some(ref socket) = settings.control_socket {
            settings.control_socket = Some(resolve(base_dir, socket));
        }

        let mut names: HashMap<String, usize> = HashMap::new();
        let mut log_owners: HashMap<PathBuf, String> = HashMap::new();
        let mut specs = Vec::with_capacity(configs.len());

        for (index, config) in configs.into_iter().enumerate() {
            let spec = build_spec(&settings, config, base_dir)?;

            if let Some(previous) = names.insert(spec.name.clone(), index) {
                return Err(ConfigError::new(
                    ConfigErrorKind::DuplicateName,
                    format!(
                        "process name '{}' is declared twice (entries {} and {})",
                        spec.name,
                        previous + 1,
                        index + 1
                    ),
                )
                .into());
            }

            claim_log_paths(&spec, &mut log_owners)?;
            debug!(process = %spec.name, command = %spec.command.display(), "validated process spec");
            specs.push(Arc::new(spec));
        }

        Ok(Self { settings, specs })
    }

    /// Specs in declaration order
    pub fn specs(&self) -> &[Arc<ProcessSpec>] {
        &self.specs
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ProcessSpec>> {
        self.specs.iter().find(|s| s.name == name)
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

fn build_spec(
    settings: &SupervisorSettings,
    config: ProcessConfig,
    base_dir: &Path,
) -> std::result::Result<ProcessSpec, ConfigError> {
    let name = config.name.trim().to_string();
    if name.is_empty() {
        return Err(ConfigError::new(
            ConfigErrorKind::MissingName,
            "every process needs a non-empty name",
        ));
    }

    let working_directory = match config.working_directory {
        Some(ref cwd) => {
            let cwd = resolve(base_dir, cwd);
            if !cwd.is_dir() {
                return Err(ConfigError::new(
                    ConfigErrorKind::InvalidWorkingDirectory,
                    format!("{}: working directory {} is not a directory", name, cwd.display()),
                ));
            }
            Some(cwd)
        }
        None => None,
    };

    let command_base = working_directory.as_deref().unwrap_or(base_dir);
    let interpreter = match config.interpreter.as_deref().map(str::trim) {
        Some(interpreter) if !interpreter.is_empty() => {
            Some(resolve_executable(&name, interpreter, command_base)?)
        }
        _ => None,
    };

    let command = config.command.trim();
    if command.is_empty() {
        return Err(ConfigError::new(
            ConfigErrorKind::MissingCommand,
            format!("{}: no command given", name),
        ));
    }
    let command = if interpreter.is_some() {
        let script = resolve(command_base, Path::new(command));
        if !script.is_file() {
            return Err(ConfigError::new(
                ConfigErrorKind::MissingCommand,
                format!("{}: script {} does not exist", name, script.display()),
            ));
        }
        script
    } else {
        resolve_executable(&name, command, command_base)?
    };

    let max_memory_bytes = config
        .max_memory_bytes
        .as_ref()
        .map(|limit| limit.to_bytes())
        .transpose()
        .map_err(|e| ConfigError::new(e.kind, format!("{}: {}", name, e.message)))?;

    let date_format = match config.date_format.as_deref() {
        Some("") if !config.timestamp_enabled => resolve_date_format(DEFAULT_DATE_FORMAT)?,
        Some(pattern) => resolve_date_format(pattern)
            .map_err(|e| ConfigError::new(e.kind, format!("{}: {}", name, e.message)))?,
        None => resolve_date_format(DEFAULT_DATE_FORMAT)?,
    };

    let stdout_path = config
        .stdout_path
        .as_deref()
        .map(|p| resolve(base_dir, p))
        .unwrap_or_else(|| settings.log_dir.join(format!("{}-out.log", name)));
    let stderr_path = config
        .stderr_path
        .as_deref()
        .map(|p| resolve(base_dir, p))
        .unwrap_or_else(|| settings.log_dir.join(format!("{}-error.log", name)));

    let mut environment: BTreeMap<String, String> = settings
        .env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    environment.extend(config.environment);

    Ok(ProcessSpec {
        name,
        command,
        interpreter,
        arguments: config.arguments,
        working_directory,
        environment,
        autorestart: config.autorestart,
        max_memory_bytes,
        watch_enabled: config.watch_enabled,
        stdout_path,
        stderr_path,
        merge_logs: config.merge_logs,
        timestamp_enabled: config.timestamp_enabled,
        date_format,
    })
}

/// Record the files a spec writes, rejecting any file already owned
fn claim_log_paths(
    spec: &ProcessSpec,
    owners: &mut HashMap<PathBuf, String>,
) -> std::result::Result<(), ConfigError> {
    let stdout = normalize_path(&spec.stdout_path);
    let mut paths = vec![stdout.clone()];
    if !spec.merge_logs {
        let stderr = normalize_path(&spec.stderr_path);
        if stderr == stdout {
            return Err(ConfigError::new(
                ConfigErrorKind::SharedLogPath,
                format!(
                    "{}: stdout and stderr share {} but merge_logs is off",
                    spec.name,
                    spec.stdout_path.display()
                ),
            ));
        }
        paths.push(stderr);
    }

    for path in paths {
        if let Some(owner) = owners.insert(path.clone(), spec.name.clone()) {
            return Err(ConfigError::new(
                ConfigErrorKind::SharedLogPath,
                format!(
                    "{} and {} both write to {}",
                    owner,
                    spec.name,
                    path.display()
                ),
            ));
        }
    }
    Ok(())
}

/// Absolute form of a path that may not exist yet, with `.`/`..` removed
/// and symlinks resolved in the part that does exist
pub(crate) fn normalize_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut clean = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                clean.pop();
            }
            other => clean.push(other.as_os_str()),
        }
    }

    let mut existing = clean.as_path();
    let mut missing = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            return missing
                .iter()
                .rev()
                .fold(canonical, |path, name| path.join(name));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => return clean.clone(),
        }
    }
}

/// Resolve a program: paths are checked on disk, bare names searched on PATH
fn resolve_executable(
    process: &str,
    program: &str,
    base: &Path,
) -> std::result::Result<PathBuf, ConfigError> {
    let as_path = Path::new(program);
    if as_path.components().count() > 1 || as_path.is_absolute() {
        let candidate = resolve(base, as_path);
        if candidate.is_file() {
            return Ok(candidate);
        }
        return Err(ConfigError::new(
            ConfigErrorKind::MissingCommand,
            format!("{}: {} does not exist", process, candidate.display()),
        ));
    }

    which::which(program).map_err(|e| {
        ConfigError::new(
            ConfigErrorKind::MissingCommand,
            format!("{}: cannot find '{}' on PATH: {}", process, program, e),
        )
    })
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
