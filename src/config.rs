use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How a preview server's readiness is confirmed once the marker appears.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessProbe {
    /// Marker seen in output AND the allocated port accepts TCP connections.
    #[default]
    MarkerAndPort,
    /// Marker seen in output only.
    MarkerOnly,
}

/// Daemon settings, loaded from TOML.
///
/// Every key is optional; a missing file or an empty file yields the
/// defaults below.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// First port handed to preview servers (inclusive).
    pub port_range_start: u16,
    /// Last port handed to preview servers (inclusive).
    pub port_range_end: u16,
    /// Substring (case-insensitive) that marks a preview server as compiled.
    pub readiness_marker: String,
    pub readiness_timeout_ms: u64,
    pub readiness_probe: ReadinessProbe,
    /// Time between SIGTERM and SIGKILL when stopping a process.
    pub stop_grace_ms: u64,
    /// Delay before an idle view stops servers of inactive projects.
    pub idle_sweep_ms: u64,
    /// Upper bound on the shutdown sweep.
    pub shutdown_wait_ms: u64,
    /// Program and arguments used to launch a preview server.
    pub preview_command: Vec<String>,
    /// Prefix for context variables injected into terminal sessions.
    pub env_prefix: String,
    /// Shell for terminal sessions. Falls back to `$SHELL`, then `/bin/sh`.
    pub shell: Option<String>,
    pub scrollback_limit: usize,
    /// Directory for per-session context files. Defaults to a runtime dir.
    pub state_dir: Option<PathBuf>,
    /// Project id -> project root, used when a start request omits the path.
    pub projects: HashMap<String, PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port_range_start: 3000,
            port_range_end: 3999,
            readiness_marker: "Compiled successfully".to_string(),
            readiness_timeout_ms: 30_000,
            readiness_probe: ReadinessProbe::MarkerAndPort,
            stop_grace_ms: 5_000,
            idle_sweep_ms: 300_000,
            shutdown_wait_ms: 10_000,
            preview_command: vec!["npm".to_string(), "start".to_string()],
            env_prefix: "DEVDOCK".to_string(),
            shell: None,
            scrollback_limit: 10_000,
            state_dir: None,
            projects: HashMap::new(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file path. Returns defaults if the file
    /// doesn't exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let settings: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port_range_start == 0 || self.port_range_start > self.port_range_end {
            return Err(ConfigError::Invalid(format!(
                "port range {}-{} is empty or starts at 0",
                self.port_range_start, self.port_range_end
            )));
        }
        if self.preview_command.is_empty() {
            return Err(ConfigError::Invalid("preview_command must not be empty".into()));
        }
        if self.readiness_marker.trim().is_empty() {
            return Err(ConfigError::Invalid("readiness_marker must not be empty".into()));
        }
        if self.env_prefix.is_empty()
            || !self.env_prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ConfigError::Invalid(format!(
                "env_prefix must be non-empty ASCII alphanumerics/underscores: {:?}",
                self.env_prefix
            )));
        }
        Ok(())
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn idle_sweep_delay(&self) -> Duration {
        Duration::from_millis(self.idle_sweep_ms)
    }

    pub fn shutdown_wait(&self) -> Duration {
        Duration::from_millis(self.shutdown_wait_ms)
    }

    /// Directory holding per-session context env files.
    pub fn resolved_state_dir(&self) -> PathBuf {
        if let Some(dir) = &self.state_dir {
            return dir.clone();
        }
        dirs::runtime_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("devdock")
    }
}

/// Resolves a project id to its root directory.
pub trait ProjectDirectory: Send + Sync {
    fn project_path(&self, project_id: &str) -> Option<PathBuf>;
}

impl ProjectDirectory for Settings {
    fn project_path(&self, project_id: &str) -> Option<PathBuf> {
        self.projects.get(project_id).cloned()
    }
}

/// Default config location: `$XDG_CONFIG_HOME/devdock/config.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("devdock")
        .join("config.toml")
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Warn if the config file is world-readable. Project paths and commands
/// live here, so it should normally be private to the user.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "Config file {} is world-readable (mode {:o}); consider chmod 600.",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

#[cfg(unix)]
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}
