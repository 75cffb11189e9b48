//! Configuration for the execution engine.
//!
//! Configuration is loaded from `~/.config/obsh/config.toml`. The
//! `OBSH_RUNNER` environment variable overrides the runner path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::fork::MergePolicy;

/// Environment variable naming the local runner program.
pub const RUNNER_ENV: &str = "OBSH_RUNNER";

/// Where fork workers execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    /// One runner child process per worker.
    #[default]
    Process,
    /// Tasks on the local runtime, over in-memory channels.
    InProcess,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Local runner program used for jobs and local workers.
    pub runner: PathBuf,

    /// Runner program name on remote hosts.
    pub remote_runner: String,

    /// Command prefix for reaching a remote host; the host name follows it.
    pub ssh: Vec<String>,

    /// Command prefix for privilege-elevated workers.
    pub elevate: Vec<String>,

    pub worker_mode: WorkerMode,

    pub merge: MergePolicy,

    /// How long a worker may linger after closing its channel.
    pub worker_grace_ms: u64,

    /// Wait after each kill signal before checking again.
    pub kill_wait_ms: u64,

    /// Bounded readiness wait of the job listener.
    pub listener_tick_ms: u64,

    /// Poll interval of the runner while it waits for a pipeline to finish.
    pub runner_poll_ms: u64,
}

fn default_runner() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("obsh-runner")))
        .unwrap_or_else(|| PathBuf::from("obsh-runner"))
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            runner: default_runner(),
            remote_runner: "obsh-runner".to_string(),
            ssh: vec!["ssh".to_string(), "-T".to_string()],
            elevate: vec!["sudo".to_string(), "-n".to_string()],
            worker_mode: WorkerMode::default(),
            merge: MergePolicy::default(),
            worker_grace_ms: 500,
            kill_wait_ms: 200,
            listener_tick_ms: 100,
            runner_poll_ms: 50,
        }
    }
}

impl KernelConfig {
    /// Load configuration from the default path, then apply environment
    /// overrides.
    ///
    /// If the config file doesn't exist, returns default configuration.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            tracing::debug!("No config file at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Get the default config file path.
    pub fn config_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("", "", "obsh").context("Could not determine config directory")?;

        Ok(dirs.config_dir().join("config.toml"))
    }

    fn apply_env(&mut self) {
        if let Some(runner) = std::env::var_os(RUNNER_ENV) {
            self.runner = PathBuf::from(runner);
        }
    }

    pub fn with_runner(mut self, runner: impl Into<PathBuf>) -> Self {
        self.runner = runner.into();
        self
    }

    pub fn worker_grace(&self) -> Duration {
        Duration::from_millis(self.worker_grace_ms)
    }

    pub fn kill_wait(&self) -> Duration {
        Duration::from_millis(self.kill_wait_ms)
    }

    pub fn listener_tick(&self) -> Duration {
        Duration::from_millis(self.listener_tick_ms)
    }

    pub fn runner_poll(&self) -> Duration {
        Duration::from_millis(self.runner_poll_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = KernelConfig::default();
        assert_eq!(config.remote_runner, "obsh-runner");
        assert_eq!(config.ssh, vec!["ssh", "-T"]);
        assert_eq!(config.elevate, vec!["sudo", "-n"]);
        assert_eq!(config.worker_mode, WorkerMode::Process);
        assert_eq!(config.merge, MergePolicy::Arrival);
        assert_eq!(config.kill_wait(), Duration::from_millis(200));
    }

    #[test]
    fn test_parse_partial_config() {
        let toml = r#"
worker_mode = "in_process"
merge = "worker_order"
kill_wait_ms = 50
ssh = ["ssh", "-T", "-o", "BatchMode=yes"]
"#;
        let config: KernelConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.worker_mode, WorkerMode::InProcess);
        assert_eq!(config.merge, MergePolicy::WorkerOrder);
        assert_eq!(config.kill_wait_ms, 50);
        assert_eq!(config.ssh.len(), 4);
        assert_eq!(config.worker_grace_ms, 500);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "runner = \"/opt/obsh/bin/obsh-runner\"\n").unwrap();

        let config = KernelConfig::load_from(&path).unwrap();
        assert_eq!(config.runner, PathBuf::from("/opt/obsh/bin/obsh-runner"));
    }

    #[test]
    fn test_load_from_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "kill_wait_ms = \"soon\"\n").unwrap();

        assert!(KernelConfig::load_from(&path).is_err());
    }
}
