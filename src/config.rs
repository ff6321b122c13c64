//! Server configuration.
//!
//! Settings are read from a TOML file (`buildyard.toml` by default), then
//! overridden by environment variables, then by CLI flags. Every field has a
//! default so an empty or missing file is valid.
//!
//! ```toml
//! port = 45362
//! root_dir = "/data/repos"
//! snapshot_path = ".buildyard/model.json"
//! sync_interval_secs = 600
//! stale_backend = "ls-remote"
//! repo_lists = ["active-repos", "active-runnables", "active-framework-repos"]
//! build_command = ["npm", "run", "build"]
//!
//! [logging]
//! json = false
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Default config file name, resolved relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "buildyard.toml";

/// Which backend the staleness detector uses to learn remote branch heads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StaleBackend {
    /// One `git ls-remote --heads` per repo.
    #[default]
    LsRemote,
    /// One code-host API call per branch, rate limited.
    Github,
}

impl std::fmt::Display for StaleBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StaleBackend::LsRemote => write!(f, "ls-remote"),
            StaleBackend::Github => write!(f, "github"),
        }
    }
}

impl std::str::FromStr for StaleBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ls-remote" => Ok(StaleBackend::LsRemote),
            "github" => Ok(StaleBackend::Github),
            _ => anyhow::bail!(
                "Invalid stale backend '{}'. Valid values: ls-remote, github",
                s
            ),
        }
    }
}

/// Logging output settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
    /// Directory for daily-rolling log files (stderr only when unset)
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

/// Full server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory holding every repo checkout and the repo list files
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,
    /// Seconds between background synchronization passes (0 disables)
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
    /// Seconds between staleness polls (0 disables)
    #[serde(default = "default_stale_interval")]
    pub stale_interval_secs: u64,
    /// Seconds between SSE heartbeat comments
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,
    /// Seconds a finished job stays attachable before eviction
    #[serde(default = "default_job_retention")]
    pub job_retention_secs: u64,
    #[serde(default = "default_sync_concurrency")]
    pub sync_concurrency: usize,
    #[serde(default = "default_api_concurrency")]
    pub api_concurrency: usize,
    #[serde(default)]
    pub stale_backend: StaleBackend,
    /// Organization owning every repo on the code host
    #[serde(default = "default_github_owner")]
    pub github_owner: String,
    /// Token for the code-host API (usually supplied via `GITHUB_TOKEN`)
    #[serde(default, skip_serializing)]
    pub github_token: Option<String>,
    /// Repo list files under `root_dir`; the active set is their union
    #[serde(default = "default_repo_lists")]
    pub repo_lists: Vec<String>,
    /// The list file naming repos that can be launched in a browser
    #[serde(default = "default_runnables_list")]
    pub runnables_list: String,
    /// File under `root_dir` listing maintained release branches as `repo branch`
    #[serde(default = "default_release_branches_file")]
    pub release_branches_file: String,
    #[serde(default = "default_build_command")]
    pub build_command: Vec<String>,
    #[serde(default = "default_install_command")]
    pub install_command: Vec<String>,
    #[serde(default = "default_esbuild_command")]
    pub esbuild_command: String,
    /// Permissive CORS for a local front-end dev server
    #[serde(default)]
    pub dev_mode: bool,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_port() -> u16 {
    45362
}

fn default_root_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from(".buildyard/model.json")
}

fn default_sync_interval() -> u64 {
    600
}

fn default_stale_interval() -> u64 {
    300
}

fn default_heartbeat() -> u64 {
    15
}

fn default_job_retention() -> u64 {
    300
}

fn default_sync_concurrency() -> usize {
    30
}

fn default_api_concurrency() -> usize {
    10
}

fn default_github_owner() -> String {
    "phetsims".to_string()
}

fn default_repo_lists() -> Vec<String> {
    vec![
        "active-repos".to_string(),
        "active-runnables".to_string(),
        "active-framework-repos".to_string(),
    ]
}

fn default_runnables_list() -> String {
    "active-runnables".to_string()
}

fn default_release_branches_file() -> String {
    "release-branches".to_string()
}

fn default_build_command() -> Vec<String> {
    vec!["npm".to_string(), "run".to_string(), "build".to_string()]
}

fn default_install_command() -> Vec<String> {
    vec!["npm".to_string(), "install".to_string()]
}

fn default_esbuild_command() -> String {
    "esbuild".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            root_dir: default_root_dir(),
            snapshot_path: default_snapshot_path(),
            sync_interval_secs: default_sync_interval(),
            stale_interval_secs: default_stale_interval(),
            heartbeat_secs: default_heartbeat(),
            job_retention_secs: default_job_retention(),
            sync_concurrency: default_sync_concurrency(),
            api_concurrency: default_api_concurrency(),
            stale_backend: StaleBackend::default(),
            github_owner: default_github_owner(),
            github_token: None,
            repo_lists: default_repo_lists(),
            runnables_list: default_runnables_list(),
            release_branches_file: default_release_branches_file(),
            build_command: default_build_command(),
            install_command: default_install_command(),
            esbuild_command: default_esbuild_command(),
            dev_mode: false,
            logging: LoggingConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load from `path` if it exists, otherwise start from defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply `BUILDYARD_*` and `GITHUB_TOKEN` environment overrides.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("BUILDYARD_PORT") {
            self.port = port.parse().map_err(|_| ConfigError::InvalidValue {
                field: "BUILDYARD_PORT",
                message: format!("'{}' is not a port number", port),
            })?;
        }
        if let Some(root) = lookup("BUILDYARD_ROOT") {
            self.root_dir = PathBuf::from(root);
        }
        if let Some(backend) = lookup("BUILDYARD_STALE_BACKEND") {
            self.stale_backend = backend.parse().map_err(|e: anyhow::Error| {
                ConfigError::InvalidValue {
                    field: "BUILDYARD_STALE_BACKEND",
                    message: e.to_string(),
                }
            })?;
        }
        if let Some(token) = lookup("GITHUB_TOKEN").filter(|t| !t.is_empty()) {
            self.github_token = Some(token);
        }
        Ok(())
    }

    /// Check the settings that must hold before the server may start.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidPort { port: self.port });
        }
        if !self.root_dir.is_dir() {
            return Err(ConfigError::InvalidRoot {
                path: self.root_dir.clone(),
            });
        }
        if self.sync_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sync_concurrency",
                message: "must be at least 1".to_string(),
            });
        }
        if self.api_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "api_concurrency",
                message: "must be at least 1".to_string(),
            });
        }
        if self.heartbeat_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "heartbeat_secs",
                message: "must be at least 1".to_string(),
            });
        }
        if self.build_command.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "build_command",
                message: "must name a program".to_string(),
            });
        }
        if self.stale_backend == StaleBackend::Github && self.github_token.is_none() {
            return Err(ConfigError::InvalidValue {
                field: "stale_backend",
                message: "the github backend requires GITHUB_TOKEN".to_string(),
            });
        }
        Ok(())
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        use anyhow::Context;
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}
