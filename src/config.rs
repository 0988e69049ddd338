//! Global configuration parsing and validation.

use std::fs;
use std::net::IpAddr;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Closed-open range of ports handed out to session servers.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PortPoolConfig {
    /// First port in the pool (inclusive).
    #[serde(default = "default_port_low")]
    pub low: u16,
    /// End of the pool (exclusive).
    #[serde(default = "default_port_high")]
    pub high: u16,
}

impl PortPoolConfig {
    /// The pool as a `low..high` range.
    #[must_use]
    pub fn range(&self) -> Range<u16> {
        self.low..self.high
    }

    /// Number of ports in the pool.
    #[must_use]
    pub fn capacity(&self) -> usize {
        usize::from(self.high.saturating_sub(self.low))
    }
}

impl Default for PortPoolConfig {
    fn default() -> Self {
        Self {
            low: default_port_low(),
            high: default_port_high(),
        }
    }
}

fn default_port_low() -> u16 {
    9500
}

fn default_port_high() -> u16 {
    9601
}

/// Launch settings for the per-user notebook server.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ServerConfig {
    /// Executable to launch (e.g., `ipython`, `jupyter`).
    #[serde(default = "default_program")]
    pub program: String,
    /// Arguments placed before the generated profile/port/directory flags.
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    /// Name of the dedicated configuration profile.
    #[serde(default = "default_profile")]
    pub profile: String,
    /// Optional file overriding the built-in configuration template.
    #[serde(default)]
    pub config_template: Option<PathBuf>,
    /// Run `<program> profile create <profile>` before writing the rendered config.
    #[serde(default)]
    pub create_profile: bool,
    /// Time a deleted session's server gets to exit after SIGTERM before it is killed.
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,
}

impl ServerConfig {
    /// SIGTERM grace period.
    #[must_use]
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            profile: default_profile(),
            config_template: None,
            create_profile: false,
            terminate_grace_ms: default_terminate_grace_ms(),
        }
    }
}

fn default_program() -> String {
    "ipython".into()
}

fn default_args() -> Vec<String> {
    vec!["notebook".into()]
}

fn default_profile() -> String {
    "nbserver".into()
}

fn default_terminate_grace_ms() -> u64 {
    5000
}

/// How the supervisor decides a freshly spawned server is reachable.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessMode {
    /// Sleep for `settle_ms` after spawning.
    Delay,
    /// Poll the port with TCP connects until it accepts or `timeout_seconds` elapses.
    Probe,
}

/// Post-spawn settling configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ReadinessConfig {
    /// Settling strategy.
    #[serde(default = "default_readiness_mode")]
    pub mode: ReadinessMode,
    /// Fixed delay used in `delay` mode.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    /// Upper bound on probing in `probe` mode.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Pause between connection attempts in `probe` mode.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Address the probe connects to.
    #[serde(default = "default_probe_host")]
    pub probe_host: IpAddr,
}

impl ReadinessConfig {
    /// Fixed settle delay.
    #[must_use]
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    /// Probe deadline.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Probe poll interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            mode: default_readiness_mode(),
            settle_ms: default_settle_ms(),
            timeout_seconds: default_timeout_seconds(),
            poll_interval_ms: default_poll_interval_ms(),
            probe_host: default_probe_host(),
        }
    }
}

fn default_readiness_mode() -> ReadinessMode {
    ReadinessMode::Probe
}

fn default_settle_ms() -> u64 {
    1000
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_probe_host() -> IpAddr {
    IpAddr::from([127, 0, 0, 1])
}

fn default_db_path() -> PathBuf {
    PathBuf::from("nbhydra.db")
}

fn default_http_port() -> u16 {
    5000
}

fn default_bind_address() -> IpAddr {
    IpAddr::from([127, 0, 0, 1])
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Directory holding one workspace per user.
    pub data_dir: PathBuf,
    /// Base address users are redirected to, without the port (e.g., `http://nb.example.org`).
    pub base_url: String,
    /// `SQLite` database file for session records.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Read-only directory copied into each new user's notebook directory.
    #[serde(default)]
    pub init_data_dir: Option<PathBuf>,
    /// Port the HTTP front end listens on.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Address the HTTP front end binds to.
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    /// Ports available for session servers.
    #[serde(default)]
    pub port_pool: PortPoolConfig,
    /// Session server launch settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Post-spawn settling behavior.
    #[serde(default)]
    pub readiness: ReadinessConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&mut self) -> Result<()> {
        if self.port_pool.low >= self.port_pool.high {
            return Err(AppError::Config(format!(
                "port_pool.low ({}) must be below port_pool.high ({})",
                self.port_pool.low, self.port_pool.high
            )));
        }

        if self.base_url.trim().is_empty() {
            return Err(AppError::Config("base_url must not be empty".into()));
        }
        self.base_url = self.base_url.trim_end_matches('/').to_owned();

        if self.server.program.trim().is_empty() {
            return Err(AppError::Config("server.program must not be empty".into()));
        }

        if self.server.profile.is_empty()
            || !self.server.profile.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(AppError::Config(format!(
                "server.profile must be alphanumeric: {:?}",
                self.server.profile
            )));
        }

        if let Some(ref dir) = self.init_data_dir {
            let canonical = dir
                .canonicalize()
                .map_err(|err| AppError::Config(format!("init_data_dir invalid: {err}")))?;
            if !canonical.is_dir() {
                return Err(AppError::Config(format!(
                    "init_data_dir is not a directory: {}",
                    canonical.display()
                )));
            }
            self.init_data_dir = Some(canonical);
        }

        if let Some(ref template) = self.server.config_template {
            if !template.is_file() {
                return Err(AppError::Config(format!(
                    "server.config_template not found: {}",
                    template.display()
                )));
            }
        }

        Ok(())
    }
}
