//! Configuration management for the webterm daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/webterm/config.toml`.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::AttachPolicy;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("host must be an IP address, got {0}")]
    InvalidHost(String),

    #[error("port must be greater than 0")]
    InvalidPort,

    #[error("token must not be empty when set")]
    EmptyToken,

    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("buffer_capacity must be between 1 KiB and 64 MiB, got {0}")]
    InvalidBufferCapacity(usize),

    #[error("idle_timeout_secs must be greater than 0")]
    InvalidIdleTimeout,

    #[error("reap_interval_secs must be between 1 and idle_timeout_secs, got {0}")]
    InvalidReapInterval(u64),

    #[error("output_watermark must be between 1 and 65536 chunks, got {0}")]
    InvalidOutputWatermark(usize),

    #[error("handshake_timeout_secs must be between 1 and 300, got {0}")]
    InvalidHandshakeTimeout(u64),

    #[error("default dimensions must be within 1..=1000, got {0}x{1}")]
    InvalidDimensions(u16, u16),

    #[error("max_size must be greater than 0, got {0}")]
    InvalidMaxSize(u64),

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the webterm daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// HTTP listener and authentication.
    pub server: ServerConfig,

    /// Terminal session policy.
    pub session: SessionConfig,

    /// Read-only file browsing.
    pub files: FilesConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind.
    pub host: String,

    /// Port to bind.
    pub port: u16,

    /// Shared secret. `None` disables authentication.
    pub token: Option<String>,

    /// Directory of static client assets served at `/`.
    pub static_dir: Option<PathBuf>,
}

/// Terminal session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell spawned for new sessions.
    pub default_shell: String,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Rows used when the client does not send dimensions.
    pub default_rows: u16,

    /// Columns used when the client does not send dimensions.
    pub default_cols: u16,

    /// Scrollback kept per session for replay on reattach, in bytes.
    pub buffer_capacity: usize,

    /// Detached sessions idle longer than this are terminated.
    pub idle_timeout_secs: u64,

    /// How often the idle reaper runs.
    pub reap_interval_secs: u64,

    /// Output chunks queued for a connection before it is evicted as too slow.
    pub output_watermark: usize,

    /// Time allowed for the initial attach frame.
    pub handshake_timeout_secs: u64,

    /// What happens when a second connection attaches to a held session.
    pub attach_policy: AttachPolicy,

    /// Grace period between SIGHUP and SIGKILL on terminate.
    pub terminate_grace_ms: u64,
}

/// File browsing configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FilesConfig {
    /// Roots the browser may read. Empty means the user's home directory.
    pub allowed_paths: Vec<PathBuf>,

    /// Maximum file size returned by the content endpoint, in bytes.
    pub max_size: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            token: None,
            static_dir: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            max_sessions: 32,
            default_rows: 24,
            default_cols: 80,
            buffer_capacity: 256 * 1024,
            idle_timeout_secs: 30 * 60,
            reap_interval_secs: 30,
            output_watermark: 256,
            handshake_timeout_secs: 10,
            attach_policy: AttachPolicy::default(),
            terminate_grace_ms: 2000,
        }
    }
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            allowed_paths: Vec::new(),
            max_size: 1024 * 1024, // 1MB
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

impl FilesConfig {
    /// Roots the browser is confined to.
    pub fn roots(&self) -> Vec<PathBuf> {
        if self.allowed_paths.is_empty() {
            dirs::home_dir().into_iter().collect()
        } else {
            self.allowed_paths.clone()
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("webterm")
        .join("config.toml")
}

/// Returns the default shell for the current platform.
fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Empty values are ignored. Supported variables:
    /// - WEBTERM_HOST: bind address
    /// - WEBTERM_PORT: bind port
    /// - WEBTERM_TOKEN: shared authentication secret
    /// - WEBTERM_LOG_LEVEL: log level (trace, debug, info, warn, error)
    /// - WEBTERM_SHELL: shell for new sessions
    pub fn apply_env_overrides(&mut self) {
        if let Some(host) = non_empty_env("WEBTERM_HOST") {
            tracing::info!("Overriding host from environment: {}", host);
            self.server.host = host;
        }

        if let Some(port) = non_empty_env("WEBTERM_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    tracing::info!("Overriding port from environment: {}", port);
                    self.server.port = port;
                }
                Err(_) => tracing::warn!("Ignoring invalid WEBTERM_PORT value: {}", port),
            }
        }

        if let Some(token) = non_empty_env("WEBTERM_TOKEN") {
            tracing::info!("Overriding token from environment");
            self.server.token = Some(token);
        }

        if let Some(level) = non_empty_env("WEBTERM_LOG_LEVEL") {
            tracing::info!("Overriding log_level from environment: {}", level);
            self.daemon.log_level = level;
        }

        if let Some(shell) = non_empty_env("WEBTERM_SHELL") {
            tracing::info!("Overriding default_shell from environment: {}", shell);
            self.session.default_shell = shell;
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.host.parse::<IpAddr>().is_err() {
            return Err(ConfigError::InvalidHost(self.server.host.clone()));
        }

        if self.server.port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        if matches!(&self.server.token, Some(token) if token.is_empty()) {
            return Err(ConfigError::EmptyToken);
        }

        let session = &self.session;

        if session.max_sessions < 1 || session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(session.max_sessions));
        }

        if session.buffer_capacity < 1024 || session.buffer_capacity > 64 * 1024 * 1024 {
            return Err(ConfigError::InvalidBufferCapacity(session.buffer_capacity));
        }

        if session.idle_timeout_secs == 0 {
            return Err(ConfigError::InvalidIdleTimeout);
        }

        if session.reap_interval_secs == 0 || session.reap_interval_secs > session.idle_timeout_secs
        {
            return Err(ConfigError::InvalidReapInterval(session.reap_interval_secs));
        }

        if session.output_watermark == 0 || session.output_watermark > 65536 {
            return Err(ConfigError::InvalidOutputWatermark(session.output_watermark));
        }

        if session.handshake_timeout_secs == 0 || session.handshake_timeout_secs > 300 {
            return Err(ConfigError::InvalidHandshakeTimeout(
                session.handshake_timeout_secs,
            ));
        }

        let max = protocol::MAX_DIMENSION;
        let (rows, cols) = (session.default_rows, session.default_cols);
        if rows == 0 || cols == 0 || rows > max || cols > max {
            return Err(ConfigError::InvalidDimensions(rows, cols));
        }

        if self.files.max_size == 0 {
            return Err(ConfigError::InvalidMaxSize(self.files.max_size));
        }

        // Absolute shells must exist; bare names must resolve through PATH
        let shell_path = Path::new(&session.default_shell);
        let shell_found = if shell_path.is_absolute() {
            shell_path.exists()
        } else {
            which::which(&session.default_shell).is_ok()
        };
        if !shell_found {
            return Err(ConfigError::InvalidShellPath(session.default_shell.clone()));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
