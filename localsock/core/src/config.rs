//! TOML Configuration File Support
//!
//! Settings for a single local socket server, loaded from
//! `~/.config/localsock/localsock.toml`.
//!
//! # Configuration Priority
//!
//! Values are resolved with the following priority (highest first):
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! title = "localsock"
//! socket_path = "/run/user/1000/localsock/localsock.sock"
//! backlog = 50
//! receive_timeout_ms = 10000
//! send_timeout_ms = 10000
//! ```
//!
//! An abstract-namespace socket is configured by starting the path with a NUL
//! character (`"\u0000localsock"`).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::LocalSocketError;
use crate::native::{current_uid, MAX_BACKLOG};
use crate::run_config::{RunConfig, DEFAULT_BACKLOG, DEFAULT_RECEIVE_TIMEOUT, DEFAULT_SEND_TIMEOUT};

/// Title used when none is configured
pub const DEFAULT_TITLE: &str = "localsock";

/// Environment variable overriding the server title
pub const ENV_TITLE: &str = "LOCALSOCK_TITLE";
/// Environment variable overriding the socket path
pub const ENV_SOCKET: &str = "LOCALSOCK_SOCKET";
/// Environment variable overriding the listen backlog
pub const ENV_BACKLOG: &str = "LOCALSOCK_BACKLOG";
/// Environment variable overriding the receive timeout (milliseconds)
pub const ENV_RECEIVE_TIMEOUT_MS: &str = "LOCALSOCK_RECEIVE_TIMEOUT_MS";
/// Environment variable overriding the send timeout (milliseconds)
pub const ENV_SEND_TIMEOUT_MS: &str = "LOCALSOCK_SEND_TIMEOUT_MS";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {}: {source}", path.display())]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Server section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Title used in logs and errors
    pub title: Option<String>,

    /// Socket path (filesystem, or abstract when starting with NUL)
    pub socket_path: Option<String>,

    /// Listen backlog
    pub backlog: Option<i32>,

    /// Per-client receive timeout in milliseconds
    pub receive_timeout_ms: Option<u64>,

    /// Per-client send timeout in milliseconds
    pub send_timeout_ms: Option<u64>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSockToml {
    /// Server configuration section
    pub server: ServerToml,
}

// =============================================================================
// Resolved Settings
// =============================================================================

/// Resolved settings for one server socket
#[derive(Clone, Debug)]
pub struct ServerSettings {
    /// Title used in logs and errors
    pub title: String,

    /// Socket path
    pub socket_path: String,

    /// Listen backlog
    pub backlog: i32,

    /// Per-client receive timeout
    pub receive_timeout: Duration,

    /// Per-client send timeout
    pub send_timeout: Duration,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    socket_path_source: ConfigSource,
    source: ConfigSource,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            title: DEFAULT_TITLE.to_string(),
            socket_path: default_socket_path(DEFAULT_TITLE)
                .to_string_lossy()
                .into_owned(),
            backlog: DEFAULT_BACKLOG,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            config_file_path: None,
            socket_path_source: ConfigSource::Default,
            source: ConfigSource::Default,
        }
    }
}

impl ServerSettings {
    /// Highest-priority source that contributed any value
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Where the socket path came from
    #[must_use]
    pub fn socket_path_source(&self) -> ConfigSource {
        self.socket_path_source
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.title.trim().is_empty() {
            return Err(ConfigError::ValidationError("title must not be empty".to_string()));
        }
        if self.socket_path.is_empty() {
            return Err(ConfigError::ValidationError(
                "socket_path must not be empty".to_string(),
            ));
        }
        if !(1..=MAX_BACKLOG).contains(&self.backlog) {
            return Err(ConfigError::ValidationError(format!(
                "backlog {} is not between 1 and {MAX_BACKLOG}",
                self.backlog
            )));
        }
        if self.receive_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "receive_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.send_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "send_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the [`RunConfig`] these settings describe
    ///
    /// # Errors
    ///
    /// Path errors from [`RunConfig::new`].
    pub fn to_run_config(&self) -> Result<RunConfig, LocalSocketError> {
        Ok(RunConfig::new(self.title.clone(), &self.socket_path)?
            .with_backlog(self.backlog)
            .with_timeouts(self.receive_timeout, self.send_timeout))
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/localsock/localsock.toml`, or
/// `~/.config/localsock/localsock.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("localsock").join("localsock.toml"))
}

/// Default socket path for a server named `name`
///
/// `$XDG_RUNTIME_DIR/localsock/<name>.sock`, falling back to
/// `/tmp/localsock-$UID/<name>.sock`.
#[must_use]
pub fn default_socket_path(name: &str) -> PathBuf {
    let file = format!("{name}.sock");
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(runtime_dir) if !runtime_dir.is_empty() => {
            PathBuf::from(runtime_dir).join("localsock").join(file)
        }
        _ => PathBuf::from(format!("/tmp/localsock-{}", current_uid())).join(file),
    }
}

/// Load settings from the default config file and the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be read or parsed,
/// or if the resulting settings fail validation. A missing config file is not
/// an error.
pub fn load_settings() -> Result<ServerSettings, ConfigError> {
    load_settings_from_path(default_config_path())
}

/// Load settings from a specific config file and the environment
///
/// # Errors
///
/// See [`load_settings`].
pub fn load_settings_from_path(path: Option<PathBuf>) -> Result<ServerSettings, ConfigError> {
    load_settings_with_env(path, |key| std::env::var(key).ok())
}

/// Load settings using `env` to look up environment variables
///
/// # Errors
///
/// See [`load_settings`].
pub fn load_settings_with_env(
    path: Option<PathBuf>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ServerSettings, ConfigError> {
    let mut settings = ServerSettings::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: LocalSockToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut settings, &toml_config);
            settings.config_file_path = Some(config_path.clone());
            settings.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut settings, env);

    settings.validate()?;
    Ok(settings)
}

fn apply_toml_config(settings: &mut ServerSettings, toml: &LocalSockToml) {
    let server = &toml.server;

    if let Some(ref title) = server.title {
        settings.title.clone_from(title);
        // A custom title moves the default socket along with it
        if server.socket_path.is_none() {
            settings.socket_path = default_socket_path(title).to_string_lossy().into_owned();
        }
    }
    if let Some(ref path) = server.socket_path {
        settings.socket_path.clone_from(path);
        settings.socket_path_source = ConfigSource::File;
    }
    if let Some(backlog) = server.backlog {
        settings.backlog = backlog;
    }
    if let Some(ms) = server.receive_timeout_ms {
        settings.receive_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = server.send_timeout_ms {
        settings.send_timeout = Duration::from_millis(ms);
    }
}

fn apply_env_config(settings: &mut ServerSettings, env: impl Fn(&str) -> Option<String>) {
    if let Some(title) = env(ENV_TITLE) {
        if settings.socket_path_source == ConfigSource::Default {
            settings.socket_path = default_socket_path(&title).to_string_lossy().into_owned();
        }
        settings.title = title;
        settings.source = ConfigSource::Env;
    }
    if let Some(path) = env(ENV_SOCKET) {
        settings.socket_path = path;
        settings.socket_path_source = ConfigSource::Env;
        settings.source = ConfigSource::Env;
    }
    if let Some(backlog) = env(ENV_BACKLOG) {
        match backlog.parse::<i32>() {
            Ok(n) => {
                settings.backlog = n;
                settings.source = ConfigSource::Env;
            }
            Err(e) => tracing::warn!(var = ENV_BACKLOG, value = %backlog, error = %e, "Ignoring unparseable value"),
        }
    }
    if let Some(timeout) = env(ENV_RECEIVE_TIMEOUT_MS) {
        match timeout.parse::<u64>() {
            Ok(ms) => {
                settings.receive_timeout = Duration::from_millis(ms);
                settings.source = ConfigSource::Env;
            }
            Err(e) => tracing::warn!(var = ENV_RECEIVE_TIMEOUT_MS, value = %timeout, error = %e, "Ignoring unparseable value"),
        }
    }
    if let Some(timeout) = env(ENV_SEND_TIMEOUT_MS) {
        match timeout.parse::<u64>() {
            Ok(ms) => {
                settings.send_timeout = Duration::from_millis(ms);
                settings.source = ConfigSource::Env;
            }
            Err(e) => tracing::warn!(var = ENV_SEND_TIMEOUT_MS, value = %timeout, error = %e, "Ignoring unparseable value"),
        }
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Command-line overrides applied after [`load_settings`]
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Title override
    pub title: Option<String>,

    /// Socket path override
    pub socket_path: Option<String>,

    /// Backlog override
    pub backlog: Option<i32>,

    /// Receive timeout override (milliseconds)
    pub receive_timeout_ms: Option<u64>,

    /// Send timeout override (milliseconds)
    pub send_timeout_ms: Option<u64>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set title override
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Set socket path override
    #[must_use]
    pub fn with_socket_path(mut self, path: impl Into<String>) -> Self {
        self.socket_path = Some(path.into());
        self
    }

    /// Set backlog override
    #[must_use]
    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = Some(backlog);
        self
    }

    /// Apply overrides, then re-validate
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if an override is out of range.
    pub fn apply(&self, settings: &mut ServerSettings) -> Result<(), ConfigError> {
        if self.title.is_some()
            || self.socket_path.is_some()
            || self.backlog.is_some()
            || self.receive_timeout_ms.is_some()
            || self.send_timeout_ms.is_some()
        {
            settings.source = ConfigSource::Cli;
        }

        if let Some(ref title) = self.title {
            if self.socket_path.is_none() && settings.socket_path_source == ConfigSource::Default {
                settings.socket_path = default_socket_path(title).to_string_lossy().into_owned();
            }
            settings.title.clone_from(title);
        }
        if let Some(ref path) = self.socket_path {
            settings.socket_path.clone_from(path);
            settings.socket_path_source = ConfigSource::Cli;
        }
        if let Some(backlog) = self.backlog {
            settings.backlog = backlog;
        }
        if let Some(ms) = self.receive_timeout_ms {
            settings.receive_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.send_timeout_ms {
            settings.send_timeout = Duration::from_millis(ms);
        }

        settings.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================
