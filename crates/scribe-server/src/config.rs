//! Server configuration.
//!
//! Sources, later ones overriding earlier ones:
//! - Built-in defaults
//! - TOML file (`SCRIBE_CONFIG`, or the first of the default paths that exists)
//! - Environment variables (`SCRIBE_*`, nested with `__`, e.g.
//!   `SCRIBE_LIMITS__QUEUE_CAPACITY=512`)

use anyhow::{Context, Result};
use scribe_core::{HubConfig, SessionConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "SCRIBE";
const CONFIG_PATH_ENV: &str = "SCRIBE_CONFIG";
const JWT_SECRET_ENV: &str = "JWT_SECRET";

const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "scribe.toml",
    "/etc/scribe/scribe.toml",
    "~/.config/scribe/scribe.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Per-session behaviour.
    #[serde(default)]
    pub session: SessionSettings,

    /// Authentication.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path prefix for the WebSocket endpoint; documents live at `{path}/{documentId}`.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum inbound WebSocket message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Outbound queue capacity per session.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Hub command mailbox capacity.
    #[serde(default = "default_hub_mailbox_capacity")]
    pub hub_mailbox_capacity: usize,
}

/// Per-session settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Close a session after this many milliseconds without inbound frames (0 disables).
    #[serde(default)]
    pub idle_timeout_ms: u64,
}

/// Authentication configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret used to verify bearer tokens.
    #[serde(default)]
    pub jwt_secret: Option<String>,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_queue_capacity() -> usize {
    scribe_core::session::DEFAULT_QUEUE_CAPACITY
}

fn default_hub_mailbox_capacity() -> usize {
    scribe_core::hub::DEFAULT_MAILBOX_CAPACITY
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            session: SessionSettings::default(),
            auth: AuthConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            queue_capacity: default_queue_capacity(),
            hub_mailbox_capacity: default_hub_mailbox_capacity(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from file, environment and defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = Self::locate_file() {
            tracing::info!("Loading config from {}", path.display());
            builder = builder.add_source(config::File::from(path));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to assemble configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Invalid configuration")?;

        Ok(config.with_secret_fallback())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config.with_secret_fallback())
    }

    fn locate_file() -> Option<PathBuf> {
        if let Ok(explicit) = std::env::var(CONFIG_PATH_ENV) {
            return Some(PathBuf::from(shellexpand::tilde(&explicit).as_ref()));
        }

        DEFAULT_CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
    }

    fn with_secret_fallback(mut self) -> Self {
        if self.auth.jwt_secret.is_none() {
            self.auth.jwt_secret = std::env::var(JWT_SECRET_ENV)
                .ok()
                .filter(|secret| !secret.is_empty());
        }
        self
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a valid socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Hub settings derived from the limits.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            mailbox_capacity: self.limits.hub_mailbox_capacity,
        }
    }

    /// Session settings derived from the limits and session sections.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            queue_capacity: self.limits.queue_capacity,
            idle_timeout: match self.session.idle_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
        }
    }
}
