//! Configuration for the gateway server and the broker hub.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/parley/config.toml`)
//! 4. Compiled defaults

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{AuthError, IdentityVerifier, SignedTokenVerifier, StaticTokenVerifier};

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("invalid value for {key}: {reason}")]
    Invalid {
        /// Offending key.
        key: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// Neither an issuer key nor development tokens are configured.
    #[error("no identity verification configured: set an issuer key or dev tokens")]
    MissingAuth,

    /// The issuer key is unusable.
    #[error("invalid auth configuration: {0}")]
    Auth(#[from] AuthError),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    server: ServerFileConfig,
    broker: BrokerFileConfig,
    auth: AuthFileConfig,
    hub: HubFileConfig,
}

/// `[server]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
    instance_id: Option<String>,
    heartbeat_interval_secs: Option<u64>,
    heartbeat_timeout_secs: Option<u64>,
    max_frame_size: Option<usize>,
    log_dir: Option<PathBuf>,
}

/// `[broker]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct BrokerFileConfig {
    url: Option<String>,
    reconnect_delay_ms: Option<u64>,
}

/// `[auth]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct AuthFileConfig {
    issuer_public_key: Option<String>,
    dev_tokens: BTreeMap<String, String>,
}

/// `[hub]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct HubFileConfig {
    bind_addr: Option<String>,
    log_dir: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the gateway server.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Parley messaging gateway")]
pub struct ServerCliArgs {
    /// Address to bind the gateway to.
    #[arg(short, long, env = "PARLEY_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/parley/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Unique id of this gateway instance (random when absent).
    #[arg(long, env = "PARLEY_INSTANCE_ID")]
    pub instance_id: Option<String>,

    /// Broker hub URL, e.g. `ws://hub:9100/bus`. In-process bus when absent.
    #[arg(long, env = "PARLEY_BROKER_URL")]
    pub broker_url: Option<String>,

    /// Base64 Ed25519 public key of the identity service.
    #[arg(long, env = "PARLEY_ISSUER_KEY")]
    pub issuer_public_key: Option<String>,

    /// Seconds between heartbeat pings.
    #[arg(long)]
    pub heartbeat_interval_secs: Option<u64>,

    /// Seconds of silence after which a connection is dropped.
    #[arg(long)]
    pub heartbeat_timeout_secs: Option<u64>,

    /// Maximum inbound frame size in bytes.
    #[arg(long)]
    pub max_frame_size: Option<usize>,

    /// Directory for the log file (stdout when absent).
    #[arg(long, env = "PARLEY_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "PARLEY_LOG")]
    pub log_level: String,
}

/// CLI arguments for the broker hub.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Parley broker hub")]
pub struct HubCliArgs {
    /// Address to bind the hub to.
    #[arg(short, long, env = "PARLEY_HUB_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/parley/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Directory for the log file (stdout when absent).
    #[arg(long, env = "PARLEY_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "PARLEY_LOG")]
    pub log_level: String,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// How tokens are verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthConfig {
    /// Ed25519 signed tokens from the identity service.
    Issuer {
        /// Base64 public key.
        public_key: String,
    },
    /// Fixed token → user table, for local development.
    DevTokens(BTreeMap<String, String>),
    /// Nothing configured.
    Unset,
}

/// Fully resolved gateway configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the gateway to (e.g., `0.0.0.0:9000`).
    pub bind_addr: String,
    /// Unique id of this instance on the broker.
    pub instance_id: String,
    /// Interval between heartbeat pings.
    pub heartbeat_interval: Duration,
    /// Silence after which a connection is treated as gone.
    pub heartbeat_timeout: Duration,
    /// Maximum inbound frame size in bytes.
    pub max_frame_size: usize,
    /// Broker hub URL; `None` selects the in-process bus.
    pub broker_url: Option<String>,
    /// Delay between hub reconnect attempts.
    pub broker_reconnect_delay: Duration,
    /// Token verification settings.
    pub auth: AuthConfig,
    /// Directory for the log file.
    pub log_dir: Option<PathBuf>,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9000".to_string(),
            instance_id: uuid::Uuid::new_v4().to_string(),
            heartbeat_interval: Duration::from_secs(25),
            heartbeat_timeout: Duration::from_secs(60),
            max_frame_size: 64 * 1024,
            broker_url: None,
            broker_reconnect_delay: Duration::from_millis(1000),
            auth: AuthConfig::Unset,
            log_dir: None,
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path is tried and a missing
    /// file is treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed,
    /// or if the heartbeat settings are inconsistent.
    pub fn load(cli: &ServerCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        let config = Self::resolve(cli, &file);
        config.validate()?;
        Ok(config)
    }

    /// Priority: CLI > file > default.
    fn resolve(cli: &ServerCliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        let auth = match cli
            .issuer_public_key
            .clone()
            .or_else(|| file.auth.issuer_public_key.clone())
        {
            Some(public_key) => AuthConfig::Issuer { public_key },
            None if !file.auth.dev_tokens.is_empty() => {
                AuthConfig::DevTokens(file.auth.dev_tokens.clone())
            }
            None => AuthConfig::Unset,
        };

        Self {
            bind_addr: cli
                .bind
                .clone()
                .or_else(|| file.server.bind_addr.clone())
                .unwrap_or(defaults.bind_addr),
            instance_id: cli
                .instance_id
                .clone()
                .or_else(|| file.server.instance_id.clone())
                .unwrap_or(defaults.instance_id),
            heartbeat_interval: cli
                .heartbeat_interval_secs
                .or(file.server.heartbeat_interval_secs)
                .map_or(defaults.heartbeat_interval, Duration::from_secs),
            heartbeat_timeout: cli
                .heartbeat_timeout_secs
                .or(file.server.heartbeat_timeout_secs)
                .map_or(defaults.heartbeat_timeout, Duration::from_secs),
            max_frame_size: cli
                .max_frame_size
                .or(file.server.max_frame_size)
                .unwrap_or(defaults.max_frame_size),
            broker_url: cli.broker_url.clone().or_else(|| file.broker.url.clone()),
            broker_reconnect_delay: file
                .broker
                .reconnect_delay_ms
                .map_or(defaults.broker_reconnect_delay, Duration::from_millis),
            auth,
            log_dir: cli.log_dir.clone().or_else(|| file.server.log_dir.clone()),
            log_level: cli.log_level.clone(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "heartbeat_interval_secs",
                reason: "must be positive".into(),
            });
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(ConfigError::Invalid {
                key: "heartbeat_timeout_secs",
                reason: "must be longer than the heartbeat interval".into(),
            });
        }
        if self.max_frame_size == 0 {
            return Err(ConfigError::Invalid {
                key: "max_frame_size",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }

    /// Builds the identity verifier described by `[auth]`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingAuth`] when nothing is configured, or
    /// [`ConfigError::Auth`] when the issuer key cannot be decoded.
    pub fn identity_verifier(&self) -> Result<Arc<dyn IdentityVerifier>, ConfigError> {
        match &self.auth {
            AuthConfig::Issuer { public_key } => {
                Ok(Arc::new(SignedTokenVerifier::from_base64(public_key)?))
            }
            AuthConfig::DevTokens(tokens) => {
                tracing::warn!(count = tokens.len(), "using static development tokens");
                let verifier = tokens
                    .iter()
                    .fold(StaticTokenVerifier::new(), |v, (token, user)| {
                        v.with_token(token.clone(), user.clone())
                    });
                Ok(Arc::new(verifier))
            }
            AuthConfig::Unset => Err(ConfigError::MissingAuth),
        }
    }
}

/// Fully resolved hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Address to bind the hub to (e.g., `0.0.0.0:9100`).
    pub bind_addr: String,
    /// Directory for the log file.
    pub log_dir: Option<PathBuf>,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9100".to_string(),
            log_dir: None,
            log_level: "info".to_string(),
        }
    }
}

impl HubConfig {
    /// Load hub configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &HubCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    fn resolve(cli: &HubCliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: cli
                .bind
                .clone()
                .or_else(|| file.hub.bind_addr.clone())
                .unwrap_or(defaults.bind_addr),
            log_dir: cli.log_dir.clone().or_else(|| file.hub.log_dir.clone()),
            log_level: cli.log_level.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse the TOML config file.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("parley").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
