//! Broker configuration
//!
//! Loaded from TOML. Every section is optional and falls back to its
//! `Default`. Two environment hooks are layered on top of the file:
//!
//! - `${VAR}` and `${VAR:-fallback}` placeholders inside the file are expanded
//!   before parsing
//! - `VIBEMQ__SECTION__KEY=value` variables override single keys after
//!   parsing, e.g. `VIBEMQ__LIMITS__MAX_INFLIGHT=64`

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::{Captures, Regex};
use serde::Deserialize;

pub use persistence::{BackendType, PersistenceConfig};
pub use security::{AclConfig, AclPermissions, AclRole, AuthConfig, UserConfig};

mod persistence;
mod security;


/// Prefix of override variables; `__` separates nesting levels
const ENV_PREFIX: &str = "VIBEMQ";

fn placeholder() -> Option<&'static Regex> {
    static PLACEHOLDER: OnceLock<Option<Regex>> = OnceLock::new();
    PLACEHOLDER
        .get_or_init(|| Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").ok())
        .as_ref()
}

/// Expand `${VAR}` / `${VAR:-fallback}` placeholders. An unset variable
/// without a fallback expands to nothing.
fn substitute_env_vars(content: &str) -> String {
    let Some(re) = placeholder() else {
        return content.to_owned();
    };
    re.replace_all(content, |caps: &Captures| {
        std::env::var(&caps[1])
            .ok()
            .or_else(|| caps.get(2).map(|fallback| fallback.as_str().to_owned()))
            .unwrap_or_default()
    })
    .into_owned()
}

/// Why a configuration could not be produced
#[derive(Debug)]
pub enum ConfigError {
    /// The file exists but could not be read
    Io(std::io::Error),
    /// `Config::parse` input is not valid TOML for this schema
    Parse(toml::de::Error),
    /// Layered file and environment sources failed to merge or deserialize
    Config(config::ConfigError),
    /// Well-formed but rejected by a semantic check
    Validation(String),
}

impl ConfigError {
    fn invalid(msg: impl Into<String>) -> Self {
        ConfigError::Validation(msg.into())
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "cannot read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "malformed config: {}", e),
            ConfigError::Config(e) => write!(f, "cannot assemble config: {}", e),
            ConfigError::Validation(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub session: SessionConfig,
    pub mqtt: MqttConfig,
    pub persistence: PersistenceConfig,
    pub auth: AuthConfig,
    pub acl: AclConfig,
}

/// `[log]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// error, warn, info, debug or trace; the `--log-level` flag wins
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

/// `[server]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP listen address
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 1883)),
        }
    }
}

/// `[limits]`: per-client resource bounds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Largest accepted packet, fixed header included
    pub max_packet_size: usize,
    /// QoS 1/2 deliveries awaiting acknowledgment before further ones queue
    pub max_inflight: u16,
    /// Queued deliveries kept per session; the oldest is evicted beyond it.
    /// 0 means unbounded.
    pub max_queued_messages: usize,
    /// Slots in a connection's outbound channel
    pub outbound_channel_capacity: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_packet_size: crate::codec::DEFAULT_MAX_PACKET_SIZE,
            max_inflight: 32,
            max_queued_messages: 1000,
            outbound_channel_capacity: 1024,
        }
    }
}

impl LimitsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_inflight == 0 {
            return Err(ConfigError::invalid("limits.max_inflight must be at least 1"));
        }
        if self.outbound_channel_capacity == 0 {
            return Err(ConfigError::invalid(
                "limits.outbound_channel_capacity must be at least 1",
            ));
        }
        Ok(())
    }
}

/// `[session]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds a fresh connection may stay silent before its CONNECT
    pub default_keep_alive: u16,
    /// Cap on the keep-alive interval a client may request
    pub max_keep_alive: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_keep_alive: 60,
            max_keep_alive: u16::MAX,
        }
    }
}

impl SessionConfig {
    /// Deadline for the first packet of a connection
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.default_keep_alive.into())
    }
}

/// `[mqtt]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Highest QoS granted to any subscription
    pub max_qos: u8,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self { max_qos: 2 }
    }
}

impl MqttConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        match self.max_qos {
            0..=2 => Ok(()),
            other => Err(ConfigError::invalid(format!(
                "max_qos must be 0, 1, or 2 (got {other})"
            ))),
        }
    }
}

impl Config {
    /// Load `path` (if it exists), expand placeholders, then apply
    /// `VIBEMQ__` overrides. A missing file only means defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        let path = path.as_ref();
        if !path.as_os_str().is_empty() {
            match std::fs::read_to_string(path) {
                Ok(raw) => {
                    let expanded = substitute_env_vars(&raw);
                    builder = builder.add_source(File::from_str(&expanded, FileFormat::Toml));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus `VIBEMQ__` overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse TOML text as-is: no placeholders, no overrides
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.mqtt.validate()?;
        self.limits.validate()?;
        self.persistence.validate()?;
        if self.auth.enabled {
            self.auth.validate()?;
            if self.acl.enabled {
                self.acl.check_role_references(&self.auth.users)?;
            }
        }
        Ok(())
    }

    /// Roles by name
    pub fn build_role_map(&self) -> HashMap<String, &AclRole> {
        self.acl
            .roles
            .iter()
            .map(|role| (role.name.clone(), role))
            .collect()
    }

    /// Users by name
    pub fn build_user_map(&self) -> HashMap<String, &UserConfig> {
        self.auth
            .users
            .iter()
            .map(|user| (user.username.clone(), user))
            .collect()
    }
}
