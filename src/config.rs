//! Broker configuration and limits.
//!
//! Supports configuration from:
//! - TOML file (default: `apiary.toml`)
//! - Environment variables with `APIARY__` prefix (double underscore for nesting)
//! - In-file variable substitution: `${VAR}` or `${VAR:-default}`
//!
//! Environment variable examples:
//! - `APIARY__SERVER__PORT=1884`
//! - `APIARY__LIMITS__MAX_PAYLOAD_SIZE=16384`
//! - `APIARY__LOG__LEVEL=debug`
//!
//! Every numeric value is range-checked on startup; an out-of-range value
//! fails `load` with a [`ConfigError`].

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration.
    pub log: LogConfig,
    /// Listener configuration.
    pub server: ServerConfig,
    /// Resource limits.
    pub limits: LimitsConfig,
    /// Session timing configuration.
    pub session: SessionConfig,
    /// QoS retransmission configuration.
    pub qos: QosConfig,
    /// MQTT feature flags.
    pub mqtt: MqttConfig,
    /// Static authentication configuration.
    pub auth: AuthConfig,
    /// Access control list configuration.
    pub acl: AclConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address.
    pub bind_addr: String,
    /// TCP port. 0 asks the OS for an ephemeral port.
    pub port: u16,
    /// Listen backlog.
    pub backlog: u32,
    /// Maximum concurrent client connections.
    pub max_clients: usize,
    /// Initial per-connection receive buffer size in bytes.
    pub recv_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 1883,
            backlog: 4,
            max_clients: 10,
            recv_buffer_size: 1024,
        }
    }
}

impl ServerConfig {
    /// Combined listen address.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_addr, self.port)
            .parse()
            .map_err(|_| {
                ConfigError::Validation(format!("invalid bind address '{}'", self.bind_addr))
            })
    }
}

/// Resource limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum subscriptions per client; excess filters get SUBACK 0x80.
    pub max_subscriptions_per_client: usize,
    /// Maximum topic name/filter length in bytes.
    pub max_topic_length: usize,
    /// Maximum topic levels (segments separated by '/').
    pub max_topic_levels: usize,
    /// Maximum PUBLISH payload size in bytes; larger payloads are dropped.
    pub max_payload_size: usize,
    /// Maximum MQTT packet size in bytes; larger frames close the connection.
    pub max_packet_size: usize,
    /// Offline/overflow queue depth per session, drop-oldest on overflow.
    pub max_queued_messages: usize,
    /// Maximum unacknowledged QoS 1/2 deliveries per session.
    pub max_inflight: usize,
    /// Retained message store size; LRU eviction beyond this.
    pub max_retained_messages: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_subscriptions_per_client: 20,
            max_topic_length: 256,
            max_topic_levels: 8,
            max_payload_size: 4096,
            max_packet_size: 8192,
            max_queued_messages: 50,
            max_inflight: 10,
            max_retained_messages: 100,
        }
    }
}

/// Session timing configuration. Durations are in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a fresh connection may take to send CONNECT.
    pub connect_timeout: u64,
    /// Keep-alive grace multiplier (MQTT mandates 1.5).
    pub keep_alive_factor: f64,
    /// Idle timeout applied when the client requests keep-alive 0.
    pub no_keepalive_timeout: u64,
    /// How long offline persistent sessions are kept.
    pub session_expiry: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 10,
            keep_alive_factor: 1.5,
            no_keepalive_timeout: 3600,
            session_expiry: 3600,
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn session_expiry(&self) -> Duration {
        Duration::from_secs(self.session_expiry)
    }

    /// Deadline for client silence: `keep_alive * factor`, or the
    /// no-keepalive timeout when the client asked for 0.
    pub fn keep_alive_deadline(&self, keep_alive: u16) -> Duration {
        if keep_alive == 0 {
            Duration::from_secs(self.no_keepalive_timeout)
        } else {
            Duration::from_secs_f64(keep_alive as f64 * self.keep_alive_factor)
        }
    }
}

/// QoS retransmission configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QosConfig {
    /// Seconds between retransmission scans of unacknowledged messages.
    pub retry_interval: u64,
    /// Retries before an unacknowledged message is dropped.
    pub max_retries: u32,
}

impl Default for QosConfig {
    fn default() -> Self {
        Self {
            retry_interval: 10,
            max_retries: 3,
        }
    }
}

impl QosConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval)
    }
}

/// MQTT feature flags.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Accept connections without credentials.
    pub allow_anonymous: bool,
    /// Accept empty client ids (an id is generated; requires clean session).
    pub allow_zero_length_clientid: bool,
    /// Store retained messages.
    pub retain_enabled: bool,
    /// Accept QoS 2; when false, inbound QoS 2 is downgraded to QoS 1.
    pub qos2_enabled: bool,
    /// Publish `$SYS/broker/*` statistics.
    pub sys_topics_enabled: bool,
    /// Seconds between `$SYS` statistic updates.
    pub stats_interval: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            allow_anonymous: true,
            allow_zero_length_clientid: true,
            retain_enabled: true,
            qos2_enabled: true,
            sys_topics_enabled: true,
            stats_interval: 60,
        }
    }
}

impl MqttConfig {
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval)
    }
}

/// Static authentication configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// Enable username/password authentication.
    pub enabled: bool,
    /// Static user list.
    pub users: Vec<UserConfig>,
}

/// One static user entry.
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub username: String,
    pub password: String,
}

/// ACL configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AclConfig {
    /// Enable role-based access control (implies authentication).
    pub enabled: bool,
    /// Users with their roles.
    pub users: Vec<AclUserConfig>,
    /// Role -> topic pattern rules.
    pub rules: Vec<AclRuleConfig>,
}

/// One ACL user entry.
#[derive(Debug, Clone, Deserialize)]
pub struct AclUserConfig {
    pub username: String,
    pub password: String,
    pub role: String,
}

/// One ACL rule binding a role to a topic pattern.
/// Patterns support `+`/`#` wildcards and `%c`/`%u` substitution.
#[derive(Debug, Clone, Deserialize)]
pub struct AclRuleConfig {
    pub role: String,
    pub pattern: String,
    #[serde(default = "default_true")]
    pub publish: bool,
    #[serde(default = "default_true")]
    pub subscribe: bool,
}

fn default_true() -> bool {
    true
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading the config file.
    Io(std::io::Error),
    /// Config parsing/loading error.
    Config(config::ConfigError),
    /// Invalid configuration value.
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

impl Config {
    /// Load configuration from a TOML file with environment overrides.
    ///
    /// A missing file is not an error; defaults apply. Values are resolved
    /// in order: defaults, file (with `${VAR:-default}` substitution),
    /// `APIARY__SECTION__KEY` environment variables.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        let path = path.as_ref();
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let substituted = substitute_env_vars(&content);
            builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("APIARY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let substituted = substitute_env_vars(content);
        let config: Config = toml::from_str(&substituted)
            .map_err(|e| ConfigError::Validation(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Range-check every numeric value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn err(msg: impl Into<String>) -> Result<(), ConfigError> {
            Err(ConfigError::Validation(msg.into()))
        }

        self.server.socket_addr()?;

        if self.server.backlog == 0 {
            return err("backlog must be >= 1");
        }
        if self.server.max_clients == 0 {
            return err("max_clients must be >= 1");
        }
        if self.server.recv_buffer_size < 64 {
            return err("recv_buffer_size must be >= 64");
        }
        if self.limits.max_subscriptions_per_client == 0 {
            return err("max_subscriptions_per_client must be >= 1");
        }
        if self.limits.max_topic_length == 0 || self.limits.max_topic_length > 65535 {
            return err("max_topic_length must be in range 1-65535");
        }
        if self.limits.max_topic_levels == 0 {
            return err("max_topic_levels must be >= 1");
        }
        if self.limits.max_payload_size == 0 {
            return err("max_payload_size must be >= 1");
        }
        if self.limits.max_packet_size < self.limits.max_payload_size {
            return err("max_packet_size must be >= max_payload_size");
        }
        if self.limits.max_packet_size > crate::packet::MAX_REMAINING_LENGTH {
            return err("max_packet_size cannot exceed the MQTT protocol maximum");
        }
        if self.limits.max_inflight == 0 {
            return err("max_inflight must be >= 1");
        }
        if self.session.connect_timeout == 0 {
            return err("connect_timeout must be >= 1");
        }
        if self.session.keep_alive_factor <= 0.0 {
            return err("keep_alive_factor must be > 0");
        }
        if self.session.no_keepalive_timeout == 0 {
            return err("no_keepalive_timeout must be >= 1");
        }
        if self.qos.retry_interval == 0 {
            return err("retry_interval must be >= 1");
        }
        if self.mqtt.stats_interval == 0 {
            return err("stats_interval must be >= 1");
        }

        const LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
        if !LEVELS.contains(&self.log.level.to_ascii_lowercase().as_str()) {
            return err(format!(
                "log level must be one of {:?}, got '{}'",
                LEVELS, self.log.level
            ));
        }

        Ok(())
    }
}
