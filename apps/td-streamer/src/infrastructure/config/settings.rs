//! Streamer Configuration Settings
//!
//! Configuration types loaded from environment variables:
//! [`StreamerConfig`] for the binary, [`SessionSettings`] for session
//! timing and backoff, [`SinkSettings`] for the record sink and
//! [`FieldKeying`] for how content keys map to requested fields.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::schema::{Service, resolve_fields};
use crate::domain::streaming::QosLevel;
use crate::infrastructure::credentials::JsonFileCredentialStore;
use crate::infrastructure::delivery::{BackpressurePolicy, DeliveryConfig};

/// Default streamer endpoint.
pub const DEFAULT_STREAMER_URL: &str = "wss://streamer-ws.tdameritrade.com/ws";

/// How content keys in data entries map onto schema indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldKeying {
    /// Key `k` is the k-th requested field.
    #[default]
    Positional,
    /// Key is the schema index itself.
    Absolute,
}

impl FieldKeying {
    /// Parse from string (case-insensitive). Unknown values fall back to
    /// positional.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "absolute" => Self::Absolute,
            _ => Self::Positional,
        }
    }

    /// Get the string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Positional => "positional",
            Self::Absolute => "absolute",
        }
    }
}

/// Session timing and retry settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    /// Transport open attempts before `connect` gives up.
    pub connect_attempts: u32,
    /// Bound on a single transport open.
    pub connect_timeout: Duration,
    /// Bound on waiting for the login response.
    pub login_timeout: Duration,
    /// Silence that counts as a lost transport (0 = disabled).
    pub idle_timeout: Duration,
    /// Bound on waiting for any other response.
    pub request_timeout: Duration,
    /// Bound on flushing the delivery queue at shutdown.
    pub drain_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
    /// Content key interpretation.
    pub field_keying: FieldKeying,
    /// Capacity of the client command channel.
    pub command_buffer: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connect_attempts: 3,
            connect_timeout: Duration::from_secs(10),
            login_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(5),
            reconnect_delay_initial: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            max_reconnect_attempts: 10,
            field_keying: FieldKeying::Positional,
            command_buffer: 64,
        }
    }
}

/// Where decoded records go.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SinkSettings {
    /// JSON lines on stdout.
    #[default]
    Console,
    /// JSON lines in a file.
    File {
        /// Output path.
        path: PathBuf,
        /// Keep existing content.
        append: bool,
    },
}

impl FromStr for SinkSettings {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("console") {
            return Ok(Self::Console);
        }
        let (kind, path) = s
            .split_once(':')
            .ok_or_else(|| format!("expected console, file:<path> or file+truncate:<path>, got '{s}'"))?;
        if path.trim().is_empty() {
            return Err("file sink path is empty".to_string());
        }
        let append = match kind.to_lowercase().as_str() {
            "file" => true,
            "file+truncate" => false,
            other => return Err(format!("unknown sink kind '{other}'")),
        };
        Ok(Self::File {
            path: PathBuf::from(path.trim()),
            append,
        })
    }
}

/// A subscription requested at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSpec {
    /// Service to subscribe to.
    pub service: Service,
    /// Symbols.
    pub symbols: Vec<String>,
    /// Field names or indices; empty means all fields.
    pub fields: Vec<String>,
}

impl SubscriptionSpec {
    /// Parse `SERVICE=SYM1,SYM2|field1,field2;SERVICE=...`.
    ///
    /// # Errors
    ///
    /// Returns a message describing the first invalid entry.
    pub fn parse_list(s: &str) -> Result<Vec<Self>, String> {
        s.split(';')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(Self::parse_one)
            .collect()
    }

    fn parse_one(entry: &str) -> Result<Self, String> {
        let (service, rest) = entry
            .split_once('=')
            .ok_or_else(|| format!("expected SERVICE=SYMBOLS in '{entry}'"))?;
        let service: Service = service.trim().parse().map_err(|e| format!("{e}"))?;

        let (symbols, fields) = rest.split_once('|').unwrap_or((rest, ""));
        let split = |list: &str| -> Vec<String> {
            list.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        };
        let symbols = split(symbols);
        let fields = split(fields);

        if symbols.is_empty() {
            return Err(format!("no symbols for {service}"));
        }
        resolve_fields(service, &fields).map_err(|e| e.to_string())?;

        Ok(Self {
            service,
            symbols,
            fields,
        })
    }
}

/// Complete streamer configuration.
#[derive(Debug, Clone)]
pub struct StreamerConfig {
    /// Streamer WebSocket URL.
    pub url: String,
    /// Credential file read by the binary.
    pub credentials_path: PathBuf,
    /// Session timing and retry settings.
    pub session: SessionSettings,
    /// Delivery queue settings.
    pub delivery: DeliveryConfig,
    /// Record sink.
    pub sink: SinkSettings,
    /// Subscriptions made after connecting.
    pub subscriptions: Vec<SubscriptionSpec>,
    /// Quality of service requested after connecting.
    pub qos: Option<QosLevel>,
    /// Prometheus metrics port (0 = disabled).
    pub metrics_port: u16,
}

impl StreamerConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable has an invalid value or no
    /// credential path can be determined.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// See [`StreamerConfig::from_env`].
    pub fn from_lookup(env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let url = env("STREAMER_URL").unwrap_or_else(|| DEFAULT_STREAMER_URL.to_string());
        if url.trim().is_empty() {
            return Err(ConfigError::EmptyValue("STREAMER_URL".to_string()));
        }

        let credentials_path = env("TD_CREDENTIALS_PATH")
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from)
            .or_else(JsonFileCredentialStore::default_path)
            .ok_or_else(|| ConfigError::MissingEnvVar("TD_CREDENTIALS_PATH".to_string()))?;

        let defaults = SessionSettings::default();
        let session = SessionSettings {
            connect_attempts: parse_env_u32(&env, "STREAMER_CONNECT_ATTEMPTS", defaults.connect_attempts)
                .max(1),
            connect_timeout: parse_env_duration_secs(
                &env,
                "STREAMER_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout,
            ),
            login_timeout: parse_env_duration_secs(
                &env,
                "STREAMER_LOGIN_TIMEOUT_SECS",
                defaults.login_timeout,
            ),
            idle_timeout: parse_env_duration_secs(
                &env,
                "STREAMER_IDLE_TIMEOUT_SECS",
                defaults.idle_timeout,
            ),
            request_timeout: parse_env_duration_secs(
                &env,
                "STREAMER_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout,
            ),
            drain_timeout: parse_env_duration_secs(
                &env,
                "STREAMER_DRAIN_TIMEOUT_SECS",
                defaults.drain_timeout,
            ),
            reconnect_delay_initial: parse_env_duration_millis(
                &env,
                "STREAMER_RECONNECT_DELAY_INITIAL_MS",
                defaults.reconnect_delay_initial,
            ),
            reconnect_delay_max: parse_env_duration_secs(
                &env,
                "STREAMER_RECONNECT_DELAY_MAX_SECS",
                defaults.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: parse_env_f64(
                &env,
                "STREAMER_RECONNECT_DELAY_MULTIPLIER",
                defaults.reconnect_delay_multiplier,
            ),
            max_reconnect_attempts: parse_env_u32(
                &env,
                "STREAMER_MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            ),
            field_keying: env("STREAMER_FIELD_KEYING")
                .map(|s| FieldKeying::from_str_case_insensitive(&s))
                .unwrap_or_default(),
            command_buffer: defaults.command_buffer,
        };

        let mut policy = parse_env_value::<BackpressurePolicy>(&env, "STREAMER_BACKPRESSURE")?
            .unwrap_or_default();
        if let BackpressurePolicy::BlockThenDropOldest { max_wait } = &mut policy {
            *max_wait = parse_env_duration_millis(&env, "STREAMER_BACKPRESSURE_MAX_WAIT_MS", *max_wait);
        }
        let delivery = DeliveryConfig {
            queue_depth: parse_env_usize(
                &env,
                "STREAMER_QUEUE_DEPTH",
                DeliveryConfig::default().queue_depth,
            )
            .max(1),
            policy,
        };

        let sink = parse_env_value::<SinkSettings>(&env, "STREAMER_SINK")?.unwrap_or_default();
        let qos = parse_env_value::<QosLevel>(&env, "STREAMER_QOS")?;
        let subscriptions = match env("STREAMER_SUBSCRIPTIONS") {
            Some(list) => SubscriptionSpec::parse_list(&list).map_err(|message| {
                ConfigError::InvalidValue {
                    key: "STREAMER_SUBSCRIPTIONS".to_string(),
                    message,
                }
            })?,
            None => Vec::new(),
        };

        Ok(Self {
            url,
            credentials_path,
            session,
            delivery,
            sink,
            subscriptions,
            qos,
            metrics_port: parse_env_u16(&env, "STREAMER_METRICS_PORT", 0),
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be parsed.
    #[error("invalid value for {key}: {message}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Parser message.
        message: String,
    },
}

fn parse_env_value<T>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env(key)
        .filter(|v| !v.trim().is_empty())
        .map(|v| {
            v.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            })
        })
        .transpose()
}

fn parse_env_u16(env: &impl Fn(&str) -> Option<String>, key: &str, default: u16) -> u16 {
    env(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn parse_env_u32(env: &impl Fn(&str) -> Option<String>, key: &str, default: u32) -> u32 {
    env(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn parse_env_usize(env: &impl Fn(&str) -> Option<String>, key: &str, default: usize) -> usize {
    env(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn parse_env_f64(env: &impl Fn(&str) -> Option<String>, key: &str, default: f64) -> f64 {
    env(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn parse_env_duration_secs(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Duration {
    env(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_duration_millis(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Duration {
    env(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
