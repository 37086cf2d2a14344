//! Configuration module for the telemetry relay.
//!
//! Settings are read once at startup from environment variables and are
//! immutable for the lifetime of the process.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default collector host
const DEFAULT_HOST: &str = "localhost";

/// Default collector port
const DEFAULT_PORT: u16 = 80;

/// Default tracing filter when `RUST_LOG` is unset
const DEFAULT_LOG_LEVEL: &str = "info";

/// Default basic-auth user
const DEFAULT_AUTH_USER: &str = "relay";

/// Default device identity
const DEFAULT_DEVICE_ID: &str = "00";
const DEFAULT_DEVICE_PASSWORD: &str = "pw";

/// Channels sampled when none are configured
const DEFAULT_CHANNELS: &[&str] = &["current", "potential", "frequency"];

/// Default sample interval in milliseconds
const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 1_000;

/// Default aggregation window in seconds
const DEFAULT_DOWNSAMPLE_INTERVAL_SECS: u64 = 10;

/// Default submission window in seconds
const DEFAULT_SUBMISSION_INTERVAL_SECS: u64 = 60;

/// Default HTTP request timeout in seconds
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Path of the collector endpoint
const SUBMIT_PATH: &str = "/API/device/Log";

/// Configuration for the telemetry relay.
///
/// All settings can be configured via environment variables:
/// - `RELAY_LOG_LEVEL`: tracing filter if `RUST_LOG` is unset (default: info)
/// - `RELAY_HOST` / `RELAY_PORT`: collector address (default: localhost:80)
/// - `RELAY_TLS`: submit over https (default: false)
/// - `RELAY_CA_CERT`: CA certificate (PEM) used to verify the collector when TLS is on
/// - `RELAY_AUTH`: send HTTP basic auth (default: true)
/// - `RELAY_AUTH_USER` / `RELAY_AUTH_PASSWORD`: basic-auth credentials
/// - `RELAY_DEVICE_ID` / `RELAY_DEVICE_PASSWORD`: identity stamped on messages
/// - `RELAY_CHANNELS`: comma-separated channel names (default: current,potential,frequency)
/// - `RELAY_SAMPLE_INTERVAL_MS`: milliseconds between samples (default: 1000)
/// - `RELAY_DOWNSAMPLE_INTERVAL_SECS`: aggregation window (default: 10)
/// - `RELAY_SUBMISSION_INTERVAL_SECS`: submission window (default: 60)
/// - `RELAY_REQUEST_TIMEOUT_SECS`: HTTP request timeout (default: 30)
/// - `RELAY_MAX_PENDING_MESSAGES`: bound on queued messages, oldest dropped (default: unbounded)
#[derive(Debug, Clone)]
pub struct Config {
    /// Tracing filter directive
    pub log_level: String,

    /// Collector host name or IP
    pub host: String,

    /// Collector TCP port
    pub port: u16,

    /// Use https instead of http
    pub tls: bool,

    /// CA certificate for verifying the collector when TLS is on
    pub ca_cert: Option<PathBuf>,

    /// Send HTTP basic auth
    pub auth_enabled: bool,

    pub auth_user: String,

    pub auth_password: String,

    /// Device id carried in every message
    pub device_id: String,

    /// Device password carried in every message
    pub device_password: String,

    /// Names of the sampled channels, unique
    pub channels: Vec<String>,

    /// Time between two samples of a channel
    pub sample_interval: Duration,

    /// Aggregation window
    pub downsample_interval: Duration,

    /// Submission window
    pub submission_interval: Duration,

    /// HTTP request timeout duration
    pub request_timeout: Duration,

    /// Maximum queued messages before the oldest is dropped
    pub max_pending_messages: Option<usize>,
}

/// Error type for configuration loading failures
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

impl ConfigError {
    fn for_var(env_var: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            env_var: Some(env_var.to_string()),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.env_var {
            Some(var) => write!(f, "Configuration error for {}: {}", var, self.message),
            None => write!(f, "Configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable cannot be parsed or the resulting
    /// intervals are inconsistent.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use telemetry_relay::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Submitting to {}", config.submit_url());
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let log_level = get("RELAY_LOG_LEVEL").unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());
        let host = get("RELAY_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = parse_number(get("RELAY_PORT"), "RELAY_PORT", DEFAULT_PORT)?;
        let tls = parse_bool(get("RELAY_TLS"), "RELAY_TLS", false)?;
        let ca_cert = get("RELAY_CA_CERT").map(PathBuf::from);
        let auth_enabled = parse_bool(get("RELAY_AUTH"), "RELAY_AUTH", true)?;
        let auth_user = get("RELAY_AUTH_USER").unwrap_or_else(|| DEFAULT_AUTH_USER.to_string());
        // Passwords are taken verbatim, surrounding whitespace included
        let auth_password = lookup("RELAY_AUTH_PASSWORD").unwrap_or_default();
        let device_id = get("RELAY_DEVICE_ID").unwrap_or_else(|| DEFAULT_DEVICE_ID.to_string());
        let device_password = lookup("RELAY_DEVICE_PASSWORD")
            .unwrap_or_else(|| DEFAULT_DEVICE_PASSWORD.to_string());

        let channels = match get("RELAY_CHANNELS") {
            Some(raw) => parse_channels(&raw)?,
            None => DEFAULT_CHANNELS.iter().map(|c| c.to_string()).collect(),
        };

        let sample_interval = Duration::from_millis(parse_nonzero(
            get("RELAY_SAMPLE_INTERVAL_MS"),
            "RELAY_SAMPLE_INTERVAL_MS",
            DEFAULT_SAMPLE_INTERVAL_MS,
        )?);
        let downsample_interval = Duration::from_secs(parse_nonzero(
            get("RELAY_DOWNSAMPLE_INTERVAL_SECS"),
            "RELAY_DOWNSAMPLE_INTERVAL_SECS",
            DEFAULT_DOWNSAMPLE_INTERVAL_SECS,
        )?);
        let submission_interval = Duration::from_secs(parse_nonzero(
            get("RELAY_SUBMISSION_INTERVAL_SECS"),
            "RELAY_SUBMISSION_INTERVAL_SECS",
            DEFAULT_SUBMISSION_INTERVAL_SECS,
        )?);
        let request_timeout = Duration::from_secs(parse_nonzero(
            get("RELAY_REQUEST_TIMEOUT_SECS"),
            "RELAY_REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
        )?);

        let max_pending_messages = match get("RELAY_MAX_PENDING_MESSAGES") {
            Some(raw) => Some(parse_nonzero(
                Some(raw),
                "RELAY_MAX_PENDING_MESSAGES",
                0usize,
            )?),
            None => None,
        };

        let config = Self {
            log_level,
            host,
            port,
            tls,
            ca_cert,
            auth_enabled,
            auth_user,
            auth_password,
            device_id,
            device_password,
            channels,
            sample_interval,
            downsample_interval,
            submission_interval,
            request_timeout,
            max_pending_messages,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check that the three periods nest: sample < downsample <= submission.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_interval >= self.downsample_interval {
            return Err(ConfigError::for_var(
                "RELAY_SAMPLE_INTERVAL_MS",
                format!(
                    "sample interval {:?} must be shorter than downsample interval {:?}",
                    self.sample_interval, self.downsample_interval
                ),
            ));
        }

        if self.downsample_interval > self.submission_interval {
            return Err(ConfigError::for_var(
                "RELAY_DOWNSAMPLE_INTERVAL_SECS",
                format!(
                    "downsample interval {:?} exceeds submission interval {:?}",
                    self.downsample_interval, self.submission_interval
                ),
            ));
        }

        if self.channels.is_empty() {
            return Err(ConfigError::for_var(
                "RELAY_CHANNELS",
                "at least one channel is required",
            ));
        }

        Ok(())
    }

    /// Full URL submissions are posted to.
    pub fn submit_url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}:{}{}", scheme, self.host, self.port, SUBMIT_PATH)
    }
}

fn parse_number<T: std::str::FromStr>(
    value: Option<String>,
    env_var: &str,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::for_var(env_var, format!("'{}' is not a valid number", value))),
        None => Ok(default),
    }
}

fn parse_nonzero<T>(value: Option<String>, env_var: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialEq + Default,
{
    let parsed = parse_number(value, env_var, default)?;
    if parsed == T::default() {
        return Err(ConfigError::for_var(env_var, "value must be greater than 0"));
    }
    Ok(parsed)
}

fn parse_bool(value: Option<String>, env_var: &str, default: bool) -> Result<bool, ConfigError> {
    let Some(value) = value else {
        return Ok(default);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::for_var(
            env_var,
            format!("'{}' is not a valid boolean", value),
        )),
    }
}

fn parse_channels(raw: &str) -> Result<Vec<String>, ConfigError> {
    let mut channels: Vec<String> = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        if channels.iter().any(|c| c == name) {
            return Err(ConfigError::for_var(
                "RELAY_CHANNELS",
                format!("duplicate channel '{}'", name),
            ));
        }
        channels.push(name.to_string());
    }
    Ok(channels)
}

impl Default for Config {
    /// Create a default configuration using default values.
    ///
    /// This is useful for testing or when environment variables are not set.
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            tls: false,
            ca_cert: None,
            auth_enabled: true,
            auth_user: DEFAULT_AUTH_USER.to_string(),
            auth_password: String::new(),
            device_id: DEFAULT_DEVICE_ID.to_string(),
            device_password: DEFAULT_DEVICE_PASSWORD.to_string(),
            channels: DEFAULT_CHANNELS.iter().map(|c| c.to_string()).collect(),
            sample_interval: Duration::from_millis(DEFAULT_SAMPLE_INTERVAL_MS),
            downsample_interval: Duration::from_secs(DEFAULT_DOWNSAMPLE_INTERVAL_SECS),
            submission_interval: Duration::from_secs(DEFAULT_SUBMISSION_INTERVAL_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            max_pending_messages: None,
        }
    }
}
