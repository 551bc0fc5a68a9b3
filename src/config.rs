use crate::connection::ConnectionSettings;
use crate::error::ConfigError;
use crate::events::{BusConfig, DEFAULT_QUEUE_CAPACITY, DEFAULT_STATE_EPSILON};
use crate::logging::{LogFormat, LogLevel};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub const ENV_SERIAL: &str = "NEFITHK_NEFIT_SERIAL";
pub const ENV_ACCESS_KEY: &str = "NEFITHK_NEFIT_ACCESS_KEY";
pub const ENV_PASSWORD: &str = "NEFITHK_NEFIT_PASSWORD";
pub const ENV_KEEPALIVE_INTERVAL: &str = "NEFITHK_XMPP_KEEPALIVE_INTERVAL";
pub const ENV_RECONNECT_BACKOFF: &str = "NEFITHK_XMPP_RECONNECT_BACKOFF";
pub const ENV_MAX_RECONNECT_WAIT: &str = "NEFITHK_XMPP_MAX_RECONNECT_WAIT";
pub const ENV_DEVICE_IO_TIMEOUT: &str = "NEFITHK_DEVICE_IO_TIMEOUT";
pub const ENV_COMMAND_TIMEOUT: &str = "NEFITHK_COMMAND_TIMEOUT";
pub const ENV_SHUTDOWN_TIMEOUT: &str = "NEFITHK_SHUTDOWN_TIMEOUT";
pub const ENV_QUEUE_CAPACITY: &str = "NEFITHK_EVENTBUS_QUEUE_CAPACITY";
pub const ENV_STATE_EPSILON: &str = "NEFITHK_EVENTBUS_STATE_EPSILON";
pub const ENV_LOG_LEVEL: &str = "NEFITHK_LOG_LEVEL";
pub const ENV_LOG_FORMAT: &str = "NEFITHK_LOG_FORMAT";

/// Load environment variables from a .env file.
/// Handles values with spaces without requiring quotes. Variables already
/// present in the environment are left alone. Returns how many were set;
/// a missing file sets none.
///
/// Must run before any other thread exists.
pub fn load_dotenv(path: &Path) -> std::io::Result<usize> {
    if !path.exists() {
        return Ok(0);
    }
    let content = fs::read_to_string(path)?;

    let mut loaded = 0;
    for (key, value) in parse_dotenv(&content) {
        if std::env::var_os(key).is_none() {
            // SAFETY: called from main before the runtime and its threads start.
            unsafe { std::env::set_var(key, value) };
            loaded += 1;
        }
    }
    Ok(loaded)
}

fn parse_dotenv(content: &str) -> Vec<(&str, &str)> {
    let mut pairs = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);

        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let mut value = value.trim();
            if value.len() >= 2
                && ((value.starts_with('"') && value.ends_with('"'))
                    || (value.starts_with('\'') && value.ends_with('\'')))
            {
                value = &value[1..value.len() - 1];
            }
            if !key.is_empty() {
                pairs.push((key, value));
            }
        }
    }
    pairs
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub nefit: NefitConfig,
    pub connection: ConnectionSettings,
    pub bus: BusConfig,
    pub logging: LoggingConfig,
}

/// Device credentials. `Debug` only shows the serial.
#[derive(Clone, PartialEq)]
pub struct NefitConfig {
    pub serial: String,
    pub access_key: String,
    pub password: String,
}

impl fmt::Debug for NefitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NefitConfig")
            .field("serial", &self.serial)
            .field("access_key", &"<redacted>")
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from `lookup`, which maps a variable name to
    /// its value. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let d = ConnectionSettings::default();

        let config = Self {
            nefit: NefitConfig {
                serial: required(&get, ENV_SERIAL)?,
                access_key: required(&get, ENV_ACCESS_KEY)?,
                password: required(&get, ENV_PASSWORD)?,
            },
            connection: ConnectionSettings {
                keepalive_interval: duration(&get, ENV_KEEPALIVE_INTERVAL, d.keepalive_interval)?,
                initial_backoff: duration(&get, ENV_RECONNECT_BACKOFF, d.initial_backoff)?,
                max_backoff: duration(&get, ENV_MAX_RECONNECT_WAIT, d.max_backoff)?,
                io_timeout: duration(&get, ENV_DEVICE_IO_TIMEOUT, d.io_timeout)?,
                command_timeout: duration(&get, ENV_COMMAND_TIMEOUT, d.command_timeout)?,
                shutdown_timeout: duration(&get, ENV_SHUTDOWN_TIMEOUT, d.shutdown_timeout)?,
            },
            bus: BusConfig {
                queue_capacity: parsed(&get, ENV_QUEUE_CAPACITY, DEFAULT_QUEUE_CAPACITY)?,
                state_epsilon: parsed(&get, ENV_STATE_EPSILON, DEFAULT_STATE_EPSILON)?,
            },
            logging: LoggingConfig {
                level: parsed(&get, ENV_LOG_LEVEL, LogLevel::default())?,
                format: parsed(&get, ENV_LOG_FORMAT, LogFormat::default())?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let connection = &self.connection;
        let second = Duration::from_secs(1);

        if connection.keepalive_interval < second {
            return Err(too_small(ENV_KEEPALIVE_INTERVAL, connection.keepalive_interval, "1s"));
        }
        if connection.initial_backoff < second {
            return Err(too_small(ENV_RECONNECT_BACKOFF, connection.initial_backoff, "1s"));
        }
        if connection.max_backoff < connection.initial_backoff {
            return Err(ConfigError::Invalid(format!(
                "{} ({}) must not be shorter than {} ({})",
                ENV_MAX_RECONNECT_WAIT,
                humantime::format_duration(connection.max_backoff),
                ENV_RECONNECT_BACKOFF,
                humantime::format_duration(connection.initial_backoff),
            )));
        }
        for (key, value) in [
            (ENV_DEVICE_IO_TIMEOUT, connection.io_timeout),
            (ENV_COMMAND_TIMEOUT, connection.command_timeout),
            (ENV_SHUTDOWN_TIMEOUT, connection.shutdown_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{key} must be greater than zero")));
            }
        }

        if self.bus.queue_capacity == 0 {
            return Err(ConfigError::Invalid(format!("{ENV_QUEUE_CAPACITY} must be at least 1")));
        }
        if !self.bus.state_epsilon.is_finite() || self.bus.state_epsilon <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "{ENV_STATE_EPSILON} must be a positive number, got {}",
                self.bus.state_epsilon
            )));
        }
        Ok(())
    }
}

fn required(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<String, ConfigError> {
    get(key)
        .map(|value| value.trim().to_string())
        .ok_or(ConfigError::Missing(key))
}

fn duration(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match get(key) {
        Some(raw) => humantime::parse_duration(raw.trim()).map_err(|e| ConfigError::InvalidValue {
            key,
            value: raw,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn parsed<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key,
            value: raw,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn too_small(key: &str, value: Duration, minimum: &str) -> ConfigError {
    ConfigError::Invalid(format!(
        "{key} must be at least {minimum}, got {}",
        humantime::format_duration(value)
    ))
}
