//! Logger setup on top of `env_logger`.

use crate::error::{BridgeError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use env_logger::Env;
use log::{Level, LevelFilter, Record};
use serde_json::json;
use std::io::Write;
use strum::{Display, EnumString, IntoStaticStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Error => LevelFilter::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// env_logger's human-readable lines.
    Console,
}

/// Install the global logger. `RUST_LOG`, when set, wins over `level`.
pub fn init(level: LogLevel, format: LogFormat) -> Result<()> {
    let default_filter: &'static str = level.into();
    let mut builder =
        env_logger::Builder::from_env(Env::default().default_filter_or(default_filter));
    builder.format_timestamp_millis();

    if format == LogFormat::Json {
        builder.format(|buf, record| writeln!(buf, "{}", json_line(Utc::now(), record)));
    }

    builder
        .try_init()
        .map_err(|e| BridgeError::LoggerInitFailed(e.to_string()))
}

fn json_line(ts: DateTime<Utc>, record: &Record<'_>) -> String {
    json!({
        "ts": ts.to_rfc3339_opts(SecondsFormat::Millis, true),
        "level": level_name(record.level()),
        "target": record.target(),
        "msg": record.args().to_string(),
    })
    .to_string()
}

fn level_name(level: Level) -> &'static str {
    match level {
        Level::Error => "error",
        Level::Warn => "warn",
        Level::Info => "info",
        Level::Debug => "debug",
        Level::Trace => "trace",
    }
}
