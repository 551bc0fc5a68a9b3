use std::time::Duration;
use thiserror::Error as ThisError;

use crate::events::CommandKind;

#[derive(ThisError, Debug)]
pub enum BridgeError {
    #[error("event bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Logger initialisation failed: {0}")]
    LoggerInitFailed(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Startup configuration problems. Always fatal.
#[derive(ThisError, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0}")]
    Invalid(String),
}

#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("event bus is closed")]
    Closed,

    #[error("invalid endpoint name {0:?}")]
    InvalidEndpointName(String),
}

/// Failures reported by a [`DeviceLink`](crate::device::DeviceLink).
#[derive(ThisError, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("not connected to device")]
    NotConnected,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request to {uri} failed: {message}")]
    Request { uri: String, message: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("invalid device payload: {0}")]
    InvalidPayload(String),
}

#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("{0} command is missing its payload")]
    MissingPayload(CommandKind),

    #[error("{0} command carries a payload for another command kind")]
    UnexpectedPayload(CommandKind),
}
