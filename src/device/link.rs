//! Boundary to the thermostat protocol client.
//!
//! The bridge never speaks the device wire protocol itself. It drives an
//! implementation of [`DeviceLink`] and treats every call as fallible; the
//! caller is responsible for time-boxing them.

use crate::error::DeviceError;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

/// Aggregated UI status (temperatures, boiler indicator, user mode).
pub const URI_STATUS: &str = "/ecus/rrc/uiStatus";
/// Manual room temperature setpoint.
pub const URI_MANUAL_SETPOINT: &str = "/heatingCircuits/hc1/temperatureRoomManual";
/// User mode (`manual`, `clock`, `off`).
pub const URI_USER_MODE: &str = "/heatingCircuits/hc1/usermode";
/// Domestic hot water manual mode (`on`, `off`).
pub const URI_HOT_WATER_MANUAL_MODE: &str = "/dhwCircuits/dhwA/dhwOperationManualMode";
/// Central heating system pressure.
pub const URI_SYSTEM_PRESSURE: &str = "/system/appliance/systemPressure";

/// Unsolicited message pushed by the device.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub uri: String,
    pub payload: Value,
}

impl Notification {
    pub fn new(uri: impl Into<String>, payload: Value) -> Self {
        Self {
            uri: uri.into(),
            payload,
        }
    }
}

/// Connection to a single thermostat.
#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Establish the connection.
    async fn connect(&self) -> Result<(), DeviceError>;

    /// Read the resource at `uri`.
    async fn get(&self, uri: &str) -> Result<Value, DeviceError>;

    /// Write `value` to the resource at `uri`.
    async fn put(&self, uri: &str, value: Value) -> Result<(), DeviceError>;

    /// Register the queue that receives push notifications.
    ///
    /// Implementations must not block when the queue is full.
    fn subscribe(&self, notifications: mpsc::Sender<Notification>);

    /// Resolves once an established connection has been lost.
    async fn closed(&self) {
        std::future::pending::<()>().await
    }

    /// Release the connection.
    async fn close(&self) -> Result<(), DeviceError>;
}
