//! Thermostat device boundary.
//!
//! [`DeviceLink`] abstracts the protocol client, [`payload`] turns its
//! untyped payloads into [`DeviceStatus`], and [`SimulatedThermostat`] is an
//! in-memory link for running without hardware.

mod link;
pub mod payload;
mod simulated;

pub use link::{
    DeviceLink, Notification, URI_HOT_WATER_MANUAL_MODE, URI_MANUAL_SETPOINT, URI_STATUS,
    URI_SYSTEM_PRESSURE, URI_USER_MODE,
};
pub use payload::DeviceStatus;
pub use simulated::SimulatedThermostat;
