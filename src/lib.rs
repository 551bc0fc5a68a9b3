//! Nefit Easy thermostat bridge core.
//!
//! An in-process [`events::EventBus`] carries thermostat state, commands and
//! connection status between components, and a
//! [`connection::ConnectionManager`] keeps the device link alive and bridged
//! to that bus.

pub mod config;
pub mod connection;
pub mod device;
pub mod error;
pub mod events;
pub mod logging;
