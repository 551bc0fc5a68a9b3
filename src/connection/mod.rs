//! Device connection lifecycle: reconnect backoff and the manager that keeps
//! the thermostat link alive and bridged to the event bus.

mod backoff;
mod manager;

pub use backoff::Backoff;
pub use manager::{ConnectionManager, ConnectionSettings, ShutdownReport};
