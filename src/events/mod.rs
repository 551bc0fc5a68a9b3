//! Event definitions and the publish/subscribe bus that carries them.

mod bus;
mod types;

pub use bus::{
    BusConfig, BusEvent, DEFAULT_QUEUE_CAPACITY, ENDPOINT_HOMEKIT, ENDPOINT_METRICS, ENDPOINT_NEFIT,
    ENDPOINT_WEB, Endpoint, EventBus, Subscription,
};
pub use types::{
    CommandKind, CommandRequest, ConnectionState, ConnectionStatus, DEFAULT_STATE_EPSILON,
    DeviceCommand, StateSnapshot, ThermostatMode,
};
