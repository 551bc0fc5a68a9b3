//! Event definitions carried by the [`EventBus`](super::EventBus).
//!
//! Three event families exist: device state snapshots, command requests and
//! connection status reports. Enumerated fields serialize as snake_case
//! strings, which is also what their `FromStr`/`Display` impls use.

use crate::error::CommandError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

/// Tolerance used when comparing temperatures and pressure for deduplication.
pub const DEFAULT_STATE_EPSILON: f64 = 0.01;

/// Thermostat operating mode.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ThermostatMode {
    Heat,
    Off,
}

/// Last known device state.
///
/// A new snapshot always replaces the previous one as a whole; fields are
/// never patched in place after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub timestamp: DateTime<Utc>,
    /// Name of the component that produced the snapshot.
    pub source: String,
    /// Celsius
    pub current_temperature: f64,
    /// Celsius
    pub target_temperature: f64,
    pub heating_active: bool,
    pub mode: ThermostatMode,
    /// Bar
    pub pressure: f64,
    pub hot_water_active: bool,
    /// Celsius
    pub hot_water_temperature: f64,
}

impl StateSnapshot {
    /// Compare two snapshots ignoring `source` and `timestamp`.
    ///
    /// Categorical fields must match exactly; numeric fields must differ by
    /// strictly less than `epsilon`.
    pub fn approx_eq(&self, other: &Self, epsilon: f64) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() < epsilon;

        self.heating_active == other.heating_active
            && self.mode == other.mode
            && self.hot_water_active == other.hot_water_active
            && close(self.current_temperature, other.current_temperature)
            && close(self.target_temperature, other.target_temperature)
            && close(self.pressure, other.pressure)
            && close(self.hot_water_temperature, other.hot_water_temperature)
    }

    /// [`approx_eq`](Self::approx_eq) with [`DEFAULT_STATE_EPSILON`].
    pub fn same_reading(&self, other: &Self) -> bool {
        self.approx_eq(other, DEFAULT_STATE_EPSILON)
    }
}

/// Kind of state change a [`CommandRequest`] asks for.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CommandKind {
    SetTemperature,
    SetMode,
    SetHotWater,
}

/// Request from a consumer to change device state.
///
/// Exactly one payload field is populated, the one matching `kind`. The
/// constructors guarantee this; requests assembled by hand (for example from
/// deserialized input) are checked with [`validate`](Self::validate).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub kind: CommandKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ThermostatMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hot_water_enabled: Option<bool>,
}

/// A validated command, ready to be applied to the device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceCommand {
    SetTemperature(f64),
    SetMode(ThermostatMode),
    SetHotWater(bool),
}

impl CommandRequest {
    fn empty(source: impl Into<String>, kind: CommandKind) -> Self {
        Self {
            timestamp: Utc::now(),
            source: source.into(),
            kind,
            target_temperature: None,
            mode: None,
            hot_water_enabled: None,
        }
    }

    pub fn set_temperature(source: impl Into<String>, celsius: f64) -> Self {
        Self {
            target_temperature: Some(celsius),
            ..Self::empty(source, CommandKind::SetTemperature)
        }
    }

    pub fn set_mode(source: impl Into<String>, mode: ThermostatMode) -> Self {
        Self {
            mode: Some(mode),
            ..Self::empty(source, CommandKind::SetMode)
        }
    }

    pub fn set_hot_water(source: impl Into<String>, enabled: bool) -> Self {
        Self {
            hot_water_enabled: Some(enabled),
            ..Self::empty(source, CommandKind::SetHotWater)
        }
    }

    /// Check the payload invariant and extract the typed command.
    pub fn validate(&self) -> Result<DeviceCommand, CommandError> {
        let populated = [
            self.target_temperature.is_some(),
            self.mode.is_some(),
            self.hot_water_enabled.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();

        let command = match self.kind {
            CommandKind::SetTemperature => {
                self.target_temperature.map(DeviceCommand::SetTemperature)
            }
            CommandKind::SetMode => self.mode.map(DeviceCommand::SetMode),
            CommandKind::SetHotWater => self.hot_water_enabled.map(DeviceCommand::SetHotWater),
        }
        .ok_or(CommandError::MissingPayload(self.kind))?;

        if populated > 1 {
            return Err(CommandError::UnexpectedPayload(self.kind));
        }
        Ok(command)
    }
}

/// Lifecycle state of a component's connection.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// Observational connection status report. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub timestamp: DateTime<Utc>,
    pub component: String,
    pub state: ConnectionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Reconnect attempts since the last successful connection.
    pub reconnects: u32,
}

impl ConnectionStatus {
    pub fn new(component: impl Into<String>, state: ConnectionState, reconnects: u32) -> Self {
        Self {
            timestamp: Utc::now(),
            component: component.into(),
            state,
            error: None,
            reconnects,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}
