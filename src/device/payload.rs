//! Translation between untyped device payloads and bridge types.
//!
//! Payloads are JSON maps whose values are not reliably typed: the device
//! sends temperatures as strings (`"IHT": "21.50"`) while the protocol
//! client may already have converted them to numbers. Everything is parsed
//! into [`DeviceStatus`] right here so nothing untyped reaches the bus.

use super::link::{
    Notification, URI_HOT_WATER_MANUAL_MODE, URI_MANUAL_SETPOINT, URI_STATUS, URI_SYSTEM_PRESSURE,
    URI_USER_MODE,
};
use crate::error::DeviceError;
use crate::events::{DeviceCommand, StateSnapshot, ThermostatMode};
use chrono::Utc;
use serde::Deserialize;
use serde::de::{self, Deserializer};
use serde_json::{Value, json};

/// Partial device state. Absent fields are `None`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DeviceStatus {
    #[serde(rename = "in_house_temp", alias = "IHT", default, deserialize_with = "lenient_f64")]
    pub current_temperature: Option<f64>,

    #[serde(rename = "temp_setpoint", alias = "TSP", default, deserialize_with = "lenient_f64")]
    pub target_temperature: Option<f64>,

    #[serde(
        rename = "boiler_indicator",
        alias = "BAI",
        default,
        deserialize_with = "boiler_indicator"
    )]
    pub heating_active: Option<bool>,

    #[serde(rename = "user_mode", alias = "UMD", default, deserialize_with = "user_mode")]
    pub mode: Option<ThermostatMode>,

    #[serde(default, deserialize_with = "lenient_f64")]
    pub pressure: Option<f64>,

    #[serde(alias = "DHW", default, deserialize_with = "lenient_bool")]
    pub hot_water_active: Option<bool>,

    #[serde(default, deserialize_with = "lenient_f64")]
    pub hot_water_temperature: Option<f64>,
}

impl DeviceStatus {
    /// Parse a status payload.
    pub fn from_value(payload: Value) -> Result<Self, DeviceError> {
        serde_json::from_value(payload).map_err(|e| DeviceError::InvalidPayload(e.to_string()))
    }

    /// Parse a push notification. Notifications for resources the bridge
    /// does not track yield `Ok(None)`.
    pub fn from_notification(notification: &Notification) -> Result<Option<Self>, DeviceError> {
        match notification.uri.as_str() {
            URI_STATUS => Self::from_value(notification.payload.clone()).map(Some),
            URI_SYSTEM_PRESSURE => Ok(Some(Self {
                pressure: Some(parse_pressure(notification.payload.clone())?),
                ..Self::default()
            })),
            _ => Ok(None),
        }
    }

    /// Overlay the fields present in `update`; everything else keeps its
    /// last known value.
    pub fn merge(&mut self, update: DeviceStatus) {
        fn take<T>(slot: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *slot = value;
            }
        }

        take(&mut self.current_temperature, update.current_temperature);
        take(&mut self.target_temperature, update.target_temperature);
        take(&mut self.heating_active, update.heating_active);
        take(&mut self.mode, update.mode);
        take(&mut self.pressure, update.pressure);
        take(&mut self.hot_water_active, update.hot_water_active);
        take(&mut self.hot_water_temperature, update.hot_water_temperature);
    }

    /// Build a full snapshot once temperatures and mode are known.
    pub fn snapshot(&self, source: &str) -> Option<StateSnapshot> {
        Some(StateSnapshot {
            timestamp: Utc::now(),
            source: source.to_string(),
            current_temperature: self.current_temperature?,
            target_temperature: self.target_temperature?,
            heating_active: self.heating_active.unwrap_or(false),
            mode: self.mode?,
            pressure: self.pressure.unwrap_or_default(),
            hot_water_active: self.hot_water_active.unwrap_or(false),
            hot_water_temperature: self.hot_water_temperature.unwrap_or_default(),
        })
    }
}

/// Parse a pressure resource: either `{"value": 1.6, ...}` or a bare value.
pub fn parse_pressure(payload: Value) -> Result<f64, DeviceError> {
    let raw = match payload {
        Value::Object(mut map) => map.remove("value").unwrap_or(Value::Null),
        other => other,
    };
    value_to_f64(&raw)
        .map_err(DeviceError::InvalidPayload)?
        .ok_or_else(|| DeviceError::InvalidPayload("pressure value missing".to_string()))
}

/// Resource and value to write for a command.
pub fn encode_command(command: DeviceCommand) -> (&'static str, Value) {
    match command {
        DeviceCommand::SetTemperature(celsius) => (URI_MANUAL_SETPOINT, json!(celsius)),
        DeviceCommand::SetMode(ThermostatMode::Heat) => (URI_USER_MODE, json!("manual")),
        DeviceCommand::SetMode(ThermostatMode::Off) => (URI_USER_MODE, json!("off")),
        DeviceCommand::SetHotWater(enabled) => (
            URI_HOT_WATER_MANUAL_MODE,
            json!(if enabled { "on" } else { "off" }),
        ),
    }
}

/// Map a device user mode onto the bridge's mode.
pub fn parse_user_mode(raw: &str) -> Result<ThermostatMode, DeviceError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "manual" | "clock" | "heat" => Ok(ThermostatMode::Heat),
        "off" => Ok(ThermostatMode::Off),
        other => Err(DeviceError::InvalidPayload(format!("unknown user mode {other:?}"))),
    }
}

fn value_to_f64(value: &Value) -> Result<Option<f64>, String> {
    let number = match value {
        Value::Null => return Ok(None),
        Value::Number(n) => n.as_f64().ok_or_else(|| format!("number {n} out of range"))?,
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("expected a number, got {s:?}"))?,
        other => return Err(format!("expected a number, got {other}")),
    };
    // "NaN" and "inf" parse fine but never compare equal to a later reading.
    if !number.is_finite() {
        return Err(format!("expected a finite number, got {value}"));
    }
    Ok(Some(number))
}

fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    value_to_f64(&value).map_err(de::Error::custom)
}

fn lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<bool>, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(b)),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "on" | "true" | "yes" => Ok(Some(true)),
            "off" | "false" | "no" => Ok(Some(false)),
            other => Err(de::Error::custom(format!("expected on/off, got {other:?}"))),
        },
        other => Err(de::Error::custom(format!("expected on/off, got {other}"))),
    }
}

fn boiler_indicator<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<bool>, D::Error> {
    // CH = central heating, HW = hot water; anything else means idle.
    Ok(Option::<String>::deserialize(deserializer)?
        .map(|indicator| matches!(indicator.trim(), "CH" | "HW")))
}

fn user_mode<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<ThermostatMode>, D::Error> {
    Option::<String>::deserialize(deserializer)?
        .map(|raw| parse_user_mode(&raw).map_err(de::Error::custom))
        .transpose()
}
