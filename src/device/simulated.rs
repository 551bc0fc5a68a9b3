//! In-memory thermostat implementing [`DeviceLink`].
//!
//! Used by the binary when no real protocol client is wired in, and by the
//! tests. The room temperature drifts toward the setpoint on every status
//! read, with a little measurement noise on top. Faults can be scripted:
//! refused connections, dropped links, failing writes and a device that
//! stops answering altogether.

use super::link::{
    DeviceLink, Notification, URI_HOT_WATER_MANUAL_MODE, URI_MANUAL_SETPOINT, URI_STATUS,
    URI_SYSTEM_PRESSURE, URI_USER_MODE,
};
use crate::error::DeviceError;
use async_trait::async_trait;
use log::{debug, info};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::{mpsc, watch};

/// Default drift toward the setpoint per status read, in °C.
const DEFAULT_DRIFT: f64 = 0.1;
/// Default measurement noise amplitude, in °C. Below the dedup epsilon.
const DEFAULT_NOISE: f64 = 0.004;

#[derive(Debug, Clone)]
struct Room {
    current: f64,
    setpoint: f64,
    /// Raw device user mode: `manual`, `clock` or `off`.
    user_mode: String,
    hot_water: bool,
    hot_water_temperature: f64,
    pressure: f64,
}

pub struct SimulatedThermostat {
    room: Mutex<Room>,
    drift: f64,
    noise: f64,
    link_up: watch::Sender<bool>,
    pending_connect_failures: AtomicU32,
    connect_attempts: AtomicU32,
    status_requests: AtomicU32,
    failing_puts: AtomicBool,
    unresponsive: AtomicBool,
    notifications: Mutex<Option<mpsc::Sender<Notification>>>,
    puts: Mutex<Vec<(String, Value)>>,
}

impl Default for SimulatedThermostat {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedThermostat {
    pub fn new() -> Self {
        let (link_up, _) = watch::channel(false);
        Self {
            room: Mutex::new(Room {
                current: 20.0,
                setpoint: 21.0,
                user_mode: "manual".to_string(),
                hot_water: true,
                hot_water_temperature: 55.0,
                pressure: 1.6,
            }),
            drift: DEFAULT_DRIFT,
            noise: DEFAULT_NOISE,
            link_up,
            pending_connect_failures: AtomicU32::new(0),
            connect_attempts: AtomicU32::new(0),
            status_requests: AtomicU32::new(0),
            failing_puts: AtomicBool::new(false),
            unresponsive: AtomicBool::new(false),
            notifications: Mutex::new(None),
            puts: Mutex::new(Vec::new()),
        }
    }

    /// A device whose readings never change on their own.
    pub fn steady() -> Self {
        Self {
            drift: 0.0,
            noise: 0.0,
            ..Self::new()
        }
    }

    /// Refuse the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.pending_connect_failures.store(count, Ordering::SeqCst);
    }

    /// Make every write fail until called again with `false`.
    pub fn fail_puts(&self, failing: bool) {
        self.failing_puts.store(failing, Ordering::SeqCst);
    }

    /// Stop answering: every call hangs until called again with `false`.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.unresponsive.store(unresponsive, Ordering::SeqCst);
    }

    /// Simulate the remote side dropping an established connection.
    pub fn drop_connection(&self) {
        info!("[Sim] Dropping device connection");
        self.link_up.send_replace(false);
    }

    /// Deliver a push notification to the subscribed queue, if any.
    /// Returns whether it was queued.
    pub fn push(&self, notification: Notification) -> bool {
        match self.notifications.lock().as_ref() {
            Some(tx) => tx.try_send(notification).is_ok(),
            None => false,
        }
    }

    /// Push a status notification with the given payload.
    pub fn push_status(&self, payload: Value) -> bool {
        self.push(Notification::new(URI_STATUS, payload))
    }

    pub fn is_connected(&self) -> bool {
        *self.link_up.borrow()
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn status_requests(&self) -> u32 {
        self.status_requests.load(Ordering::SeqCst)
    }

    /// Every successful write so far, in order.
    pub fn puts(&self) -> Vec<(String, Value)> {
        self.puts.lock().clone()
    }

    async fn stall_if_unresponsive(&self) {
        if self.unresponsive.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }

    fn ensure_connected(&self) -> Result<(), DeviceError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(DeviceError::NotConnected)
        }
    }

    fn read_status(&self) -> Value {
        let mut room = self.room.lock();
        let heating = room.user_mode != "off" && room.current < room.setpoint - 0.05;

        if self.drift > 0.0 {
            let target = if room.user_mode == "off" { 16.0 } else { room.setpoint };
            let step = (target - room.current).clamp(-self.drift, self.drift);
            room.current += step;
        }
        let noise = if self.noise > 0.0 {
            rand::thread_rng().gen_range(-self.noise..=self.noise)
        } else {
            0.0
        };

        // The device reports numbers as strings.
        json!({
            "IHT": format!("{:.3}", room.current + noise),
            "TSP": format!("{:.1}", room.setpoint),
            "BAI": if heating { "CH" } else { "No" },
            "UMD": room.user_mode,
            "DHW": if room.hot_water { "on" } else { "off" },
            "hot_water_temperature": room.hot_water_temperature,
        })
    }
}

#[async_trait]
impl DeviceLink for SimulatedThermostat {
    async fn connect(&self) -> Result<(), DeviceError> {
        self.stall_if_unresponsive().await;
        let attempt = self.connect_attempts.fetch_add(1, Ordering::SeqCst) + 1;

        let refused = self
            .pending_connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            debug!("[Sim] Refusing connection attempt {}", attempt);
            return Err(DeviceError::ConnectionFailed(
                "simulated connection refusal".to_string(),
            ));
        }

        self.link_up.send_replace(true);
        debug!("[Sim] Accepted connection attempt {}", attempt);
        Ok(())
    }

    async fn get(&self, uri: &str) -> Result<Value, DeviceError> {
        self.stall_if_unresponsive().await;
        self.ensure_connected()?;

        match uri {
            URI_STATUS => {
                self.status_requests.fetch_add(1, Ordering::SeqCst);
                Ok(self.read_status())
            }
            URI_SYSTEM_PRESSURE => Ok(json!({
                "value": self.room.lock().pressure,
                "unitOfMeasure": "bar",
            })),
            other => Err(DeviceError::Request {
                uri: other.to_string(),
                message: "no such resource".to_string(),
            }),
        }
    }

    async fn put(&self, uri: &str, value: Value) -> Result<(), DeviceError> {
        self.stall_if_unresponsive().await;
        self.ensure_connected()?;

        if self.failing_puts.load(Ordering::SeqCst) {
            return Err(DeviceError::Request {
                uri: uri.to_string(),
                message: "simulated write failure".to_string(),
            });
        }

        let invalid = || DeviceError::Request {
            uri: uri.to_string(),
            message: format!("invalid value {value}"),
        };
        {
            let mut room = self.room.lock();
            match uri {
                URI_MANUAL_SETPOINT => room.setpoint = value.as_f64().ok_or_else(invalid)?,
                URI_USER_MODE => match value.as_str() {
                    Some(mode @ ("manual" | "clock" | "off")) => room.user_mode = mode.to_string(),
                    _ => return Err(invalid()),
                },
                URI_HOT_WATER_MANUAL_MODE => match value.as_str() {
                    Some("on") => room.hot_water = true,
                    Some("off") => room.hot_water = false,
                    _ => return Err(invalid()),
                },
                other => {
                    return Err(DeviceError::Request {
                        uri: other.to_string(),
                        message: "resource is read-only".to_string(),
                    });
                }
            }
        }

        debug!("[Sim] {} <- {}", uri, value);
        self.puts.lock().push((uri.to_string(), value));
        Ok(())
    }

    fn subscribe(&self, notifications: mpsc::Sender<Notification>) {
        *self.notifications.lock() = Some(notifications);
    }

    async fn closed(&self) {
        let mut up = self.link_up.subscribe();
        let _ = up.wait_for(|up| !*up).await;
    }

    async fn close(&self) -> Result<(), DeviceError> {
        self.stall_if_unresponsive().await;
        self.link_up.send_replace(false);
        *self.notifications.lock() = None;
        info!("[Sim] Device link closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_requests_need_a_connection() {
        let device = SimulatedThermostat::steady();
        assert_eq!(device.get(URI_STATUS).await, Err(DeviceError::NotConnected));

        device.connect().await.unwrap();
        assert!(device.is_connected());
        assert!(device.get(URI_STATUS).await.is_ok());
        assert_eq!(device.status_requests(), 1);
    }

    #[tokio::test]
    async fn test_scripted_connect_failures() {
        let device = SimulatedThermostat::steady();
        device.fail_next_connects(2);

        assert!(device.connect().await.is_err());
        assert!(device.connect().await.is_err());
        assert!(device.connect().await.is_ok());
        assert_eq!(device.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_put_updates_reported_status() {
        let device = SimulatedThermostat::steady();
        device.connect().await.unwrap();

        device.put(URI_MANUAL_SETPOINT, json!(23.5)).await.unwrap();
        device.put(URI_USER_MODE, json!("off")).await.unwrap();
        device.put(URI_HOT_WATER_MANUAL_MODE, json!("off")).await.unwrap();

        let status = device.get(URI_STATUS).await.unwrap();
        assert_eq!(status["TSP"], "23.5");
        assert_eq!(status["UMD"], "off");
        assert_eq!(status["DHW"], "off");
        assert_eq!(device.puts().len(), 3);

        assert!(device.put(URI_USER_MODE, json!("party")).await.is_err());
        assert!(device.put(URI_STATUS, json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_drift_moves_toward_setpoint() {
        let device = SimulatedThermostat {
            noise: 0.0,
            ..SimulatedThermostat::new()
        };
        device.connect().await.unwrap();

        let first = device.get(URI_STATUS).await.unwrap();
        let second = device.get(URI_STATUS).await.unwrap();
        let parse = |v: &Value| v["IHT"].as_str().unwrap().parse::<f64>().unwrap();
        assert!(parse(&second) > parse(&first));
        assert_eq!(first["BAI"], "CH");
    }

    #[tokio::test]
    async fn test_closed_resolves_after_drop() {
        let device = SimulatedThermostat::steady();
        device.connect().await.unwrap();
        device.drop_connection();
        device.closed().await;
        assert!(!device.is_connected());
    }

    #[tokio::test]
    async fn test_push_requires_subscription() {
        let device = SimulatedThermostat::steady();
        assert!(!device.push_status(json!({"IHT": 20.0})));

        let (tx, mut rx) = mpsc::channel(4);
        device.subscribe(tx);
        assert!(device.push_status(json!({"IHT": 20.0})));
        assert_eq!(rx.recv().await.unwrap().uri, URI_STATUS);
    }
}
