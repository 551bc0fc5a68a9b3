//! Device connection manager.
//!
//! Owns the single link to the thermostat and runs four tasks:
//!
//! - the connection loop: connect, back off and retry on failure, watch the
//!   link once it is up;
//! - the keepalive loop: poll status while connected;
//! - the command loop: apply [`CommandRequest`]s from other components;
//! - the status pump: merge polled and pushed status into snapshots and
//!   publish them.
//!
//! All of them stop on one [`CancellationToken`]. Device failures never leave
//! this module; they become [`ConnectionStatus`] events and log lines.

use super::backoff::Backoff;
use crate::device::payload::{encode_command, parse_pressure};
use crate::device::{DeviceLink, DeviceStatus, Notification, URI_STATUS, URI_SYSTEM_PRESSURE};
use crate::error::{DeviceError, Result};
use crate::events::{
    CommandRequest, ConnectionState, ConnectionStatus, DeviceCommand, ENDPOINT_NEFIT, Endpoint,
    EventBus, Subscription,
};
use log::{debug, error, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Capacity of the push-notification and polled-status queues.
const STATUS_QUEUE_CAPACITY: usize = 32;

/// Timing policy for the device connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    /// Status poll period while connected.
    pub keepalive_interval: Duration,
    /// First reconnect delay.
    pub initial_backoff: Duration,
    /// Upper bound for the reconnect delay.
    pub max_backoff: Duration,
    /// Bound for connect and status requests.
    pub io_timeout: Duration,
    /// Bound for applying one command.
    pub command_timeout: Duration,
    /// Bound for the whole shutdown sequence.
    pub shutdown_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(30),
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(300),
            io_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Outcome of [`ConnectionManager::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// `false` when tasks had to be aborted or the link did not close in time.
    pub clean: bool,
}

struct Shared {
    settings: ConnectionSettings,
    link: Arc<dyn DeviceLink>,
    endpoint: Endpoint,
    cancel: CancellationToken,
    reconnects: AtomicU32,
    connected: AtomicBool,
    disconnected_published: AtomicBool,
    polled_tx: mpsc::Sender<DeviceStatus>,
}

impl Shared {
    fn publish_status(&self, state: ConnectionState, error: Option<String>) {
        let mut status = ConnectionStatus::new(
            self.endpoint.name(),
            state,
            self.reconnects.load(Ordering::SeqCst),
        );
        if let Some(error) = error {
            status = status.with_error(error);
        }
        if let Err(e) = self.endpoint.publish_connection_status(status) {
            debug!("[Nefit] Could not publish {} status: {}", state, e);
        }
    }

    fn publish_disconnected(&self) {
        if !self.disconnected_published.swap(true, Ordering::SeqCst) {
            self.connected.store(false, Ordering::SeqCst);
            self.publish_status(ConnectionState::Disconnected, None);
        }
    }

    /// Run a device call under `after`, turning expiry into a timeout error.
    async fn timed<T>(
        &self,
        operation: &'static str,
        after: Duration,
        call: impl Future<Output = std::result::Result<T, DeviceError>>,
    ) -> std::result::Result<T, DeviceError> {
        match tokio::time::timeout(after, call).await {
            Ok(result) => result,
            Err(_) => Err(DeviceError::Timeout { operation, after }),
        }
    }

    /// Fetch status (and pressure, best effort) and queue it for publishing.
    async fn poll_status(&self) -> std::result::Result<(), DeviceError> {
        let io_timeout = self.settings.io_timeout;
        let payload = self
            .timed("status request", io_timeout, self.link.get(URI_STATUS))
            .await?;
        let mut status = DeviceStatus::from_value(payload)?;

        match self
            .timed("pressure request", io_timeout, self.link.get(URI_SYSTEM_PRESSURE))
            .await
            .and_then(parse_pressure)
        {
            Ok(pressure) => status.pressure = Some(pressure),
            Err(e) => debug!("[Nefit] Pressure unavailable: {}", e),
        }

        if self.polled_tx.send(status).await.is_err() {
            debug!("[Nefit] Status pump has stopped, dropping polled status");
        }
        Ok(())
    }

    async fn apply_command(&self, command: DeviceCommand) {
        let (uri, value) = encode_command(command);
        info!("[Nefit] Applying {:?} ({} <- {})", command, uri, value);

        let result = self
            .timed("command", self.settings.command_timeout, self.link.put(uri, value))
            .await;
        match result {
            Ok(()) => {
                // Reflect the change now instead of at the next keepalive tick.
                if let Err(e) = self.poll_status().await {
                    warn!("[Nefit] Failed to fetch status after {:?}: {}", command, e);
                }
            }
            Err(e) => error!("[Nefit] Failed to apply {:?}: {}", command, e),
        }
    }

    /// Sleep for `delay`. Returns `false` if cancelled first.
    async fn sleep_or_cancel(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

/// Keeps one logical connection to the thermostat and bridges it to the bus.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    pending: Option<(mpsc::Receiver<Notification>, mpsc::Receiver<DeviceStatus>)>,
    notifications_tx: mpsc::Sender<Notification>,
    tasks: Vec<JoinHandle<()>>,
}

impl ConnectionManager {
    /// Create a manager publishing as the `nefit` endpoint.
    pub fn new(
        settings: ConnectionSettings,
        link: Arc<dyn DeviceLink>,
        bus: &EventBus,
    ) -> Result<Self> {
        Ok(Self::with_endpoint(
            settings,
            link,
            bus.create_endpoint(ENDPOINT_NEFIT)?,
        ))
    }

    /// Create a manager publishing as `endpoint`. Commands published by that
    /// endpoint name are never applied.
    pub fn with_endpoint(
        settings: ConnectionSettings,
        link: Arc<dyn DeviceLink>,
        endpoint: Endpoint,
    ) -> Self {
        let (notifications_tx, notifications_rx) = mpsc::channel(STATUS_QUEUE_CAPACITY);
        let (polled_tx, polled_rx) = mpsc::channel(STATUS_QUEUE_CAPACITY);

        info!(
            "[Nefit] Connection manager created (keepalive {:?}, backoff {:?}..{:?})",
            settings.keepalive_interval, settings.initial_backoff, settings.max_backoff
        );

        Self {
            shared: Arc::new(Shared {
                settings,
                link,
                endpoint,
                cancel: CancellationToken::new(),
                reconnects: AtomicU32::new(0),
                connected: AtomicBool::new(false),
                disconnected_published: AtomicBool::new(false),
                polled_tx,
            }),
            pending: Some((notifications_rx, polled_rx)),
            notifications_tx,
            tasks: Vec::new(),
        }
    }

    /// Spawn the manager's tasks. Calling it again is a no-op.
    pub fn start(&mut self) -> Result<()> {
        let Some((notifications_rx, polled_rx)) = self.pending.take() else {
            warn!("[Nefit] Connection manager already started");
            return Ok(());
        };
        info!("[Nefit] Starting connection manager");

        // Subscribe before anything runs so no command is missed.
        let commands = self.shared.endpoint.subscribe::<CommandRequest>()?;
        self.shared.link.subscribe(self.notifications_tx.clone());

        self.tasks.push(tokio::spawn(run_status_pump(
            self.shared.clone(),
            notifications_rx,
            polled_rx,
        )));
        self.tasks
            .push(tokio::spawn(run_command_loop(self.shared.clone(), commands)));
        self.tasks
            .push(tokio::spawn(run_connection_loop(self.shared.clone())));
        Ok(())
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Reconnect attempts since the last successful connection.
    pub fn reconnects(&self) -> u32 {
        self.shared.reconnects.load(Ordering::SeqCst)
    }

    /// Stop all tasks and release the device link.
    ///
    /// Waits at most `shutdown_timeout`. Anything still running after that is
    /// aborted and the report is marked as not clean.
    pub async fn shutdown(mut self) -> ShutdownReport {
        info!("[Nefit] Shutting down connection manager");
        self.shared.cancel.cancel();

        let grace = self.shared.settings.shutdown_timeout;
        let deadline = Instant::now() + grace;
        let mut clean = true;

        for mut task in self.tasks.drain(..) {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                warn!("[Nefit] Task still busy after {:?}, aborting it", grace);
                task.abort();
                clean = false;
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, self.shared.link.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("[Nefit] Error closing device link: {}", e),
            Err(_) => {
                warn!("[Nefit] Device link did not close within {:?}", grace);
                clean = false;
            }
        }

        self.shared.publish_disconnected();
        if clean {
            info!("[Nefit] Connection manager shut down complete");
        } else {
            warn!("[Nefit] Connection manager shut down partially");
        }
        ShutdownReport { clean }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

async fn run_connection_loop(shared: Arc<Shared>) {
    let settings = &shared.settings;
    let mut backoff = Backoff::new(settings.initial_backoff, settings.max_backoff);

    loop {
        info!(
            "[Nefit] Connecting to device (attempt {})",
            shared.reconnects.load(Ordering::SeqCst) + 1
        );
        shared.publish_status(ConnectionState::Connecting, None);

        let result = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            result = shared.timed("connect", settings.io_timeout, shared.link.connect()) => result,
        };

        let (error, attempt_failed) = match result {
            Ok(()) => {
                if !hold_connection(&shared, &mut backoff).await {
                    break;
                }
                (DeviceError::ConnectionClosed, false)
            }
            Err(e) => (e, true),
        };

        let reconnects = shared.reconnects.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = backoff.next_delay();
        if attempt_failed {
            shared.publish_status(ConnectionState::Failed, Some(error.to_string()));
        }
        error!(
            "[Nefit] Device connection failed: {} (attempt {}, retrying in {:?})",
            error, reconnects, delay
        );
        shared.publish_status(ConnectionState::Reconnecting, Some(error.to_string()));

        if !shared.sleep_or_cancel(delay).await {
            break;
        }
    }

    info!("[Nefit] Stopping connection attempts");
    shared.publish_disconnected();
}

/// Run the keepalive until shutdown or link loss. Returns `true` if the link
/// was lost.
async fn hold_connection(shared: &Arc<Shared>, backoff: &mut Backoff) -> bool {
    info!("[Nefit] Connected to device");
    shared.reconnects.store(0, Ordering::SeqCst);
    shared.connected.store(true, Ordering::SeqCst);
    backoff.reset();
    shared.publish_status(ConnectionState::Connected, None);

    let keepalive_cancel = shared.cancel.child_token();
    let keepalive = tokio::spawn(run_keepalive(shared.clone(), keepalive_cancel.clone()));
    let lost = tokio::select! {
        biased;
        _ = shared.cancel.cancelled() => false,
        _ = shared.link.closed() => true,
    };
    keepalive_cancel.cancel();
    if let Err(e) = keepalive.await {
        warn!("[Nefit] Keepalive task ended abnormally: {}", e);
    }
    shared.connected.store(false, Ordering::SeqCst);

    if lost {
        warn!("[Nefit] Connection to device lost");
    }
    lost
}

async fn run_keepalive(shared: Arc<Shared>, cancel: CancellationToken) {
    let interval = shared.settings.keepalive_interval;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!("[Nefit] Starting status polling every {:?}", interval);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = shared.poll_status() => {
                if let Err(e) = result {
                    warn!("[Nefit] Failed to fetch status: {}", e);
                }
            }
        }
    }

    debug!("[Nefit] Stopping status polling");
}

async fn run_command_loop(shared: Arc<Shared>, mut commands: Subscription<CommandRequest>) {
    info!("[Nefit] Subscribed to command events");

    loop {
        let request = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            next = commands.recv() => match next {
                Some(request) => request,
                None => {
                    debug!("[Nefit] Command subscription ended");
                    break;
                }
            },
        };

        // Our own commands would loop straight back to the device.
        if request.source == shared.endpoint.name() {
            debug!("[Nefit] Ignoring command published by this component");
            continue;
        }

        match request.validate() {
            // Not raced against cancellation: an in-flight command gets its
            // own timeout as grace period during shutdown.
            Ok(command) => shared.apply_command(command).await,
            Err(e) => warn!("[Nefit] Dropping command from {}: {}", request.source, e),
        }
    }

    info!("[Nefit] Stopping command handler");
}

async fn run_status_pump(
    shared: Arc<Shared>,
    mut notifications: mpsc::Receiver<Notification>,
    mut polled: mpsc::Receiver<DeviceStatus>,
) {
    let mut merged = DeviceStatus::default();

    loop {
        let update = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            Some(status) = polled.recv() => status,
            Some(notification) = notifications.recv() => {
                debug!("[Nefit] Received device notification for {}", notification.uri);
                match DeviceStatus::from_notification(&notification) {
                    Ok(Some(status)) => status,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!("[Nefit] Dropping notification for {}: {}", notification.uri, e);
                        continue;
                    }
                }
            },
            else => break,
        };

        merged.merge(update);
        let Some(snapshot) = merged.snapshot(shared.endpoint.name()) else {
            debug!("[Nefit] Status incomplete, waiting before publishing state");
            continue;
        };
        debug!(
            "[Nefit] Publishing state (current={:.2}, target={:.2}, heating={})",
            snapshot.current_temperature, snapshot.target_temperature, snapshot.heating_active
        );
        if let Err(e) = shared.endpoint.publish_state(snapshot) {
            debug!("[Nefit] Could not publish state: {}", e);
        }
    }

    debug!("[Nefit] Status pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{
        SimulatedThermostat, URI_HOT_WATER_MANUAL_MODE, URI_MANUAL_SETPOINT, URI_USER_MODE,
    };
    use crate::events::{ENDPOINT_HOMEKIT, ENDPOINT_WEB, StateSnapshot, ThermostatMode};
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(600);

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            keepalive_interval: Duration::from_secs(30),
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(300),
            io_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(2),
        }
    }

    struct Harness {
        device: Arc<SimulatedThermostat>,
        manager: ConnectionManager,
        homekit: Endpoint,
        statuses: Subscription<ConnectionStatus>,
        states: Subscription<StateSnapshot>,
    }

    fn harness(device: SimulatedThermostat, settings: ConnectionSettings) -> Harness {
        let bus = EventBus::new();
        let web = bus.create_endpoint(ENDPOINT_WEB).unwrap();
        let statuses = web.subscribe().unwrap();
        let states = web.subscribe().unwrap();
        let homekit = bus.create_endpoint(ENDPOINT_HOMEKIT).unwrap();

        let device = Arc::new(device);
        let mut manager = ConnectionManager::new(settings, device.clone(), &bus).unwrap();
        manager.start().unwrap();

        Harness {
            device,
            manager,
            homekit,
            statuses,
            states,
        }
    }

    async fn wait_for(
        statuses: &mut Subscription<ConnectionStatus>,
        state: ConnectionState,
    ) -> ConnectionStatus {
        loop {
            let status = timeout(WAIT, statuses.recv())
                .await
                .expect("timed out waiting for connection status")
                .expect("bus closed");
            if status.state == state {
                return status;
            }
        }
    }

    async fn next_state(states: &mut Subscription<StateSnapshot>) -> StateSnapshot {
        timeout(WAIT, states.recv())
            .await
            .expect("timed out waiting for state")
            .expect("bus closed")
    }

    fn count_disconnected(statuses: &mut Subscription<ConnectionStatus>) -> usize {
        let mut count = 0;
        while let Some(status) = statuses.try_recv() {
            if status.state == ConnectionState::Disconnected {
                count += 1;
            }
        }
        count
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_and_counter_resets_on_connect() {
        let device = SimulatedThermostat::steady();
        device.fail_next_connects(3);
        let mut h = harness(device, settings());

        let mut connecting_at = Vec::new();
        let mut failed = Vec::new();
        let mut reconnecting = Vec::new();
        let connected = loop {
            let status = timeout(WAIT, h.statuses.recv()).await.unwrap().unwrap();
            match status.state {
                ConnectionState::Connecting => connecting_at.push(Instant::now()),
                ConnectionState::Failed => failed.push(status.reconnects),
                ConnectionState::Reconnecting => {
                    assert!(status.error.is_some());
                    reconnecting.push(status.reconnects);
                }
                ConnectionState::Connected => break status,
                ConnectionState::Disconnected => panic!("unexpected disconnect"),
            }
        };

        assert_eq!(connected.reconnects, 0);
        assert_eq!(failed, vec![1, 2, 3]);
        assert_eq!(reconnecting, vec![1, 2, 3]);
        let waits: Vec<u64> = connecting_at
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).as_secs())
            .collect();
        assert_eq!(waits, vec![5, 10, 20]);
        assert_eq!(h.device.connect_attempts(), 4);
        assert!(h.manager.is_connected());
        assert_eq!(h.manager.reconnects(), 0);

        assert!(h.manager.shutdown().await.clean);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_backoff_disconnects_once() {
        let device = SimulatedThermostat::steady();
        device.fail_next_connects(u32::MAX);
        let mut h = harness(
            device,
            ConnectionSettings {
                initial_backoff: Duration::from_secs(60),
                max_backoff: Duration::from_secs(600),
                ..settings()
            },
        );

        wait_for(&mut h.statuses, ConnectionState::Reconnecting).await;

        let started = Instant::now();
        let report = h.manager.shutdown().await;
        assert!(report.clean);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(count_disconnected(&mut h.statuses), 1);
        assert_eq!(h.device.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_polls_and_repeated_state_is_suppressed() {
        let mut h = harness(SimulatedThermostat::steady(), settings());
        wait_for(&mut h.statuses, ConnectionState::Connected).await;

        let first = next_state(&mut h.states).await;
        assert_eq!(first.source, ENDPOINT_NEFIT);
        assert_eq!(first.current_temperature, 20.0);
        assert_eq!(first.target_temperature, 21.0);
        assert_eq!(first.mode, ThermostatMode::Heat);
        assert!(first.heating_active);
        assert_eq!(first.pressure, 1.6);

        tokio::time::sleep(Duration::from_secs(65)).await;
        // Immediate poll plus ticks at 30s and 60s.
        assert_eq!(h.device.status_requests(), 3);
        assert!(h.states.try_recv().is_none());

        assert!(h.manager.shutdown().await.clean);
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_applies_and_refreshes_state_immediately() {
        let mut h = harness(SimulatedThermostat::steady(), settings());
        wait_for(&mut h.statuses, ConnectionState::Connected).await;
        next_state(&mut h.states).await;
        let polls_before = h.device.status_requests();

        h.homekit
            .publish_command(CommandRequest::set_temperature(ENDPOINT_HOMEKIT, 23.5))
            .unwrap();
        let started = Instant::now();
        let state = next_state(&mut h.states).await;

        assert_eq!(state.target_temperature, 23.5);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(h.device.status_requests(), polls_before + 1);
        assert_eq!(
            h.device.puts(),
            vec![(URI_MANUAL_SETPOINT.to_string(), json!(23.5))]
        );

        assert!(h.manager.shutdown().await.clean);
    }

    #[tokio::test(start_paused = true)]
    async fn test_own_commands_are_not_applied() {
        let mut h = harness(SimulatedThermostat::steady(), settings());
        wait_for(&mut h.statuses, ConnectionState::Connected).await;
        next_state(&mut h.states).await;

        let own = h.manager.endpoint().clone();
        own.publish_command(CommandRequest::set_temperature(ENDPOINT_NEFIT, 30.0))
            .unwrap();
        h.homekit
            .publish_command(CommandRequest::set_mode(ENDPOINT_HOMEKIT, ThermostatMode::Off))
            .unwrap();

        let state = next_state(&mut h.states).await;
        assert_eq!(state.mode, ThermostatMode::Off);
        assert!(!state.heating_active);
        assert_eq!(
            h.device.puts(),
            vec![(URI_USER_MODE.to_string(), json!("off"))]
        );

        assert!(h.manager.shutdown().await.clean);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_and_failing_commands_do_not_stop_the_manager() {
        let mut h = harness(SimulatedThermostat::steady(), settings());
        wait_for(&mut h.statuses, ConnectionState::Connected).await;
        let initial = next_state(&mut h.states).await;
        assert!(initial.hot_water_active);

        let mut missing = CommandRequest::set_temperature(ENDPOINT_HOMEKIT, 22.0);
        missing.target_temperature = None;
        h.homekit.publish_command(missing).unwrap();

        h.device.fail_puts(true);
        h.homekit
            .publish_command(CommandRequest::set_hot_water(ENDPOINT_HOMEKIT, false))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(h.device.puts().is_empty());

        h.device.fail_puts(false);
        h.homekit
            .publish_command(CommandRequest::set_hot_water(ENDPOINT_HOMEKIT, false))
            .unwrap();
        let state = next_state(&mut h.states).await;
        assert!(!state.hot_water_active);
        assert_eq!(
            h.device.puts(),
            vec![(URI_HOT_WATER_MANUAL_MODE.to_string(), json!("off"))]
        );
        assert!(h.manager.is_connected());

        assert!(h.manager.shutdown().await.clean);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_notifications_merge_into_last_known_state() {
        let mut h = harness(SimulatedThermostat::steady(), settings());
        wait_for(&mut h.statuses, ConnectionState::Connected).await;
        next_state(&mut h.states).await;

        assert!(h.device.push_status(json!({"IHT": "19.0"})));
        let state = next_state(&mut h.states).await;
        assert_eq!(state.current_temperature, 19.0);
        assert_eq!(state.target_temperature, 21.0);
        assert!(state.heating_active);

        // Unknown mode: dropped, nothing published.
        assert!(h.device.push_status(json!({"UMD": "party"})));
        assert!(h.device.push_status(json!({"BAI": "No"})));
        let state = next_state(&mut h.states).await;
        assert!(!state.heating_active);
        assert_eq!(state.mode, ThermostatMode::Heat);
        assert_eq!(state.current_temperature, 19.0);

        assert!(h.manager.shutdown().await.clean);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_link_reconnects_after_initial_backoff() {
        let mut h = harness(SimulatedThermostat::steady(), settings());
        wait_for(&mut h.statuses, ConnectionState::Connected).await;

        h.device.drop_connection();
        let status = wait_for(&mut h.statuses, ConnectionState::Reconnecting).await;
        assert_eq!(status.error.as_deref(), Some("connection closed"));
        assert_eq!(status.reconnects, 1);

        let lost_at = Instant::now();
        let status = wait_for(&mut h.statuses, ConnectionState::Connected).await;
        assert_eq!(status.reconnects, 0);
        assert_eq!(lost_at.elapsed().as_secs(), 5);
        assert_eq!(h.device.connect_attempts(), 2);

        assert!(h.manager.shutdown().await.clean);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_with_unresponsive_device_is_bounded() {
        let mut h = harness(
            SimulatedThermostat::steady(),
            ConnectionSettings {
                shutdown_timeout: Duration::from_secs(1),
                ..settings()
            },
        );
        wait_for(&mut h.statuses, ConnectionState::Connected).await;
        next_state(&mut h.states).await;

        h.device.set_unresponsive(true);
        h.homekit
            .publish_command(CommandRequest::set_temperature(ENDPOINT_HOMEKIT, 25.0))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        let report = h.manager.shutdown().await;
        assert!(!report.clean);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(count_disconnected(&mut h.statuses), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_is_harmless() {
        let mut h = harness(SimulatedThermostat::steady(), settings());
        h.manager.start().unwrap();
        wait_for(&mut h.statuses, ConnectionState::Connected).await;
        assert_eq!(h.device.connect_attempts(), 1);
        assert!(h.manager.shutdown().await.clean);
    }

    /// Refuses every connection but accepts reads and writes, so commands
    /// succeed while the connection loop is still backing off.
    struct RefusingLink {
        puts: AtomicU32,
    }

    #[async_trait]
    impl DeviceLink for RefusingLink {
        async fn connect(&self) -> std::result::Result<(), DeviceError> {
            Err(DeviceError::ConnectionFailed("refused".to_string()))
        }

        async fn get(&self, uri: &str) -> std::result::Result<Value, DeviceError> {
            match uri {
                URI_STATUS => Ok(json!({"IHT": "20.0", "TSP": "21.0", "UMD": "manual"})),
                _ => Ok(json!({"value": 1.5})),
            }
        }

        async fn put(&self, _uri: &str, _value: Value) -> std::result::Result<(), DeviceError> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn subscribe(&self, _notifications: mpsc::Sender<Notification>) {}

        async fn close(&self) -> std::result::Result<(), DeviceError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_command_does_not_reset_backoff() {
        let bus = EventBus::new();
        let web = bus.create_endpoint(ENDPOINT_WEB).unwrap();
        let mut statuses = web.subscribe::<ConnectionStatus>().unwrap();
        let homekit = bus.create_endpoint(ENDPOINT_HOMEKIT).unwrap();

        let link = Arc::new(RefusingLink {
            puts: AtomicU32::new(0),
        });
        let mut manager = ConnectionManager::new(settings(), link.clone(), &bus).unwrap();
        manager.start().unwrap();

        let mut connecting_at = Vec::new();
        let mut failed = Vec::new();
        let mut reconnecting = Vec::new();
        while reconnecting.len() < 4 {
            let status = timeout(WAIT, statuses.recv()).await.unwrap().unwrap();
            match status.state {
                ConnectionState::Connecting => connecting_at.push(Instant::now()),
                ConnectionState::Failed => failed.push(status.reconnects),
                ConnectionState::Reconnecting => {
                    reconnecting.push(status.reconnects);
                    if reconnecting.len() == 1 {
                        let command = CommandRequest::set_temperature(ENDPOINT_HOMEKIT, 22.5);
                        homekit.publish_command(command).unwrap();
                    }
                }
                other => panic!("unexpected {other} status"),
            }
        }

        assert_eq!(link.puts.load(Ordering::SeqCst), 1);
        assert_eq!(failed, vec![1, 2, 3, 4]);
        assert_eq!(reconnecting, vec![1, 2, 3, 4]);
        let waits: Vec<u64> = connecting_at
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).as_secs())
            .collect();
        assert_eq!(waits, vec![5, 10, 20]);
        assert_eq!(manager.reconnects(), 4);

        assert!(manager.shutdown().await.clean);
    }

    /// Connects fine but panics on every read.
    struct PanickingLink;

    #[async_trait]
    impl DeviceLink for PanickingLink {
        async fn connect(&self) -> std::result::Result<(), DeviceError> {
            Ok(())
        }

        async fn get(&self, uri: &str) -> std::result::Result<Value, DeviceError> {
            panic!("read of {uri} failed hard")
        }

        async fn put(&self, _uri: &str, _value: Value) -> std::result::Result<(), DeviceError> {
            Ok(())
        }

        fn subscribe(&self, _notifications: mpsc::Sender<Notification>) {}

        async fn close(&self) -> std::result::Result<(), DeviceError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_panic_does_not_break_shutdown() {
        let bus = EventBus::new();
        let web = bus.create_endpoint(ENDPOINT_WEB).unwrap();
        let mut statuses = web.subscribe::<ConnectionStatus>().unwrap();

        let mut manager =
            ConnectionManager::new(settings(), Arc::new(PanickingLink), &bus).unwrap();
        manager.start().unwrap();
        wait_for(&mut statuses, ConnectionState::Connected).await;

        // First keepalive poll runs and panics.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(manager.is_connected());

        let report = manager.shutdown().await;
        assert!(report.clean);
        assert_eq!(count_disconnected(&mut statuses), 1);
    }
}
