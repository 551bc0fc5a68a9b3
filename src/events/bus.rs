//! Typed publish/subscribe event bus.
//!
//! Components talk to each other only through named [`Endpoint`]s. Every
//! subscription owns a bounded queue, so a slow consumer never stalls a
//! publisher or another subscriber: when a queue is full the event is
//! dropped for that subscription alone and counted.
//!
//! State snapshots are deduplicated. The bus keeps the last published
//! [`StateSnapshot`] and silently skips a new one that reads the same within
//! the configured epsilon.

use super::types::{CommandRequest, ConnectionStatus, DEFAULT_STATE_EPSILON, StateSnapshot};
use crate::error::BusError;
use futures_util::Stream;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Endpoint used by the device connection manager.
pub const ENDPOINT_NEFIT: &str = "nefit";
/// Endpoint used by the HomeKit accessory server.
pub const ENDPOINT_HOMEKIT: &str = "homekit";
/// Endpoint used by the web dashboard.
pub const ENDPOINT_WEB: &str = "web";
/// Endpoint used by metrics collection.
pub const ENDPOINT_METRICS: &str = "metrics";

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct BusConfig {
    /// Per-subscription queue capacity.
    pub queue_capacity: usize,
    /// Numeric tolerance for state deduplication.
    pub state_epsilon: f64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            state_epsilon: DEFAULT_STATE_EPSILON,
        }
    }
}

/// An event type that can travel over the bus.
///
/// Implemented for [`StateSnapshot`], [`CommandRequest`] and
/// [`ConnectionStatus`].
pub trait BusEvent: Clone + Send + 'static {
    /// Short name used in log messages.
    const NAME: &'static str;

    #[doc(hidden)]
    fn topic(topics: &Topics) -> &Topic<Self>;
}

impl BusEvent for StateSnapshot {
    const NAME: &'static str = "state_update";

    fn topic(topics: &Topics) -> &Topic<Self> {
        &topics.state
    }
}

impl BusEvent for CommandRequest {
    const NAME: &'static str = "command";

    fn topic(topics: &Topics) -> &Topic<Self> {
        &topics.command
    }
}

impl BusEvent for ConnectionStatus {
    const NAME: &'static str = "connection_status";

    fn topic(topics: &Topics) -> &Topic<Self> {
        &topics.connection
    }
}

struct Slot<T> {
    endpoint: Arc<str>,
    tx: mpsc::Sender<T>,
    dropped: Arc<AtomicU64>,
}

/// Subscriber registry for one event type.
#[doc(hidden)]
pub struct Topic<T> {
    slots: Mutex<Vec<Slot<T>>>,
}

impl<T: BusEvent> Topic<T> {
    fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Hand `event` to every live subscription without waiting.
    /// Returns the number of queues that accepted it.
    fn deliver(&self, event: &T) -> usize {
        let mut delivered = 0;
        self.slots.lock().retain(|slot| match slot.tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                slot.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "[Bus] {} queue full for endpoint {}, event dropped",
                    T::NAME,
                    slot.endpoint
                );
                true
            }
            // Subscription was dropped; prune it.
            Err(TrySendError::Closed(_)) => false,
        });
        delivered
    }

    fn clear(&self) {
        self.slots.lock().clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

#[doc(hidden)]
pub struct Topics {
    state: Topic<StateSnapshot>,
    command: Topic<CommandRequest>,
    connection: Topic<ConnectionStatus>,
}

struct BusInner {
    config: BusConfig,
    endpoints: Mutex<HashSet<Arc<str>>>,
    topics: Topics,
    /// Reference for state deduplication. Only touched by `publish_state`.
    last_state: Mutex<Option<StateSnapshot>>,
    closed: AtomicBool,
}

/// Handle on the event bus. Cloning is cheap and every clone shares the
/// same subscribers and deduplication state.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("config", &self.inner.config)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    pub fn with_config(config: BusConfig) -> Self {
        info!(
            "[Bus] Event bus initialized (queue capacity {}, state epsilon {})",
            config.queue_capacity, config.state_epsilon
        );
        Self {
            inner: Arc::new(BusInner {
                config,
                endpoints: Mutex::new(HashSet::new()),
                topics: Topics {
                    state: Topic::new(),
                    command: Topic::new(),
                    connection: Topic::new(),
                },
                last_state: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Get the endpoint called `name`, creating it on first use.
    ///
    /// Requesting an existing name returns a handle on the same endpoint.
    pub fn create_endpoint(&self, name: &str) -> Result<Endpoint, BusError> {
        self.ensure_open()?;
        if name.trim().is_empty() {
            return Err(BusError::InvalidEndpointName(name.to_string()));
        }

        let mut endpoints = self.inner.endpoints.lock();
        let name = match endpoints.get(name) {
            Some(existing) => existing.clone(),
            None => {
                let name: Arc<str> = Arc::from(name);
                endpoints.insert(name.clone());
                debug!("[Bus] Created endpoint {}", name);
                name
            }
        };

        Ok(Endpoint {
            name,
            bus: self.clone(),
        })
    }

    /// Names of all endpoints created so far, sorted.
    #[cfg(test)]
    fn endpoint_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .endpoints
            .lock()
            .iter()
            .map(|n| n.to_string())
            .collect();
        names.sort();
        names
    }

    /// Publish a state snapshot unless it reads the same as the last one.
    ///
    /// Returns `Ok(true)` when the snapshot was delivered and became the new
    /// reference, `Ok(false)` when it was suppressed as a duplicate.
    pub fn publish_state(
        &self,
        from: &Endpoint,
        snapshot: StateSnapshot,
    ) -> Result<bool, BusError> {
        self.ensure_open()?;

        // Compare, deliver and swap under one lock so concurrent publishers
        // are serialized and subscribers see references in order.
        let mut last = self.inner.last_state.lock();
        if let Some(previous) = last.as_ref()
            && snapshot.approx_eq(previous, self.inner.config.state_epsilon)
        {
            debug!(
                "[Bus] Skipping duplicate state update from {} (source={}, current={:.2}, target={:.2})",
                from.name(),
                snapshot.source,
                snapshot.current_temperature,
                snapshot.target_temperature
            );
            return Ok(false);
        }

        debug!(
            "[Bus] Publishing state update from {} (source={}, current={:.2}, target={:.2})",
            from.name(),
            snapshot.source,
            snapshot.current_temperature,
            snapshot.target_temperature
        );
        self.inner.topics.state.deliver(&snapshot);
        *last = Some(snapshot);
        Ok(true)
    }

    /// Publish a command to every command subscriber.
    pub fn publish_command(
        &self,
        from: &Endpoint,
        command: CommandRequest,
    ) -> Result<(), BusError> {
        self.ensure_open()?;
        debug!(
            "[Bus] Publishing command from {} (source={}, kind={})",
            from.name(),
            command.source,
            command.kind
        );
        self.inner.topics.command.deliver(&command);
        Ok(())
    }

    /// Publish a connection status report to every status subscriber.
    pub fn publish_connection_status(
        &self,
        from: &Endpoint,
        status: ConnectionStatus,
    ) -> Result<(), BusError> {
        self.ensure_open()?;
        debug!(
            "[Bus] Publishing connection status from {} (component={}, state={})",
            from.name(),
            status.component,
            status.state
        );
        self.inner.topics.connection.deliver(&status);
        Ok(())
    }

    /// Subscribe `endpoint` to events of type `T`.
    ///
    /// Only events published after this call are delivered.
    pub fn subscribe<T: BusEvent>(&self, endpoint: &Endpoint) -> Result<Subscription<T>, BusError> {
        let topic = T::topic(&self.inner.topics);
        let mut slots = topic.slots.lock();
        // Checked under the topic lock so close() cannot miss this slot.
        self.ensure_open()?;

        let (tx, rx) = mpsc::channel(self.inner.config.queue_capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        slots.push(Slot {
            endpoint: endpoint.name.clone(),
            tx,
            dropped: dropped.clone(),
        });
        debug!("[Bus] Endpoint {} subscribed to {}", endpoint.name, T::NAME);

        Ok(Subscription {
            endpoint: endpoint.name.clone(),
            rx,
            dropped,
        })
    }

    /// Number of live subscriptions for event type `T`.
    #[cfg(test)]
    fn subscriber_count<T: BusEvent>(&self) -> usize {
        T::topic(&self.inner.topics).len()
    }

    /// Clone of the current deduplication reference.
    pub fn last_state(&self) -> Option<StateSnapshot> {
        self.inner.last_state.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Shut the bus down. Every outstanding subscription ends and any later
    /// publish, subscribe or endpoint request fails with [`BusError::Closed`].
    ///
    /// Returns `true` for the call that actually performed the shutdown.
    pub fn close(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!("[Bus] Shutting down event bus");

        let topics = &self.inner.topics;
        topics.state.clear();
        topics.command.clear();
        topics.connection.clear();
        self.inner.endpoints.lock().clear();

        info!("[Bus] Event bus shut down complete");
        true
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.is_closed() {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }
}

/// Named publish/subscribe handle, one per logical component.
#[derive(Clone)]
pub struct Endpoint {
    name: Arc<str>,
    bus: EventBus,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint").field("name", &self.name).finish()
    }
}

impl Endpoint {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn publish_state(&self, snapshot: StateSnapshot) -> Result<bool, BusError> {
        self.bus.publish_state(self, snapshot)
    }

    pub fn publish_command(&self, command: CommandRequest) -> Result<(), BusError> {
        self.bus.publish_command(self, command)
    }

    pub fn publish_connection_status(&self, status: ConnectionStatus) -> Result<(), BusError> {
        self.bus.publish_connection_status(self, status)
    }

    pub fn subscribe<T: BusEvent>(&self) -> Result<Subscription<T>, BusError> {
        self.bus.subscribe(self)
    }
}

/// Receive side of one subscription.
///
/// Events arrive in publish order. The stream ends once the bus is closed.
/// Dropping or closing the subscription unregisters it; subscribing again
/// starts from an empty queue.
pub struct Subscription<T> {
    endpoint: Arc<str>,
    rx: mpsc::Receiver<T>,
    dropped: Arc<AtomicU64>,
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("endpoint", &self.endpoint)
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl<T> Subscription<T> {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Wait for the next event. `None` once the bus is closed.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take the next queued event, if any, without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Events discarded because this subscription's queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn close(mut self) {
        self.rx.close();
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}
