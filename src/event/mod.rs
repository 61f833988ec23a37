//! Event routing.
//!
//! Decoded frames and connection state transitions become [`Event`]s,
//! which the [`EventRouter`] fans out two ways:
//!
//! - synchronous callback listeners, invoked in registration order, each
//!   isolated so a panicking listener cannot starve the ones after it
//! - broadcast [`Subscription`]s for async consumers

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast;

use crate::types::{ConnectionState, DeviceId, SensorReading};

/// Event variant discriminant, used for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SensorReading,
    Acknowledgement,
    ConnectionStateChanged,
    RawDataReceived,
}

/// A typed notification derived from an inbound frame or a state change.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A sensor value reported by the device.
    SensorReading {
        device: DeviceId,
        reading: SensorReading,
    },
    /// The device answered a command.
    Acknowledgement {
        device: DeviceId,
        /// Sequence number or callback tag of the answered command.
        command_id: u8,
        success: bool,
        payload: Bytes,
    },
    /// The device session changed state.
    ConnectionStateChanged {
        device: DeviceId,
        state: ConnectionState,
    },
    /// Bytes the codec could not (or does not) interpret further.
    RawDataReceived { device: DeviceId, bytes: Bytes },
}

impl Event {
    /// Returns the variant discriminant.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::SensorReading { .. } => EventKind::SensorReading,
            Self::Acknowledgement { .. } => EventKind::Acknowledgement,
            Self::ConnectionStateChanged { .. } => EventKind::ConnectionStateChanged,
            Self::RawDataReceived { .. } => EventKind::RawDataReceived,
        }
    }

    /// Returns the device the event belongs to.
    #[must_use]
    pub const fn device(&self) -> &DeviceId {
        match self {
            Self::SensorReading { device, .. }
            | Self::Acknowledgement { device, .. }
            | Self::ConnectionStateChanged { device, .. }
            | Self::RawDataReceived { device, .. } => device,
        }
    }
}

/// Subscription filter: a device (or any) and a variant (or any).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    /// Only events for this device; `None` matches every device.
    pub device: Option<DeviceId>,
    /// Only this variant; `None` matches every variant.
    pub kind: Option<EventKind>,
    /// Only acknowledgements carrying this command id.
    pub command_id: Option<u8>,
}

impl EventFilter {
    /// Matches every event.
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    /// Matches events of one device.
    #[must_use]
    pub fn device(device: DeviceId) -> Self {
        Self {
            device: Some(device),
            ..Self::default()
        }
    }

    /// Restricts the filter to one variant.
    #[must_use]
    pub const fn kind(mut self, kind: EventKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Matches the acknowledgement for a command id on a device.
    #[must_use]
    pub fn ack(device: DeviceId, command_id: u8) -> Self {
        Self {
            device: Some(device),
            kind: Some(EventKind::Acknowledgement),
            command_id: Some(command_id),
        }
    }

    /// Checks if an event matches this filter.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref device) = self.device {
            if event.device() != device {
                return false;
            }
        }

        if let Some(kind) = self.kind {
            if event.kind() != kind {
                return false;
            }
        }

        if let Some(expected) = self.command_id {
            if let Event::Acknowledgement { command_id, .. } = event {
                if *command_id != expected {
                    return false;
                }
            } else {
                return false;
            }
        }

        true
    }
}

type Callback = Box<dyn Fn(&Event) + Send + Sync>;

struct Listener {
    id: u64,
    filter: EventFilter,
    active: AtomicBool,
    callback: Callback,
}

struct RouterInner {
    listeners: Mutex<Vec<Arc<Listener>>>,
    next_id: AtomicU64,
    sender: broadcast::Sender<Event>,
}

impl RouterInner {
    fn remove(&self, id: u64) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|l| {
            if l.id == id {
                l.active.store(false, Ordering::SeqCst);
                false
            } else {
                true
            }
        });
        listeners.len() != before
    }
}

/// Handle returned by [`EventRouter::subscribe`].
///
/// Dropping the handle keeps the listener registered; call
/// [`ListenerHandle::unsubscribe`] to remove it.
#[derive(Clone)]
pub struct ListenerHandle {
    id: u64,
    router: Weak<RouterInner>,
}

impl ListenerHandle {
    /// Removes the listener. Safe to call from inside any listener callback,
    /// including the listener's own.
    ///
    /// Returns false if it was already removed.
    pub fn unsubscribe(&self) -> bool {
        self.router
            .upgrade()
            .is_some_and(|router| router.remove(self.id))
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle").field("id", &self.id).finish()
    }
}

/// A broadcast subscription to events.
pub struct Subscription {
    receiver: broadcast::Receiver<Event>,
    filter: EventFilter,
}

impl Subscription {
    /// Receives the next matching event.
    ///
    /// Returns `None` once the router is gone. Events dropped because this
    /// subscriber lagged are skipped.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("subscription lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Fans events out to listeners and subscriptions.
#[derive(Clone)]
pub struct EventRouter {
    inner: Arc<RouterInner>,
}

impl EventRouter {
    /// Creates a router whose broadcast channel holds `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(RouterInner {
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                sender,
            }),
        }
    }

    /// Delivers an event to every matching listener, then to subscriptions.
    pub fn publish(&self, event: Event) {
        // Snapshot so callbacks may (un)subscribe without deadlocking.
        let listeners: Vec<Arc<Listener>> = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for listener in listeners {
            if !listener.active.load(Ordering::SeqCst) || !listener.filter.matches(&event) {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| (listener.callback)(&event))).is_err() {
                tracing::warn!("listener {} panicked on {:?}", listener.id, event.kind());
            }
        }

        // No receivers is fine.
        let _ = self.inner.sender.send(event);
    }

    /// Registers a callback for events matching `filter`.
    pub fn subscribe<F>(&self, filter: EventFilter, callback: F) -> ListenerHandle
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let listener = Arc::new(Listener {
            id,
            filter,
            active: AtomicBool::new(true),
            callback: Box::new(callback),
        });
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
        tracing::trace!("listener {} registered", id);

        ListenerHandle {
            id,
            router: Arc::downgrade(&self.inner),
        }
    }

    /// Number of registered callback listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Opens a broadcast subscription.
    #[must_use]
    pub fn events(&self, filter: EventFilter) -> Subscription {
        Subscription {
            receiver: self.inner.sender.subscribe(),
            filter,
        }
    }

    /// Waits for an event matching the filter with timeout.
    ///
    /// Returns `None` if the timeout expires or the router is gone.
    pub async fn wait_for(&self, filter: EventFilter, timeout: Duration) -> Option<Event> {
        let mut subscription = self.events(filter);

        tokio::select! {
            biased;
            event = subscription.recv() => event,
            () = tokio::time::sleep(timeout) => None,
        }
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::types::TransportKind;

    fn device(addr: &str) -> DeviceId {
        DeviceId::new(TransportKind::Serial, addr)
    }

    fn raw(addr: &str, byte: u8) -> Event {
        Event::RawDataReceived {
            device: device(addr),
            bytes: Bytes::copy_from_slice(&[byte]),
        }
    }

    #[tokio::test]
    async fn test_subscription_receives() {
        let router = EventRouter::new(16);
        let mut sub = router.events(EventFilter::any());

        router.publish(raw("a", 1));

        let event = tokio::time::timeout(Duration::from_millis(100), sub.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(raw("a", 1)));
    }

    #[test]
    fn test_listeners_called_in_registration_order() {
        let router = EventRouter::new(16);
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = Arc::clone(&order);
            router.subscribe(EventFilter::any(), move |_| order.lock().unwrap().push(i));
        }
        router.publish(raw("a", 1));

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let router = EventRouter::new(16);
        let hits = Arc::new(AtomicUsize::new(0));

        router.subscribe(EventFilter::any(), |_| panic!("listener failure"));
        let counter = Arc::clone(&hits);
        router.subscribe(EventFilter::any(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        router.publish(raw("a", 1));
        router.publish(raw("a", 2));

        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe_from_inside_callback() {
        let router = EventRouter::new(16);
        let hits = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<ListenerHandle>>> = Arc::new(Mutex::new(None));

        let counter = Arc::clone(&hits);
        let own = Arc::clone(&slot);
        let handle = router.subscribe(EventFilter::any(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(handle) = own.lock().unwrap().as_ref() {
                handle.unsubscribe();
            }
        });
        *slot.lock().unwrap() = Some(handle);

        router.publish(raw("a", 1));
        router.publish(raw("a", 2));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(router.listener_count(), 0);
    }

    #[test]
    fn test_subscribe_from_inside_callback() {
        let router = EventRouter::new(16);
        let inner_hits = Arc::new(AtomicUsize::new(0));

        let nested_router = router.clone();
        let counter = Arc::clone(&inner_hits);
        router.subscribe(EventFilter::any(), move |_| {
            let counter = Arc::clone(&counter);
            nested_router.subscribe(EventFilter::any(), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        });

        router.publish(raw("a", 1));
        // The listener added during the first publish sees only later events.
        assert_eq!(inner_hits.load(Ordering::SeqCst), 0);
        router.publish(raw("a", 2));
        assert_eq!(inner_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_filter_by_device_and_kind() {
        let filter = EventFilter::device(device("a")).kind(EventKind::RawDataReceived);

        assert!(filter.matches(&raw("a", 1)));
        assert!(!filter.matches(&raw("b", 1)));
        assert!(!filter.matches(&Event::ConnectionStateChanged {
            device: device("a"),
            state: ConnectionState::Connected,
        }));
    }

    #[test]
    fn test_ack_filter() {
        let filter = EventFilter::ack(device("a"), 7);
        let ack = |id| Event::Acknowledgement {
            device: device("a"),
            command_id: id,
            success: true,
            payload: Bytes::new(),
        };

        assert!(filter.matches(&ack(7)));
        assert!(!filter.matches(&ack(8)));
        assert!(!filter.matches(&raw("a", 7)));
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let router = EventRouter::new(16);
        let result = router
            .wait_for(EventFilter::any(), Duration::from_millis(10))
            .await;
        assert!(result.is_none());
    }
}
