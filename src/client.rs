//! Main [`Hub`] implementation.
//!
//! The hub is the session object of the device layer: it owns the
//! registry, the event router, the command dispatcher and the transports,
//! and keeps a table of every device it has seen.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::task::JoinHandle;

use crate::config::HubConfig;
use crate::dispatcher::CommandDispatcher;
use crate::error::{Error, Result};
use crate::event::{Event, EventFilter, EventKind, EventRouter, ListenerHandle, Subscription};
use crate::protocol::{Params, codec_for};
use crate::registry::Registry;
use crate::transport::{SerialTransport, Transport};
use crate::types::{ConnectionState, Device, DeviceDescriptor, DeviceId};

type DeviceTable = Arc<RwLock<HashMap<DeviceId, Device>>>;

/// Connects to robots and routes their traffic.
pub struct Hub {
    config: HubConfig,
    registry: Arc<Registry>,
    router: EventRouter,
    dispatcher: Arc<CommandDispatcher>,
    transports: Vec<Arc<dyn Transport>>,
    devices: DeviceTable,
    state_listener: ListenerHandle,
}

impl Hub {
    /// Creates a hub without transports.
    #[must_use]
    pub fn new(config: HubConfig) -> Self {
        let router = EventRouter::new(config.event_capacity);
        let dispatcher = Arc::new(CommandDispatcher::new(router.clone(), config.default_timeout));
        let registry = Arc::new(Registry::with_extras(config.registry.clone()));
        let devices: DeviceTable = Arc::new(RwLock::new(HashMap::new()));

        // Mirror session state into the device table.
        let table = Arc::clone(&devices);
        let state_listener = router.subscribe(
            EventFilter::any().kind(EventKind::ConnectionStateChanged),
            move |event| {
                if let Event::ConnectionStateChanged { device, state } = event {
                    if let Some(entry) = table.write().ok().as_mut().and_then(|t| t.get_mut(device)) {
                        entry.state = *state;
                    }
                }
            },
        );

        Self {
            config,
            registry,
            router,
            dispatcher,
            transports: Vec::new(),
            devices,
            state_listener,
        }
    }

    /// Creates a hub with a serial transport built from the configuration.
    #[must_use]
    pub fn serial(config: HubConfig) -> Self {
        let serial = SerialTransport::new(config.serial_config());
        Self::new(config).with_transport(Arc::new(serial))
    }

    /// Adds a transport. Earlier transports win when several handle a kind.
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.push(transport);
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Returns the device registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Returns the event router.
    #[must_use]
    pub const fn router(&self) -> &EventRouter {
        &self.router
    }

    // ==================== Discovery ====================

    /// Scans all transports for the configured scan window.
    pub fn discover(&self) -> Pin<Box<dyn Stream<Item = Device> + Send>> {
        self.discover_for(self.config.scan_window)
    }

    /// Scans all transports for at most `window`.
    ///
    /// Devices are labelled by the registry and added to the device table
    /// as they are found. Dropping the stream cancels the scan.
    pub fn discover_for(&self, window: Duration) -> Pin<Box<dyn Stream<Item = Device> + Send>> {
        tracing::info!("scanning {} transports", self.transports.len());
        let scans = self.transports.iter().map(|t| t.discover(window));
        let registry = Arc::clone(&self.registry);
        let devices = Arc::clone(&self.devices);

        Box::pin(futures::stream::select_all(scans).map(move |descriptor| {
            let found = registry.device(&descriptor);
            tracing::debug!("found {} ({})", found.id, found.family);
            remember(&devices, found)
        }))
    }

    /// Adds a device the caller already knows about, e.g. a fixed port path.
    pub fn register(&self, descriptor: &DeviceDescriptor) -> Device {
        remember(&self.devices, self.registry.device(descriptor))
    }

    /// Returns a snapshot of every known device.
    #[must_use]
    pub fn devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self
            .devices
            .read()
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    /// Returns a known device.
    #[must_use]
    pub fn device(&self, id: &DeviceId) -> Option<Device> {
        self.devices.read().ok()?.get(id).cloned()
    }

    // ==================== Connection Lifecycle ====================

    /// Connects to a known device and starts its session.
    ///
    /// Other connected devices, on the same transport or not, are not
    /// affected.
    ///
    /// # Errors
    ///
    /// - [`Error::Connection`] if the device is unknown, already connected,
    ///   refuses or does not answer within the connect timeout
    /// - [`Error::UnsupportedTransport`] if no transport handles its kind
    pub async fn connect(&self, id: &DeviceId) -> Result<Device> {
        let device = self
            .device(id)
            .ok_or_else(|| Error::connection(format!("unknown device {id}")))?;
        if self.dispatcher.state(id).is_some_and(ConnectionState::is_connected) {
            return Err(Error::connection(format!("{id} already connected")));
        }
        let transport = self.transport_for(&device)?;

        tracing::info!("connecting to {} ({})", id, device.family);
        self.publish_state(id, ConnectionState::Connecting);

        let opened = tokio::time::timeout(self.config.connect_timeout, transport.connect(&device))
            .await
            .unwrap_or_else(|_| Err(Error::connection(format!("{id}: connect timed out"))));
        let inbound = match opened {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::warn!("could not connect to {}: {}", id, e);
                self.publish_state(id, ConnectionState::Error);
                return Err(e);
            }
        };

        self.dispatcher
            .attach(&device, codec_for(device.family), transport, inbound);
        tracing::info!("connected to {}", id);
        Ok(self.device(id).unwrap_or(device))
    }

    /// Disconnects a device.
    ///
    /// Always succeeds locally; a command in flight fails with
    /// [`Error::NotConnected`].
    pub async fn disconnect(&self, id: &DeviceId) -> Result<()> {
        let transport = match self.dispatcher.detach(id) {
            Some(transport) => Some(transport),
            None => self.device(id).and_then(|d| self.transport_for(&d).ok()),
        };
        if let Some(transport) = transport {
            if let Err(e) = transport.disconnect(id).await {
                tracing::debug!("transport disconnect of {} failed: {}", id, e);
            }
        }
        if let Some(entry) = self.devices.write().ok().as_mut().and_then(|t| t.get_mut(id)) {
            entry.state = ConnectionState::Disconnected;
        }
        tracing::info!("disconnected {}", id);
        Ok(())
    }

    /// Returns true if the device has a connected session.
    #[must_use]
    pub fn is_connected(&self, id: &DeviceId) -> bool {
        self.dispatcher
            .state(id)
            .is_some_and(ConnectionState::is_connected)
    }

    fn transport_for(&self, device: &Device) -> Result<Arc<dyn Transport>> {
        self.transports
            .iter()
            .find(|t| t.handles(device.transport))
            .cloned()
            .ok_or(Error::UnsupportedTransport(device.transport))
    }

    fn publish_state(&self, id: &DeviceId, state: ConnectionState) {
        self.router.publish(Event::ConnectionStateChanged {
            device: id.clone(),
            state,
        });
    }

    // ==================== Commands ====================

    /// Runs a command and waits for the reply payload.
    ///
    /// `timeout` defaults to the configured reply timeout.
    pub async fn execute(
        &self,
        id: &DeviceId,
        command: &str,
        params: &Params,
        timeout: Option<Duration>,
    ) -> Result<Bytes> {
        self.dispatcher.execute(id, command, params, timeout).await
    }

    /// Writes a command without waiting for its reply.
    pub async fn fire_and_forget(&self, id: &DeviceId, command: &str, params: &Params) -> Result<()> {
        self.dispatcher.fire_and_forget(id, command, params).await
    }

    /// Issues a read command every `interval` until the handle is dropped
    /// or the device disconnects. Readings arrive as events.
    ///
    /// # Errors
    ///
    /// Fails if the device is not connected or has no such command.
    pub fn poll(
        &self,
        id: &DeviceId,
        command: &str,
        params: Params,
        interval: Duration,
    ) -> Result<PollHandle> {
        let codec = self.dispatcher.codec(id).ok_or(Error::NotConnected)?;
        let command = codec
            .command(command)
            .ok_or_else(|| Error::UnknownCommand {
                name: command.to_owned(),
            })?
            .name;

        let dispatcher = Arc::clone(&self.dispatcher);
        let id = id.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match dispatcher.fire_and_forget(&id, command, &params).await {
                    Ok(()) => {}
                    Err(Error::NotConnected) => {
                        tracing::debug!("stopped polling {} on {}", command, id);
                        return;
                    }
                    Err(e) => tracing::warn!("poll of {} on {} failed: {}", command, id, e),
                }
            }
        });
        Ok(PollHandle { task })
    }

    // ==================== Events ====================

    /// Registers a callback for matching events.
    pub fn subscribe<F>(&self, filter: EventFilter, callback: F) -> ListenerHandle
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.router.subscribe(filter, callback)
    }

    /// Opens a broadcast subscription.
    #[must_use]
    pub fn events(&self, filter: EventFilter) -> Subscription {
        self.router.events(filter)
    }

    /// Waits for one matching event.
    pub async fn wait_for(&self, filter: EventFilter, timeout: Duration) -> Option<Event> {
        self.router.wait_for(filter, timeout).await
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.state_listener.unsubscribe();
    }
}

/// Inserts or refreshes a device, keeping the state of a known one.
fn remember(devices: &DeviceTable, mut found: Device) -> Device {
    if let Ok(mut table) = devices.write() {
        if let Some(known) = table.get(&found.id) {
            found.state = known.state;
        }
        table.insert(found.id.clone(), found.clone());
    }
    found
}

/// Running sensor poll. Dropping it stops the poll.
#[derive(Debug)]
pub struct PollHandle {
    task: JoinHandle<()>,
}

impl PollHandle {
    /// Returns true once the poll has stopped on its own.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use crate::types::{DeviceFamily, TransportKind};

    fn hub_with_peer() -> (Hub, crate::transport::PeerHandle) {
        let transport = MemoryTransport::new(TransportKind::Usb);
        let peer = transport.add_peer(
            DeviceDescriptor::new(TransportKind::Usb, "/dev/ttyACM0").usb(0x2341, 0x0043),
        );
        let hub = Hub::new(HubConfig::default()).with_transport(Arc::new(transport));
        (hub, peer)
    }

    #[tokio::test]
    async fn test_discover_labels_devices() {
        let (hub, _peer) = hub_with_peer();
        let found: Vec<Device> = hub.discover_for(Duration::from_millis(10)).collect().await;

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].family, DeviceFamily::Arduino);
        assert_eq!(hub.devices().len(), 1);
    }

    #[tokio::test]
    async fn test_connect_tracks_state() {
        let (hub, peer) = hub_with_peer();
        let id = peer.id().clone();
        hub.discover_for(Duration::from_millis(10)).collect::<Vec<_>>().await;

        let device = hub.connect(&id).await.unwrap();
        assert_eq!(device.state, ConnectionState::Connected);
        assert!(hub.is_connected(&id));
        assert!(matches!(hub.connect(&id).await, Err(Error::Connection { .. })));

        hub.disconnect(&id).await.unwrap();
        hub.disconnect(&id).await.unwrap();
        assert_eq!(hub.device(&id).map(|d| d.state), Some(ConnectionState::Disconnected));
        assert!(!peer.is_connected());
    }

    #[tokio::test]
    async fn test_refused_connect_reports_error_state() {
        let (hub, peer) = hub_with_peer();
        let id = peer.id().clone();
        hub.register(&DeviceDescriptor::new(TransportKind::Usb, "/dev/ttyACM0"));
        peer.refuse_connections(true);

        let mut states = hub.events(EventFilter::device(id.clone()));
        assert!(matches!(hub.connect(&id).await, Err(Error::Connection { .. })));
        assert!(matches!(
            states.recv().await,
            Some(Event::ConnectionStateChanged { state: ConnectionState::Connecting, .. })
        ));
        assert!(matches!(
            states.recv().await,
            Some(Event::ConnectionStateChanged { state: ConnectionState::Error, .. })
        ));
        assert_eq!(hub.device(&id).map(|d| d.state), Some(ConnectionState::Error));
    }

    #[tokio::test]
    async fn test_unsupported_transport() {
        let hub = Hub::new(HubConfig::default());
        let device = hub.register(&DeviceDescriptor::new(TransportKind::BluetoothLe, "aa:bb"));
        assert!(matches!(
            hub.connect(&device.id).await,
            Err(Error::UnsupportedTransport(TransportKind::BluetoothLe))
        ));
    }

    #[tokio::test]
    async fn test_terminal_line_events() {
        let (hub, mut peer) = hub_with_peer();
        let id = peer.id().clone();
        hub.discover_for(Duration::from_millis(10)).collect::<Vec<_>>().await;
        hub.connect(&id).await.unwrap();

        let mut raw = hub.events(EventFilter::device(id.clone()).kind(EventKind::RawDataReceived));
        hub.execute(&id, "send_line", &Params::new().with("text", "LED ON"), None)
            .await
            .unwrap();
        assert_eq!(&peer.next_write().await.unwrap()[..], b"LED ON\n");

        peer.push(&b"ok\r\n"[..]).await.unwrap();
        assert!(matches!(
            raw.recv().await,
            Some(Event::RawDataReceived { bytes, .. }) if &bytes[..] == b"ok"
        ));
    }
}
