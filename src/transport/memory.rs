//! In-process transport.
//!
//! Each registered peer is driven from a [`PeerHandle`]: the handle sees
//! every write the host makes and can push bytes back as if the device
//! had sent them. Used by tests and by simulators standing in for real
//! hardware.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::transport::{BoxFuture, DiscoveryStream, INBOUND_CAPACITY, Transport};
use crate::types::{Device, DeviceDescriptor, DeviceId, TransportKind};

struct Peer {
    descriptor: DeviceDescriptor,
    refuse: bool,
    /// Host-side inbound channel while connected.
    inbound: Option<mpsc::Sender<Bytes>>,
    /// Writes from the host, read by the handle.
    writes: mpsc::UnboundedSender<Bytes>,
}

type Peers = Arc<Mutex<HashMap<DeviceId, Peer>>>;

/// Transport whose peers live in the same process.
#[derive(Clone)]
pub struct MemoryTransport {
    kind: TransportKind,
    peers: Peers,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new(TransportKind::Serial)
    }
}

impl MemoryTransport {
    /// Creates a transport that answers for devices of `kind`.
    #[must_use]
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            peers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Registers a peer and returns the handle that plays its part.
    ///
    /// The descriptor's transport kind is replaced by this transport's.
    pub fn add_peer(&self, mut descriptor: DeviceDescriptor) -> PeerHandle {
        descriptor.kind = Some(self.kind);
        let id = DeviceId::new(self.kind, &descriptor.address);
        let (writes, rx) = mpsc::unbounded_channel();

        if let Ok(mut peers) = self.peers.lock() {
            peers.insert(
                id.clone(),
                Peer {
                    descriptor,
                    refuse: false,
                    inbound: None,
                    writes,
                },
            );
        }

        PeerHandle {
            id,
            peers: Arc::clone(&self.peers),
            writes: rx,
        }
    }

    fn with_peer<T>(&self, device: &DeviceId, f: impl FnOnce(&mut Peer) -> T) -> Option<T> {
        let mut peers = self.peers.lock().ok()?;
        peers.get_mut(device).map(f)
    }
}

impl Transport for MemoryTransport {
    fn handles(&self, kind: TransportKind) -> bool {
        kind == self.kind
    }

    fn discover(&self, _window: Duration) -> DiscoveryStream {
        let found: Vec<DeviceDescriptor> = self
            .peers
            .lock()
            .map(|peers| peers.values().map(|p| p.descriptor.clone()).collect())
            .unwrap_or_default();
        Box::pin(futures::stream::iter(found))
    }

    fn connect<'a>(&'a self, device: &'a Device) -> BoxFuture<'a, Result<mpsc::Receiver<Bytes>>> {
        let result = self
            .with_peer(&device.id, |peer| {
                if peer.refuse {
                    return Err(Error::connection(format!("{} refused connection", device.id)));
                }
                if peer.inbound.as_ref().is_some_and(|tx| !tx.is_closed()) {
                    return Err(Error::connection(format!("{} already connected", device.id)));
                }
                let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
                peer.inbound = Some(tx);
                Ok(rx)
            })
            .unwrap_or_else(|| Err(Error::connection(format!("no peer at {}", device.address))));
        Box::pin(async move { result })
    }

    fn send<'a>(&'a self, device: &'a DeviceId, data: Bytes) -> BoxFuture<'a, Result<()>> {
        let result = self
            .with_peer(device, |peer| {
                if peer.inbound.is_none() {
                    return Err(Error::NotConnected);
                }
                peer.writes
                    .send(data)
                    .map_err(|_| Error::transport("peer handle dropped"))
            })
            .unwrap_or(Err(Error::NotConnected));
        Box::pin(async move { result })
    }

    fn disconnect<'a>(&'a self, device: &'a DeviceId) -> BoxFuture<'a, Result<()>> {
        self.with_peer(device, |peer| peer.inbound = None);
        Box::pin(async { Ok(()) })
    }

    fn is_connected(&self, device: &DeviceId) -> bool {
        self.with_peer(device, |peer| peer.inbound.is_some())
            .unwrap_or(false)
    }
}

/// Device side of an in-process peer.
pub struct PeerHandle {
    id: DeviceId,
    peers: Peers,
    writes: mpsc::UnboundedReceiver<Bytes>,
}

impl PeerHandle {
    /// Identifier the host will use for this peer.
    #[must_use]
    pub const fn id(&self) -> &DeviceId {
        &self.id
    }

    /// Waits for the next write from the host.
    pub async fn next_write(&mut self) -> Option<Bytes> {
        self.writes.recv().await
    }

    /// Returns a write that has already arrived, if any.
    pub fn try_next_write(&mut self) -> Option<Bytes> {
        self.writes.try_recv().ok()
    }

    /// Delivers bytes to the host as if the device had sent them.
    pub async fn push(&self, bytes: impl Into<Bytes>) -> Result<()> {
        let tx = self.inbound().ok_or(Error::NotConnected)?;
        tx.send(bytes.into())
            .await
            .map_err(|_| Error::transport("host stopped reading"))
    }

    /// Makes future connection attempts fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.update(|peer| peer.refuse = refuse);
    }

    /// Drops the link from the device side, as if it went out of range.
    pub fn drop_link(&self) {
        self.update(|peer| peer.inbound = None);
    }

    /// Returns true while the host holds a link to this peer.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inbound().is_some()
    }

    fn inbound(&self) -> Option<mpsc::Sender<Bytes>> {
        let peers = self.peers.lock().ok()?;
        peers.get(&self.id)?.inbound.clone()
    }

    fn update(&self, f: impl FnOnce(&mut Peer)) {
        if let Ok(mut peers) = self.peers.lock() {
            if let Some(peer) = peers.get_mut(&self.id) {
                f(peer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn setup() -> (MemoryTransport, PeerHandle, Device) {
        let transport = MemoryTransport::new(TransportKind::Usb);
        let descriptor = DeviceDescriptor::new(TransportKind::Usb, "sim0").usb(0x2341, 0x0043);
        let peer = transport.add_peer(descriptor.clone());
        let device = Device::from_descriptor(&descriptor, crate::types::DeviceFamily::Arduino);
        (transport, peer, device)
    }

    #[tokio::test]
    async fn test_round_trip_bytes() {
        let (transport, mut peer, device) = setup();
        let mut rx = transport.connect(&device).await.unwrap();

        transport.send(&device.id, Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(peer.next_write().await.unwrap(), Bytes::from_static(b"ping"));

        peer.push(&b"pong"[..]).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"pong"));
    }

    #[tokio::test]
    async fn test_refused_and_duplicate_connect() {
        let (transport, peer, device) = setup();
        peer.refuse_connections(true);
        assert!(matches!(transport.connect(&device).await, Err(Error::Connection { .. })));

        peer.refuse_connections(false);
        let _rx = transport.connect(&device).await.unwrap();
        assert!(matches!(transport.connect(&device).await, Err(Error::Connection { .. })));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_closes_channel() {
        let (transport, peer, device) = setup();
        let mut rx = transport.connect(&device).await.unwrap();

        transport.disconnect(&device.id).await.unwrap();
        transport.disconnect(&device.id).await.unwrap();
        assert!(!peer.is_connected());
        assert!(rx.recv().await.is_none());
        assert!(matches!(
            transport.send(&device.id, Bytes::new()).await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_discover_lists_peers() {
        let (transport, _peer, _device) = setup();
        let found: Vec<_> = transport.discover(Duration::from_millis(10)).collect().await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].usb.map(|id| id.product_id), Some(0x0043));
    }
}
