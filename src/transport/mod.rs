//! Transport layer: byte links to devices.
//!
//! A transport owns discovery and the connect/send/disconnect lifecycle
//! for the link kinds it handles. Several devices may be connected over
//! one transport at the same time.
//!
//! - [`serial`] - serial ports, USB CDC and Bluetooth Classic RFCOMM ports
//! - [`memory`] - in-process peers for tests and simulation
//! - `ble` - Bluetooth LE GATT (feature `ble`)

#[cfg(feature = "ble")]
pub mod ble;
pub mod memory;
pub mod serial;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::{Device, DeviceDescriptor, DeviceId, TransportKind};

/// Boxed future returned by transport operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Lazy, finite sequence of discovered peers. Dropping it cancels the scan.
pub type DiscoveryStream = Pin<Box<dyn Stream<Item = DeviceDescriptor> + Send>>;

/// Capacity of the inbound chunk channel of one link.
pub const INBOUND_CAPACITY: usize = 64;

/// Trait for transport implementations.
pub trait Transport: Send + Sync {
    /// Returns true if this transport reaches devices of the given kind.
    fn handles(&self, kind: TransportKind) -> bool;

    /// Scans for peers for at most `window`.
    fn discover(&self, window: Duration) -> DiscoveryStream;

    /// Opens a link to the device.
    ///
    /// Inbound bytes arrive on the returned receiver in arbitrary chunks;
    /// the channel closes when the link is lost.
    fn connect<'a>(&'a self, device: &'a Device) -> BoxFuture<'a, Result<mpsc::Receiver<Bytes>>>;

    /// Writes bytes to a connected device.
    fn send<'a>(&'a self, device: &'a DeviceId, data: Bytes) -> BoxFuture<'a, Result<()>>;

    /// Closes the link. Succeeds when the device is already gone.
    fn disconnect<'a>(&'a self, device: &'a DeviceId) -> BoxFuture<'a, Result<()>>;

    /// Returns true if the device has an open link.
    fn is_connected(&self, device: &DeviceId) -> bool;
}

/// Adapts a channel of descriptors into a discovery stream.
#[cfg(feature = "ble")]
pub(crate) fn channel_stream(rx: mpsc::Receiver<DeviceDescriptor>) -> DiscoveryStream {
    Box::pin(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}

pub use memory::{MemoryTransport, PeerHandle};
pub use serial::{SerialConfig, SerialTransport};
#[cfg(feature = "ble")]
pub use ble::BleTransport;
