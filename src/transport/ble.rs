//! Bluetooth LE transport over GATT characteristics.
//!
//! Commands are written to the profile's write characteristic in chunks
//! of at most [`BLE_MTU`] bytes; notifications on the notify
//! characteristic are forwarded as inbound chunks.

use std::collections::HashMap;
use std::sync::{Mutex as StdMutex, PoisonError};
use std::time::Duration;

use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::hex_dump;
use crate::registry::GattProfile;
use crate::transport::{
    BoxFuture, DiscoveryStream, INBOUND_CAPACITY, Transport, channel_stream,
};
use crate::types::{Device, DeviceDescriptor, DeviceId, TransportKind};

/// Largest payload written in one characteristic write.
pub const BLE_MTU: usize = 20;

fn ble_error(e: &btleplug::Error) -> Error {
    Error::connection(e.to_string())
}

struct Link {
    peripheral: Peripheral,
    write: Characteristic,
    forward: JoinHandle<()>,
}

/// GATT transport backed by the first system Bluetooth adapter.
pub struct BleTransport {
    adapter: Adapter,
    links: StdMutex<HashMap<DeviceId, Link>>,
}

impl BleTransport {
    /// Opens the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if no adapter is available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await.map_err(|e| ble_error(&e))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| ble_error(&e))?
            .into_iter()
            .next()
            .ok_or_else(|| Error::connection("no bluetooth adapter found"))?;
        Ok(Self {
            adapter,
            links: StdMutex::new(HashMap::new()),
        })
    }

    async fn find(&self, address: &str) -> Result<Peripheral> {
        self.adapter
            .peripherals()
            .await
            .map_err(|e| ble_error(&e))?
            .into_iter()
            .find(|p| p.id().to_string() == address)
            .ok_or_else(|| Error::connection(format!("peripheral {address} not found")))
    }

    /// Connects, runs the wake sequence and subscribes to notifications.
    ///
    /// A peripheral that fails any step after the link is up is
    /// disconnected before the error is returned.
    async fn open(&self, device: &Device, profile: &GattProfile) -> Result<(Peripheral, Characteristic)> {
        let peripheral = self.find(&device.address).await?;
        peripheral.connect().await.map_err(|e| ble_error(&e))?;
        match setup(&peripheral, profile).await {
            Ok(write) => Ok((peripheral, write)),
            Err(e) => {
                release(&peripheral, &device.id).await;
                Err(e)
            }
        }
    }
}

async fn setup(peripheral: &Peripheral, profile: &GattProfile) -> Result<Characteristic> {
    peripheral
        .discover_services()
        .await
        .map_err(|e| ble_error(&e))?;

    let characteristics = peripheral.characteristics();
    let lookup = |service: Uuid, uuid: Uuid| {
        characteristics
            .iter()
            .find(|c| c.service_uuid == service && c.uuid == uuid)
            .cloned()
            .ok_or_else(|| Error::connection(format!("characteristic {uuid} missing")))
    };

    for step in profile.wake.iter() {
        let characteristic = lookup(step.service, step.characteristic)?;
        peripheral
            .write(&characteristic, &step.value, WriteType::WithResponse)
            .await
            .map_err(|e| ble_error(&e))?;
    }

    let write = lookup(profile.service, profile.write)?;
    let notify = lookup(profile.service, profile.notify)?;
    peripheral
        .subscribe(&notify)
        .await
        .map_err(|e| ble_error(&e))?;
    Ok(write)
}

async fn release(peripheral: &Peripheral, device: &DeviceId) {
    if let Err(e) = peripheral.disconnect().await {
        tracing::debug!("ble disconnect of {} failed: {}", device, e);
    }
}

impl Transport for BleTransport {
    fn handles(&self, kind: TransportKind) -> bool {
        kind == TransportKind::BluetoothLe
    }

    fn discover(&self, window: Duration) -> DiscoveryStream {
        let adapter = self.adapter.clone();
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            let scan = async {
                let mut events = adapter.events().await?;
                adapter.start_scan(ScanFilter::default()).await?;
                while let Some(event) = events.next().await {
                    let CentralEvent::DeviceDiscovered(id) = event else {
                        continue;
                    };
                    let peripheral = adapter.peripheral(&id).await?;
                    let mut descriptor =
                        DeviceDescriptor::new(TransportKind::BluetoothLe, id.to_string());
                    if let Some(props) = peripheral.properties().await? {
                        descriptor.name = props.local_name;
                        descriptor.services = props.services;
                    }
                    if tx.send(descriptor).await.is_err() {
                        break;
                    }
                }
                Ok::<_, btleplug::Error>(())
            };

            match tokio::time::timeout(window, scan).await {
                Ok(Err(e)) => tracing::warn!("ble scan failed: {}", e),
                Ok(Ok(())) | Err(_) => tracing::debug!("ble scan finished"),
            }
            if let Err(e) = adapter.stop_scan().await {
                tracing::debug!("stop scan failed: {}", e);
            }
        });

        channel_stream(rx)
    }

    fn connect<'a>(&'a self, device: &'a Device) -> BoxFuture<'a, Result<mpsc::Receiver<Bytes>>> {
        Box::pin(async move {
            if self.is_connected(&device.id) {
                return Err(Error::connection(format!("{} already connected", device.id)));
            }
            let profile = device
                .gatt
                .as_ref()
                .ok_or_else(|| Error::connection(format!("no gatt profile for {}", device.id)))?;

            tracing::info!("connecting to {} over ble", device.id);
            let (peripheral, write) = self.open(device, profile).await?;

            let mut notifications = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    release(&peripheral, &device.id).await;
                    return Err(ble_error(&e));
                }
            };
            let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
            let notify = profile.notify;
            let id = device.id.clone();
            let forward = tokio::spawn(async move {
                while let Some(n) = notifications.next().await {
                    if n.uuid != notify {
                        continue;
                    }
                    tracing::trace!("{} <- {}", id, hex_dump(&n.value));
                    if tx.send(Bytes::from(n.value)).await.is_err() {
                        return;
                    }
                }
                tracing::debug!("notification stream ended: {}", id);
            });
            let link = Link {
                peripheral,
                write,
                forward,
            };

            let old = self
                .links
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(device.id.clone(), link);
            if let Some(old) = old {
                old.forward.abort();
            }
            Ok(rx)
        })
    }

    fn send<'a>(&'a self, device: &'a DeviceId, data: Bytes) -> BoxFuture<'a, Result<()>> {
        let target = self.links.lock().ok().and_then(|links| {
            links
                .get(device)
                .map(|link| (link.peripheral.clone(), link.write.clone()))
        });
        Box::pin(async move {
            let (peripheral, characteristic) = target.ok_or(Error::NotConnected)?;
            tracing::trace!("{} -> {}", device, hex_dump(&data));
            for chunk in data.chunks(BLE_MTU) {
                peripheral
                    .write(&characteristic, chunk, WriteType::WithoutResponse)
                    .await
                    .map_err(|e| Error::transport(e.to_string()))?;
            }
            Ok(())
        })
    }

    fn disconnect<'a>(&'a self, device: &'a DeviceId) -> BoxFuture<'a, Result<()>> {
        let link = self
            .links
            .lock()
            .ok()
            .and_then(|mut links| links.remove(device));
        Box::pin(async move {
            if let Some(link) = link {
                link.forward.abort();
                release(&link.peripheral, device).await;
            }
            Ok(())
        })
    }

    fn is_connected(&self, device: &DeviceId) -> bool {
        self.links
            .lock()
            .is_ok_and(|links| links.get(device).is_some_and(|l| !l.forward.is_finished()))
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        if let Ok(links) = self.links.get_mut() {
            for link in links.values() {
                link.forward.abort();
            }
        }
    }
}
