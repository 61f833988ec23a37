//! Serial port transport.
//!
//! Covers plain serial ports, USB CDC / vendor bridges and Bluetooth
//! Classic peers bound to an RFCOMM port. One link per port path; any
//! number of ports may be open at once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialPortType, SerialStream};

use crate::error::{Error, Result};
use crate::protocol::hex_dump;
use crate::transport::{BoxFuture, DiscoveryStream, INBOUND_CAPACITY, Transport};
use crate::types::{Device, DeviceDescriptor, DeviceId, TransportKind};

/// Default baud rate.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Default connection delay.
pub const DEFAULT_CONNECTION_DELAY: Duration = Duration::from_millis(300);

/// Default time allowed for opening a port.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long stale bytes are drained after opening a port.
const DRAIN_WINDOW: Duration = Duration::from_millis(200);

/// Configuration for serial transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Baud rate.
    pub baud_rate: u32,
    /// Delay after opening before the port is used.
    pub connection_delay: Duration,
    /// Upper bound on the whole connect sequence.
    pub connect_timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialConfig {
    /// Creates a new serial configuration with default settings.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            connection_delay: DEFAULT_CONNECTION_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Sets the baud rate.
    #[must_use]
    pub const fn baud_rate(mut self, rate: u32) -> Self {
        self.baud_rate = rate;
        self
    }

    /// Sets the connection delay.
    #[must_use]
    pub const fn connection_delay(mut self, delay: Duration) -> Self {
        self.connection_delay = delay;
        self
    }

    /// Sets the connect timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

struct Link {
    writer: Arc<Mutex<WriteHalf<SerialStream>>>,
    reader: JoinHandle<()>,
}

/// Serial transport.
///
/// Each open port is split into halves: the read half is owned by a
/// background task forwarding chunks, the write half sits behind a mutex.
pub struct SerialTransport {
    config: SerialConfig,
    links: StdMutex<HashMap<DeviceId, Link>>,
}

impl SerialTransport {
    /// Creates a new serial transport with the given configuration.
    #[must_use]
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            links: StdMutex::new(HashMap::new()),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &SerialConfig {
        &self.config
    }

    fn writer(&self, device: &DeviceId) -> Option<Arc<Mutex<WriteHalf<SerialStream>>>> {
        self.links
            .lock()
            .ok()?
            .get(device)
            .map(|link| Arc::clone(&link.writer))
    }

    async fn open(&self, path: &str) -> Result<SerialStream> {
        tracing::info!("opening serial port {}", path);

        let mut stream = tokio_serial::new(path, self.config.baud_rate)
            .open_native_async()
            .map_err(|e| Error::connection(format!("{path}: {e}")))?;

        // Boards that reset on RTS stay in the bootloader otherwise.
        if let Err(e) = tokio_serial::SerialPort::write_request_to_send(&mut stream, false) {
            tracing::warn!("failed to set RTS: {}", e);
        }

        tokio::time::sleep(self.config.connection_delay).await;
        drain(&mut stream).await;
        Ok(stream)
    }

    /// Forwards inbound chunks until the port closes or the receiver is dropped.
    async fn read_loop(
        device: DeviceId,
        mut reader: ReadHalf<SerialStream>,
        tx: mpsc::Sender<Bytes>,
    ) {
        let mut buf = [0u8; 1024];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => {
                    tracing::debug!("serial port closed: {}", device);
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    tracing::error!("serial read error on {}: {}", device, e);
                    return;
                }
            };

            tracing::trace!("{} <- {}", device, hex_dump(&buf[..n]));
            if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                tracing::debug!("chunk receiver dropped: {}", device);
                return;
            }
        }
    }
}

impl Default for SerialTransport {
    fn default() -> Self {
        Self::new(SerialConfig::default())
    }
}

impl Transport for SerialTransport {
    fn handles(&self, kind: TransportKind) -> bool {
        matches!(
            kind,
            TransportKind::Serial | TransportKind::Usb | TransportKind::BluetoothClassic
        )
    }

    fn discover(&self, _window: Duration) -> DiscoveryStream {
        let ports = list_ports().unwrap_or_else(|e| {
            tracing::warn!("failed to list serial ports: {}", e);
            Vec::new()
        });
        Box::pin(futures::stream::iter(ports))
    }

    fn connect<'a>(&'a self, device: &'a Device) -> BoxFuture<'a, Result<mpsc::Receiver<Bytes>>> {
        Box::pin(async move {
            if self.is_connected(&device.id) {
                return Err(Error::connection(format!("{} already connected", device.id)));
            }

            let stream = tokio::time::timeout(self.config.connect_timeout, self.open(&device.address))
                .await
                .map_err(|_| Error::connection(format!("{}: connect timed out", device.address)))??;

            let (reader, writer) = tokio::io::split(stream);
            let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
            let reader = tokio::spawn(Self::read_loop(device.id.clone(), reader, tx));

            let link = Link {
                writer: Arc::new(Mutex::new(writer)),
                reader,
            };
            let mut links = self
                .links
                .lock()
                .map_err(|_| Error::connection("link table poisoned"))?;
            if let Some(old) = links.insert(device.id.clone(), link) {
                old.reader.abort();
            }

            tracing::info!("connected to {}", device.id);
            Ok(rx)
        })
    }

    fn send<'a>(&'a self, device: &'a DeviceId, data: Bytes) -> BoxFuture<'a, Result<()>> {
        let writer = self.writer(device);
        Box::pin(async move {
            let writer = writer.ok_or(Error::NotConnected)?;
            let mut writer = writer.lock().await;

            tracing::trace!("{} -> {}", device, hex_dump(&data));
            writer
                .write_all(&data)
                .await
                .map_err(|e| Error::transport(e.to_string()))?;
            writer
                .flush()
                .await
                .map_err(|e| Error::transport(e.to_string()))?;
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
                tracing::info!("closing serial link {}", device);
                link.reader.abort();
                let mut writer = link.writer.lock().await;
                if let Err(e) = writer.shutdown().await {
                    tracing::debug!("shutdown of {} failed: {}", device, e);
                }
            }
            Ok(())
        })
    }

    fn is_connected(&self, device: &DeviceId) -> bool {
        self.links
            .lock()
            .is_ok_and(|links| links.get(device).is_some_and(|l| !l.reader.is_finished()))
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        if let Ok(links) = self.links.get_mut() {
            for link in links.values() {
                link.reader.abort();
            }
        }
    }
}

/// Reads and discards whatever the device sent before we were ready.
async fn drain(stream: &mut SerialStream) {
    let mut buf = [0u8; 1024];
    let mut total_drained = 0usize;

    let deadline = tokio::time::Instant::now() + DRAIN_WINDOW;
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(20), stream.read(&mut buf)).await {
            Ok(Ok(n)) if n > 0 => total_drained += n,
            _ => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    }

    if total_drained > 0 {
        tracing::debug!("drained {} stale bytes from buffer", total_drained);
    }
}

/// Lists available serial ports as discovery descriptors.
///
/// # Errors
///
/// Returns an error if the port list cannot be retrieved.
pub fn list_ports() -> Result<Vec<DeviceDescriptor>> {
    let ports = tokio_serial::available_ports().map_err(Error::Serial)?;
    Ok(ports
        .into_iter()
        .map(|p| describe_port(p.port_name, p.port_type))
        .collect())
}

fn describe_port(path: String, port_type: SerialPortType) -> DeviceDescriptor {
    match port_type {
        SerialPortType::UsbPort(info) => {
            let descriptor =
                DeviceDescriptor::new(TransportKind::Usb, path).usb(info.vid, info.pid);
            match info.product {
                Some(product) => descriptor.name(product),
                None => descriptor,
            }
        }
        SerialPortType::BluetoothPort => {
            let name = bluetooth_port_name(&path);
            DeviceDescriptor::new(TransportKind::BluetoothClassic, path).name(name)
        }
        SerialPortType::PciPort | SerialPortType::Unknown => {
            DeviceDescriptor::new(TransportKind::Serial, path)
        }
    }
}

/// Derives a peer name from an RFCOMM port path, e.g. `/dev/tty.EV3-SerialPort`.
fn bluetooth_port_name(path: &str) -> String {
    let file = path.rsplit(['/', '\\']).next().unwrap_or(path);
    let file = file
        .strip_prefix("tty.")
        .or_else(|| file.strip_prefix("cu."))
        .unwrap_or(file);
    file.strip_suffix("-SerialPort").unwrap_or(file).to_owned()
}
