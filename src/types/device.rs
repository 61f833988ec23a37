//! Device identity and lifecycle types.

use std::fmt;

use serde::Deserialize;
use uuid::Uuid;

use crate::registry::GattProfile;

/// Physical link a device is reached over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Bluetooth Classic (RFCOMM / serial port profile).
    BluetoothClassic,
    /// Bluetooth Low Energy (GATT characteristics).
    BluetoothLe,
    /// USB (CDC-ACM or vendor serial bridge).
    Usb,
    /// Plain serial port.
    Serial,
}

impl TransportKind {
    /// Short lowercase label used in device identifiers.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BluetoothClassic => "bt",
            Self::BluetoothLe => "ble",
            Self::Usb => "usb",
            Self::Serial => "serial",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection state of a device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// The link failed; the device must be reconnected explicitly.
    Error,
}

impl ConnectionState {
    /// Returns true if commands may be written.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Hardware family a device belongs to.
///
/// The family selects the frame codec and the default GATT profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceFamily {
    /// LEGO Mindstorms EV3 brick.
    Ev3,
    /// Sphero 2.0 / SPRK over Bluetooth Classic.
    Sphero,
    /// BB-8 and SPRK+ (Sphero over Bluetooth LE).
    SpheroBle,
    /// Makeblock mBot.
    #[serde(rename = "mbot")]
    MBot,
    /// Arduino compatible boards.
    Arduino,
    /// Raspberry Pi (serial console or Pico).
    RaspberryPi,
    /// Google AIY kit over USB gadget serial.
    Aiy,
    #[default]
    Unknown,
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ev3 => "EV3",
            Self::Sphero => "Sphero",
            Self::SpheroBle => "Sphero BLE",
            Self::MBot => "mBot",
            Self::Arduino => "Arduino",
            Self::RaspberryPi => "Raspberry Pi",
            Self::Aiy => "AIY",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Stable identifier of a device: `<transport>:<address>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    /// Builds the identifier for an address on a transport.
    #[must_use]
    pub fn new(kind: TransportKind, address: &str) -> Self {
        Self(format!("{kind}:{address}"))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// USB vendor/product pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsbId {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl UsbId {
    #[must_use]
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }
}

impl fmt::Display for UsbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

/// What a transport learned about a peer during discovery.
///
/// Fed to the registry to pick a [`DeviceFamily`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceDescriptor {
    /// Transport the peer was found on.
    pub kind: Option<TransportKind>,
    /// Port path, Bluetooth address or platform peripheral id.
    pub address: String,
    /// Advertised or product name.
    pub name: Option<String>,
    /// USB vendor/product ids.
    pub usb: Option<UsbId>,
    /// Bluetooth Classic class-of-device bits.
    pub device_class: Option<u32>,
    /// Advertised service UUIDs (SDP or GATT).
    pub services: Vec<Uuid>,
}

impl DeviceDescriptor {
    /// Creates a descriptor for an address on a transport.
    #[must_use]
    pub fn new(kind: TransportKind, address: impl Into<String>) -> Self {
        Self {
            kind: Some(kind),
            address: address.into(),
            ..Self::default()
        }
    }

    /// Sets the advertised name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the USB vendor/product ids.
    #[must_use]
    pub const fn usb(mut self, vendor_id: u16, product_id: u16) -> Self {
        self.usb = Some(UsbId::new(vendor_id, product_id));
        self
    }

    /// Sets the Bluetooth class-of-device.
    #[must_use]
    pub const fn device_class(mut self, class: u32) -> Self {
        self.device_class = Some(class);
        self
    }

    /// Adds an advertised service UUID.
    #[must_use]
    pub fn service(mut self, uuid: Uuid) -> Self {
        self.services.push(uuid);
        self
    }

    /// Returns the transport kind, defaulting to serial.
    #[must_use]
    pub fn transport(&self) -> TransportKind {
        self.kind.unwrap_or(TransportKind::Serial)
    }
}

/// A connection handle to a physical or virtual peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: DeviceId,
    pub transport: TransportKind,
    pub address: String,
    pub name: String,
    pub family: DeviceFamily,
    pub state: ConnectionState,
    /// GATT layout for Bluetooth LE peers.
    pub gatt: Option<GattProfile>,
}

impl Device {
    /// Creates a disconnected device from a discovery descriptor.
    #[must_use]
    pub fn from_descriptor(descriptor: &DeviceDescriptor, family: DeviceFamily) -> Self {
        let transport = descriptor.transport();
        let name = descriptor
            .name
            .clone()
            .unwrap_or_else(|| format!("{family} ({})", descriptor.address));
        Self {
            id: DeviceId::new(transport, &descriptor.address),
            transport,
            address: descriptor.address.clone(),
            name,
            family,
            state: ConnectionState::Disconnected,
            gatt: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_format() {
        let id = DeviceId::new(TransportKind::Serial, "/dev/ttyUSB0");
        assert_eq!(id.as_str(), "serial:/dev/ttyUSB0");
        assert_eq!(
            DeviceId::new(TransportKind::BluetoothLe, "AA:BB").to_string(),
            "ble:AA:BB"
        );
    }

    #[test]
    fn test_device_from_descriptor() {
        let descriptor = DeviceDescriptor::new(TransportKind::Usb, "/dev/ttyACM0").usb(0x2341, 0x0043);
        let device = Device::from_descriptor(&descriptor, DeviceFamily::Arduino);

        assert_eq!(device.state, ConnectionState::Disconnected);
        assert_eq!(device.transport, TransportKind::Usb);
        assert_eq!(device.name, "Arduino (/dev/ttyACM0)");
        assert_eq!(descriptor.usb.map(|id| id.to_string()).as_deref(), Some("2341:0043"));
    }

    #[test]
    fn test_connection_state() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Error.is_connected());
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }
}
