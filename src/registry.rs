//! Device registry: static tables that label discovered peers.
//!
//! Lookup order is USB ids, Bluetooth Classic class/name, then BLE
//! service UUIDs or name prefixes. Entries from configuration are
//! appended when the registry is built and never change afterwards.

use std::borrow::Cow;

use serde::Deserialize;
use uuid::Uuid;

use crate::types::{Device, DeviceDescriptor, DeviceFamily, TransportKind};

/// Serial Port Profile UUID used by RFCOMM peers.
pub const SERIAL_PORT_PROFILE: Uuid = Uuid::from_u128(0x0000_1101_0000_1000_8000_0080_5f9b_34fb);

/// Major and minor device class bits of a class-of-device value.
const CLASS_MASK: u32 = 0x1FFC;

/// A characteristic write performed after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GattWrite {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub value: Cow<'static, [u8]>,
}

/// GATT layout of a BLE peer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GattProfile {
    /// Service that carries the command and response characteristics.
    pub service: Uuid,
    /// Characteristic commands are written to.
    pub write: Uuid,
    /// Characteristic whose notifications carry inbound bytes.
    pub notify: Uuid,
    /// Writes needed to wake the peer before it accepts commands.
    #[serde(default)]
    pub wake: Cow<'static, [GattWrite]>,
}

mod sphero_ble {
    use uuid::Uuid;

    pub const ROBOT_CONTROL: Uuid = Uuid::from_u128(0x22bb_746f_2ba0_7554_2d6f_7265_6870_5327);
    pub const COMMANDS: Uuid = Uuid::from_u128(0x22bb_746f_2ba1_7554_2d6f_7265_6870_5327);
    pub const RESPONSE: Uuid = Uuid::from_u128(0x22bb_746f_2ba6_7554_2d6f_7265_6870_5327);
    pub const BLE_SERVICE: Uuid = Uuid::from_u128(0x22bb_746f_2bb0_7554_2d6f_7265_6870_5327);
    pub const ANTI_DOS: Uuid = Uuid::from_u128(0x22bb_746f_2bbd_7554_2d6f_7265_6870_5327);
    pub const TX_POWER: Uuid = Uuid::from_u128(0x22bb_746f_2bb2_7554_2d6f_7265_6870_5327);
    pub const WAKE: Uuid = Uuid::from_u128(0x22bb_746f_2bbf_7554_2d6f_7265_6870_5327);
}

mod makeblock_ble {
    use uuid::Uuid;

    pub const SERVICE: Uuid = Uuid::from_u128(0x0000_ffe1_0000_1000_8000_0080_5f9b_34fb);
    pub const WRITE: Uuid = Uuid::from_u128(0x0000_ffe3_0000_1000_8000_0080_5f9b_34fb);
    pub const NOTIFY: Uuid = Uuid::from_u128(0x0000_ffe2_0000_1000_8000_0080_5f9b_34fb);
}

const NO_WAKE: &[GattWrite] = &[];

const SPHERO_WAKE: &[GattWrite] = &[
    GattWrite {
        service: sphero_ble::BLE_SERVICE,
        characteristic: sphero_ble::ANTI_DOS,
        value: Cow::Borrowed(b"011i3"),
    },
    GattWrite {
        service: sphero_ble::BLE_SERVICE,
        characteristic: sphero_ble::TX_POWER,
        value: Cow::Borrowed(&[0x07]),
    },
    GattWrite {
        service: sphero_ble::BLE_SERVICE,
        characteristic: sphero_ble::WAKE,
        value: Cow::Borrowed(&[0x01]),
    },
];

/// Sphero BB-8 / SPRK+ robot control profile.
pub const SPHERO_PROFILE: GattProfile = GattProfile {
    service: sphero_ble::ROBOT_CONTROL,
    write: sphero_ble::COMMANDS,
    notify: sphero_ble::RESPONSE,
    wake: Cow::Borrowed(SPHERO_WAKE),
};

/// Makeblock BLE serial bridge profile.
pub const MAKEBLOCK_PROFILE: GattProfile = GattProfile {
    service: makeblock_ble::SERVICE,
    write: makeblock_ble::WRITE,
    notify: makeblock_ble::NOTIFY,
    wake: Cow::Borrowed(NO_WAKE),
};

/// USB vendor/product match.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UsbEntry {
    pub vendor_id: u16,
    /// Any product of the vendor when absent.
    #[serde(default)]
    pub product_id: Option<u16>,
    pub family: DeviceFamily,
}

/// Bluetooth Classic match on class-of-device, service and name prefix.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BluetoothEntry {
    #[serde(default)]
    pub device_class: Option<u32>,
    #[serde(default)]
    pub name_prefix: Option<Cow<'static, str>>,
    /// Service used to open the RFCOMM channel.
    #[serde(default)]
    pub service: Option<Uuid>,
    pub family: DeviceFamily,
}

/// BLE match by advertised service or name prefix.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BleEntry {
    #[serde(default)]
    pub name_prefix: Option<Cow<'static, str>>,
    #[serde(flatten)]
    pub profile: GattProfile,
    pub family: DeviceFamily,
}

const fn usb(vendor_id: u16, product_id: Option<u16>, family: DeviceFamily) -> UsbEntry {
    UsbEntry {
        vendor_id,
        product_id,
        family,
    }
}

const USB_TABLE: &[UsbEntry] = &[
    usb(0x2341, Some(0x0043), DeviceFamily::Arduino),
    usb(0x2341, Some(0x0010), DeviceFamily::Arduino),
    usb(0x2341, Some(0x0042), DeviceFamily::Arduino),
    usb(0x2341, Some(0x8036), DeviceFamily::Arduino),
    usb(0x0403, Some(0x6001), DeviceFamily::Arduino),
    usb(0x10c4, Some(0xea60), DeviceFamily::Arduino),
    usb(0x1a86, Some(0x7523), DeviceFamily::MBot),
    usb(0x0694, Some(0x0005), DeviceFamily::Ev3),
    usb(0x2e8a, None, DeviceFamily::RaspberryPi),
    usb(0x1d6b, Some(0x0104), DeviceFamily::Aiy),
];

const BLUETOOTH_TABLE: &[BluetoothEntry] = &[
    BluetoothEntry {
        device_class: Some(0x00_0804),
        name_prefix: Some(Cow::Borrowed("EV3")),
        service: Some(SERIAL_PORT_PROFILE),
        family: DeviceFamily::Ev3,
    },
    BluetoothEntry {
        device_class: None,
        name_prefix: Some(Cow::Borrowed("Sphero")),
        service: Some(SERIAL_PORT_PROFILE),
        family: DeviceFamily::Sphero,
    },
    BluetoothEntry {
        device_class: Some(0x00_1F00),
        name_prefix: Some(Cow::Borrowed("Makeblock")),
        service: Some(SERIAL_PORT_PROFILE),
        family: DeviceFamily::MBot,
    },
];

const BLE_TABLE: &[BleEntry] = &[
    BleEntry {
        name_prefix: Some(Cow::Borrowed("BB-")),
        profile: SPHERO_PROFILE,
        family: DeviceFamily::SpheroBle,
    },
    BleEntry {
        name_prefix: Some(Cow::Borrowed("SK-")),
        profile: SPHERO_PROFILE,
        family: DeviceFamily::SpheroBle,
    },
    BleEntry {
        name_prefix: Some(Cow::Borrowed("Makeblock")),
        profile: MAKEBLOCK_PROFILE,
        family: DeviceFamily::MBot,
    },
];

/// Additional entries appended to the built-in tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RegistryExtras {
    pub usb: Vec<UsbEntry>,
    pub bluetooth: Vec<BluetoothEntry>,
    pub ble: Vec<BleEntry>,
}

impl RegistryExtras {
    /// Returns true when no entries are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.usb.is_empty() && self.bluetooth.is_empty() && self.ble.is_empty()
    }
}

/// Immutable lookup tables for device identification.
#[derive(Debug, Clone)]
pub struct Registry {
    usb: Vec<UsbEntry>,
    bluetooth: Vec<BluetoothEntry>,
    ble: Vec<BleEntry>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_extras(RegistryExtras::default())
    }
}

impl Registry {
    /// Creates a registry with the built-in tables.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with configured entries after the built-in ones.
    #[must_use]
    pub fn with_extras(extras: RegistryExtras) -> Self {
        let mut usb = USB_TABLE.to_vec();
        usb.extend(extras.usb);
        let mut bluetooth = BLUETOOTH_TABLE.to_vec();
        bluetooth.extend(extras.bluetooth);
        let mut ble = BLE_TABLE.to_vec();
        ble.extend(extras.ble);
        Self {
            usb,
            bluetooth,
            ble,
        }
    }

    /// Labels a discovered peer with its device family.
    #[must_use]
    pub fn identify(&self, descriptor: &DeviceDescriptor) -> DeviceFamily {
        let family = match descriptor.transport() {
            TransportKind::Usb | TransportKind::Serial => self.match_usb(descriptor),
            TransportKind::BluetoothClassic => self
                .match_bluetooth(descriptor)
                .map(|entry| entry.family),
            TransportKind::BluetoothLe => self.match_ble(descriptor).map(|entry| entry.family),
        };
        family.unwrap_or_default()
    }

    /// Returns the GATT profile for a BLE peer.
    #[must_use]
    pub fn gatt_profile(&self, descriptor: &DeviceDescriptor) -> Option<&GattProfile> {
        if descriptor.transport() != TransportKind::BluetoothLe {
            return None;
        }
        self.match_ble(descriptor).map(|entry| &entry.profile)
    }

    /// Builds a labelled, disconnected device from a descriptor.
    #[must_use]
    pub fn device(&self, descriptor: &DeviceDescriptor) -> Device {
        let mut device = Device::from_descriptor(descriptor, self.identify(descriptor));
        device.gatt = self.gatt_profile(descriptor).cloned();
        device
    }

    fn match_usb(&self, descriptor: &DeviceDescriptor) -> Option<DeviceFamily> {
        let id = descriptor.usb?;
        self.usb
            .iter()
            .find(|entry| {
                entry.vendor_id == id.vendor_id
                    && entry.product_id.is_none_or(|pid| pid == id.product_id)
            })
            .map(|entry| entry.family)
    }

    /// Finds the first entry whose every stated criterion holds.
    ///
    /// The name prefix must always match when an entry has one. Class and
    /// service are checked when the peer reports them; ports found by
    /// listing serial devices carry only a name.
    fn match_bluetooth(&self, descriptor: &DeviceDescriptor) -> Option<&BluetoothEntry> {
        self.bluetooth.iter().find(|entry| {
            let class = match (entry.device_class, descriptor.device_class) {
                (Some(want), Some(got)) => Some(want & CLASS_MASK == got & CLASS_MASK),
                _ => None,
            };
            let service = match entry.service {
                Some(uuid) if !descriptor.services.is_empty() => {
                    Some(descriptor.services.contains(&uuid))
                }
                _ => None,
            };
            let name = entry
                .name_prefix
                .as_deref()
                .map(|prefix| name_matches(Some(prefix), descriptor));

            let checks = [class, service, name];
            checks.iter().any(Option::is_some) && checks.iter().flatten().all(|ok| *ok)
        })
    }

    fn match_ble(&self, descriptor: &DeviceDescriptor) -> Option<&BleEntry> {
        self.ble
            .iter()
            .find(|entry| descriptor.services.contains(&entry.profile.service))
            .or_else(|| {
                self.ble
                    .iter()
                    .find(|entry| name_matches(entry.name_prefix.as_deref(), descriptor))
            })
    }
}

fn name_matches(prefix: Option<&str>, descriptor: &DeviceDescriptor) -> bool {
    prefix
        .zip(descriptor.name.as_deref())
        .is_some_and(|(prefix, name)| name.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identify_usb() {
        let registry = Registry::new();
        let arduino = DeviceDescriptor::new(TransportKind::Usb, "/dev/ttyACM0").usb(0x2341, 0x0043);
        let pico = DeviceDescriptor::new(TransportKind::Usb, "/dev/ttyACM1").usb(0x2e8a, 0x000a);
        let mbot = DeviceDescriptor::new(TransportKind::Serial, "/dev/ttyUSB0").usb(0x1a86, 0x7523);
        let other = DeviceDescriptor::new(TransportKind::Usb, "/dev/ttyACM2").usb(0x1234, 0x5678);

        assert_eq!(registry.identify(&arduino), DeviceFamily::Arduino);
        assert_eq!(registry.identify(&pico), DeviceFamily::RaspberryPi);
        assert_eq!(registry.identify(&mbot), DeviceFamily::MBot);
        assert_eq!(registry.identify(&other), DeviceFamily::Unknown);
    }

    #[test]
    fn test_identify_bluetooth_requires_every_criterion() {
        let registry = Registry::new();
        let ev3 = DeviceDescriptor::new(TransportKind::BluetoothClassic, "00:16:53:01:02:03")
            .name("EV3")
            .device_class(0x5A_0804);
        let sphero =
            DeviceDescriptor::new(TransportKind::BluetoothClassic, "68:86:E7:00:00:01").name("Sphero-RBW");
        let listed_port = DeviceDescriptor::new(TransportKind::BluetoothClassic, "/dev/rfcomm0").name("EV3");

        assert_eq!(registry.identify(&ev3), DeviceFamily::Ev3);
        assert_eq!(registry.identify(&sphero), DeviceFamily::Sphero);
        assert_eq!(registry.identify(&listed_port), DeviceFamily::Ev3);
        assert_eq!(
            registry.match_bluetooth(&ev3).and_then(|e| e.service),
            Some(SERIAL_PORT_PROFILE)
        );
    }

    #[test]
    fn test_identify_bluetooth_rejects_partial_match() {
        let registry = Registry::new();
        let hc05 = DeviceDescriptor::new(TransportKind::BluetoothClassic, "98:d3:31:00:00:01")
            .name("HC-05")
            .device_class(0x1F00);
        let toy = DeviceDescriptor::new(TransportKind::BluetoothClassic, "00:16:53:0a:0b:0c")
            .name("RoboCar")
            .device_class(0x0804);
        let wrong_class = DeviceDescriptor::new(TransportKind::BluetoothClassic, "00:16:53:01:02:04")
            .name("EV3")
            .device_class(0x0240);
        let unnamed = DeviceDescriptor::new(TransportKind::BluetoothClassic, "00:16:53:01:02:05")
            .device_class(0x0804);
        let wrong_service = DeviceDescriptor::new(TransportKind::BluetoothClassic, "68:86:E7:00:00:02")
            .name("Sphero-YGB")
            .service(Uuid::from_u128(0x0000_110a_0000_1000_8000_0080_5f9b_34fb));

        assert_eq!(registry.identify(&hc05), DeviceFamily::Unknown);
        assert_eq!(registry.identify(&toy), DeviceFamily::Unknown);
        assert_eq!(registry.identify(&wrong_class), DeviceFamily::Unknown);
        assert_eq!(registry.identify(&unnamed), DeviceFamily::Unknown);
        assert_eq!(registry.identify(&wrong_service), DeviceFamily::Unknown);
    }

    #[test]
    fn test_identify_ble_selects_profile() {
        let registry = Registry::new();
        let bb8 = DeviceDescriptor::new(TransportKind::BluetoothLe, "c4:0e").name("BB-1234");
        let mbot = DeviceDescriptor::new(TransportKind::BluetoothLe, "d0:11").service(MAKEBLOCK_PROFILE.service);

        let device = registry.device(&bb8);
        assert_eq!(device.family, DeviceFamily::SpheroBle);
        assert_eq!(device.gatt.as_ref().map(|p| p.wake.len()), Some(3));
        assert_eq!(registry.gatt_profile(&mbot), Some(&MAKEBLOCK_PROFILE));
        assert_eq!(registry.identify(&mbot), DeviceFamily::MBot);
    }

    #[test]
    fn test_extras_are_appended() {
        let extras = RegistryExtras {
            usb: vec![UsbEntry {
                vendor_id: 0x2341,
                product_id: Some(0x0058),
                family: DeviceFamily::Arduino,
            }],
            ..RegistryExtras::default()
        };
        let registry = Registry::with_extras(extras);
        let nano = DeviceDescriptor::new(TransportKind::Usb, "/dev/ttyACM0").usb(0x2341, 0x0058);

        assert_eq!(registry.identify(&nano), DeviceFamily::Arduino);
        assert_eq!(Registry::new().identify(&nano), DeviceFamily::Unknown);
    }
}
