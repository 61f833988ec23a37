//! Data types shared across the device layer.
//!
//! - Devices, identifiers and connection state
//! - Raw discovery descriptors and device families
//! - Sensor readings

pub mod device;
pub mod sensor;

pub use device::{
    ConnectionState, Device, DeviceDescriptor, DeviceFamily, DeviceId, TransportKind, UsbId,
};
pub use sensor::{Collision, Locator, SensorKind, SensorReading, SensorValue};
