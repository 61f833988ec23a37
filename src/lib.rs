//! # botlink
//!
//! Async device communication layer for educational robots.
//!
//! This library talks to LEGO EV3 bricks, Sphero robots, Makeblock mBots
//! and Arduino / Raspberry Pi / AIY boards over serial ports, USB,
//! Bluetooth Classic and (with the `ble` feature) Bluetooth LE.
//!
//! ## Features
//!
//! - Async/await based API using Tokio
//! - Per-protocol frame codecs with stream reassembly and resynchronization
//! - Per-device FIFO command queue with reply timeouts
//! - Event fan-out to callbacks and broadcast subscriptions
//! - Device identification from USB ids, Bluetooth classes and GATT services
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use botlink::{EventFilter, Hub, HubConfig, Params};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), botlink::Error> {
//!     let hub = Hub::serial(HubConfig::default());
//!
//!     // Find a robot
//!     let mut found = hub.discover_for(Duration::from_secs(2));
//!     let Some(robot) = found.next().await else {
//!         return Ok(());
//!     };
//!     drop(found);
//!
//!     hub.connect(&robot.id).await?;
//!
//!     // Log everything it reports
//!     let _listener = hub.subscribe(EventFilter::device(robot.id.clone()), |event| {
//!         println!("{event:?}");
//!     });
//!
//!     // Roll forward at half speed
//!     let params = Params::new().with("speed", 128).with("heading", 0);
//!     hub.execute(&robot.id, "roll", &params, None).await?;
//!
//!     hub.disconnect(&robot.id).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`protocol`] - Commands, frames and the per-family codecs
//! - [`types`] - Devices, descriptors and sensor readings
//! - [`registry`] - Device identification tables and GATT profiles
//! - [`transport`] - Serial, in-memory and BLE transports
//! - [`event`] - Event router for device notifications
//! - [`dispatcher`] - Per-device command serialization
//! - [`config`] - Hub configuration
//! - [`client`] - High-level [`Hub`]

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use client::{Hub, PollHandle};
pub use config::HubConfig;
pub use dispatcher::CommandDispatcher;
pub use error::{Error, FrameError, Result};
pub use event::{Event, EventFilter, EventKind, EventRouter, ListenerHandle, Subscription};
pub use protocol::{
    Command, Frame, FrameCodec, FrameDecoder, ParamValue, Params, ResponseArity, codec_for,
};
pub use registry::{GattProfile, Registry};
pub use transport::{MemoryTransport, PeerHandle, SerialConfig, SerialTransport, Transport, serial::list_ports};
pub use types::{
    ConnectionState, Device, DeviceDescriptor, DeviceFamily, DeviceId, SensorKind, SensorReading,
    SensorValue, TransportKind,
};
