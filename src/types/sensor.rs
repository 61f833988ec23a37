//! Sensor reading types.

use std::time::SystemTime;

use bytes::Bytes;

/// What a reading measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorKind {
    /// Ultrasonic distance in centimeters.
    Distance,
    /// Ambient light level.
    Light,
    /// Line follower state (0-3).
    LineFollower,
    /// Battery level.
    Battery,
    /// EV3 input in percent mode.
    Percent,
    /// EV3 input raw value.
    Raw,
    /// EV3 input in SI units.
    Si,
    /// EV3 motor tacho value.
    Actor,
    /// Sphero collision notification.
    Collision,
    /// Sphero locator position and velocity.
    Locator,
    /// Sphero power state notification.
    PowerState,
    /// Sphero sensor stream sample (layout depends on the streaming mask).
    Stream,
}

/// Sphero collision details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Collision {
    pub x: i16,
    pub y: i16,
    pub z: i16,
    /// Bit 0: x axis, bit 1: y axis.
    pub axis: u8,
    pub x_magnitude: i16,
    pub y_magnitude: i16,
    pub speed: u8,
}

/// Sphero locator sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Locator {
    /// Position in centimeters.
    pub x: i16,
    pub y: i16,
    /// Velocity in cm/s.
    pub velocity_x: i16,
    pub velocity_y: i16,
    /// Speed over ground in cm/s.
    pub speed: u16,
}

/// Decoded sensor value.
#[derive(Debug, Clone, PartialEq)]
pub enum SensorValue {
    Integer(i64),
    Float(f64),
    Collision(Collision),
    Locator(Locator),
    Raw(Bytes),
}

impl SensorValue {
    /// Returns the value as a float if it is numeric.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }
}

/// A timestamped reading from one sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub sensor: SensorKind,
    /// Input port, where the protocol reports one.
    pub port: Option<u8>,
    pub value: SensorValue,
    pub timestamp: SystemTime,
}

impl SensorReading {
    /// Creates a reading stamped with the current time.
    #[must_use]
    pub fn now(sensor: SensorKind, port: Option<u8>, value: SensorValue) -> Self {
        Self {
            sensor,
            port,
            value,
            timestamp: SystemTime::now(),
        }
    }
}
