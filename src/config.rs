//! Hub configuration.
//!
//! Every field has a default, so an empty TOML document is valid.
//! Durations are written in milliseconds:
//!
//! ```toml
//! default_timeout = 1000
//! scan_window = 3000
//!
//! [serial]
//! baud_rate = 9600
//!
//! [[registry.usb]]
//! vendor_id = 0x2341
//! product_id = 0x0058
//! family = "arduino"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::dispatcher::DEFAULT_TIMEOUT;
use crate::error::{Error, Result};
use crate::registry::RegistryExtras;
use crate::transport::serial::{
    DEFAULT_BAUD_RATE, DEFAULT_CONNECT_TIMEOUT, DEFAULT_CONNECTION_DELAY, SerialConfig,
};

/// Default capacity of the broadcast event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Default discovery scan window.
pub const DEFAULT_SCAN_WINDOW: Duration = Duration::from_secs(5);

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

/// Serial port settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SerialSection {
    pub baud_rate: u32,
    #[serde(deserialize_with = "millis")]
    pub connection_delay: Duration,
}

impl Default for SerialSection {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            connection_delay: DEFAULT_CONNECTION_DELAY,
        }
    }
}

/// Settings for a [`Hub`](crate::Hub).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Reply timeout used when a caller passes none.
    #[serde(deserialize_with = "millis")]
    pub default_timeout: Duration,
    /// Capacity of the broadcast subscription channel.
    pub event_capacity: usize,
    /// How long discovery scans run.
    #[serde(deserialize_with = "millis")]
    pub scan_window: Duration,
    /// Upper bound on opening a link.
    #[serde(deserialize_with = "millis")]
    pub connect_timeout: Duration,
    pub serial: SerialSection,
    /// Entries appended to the built-in registry tables.
    pub registry: RegistryExtras,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            scan_window: DEFAULT_SCAN_WINDOW,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            serial: SerialSection::default(),
            registry: RegistryExtras::default(),
        }
    }
}

impl HubConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the document is not valid.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config {
            reason: e.to_string(),
        })
    }

    /// Reads and parses a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::Config {
            reason: format!("{}: {e}", path.display()),
        })?;
        Self::from_toml_str(&text)
    }

    /// Sets the default reply timeout.
    #[must_use]
    pub const fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Sets the event channel capacity.
    #[must_use]
    pub const fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Sets the discovery scan window.
    #[must_use]
    pub const fn scan_window(mut self, window: Duration) -> Self {
        self.scan_window = window;
        self
    }

    /// Sets the connect timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the serial baud rate.
    #[must_use]
    pub const fn baud_rate(mut self, rate: u32) -> Self {
        self.serial.baud_rate = rate;
        self
    }

    /// Returns the settings for a [`SerialTransport`](crate::transport::SerialTransport).
    #[must_use]
    pub const fn serial_config(&self) -> SerialConfig {
        SerialConfig::new()
            .baud_rate(self.serial.baud_rate)
            .connection_delay(self.serial.connection_delay)
            .connect_timeout(self.connect_timeout)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::types::DeviceFamily;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = HubConfig::from_toml_str("").unwrap();
        assert_eq!(config, HubConfig::default());
        assert_eq!(config.default_timeout, Duration::from_millis(1000));
        assert_eq!(config.serial.baud_rate, 115_200);
    }

    #[test]
    fn test_parse_overrides_and_registry() {
        let config = HubConfig::from_toml_str(
            r#"
            default_timeout = 250
            event_capacity = 32

            [serial]
            baud_rate = 9600

            [[registry.usb]]
            vendor_id = 0x2341
            product_id = 0x0058
            family = "arduino"

            [[registry.bluetooth]]
            name_prefix = "Ozobot"
            family = "unknown"
            "#,
        )
        .unwrap();

        assert_eq!(config.default_timeout, Duration::from_millis(250));
        assert_eq!(config.event_capacity, 32);
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.serial.connection_delay, DEFAULT_CONNECTION_DELAY);
        assert_eq!(config.registry.usb[0].family, DeviceFamily::Arduino);
        assert_eq!(config.registry.bluetooth[0].name_prefix.as_deref(), Some("Ozobot"));
        assert_eq!(config.serial_config().baud_rate, 9600);
    }

    #[test]
    fn test_invalid_document_is_config_error() {
        let result = HubConfig::from_toml_str("default_timeout = \"soon\"");
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "scan_window = 1500").unwrap();

        let config = HubConfig::load(file.path()).unwrap();
        assert_eq!(config.scan_window, Duration::from_millis(1500));
        assert!(matches!(
            HubConfig::load("/nonexistent/botlink.toml"),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn test_builder() {
        let config = HubConfig::new()
            .default_timeout(Duration::from_millis(50))
            .baud_rate(57_600);
        assert_eq!(config.default_timeout, Duration::from_millis(50));
        assert_eq!(config.serial_config().baud_rate, 57_600);
    }
}
