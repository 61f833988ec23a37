//! Error types for the botlink library.

use thiserror::Error;

/// The main error type for device operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The peer refused the connection, timed out, or the hardware is unavailable.
    #[error("connection error: {reason}")]
    Connection { reason: String },

    /// A read or write failed on an established link.
    #[error("transport error: {reason}")]
    Transport { reason: String },

    /// No matching response arrived in time.
    #[error("command timed out after {timeout_ms}ms")]
    CommandTimeout { timeout_ms: u64 },

    /// The device is unknown or not in the connected state.
    #[error("not connected")]
    NotConnected,

    /// The device's codec has no command with this name.
    #[error("unknown command: {name}")]
    UnknownCommand { name: String },

    /// Parameters do not fit the command definition.
    #[error("invalid parameters for {command}: {reason}")]
    InvalidParams {
        command: &'static str,
        reason: String,
    },

    /// The device answered with a non-success status.
    #[error("{command} rejected by device (status 0x{status:02x})")]
    Rejected { command: &'static str, status: u8 },

    /// No transport is registered for the device's transport kind.
    #[error("no transport registered for {0}")]
    UnsupportedTransport(crate::types::TransportKind),

    /// Configuration could not be loaded or parsed.
    #[error("configuration error: {reason}")]
    Config { reason: String },

    /// Serial port error.
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),
}

impl Error {
    pub(crate) fn connection(reason: impl Into<String>) -> Self {
        Self::Connection {
            reason: reason.into(),
        }
    }

    pub(crate) fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    pub(crate) fn timeout(timeout: std::time::Duration) -> Self {
        Self::CommandTimeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Frame decoding errors.
///
/// These never reach callers: the decoding loop logs them and resynchronizes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Declared length is impossible for this protocol.
    #[error("invalid frame length: {0}")]
    InvalidLength(usize),

    /// Checksum trailer does not match the frame contents.
    #[error("checksum mismatch: expected 0x{expected:02x}, got 0x{got:02x}")]
    ChecksumMismatch { expected: u8, got: u8 },

    /// Bytes after the start marker are not a valid header.
    #[error("bad preamble byte 0x{0:02x}")]
    BadPreamble(u8),

    /// Frame terminator missing.
    #[error("bad frame trailer")]
    BadTrailer,

    /// Reply carries a value type the protocol does not define.
    #[error("unknown value type 0x{0:02x}")]
    UnknownValueType(u8),

    /// Encoded command does not match any known opcode.
    #[error("unknown opcode {0}")]
    UnknownOpcode(String),

    /// Encoded command is truncated or has trailing bytes.
    #[error("malformed command frame")]
    Malformed,
}

/// Result type alias for botlink operations.
pub type Result<T> = std::result::Result<T, Error>;
