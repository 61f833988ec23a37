//! Decoded frames and the per-device reassembly contract.
//!
//! Transports deliver raw chunks with no alignment guarantee. Each device
//! session owns one [`FrameDecoder`] that buffers those chunks and yields
//! complete frames:
//!
//! ```text
//! chunk ──► push ──► BytesMut ──► decode ──► Ok(Some(frame)) ──► classify
//!                                     │
//!                                     ├─► Ok(None)  (need more bytes)
//!                                     └─► Err(_)    (logged, resync)
//! ```

use bytes::{Buf, Bytes, BytesMut};

use crate::error::FrameError;

/// Upper bound on buffered bytes before a decoder gives up and clears.
pub const MAX_BUFFERED: usize = 64 * 1024;

/// Shape of a decoded inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Answer to a command the host sent.
    Reply,
    /// Unsolicited message from the device.
    Notification,
    /// Text line from a terminal-style peer.
    Line,
}

/// An immutable, validated inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    /// Sequence number, callback tag or notification id.
    pub id: u8,
    /// Port (EV3) or value type (mBot); zero where the protocol has none.
    pub target: u8,
    /// Device status byte; zero where the protocol has none.
    pub status: u8,
    pub payload: Bytes,
}

impl Frame {
    /// Creates a reply frame.
    #[must_use]
    pub const fn reply(id: u8, status: u8, payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Reply,
            id,
            target: 0,
            status,
            payload,
        }
    }

    /// Creates a notification frame.
    #[must_use]
    pub const fn notification(id: u8, payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Notification,
            id,
            target: 0,
            status: 0,
            payload,
        }
    }

    /// Sets the target byte.
    #[must_use]
    pub const fn with_target(mut self, target: u8) -> Self {
        self.target = target;
        self
    }
}

/// Stateful reassembly of frames from arbitrary byte chunks.
pub trait FrameDecoder: Send {
    /// Appends raw bytes to the reassembly buffer.
    fn push(&mut self, data: &[u8]);

    /// Attempts to decode the next complete frame.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or an error after discarding
    /// malformed input. Calling again after an error continues with the
    /// remaining bytes.
    fn decode(&mut self) -> Result<Option<Frame>, FrameError>;

    /// Returns the number of bytes currently buffered.
    fn buffered(&self) -> usize;

    /// Clears the internal buffer.
    fn clear(&mut self);

    /// Pushes a chunk and returns every frame it completes.
    ///
    /// Malformed frames are logged and dropped.
    fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.push(chunk);
        let mut frames = Vec::new();
        loop {
            match self.decode() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("frame decode error: {}", e);
                }
            }
        }
        if self.buffered() > MAX_BUFFERED {
            tracing::warn!("dropping {} unframed bytes", self.buffered());
            self.clear();
        }
        frames
    }
}

/// Drops bytes until the buffer starts with `marker`.
///
/// A trailing prefix of the marker is kept since the rest may arrive in
/// the next chunk. Returns true if the buffer now starts with the full marker.
pub(crate) fn seek(buffer: &mut BytesMut, marker: &[u8]) -> bool {
    let first = marker[0];
    loop {
        match buffer.iter().position(|&b| b == first) {
            None => {
                buffer.clear();
                return false;
            }
            Some(pos) => buffer.advance(pos),
        }
        let available = buffer.len().min(marker.len());
        if buffer[..available] == marker[..available] {
            return available == marker.len();
        }
        buffer.advance(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seek_discards_garbage() {
        let mut buf = BytesMut::from(&[0x00, 0x12, 0xFF, 0x55, 0x01][..]);
        assert!(seek(&mut buf, &[0xFF, 0x55]));
        assert_eq!(&buf[..], &[0xFF, 0x55, 0x01]);
    }

    #[test]
    fn test_seek_keeps_partial_marker() {
        let mut buf = BytesMut::from(&[0x01, 0xFF][..]);
        assert!(!seek(&mut buf, &[0xFF, 0x55]));
        assert_eq!(&buf[..], &[0xFF]);
    }

    #[test]
    fn test_seek_skips_false_start() {
        let mut buf = BytesMut::from(&[0xFF, 0xFF, 0x55][..]);
        assert!(seek(&mut buf, &[0xFF, 0x55]));
        assert_eq!(&buf[..], &[0xFF, 0x55]);
    }

    #[test]
    fn test_seek_empty_when_no_marker() {
        let mut buf = BytesMut::from(&[0x01, 0x02][..]);
        assert!(!seek(&mut buf, &[0xFF, 0x55]));
        assert!(buf.is_empty());
    }
}
