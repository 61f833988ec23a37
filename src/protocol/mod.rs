//! Protocol codecs for the supported robot families.
//!
//! Each family gets one [`FrameCodec`] implementation:
//! - [`sphero`] - Sphero classic API (checksummed `FF FF` frames)
//! - [`mbot`] - Makeblock firmware (`FF 55` frames)
//! - [`ev3`] - LEGO EV3 direct commands (length-prefixed)
//! - [`terminal`] - line-oriented text (Arduino, Raspberry Pi, AIY)
//!
//! The dispatcher and event router only see this trait, so adding a
//! protocol never touches them.

pub mod command;
pub mod ev3;
pub mod frame;
pub mod mbot;
pub mod sphero;
pub mod terminal;

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::event::Event;
use crate::types::{DeviceFamily, DeviceId};

pub use command::{
    Command, DecodedCommand, ParamKind, ParamSpec, ParamValue, Params, ResponseArity,
};
pub use ev3::Ev3Codec;
pub use frame::{Frame, FrameDecoder, FrameKind, MAX_BUFFERED};
pub use mbot::MbotCodec;
pub use sphero::SpheroCodec;
pub use terminal::TerminalCodec;

/// Encode/decode strategy for one protocol family.
pub trait FrameCodec: Send + Sync {
    /// Protocol name for logs.
    fn name(&self) -> &'static str;

    /// All commands this protocol defines.
    fn commands(&self) -> Vec<&'static Command>;

    /// Looks up a command by name.
    fn command(&self, name: &str) -> Option<&'static Command> {
        self.commands().into_iter().find(|c| c.name == name)
    }

    /// Encodes a command; the same inputs always produce the same bytes.
    fn encode(&self, command: &Command, params: &Params) -> Result<Bytes>;

    /// Recovers the command and arguments from encoded bytes.
    fn decode_command(&self, bytes: &[u8]) -> std::result::Result<DecodedCommand, FrameError>;

    /// Creates a fresh reassembly decoder for one device session.
    fn decoder(&self) -> Box<dyn FrameDecoder>;

    /// Turns a decoded frame into events.
    ///
    /// A reply yields an [`Event::Acknowledgement`] carrying the command
    /// tag, last, after any readings derived from it.
    fn classify(&self, device: &DeviceId, frame: &Frame) -> Vec<Event>;
}

/// Returns the codec for a device family.
///
/// Unknown peers are treated as text terminals.
#[must_use]
pub fn codec_for(family: DeviceFamily) -> Arc<dyn FrameCodec> {
    match family {
        DeviceFamily::Sphero | DeviceFamily::SpheroBle => Arc::new(SpheroCodec),
        DeviceFamily::MBot => Arc::new(MbotCodec),
        DeviceFamily::Ev3 => Arc::new(Ev3Codec),
        DeviceFamily::Arduino
        | DeviceFamily::RaspberryPi
        | DeviceFamily::Aiy
        | DeviceFamily::Unknown => Arc::new(TerminalCodec),
    }
}

/// Byte order of multi-byte parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Endian {
    Big,
    Little,
}

/// Writes an already range-checked integer with the kind's width.
pub(crate) fn put_int(buf: &mut BytesMut, kind: ParamKind, value: i64, endian: Endian) {
    match (kind.width(), endian) {
        (Some(1), _) => buf.put_u8(value as u8),
        (Some(2), Endian::Big) => buf.put_u16(value as u16),
        (Some(2), Endian::Little) => buf.put_u16_le(value as u16),
        (Some(_), Endian::Big) => buf.put_u32(value as u32),
        (Some(_), Endian::Little) => buf.put_u32_le(value as u32),
        (None, _) => {}
    }
}

/// Reads an integer of the kind's width from the front of `buf`.
pub(crate) fn take_int(buf: &mut &[u8], kind: ParamKind, endian: Endian) -> Option<i64> {
    let width = kind.width()?;
    if buf.len() < width {
        return None;
    }
    let (head, rest) = buf.split_at(width);
    *buf = rest;

    let accumulate = |acc: u32, b: &u8| (acc << 8) | u32::from(*b);
    let unsigned = match endian {
        Endian::Big => head.iter().fold(0, accumulate),
        Endian::Little => head.iter().rev().fold(0, accumulate),
    };

    Some(match kind {
        ParamKind::U8 | ParamKind::U16 | ParamKind::U32 => i64::from(unsigned),
        ParamKind::I8 => i64::from(unsigned as u8 as i8),
        ParamKind::I16 => i64::from(unsigned as u16 as i16),
        ParamKind::I32 => i64::from(unsigned as i32),
        ParamKind::Text => return None,
    })
}

/// Renders bytes for trace logs.
pub(crate) fn hex_dump(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}
