//! Sphero classic API codec.
//!
//! Outbound command packet:
//! ```text
//! ┌──────┬──────┬─────┬─────┬─────┬──────┬──────────┬─────┐
//! │ 0xFF │ SOP2 │ DID │ CID │ SEQ │ DLEN │ data ... │ CHK │
//! └──────┴──────┴─────┴─────┴─────┴──────┴──────────┴─────┘
//! ```
//! `SOP2` is `0xFF` when a reply is requested and `0xFE` otherwise,
//! `DLEN` counts data plus checksum, and `CHK` is the inverted modulo-256
//! sum of `DID` through the last data byte. Multi-byte values are
//! big-endian.
//!
//! Replies are `FF FF MRSP SEQ DLEN data CHK`; asynchronous messages are
//! `FF FE ID DLEN_MSB DLEN_LSB data CHK`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{self, FrameError};
use crate::event::Event;
use crate::protocol::command::{self, Command, DecodedCommand, ParamKind, ParamSpec, Params};
use crate::protocol::frame::{self, Frame, FrameDecoder, FrameKind};
use crate::protocol::{Endian, FrameCodec, ResponseArity, put_int, take_int};
use crate::types::{Collision, DeviceId, Locator, SensorKind, SensorReading, SensorValue};

use ParamKind::{U8, U16, U32};

/// Start of packet.
pub const SOP1: u8 = 0xFF;
/// Second start byte of a reply, or of a command requesting one.
pub const SOP2_ANSWER: u8 = 0xFF;
/// Second start byte of an async message, or of a command without reply.
pub const SOP2_ASYNC: u8 = 0xFE;

/// Response code for success.
pub const MRSP_OK: u8 = 0x00;

/// Largest async payload accepted before treating the length as noise.
const MAX_ASYNC_LEN: usize = 1024;

/// Async message id codes.
pub mod async_id {
    pub const POWER_STATE: u8 = 0x01;
    pub const SENSOR_STREAM: u8 = 0x03;
    pub const PRE_SLEEP_WARNING: u8 = 0x05;
    pub const COLLISION: u8 = 0x07;
}

mod device {
    pub const CORE: u8 = 0x00;
    pub const SPHERO: u8 = 0x02;
}

const READ_LOCATOR_TAG: u8 = 0x08;

static COMMANDS: [Command; 14] = [
    Command {
        name: "ping",
        opcode: &[device::CORE, 0x01],
        params: &[],
        response: ResponseArity::Single,
        tag: 0x01,
    },
    Command {
        name: "get_version",
        opcode: &[device::CORE, 0x02],
        params: &[],
        response: ResponseArity::Single,
        tag: 0x02,
    },
    Command {
        name: "sleep",
        opcode: &[device::CORE, 0x22],
        params: &[
            ParamSpec::or("wakeup", U16, 0),
            ParamSpec::or("macro", U8, 0),
            ParamSpec::or("orbbasic", U16, 0),
        ],
        response: ResponseArity::None,
        tag: 0x03,
    },
    Command {
        name: "set_heading",
        opcode: &[device::SPHERO, 0x01],
        params: &[ParamSpec::required("heading", U16)],
        response: ResponseArity::Single,
        tag: 0x04,
    },
    Command {
        name: "set_stabilization",
        opcode: &[device::SPHERO, 0x02],
        params: &[ParamSpec::or("enabled", U8, 1)],
        response: ResponseArity::Single,
        tag: 0x05,
    },
    Command {
        name: "set_data_streaming",
        opcode: &[device::SPHERO, 0x11],
        params: &[
            ParamSpec::or("divisor", U16, 10),
            ParamSpec::or("frames", U16, 1),
            ParamSpec::required("mask", U32),
            ParamSpec::or("count", U8, 0),
        ],
        response: ResponseArity::Streaming,
        tag: 0x06,
    },
    Command {
        name: "configure_collision_detection",
        opcode: &[device::SPHERO, 0x12],
        params: &[
            ParamSpec::or("method", U8, 0x01),
            ParamSpec::or("threshold_x", U8, 0x60),
            ParamSpec::or("speed_x", U8, 0x60),
            ParamSpec::or("threshold_y", U8, 0x60),
            ParamSpec::or("speed_y", U8, 0x60),
            ParamSpec::or("dead_time", U8, 0x0A),
        ],
        response: ResponseArity::Single,
        tag: 0x07,
    },
    Command {
        name: "read_locator",
        opcode: &[device::SPHERO, 0x15],
        params: &[],
        response: ResponseArity::Single,
        tag: READ_LOCATOR_TAG,
    },
    Command {
        name: "set_rgb_led",
        opcode: &[device::SPHERO, 0x20],
        params: &[
            ParamSpec::required("red", U8),
            ParamSpec::required("green", U8),
            ParamSpec::required("blue", U8),
            ParamSpec::or("persist", U8, 1),
        ],
        response: ResponseArity::Single,
        tag: 0x09,
    },
    Command {
        name: "set_back_led",
        opcode: &[device::SPHERO, 0x21],
        params: &[ParamSpec::required("brightness", U8)],
        response: ResponseArity::Single,
        tag: 0x0A,
    },
    Command {
        name: "get_rgb_led",
        opcode: &[device::SPHERO, 0x22],
        params: &[],
        response: ResponseArity::Single,
        tag: 0x0B,
    },
    Command {
        name: "roll",
        opcode: &[device::SPHERO, 0x30],
        params: &[
            ParamSpec::required("speed", U8),
            ParamSpec::required("heading", U16),
            ParamSpec::or("state", U8, 1),
        ],
        response: ResponseArity::Single,
        tag: 0x0C,
    },
    Command {
        name: "boost",
        opcode: &[device::SPHERO, 0x31],
        params: &[ParamSpec::or("enabled", U8, 1)],
        response: ResponseArity::Single,
        tag: 0x0D,
    },
    Command {
        name: "set_motion_timeout",
        opcode: &[device::SPHERO, 0x34],
        params: &[ParamSpec::required("timeout", U16)],
        response: ResponseArity::Single,
        tag: 0x0E,
    },
];

/// Inverted modulo-256 sum, i.e. `0xFF - (sum % 256)`.
#[must_use]
pub fn checksum(bytes: &[u8]) -> u8 {
    !bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Codec for Sphero 2.0, SPRK and BB-8 class robots.
///
/// `SEQ` is the command's fixed [`Command::tag`], so encoding stays
/// deterministic and replies are matched by command. A consequence: a
/// reply that arrives after its command timed out completes the next
/// command of the same kind if that one is already waiting. Callers that
/// retry after a timeout should expect the retry to resolve early.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpheroCodec;

impl FrameCodec for SpheroCodec {
    fn name(&self) -> &'static str {
        "sphero"
    }

    fn commands(&self) -> Vec<&'static Command> {
        COMMANDS.iter().collect()
    }

    fn command(&self, name: &str) -> Option<&'static Command> {
        command::find(&COMMANDS, name)
    }

    fn encode(&self, command: &Command, params: &Params) -> error::Result<Bytes> {
        let args = command.bind(params)?;

        let mut data = BytesMut::new();
        for (spec, arg) in command.params.iter().zip(&args) {
            let value = arg
                .as_int()
                .ok_or_else(|| command.invalid(format!("'{}' must be an integer", spec.name)))?;
            put_int(&mut data, spec.kind, value, Endian::Big);
        }
        let dlen = u8::try_from(data.len() + 1)
            .map_err(|_| command.invalid("payload too long".into()))?;

        let mut buf = BytesMut::with_capacity(data.len() + 7);
        buf.put_u8(SOP1);
        buf.put_u8(if command.response.expects_reply() {
            SOP2_ANSWER
        } else {
            SOP2_ASYNC
        });
        buf.put_slice(command.opcode);
        buf.put_u8(command.tag);
        buf.put_u8(dlen);
        buf.put_slice(&data);
        let chk = checksum(&buf[2..]);
        buf.put_u8(chk);
        Ok(buf.freeze())
    }

    fn decode_command(&self, bytes: &[u8]) -> Result<DecodedCommand, FrameError> {
        if bytes.len() < 7 || bytes[0] != SOP1 {
            return Err(FrameError::Malformed);
        }
        if bytes[1] != SOP2_ANSWER && bytes[1] != SOP2_ASYNC {
            return Err(FrameError::BadPreamble(bytes[1]));
        }
        let dlen = usize::from(bytes[5]);
        if dlen == 0 || bytes.len() != 6 + dlen {
            return Err(FrameError::InvalidLength(dlen));
        }
        let (body, chk) = bytes.split_at(bytes.len() - 1);
        let expected = checksum(&body[2..]);
        if chk[0] != expected {
            return Err(FrameError::ChecksumMismatch {
                expected,
                got: chk[0],
            });
        }

        let command = COMMANDS
            .iter()
            .find(|c| c.opcode == &bytes[2..4])
            .ok_or_else(|| FrameError::UnknownOpcode(hex::encode(&bytes[2..4])))?;

        let mut data = &body[6..];
        let args = command
            .params
            .iter()
            .map(|spec| take_int(&mut data, spec.kind, Endian::Big).map(command::ParamValue::Int))
            .collect::<Option<Vec<_>>>()
            .ok_or(FrameError::Malformed)?;
        if !data.is_empty() {
            return Err(FrameError::Malformed);
        }

        Ok(DecodedCommand { command, args })
    }

    fn decoder(&self) -> Box<dyn FrameDecoder> {
        Box::new(SpheroDecoder::new())
    }

    fn classify(&self, device: &DeviceId, frame: &Frame) -> Vec<Event> {
        match frame.kind {
            FrameKind::Reply => {
                let mut events = Vec::with_capacity(2);
                let success = frame.status == MRSP_OK;
                if success && frame.id == READ_LOCATOR_TAG {
                    if let Some(locator) = parse_locator(&frame.payload) {
                        events.push(reading(device, SensorKind::Locator, SensorValue::Locator(locator)));
                    }
                }
                events.push(Event::Acknowledgement {
                    device: device.clone(),
                    command_id: frame.id,
                    success,
                    payload: frame.payload.clone(),
                });
                events
            }
            FrameKind::Notification => classify_async(device, frame),
            FrameKind::Line => Vec::new(),
        }
    }
}

fn reading(device: &DeviceId, sensor: SensorKind, value: SensorValue) -> Event {
    Event::SensorReading {
        device: device.clone(),
        reading: SensorReading::now(sensor, None, value),
    }
}

fn classify_async(device: &DeviceId, frame: &Frame) -> Vec<Event> {
    let payload = &frame.payload;
    let event = match frame.id {
        async_id::COLLISION => parse_collision(payload)
            .map(|c| reading(device, SensorKind::Collision, SensorValue::Collision(c))),
        async_id::POWER_STATE if !payload.is_empty() => Some(reading(
            device,
            SensorKind::PowerState,
            SensorValue::Integer(i64::from(payload[0])),
        )),
        async_id::SENSOR_STREAM => Some(reading(
            device,
            SensorKind::Stream,
            SensorValue::Raw(payload.clone()),
        )),
        _ => None,
    };

    vec![event.unwrap_or_else(|| Event::RawDataReceived {
        device: device.clone(),
        bytes: payload.clone(),
    })]
}

fn parse_collision(mut data: &[u8]) -> Option<Collision> {
    if data.len() < 12 {
        return None;
    }
    Some(Collision {
        x: data.get_i16(),
        y: data.get_i16(),
        z: data.get_i16(),
        axis: data.get_u8(),
        x_magnitude: data.get_i16(),
        y_magnitude: data.get_i16(),
        speed: data.get_u8(),
    })
}

fn parse_locator(mut data: &[u8]) -> Option<Locator> {
    if data.len() < 10 {
        return None;
    }
    Some(Locator {
        x: data.get_i16(),
        y: data.get_i16(),
        velocity_x: data.get_i16(),
        velocity_y: data.get_i16(),
        speed: data.get_u16(),
    })
}

/// Reassembles Sphero replies and async messages.
#[derive(Debug, Default)]
pub struct SpheroDecoder {
    buffer: BytesMut,
}

impl SpheroDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and extracts a frame spanning `total` bytes.
    ///
    /// On a checksum failure only the start byte is dropped: the header
    /// itself may be noise, so the bytes it claims are rescanned.
    fn take(&mut self, total: usize) -> Result<Frame, FrameError> {
        let expected = checksum(&self.buffer[2..total - 1]);
        let got = self.buffer[total - 1];
        if expected != got {
            self.buffer.advance(1);
            return Err(FrameError::ChecksumMismatch { expected, got });
        }

        let raw = self.buffer.split_to(total).freeze();
        let payload = raw.slice(5..total - 1);
        Ok(if raw[1] == SOP2_ANSWER {
            Frame::reply(raw[3], raw[2], payload)
        } else {
            Frame::notification(raw[2], payload)
        })
    }
}

/// Reads the header at the start of `buf` and returns the frame length.
///
/// `Ok(None)` means the header is not complete yet.
fn frame_len(buf: &[u8]) -> Result<Option<usize>, FrameError> {
    if buf.len() < 5 {
        return match buf.get(1) {
            Some(&sop2) if sop2 != SOP2_ANSWER && sop2 != SOP2_ASYNC => {
                Err(FrameError::BadPreamble(sop2))
            }
            _ => Ok(None),
        };
    }

    let dlen = match buf[1] {
        // No response code uses a start byte value, so `FF FF FF` or
        // `FF FF FE` is a stray byte in front of the real start.
        SOP2_ANSWER if buf[2] == SOP1 || buf[2] == SOP2_ASYNC => {
            return Err(FrameError::BadPreamble(buf[2]));
        }
        SOP2_ANSWER => usize::from(buf[4]),
        SOP2_ASYNC => usize::from(u16::from_be_bytes([buf[3], buf[4]])),
        other => return Err(FrameError::BadPreamble(other)),
    };
    if dlen == 0 || dlen > MAX_ASYNC_LEN {
        return Err(FrameError::InvalidLength(dlen));
    }
    Ok(Some(5 + dlen))
}

/// Returns true if `buf` starts with a complete frame whose checksum holds.
fn complete_frame_at(buf: &[u8]) -> bool {
    buf[0] == SOP1
        && matches!(
            frame_len(buf),
            Ok(Some(total)) if total <= buf.len() && checksum(&buf[2..total - 1]) == buf[total - 1]
        )
}

impl FrameDecoder for SpheroDecoder {
    fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    fn decode(&mut self) -> Result<Option<Frame>, FrameError> {
        if !frame::seek(&mut self.buffer, &[SOP1]) {
            return Ok(None);
        }

        match frame_len(&self.buffer) {
            Ok(None) => Ok(None),
            Ok(Some(total)) if self.buffer.len() >= total => self.take(total).map(Some),
            Ok(Some(total)) => {
                // A header read from noise can claim bytes that never come.
                // Give it up as soon as a whole valid frame follows it.
                let skip = (1..self.buffer.len()).find(|&i| complete_frame_at(&self.buffer[i..]));
                match skip {
                    Some(skip) => {
                        self.buffer.advance(skip);
                        Err(FrameError::InvalidLength(total - 5))
                    }
                    None => Ok(None),
                }
            }
            Err(e) => {
                self.buffer.advance(1);
                Err(e)
            }
        }
    }

    fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Builds a reply frame as the robot would send it.
#[must_use]
pub fn encode_reply(mrsp: u8, seq: u8, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(data.len() + 6);
    buf.put_slice(&[SOP1, SOP2_ANSWER, mrsp, seq, (data.len() + 1) as u8]);
    buf.put_slice(data);
    let chk = checksum(&buf[2..]);
    buf.put_u8(chk);
    buf.freeze()
}

/// Builds an async message as the robot would send it.
#[must_use]
pub fn encode_async(id: u8, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(data.len() + 6);
    buf.put_slice(&[SOP1, SOP2_ASYNC, id]);
    buf.put_u16((data.len() + 1) as u16);
    buf.put_slice(data);
    let chk = checksum(&buf[2..]);
    buf.put_u8(chk);
    buf.freeze()
}
