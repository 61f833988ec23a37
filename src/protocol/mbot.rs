//! Makeblock mBot firmware codec.
//!
//! Outbound: `FF 55 LEN IDX ACTION DEVICE [PORT] [SLOT] data`, where `LEN`
//! counts every byte after itself and shorts are little-endian.
//!
//! Inbound: `FF 55 IDX TYPE value 0D 0A`, or the bare acknowledgement
//! `FF 55 0D 0A` the firmware sends after each `RUN` command.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{self, FrameError};
use crate::event::Event;
use crate::protocol::command::{
    self, Command, DecodedCommand, ParamKind, ParamSpec, ParamValue, Params,
};
use crate::protocol::frame::{self, Frame, FrameDecoder};
use crate::protocol::{Endian, FrameCodec, ResponseArity, put_int, take_int};
use crate::types::{DeviceId, SensorKind, SensorReading, SensorValue};

use ParamKind::{I16, U8, U16};

/// Frame preamble.
pub const PREAMBLE: [u8; 2] = [0xFF, 0x55];
/// Frame terminator.
pub const TRAILER: [u8; 2] = [0x0D, 0x0A];

/// Action bytes.
pub mod action {
    pub const GET: u8 = 0x01;
    pub const RUN: u8 = 0x02;
    pub const RESET: u8 = 0x04;
    pub const START: u8 = 0x05;
}

mod dev {
    pub const VERSION: u8 = 0x00;
    pub const ULTRASONIC: u8 = 0x01;
    pub const LIGHT_SENSOR: u8 = 0x03;
    pub const RGB_LED: u8 = 0x08;
    pub const MOTOR: u8 = 0x0A;
    pub const LINE_FOLLOWER: u8 = 0x11;
    pub const BUZZER: u8 = 0x22;
}

mod port {
    pub const LINE_FOLLOWER: u8 = 0x02;
    pub const ULTRASONIC: u8 = 0x03;
    pub const LIGHT_SENSOR: u8 = 0x06;
    pub const LED: u8 = 0x07;
    pub const LEFT_MOTOR: u8 = 0x09;
    pub const RIGHT_MOTOR: u8 = 0x0A;
}

const LED_SLOT: u8 = 0x02;

/// Reply index tags.
pub mod tag {
    pub const NONE: u8 = 0x00;
    pub const ULTRASONIC: u8 = 0x10;
    pub const LINE_FOLLOWER: u8 = 0x11;
    pub const LIGHT_SENSOR: u8 = 0x12;
    pub const VERSION: u8 = 0x20;
}

/// Reply value types.
pub mod value_type {
    pub const BYTE: u8 = 1;
    pub const FLOAT: u8 = 2;
    pub const SHORT: u8 = 3;
    pub const STRING: u8 = 4;
    pub const DOUBLE: u8 = 5;
    pub const LONG: u8 = 6;
}

static COMMANDS: [Command; 10] = [
    Command {
        name: "get_version",
        opcode: &[action::GET, dev::VERSION],
        params: &[],
        response: ResponseArity::Single,
        tag: tag::VERSION,
    },
    Command {
        name: "read_ultrasonic",
        opcode: &[action::GET, dev::ULTRASONIC, port::ULTRASONIC],
        params: &[],
        response: ResponseArity::Single,
        tag: tag::ULTRASONIC,
    },
    Command {
        name: "read_light_sensor",
        opcode: &[action::GET, dev::LIGHT_SENSOR, port::LIGHT_SENSOR],
        params: &[],
        response: ResponseArity::Single,
        tag: tag::LIGHT_SENSOR,
    },
    Command {
        name: "read_line_follower",
        opcode: &[action::GET, dev::LINE_FOLLOWER, port::LINE_FOLLOWER],
        params: &[],
        response: ResponseArity::Single,
        tag: tag::LINE_FOLLOWER,
    },
    Command {
        name: "set_led",
        opcode: &[action::RUN, dev::RGB_LED, port::LED, LED_SLOT],
        params: &[
            ParamSpec::or("position", U8, 0),
            ParamSpec::required("red", U8),
            ParamSpec::required("green", U8),
            ParamSpec::required("blue", U8),
        ],
        response: ResponseArity::None,
        tag: tag::NONE,
    },
    Command {
        name: "play_tone",
        opcode: &[action::RUN, dev::BUZZER],
        params: &[
            ParamSpec::required("frequency", U16),
            ParamSpec::or("duration", U16, 500),
        ],
        response: ResponseArity::None,
        tag: tag::NONE,
    },
    Command {
        name: "set_left_motor",
        opcode: &[action::RUN, dev::MOTOR, port::LEFT_MOTOR],
        params: &[ParamSpec::required("power", I16)],
        response: ResponseArity::None,
        tag: tag::NONE,
    },
    Command {
        name: "set_right_motor",
        opcode: &[action::RUN, dev::MOTOR, port::RIGHT_MOTOR],
        params: &[ParamSpec::required("power", I16)],
        response: ResponseArity::None,
        tag: tag::NONE,
    },
    Command {
        name: "reset",
        opcode: &[action::RESET],
        params: &[],
        response: ResponseArity::None,
        tag: tag::NONE,
    },
    Command {
        name: "start",
        opcode: &[action::START],
        params: &[],
        response: ResponseArity::None,
        tag: tag::NONE,
    },
];

/// Codec for the mBot (mCore) firmware.
#[derive(Debug, Clone, Copy, Default)]
pub struct MbotCodec;

impl FrameCodec for MbotCodec {
    fn name(&self) -> &'static str {
        "mbot"
    }

    fn commands(&self) -> Vec<&'static Command> {
        COMMANDS.iter().collect()
    }

    fn command(&self, name: &str) -> Option<&'static Command> {
        command::find(&COMMANDS, name)
    }

    fn encode(&self, command: &Command, params: &Params) -> error::Result<Bytes> {
        let args = command.bind(params)?;

        let mut body = BytesMut::new();
        body.put_u8(command.tag);
        body.put_slice(command.opcode);
        for (spec, arg) in command.params.iter().zip(&args) {
            let value = arg
                .as_int()
                .ok_or_else(|| command.invalid(format!("'{}' must be an integer", spec.name)))?;
            put_int(&mut body, spec.kind, value, Endian::Little);
        }
        let len =
            u8::try_from(body.len()).map_err(|_| command.invalid("payload too long".into()))?;

        let mut buf = BytesMut::with_capacity(body.len() + 3);
        buf.put_slice(&PREAMBLE);
        buf.put_u8(len);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    fn decode_command(&self, bytes: &[u8]) -> Result<DecodedCommand, FrameError> {
        if bytes.len() < 5 || bytes[..2] != PREAMBLE {
            return Err(FrameError::Malformed);
        }
        let len = usize::from(bytes[2]);
        if len != bytes.len() - 3 {
            return Err(FrameError::InvalidLength(len));
        }
        let idx = bytes[3];
        let rest = &bytes[4..];

        for command in COMMANDS.iter().filter(|c| c.tag == idx) {
            let Some(mut data) = rest.strip_prefix(command.opcode) else {
                continue;
            };
            let args = command
                .params
                .iter()
                .map(|spec| take_int(&mut data, spec.kind, Endian::Little).map(ParamValue::Int))
                .collect::<Option<Vec<_>>>();
            if let Some(args) = args {
                if data.is_empty() {
                    return Ok(DecodedCommand { command, args });
                }
            }
        }
        Err(FrameError::UnknownOpcode(hex::encode(rest)))
    }

    fn decoder(&self) -> Box<dyn FrameDecoder> {
        Box::new(MbotDecoder::new())
    }

    fn classify(&self, device: &DeviceId, frame: &Frame) -> Vec<Event> {
        let mut events = Vec::with_capacity(2);

        let sensor = match frame.id {
            tag::ULTRASONIC => Some(SensorKind::Distance),
            tag::LINE_FOLLOWER => Some(SensorKind::LineFollower),
            tag::LIGHT_SENSOR => Some(SensorKind::Light),
            _ => None,
        };
        if let (Some(sensor), Some(value)) = (sensor, parse_value(frame.target, &frame.payload)) {
            events.push(Event::SensorReading {
                device: device.clone(),
                reading: SensorReading::now(sensor, None, value),
            });
        }

        events.push(Event::Acknowledgement {
            device: device.clone(),
            command_id: frame.id,
            success: true,
            payload: frame.payload.clone(),
        });
        events
    }
}

/// Interprets a reply value by its type byte.
fn parse_value(kind: u8, mut data: &[u8]) -> Option<SensorValue> {
    let value = match kind {
        value_type::BYTE if !data.is_empty() => SensorValue::Integer(i64::from(data.get_u8())),
        value_type::FLOAT | value_type::DOUBLE if data.len() >= 4 => {
            SensorValue::Float(f64::from(data.get_f32_le()))
        }
        value_type::SHORT if data.len() >= 2 => SensorValue::Integer(i64::from(data.get_i16_le())),
        value_type::LONG if data.len() >= 4 => SensorValue::Integer(i64::from(data.get_i32_le())),
        _ => return None,
    };
    Some(value)
}

/// Size of the value following the type byte, given the bytes after `TYPE`.
fn value_size(kind: u8, rest: &[u8]) -> Result<Option<usize>, FrameError> {
    Ok(Some(match kind {
        value_type::BYTE => 1,
        value_type::SHORT => 2,
        value_type::FLOAT | value_type::DOUBLE | value_type::LONG => 4,
        value_type::STRING => match rest.first() {
            Some(&n) => 1 + usize::from(n),
            None => return Ok(None),
        },
        other => return Err(FrameError::UnknownValueType(other)),
    }))
}

/// Reassembles mBot replies.
#[derive(Debug, Default)]
pub struct MbotDecoder {
    buffer: BytesMut,
}

impl MbotDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameDecoder for MbotDecoder {
    fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    fn decode(&mut self) -> Result<Option<Frame>, FrameError> {
        if !frame::seek(&mut self.buffer, &PREAMBLE) || self.buffer.len() < 4 {
            return Ok(None);
        }

        if self.buffer[2..4] == TRAILER {
            self.buffer.advance(4);
            return Ok(Some(Frame::reply(tag::NONE, 0, Bytes::new())));
        }

        let idx = self.buffer[2];
        let kind = self.buffer[3];
        let size = match value_size(kind, &self.buffer[4..]) {
            Ok(Some(size)) => size,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.buffer.advance(1);
                return Err(e);
            }
        };

        let total = 4 + size + TRAILER.len();
        if self.buffer.len() < total {
            return Ok(None);
        }
        if self.buffer[total - 2..total] != TRAILER {
            self.buffer.advance(1);
            return Err(FrameError::BadTrailer);
        }

        let raw = self.buffer.split_to(total).freeze();
        let payload = if kind == value_type::STRING {
            raw.slice(5..total - 2)
        } else {
            raw.slice(4..total - 2)
        };
        Ok(Some(Frame::reply(idx, 0, payload).with_target(kind)))
    }

    fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Builds a reply frame as the firmware would send it.
#[must_use]
pub fn encode_reply(idx: u8, kind: u8, value: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(value.len() + 6);
    buf.put_slice(&PREAMBLE);
    buf.put_u8(idx);
    buf.put_u8(kind);
    if kind == value_type::STRING {
        buf.put_u8(value.len() as u8);
    }
    buf.put_slice(value);
    buf.put_slice(&TRAILER);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransportKind;

    fn encode(name: &str, params: &Params) -> Bytes {
        let command = MbotCodec.command(name).unwrap();
        MbotCodec.encode(command, params).unwrap()
    }

    #[test]
    fn test_encode_read_ultrasonic() {
        let bytes = encode("read_ultrasonic", &Params::new());
        assert_eq!(&bytes[..], &[0xFF, 0x55, 0x04, 0x10, 0x01, 0x01, 0x03]);
    }

    #[test]
    fn test_encode_motor_little_endian() {
        let bytes = encode("set_left_motor", &Params::new().with("power", -100));
        assert_eq!(
            &bytes[..],
            &[0xFF, 0x55, 0x06, 0x00, 0x02, 0x0A, 0x09, 0x9C, 0xFF]
        );
    }

    #[test]
    fn test_encode_led() {
        let params = Params::new().with("red", 10).with("green", 20).with("blue", 30);
        let bytes = encode("set_led", &params);
        assert_eq!(
            &bytes[..],
            &[0xFF, 0x55, 0x09, 0x00, 0x02, 0x08, 0x07, 0x02, 0x00, 0x0A, 0x14, 0x1E]
        );
    }

    #[test]
    fn test_encode_reset_has_no_device() {
        let bytes = encode("reset", &Params::new());
        assert_eq!(&bytes[..], &[0xFF, 0x55, 0x02, 0x00, 0x04]);
    }

    #[test]
    fn test_decode_float_reply() {
        let mut decoder = MbotDecoder::new();
        let frames = decoder.feed(&encode_reply(tag::ULTRASONIC, value_type::FLOAT, &12.5f32.to_le_bytes()));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id, tag::ULTRASONIC);
        assert_eq!(frames[0].target, value_type::FLOAT);

        let device = DeviceId::new(TransportKind::Usb, "/dev/ttyUSB0");
        let events = MbotCodec.classify(&device, &frames[0]);
        assert!(matches!(
            &events[0],
            Event::SensorReading { reading, .. }
                if reading.sensor == SensorKind::Distance
                    && reading.value == SensorValue::Float(12.5)
        ));
        assert!(matches!(
            events[1],
            Event::Acknowledgement { command_id: tag::ULTRASONIC, success: true, .. }
        ));
    }

    #[test]
    fn test_decode_bare_ack() {
        let mut decoder = MbotDecoder::new();
        let frames = decoder.feed(&[0xFF, 0x55, 0x0D, 0x0A]);
        assert_eq!(frames, vec![Frame::reply(tag::NONE, 0, Bytes::new())]);
    }

    #[test]
    fn test_decode_string_reply() {
        let mut decoder = MbotDecoder::new();
        let frames = decoder.feed(&encode_reply(tag::VERSION, value_type::STRING, b"06.01.107"));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, Bytes::from_static(b"06.01.107"));
    }

    #[test]
    fn test_malformed_frame_does_not_desync() {
        let mut decoder = MbotDecoder::new();
        assert!(decoder.feed(&[0xFF, 0x55, 0xFF, 0xFF]).is_empty());

        let frames = decoder.feed(&encode_reply(tag::LIGHT_SENSOR, value_type::SHORT, &[0x2C, 0x01]));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id, tag::LIGHT_SENSOR);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_bad_trailer_resyncs() {
        let mut decoder = MbotDecoder::new();
        let mut input = vec![0xFF, 0x55, 0x10, 0x01, 0x05, 0x00, 0x00];
        input.extend_from_slice(&encode_reply(tag::ULTRASONIC, value_type::BYTE, &[7]));

        let frames = decoder.feed(&input);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, Bytes::from_static(&[7]));
    }

    #[test]
    fn test_decode_command_distinguishes_motors() {
        let bytes = encode("set_right_motor", &Params::new().with("power", 255));
        let decoded = MbotCodec.decode_command(&bytes).unwrap();
        assert_eq!(decoded.command.name, "set_right_motor");
        assert_eq!(decoded.args, vec![ParamValue::Int(255)]);
    }
}
