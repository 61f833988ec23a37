//! LEGO EV3 direct command codec.
//!
//! Wire format (all multi-byte fields little-endian):
//! ```text
//! ┌──────────┬─────┬──────┬──────┬────────────┬─────────────────┬─────────┐
//! │ len (2)  │ tag │ port │ type │ global lo  │ local<<2 | g_hi │ ops ... │
//! └──────────┴─────┴──────┴──────┴────────────┴─────────────────┴─────────┘
//! ```
//! `len` counts every byte after itself. The two message counter bytes
//! carry the reply tag and the input port so replies can be routed
//! without host-side bookkeeping. Operands use LEGO's local-constant
//! encoding (`81 b`, `82 lo hi`, `83 b0..b3`, global index `E1 00`).
//!
//! Replies: `[len][tag][port][status][global variables]`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{self, FrameError};
use crate::event::Event;
use crate::protocol::command::{
    Command, DecodedCommand, ParamKind, ParamSpec, ParamValue, Params,
};
use crate::protocol::frame::{Frame, FrameDecoder};
use crate::protocol::{FrameCodec, ResponseArity};
use crate::types::{DeviceId, SensorKind, SensorReading, SensorValue};

use ParamKind::{I8, I32, U8, U16};

/// Command types.
pub mod command_type {
    pub const DIRECT_REPLY: u8 = 0x00;
    pub const DIRECT_NO_REPLY: u8 = 0x80;
}

/// Reply status bytes.
pub mod status {
    pub const DIRECT_OK: u8 = 0x02;
    pub const SYSTEM_OK: u8 = 0x03;
    pub const DIRECT_ERROR: u8 = 0x04;
    pub const SYSTEM_ERROR: u8 = 0x05;
}

/// Reply tags carried in the first message counter byte.
pub mod tag {
    pub const NONE: u8 = 0x00;
    pub const DEVICE_NAME: u8 = 0x01;
    pub const ACTOR_VALUE: u8 = 0x05;
    pub const PCT_VALUE: u8 = 0x10;
    pub const RAW_VALUE: u8 = 0x11;
    pub const SI_VALUE: u8 = 0x12;
    pub const FIRMWARE: u8 = 0x20;
    pub const BATTERY: u8 = 0x21;
}

/// Output port bits.
pub mod output {
    pub const A: u8 = 0x01;
    pub const B: u8 = 0x02;
    pub const C: u8 = 0x04;
    pub const D: u8 = 0x08;
    pub const ALL: u8 = 0x0F;
}

const LC_BYTE: u8 = 0x81;
const LC_SHORT: u8 = 0x82;
const LC_INT: u8 = 0x83;
const GV_INDEX: u8 = 0xE1;

/// Largest reply accepted before treating the length as noise.
const MAX_REPLY_LEN: usize = 1024;

/// One step of an operand program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    /// Raw opcode bytes.
    Code(&'static [u8]),
    /// `81 00`: layer 0 or an unused operand.
    Null,
    /// `81 v` with a fixed value.
    Const(u8),
    /// `81 v` from a parameter.
    Byte(usize),
    /// `82 lo hi` from a parameter.
    Short(usize),
    /// `83 b0 b1 b2 b3` from a parameter.
    Int(usize),
    /// Layer plus input port; the port is echoed in the reply counter.
    Port(usize),
    /// Layer plus output port bitmask.
    Ports(usize),
    /// Global variable index 0.
    Index,
}

struct Ev3Command {
    command: Command,
    global: u16,
    program: &'static [Op],
}

mod opcode {
    pub const UI_READ_BATTERY: &[u8] = &[0x81, 0x12];
    pub const UI_READ_FIRMWARE: &[u8] = &[0x81, 0x0A];
    pub const UI_WRITE_LED: &[u8] = &[0x82, 0x1B];
    pub const SOUND_TONE: &[u8] = &[0x94, 0x01];
    pub const INPUT_CLEAR_ALL: &[u8] = &[0x99, 0x0A];
    pub const INPUT_DEVICE_NAME: &[u8] = &[0x99, 0x15];
    pub const INPUT_READ_PCT: &[u8] = &[0x99, 0x1B];
    pub const INPUT_READ_RAW: &[u8] = &[0x99, 0x1C];
    pub const INPUT_READ_SI: &[u8] = &[0x99, 0x1D];
    pub const OUTPUT_STOP: &[u8] = &[0xA3];
    pub const OUTPUT_POWER: &[u8] = &[0xA4];
    pub const OUTPUT_START: &[u8] = &[0xA6];
    pub const OUTPUT_STEP_SPEED: &[u8] = &[0xAE];
}

const SENSOR_PARAMS: &[ParamSpec] = &[
    ParamSpec::required("port", U8),
    ParamSpec::or("mode", U8, 0),
];

// Port, type (unchanged), mode, one value, into global 0.
const SENSOR_PROGRAM: &[Op] = &[
    Op::Code(&[]),
    Op::Port(0),
    Op::Null,
    Op::Byte(1),
    Op::Const(1),
    Op::Index,
];

const fn sensor_read(name: &'static str, code: &'static [u8], tag: u8) -> Ev3Command {
    Ev3Command {
        command: Command {
            name,
            opcode: code,
            params: SENSOR_PARAMS,
            response: ResponseArity::Single,
            tag,
        },
        global: 4,
        program: SENSOR_PROGRAM,
    }
}

static COMMANDS: [Ev3Command; 13] = [
    Ev3Command {
        command: Command {
            name: "get_battery",
            opcode: opcode::UI_READ_BATTERY,
            params: &[],
            response: ResponseArity::Single,
            tag: tag::BATTERY,
        },
        global: 4,
        program: &[Op::Code(opcode::UI_READ_BATTERY), Op::Index],
    },
    Ev3Command {
        command: Command {
            name: "get_firmware",
            opcode: opcode::UI_READ_FIRMWARE,
            params: &[],
            response: ResponseArity::Single,
            tag: tag::FIRMWARE,
        },
        global: 0x10,
        program: &[Op::Code(opcode::UI_READ_FIRMWARE), Op::Const(0x10), Op::Index],
    },
    Ev3Command {
        command: Command {
            name: "get_device_name",
            opcode: opcode::INPUT_DEVICE_NAME,
            params: &[ParamSpec::required("port", U8)],
            response: ResponseArity::Single,
            tag: tag::DEVICE_NAME,
        },
        global: 0x7F,
        program: &[
            Op::Code(opcode::INPUT_DEVICE_NAME),
            Op::Port(0),
            Op::Const(0x7F),
            Op::Index,
        ],
    },
    sensor_read("read_sensor_pct", opcode::INPUT_READ_PCT, tag::PCT_VALUE),
    sensor_read("read_sensor_raw", opcode::INPUT_READ_RAW, tag::RAW_VALUE),
    sensor_read("read_sensor_si", opcode::INPUT_READ_SI, tag::SI_VALUE),
    sensor_read("read_actor", opcode::INPUT_READ_RAW, tag::ACTOR_VALUE),
    Ev3Command {
        command: Command {
            name: "set_led",
            opcode: opcode::UI_WRITE_LED,
            params: &[ParamSpec::required("pattern", U8)],
            response: ResponseArity::None,
            tag: tag::NONE,
        },
        global: 4,
        program: &[Op::Code(opcode::UI_WRITE_LED), Op::Byte(0)],
    },
    Ev3Command {
        command: Command {
            name: "play_tone",
            opcode: opcode::SOUND_TONE,
            params: &[
                ParamSpec::or("volume", U8, 100),
                ParamSpec::required("frequency", U16),
                ParamSpec::or("duration", U16, 50),
            ],
            response: ResponseArity::None,
            tag: tag::NONE,
        },
        global: 4,
        program: &[
            Op::Code(opcode::SOUND_TONE),
            Op::Byte(0),
            Op::Short(1),
            Op::Short(2),
        ],
    },
    Ev3Command {
        command: Command {
            name: "stop",
            opcode: opcode::OUTPUT_STOP,
            params: &[
                ParamSpec::or("ports", U8, output::ALL as i64),
                ParamSpec::or("brake", U8, 0),
            ],
            response: ResponseArity::None,
            tag: tag::NONE,
        },
        global: 4,
        program: &[Op::Code(opcode::OUTPUT_STOP), Op::Ports(0), Op::Byte(1)],
    },
    Ev3Command {
        command: Command {
            name: "clear_all",
            opcode: opcode::INPUT_CLEAR_ALL,
            params: &[],
            response: ResponseArity::None,
            tag: tag::NONE,
        },
        global: 4,
        program: &[Op::Code(opcode::INPUT_CLEAR_ALL), Op::Null],
    },
    Ev3Command {
        command: Command {
            name: "move_power",
            opcode: opcode::OUTPUT_STOP,
            params: &[
                ParamSpec::required("ports", U8),
                ParamSpec::required("power", I8),
                ParamSpec::or("brake", U8, 0),
            ],
            response: ResponseArity::None,
            tag: tag::NONE,
        },
        global: 4,
        program: &[
            Op::Code(opcode::OUTPUT_STOP),
            Op::Ports(0),
            Op::Byte(2),
            Op::Code(opcode::OUTPUT_POWER),
            Op::Ports(0),
            Op::Byte(1),
            Op::Code(opcode::OUTPUT_START),
            Op::Ports(0),
        ],
    },
    Ev3Command {
        command: Command {
            name: "move_steps",
            opcode: opcode::OUTPUT_STOP,
            params: &[
                ParamSpec::required("ports", U8),
                ParamSpec::required("steps", I32),
                ParamSpec::or("speed", I8, 50),
                ParamSpec::or("ramp_up", I32, 0),
                ParamSpec::or("ramp_down", I32, 0),
                ParamSpec::or("brake", U8, 0),
            ],
            response: ResponseArity::None,
            tag: tag::NONE,
        },
        global: 4,
        program: &[
            Op::Code(opcode::OUTPUT_STOP),
            Op::Ports(0),
            Op::Byte(5),
            Op::Code(opcode::OUTPUT_STEP_SPEED),
            Op::Ports(0),
            Op::Byte(2),
            Op::Int(3),
            Op::Int(1),
            Op::Int(4),
            Op::Byte(5),
        ],
    },
];

fn entry(name: &str) -> Option<&'static Ev3Command> {
    COMMANDS.iter().find(|e| e.command.name == name)
}

/// Returns the opcode bytes of an entry; sensor reads share one program
/// shape and take their opcode from the command definition.
fn code_bytes(entry: &Ev3Command, code: &'static [u8]) -> &'static [u8] {
    if code.is_empty() {
        entry.command.opcode
    } else {
        code
    }
}

/// Codec for LEGO Mindstorms EV3 bricks.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ev3Codec;

impl FrameCodec for Ev3Codec {
    fn name(&self) -> &'static str {
        "ev3"
    }

    fn commands(&self) -> Vec<&'static Command> {
        COMMANDS.iter().map(|e| &e.command).collect()
    }

    fn command(&self, name: &str) -> Option<&'static Command> {
        entry(name).map(|e| &e.command)
    }

    fn encode(&self, command: &Command, params: &Params) -> error::Result<Bytes> {
        let entry = entry(command.name).ok_or_else(|| error::Error::UnknownCommand {
            name: command.name.to_owned(),
        })?;
        let args = entry.command.bind(params)?;
        let int = |i: usize| args.get(i).and_then(ParamValue::as_int).unwrap_or_default();

        let mut ops = BytesMut::new();
        let mut target = 0u8;
        for op in entry.program {
            match *op {
                Op::Code(code) => ops.put_slice(code_bytes(entry, code)),
                Op::Null => ops.put_slice(&[LC_BYTE, 0x00]),
                Op::Const(v) => ops.put_slice(&[LC_BYTE, v]),
                Op::Byte(i) => ops.put_slice(&[LC_BYTE, int(i) as u8]),
                Op::Short(i) => {
                    ops.put_u8(LC_SHORT);
                    ops.put_u16_le(int(i) as u16);
                }
                Op::Int(i) => {
                    ops.put_u8(LC_INT);
                    ops.put_u32_le(int(i) as u32);
                }
                Op::Port(i) => {
                    target = int(i) as u8;
                    ops.put_slice(&[LC_BYTE, 0x00, LC_BYTE, target]);
                }
                Op::Ports(i) => ops.put_slice(&[LC_BYTE, 0x00, LC_BYTE, int(i) as u8]),
                Op::Index => ops.put_slice(&[GV_INDEX, 0x00]),
            }
        }

        let command_type = if entry.command.response.expects_reply() {
            command_type::DIRECT_REPLY
        } else {
            command_type::DIRECT_NO_REPLY
        };
        let len = u16::try_from(ops.len() + 5)
            .map_err(|_| entry.command.invalid("program too long".into()))?;

        let mut buf = BytesMut::with_capacity(ops.len() + 7);
        buf.put_u16_le(len);
        buf.put_u8(entry.command.tag);
        buf.put_u8(target);
        buf.put_u8(command_type);
        buf.put_u8((entry.global & 0xFF) as u8);
        buf.put_u8(((entry.global >> 8) & 0x03) as u8);
        buf.put_slice(&ops);
        Ok(buf.freeze())
    }

    fn decode_command(&self, bytes: &[u8]) -> Result<DecodedCommand, FrameError> {
        if bytes.len() < 7 {
            return Err(FrameError::Malformed);
        }
        let len = usize::from(u16::from_le_bytes([bytes[0], bytes[1]]));
        if len != bytes.len() - 2 {
            return Err(FrameError::InvalidLength(len));
        }
        let tag = bytes[2];
        let target = bytes[3];
        let ops = &bytes[7..];

        COMMANDS
            .iter()
            .filter(|e| e.command.tag == tag)
            .find_map(|e| {
                let args = parse_program(e, ops)?;
                let port_matches = e
                    .program
                    .iter()
                    .find_map(|op| match op {
                        Op::Port(i) => args[*i].as_int(),
                        _ => None,
                    })
                    .is_none_or(|port| port == i64::from(target));
                port_matches.then_some(DecodedCommand {
                    command: &e.command,
                    args,
                })
            })
            .ok_or_else(|| FrameError::UnknownOpcode(hex::encode(ops)))
    }

    fn decoder(&self) -> Box<dyn FrameDecoder> {
        Box::new(Ev3Decoder::new())
    }

    fn classify(&self, device: &DeviceId, frame: &Frame) -> Vec<Event> {
        let success = matches!(frame.status, status::DIRECT_OK | status::SYSTEM_OK);
        let mut events = Vec::with_capacity(2);

        if success {
            let port = Some(frame.target);
            let mut data = &frame.payload[..];
            let reading = match frame.id {
                tag::PCT_VALUE if !data.is_empty() => Some((
                    SensorKind::Percent,
                    port,
                    SensorValue::Integer(i64::from(data.get_i8())),
                )),
                tag::RAW_VALUE | tag::ACTOR_VALUE if data.len() >= 4 => Some((
                    if frame.id == tag::RAW_VALUE {
                        SensorKind::Raw
                    } else {
                        SensorKind::Actor
                    },
                    port,
                    SensorValue::Integer(i64::from(data.get_i32_le())),
                )),
                tag::SI_VALUE if data.len() >= 4 => Some((
                    SensorKind::Si,
                    port,
                    SensorValue::Float(f64::from(data.get_f32_le())),
                )),
                tag::BATTERY if !data.is_empty() => Some((
                    SensorKind::Battery,
                    None,
                    SensorValue::Integer(i64::from(data.get_u8())),
                )),
                _ => None,
            };
            if let Some((sensor, port, value)) = reading {
                events.push(Event::SensorReading {
                    device: device.clone(),
                    reading: SensorReading::now(sensor, port, value),
                });
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
}

/// Matches encoded operands against an entry's program, recovering the arguments.
fn parse_program(entry: &Ev3Command, mut ops: &[u8]) -> Option<Vec<ParamValue>> {
    let params = entry.command.params;
    let mut args: Vec<Option<i64>> = vec![None; params.len()];

    let expect = |ops: &mut &[u8], prefix: &[u8]| -> Option<()> {
        *ops = ops.strip_prefix(prefix)?;
        Some(())
    };
    let mut bind = |i: usize, value: i64| -> Option<()> {
        let slot = args.get_mut(i)?;
        if slot.is_some_and(|seen| seen != value) {
            return None;
        }
        *slot = Some(value);
        Some(())
    };
    let lc_byte = |ops: &mut &[u8], i: usize| -> Option<i64> {
        let [LC_BYTE, b, ..] = **ops else { return None };
        *ops = &ops[2..];
        Some(match params.get(i)?.kind {
            I8 => i64::from(b as i8),
            _ => i64::from(b),
        })
    };

    for op in entry.program {
        match *op {
            Op::Code(code) => expect(&mut ops, code_bytes(entry, code))?,
            Op::Null => expect(&mut ops, &[LC_BYTE, 0x00])?,
            Op::Const(v) => expect(&mut ops, &[LC_BYTE, v])?,
            Op::Byte(i) => bind(i, lc_byte(&mut ops, i)?)?,
            Op::Short(i) => {
                expect(&mut ops, &[LC_SHORT])?;
                if ops.len() < 2 {
                    return None;
                }
                bind(i, i64::from(ops.get_u16_le()))?;
            }
            Op::Int(i) => {
                expect(&mut ops, &[LC_INT])?;
                if ops.len() < 4 {
                    return None;
                }
                bind(i, i64::from(ops.get_i32_le()))?;
            }
            Op::Port(i) | Op::Ports(i) => {
                expect(&mut ops, &[LC_BYTE, 0x00])?;
                bind(i, lc_byte(&mut ops, i)?)?;
            }
            Op::Index => expect(&mut ops, &[GV_INDEX, 0x00])?,
        }
    }

    if !ops.is_empty() {
        return None;
    }
    args.into_iter()
        .map(|v| v.map(ParamValue::Int))
        .collect()
}

/// Reassembles length-prefixed EV3 replies.
#[derive(Debug, Default)]
pub struct Ev3Decoder {
    buffer: BytesMut,
}

impl Ev3Decoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameDecoder for Ev3Decoder {
    fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    fn decode(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buffer.len() < 5 {
            return Ok(None);
        }

        let len = usize::from(u16::from_le_bytes([self.buffer[0], self.buffer[1]]));
        if !(3..=MAX_REPLY_LEN).contains(&len) {
            self.buffer.advance(1);
            return Err(FrameError::InvalidLength(len));
        }
        let reply_status = self.buffer[4];
        if !(status::DIRECT_OK..=status::SYSTEM_ERROR).contains(&reply_status) {
            self.buffer.advance(1);
            return Err(FrameError::BadPreamble(reply_status));
        }

        let total = len + 2;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let raw = self.buffer.split_to(total).freeze();
        Ok(Some(
            Frame::reply(raw[2], reply_status, raw.slice(5..)).with_target(raw[3]),
        ))
    }

    fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Builds a reply as the brick would send it.
#[must_use]
pub fn encode_reply(tag: u8, port: u8, reply_status: u8, globals: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(globals.len() + 5);
    buf.put_u16_le((globals.len() + 3) as u16);
    buf.put_slice(&[tag, port, reply_status]);
    buf.put_slice(globals);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransportKind;

    fn encode(name: &str, params: &Params) -> Bytes {
        let command = Ev3Codec.command(name).unwrap();
        Ev3Codec.encode(command, params).unwrap()
    }

    #[test]
    fn test_encode_battery() {
        let bytes = encode("get_battery", &Params::new());
        assert_eq!(
            &bytes[..],
            &[0x09, 0x00, 0x21, 0x00, 0x00, 0x04, 0x00, 0x81, 0x12, 0xE1, 0x00]
        );
    }

    #[test]
    fn test_encode_sensor_read_carries_port() {
        let bytes = encode("read_sensor_pct", &Params::new().with("port", 2));
        assert_eq!(
            &bytes[..],
            &[
                0x13, 0x00, 0x10, 0x02, 0x00, 0x04, 0x00, // header
                0x99, 0x1B, 0x81, 0x00, 0x81, 0x02, // opcode, layer, port
                0x81, 0x00, 0x81, 0x00, 0x81, 0x01, // type, mode, values
                0xE1, 0x00,
            ]
        );
    }

    #[test]
    fn test_encode_move_power_composite() {
        let params = Params::new().with("ports", output::B | output::C).with("power", -50);
        let bytes = encode("move_power", &params);
        assert_eq!(bytes[4], command_type::DIRECT_NO_REPLY);
        assert_eq!(
            &bytes[7..],
            &[
                0xA3, 0x81, 0x00, 0x81, 0x06, 0x81, 0x00, // stop, no brake
                0xA4, 0x81, 0x00, 0x81, 0x06, 0x81, 0xCE, // power -50
                0xA6, 0x81, 0x00, 0x81, 0x06, // start
            ]
        );
        assert_eq!(usize::from(bytes[0]), bytes.len() - 2);
    }

    #[test]
    fn test_encode_move_steps_ints() {
        let params = Params::new().with("ports", output::A).with("steps", 360);
        let bytes = encode("move_steps", &params);
        let ops = &bytes[7..];
        assert_eq!(&ops[..7], &[0xA3, 0x81, 0x00, 0x81, 0x01, 0x81, 0x00]);
        assert_eq!(&ops[7..14], &[0xAE, 0x81, 0x00, 0x81, 0x01, 0x81, 50]);
        assert_eq!(&ops[19..24], &[0x83, 0x68, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn test_decode_reply_and_classify_pct() {
        let mut decoder = Ev3Decoder::new();
        let frames = decoder.feed(&encode_reply(tag::PCT_VALUE, 1, status::DIRECT_OK, &[42, 0, 0, 0]));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].target, 1);

        let device = DeviceId::new(TransportKind::BluetoothClassic, "00:16:53");
        let events = Ev3Codec.classify(&device, &frames[0]);
        assert!(matches!(
            &events[0],
            Event::SensorReading { reading, .. }
                if reading.sensor == SensorKind::Percent
                    && reading.port == Some(1)
                    && reading.value == SensorValue::Integer(42)
        ));
        assert!(matches!(
            events[1],
            Event::Acknowledgement { command_id: tag::PCT_VALUE, success: true, .. }
        ));
    }

    #[test]
    fn test_error_reply_is_unsuccessful() {
        let frame = Frame::reply(tag::BATTERY, status::DIRECT_ERROR, Bytes::new());
        let device = DeviceId::new(TransportKind::Usb, "x");
        let events = Ev3Codec.classify(&device, &frame);
        assert!(matches!(events[..], [Event::Acknowledgement { success: false, .. }]));
    }

    #[test]
    fn test_decoder_resyncs_after_bad_length() {
        let mut decoder = Ev3Decoder::new();
        let mut input = vec![0x00, 0x00, 0x00];
        input.extend_from_slice(&encode_reply(tag::BATTERY, 0, status::DIRECT_OK, &[80, 0, 0, 0]));

        let frames = decoder.feed(&input);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id, tag::BATTERY);
    }

    #[test]
    fn test_decode_command_matches_port() {
        let params = Params::new().with("port", 3).with("mode", 1);
        let bytes = encode("read_sensor_si", &params);
        let decoded = Ev3Codec.decode_command(&bytes).unwrap();
        assert_eq!(decoded.command.name, "read_sensor_si");
        assert_eq!(decoded.args, vec![ParamValue::Int(3), ParamValue::Int(1)]);
    }
}
