//! Line-oriented text protocol for Arduino, Raspberry Pi and AIY boards.
//!
//! Outbound text is written as-is; inbound bytes are split on `\n` with an
//! optional trailing `\r` removed.

use bytes::{Bytes, BytesMut};

use crate::error::{self, FrameError};
use crate::event::Event;
use crate::protocol::command::{Command, DecodedCommand, ParamKind, ParamSpec, ParamValue, Params};
use crate::protocol::frame::{Frame, FrameDecoder, FrameKind};
use crate::protocol::{FrameCodec, ResponseArity};
use crate::types::DeviceId;

/// Longest line kept; longer lines are dropped up to the next newline.
pub const MAX_LINE: usize = 1024;

static COMMANDS: [Command; 2] = [
    Command {
        name: "send_line",
        opcode: b"\n",
        params: &[ParamSpec::required("text", ParamKind::Text)],
        response: ResponseArity::None,
        tag: 0,
    },
    Command {
        name: "send_text",
        opcode: &[],
        params: &[ParamSpec::required("text", ParamKind::Text)],
        response: ResponseArity::None,
        tag: 0,
    },
];

/// Codec for boards that speak plain text.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalCodec;

impl FrameCodec for TerminalCodec {
    fn name(&self) -> &'static str {
        "terminal"
    }

    fn commands(&self) -> Vec<&'static Command> {
        COMMANDS.iter().collect()
    }

    fn encode(&self, command: &Command, params: &Params) -> error::Result<Bytes> {
        let args = command.bind(params)?;
        let Some(ParamValue::Text(text)) = args.first() else {
            return Err(command.invalid("missing text".into()));
        };
        let mut buf = BytesMut::with_capacity(text.len() + command.opcode.len());
        buf.extend_from_slice(text.as_bytes());
        buf.extend_from_slice(command.opcode);
        Ok(buf.freeze())
    }

    fn decode_command(&self, bytes: &[u8]) -> Result<DecodedCommand, FrameError> {
        if !bytes.is_ascii() {
            return Err(FrameError::Malformed);
        }
        let (index, body) = match bytes.strip_suffix(b"\n") {
            Some(line) if !line.contains(&b'\n') => (0, line),
            _ => (1, bytes),
        };
        Ok(DecodedCommand {
            command: &COMMANDS[index],
            args: vec![ParamValue::Text(String::from_utf8_lossy(body).into_owned())],
        })
    }

    fn decoder(&self) -> Box<dyn FrameDecoder> {
        Box::new(LineDecoder::new())
    }

    fn classify(&self, device: &DeviceId, frame: &Frame) -> Vec<Event> {
        vec![Event::RawDataReceived {
            device: device.clone(),
            bytes: frame.payload.clone(),
        }]
    }
}

/// Splits a byte stream into lines.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: BytesMut,
    discarding: bool,
}

impl LineDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameDecoder for LineDecoder {
    fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    fn decode(&mut self) -> Result<Option<Frame>, FrameError> {
        let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') else {
            if self.buffer.len() > MAX_LINE {
                let dropped = self.buffer.len();
                self.buffer.clear();
                self.discarding = true;
                return Err(FrameError::InvalidLength(dropped));
            }
            return Ok(None);
        };

        let mut line = self.buffer.split_to(pos + 1).freeze();
        if std::mem::take(&mut self.discarding) {
            return self.decode();
        }
        if line.len() > MAX_LINE + 1 {
            return Err(FrameError::InvalidLength(line.len()));
        }

        line.truncate(pos);
        if line.last() == Some(&b'\r') {
            line.truncate(pos - 1);
        }
        Ok(Some(Frame {
            kind: FrameKind::Line,
            id: 0,
            target: 0,
            status: 0,
            payload: line,
        }))
    }

    fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn clear(&mut self) {
        self.buffer.clear();
        self.discarding = false;
    }
}
