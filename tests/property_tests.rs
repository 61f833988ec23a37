//! Property tests for the frame codecs.

use botlink::protocol::{
    Ev3Codec, FrameCodec, MbotCodec, ParamKind, ParamValue, Params, SpheroCodec, TerminalCodec,
    ev3, mbot, sphero,
};
use proptest::prelude::*;

fn codecs() -> [&'static dyn FrameCodec; 4] {
    [&SpheroCodec, &MbotCodec, &Ev3Codec, &TerminalCodec]
}

/// Maps a raw draw onto the full range of a parameter kind.
fn in_range(kind: ParamKind, raw: u64) -> i64 {
    let (min, max): (i64, i64) = match kind {
        ParamKind::U8 => (0, 0xFF),
        ParamKind::I8 => (-128, 127),
        ParamKind::U16 => (0, 0xFFFF),
        ParamKind::I16 => (-32_768, 32_767),
        ParamKind::U32 => (0, 0xFFFF_FFFF),
        ParamKind::I32 => (i64::from(i32::MIN), i64::from(i32::MAX)),
        ParamKind::Text => (0, 0),
    };
    let span = (max - min) as u64 + 1;
    min + (raw % span) as i64
}

fn frame_count(codec: &dyn FrameCodec, chunks: &[&[u8]]) -> usize {
    let mut decoder = codec.decoder();
    chunks.iter().map(|chunk| decoder.feed(chunk).len()).sum()
}

proptest! {
    #[test]
    fn prop_every_command_decodes_to_itself(
        raws in prop::collection::vec(any::<u64>(), 8),
        text in "[ -~]{0,40}",
    ) {
        for codec in codecs() {
            for command in codec.commands() {
                let mut params = Params::new();
                for (spec, raw) in command.params.iter().zip(&raws) {
                    match spec.kind {
                        ParamKind::Text => params.set(spec.name, text.as_str()),
                        kind => params.set(spec.name, in_range(kind, *raw)),
                    }
                }

                let bytes = codec.encode(command, &params).unwrap();
                prop_assert_eq!(&codec.encode(command, &params).unwrap(), &bytes);

                let decoded = codec.decode_command(&bytes).unwrap();
                prop_assert_eq!(decoded.command.name, command.name);
                prop_assert_eq!(decoded.args, command.bind(&params).unwrap());
            }
        }
    }

    #[test]
    fn prop_sphero_bad_checksum_yields_nothing(
        seq in 0u8..0xFF,
        mrsp in 0u8..0xFE,
        data in prop::collection::vec(0u8..0xFF, 0..64),
        flip in 1u8..=255,
        answer in any::<bool>(),
    ) {
        let good = if answer {
            sphero::encode_reply(mrsp, seq, &data)
        } else {
            sphero::encode_async(seq, &data)
        };
        let mut bad = good.to_vec();
        let last = bad.len() - 1;
        bad[last] ^= flip;

        prop_assert_eq!(frame_count(&SpheroCodec, &[&bad]), 0);
        // The decoder is not left stuck on the damaged frame.
        prop_assert_eq!(frame_count(&SpheroCodec, &[&bad, &good]), 1);
    }

    #[test]
    fn prop_sphero_replies_survive_leading_noise(
        noise in prop::collection::vec(any::<u8>(), 0..16),
        count in 1u8..8,
    ) {
        let mut input = noise;
        for seq in 0..count {
            input.extend_from_slice(&sphero::encode_reply(sphero::MRSP_OK, seq, &[]));
        }

        let frames = SpheroCodec.decoder().feed(&input);
        let count = usize::from(count);
        prop_assert!(frames.len() >= count);
        let seqs: Vec<u8> = frames[frames.len() - count..].iter().map(|f| f.id).collect();
        prop_assert_eq!(seqs, (0..count as u8).collect::<Vec<u8>>());
    }

    #[test]
    fn prop_sphero_reassembles_any_split(
        seq in any::<u8>(),
        data in prop::collection::vec(any::<u8>(), 0..32),
    ) {
        let bytes = sphero::encode_reply(sphero::MRSP_OK, seq, &data);
        for split in 0..=bytes.len() {
            let (head, tail) = bytes.split_at(split);
            prop_assert_eq!(frame_count(&SpheroCodec, &[head, tail]), 1);
        }
    }

    #[test]
    fn prop_mbot_reassembles_any_split(
        idx in prop::sample::select(vec![
            mbot::tag::ULTRASONIC,
            mbot::tag::LINE_FOLLOWER,
            mbot::tag::LIGHT_SENSOR,
            mbot::tag::VERSION,
        ]),
        value in any::<f32>(),
    ) {
        let bytes = mbot::encode_reply(idx, mbot::value_type::FLOAT, &value.to_le_bytes());
        for split in 0..=bytes.len() {
            let (head, tail) = bytes.split_at(split);
            prop_assert_eq!(frame_count(&MbotCodec, &[head, tail]), 1);
        }
    }

    #[test]
    fn prop_ev3_reassembles_any_split(
        tag in any::<u8>(),
        port in 0u8..4,
        status in 0x02u8..=0x05,
        globals in prop::collection::vec(any::<u8>(), 0..16),
    ) {
        let bytes = ev3::encode_reply(tag, port, status, &globals);
        for split in 0..=bytes.len() {
            let (head, tail) = bytes.split_at(split);
            prop_assert_eq!(frame_count(&Ev3Codec, &[head, tail]), 1);
        }
    }

    #[test]
    fn prop_terminal_reassembles_any_split(line in "[ -~]{1,40}") {
        let bytes = format!("{line}\r\n").into_bytes();
        for split in 0..=bytes.len() {
            let (head, tail) = bytes.split_at(split);
            prop_assert_eq!(frame_count(&TerminalCodec, &[head, tail]), 1);
        }
    }
}

#[test]
fn test_out_of_range_params_rejected() {
    let roll = SpheroCodec.command("roll").unwrap();
    let params = Params::new().with("speed", 256).with("heading", 0);
    assert!(SpheroCodec.encode(roll, &params).is_err());

    let line = TerminalCodec.command("send_line").unwrap();
    let params = Params::new().with("text", ParamValue::Int(1));
    assert!(TerminalCodec.encode(line, &params).is_err());
}
