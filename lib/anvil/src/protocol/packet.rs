//! Framed packets: `varint(total) ‖ varint(id) ‖ fields`. The total counts
//! the id and the payload. Parsing validates against the registry; reading a
//! field with the wrong type is a programmer error and panics.

use super::codec::{CodecError, CodecResult, Reader, Writer};
use super::registry::{self, FieldType, PacketSpec};
use super::{Direction, ProtocolError, ProtocolState};

/// One decoded field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    VarInt(u32),
    Str(String),
    Bytes(Vec<u8>),
}

impl FieldValue {
    fn matches(&self, field_type: FieldType) -> bool {
        matches!(
            (self, field_type),
            (FieldValue::Bool(_), FieldType::Bool)
                | (FieldValue::I8(_), FieldType::I8)
                | (FieldValue::U8(_), FieldType::U8)
                | (FieldValue::I16(_), FieldType::I16)
                | (FieldValue::U16(_), FieldType::U16)
                | (FieldValue::I32(_), FieldType::I32)
                | (FieldValue::I64(_), FieldType::I64)
                | (FieldValue::U64(_), FieldType::U64)
                | (FieldValue::F32(_), FieldType::F32)
                | (FieldValue::F64(_), FieldType::F64)
                | (FieldValue::VarInt(_), FieldType::VarInt)
                | (FieldValue::Str(_), FieldType::Str)
                | (FieldValue::Bytes(_), FieldType::Bytes(_))
        )
    }
}

/// A tagged payload: id plus positional typed fields, valid under the spec
/// it was built against.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    id: u32,
    fields: Vec<FieldValue>,
}

impl Packet {
    /// Builds a packet, checking every field against the registry entry for
    /// the tuple. Mismatched construction is a programmer error.
    pub fn new(
        state: ProtocolState,
        direction: Direction,
        id: u32,
        fields: Vec<FieldValue>,
    ) -> Packet {
        let spec = registry::lookup(state, direction, id).unwrap_or_else(|| {
            panic!(
                "constructing unregistered packet {:?}/{:?}/{:#04x}",
                state, direction, id
            )
        });

        assert_eq!(
            fields.len(),
            spec.fields.len(),
            "packet {} expects {} fields, got {}",
            spec.name,
            spec.fields.len(),
            fields.len()
        );

        for (index, (value, &field_type)) in fields.iter().zip(spec.fields).enumerate() {
            assert!(
                value.matches(field_type),
                "packet {} field {} expects {:?}, got {:?}",
                spec.name,
                index,
                field_type,
                value
            );
        }

        Packet { id, fields }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    fn field(&self, index: usize) -> &FieldValue {
        &self.fields[index]
    }

    pub fn bool(&self, index: usize) -> bool {
        match self.field(index) {
            FieldValue::Bool(v) => *v,
            other => panic!("field {} is {:?}, expected bool", index, other),
        }
    }

    pub fn u8(&self, index: usize) -> u8 {
        match self.field(index) {
            FieldValue::U8(v) => *v,
            other => panic!("field {} is {:?}, expected u8", index, other),
        }
    }

    pub fn i16(&self, index: usize) -> i16 {
        match self.field(index) {
            FieldValue::I16(v) => *v,
            other => panic!("field {} is {:?}, expected i16", index, other),
        }
    }

    pub fn u16(&self, index: usize) -> u16 {
        match self.field(index) {
            FieldValue::U16(v) => *v,
            other => panic!("field {} is {:?}, expected u16", index, other),
        }
    }

    pub fn i32(&self, index: usize) -> i32 {
        match self.field(index) {
            FieldValue::I32(v) => *v,
            other => panic!("field {} is {:?}, expected i32", index, other),
        }
    }

    pub fn u64(&self, index: usize) -> u64 {
        match self.field(index) {
            FieldValue::U64(v) => *v,
            other => panic!("field {} is {:?}, expected u64", index, other),
        }
    }

    pub fn f32(&self, index: usize) -> f32 {
        match self.field(index) {
            FieldValue::F32(v) => *v,
            other => panic!("field {} is {:?}, expected f32", index, other),
        }
    }

    pub fn f64(&self, index: usize) -> f64 {
        match self.field(index) {
            FieldValue::F64(v) => *v,
            other => panic!("field {} is {:?}, expected f64", index, other),
        }
    }

    pub fn varint(&self, index: usize) -> u32 {
        match self.field(index) {
            FieldValue::VarInt(v) => *v,
            other => panic!("field {} is {:?}, expected varint", index, other),
        }
    }

    pub fn str(&self, index: usize) -> &str {
        match self.field(index) {
            FieldValue::Str(v) => v,
            other => panic!("field {} is {:?}, expected string", index, other),
        }
    }

    pub fn bytes(&self, index: usize) -> &[u8] {
        match self.field(index) {
            FieldValue::Bytes(v) => v,
            other => panic!("field {} is {:?}, expected bytes", index, other),
        }
    }
}

/// Result of offering a buffer to the parser.
#[derive(Debug, PartialEq)]
pub enum ParseOutcome {
    /// A whole packet decoded; `consumed` bytes of input are spent.
    Packet { packet: Packet, consumed: usize },
    /// The frame is incomplete. Nothing was consumed.
    MoreNeeded,
}

/// Cheap completeness probe: does `input` start with a whole frame? Frames
/// with malformed length prefixes report as complete so the full parse can
/// surface the real error.
pub fn frame_ready(input: &[u8]) -> bool {
    let mut reader = Reader::new(input);
    match reader.read_varint() {
        Ok(length) => reader.remaining() >= length as usize,
        Err(CodecError::InsufficientBytes) => false,
        Err(_) => true,
    }
}

/// Parses one packet off the front of `input`. On `MoreNeeded` the buffer is
/// logically untouched; the caller keeps its bytes and retries later.
pub fn parse(
    state: ProtocolState,
    direction: Direction,
    input: &[u8],
) -> Result<ParseOutcome, ProtocolError> {
    let mut reader = Reader::new(input);

    let length = match reader.read_varint() {
        Ok(length) => length as usize,
        Err(CodecError::InsufficientBytes) => return Ok(ParseOutcome::MoreNeeded),
        Err(err) => return Err(err.into()),
    };

    if reader.remaining() < length {
        return Ok(ParseOutcome::MoreNeeded);
    }

    let header = reader.position();
    let body = &input[header..header + length];

    let mut body_reader = Reader::new(body);
    let id = match body_reader.read_varint() {
        Ok(id) => id,
        // The frame is complete, so running short here means the declared
        // length lied. That is a violation, not a retry.
        Err(CodecError::InsufficientBytes) => {
            return Err(CodecError::BadFormat("frame shorter than its id").into())
        }
        Err(err) => return Err(err.into()),
    };

    let spec = registry::lookup(state, direction, id)
        .ok_or(ProtocolError::BadPacketId { state, id })?;

    let mut fields = Vec::with_capacity(spec.fields.len());
    for &field_type in spec.fields {
        match decode_field(&mut body_reader, field_type) {
            Ok(value) => fields.push(value),
            Err(CodecError::InsufficientBytes) => {
                return Err(CodecError::BadFormat("fields overrun frame length").into())
            }
            Err(err) => return Err(err.into()),
        }
    }

    if body_reader.remaining() != 0 {
        return Err(CodecError::BadFormat("trailing bytes in frame").into());
    }

    Ok(ParseOutcome::Packet {
        packet: Packet { id, fields },
        consumed: header + length,
    })
}

fn decode_field(reader: &mut Reader, field_type: FieldType) -> CodecResult<FieldValue> {
    Ok(match field_type {
        FieldType::Bool => FieldValue::Bool(reader.read_bool()?),
        FieldType::I8 => FieldValue::I8(reader.read_i8()?),
        FieldType::U8 => FieldValue::U8(reader.read_u8()?),
        FieldType::I16 => FieldValue::I16(reader.read_i16()?),
        FieldType::U16 => FieldValue::U16(reader.read_u16()?),
        FieldType::I32 => FieldValue::I32(reader.read_i32()?),
        FieldType::I64 => FieldValue::I64(reader.read_i64()?),
        FieldType::U64 => FieldValue::U64(reader.read_u64()?),
        FieldType::F32 => FieldValue::F32(reader.read_f32()?),
        FieldType::F64 => FieldValue::F64(reader.read_f64()?),
        FieldType::VarInt => FieldValue::VarInt(reader.read_varint()?),
        FieldType::Str => FieldValue::Str(reader.read_string()?),
        FieldType::Bytes(prefix) => FieldValue::Bytes(reader.read_bytes(prefix)?),
    })
}

/// Serializes a packet into its framed wire form, appended to `out`.
pub fn serialize(
    state: ProtocolState,
    direction: Direction,
    packet: &Packet,
    out: &mut Vec<u8>,
) -> Result<(), ProtocolError> {
    let spec = registry::lookup(state, direction, packet.id).unwrap_or_else(|| {
        panic!(
            "serializing unregistered packet {:?}/{:?}/{:#04x}",
            state, direction, packet.id
        )
    });

    let mut body = Writer::with_capacity(16);
    body.write_varint(packet.id);
    encode_fields(spec, packet, &mut body)?;
    let body = body.into_bytes();

    let mut header = Writer::with_capacity(body.len() + 4);
    header.write_varint(body.len() as u32);
    out.extend_from_slice(&header.into_bytes());
    out.extend_from_slice(&body);
    Ok(())
}

fn encode_fields(spec: &PacketSpec, packet: &Packet, body: &mut Writer) -> CodecResult<()> {
    assert_eq!(
        packet.fields.len(),
        spec.fields.len(),
        "packet {} field count mismatch",
        spec.name
    );

    for (index, (value, &field_type)) in packet.fields.iter().zip(spec.fields).enumerate() {
        assert!(
            value.matches(field_type),
            "packet {} field {} expects {:?}, got {:?}",
            spec.name,
            index,
            field_type,
            value
        );

        match value {
            FieldValue::Bool(v) => body.write_bool(*v),
            FieldValue::I8(v) => body.write_i8(*v),
            FieldValue::U8(v) => body.write_u8(*v),
            FieldValue::I16(v) => body.write_i16(*v),
            FieldValue::U16(v) => body.write_u16(*v),
            FieldValue::I32(v) => body.write_i32(*v),
            FieldValue::I64(v) => body.write_i64(*v),
            FieldValue::U64(v) => body.write_u64(*v),
            FieldValue::F32(v) => body.write_f32(*v),
            FieldValue::F64(v) => body.write_f64(*v),
            FieldValue::VarInt(v) => body.write_varint(*v),
            FieldValue::Str(v) => body.write_string(v)?,
            FieldValue::Bytes(v) => {
                let prefix = match field_type {
                    FieldType::Bytes(prefix) => prefix,
                    _ => unreachable!(),
                };
                body.write_bytes(prefix, v)?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::registry::ids;
    use super::super::Direction::{Clientbound, Serverbound};
    use super::super::ProtocolState::{Authenticated, Connected};
    use super::*;

    fn keep_alive(token: u64) -> Packet {
        Packet::new(
            Authenticated,
            Serverbound,
            ids::play::KEEP_ALIVE,
            vec![FieldValue::U64(token)],
        )
    }

    #[test]
    fn test_frame_roundtrip() {
        let packet = keep_alive(0xDEADBEEF);
        let mut wire = Vec::new();
        serialize(Authenticated, Serverbound, &packet, &mut wire).unwrap();

        // length(9) ‖ id(0x00) ‖ u64 token
        assert_eq!(wire.len(), 10);
        assert_eq!(wire[0], 9);
        assert_eq!(wire[1], 0x00);

        match parse(Authenticated, Serverbound, &wire).unwrap() {
            ParseOutcome::Packet { packet, consumed } => {
                assert_eq!(consumed, wire.len());
                assert_eq!(packet.id(), ids::play::KEEP_ALIVE);
                assert_eq!(packet.u64(0), 0xDEADBEEF);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_partial_frame_leaves_buffer() {
        let packet = keep_alive(7);
        let mut wire = Vec::new();
        serialize(Authenticated, Serverbound, &packet, &mut wire).unwrap();

        // Every strict prefix is MoreNeeded, never an error.
        for end in 0..wire.len() {
            let outcome = parse(Authenticated, Serverbound, &wire[..end]).unwrap();
            assert_eq!(outcome, ParseOutcome::MoreNeeded, "prefix of {} bytes", end);
            assert!(!frame_ready(&wire[..end]));
        }
        assert!(frame_ready(&wire));
    }

    #[test]
    fn test_appending_bytes_never_loses_packets() {
        let mut wire = Vec::new();
        serialize(Authenticated, Serverbound, &keep_alive(1), &mut wire).unwrap();
        serialize(
            Authenticated,
            Serverbound,
            &Packet::new(
                Authenticated,
                Serverbound,
                ids::play::CHAT,
                vec![FieldValue::Str("hi".to_owned())],
            ),
            &mut wire,
        )
        .unwrap();

        // Feed the stream byte by byte, counting parsed packets.
        let mut buffer = Vec::new();
        let mut parsed = 0;
        for &byte in &wire {
            buffer.push(byte);
            while let ParseOutcome::Packet { consumed, .. } =
                parse(Authenticated, Serverbound, &buffer).unwrap()
            {
                buffer.drain(..consumed);
                parsed += 1;
            }
        }

        assert_eq!(parsed, 2);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_unknown_id_is_bad_packet() {
        // length=1, id=0x7E: nothing registered there.
        let wire = [0x01, 0x7E];
        match parse(Connected, Serverbound, &wire) {
            Err(ProtocolError::BadPacketId { state, id }) => {
                assert_eq!(state, Connected);
                assert_eq!(id, 0x7E);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let packet = keep_alive(1);
        let mut wire = Vec::new();
        serialize(Authenticated, Serverbound, &packet, &mut wire).unwrap();

        // Grow the declared length and pad the frame with one junk byte.
        wire[0] += 1;
        wire.push(0xAA);

        assert_eq!(
            parse(Authenticated, Serverbound, &wire).unwrap_err(),
            ProtocolError::Codec(CodecError::BadFormat("trailing bytes in frame"))
        );
    }

    #[test]
    fn test_lying_length_rejected() {
        // Frame claims 12 bytes but the keep-alive body is 9; the field
        // decode runs out inside the frame.
        let packet = keep_alive(1);
        let mut wire = Vec::new();
        serialize(Authenticated, Serverbound, &packet, &mut wire).unwrap();
        wire[0] = 6;

        assert_eq!(
            parse(Authenticated, Serverbound, &wire[..7]).unwrap_err(),
            ProtocolError::Codec(CodecError::BadFormat("fields overrun frame length"))
        );
    }

    #[test]
    fn test_multi_field_roundtrip() {
        let packet = Packet::new(
            Connected,
            Serverbound,
            ids::login::HANDSHAKE,
            vec![
                FieldValue::VarInt(51),
                FieldValue::Str("notch".to_owned()),
                FieldValue::Str("localhost".to_owned()),
                FieldValue::I32(25565),
            ],
        );

        let mut wire = Vec::new();
        serialize(Connected, Serverbound, &packet, &mut wire).unwrap();

        match parse(Connected, Serverbound, &wire).unwrap() {
            ParseOutcome::Packet { packet, .. } => {
                assert_eq!(packet.varint(0), 51);
                assert_eq!(packet.str(1), "notch");
                assert_eq!(packet.str(2), "localhost");
                assert_eq!(packet.i32(3), 25565);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_bytes_field_roundtrip() {
        let packet = Packet::new(
            Connected,
            Serverbound,
            ids::login::ENCRYPTION_RESPONSE,
            vec![
                FieldValue::Bytes(vec![1; 16]),
                FieldValue::Bytes(vec![9, 9, 9, 9]),
            ],
        );

        let mut wire = Vec::new();
        serialize(Connected, Serverbound, &packet, &mut wire).unwrap();

        match parse(Connected, Serverbound, &wire).unwrap() {
            ParseOutcome::Packet { packet, .. } => {
                assert_eq!(packet.bytes(0), &[1; 16][..]);
                assert_eq!(packet.bytes(1), &[9, 9, 9, 9][..]);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_oversized_list_refused_on_serialize() {
        let packet = Packet::new(
            Connected,
            Serverbound,
            ids::login::ENCRYPTION_RESPONSE,
            vec![
                FieldValue::Bytes(vec![0; i16::MAX as usize + 1]),
                FieldValue::Bytes(Vec::new()),
            ],
        );

        let mut wire = Vec::new();
        assert_eq!(
            serialize(Connected, Serverbound, &packet, &mut wire).unwrap_err(),
            ProtocolError::Codec(CodecError::BadFormat("array exceeds prefix range"))
        );
    }

    #[test]
    #[should_panic(expected = "expects U64")]
    fn test_wrong_field_type_panics() {
        Packet::new(
            Authenticated,
            Serverbound,
            ids::play::KEEP_ALIVE,
            vec![FieldValue::I32(5)],
        );
    }

    #[test]
    fn test_registry_samples_roundtrip() {
        let samples = vec![
            (
                Authenticated,
                Clientbound,
                Packet::new(
                    Authenticated,
                    Clientbound,
                    ids::play::TIME_UPDATE,
                    vec![FieldValue::U64(1000), FieldValue::U64(6000)],
                ),
            ),
            (
                Authenticated,
                Clientbound,
                Packet::new(
                    Authenticated,
                    Clientbound,
                    ids::play::BLOCK_CHANGE,
                    vec![
                        FieldValue::I32(-16),
                        FieldValue::U8(64),
                        FieldValue::I32(7),
                        FieldValue::VarInt(276),
                        FieldValue::U8(2),
                    ],
                ),
            ),
            (
                Authenticated,
                Clientbound,
                Packet::new(
                    Authenticated,
                    Clientbound,
                    ids::play::POSITION_AND_LOOK,
                    vec![
                        FieldValue::F64(0.5),
                        FieldValue::F64(65.0),
                        FieldValue::F64(66.62),
                        FieldValue::F64(0.5),
                        FieldValue::F32(0.0),
                        FieldValue::F32(0.0),
                        FieldValue::Bool(true),
                    ],
                ),
            ),
        ];

        for (state, direction, packet) in samples {
            let mut wire = Vec::new();
            serialize(state, direction, &packet, &mut wire).unwrap();
            match parse(state, direction, &wire).unwrap() {
                ParseOutcome::Packet {
                    packet: decoded,
                    consumed,
                } => {
                    assert_eq!(consumed, wire.len());
                    assert_eq!(decoded, packet);
                }
                other => panic!("unexpected outcome {:?}", other),
            }
        }
    }
}
