//! The message protocol: connect byte, fixed header, header fields, body.
//!
//! A binary message is a 16-byte fixed header (endianness byte, type, flags,
//! version, body length, serial, header-fields length), an 8-aligned array
//! of header fields, and an optional body whose layout is given by the
//! signature captured from the SIGNATURE header field.

use bitflags::bitflags;
use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive;

use super::cursor::{round_to_8, Buffer, Endian};
use super::emit::{InfoColumn, NodeEmitter, NodeKind, Value};
use super::signature::{SigCursor, TypeCode};
use super::value::{FieldCtx, ValueDecoder};
use super::{Step, MAX_PACKET_LEN};

/// Length of the fixed message header.
pub const MESSAGE_HEADER_LENGTH: usize = 16;

/// The kind of traffic a message carries, from byte 1 of its header.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Primitive)]
pub enum MessageType {
    /// Never valid on the wire; used to reject non-message buffers.
    Invalid = 0,
    /// A method call.
    MethodCall = 1,
    /// A reply to a method call.
    MethodReply = 2,
    /// An error reply.
    ErrorReply = 3,
    /// A signal emission.
    Signal = 4,
}

impl MessageType {
    /// The display string for the info column and the header tree.
    pub fn display_name(self) -> &'static str {
        match self {
            MessageType::Invalid => "Invalid type",
            MessageType::MethodCall => "Method call",
            MessageType::MethodReply => "Method reply with returned data",
            MessageType::ErrorReply => "Error reply",
            MessageType::Signal => "Signal emission",
        }
    }
}

/// Header field codes carried in the variable region of a message header.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Primitive)]
#[allow(missing_docs)]
pub enum HeaderFieldCode {
    Invalid = 0x00,
    ObjectPath = 0x01,
    Interface = 0x02,
    Member = 0x03,
    ErrorName = 0x04,
    ReplySerial = 0x05,
    Destination = 0x06,
    Sender = 0x07,
    Signature = 0x08,
    Handles = 0x09,
    // AllJoyn-specific codes start at 0x10.
    Timestamp = 0x10,
    TimeToLive = 0x11,
    CompressionToken = 0x12,
    SessionId = 0x13,
}

impl HeaderFieldCode {
    /// The display string for the header field tree.
    pub fn display_name(self) -> &'static str {
        match self {
            HeaderFieldCode::Invalid => "Invalid",
            HeaderFieldCode::ObjectPath => "Object Path",
            HeaderFieldCode::Interface => "Interface",
            HeaderFieldCode::Member => "Member",
            HeaderFieldCode::ErrorName => "Error Name",
            HeaderFieldCode::ReplySerial => "Reply Serial",
            HeaderFieldCode::Destination => "Destination",
            HeaderFieldCode::Sender => "Sender",
            HeaderFieldCode::Signature => "Signature",
            HeaderFieldCode::Handles => "Handles",
            HeaderFieldCode::Timestamp => "Time stamp",
            HeaderFieldCode::TimeToLive => "Time to live",
            HeaderFieldCode::CompressionToken => "Compression token",
            HeaderFieldCode::SessionId => "Session ID",
        }
    }
}

bitflags! {
    /// The flags byte of a message header. Bit 0x08 is unused.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MessageFlags: u8 {
        /// No reply expected.
        const NO_REPLY_EXPECTED = 0x01;
        /// No auto start.
        const NO_AUTO_START = 0x02;
        /// Allow remote messages.
        const ALLOW_REMOTE_MSG = 0x04;
        /// Sessionless.
        const SESSIONLESS = 0x10;
        /// Allow global broadcast.
        const GLOBAL_BROADCAST = 0x20;
        /// Compressed.
        const COMPRESSED = 0x40;
        /// Encrypted.
        const ENCRYPTED = 0x80;
    }
}

impl MessageFlags {
    fn describe(self) -> String {
        const NAMES: [(MessageFlags, &str); 7] = [
            (MessageFlags::ENCRYPTED, "Encrypted"),
            (MessageFlags::COMPRESSED, "Compressed"),
            (MessageFlags::GLOBAL_BROADCAST, "Allow global broadcast"),
            (MessageFlags::SESSIONLESS, "Sessionless"),
            (MessageFlags::ALLOW_REMOTE_MSG, "Allow remote messages"),
            (MessageFlags::NO_AUTO_START, "No auto start"),
            (MessageFlags::NO_REPLY_EXPECTED, "No reply expected"),
        ];

        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        set.join(", ")
    }
}

fn endianness_of(byte: u8) -> Option<Endian> {
    match byte {
        b'l' => Some(Endian::Little),
        b'B' => Some(Endian::Big),
        _ => None,
    }
}

/// Whether the bytes at offset 0 could start a binary message: a valid
/// endianness byte and a nonzero message type. Reads nothing else.
pub(crate) fn probe(buf: &Buffer<'_>) -> bool {
    let endian = buf.get_u8(0).ok().and_then(endianness_of);
    let message_type = buf.get_u8(1).ok();
    endian.is_some() && message_type.is_some_and(|t| t != MessageType::Invalid as u8)
}

/// Handles the single `0x00` byte a client sends when it first connects.
pub(crate) fn handle_connect<'a, E: NodeEmitter<'a>>(
    buf: &Buffer<'a>,
    offset: usize,
    emitter: &mut E,
    info: &mut InfoColumn,
) -> Step {
    match buf.get_u8(offset) {
        Ok(0) => {
            info.set("CONNECT-initial byte");
            emitter.open(NodeKind::ConnectInitialByte, offset..offset + 1);
            emitter.item(NodeKind::Byte, offset..offset + 1, Value::U8(0));
            emitter.close();
            Step::Advanced(offset + 1)
        }
        _ => Step::NotMine,
    }
}

/// Decodes one binary message starting at `offset`.
pub(crate) fn handle_message<'a, E: NodeEmitter<'a>>(
    buf: &Buffer<'a>,
    offset: usize,
    emitter: &mut E,
    info: &mut InfoColumn,
    can_desegment: bool,
) -> Step {
    let Some(endian) = buf.get_u8(offset).ok().and_then(endianness_of) else {
        return Step::NotMine;
    };

    let Ok(type_byte) = buf.get_u8(offset + 1) else {
        return Step::NotMine;
    };
    if type_byte == MessageType::Invalid as u8 {
        return Step::NotMine;
    }

    let remaining = buf.remaining(offset);
    if remaining < MESSAGE_HEADER_LENGTH || remaining > MAX_PACKET_LEN {
        info.set(format!(
            "BAD DATA: Remaining packet length is {}. Expected >= {} && <= {}",
            remaining, MESSAGE_HEADER_LENGTH, MAX_PACKET_LEN
        ));
        return Step::Drained;
    }

    // The fixed header is fully captured from here on.
    let body_length = match buf.get_u32(offset + 4, endian) {
        Ok(v) => v as usize,
        Err(_) => return Step::Drained,
    };
    let serial = match buf.get_u32(offset + 8, endian) {
        Ok(v) => v,
        Err(_) => return Step::Drained,
    };
    let header_length = match buf.get_u32(offset + 12, endian) {
        Ok(v) => v as usize,
        Err(_) => return Step::Drained,
    };

    if round_to_8(header_length) as u64 + body_length as u64 + MESSAGE_HEADER_LENGTH as u64
        > remaining as u64
    {
        if can_desegment {
            log::debug!(
                "message at {} declares {} header + {} body bytes, {} remaining; requesting more",
                offset,
                header_length,
                body_length,
                remaining
            );
            return Step::NeedMore;
        }

        info.set(format!(
            "BAD DATA: Remaining packet length is {}. Expected >= {} && <= {}",
            remaining,
            round_to_8(header_length) + body_length + MESSAGE_HEADER_LENGTH,
            MAX_PACKET_LEN
        ));
        return Step::Drained;
    }

    let type_str = MessageType::from_u8(type_byte)
        .map(MessageType::display_name)
        .unwrap_or("Unexpected message type");
    info.set(format!("Message {:010}: '{}'", serial, type_str));

    emitter.open(
        NodeKind::MessageHeader,
        offset..offset + MESSAGE_HEADER_LENGTH,
    );

    emitter.item(
        NodeKind::Endianness,
        offset..offset + 1,
        Value::U8(match endian {
            Endian::Little => b'l',
            Endian::Big => b'B',
        }),
    );
    emitter.label(match endian {
        Endian::Little => "Little endian",
        Endian::Big => "Big endian",
    });

    emitter.item(
        NodeKind::MessageType,
        offset + 1..offset + 2,
        Value::U8(type_byte),
    );
    emitter.label(type_str);

    let flags_byte = buf.get_u8(offset + 2).unwrap_or(0);
    let flags = MessageFlags::from_bits_truncate(flags_byte);
    emitter.item(
        NodeKind::Flags,
        offset + 2..offset + 3,
        Value::U8(flags_byte),
    );
    emitter.label(&flags.describe());

    emitter.item(
        NodeKind::MajorVersion,
        offset + 3..offset + 4,
        Value::U8(buf.get_u8(offset + 3).unwrap_or(0)),
    );
    emitter.item(
        NodeKind::BodyLength,
        offset + 4..offset + 8,
        Value::U32(body_length as u32),
    );
    emitter.item(NodeKind::Serial, offset + 8..offset + 12, Value::U32(serial));
    emitter.item(
        NodeKind::HeaderLength,
        offset + 12..offset + 16,
        Value::U32(header_length as u32),
    );

    emitter.close();

    // Alignment within a message is relative to its header start, so the
    // fields begin right after the fixed header.
    let fields_start = offset + MESSAGE_HEADER_LENGTH;
    let mut decoder = ValueDecoder::new(*buf, endian, offset, emitter, info);
    decode_header_fields(&mut decoder, fields_start, header_length);

    let body_start = fields_start + round_to_8(header_length);
    let signature = decoder.captured_signature.unwrap_or(&[]);

    let end = if body_length > 0 && !signature.is_empty() {
        decode_body(&mut decoder, body_start, body_length, signature)
    } else if body_length > 0 {
        // A body we cannot describe; skip it rather than re-dissecting its
        // bytes as a fresh message.
        (body_start + body_length).min(buf.reported_len())
    } else {
        body_start
    };

    if decoder.drained() {
        Step::Drained
    } else {
        Step::Advanced(end)
    }
}

fn decode_header_fields<'a, E: NodeEmitter<'a>>(
    decoder: &mut ValueDecoder<'a, '_, E>,
    fields_start: usize,
    header_length: usize,
) {
    decoder
        .emitter()
        .open(NodeKind::HeaderFieldList, fields_start..fields_start + header_length);

    let end_of_header = fields_start + header_length;
    let mut offset = fields_start;

    while offset < end_of_header {
        offset = decode_header_field(decoder, offset);
    }

    decoder.emitter().close();
}

/// One header field: code byte, 0x01, type byte, 0x00, the typed value,
/// padding to 8.
fn decode_header_field<'a, E: NodeEmitter<'a>>(
    decoder: &mut ValueDecoder<'a, '_, E>,
    offset: usize,
) -> usize {
    let buf = decoder.buffer();
    let reported = buf.reported_len();

    let Ok(field_code) = buf.get_u8(offset) else {
        return reported;
    };

    decoder.emitter().open(NodeKind::HeaderField, offset..offset + 1);
    decoder
        .emitter()
        .item(NodeKind::FieldCode, offset..offset + 1, Value::U8(field_code));
    let code_name = HeaderFieldCode::from_u8(field_code)
        .map(HeaderFieldCode::display_name)
        .unwrap_or("Unknown");
    decoder.emitter().label(code_name);

    let mut offset = offset + 1;
    expected_byte(decoder, offset, 0x01);
    offset += 1;

    let type_byte = buf.get_u8(offset).unwrap_or(0);
    decoder
        .emitter()
        .item(NodeKind::TypeId, offset..offset + 1, Value::U8(type_byte));
    let type_name = TypeCode::from_byte(type_byte)
        .map(TypeCode::display_name)
        .unwrap_or("unexpected");
    decoder
        .emitter()
        .label(&format!("Type id: '{}' => {}", printable(type_byte), type_name));
    offset += 1;

    expected_byte(decoder, offset, 0x00);
    offset += 1;

    let ctx = FieldCtx::header_field(field_code);
    let (end, _) = decoder.decode(offset, type_byte, ctx, SigCursor::empty());

    let end = decoder.align(end, 8).min(reported);
    decoder.emitter().set_end(end);
    decoder.emitter().close();

    end
}

/// The sentinel bytes inside a header field. A mismatch is only worth a
/// remark; decoding continues.
fn expected_byte<'a, E: NodeEmitter<'a>>(
    decoder: &mut ValueDecoder<'a, '_, E>,
    offset: usize,
    expected: u8,
) {
    let Ok(value) = decoder.buffer().get_u8(offset) else {
        return;
    };

    decoder
        .emitter()
        .item(NodeKind::ExpectedByte, offset..offset + 1, Value::U8(value));

    if value == expected {
        decoder.emitter().label(&format!("0x{:02x} byte", expected));
    } else {
        log::debug!(
            "header field sentinel at {}: expected 0x{:02x}, found 0x{:02x}",
            offset,
            expected,
            value
        );
        decoder.emitter().label(&format!(
            "Expected '0x{:02x} byte' but found '0x{:02x}'",
            expected, value
        ));
    }
}

fn decode_body<'a, E: NodeEmitter<'a>>(
    decoder: &mut ValueDecoder<'a, '_, E>,
    body_start: usize,
    body_length: usize,
    signature: &'a [u8],
) -> usize {
    let reported = decoder.buffer().reported_len();
    let end_of_body = (body_start + body_length).min(reported);

    decoder
        .emitter()
        .open(NodeKind::BodyParameters, body_start..body_start + body_length);

    let mut sig = SigCursor::new(signature);
    let mut offset = body_start;

    while offset < end_of_body {
        let Some(type_byte) = sig.current() else { break };

        let before = (offset, sig.consumed());
        let (end, after) = decoder.decode(offset, type_byte, FieldCtx::body(), sig);
        offset = end;
        sig = after;

        if (offset, sig.consumed()) == before {
            break;
        }
    }

    decoder.emitter().close();
    offset
}

fn printable(b: u8) -> char {
    if b.is_ascii_graphic() {
        b as char
    } else {
        '?'
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::super::emit::TreeEmitter;
    use super::super::test_util::MessageBuilder;
    use super::*;

    fn run<'a>(
        bytes: &'a [u8],
        emitter: &mut TreeEmitter<'a>,
        info: &mut InfoColumn,
        can_desegment: bool,
    ) -> Step {
        let buf = Buffer::new(bytes);
        handle_message(&buf, 0, emitter, info, can_desegment)
    }

    #[test]
    fn empty_method_call() {
        let bytes = [
            0x6c, 0x01, 0x00, 0x01, // 'l', METHOD_CALL, no flags, version 1
            0x00, 0x00, 0x00, 0x00, // body length 0
            0x2a, 0x00, 0x00, 0x00, // serial 42
            0x00, 0x00, 0x00, 0x00, // header fields length 0
        ];

        let mut tree = TreeEmitter::new();
        let mut info = InfoColumn::new();
        let step = run(&bytes, &mut tree, &mut info, true);

        assert_eq!(step, Step::Advanced(16));
        assert_eq!(info.as_str(), "Message 0000000042: 'Method call'");

        let roots = tree.into_roots();
        let header = &roots[0];
        assert_eq!(header.kind, NodeKind::MessageHeader);
        assert_eq!(header.range, 0..16);
        assert_eq!(
            header.find(NodeKind::Serial).unwrap().value,
            Some(Value::U32(42))
        );
        assert_eq!(
            header.find(NodeKind::HeaderLength).unwrap().value,
            Some(Value::U32(0))
        );
    }

    #[test]
    fn signal_with_member() {
        let bytes = MessageBuilder::new(Endian::Little, MessageType::Signal, 7)
            .string_field(HeaderFieldCode::Member, "Foo")
            .build();

        let mut tree = TreeEmitter::new();
        let mut info = InfoColumn::new();
        let step = run(&bytes, &mut tree, &mut info, true);

        assert_eq!(step, Step::Advanced(bytes.len()));
        assert_eq!(info.as_str(), "Message 0000000007: 'Signal emission' Foo");

        let roots = tree.into_roots();
        let field = roots
            .iter()
            .find_map(|r| r.find(NodeKind::HeaderField))
            .unwrap();
        assert_eq!(field.children[0].label, "Member");
        assert_eq!(
            field.find(NodeKind::StringData).unwrap().value,
            Some(Value::Bytes(b"Foo\0" as &[u8]))
        );
    }

    #[test]
    fn reply_serial_annotation() {
        let bytes = MessageBuilder::new(Endian::Little, MessageType::MethodReply, 43)
            .u32_field(HeaderFieldCode::ReplySerial, 42)
            .build();

        let mut tree = TreeEmitter::new();
        let mut info = InfoColumn::new();
        let step = run(&bytes, &mut tree, &mut info, true);

        assert_eq!(step, Step::Advanced(bytes.len()));
        assert_eq!(
            info.as_str(),
            "Message 0000000043: 'Method reply with returned data' Replies to: 000000042"
        );
    }

    #[test]
    fn body_with_signature() {
        let bytes = MessageBuilder::new(Endian::Little, MessageType::MethodCall, 1)
            .signature_field("u")
            .body(&[0x2a, 0x00, 0x00, 0x00])
            .build();

        let mut tree = TreeEmitter::new();
        let mut info = InfoColumn::new();
        let step = run(&bytes, &mut tree, &mut info, true);

        assert_eq!(step, Step::Advanced(bytes.len()));
        assert_eq!(info.as_str(), "Message 0000000001: 'Method call' (u)");

        let roots = tree.into_roots();
        let body = roots
            .iter()
            .find_map(|r| r.find(NodeKind::BodyParameters))
            .unwrap();
        assert_eq!(body.children[0].value, Some(Value::U32(42)));
    }

    #[test]
    fn big_endian_message() {
        let bytes = MessageBuilder::new(Endian::Big, MessageType::MethodCall, 0x0102_0304)
            .signature_field("q")
            .body(&[0x12, 0x34])
            .build();

        let mut tree = TreeEmitter::new();
        let mut info = InfoColumn::new();
        let step = run(&bytes, &mut tree, &mut info, true);

        assert_eq!(step, Step::Advanced(bytes.len()));
        assert_eq!(info.as_str(), "Message 0016909060: 'Method call' (q)");

        let roots = tree.into_roots();
        let body = roots
            .iter()
            .find_map(|r| r.find(NodeKind::BodyParameters))
            .unwrap();
        assert_eq!(body.children[0].value, Some(Value::U16(0x1234)));
    }

    #[test]
    fn not_a_message() {
        let mut tree = TreeEmitter::new();
        let mut info = InfoColumn::new();

        // Bad endianness byte.
        assert_eq!(
            run(&[0x6d, 0x01, 0, 0], &mut tree, &mut info, true),
            Step::NotMine
        );
        // Invalid message type.
        assert_eq!(
            run(&[0x6c, 0x00, 0, 0], &mut tree, &mut info, true),
            Step::NotMine
        );
    }

    #[test]
    fn short_message_drains() {
        let bytes = [0x6c, 0x01, 0x00, 0x01, 0x00, 0x00];

        let mut tree = TreeEmitter::new();
        let mut info = InfoColumn::new();
        let step = run(&bytes, &mut tree, &mut info, true);

        assert_eq!(step, Step::Drained);
        assert_eq!(
            info.as_str(),
            "BAD DATA: Remaining packet length is 6. Expected >= 16 && <= 135168"
        );
    }

    #[test]
    fn split_message_requests_desegmentation() {
        let mut bytes = MessageBuilder::new(Endian::Little, MessageType::MethodCall, 1)
            .signature_field("u")
            .body(&[0x2a, 0x00, 0x00, 0x00])
            .build();
        bytes.truncate(bytes.len() - 2);

        let mut tree = TreeEmitter::new();
        let mut info = InfoColumn::new();

        assert_eq!(run(&bytes, &mut tree, &mut info, true), Step::NeedMore);
        assert_eq!(run(&bytes, &mut tree, &mut info, false), Step::Drained);
    }

    #[test]
    fn unexpected_message_type_still_decodes() {
        let bytes = [
            0x6c, 0x09, 0x00, 0x01, //
            0x00, 0x00, 0x00, 0x00, //
            0x05, 0x00, 0x00, 0x00, //
            0x00, 0x00, 0x00, 0x00,
        ];

        let mut tree = TreeEmitter::new();
        let mut info = InfoColumn::new();
        let step = run(&bytes, &mut tree, &mut info, true);

        assert_eq!(step, Step::Advanced(16));
        assert_eq!(info.as_str(), "Message 0000000005: 'Unexpected message type'");
    }

    #[test]
    fn sentinel_mismatch_is_soft() {
        let mut bytes = MessageBuilder::new(Endian::Little, MessageType::Signal, 9)
            .string_field(HeaderFieldCode::Member, "Ping")
            .build();
        // Corrupt the first sentinel (field code is at the start of the
        // fields region, the 0x01 sentinel right after).
        bytes[17] = 0x07;

        let mut tree = TreeEmitter::new();
        let mut info = InfoColumn::new();
        let step = run(&bytes, &mut tree, &mut info, true);

        assert_eq!(step, Step::Advanced(bytes.len()));
        assert_eq!(info.as_str(), "Message 0000000009: 'Signal emission' Ping");

        let roots = tree.into_roots();
        let field = roots
            .iter()
            .find_map(|r| r.find(NodeKind::HeaderField))
            .unwrap();
        let sentinel = field.find(NodeKind::ExpectedByte).unwrap();
        assert_eq!(sentinel.label, "Expected '0x01 byte' but found '0x07'");
    }

    #[test]
    fn flags_describe() {
        let flags = MessageFlags::NO_REPLY_EXPECTED | MessageFlags::ENCRYPTED;
        assert_eq!(flags.describe(), "Encrypted, No reply expected");
        assert_eq!(MessageFlags::empty().describe(), "");
    }
}
