//! Decoders for the two AllJoyn wire protocols.
//!
//! The message protocol (TCP/UDP port 9955) interleaves three kinds of
//! traffic in one stream: a single `0x00` connect byte, line-oriented SASL
//! authentication, and binary messages derived from the D-Bus format. The
//! name service protocol (port 9956) carries WHO-HAS discovery questions
//! and IS-AT advertisement answers.
//!
//! [`dissect_message`] and [`name_service::dissect_name_service`] are the
//! entry points. Both walk one captured [`Buffer`], emit a labeled tree
//! through the caller's [`NodeEmitter`], summarize into an [`InfoColumn`],
//! and report consumption as a [`DissectStatus`]. Corrupt input never
//! panics and never errors out-of-band: it produces a `BAD DATA` diagnostic
//! and consumes the rest of the buffer.

pub mod cursor;
pub mod emit;
pub mod name_service;
pub mod signature;

mod error;
mod message;
mod sasl;
mod value;

pub use cursor::{Buffer, Endian};
pub use emit::{InfoColumn, NodeEmitter, NodeKind, NullEmitter, TreeEmitter, TreeNode, Value};
pub use error::DecodeError;
pub use message::{HeaderFieldCode, MessageFlags, MessageType, MESSAGE_HEADER_LENGTH};
pub use name_service::{IsAtV0Flags, IsAtV1Flags, TransportMask, WhoHasFlags};
pub use sasl::{MAX_SASL_COMMAND_LENGTH, MAX_SASL_PACKET_LENGTH};

/// TCP/UDP port of the message protocol.
pub const MESSAGE_PORT: u16 = 9955;

/// TCP/UDP port of the name service protocol.
pub const NAME_SERVICE_PORT: u16 = 9956;

/// Largest array allowed on the wire. D-Bus allows 2^26; AllJoyn caps
/// arrays at 2^17 bytes.
pub const MAX_ARRAY_LEN: usize = 131072;

/// Largest packet allowed on the wire: a maximum array plus header room.
pub const MAX_PACKET_LEN: usize = MAX_ARRAY_LEN + 4096;

/// Decode recursion cap. Signatures deeper than this are treated as
/// malformed rather than walked.
pub const MAX_NESTING_DEPTH: usize = 64;

/// What one dissection pass did with the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DissectStatus {
    /// The first bytes are not this protocol's; nothing was emitted.
    NotOurs,
    /// A PDU is split across segments. `resume_at` is how much of the
    /// buffer was fully consumed; the host should supply one more segment
    /// and re-dissect from there.
    NeedMore {
        /// Bytes consumed before the incomplete PDU.
        resume_at: usize,
    },
    /// This many bytes were decoded.
    Consumed(usize),
    /// Corruption was diagnosed; the rest of the buffer was consumed to
    /// stop further decoding.
    Drained,
}

/// What one sub-decoder did at a given offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    /// The bytes at the offset belong to a different sub-decoder.
    NotMine,
    /// Consumed up to the returned offset.
    Advanced(usize),
    /// A PDU is incomplete; one more segment is needed.
    NeedMore,
    /// Corruption was diagnosed and the buffer drained.
    Drained,
}

/// Whether the buffer starts with traffic the message dissector claims: a
/// connect byte, a complete SASL line, or a plausible message header.
/// Side-effect free.
pub fn is_message_protocol(buf: &Buffer<'_>) -> bool {
    matches!(buf.get_u8(0), Ok(0)) || sasl::probe(buf) || message::probe(buf)
}

/// Dissects one buffer of message-protocol traffic (port 9955).
///
/// The buffer may hold several PDUs back to back; each is tried as a
/// connect byte, then a SASL line, then a binary message, until the buffer
/// is exhausted or no decoder makes progress. `can_desegment` tells the
/// dissector whether [`DissectStatus::NeedMore`] is worth returning; when
/// the host cannot desegment, a split message is drained instead.
pub fn dissect_message<'a, E: NodeEmitter<'a>>(
    buf: &Buffer<'a>,
    emitter: &mut E,
    info: &mut InfoColumn,
    can_desegment: bool,
) -> DissectStatus {
    if !is_message_protocol(buf) {
        return DissectStatus::NotOurs;
    }

    info.clear();
    let packet_len = buf.reported_len();
    emitter.open(NodeKind::Protocol, 0..packet_len);
    emitter.label("ALLJOYN");

    let mut offset = 0usize;
    let mut last_offset = None;
    let mut outcome = None;

    // Keep going as long as some decoder makes progress.
    while offset < packet_len && last_offset != Some(offset) {
        last_offset = Some(offset);

        if let Step::Advanced(end) = message::handle_connect(buf, offset, emitter, info) {
            offset = end;
        }
        if offset >= packet_len {
            break;
        }

        match sasl::handle_sasl(buf, offset, emitter, info, can_desegment) {
            Step::Advanced(end) => offset = end,
            Step::NeedMore => {
                outcome = Some(DissectStatus::NeedMore { resume_at: offset });
                break;
            }
            Step::NotMine | Step::Drained => {}
        }
        if offset >= packet_len {
            break;
        }

        match message::handle_message(buf, offset, emitter, info, can_desegment) {
            Step::Advanced(end) => offset = end,
            Step::NeedMore => {
                outcome = Some(DissectStatus::NeedMore { resume_at: offset });
                break;
            }
            Step::Drained => {
                offset = packet_len;
                outcome = Some(DissectStatus::Drained);
                break;
            }
            Step::NotMine => {}
        }
    }

    let offset = offset.min(packet_len);
    emitter.set_end(offset);
    emitter.close();

    let status = outcome.unwrap_or(DissectStatus::Consumed(offset));
    log::trace!("message dissection: {:?}", status);
    status
}

#[cfg(test)]
pub(crate) mod test_util {
    //! Builds valid message bytes for tests. Encoding is deliberately not
    //! part of the shipped API, so this stays behind `cfg(test)`.

    use byteorder::{BigEndian, ByteOrder, LittleEndian};

    use super::cursor::{round_to_8, Endian};
    use super::message::{HeaderFieldCode, MessageType, MESSAGE_HEADER_LENGTH};

    pub(crate) struct MessageBuilder {
        endian: Endian,
        message_type: MessageType,
        serial: u32,
        flags: u8,
        fields: Vec<u8>,
        header_length: usize,
        body: Vec<u8>,
    }

    impl MessageBuilder {
        pub(crate) fn new(endian: Endian, message_type: MessageType, serial: u32) -> Self {
            MessageBuilder {
                endian,
                message_type,
                serial,
                flags: 0,
                fields: Vec::new(),
                header_length: 0,
                body: Vec::new(),
            }
        }

        fn put_u32(&mut self, into_fields: bool, v: u32) {
            let mut word = [0u8; 4];
            match self.endian {
                Endian::Little => LittleEndian::write_u32(&mut word, v),
                Endian::Big => BigEndian::write_u32(&mut word, v),
            }
            if into_fields {
                self.fields.extend_from_slice(&word);
            } else {
                self.body.extend_from_slice(&word);
            }
        }

        /// Starts a field: pads to 8, then code, 0x01, type, 0x00.
        fn begin_field(&mut self, code: HeaderFieldCode, type_byte: u8) {
            while self.fields.len() % 8 != 0 {
                self.fields.push(0);
            }
            self.fields
                .extend_from_slice(&[code as u8, 0x01, type_byte, 0x00]);
        }

        pub(crate) fn string_field(mut self, code: HeaderFieldCode, value: &str) -> Self {
            self.begin_field(code, b's');
            self.put_u32(true, value.len() as u32);
            self.fields.extend_from_slice(value.as_bytes());
            self.fields.push(0);
            self.header_length = self.fields.len();
            self
        }

        pub(crate) fn u32_field(mut self, code: HeaderFieldCode, value: u32) -> Self {
            self.begin_field(code, b'u');
            self.put_u32(true, value);
            self.header_length = self.fields.len();
            self
        }

        pub(crate) fn signature_field(mut self, signature: &str) -> Self {
            self.begin_field(HeaderFieldCode::Signature, b'g');
            self.fields.push(signature.len() as u8);
            self.fields.extend_from_slice(signature.as_bytes());
            self.fields.push(0);
            self.header_length = self.fields.len();
            self
        }

        pub(crate) fn body(mut self, bytes: &[u8]) -> Self {
            self.body = bytes.to_vec();
            self
        }

        pub(crate) fn build(self) -> Vec<u8> {
            let mut out = Vec::with_capacity(
                MESSAGE_HEADER_LENGTH + round_to_8(self.fields.len()) + self.body.len(),
            );

            out.push(match self.endian {
                Endian::Little => b'l',
                Endian::Big => b'B',
            });
            out.push(self.message_type as u8);
            out.push(self.flags);
            out.push(1); // major version

            let mut word = [0u8; 4];
            let mut put = |out: &mut Vec<u8>, v: u32| {
                match self.endian {
                    Endian::Little => LittleEndian::write_u32(&mut word, v),
                    Endian::Big => BigEndian::write_u32(&mut word, v),
                }
                out.extend_from_slice(&word);
            };

            put(&mut out, self.body.len() as u32);
            put(&mut out, self.serial);
            put(&mut out, self.header_length as u32);

            out.extend_from_slice(&self.fields);
            while out.len() % 8 != 0 {
                out.push(0);
            }
            out.extend_from_slice(&self.body);
            out
        }
    }
}
