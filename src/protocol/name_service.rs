//! The name service protocol: WHO-HAS questions and IS-AT answers.
//!
//! A name-service packet is a 4-byte header (version nibbles, question
//! count, answer count, timer) followed by the question records and then
//! the answer records. Two message versions exist on the wire; records are
//! linear, so this decoder is a straightforward application of the cursor
//! primitives. Multi-byte values are network order.

use bitflags::bitflags;

use super::cursor::{Buffer, Endian};
use super::emit::{InfoColumn, NodeEmitter, NodeKind, Value};
use super::{DecodeError, DissectStatus};

bitflags! {
    /// Flags of a version 0 WHO-HAS record. Version 1 reserves the byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WhoHasFlags: u8 {
        /// The sender wants TCP endpoints.
        const TCP = 0x08;
        /// The sender wants UDP endpoints.
        const UDP = 0x04;
        /// The sender wants IPv6 endpoints.
        const IPV6 = 0x02;
        /// The sender wants IPv4 endpoints.
        const IPV4 = 0x01;
    }
}

bitflags! {
    /// Flags of a version 0 IS-AT record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IsAtV0Flags: u8 {
        /// A GUID string is present.
        const GUID = 0x20;
        /// The bus-name list is complete.
        const COMPLETE = 0x10;
        /// The daemon listens on TCP.
        const TCP = 0x08;
        /// The daemon listens on UDP.
        const UDP = 0x04;
        /// An IPv6 address is present.
        const IPV6 = 0x02;
        /// An IPv4 address is present.
        const IPV4 = 0x01;
    }
}

bitflags! {
    /// Flags of a version 1 IS-AT record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IsAtV1Flags: u8 {
        /// A GUID string is present.
        const GUID = 0x20;
        /// The bus-name list is complete.
        const COMPLETE = 0x10;
        /// A reliable (TCP) IPv4 endpoint is present.
        const RELIABLE_IPV4 = 0x08;
        /// An unreliable (UDP) IPv4 endpoint is present.
        const UNRELIABLE_IPV4 = 0x04;
        /// A reliable (TCP) IPv6 endpoint is present.
        const RELIABLE_IPV6 = 0x02;
        /// An unreliable (UDP) IPv6 endpoint is present.
        const UNRELIABLE_IPV6 = 0x01;
    }
}

bitflags! {
    /// Which transports a version 1 advertisement applies to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransportMask: u16 {
        /// Local (same device) transport.
        const LOCAL = 0x0001;
        /// Bluetooth transport.
        const BLUETOOTH = 0x0002;
        /// TCP transport.
        const TCP = 0x0004;
        /// Wireless wide-area network transport.
        const WWAN = 0x0008;
        /// Wired local-area network transport.
        const LAN = 0x0010;
        /// ICE protocol transport.
        const ICE = 0x0020;
        /// Wi-Fi Direct transport.
        const WFD = 0x0080;
    }
}

struct NsHeader {
    message_version: u8,
    questions: u8,
    answers: u8,
}

/// Dissects one name-service packet. The packet always counts as fully
/// consumed; truncation mid-record drains with a diagnostic.
pub fn dissect_name_service<'a, E: NodeEmitter<'a>>(
    buf: &Buffer<'a>,
    emitter: &mut E,
    info: &mut InfoColumn,
) -> DissectStatus {
    info.clear();
    emitter.open(NodeKind::Protocol, 0..buf.reported_len());
    emitter.label("ALLJOYN-NS");

    let result = dissect_records(buf, emitter, info);
    emitter.close();

    match result {
        Ok(()) => DissectStatus::Consumed(buf.reported_len()),
        Err(e) => {
            info.set(format!("BAD DATA: {}", e));
            DissectStatus::Drained
        }
    }
}

fn dissect_records<'a, E: NodeEmitter<'a>>(
    buf: &Buffer<'a>,
    emitter: &mut E,
    info: &mut InfoColumn,
) -> Result<(), DecodeError> {
    let header = parse_header(buf, emitter)?;
    let mut offset = 4;

    if matches!(header.message_version, 0 | 1) {
        for _ in 0..header.questions {
            offset = parse_question(buf, offset, header.message_version, emitter)?;
        }
        for _ in 0..header.answers {
            offset = match header.message_version {
                0 => parse_answer_v0(buf, offset, emitter)?,
                _ => parse_answer_v1(buf, offset, emitter)?,
            };
        }
    }

    match header.message_version {
        0 => info.set("VERSION 0"),
        1 => info.set("VERSION 1"),
        v => info.set(format!("VERSION {} UNSUPPORTED", v)),
    }
    if header.answers > 0 {
        info.append(" ISAT");
    }
    if header.questions > 0 {
        info.append(" WHOHAS");
    }

    Ok(())
}

fn parse_header<'a, E: NodeEmitter<'a>>(
    buf: &Buffer<'a>,
    emitter: &mut E,
) -> Result<NsHeader, DecodeError> {
    let version = buf.get_u8(0)?;
    let questions = buf.get_u8(1)?;
    let answers = buf.get_u8(2)?;
    let timer = buf.get_u8(3)?;

    emitter.open(NodeKind::NsHeader, 0..4);
    emitter.item(NodeKind::NsSenderVersion, 0..1, Value::U8(version >> 4));
    emitter.item(NodeKind::NsMessageVersion, 0..1, Value::U8(version & 0x0f));
    emitter.item(NodeKind::NsQuestionCount, 1..2, Value::U8(questions));
    emitter.item(NodeKind::NsAnswerCount, 2..3, Value::U8(answers));
    emitter.item(NodeKind::NsTimer, 3..4, Value::U8(timer));
    emitter.close();

    Ok(NsHeader {
        message_version: version & 0x0f,
        questions,
        answers,
    })
}

/// A length-prefixed ASCII string: 1-byte size, then the characters.
fn parse_string_record<'a, E: NodeEmitter<'a>>(
    buf: &Buffer<'a>,
    offset: usize,
    kind: NodeKind,
    emitter: &mut E,
) -> Result<usize, DecodeError> {
    let size = buf.get_u8(offset)? as usize;
    let data = buf.slice(offset + 1, size)?;

    emitter.open(kind, offset..offset + 1 + size);
    emitter.item(NodeKind::StringLength, offset..offset + 1, Value::U8(size as u8));
    emitter.item(
        NodeKind::StringData,
        offset + 1..offset + 1 + size,
        Value::Bytes(data),
    );
    emitter.close();

    Ok(offset + 1 + size)
}

fn parse_question<'a, E: NodeEmitter<'a>>(
    buf: &Buffer<'a>,
    offset: usize,
    message_version: u8,
    emitter: &mut E,
) -> Result<usize, DecodeError> {
    let flags = buf.get_u8(offset)?;
    let count = buf.get_u8(offset + 1)?;

    emitter.open(NodeKind::NsWhoHas, offset..offset + 2);
    emitter.item(NodeKind::NsWhoHasFlags, offset..offset + 1, Value::U8(flags));
    if message_version == 0 {
        emitter.label(&describe_whohas_flags(WhoHasFlags::from_bits_truncate(flags)));
    }
    // In version 1 the flag bits are reserved; nonzero values are accepted
    // and shown raw.
    emitter.item(NodeKind::NsCount, offset + 1..offset + 2, Value::U8(count));

    let mut offset = offset + 2;
    for _ in 0..count {
        offset = parse_string_record(buf, offset, NodeKind::NsBusName, emitter)?;
    }

    emitter.set_end(offset);
    emitter.close();
    Ok(offset)
}

fn parse_answer_v0<'a, E: NodeEmitter<'a>>(
    buf: &Buffer<'a>,
    offset: usize,
    emitter: &mut E,
) -> Result<usize, DecodeError> {
    let flags = IsAtV0Flags::from_bits_truncate(buf.get_u8(offset)?);
    let count = buf.get_u8(offset + 1)?;

    emitter.open(NodeKind::NsIsAt, offset..offset + 2);
    emitter.item(
        NodeKind::NsIsAtFlags,
        offset..offset + 1,
        Value::U8(flags.bits()),
    );
    emitter.label(&describe_isat_v0_flags(flags));
    emitter.item(NodeKind::NsCount, offset + 1..offset + 2, Value::U8(count));

    let port = buf.get_u16(offset + 2, Endian::Big)?;
    emitter.item(NodeKind::NsPort, offset + 2..offset + 4, Value::U16(port));

    let mut offset = offset + 4;

    if flags.contains(IsAtV0Flags::IPV6) {
        let addr = buf.slice(offset, 16)?;
        emitter.item(NodeKind::NsIpv6, offset..offset + 16, Value::Bytes(addr));
        offset += 16;
    }

    if flags.contains(IsAtV0Flags::IPV4) {
        let addr = buf.slice(offset, 4)?;
        emitter.item(NodeKind::NsIpv4, offset..offset + 4, Value::Bytes(addr));
        offset += 4;
    }

    if flags.contains(IsAtV0Flags::GUID) {
        offset = parse_string_record(buf, offset, NodeKind::NsGuid, emitter)?;
    }

    for _ in 0..count {
        offset = parse_string_record(buf, offset, NodeKind::NsBusName, emitter)?;
    }

    emitter.set_end(offset);
    emitter.close();
    Ok(offset)
}

fn parse_answer_v1<'a, E: NodeEmitter<'a>>(
    buf: &Buffer<'a>,
    offset: usize,
    emitter: &mut E,
) -> Result<usize, DecodeError> {
    let flags = IsAtV1Flags::from_bits_truncate(buf.get_u8(offset)?);
    let count = buf.get_u8(offset + 1)?;

    emitter.open(NodeKind::NsIsAt, offset..offset + 2);
    emitter.item(
        NodeKind::NsIsAtFlags,
        offset..offset + 1,
        Value::U8(flags.bits()),
    );
    emitter.label(&describe_isat_v1_flags(flags));
    emitter.item(NodeKind::NsCount, offset + 1..offset + 2, Value::U8(count));

    let mask = TransportMask::from_bits_truncate(buf.get_u16(offset + 2, Endian::Big)?);
    emitter.item(
        NodeKind::NsTransportMask,
        offset + 2..offset + 4,
        Value::U16(mask.bits()),
    );
    emitter.label(&describe_transport_mask(mask));

    let mut offset = offset + 4;

    // Endpoints arrive in a fixed order: reliable IPv4, unreliable IPv4,
    // reliable IPv6, unreliable IPv6, each an address plus a port.
    for (flag, kind, addr_len) in [
        (IsAtV1Flags::RELIABLE_IPV4, NodeKind::NsIpv4, 4),
        (IsAtV1Flags::UNRELIABLE_IPV4, NodeKind::NsIpv4, 4),
        (IsAtV1Flags::RELIABLE_IPV6, NodeKind::NsIpv6, 16),
        (IsAtV1Flags::UNRELIABLE_IPV6, NodeKind::NsIpv6, 16),
    ] {
        if !flags.contains(flag) {
            continue;
        }

        let addr = buf.slice(offset, addr_len)?;
        emitter.item(kind, offset..offset + addr_len, Value::Bytes(addr));
        offset += addr_len;

        let port = buf.get_u16(offset, Endian::Big)?;
        emitter.item(NodeKind::NsPort, offset..offset + 2, Value::U16(port));
        offset += 2;
    }

    if flags.contains(IsAtV1Flags::GUID) {
        offset = parse_string_record(buf, offset, NodeKind::NsGuid, emitter)?;
    }

    for _ in 0..count {
        offset = parse_string_record(buf, offset, NodeKind::NsBusName, emitter)?;
    }

    emitter.set_end(offset);
    emitter.close();
    Ok(offset)
}

fn describe_whohas_flags(flags: WhoHasFlags) -> String {
    join_flags(&[
        (flags.contains(WhoHasFlags::TCP), "TCP"),
        (flags.contains(WhoHasFlags::UDP), "UDP"),
        (flags.contains(WhoHasFlags::IPV6), "IPv6"),
        (flags.contains(WhoHasFlags::IPV4), "IPv4"),
    ])
}

fn describe_isat_v0_flags(flags: IsAtV0Flags) -> String {
    join_flags(&[
        (flags.contains(IsAtV0Flags::GUID), "GUID"),
        (flags.contains(IsAtV0Flags::COMPLETE), "Complete"),
        (flags.contains(IsAtV0Flags::TCP), "TCP"),
        (flags.contains(IsAtV0Flags::UDP), "UDP"),
        (flags.contains(IsAtV0Flags::IPV6), "IPv6"),
        (flags.contains(IsAtV0Flags::IPV4), "IPv4"),
    ])
}

fn describe_isat_v1_flags(flags: IsAtV1Flags) -> String {
    join_flags(&[
        (flags.contains(IsAtV1Flags::GUID), "GUID"),
        (flags.contains(IsAtV1Flags::COMPLETE), "Complete"),
        (flags.contains(IsAtV1Flags::RELIABLE_IPV4), "IPv4 TCP"),
        (flags.contains(IsAtV1Flags::UNRELIABLE_IPV4), "IPv4 UDP"),
        (flags.contains(IsAtV1Flags::RELIABLE_IPV6), "IPv6 TCP"),
        (flags.contains(IsAtV1Flags::UNRELIABLE_IPV6), "IPv6 UDP"),
    ])
}

fn describe_transport_mask(mask: TransportMask) -> String {
    join_flags(&[
        (mask.contains(TransportMask::WFD), "Wi-Fi Direct Transport"),
        (mask.contains(TransportMask::ICE), "ICE protocol Transport"),
        (mask.contains(TransportMask::LAN), "Wired LAN Transport"),
        (mask.contains(TransportMask::WWAN), "Wireless WAN Transport"),
        (mask.contains(TransportMask::TCP), "TCP Transport"),
        (mask.contains(TransportMask::BLUETOOTH), "Bluetooth Transport"),
        (mask.contains(TransportMask::LOCAL), "Local Transport"),
    ])
}

fn join_flags(entries: &[(bool, &str)]) -> String {
    let set: Vec<&str> = entries
        .iter()
        .filter(|(on, _)| *on)
        .map(|(_, name)| *name)
        .collect();
    set.join(", ")
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::super::emit::TreeEmitter;
    use super::*;

    fn run<'a>(
        bytes: &'a [u8],
        emitter: &mut TreeEmitter<'a>,
        info: &mut InfoColumn,
    ) -> DissectStatus {
        let buf = Buffer::new(bytes);
        dissect_name_service(&buf, emitter, info)
    }

    #[test]
    fn v1_isat_with_reliable_ipv4() {
        let bytes = [
            0x01, 0x00, 0x01, 0x00, // v1, 0 questions, 1 answer, timer 0
            0x08, 0x01, // R4 flag, 1 bus name
            0x00, 0x04, // transport mask: TCP
            192, 168, 1, 2, // IPv4
            0x26, 0xe3, // port 9955
            0x05, b'h', b'e', b'l', b'l', b'o',
        ];

        let mut tree = TreeEmitter::new();
        let mut info = InfoColumn::new();
        let status = run(&bytes, &mut tree, &mut info);

        assert_eq!(status, DissectStatus::Consumed(bytes.len()));
        assert_eq!(info.as_str(), "VERSION 1 ISAT");

        let roots = tree.into_roots();
        let proto = &roots[0];
        assert_eq!(proto.label, "ALLJOYN-NS");

        let answer = proto.find(NodeKind::NsIsAt).unwrap();
        assert_eq!(answer.range, 4..bytes.len());
        assert_eq!(
            answer.find(NodeKind::NsIpv4).unwrap().value,
            Some(Value::Bytes(&[192u8, 168, 1, 2] as &[u8]))
        );
        assert_eq!(
            answer.find(NodeKind::NsPort).unwrap().value,
            Some(Value::U16(9955))
        );

        let mask = answer.find(NodeKind::NsTransportMask).unwrap();
        assert_eq!(mask.value, Some(Value::U16(0x0004)));
        assert_eq!(mask.label, "TCP Transport");

        let name = answer.find(NodeKind::NsBusName).unwrap();
        assert_eq!(
            name.find(NodeKind::StringData).unwrap().value,
            Some(Value::Bytes(b"hello" as &[u8]))
        );
    }

    #[test]
    fn v0_whohas() {
        let bytes = [
            0x10, 0x01, 0x00, 0x05, // sender v1, message v0, 1 question, timer 5
            0x0c, 0x02, // TCP|UDP, two names
            0x02, b'o', b'k', //
            0x01, b'x',
        ];

        let mut tree = TreeEmitter::new();
        let mut info = InfoColumn::new();
        let status = run(&bytes, &mut tree, &mut info);

        assert_eq!(status, DissectStatus::Consumed(bytes.len()));
        assert_eq!(info.as_str(), "VERSION 0 WHOHAS");

        let roots = tree.into_roots();
        let question = roots[0].find(NodeKind::NsWhoHas).unwrap();
        assert_eq!(question.children[0].label, "TCP, UDP");

        let names = question.find_all(NodeKind::NsBusName);
        assert_eq!(names.len(), 2);
        assert_eq!(
            names[0].find(NodeKind::StringData).unwrap().value,
            Some(Value::Bytes(b"ok" as &[u8]))
        );
    }

    #[test]
    fn v0_isat_with_guid_and_both_addresses() {
        let bytes = [
            0x00, 0x00, 0x01, 0x00, // v0, 1 answer
            0x23, 0x01, // GUID|IPv6|IPv4, 1 name
            0x26, 0xe3, // port 9955
            0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, // IPv6 ::1
            10, 0, 0, 1, // IPv4
            0x03, b'g', b'i', b'd', // GUID string
            0x04, b'n', b'a', b'm', b'e',
        ];

        let mut tree = TreeEmitter::new();
        let mut info = InfoColumn::new();
        let status = run(&bytes, &mut tree, &mut info);

        assert_eq!(status, DissectStatus::Consumed(bytes.len()));
        assert_eq!(info.as_str(), "VERSION 0 ISAT");

        let roots = tree.into_roots();
        let answer = roots[0].find(NodeKind::NsIsAt).unwrap();
        assert_eq!(answer.children[0].label, "GUID, IPv6, IPv4");
        assert_eq!(
            answer.find(NodeKind::NsIpv4).unwrap().value,
            Some(Value::Bytes(&[10u8, 0, 0, 1] as &[u8]))
        );
        assert_eq!(
            answer
                .find(NodeKind::NsGuid)
                .unwrap()
                .find(NodeKind::StringData)
                .unwrap()
                .value,
            Some(Value::Bytes(b"gid" as &[u8]))
        );
    }

    #[test]
    fn unsupported_version_decodes_no_records() {
        let bytes = [
            0x47, 0x01, 0x01, 0x00, // message version 7
            0xff, 0xff, // would-be records, left untouched
        ];

        let mut tree = TreeEmitter::new();
        let mut info = InfoColumn::new();
        let status = run(&bytes, &mut tree, &mut info);

        assert_eq!(status, DissectStatus::Consumed(bytes.len()));
        assert_eq!(info.as_str(), "VERSION 7 UNSUPPORTED ISAT WHOHAS");

        let roots = tree.into_roots();
        assert!(roots[0].find(NodeKind::NsWhoHas).is_none());
        assert!(roots[0].find(NodeKind::NsIsAt).is_none());
    }

    #[test]
    fn truncated_record_drains() {
        let bytes = [
            0x01, 0x00, 0x01, 0x00, //
            0x08, 0x01, 0x00, 0x04, // R4 promised, then nothing
        ];

        let mut tree = TreeEmitter::new();
        let mut info = InfoColumn::new();
        let status = run(&bytes, &mut tree, &mut info);

        assert_matches!(status, DissectStatus::Drained);
        assert!(info.as_str().starts_with("BAD DATA: "), "{}", info.as_str());
    }

    #[test]
    fn dissection_is_pure() {
        let bytes = [0x01, 0x00, 0x00, 0x00];

        let mut info1 = InfoColumn::new();
        let mut info2 = InfoColumn::new();
        let mut t1 = TreeEmitter::new();
        let mut t2 = TreeEmitter::new();

        run(&bytes, &mut t1, &mut info1);
        run(&bytes, &mut t2, &mut info2);

        assert_eq!(info1.as_str(), info2.as_str());
        assert_eq!(t1.into_roots(), t2.into_roots());
    }
}
