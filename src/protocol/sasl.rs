//! The line-oriented SASL exchange that precedes binary messages.
//!
//! Each direction sends ASCII lines of the form `COMMAND parameters\n`. The
//! decoder only recognizes the command word and the extent of the line; the
//! authentication itself is none of its business.

use super::cursor::Buffer;
use super::emit::{InfoColumn, NodeEmitter, NodeKind, Value};
use super::Step;

/// The command words, distinguishable by their first byte.
const SASL_COMMANDS: [&str; 7] = [
    "AUTH", "CANCEL", "BEGIN", "DATA", "ERROR", "REJECTED", "OK",
];

/// One more than the longest command word.
pub const MAX_SASL_COMMAND_LENGTH: usize = "REJECTED".len() + 1;

/// A line longer than this is assumed not to be SASL at all.
pub const MAX_SASL_PACKET_LENGTH: usize = MAX_SASL_COMMAND_LENGTH + 256;

fn find_command(buf: &Buffer<'_>, offset: usize) -> Option<&'static str> {
    let captured = buf.slice(offset, buf.remaining(offset)).ok()?;
    SASL_COMMANDS
        .iter()
        .find(|cmd| captured.starts_with(cmd.as_bytes()))
        .copied()
}

/// Whether a complete SASL line starts at offset 0.
pub(crate) fn probe(buf: &Buffer<'_>) -> bool {
    find_command(buf, 0).is_some_and(|cmd| find_newline(buf, cmd.len()).is_some())
}

/// Absolute offset of the first `\n` at or after `offset` within the
/// captured bytes.
fn find_newline(buf: &Buffer<'_>, offset: usize) -> Option<usize> {
    let rest = buf.slice(offset, buf.remaining(offset)).ok()?;
    rest.iter().position(|&b| b == b'\n').map(|p| offset + p)
}

/// Handles one SASL line at `offset`.
pub(crate) fn handle_sasl<'a, E: NodeEmitter<'a>>(
    buf: &Buffer<'a>,
    offset: usize,
    emitter: &mut E,
    info: &mut InfoColumn,
    can_desegment: bool,
) -> Step {
    let Some(command) = find_command(buf, offset) else {
        return Step::NotMine;
    };

    let Some(newline) = find_newline(buf, offset + command.len()) else {
        // A command word with no terminator yet. If the line could still
        // plausibly be completed by the next segment, ask for it.
        if buf.remaining(offset) < MAX_SASL_PACKET_LENGTH && can_desegment {
            log::debug!("SASL line at {} is incomplete; requesting more data", offset);
            return Step::NeedMore;
        }
        return Step::NotMine;
    };

    let end = newline + 1;
    info.set(format!("SASL-{}", command));

    let cmd_end = offset + command.len();
    emitter.item(
        NodeKind::SaslCommand,
        offset..cmd_end,
        Value::Bytes(command.as_bytes()),
    );
    if let Ok(param) = buf.slice(cmd_end, end - cmd_end) {
        emitter.item(NodeKind::SaslParameter, cmd_end..end, Value::Bytes(param));
    }

    Step::Advanced(end)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::super::emit::TreeEmitter;
    use super::*;

    fn run<'a>(
        bytes: &'a [u8],
        emitter: &mut TreeEmitter<'a>,
        info: &mut InfoColumn,
        can_desegment: bool,
    ) -> Step {
        let buf = Buffer::new(bytes);
        handle_sasl(&buf, 0, emitter, info, can_desegment)
    }

    #[test]
    fn auth_line() {
        let bytes = b"AUTH ANONYMOUS\n";
        let mut tree = TreeEmitter::new();
        let mut info = InfoColumn::new();

        let step = run(bytes, &mut tree, &mut info, true);

        assert_eq!(step, Step::Advanced(bytes.len()));
        assert_eq!(info.as_str(), "SASL-AUTH");

        let roots = tree.into_roots();
        assert_eq!(roots[0].kind, NodeKind::SaslCommand);
        assert_eq!(roots[0].range, 0..4);
        assert_eq!(roots[1].kind, NodeKind::SaslParameter);
        assert_eq!(roots[1].range, 4..15);
        assert_eq!(roots[1].value, Some(Value::Bytes(b" ANONYMOUS\n" as &[u8])));
    }

    #[test]
    fn ok_line() {
        let bytes = b"OK 1234567890\n";
        let mut tree = TreeEmitter::new();
        let mut info = InfoColumn::new();

        let step = run(bytes, &mut tree, &mut info, true);

        assert_eq!(step, Step::Advanced(14));
        assert_eq!(info.as_str(), "SASL-OK");

        let roots = tree.into_roots();
        assert_eq!(roots[0].range, 0..2);
        assert_eq!(roots[1].range, 2..14);
    }

    #[test]
    fn incomplete_line() {
        let bytes = b"AUTH ANONYM";
        let mut tree = TreeEmitter::new();
        let mut info = InfoColumn::new();

        assert_eq!(run(bytes, &mut tree, &mut info, true), Step::NeedMore);
        assert_eq!(run(bytes, &mut tree, &mut info, false), Step::NotMine);
        assert_eq!(info.as_str(), "");
    }

    #[test]
    fn unterminated_giant_line_is_not_sasl() {
        let mut bytes = b"DATA ".to_vec();
        bytes.extend(std::iter::repeat(b'a').take(MAX_SASL_PACKET_LENGTH));

        let mut tree = TreeEmitter::new();
        let mut info = InfoColumn::new();

        assert_eq!(run(&bytes, &mut tree, &mut info, true), Step::NotMine);
    }

    #[test]
    fn not_a_command() {
        let bytes = b"HELLO world\n";
        let mut tree = TreeEmitter::new();
        let mut info = InfoColumn::new();

        assert_eq!(run(bytes, &mut tree, &mut info, true), Step::NotMine);
    }

    #[test]
    fn probe_wants_complete_lines() {
        assert!(probe(&Buffer::new(b"BEGIN\n")));
        assert!(!probe(&Buffer::new(b"BEGIN")));
        assert!(!probe(&Buffer::new(b"NOPE\n")));
    }
}
