//! The signature-driven typed-value decoder.
//!
//! One [`ValueDecoder`] decodes the header-field values and the body of a
//! single message. Decoding is a recursive walk: the signature cursor names
//! the type under decode, containers recurse into their contents, and every
//! level returns the advanced buffer offset together with the advanced
//! signature cursor.
//!
//! Corruption never unwinds as an error. A bad declared length (or a read
//! past the captured bytes) puts a `BAD DATA` diagnostic in the info column
//! and clamps the offset to the reported packet length; enclosing loops all
//! terminate on that condition.

use super::cursor::{round_to, Buffer, Endian};
use super::emit::{InfoColumn, NodeEmitter, NodeKind, Value};
use super::message::HeaderFieldCode;
use super::signature::{self, SigCursor, TypeCode};
use super::{MAX_ARRAY_LEN, MAX_NESTING_DEPTH};

/// Whether a value belongs to a header field (and which), or to the body.
///
/// Header fields carry their single type code on the wire, so no signature
/// cursor advances while decoding them; body values walk the captured body
/// signature linearly.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FieldCtx {
    /// Raw header field code, `0` (INVALID) when decoding the body.
    code: u8,
    is_reply_serial: bool,
}

impl FieldCtx {
    /// Context for body parameters.
    pub(crate) fn body() -> Self {
        FieldCtx {
            code: HeaderFieldCode::Invalid as u8,
            is_reply_serial: false,
        }
    }

    /// Context for the value of the header field with the given raw code.
    pub(crate) fn header_field(code: u8) -> Self {
        FieldCtx {
            code,
            is_reply_serial: code == HeaderFieldCode::ReplySerial as u8,
        }
    }

    fn in_body(self) -> bool {
        self.code == HeaderFieldCode::Invalid as u8
    }
}

/// Decodes typed values out of one message.
pub(crate) struct ValueDecoder<'a, 'e, E> {
    buf: Buffer<'a>,
    endian: Endian,
    /// Offset the message header starts at. Wire alignment is relative to
    /// it, so messages that follow a SASL exchange mid-buffer still decode.
    base: usize,
    emitter: &'e mut E,
    info: &'e mut InfoColumn,
    /// The body signature, captured when the SIGNATURE header field decodes.
    pub(crate) captured_signature: Option<&'a [u8]>,
    depth: usize,
    drained: bool,
}

impl<'a, 'e, E: NodeEmitter<'a>> ValueDecoder<'a, 'e, E> {
    pub(crate) fn new(
        buf: Buffer<'a>,
        endian: Endian,
        base: usize,
        emitter: &'e mut E,
        info: &'e mut InfoColumn,
    ) -> Self {
        ValueDecoder {
            buf,
            endian,
            base,
            emitter,
            info,
            captured_signature: None,
            depth: 0,
            drained: false,
        }
    }

    /// Rounds `offset` up to the next multiple of `align` relative to the
    /// message header start.
    pub(crate) fn align(&self, offset: usize, align: usize) -> usize {
        self.base + round_to(offset - self.base, align)
    }

    /// Whether a diagnostic clamped the cursor to the reported length.
    pub(crate) fn drained(&self) -> bool {
        self.drained
    }

    /// The buffer under decode.
    pub(crate) fn buffer(&self) -> Buffer<'a> {
        self.buf
    }

    /// The emitter, for callers interleaving their own nodes with decoded
    /// values (the header-field walker does).
    pub(crate) fn emitter(&mut self) -> &mut E {
        self.emitter
    }

    /// Replaces the info column with a diagnostic and clamps to the reported
    /// length, which terminates every enclosing decode loop.
    fn drain(&mut self, diagnostic: String) -> usize {
        self.info.set(diagnostic);
        self.drained = true;
        self.buf.reported_len()
    }

    fn truncated(&mut self, what: &str, offset: usize) -> usize {
        let left = self.buf.remaining(offset);
        self.drain(format!(
            "BAD DATA: Truncated {}. Only {} bytes left in packet.",
            what, left
        ))
    }

    /// Decodes one typed value at `offset`.
    ///
    /// `type_byte` is the type under decode; in body mode it is the byte
    /// under `sig`, in header-field mode it comes off the wire and `sig` is
    /// empty. Returns the new offset (clamped to the reported length) and
    /// the signature cursor, advanced per the signature-advance rule: one
    /// step for every type except arrays, which consume their element type
    /// themselves, and only in body mode.
    pub(crate) fn decode(
        &mut self,
        offset: usize,
        type_byte: u8,
        ctx: FieldCtx,
        sig: SigCursor<'a>,
    ) -> (usize, SigCursor<'a>) {
        if self.depth >= MAX_NESTING_DEPTH {
            let drained = self.drain(format!(
                "BAD DATA: Signature nesting exceeds {} levels.",
                MAX_NESTING_DEPTH
            ));
            return (drained, sig);
        }

        self.depth += 1;
        let result = self.decode_inner(offset, type_byte, ctx, sig);
        self.depth -= 1;
        result
    }

    fn decode_inner(
        &mut self,
        offset: usize,
        type_byte: u8,
        ctx: FieldCtx,
        mut sig: SigCursor<'a>,
    ) -> (usize, SigCursor<'a>) {
        let reported = self.buf.reported_len();
        let type_code = TypeCode::from_byte(type_byte);

        let new_offset = match type_code {
            // Bytes that are not type codes (including stray closing
            // brackets) end the pass.
            None => reported,

            Some(TypeCode::Invalid) => self.align(offset + 1, 8),

            Some(TypeCode::Byte) => match self.buf.get_u8(offset) {
                Ok(v) => {
                    self.emitter.item(NodeKind::Byte, offset..offset + 1, Value::U8(v));
                    offset + 1
                }
                Err(_) => return (self.truncated("byte", offset), sig),
            },

            Some(TypeCode::Boolean) => {
                let offset = self.align(offset, 4);
                match self.buf.get_u32(offset, self.endian) {
                    Ok(v) => {
                        self.emitter
                            .item(NodeKind::Boolean, offset..offset + 4, Value::Bool(v != 0));
                        offset + 4
                    }
                    Err(_) => return (self.truncated("boolean", offset), sig),
                }
            }

            Some(TypeCode::Int16) => {
                let offset = self.align(offset, 2);
                match self.buf.get_i16(offset, self.endian) {
                    Ok(v) => {
                        self.emitter
                            .item(NodeKind::Int16, offset..offset + 2, Value::I16(v));
                        offset + 2
                    }
                    Err(_) => return (self.truncated("int16", offset), sig),
                }
            }

            Some(TypeCode::Uint16) => {
                let offset = self.align(offset, 2);
                match self.buf.get_u16(offset, self.endian) {
                    Ok(v) => {
                        self.emitter
                            .item(NodeKind::Uint16, offset..offset + 2, Value::U16(v));
                        offset + 2
                    }
                    Err(_) => return (self.truncated("uint16", offset), sig),
                }
            }

            Some(TypeCode::Int32) => {
                let offset = self.align(offset, 4);
                match self.buf.get_i32(offset, self.endian) {
                    Ok(v) => {
                        self.emitter
                            .item(NodeKind::Int32, offset..offset + 4, Value::I32(v));
                        offset + 4
                    }
                    Err(_) => return (self.truncated("int32", offset), sig),
                }
            }

            Some(TypeCode::Handle) => {
                let offset = self.align(offset, 4);
                match self.buf.get_u32(offset, self.endian) {
                    Ok(v) => {
                        self.emitter
                            .item(NodeKind::Handle, offset..offset + 4, Value::U32(v));
                        offset + 4
                    }
                    Err(_) => return (self.truncated("socket handle", offset), sig),
                }
            }

            Some(TypeCode::Uint32) => {
                let offset = self.align(offset, 4);
                match self.buf.get_u32(offset, self.endian) {
                    Ok(v) => {
                        self.emitter
                            .item(NodeKind::Uint32, offset..offset + 4, Value::U32(v));
                        if ctx.is_reply_serial {
                            self.emitter.label(&format!("Replies to: {:09}", v));
                            self.info.append(format!(" Replies to: {:09}", v));
                        }
                        offset + 4
                    }
                    Err(_) => return (self.truncated("uint32", offset), sig),
                }
            }

            Some(TypeCode::Int64) => {
                let offset = self.align(offset, 8);
                match self.buf.get_i64(offset, self.endian) {
                    Ok(v) => {
                        self.emitter
                            .item(NodeKind::Int64, offset..offset + 8, Value::I64(v));
                        offset + 8
                    }
                    Err(_) => return (self.truncated("int64", offset), sig),
                }
            }

            Some(TypeCode::Uint64) => {
                let offset = self.align(offset, 8);
                match self.buf.get_u64(offset, self.endian) {
                    Ok(v) => {
                        self.emitter
                            .item(NodeKind::Uint64, offset..offset + 8, Value::U64(v));
                        offset + 8
                    }
                    Err(_) => return (self.truncated("uint64", offset), sig),
                }
            }

            Some(TypeCode::Double) => {
                let offset = self.align(offset, 8);
                match self.buf.get_f64(offset, self.endian) {
                    Ok(v) => {
                        self.emitter
                            .item(NodeKind::Double, offset..offset + 8, Value::F64(v));
                        offset + 8
                    }
                    Err(_) => return (self.truncated("IEEE 754 double", offset), sig),
                }
            }

            Some(TypeCode::String) => match self.decode_string(offset, ctx) {
                Ok(end) => end,
                Err(end) => return (end, sig),
            },

            Some(TypeCode::ObjectPath) => match self.decode_object_path(offset) {
                Ok(end) => end,
                Err(end) => return (end, sig),
            },

            Some(TypeCode::Signature) => match self.decode_signature(offset, ctx) {
                Ok(end) => end,
                Err(end) => return (end, sig),
            },

            Some(TypeCode::Array) => match self.decode_array(offset, ctx, &mut sig) {
                Ok(end) => end,
                Err(end) => return (end, sig),
            },

            Some(code @ (TypeCode::Struct | TypeCode::DictEntry)) => {
                match self.decode_container(offset, code, ctx, &mut sig) {
                    Ok(end) => end,
                    Err(end) => return (end, sig),
                }
            }

            Some(TypeCode::Variant) => match self.decode_variant(offset, ctx) {
                Ok(end) => end,
                Err(end) => return (end, sig),
            },
        };

        // The signature-advance rule: arrays consume their element type
        // themselves, and header fields carry their own single-type
        // signature that must not advance.
        if sig.current().is_some() && type_code != Some(TypeCode::Array) && ctx.in_body() {
            sig = sig.step();
        }

        (new_offset.min(reported), sig)
    }

    /// `Ok` carries the post-value offset, `Err` a drained offset that must
    /// bypass the signature-advance rule.
    fn decode_string(&mut self, offset: usize, ctx: FieldCtx) -> Result<usize, usize> {
        let offset = self.align(offset, 4);
        let len = match self.buf.get_u32(offset, self.endian) {
            Ok(v) => v,
            Err(_) => return Err(self.truncated("string", offset)),
        };

        if (len as i32) < 0 || len as usize > self.buf.remaining(offset) {
            let left = self.buf.remaining(offset);
            return Err(self.drain(format!(
                "BAD DATA: String length is {}. Remaining packet length is {}.",
                len as i32, left
            )));
        }

        self.emitter
            .item(NodeKind::StringLength, offset..offset + 4, Value::U32(len));

        let len = len as usize + 1; // the terminating NUL
        let offset = offset + 4;
        let data = match self.buf.slice(offset, len) {
            Ok(d) => d,
            Err(_) => return Err(self.truncated("string", offset)),
        };

        self.emitter
            .item(NodeKind::StringData, offset..offset + len, Value::Bytes(data));

        if ctx.code == HeaderFieldCode::Member as u8 {
            let name = data.strip_suffix(&[0]).unwrap_or(data);
            self.info
                .append(format!(" {}", String::from_utf8_lossy(name)));
        }

        Ok(offset + len)
    }

    fn decode_object_path(&mut self, offset: usize) -> Result<usize, usize> {
        let offset = self.align(offset, 4);
        let raw = match self.buf.get_u32(offset, self.endian) {
            Ok(v) => v,
            Err(_) => return Err(self.truncated("object path", offset)),
        };

        // Object paths may be "any length" in theory; in practice they are
        // capped like arrays.
        let len = raw as u64 + 1;
        if len > MAX_ARRAY_LEN as u64 || len + 4 > self.buf.remaining(offset) as u64 {
            let left = self.buf.remaining(offset + 4);
            return Err(self.drain(format!(
                "BAD DATA: Object path length is {}. Only {} bytes left in packet.",
                len, left
            )));
        }

        self.emitter
            .item(NodeKind::StringLength, offset..offset + 4, Value::U32(raw));

        let len = len as usize;
        let offset = offset + 4;
        let data = match self.buf.slice(offset, len) {
            Ok(d) => d,
            Err(_) => return Err(self.truncated("object path", offset)),
        };

        self.emitter
            .item(NodeKind::StringData, offset..offset + len, Value::Bytes(data));

        Ok(offset + len)
    }

    fn decode_signature(&mut self, offset: usize, ctx: FieldCtx) -> Result<usize, usize> {
        let siglen = match self.buf.get_u8(offset) {
            Ok(v) => v as usize,
            Err(_) => return Err(self.truncated("signature", offset)),
        };

        if siglen + 2 > self.buf.remaining(offset) {
            let left = self.buf.remaining(offset);
            return Err(self.drain(format!(
                "BAD DATA: Signature length is {}. Only {} bytes left in packet.",
                siglen, left
            )));
        }

        self.emitter.item(
            NodeKind::SignatureLength,
            offset..offset + 1,
            Value::U8(siglen as u8),
        );

        let len = siglen + 1;
        let offset = offset + 1;
        let data = match self.buf.slice(offset, len) {
            Ok(d) => d,
            Err(_) => return Err(self.truncated("signature", offset)),
        };

        self.emitter
            .item(NodeKind::SignatureData, offset..offset + len, Value::Bytes(data));

        if ctx.code == HeaderFieldCode::Signature as u8 {
            let value = &data[..siglen];
            self.captured_signature = Some(value);
            self.info
                .append(format!(" ({})", String::from_utf8_lossy(value)));
            if !signature::is_well_formed(value) {
                log::debug!(
                    "captured body signature {:?} is not well formed",
                    String::from_utf8_lossy(value)
                );
            }
        }

        Ok(offset + len)
    }

    fn decode_array(
        &mut self,
        offset: usize,
        ctx: FieldCtx,
        sig: &mut SigCursor<'a>,
    ) -> Result<usize, usize> {
        let reported = self.buf.reported_len();

        if sig.current().is_none() {
            return Err(self.drain("BAD DATA: A array argument needs a signature.".to_owned()));
        }

        let elem = sig.step();
        let offset = self.align(offset, 4);

        // The length of the array in bytes, not counting the length word.
        let len = match self.buf.get_u32(offset, self.endian) {
            Ok(v) => v,
            Err(_) => return Err(self.truncated("array", offset)),
        };

        if (len as i32) < 0
            || len as usize > MAX_ARRAY_LEN
            || offset as u64 + 4 + len as u64 > reported as u64
        {
            let left = self.buf.remaining(offset + 4);
            return Err(self.drain(format!(
                "BAD DATA: Array length (in bytes) is {}. Remaining packet length is {}.",
                len as i32, left
            )));
        }

        let len = len as usize;
        self.emitter.open(NodeKind::Array, offset..offset + len);

        let elem_align = elem
            .current()
            .and_then(TypeCode::from_byte)
            .map(TypeCode::alignment)
            .unwrap_or(1);
        let offset = self.align(offset + 4, elem_align).min(reported);

        if offset + len > reported {
            let left = self.buf.remaining(offset);
            let drained = self.drain(format!(
                "BAD DATA: Array length (in bytes) is {}. Remaining packet length is {}.",
                len as i32, left
            ));
            self.emitter.close();
            return Err(drained);
        }

        let start = offset;
        let mut offset = offset;
        let mut n_items = 0usize;

        while offset - start < len {
            n_items += 1;
            let before = offset;
            // Each element restarts from the element type; the outer
            // signature moves past it exactly once, below.
            let (end, _) = self.decode(offset, elem.current().unwrap_or(0), ctx, elem);
            offset = end;
            if offset == before {
                break;
            }
        }

        self.emitter.close();
        self.emitter.label(&format!(
            " of {} '{}' elements",
            n_items,
            elem.current().unwrap_or(0) as char
        ));

        *sig = elem.skip_type();
        Ok(offset)
    }

    fn decode_container(
        &mut self,
        offset: usize,
        code: TypeCode,
        ctx: FieldCtx,
        sig: &mut SigCursor<'a>,
    ) -> Result<usize, usize> {
        let (kind, stop) = match code {
            TypeCode::DictEntry => (NodeKind::DictEntry, b'}'),
            _ => (NodeKind::Struct, b')'),
        };

        if sig.current().is_none() {
            return Err(self.drain(format!(
                "BAD DATA: A {} argument needs a signature.",
                code.display_name()
            )));
        }

        self.emitter.open(kind, offset..offset);
        self.emitter.label(&container_signature(*sig, stop));

        let mut offset = self.align(offset, 8).min(self.buf.reported_len());
        *sig = sig.step(); // past the opening bracket

        loop {
            let Some(c) = sig.current() else { break };
            if c == stop || self.buf.remaining(offset) == 0 {
                break;
            }

            let before = (offset, sig.consumed());
            let (end, after) = self.decode(offset, c, ctx, *sig);
            offset = end;
            *sig = after;

            if (offset, sig.consumed()) == before {
                break;
            }
        }

        self.emitter.set_end(offset);
        self.emitter.close();
        Ok(offset)
    }

    fn decode_variant(&mut self, offset: usize, ctx: FieldCtx) -> Result<usize, usize> {
        let reported = self.buf.reported_len();

        let siglen = match self.buf.get_u8(offset) {
            Ok(v) => v as usize,
            Err(_) => return Err(self.truncated("variant", offset)),
        };

        if siglen > self.buf.remaining(offset) {
            // TODO: the original declares this error and then stays in the
            // signature loop rather than draining; whether that leniency is
            // intended is unresolved, so it is mirrored here.
            let left = self.buf.remaining(offset);
            self.info.set(format!(
                "BAD DATA: Variant signature length is {}. Only {} bytes left in packet.",
                siglen, left
            ));

            self.emitter.open(NodeKind::Variant, offset..offset);
            self.emitter.item(
                NodeKind::SignatureLength,
                offset..offset + 1,
                Value::U8(siglen as u8),
            );
            self.emitter.set_end(reported);
            self.emitter.close();
            self.emitter.label("'");
            return Ok(reported);
        }

        self.emitter.open(NodeKind::Variant, offset..offset);
        self.emitter.item(
            NodeKind::SignatureLength,
            offset..offset + 1,
            Value::U8(siglen as u8),
        );

        let len = siglen + 1;
        let offset = offset + 1;
        let data = match self.buf.slice(offset, len) {
            Ok(d) => d,
            Err(_) => {
                let drained = self.truncated("variant signature", offset);
                self.emitter.close();
                return Err(drained);
            }
        };

        self.emitter
            .item(NodeKind::SignatureData, offset..offset + len, Value::Bytes(data));

        let mut inner = SigCursor::new(&data[..siglen]);
        let mut decoded = String::new();
        let mut offset = offset + len;

        while let Some(c) = inner.current() {
            if self.buf.remaining(offset) == 0 {
                break;
            }

            decoded.push(c as char);
            let before = (offset, inner.consumed());
            let (end, after) = self.decode(offset, c, ctx, inner);
            offset = end;
            inner = after;

            if (offset, inner.consumed()) == before {
                break;
            }
        }

        self.emitter.set_end(offset);
        self.emitter.close();
        decoded.push('\'');
        self.emitter.label(&decoded);

        Ok(offset)
    }
}

/// Renders the bracketed signature of a struct or dictionary entry for its
/// node label, e.g. `" (isi)"`. Unterminated groups get a trailing
/// complaint instead of running away.
fn container_signature(sig: SigCursor<'_>, stop: u8) -> String {
    let bytes = sig.rest();
    let mut out = String::from(" ");

    let Some(&type_start) = bytes.first() else {
        return out;
    };

    let max = bytes.len();
    let mut depth = 0i32;
    let mut taken = 0usize;
    let mut i = 0usize;

    loop {
        let b = bytes.get(i).copied().unwrap_or(0);
        if b == type_start {
            depth += 1;
        }
        if b == stop {
            depth -= 1;
        }
        out.push(b as char);
        i += 1;

        if depth > 0 {
            taken += 1;
            if taken < max {
                continue;
            }
        }
        break;
    }

    if taken >= max {
        out.push_str("... Invalid signature!");
    }

    out
}
