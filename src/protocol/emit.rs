//! Output capabilities supplied by the host.
//!
//! The decoder never talks to a display framework directly. It reports what
//! it finds through a [`NodeEmitter`] (the labeled tree) and an
//! [`InfoColumn`] (the one-line packet summary). A [`NullEmitter`] makes the
//! protocol-identification probe trivially side-effect free, and
//! [`TreeEmitter`] materializes the tree for tests and offline tools.

use std::fmt;
use std::ops::Range;

/// What a tree node describes.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Root node covering everything the dissector claimed.
    Protocol,

    // Message protocol framing.
    ConnectInitialByte,
    SaslCommand,
    SaslParameter,

    // Fixed message header.
    MessageHeader,
    Endianness,
    MessageType,
    Flags,
    MajorVersion,
    BodyLength,
    Serial,
    HeaderLength,

    // Header fields and body.
    HeaderFieldList,
    HeaderField,
    FieldCode,
    TypeId,
    ExpectedByte,
    BodyParameters,

    // Typed values.
    Array,
    Struct,
    DictEntry,
    Variant,
    SignatureLength,
    SignatureData,
    StringLength,
    StringData,
    Boolean,
    Byte,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Handle,
    Int64,
    Uint64,
    Double,

    // Name service protocol.
    NsHeader,
    NsSenderVersion,
    NsMessageVersion,
    NsQuestionCount,
    NsAnswerCount,
    NsTimer,
    NsWhoHas,
    NsWhoHasFlags,
    NsIsAt,
    NsIsAtFlags,
    /// Bus-name count inside one WHO-HAS or IS-AT record.
    NsCount,
    NsTransportMask,
    NsPort,
    NsIpv4,
    NsIpv6,
    NsGuid,
    NsBusName,
}

/// A decoded leaf value. Byte-backed variants borrow from the packet buffer
/// and live no longer than the pass.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value<'a> {
    Bool(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I16(i16),
    I32(i32),
    I64(i64),
    F64(f64),
    /// Raw bytes: string data (NUL included as captured), addresses, flags
    /// payloads.
    Bytes(&'a [u8]),
}

impl fmt::Display for Value<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", v),
            Value::U8(v) => write!(f, "{}", v),
            Value::U16(v) => write!(f, "{}", v),
            Value::U32(v) => write!(f, "{}", v),
            Value::U64(v) => write!(f, "{}", v),
            Value::I16(v) => write!(f, "{}", v),
            Value::I32(v) => write!(f, "{}", v),
            Value::I64(v) => write!(f, "{}", v),
            Value::F64(v) => write!(f, "{}", v),
            Value::Bytes(b) => {
                let printable = b.strip_suffix(&[0]).unwrap_or(b);
                if !printable.is_empty() && printable.iter().all(|c| c.is_ascii_graphic() || *c == b' ') {
                    write!(f, "{}", String::from_utf8_lossy(printable))
                } else {
                    for (i, byte) in b.iter().enumerate() {
                        if i > 0 {
                            write!(f, ":")?;
                        }
                        write!(f, "{:02x}", byte)?;
                    }
                    Ok(())
                }
            }
        }
    }
}

/// Receives the labeled tree produced by one decode pass.
///
/// The lifetime parameter is the packet buffer's: leaf values may borrow
/// from it, so an emitter that retains nodes (like [`TreeEmitter`]) is tied
/// to the buffer it was used with.
///
/// Calls arrive in buffer order: containers `open` before their children and
/// `close` after, leaves arrive as `item`. `label` appends display text to
/// the most recently opened or added node; `set_end` widens the byte range
/// of the innermost open container, which is opened before its extent is
/// known. A pass that drains on corruption may leave containers unclosed;
/// implementations must tolerate a missing `close`.
pub trait NodeEmitter<'a> {
    /// Opens a container node covering `range` (possibly provisional).
    fn open(&mut self, kind: NodeKind, range: Range<usize>);

    /// Adds a leaf node.
    fn item(&mut self, kind: NodeKind, range: Range<usize>, value: Value<'a>);

    /// Appends display text to the most recently opened or added node.
    fn label(&mut self, text: &str);

    /// Fixes up the end offset of the innermost open container.
    fn set_end(&mut self, end: usize);

    /// Closes the innermost open container.
    fn close(&mut self);
}

/// Discards everything. Used by the protocol-identification probe.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEmitter;

impl<'a> NodeEmitter<'a> for NullEmitter {
    fn open(&mut self, _kind: NodeKind, _range: Range<usize>) {}
    fn item(&mut self, _kind: NodeKind, _range: Range<usize>, _value: Value<'a>) {}
    fn label(&mut self, _text: &str) {}
    fn set_end(&mut self, _end: usize) {}
    fn close(&mut self) {}
}

/// The packet summary line.
#[derive(Debug, Default, Clone)]
pub struct InfoColumn {
    text: String,
}

impl InfoColumn {
    /// An empty column.
    pub fn new() -> Self {
        Self::default()
    }

    /// Discards the current text.
    pub fn clear(&mut self) {
        self.text.clear();
    }

    /// Replaces the column text.
    pub fn set(&mut self, text: impl AsRef<str>) {
        self.text.clear();
        self.text.push_str(text.as_ref());
    }

    /// Appends to the column text.
    pub fn append(&mut self, text: impl AsRef<str>) {
        self.text.push_str(text.as_ref());
    }

    /// The current text.
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

/// One node of a materialized tree.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode<'a> {
    /// What the node describes.
    pub kind: NodeKind,
    /// Byte range the node covers, in absolute buffer offsets.
    pub range: Range<usize>,
    /// Accumulated display text.
    pub label: String,
    /// The decoded value, for leaves.
    pub value: Option<Value<'a>>,
    /// Child nodes in buffer order.
    pub children: Vec<TreeNode<'a>>,
}

impl<'a> TreeNode<'a> {
    fn new(kind: NodeKind, range: Range<usize>, value: Option<Value<'a>>) -> Self {
        TreeNode {
            kind,
            range,
            label: String::new(),
            value,
            children: Vec::new(),
        }
    }

    /// Depth-first search for the first node of `kind`.
    pub fn find(&self, kind: NodeKind) -> Option<&TreeNode<'a>> {
        if self.kind == kind {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(kind))
    }

    /// Depth-first collection of every node of `kind`.
    pub fn find_all(&self, kind: NodeKind) -> Vec<&TreeNode<'a>> {
        let mut out = Vec::new();
        self.collect(kind, &mut out);
        out
    }

    fn collect<'n>(&'n self, kind: NodeKind, out: &mut Vec<&'n TreeNode<'a>>) {
        if self.kind == kind {
            out.push(self);
        }
        for c in &self.children {
            c.collect(kind, out);
        }
    }
}

/// Materializes the emitted nodes as a [`TreeNode`] forest.
#[derive(Debug, Default)]
pub struct TreeEmitter<'a> {
    roots: Vec<TreeNode<'a>>,
    /// Child-index path to the innermost open container.
    open: Vec<usize>,
    /// Child-index path to the node `label` applies to.
    last: Vec<usize>,
}

impl<'a> TreeEmitter<'a> {
    /// An emitter with no nodes yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// The completed forest. Any still-open containers are left as they are.
    pub fn into_roots(self) -> Vec<TreeNode<'a>> {
        self.roots
    }

    /// Borrows the forest built so far.
    pub fn roots(&self) -> &[TreeNode<'a>] {
        &self.roots
    }

    fn node_at_mut(&mut self, path: &[usize]) -> Option<&mut TreeNode<'a>> {
        let (&first, rest) = path.split_first()?;
        let mut node = self.roots.get_mut(first)?;
        for &i in rest {
            node = node.children.get_mut(i)?;
        }
        Some(node)
    }

    fn push(&mut self, node: TreeNode<'a>) -> Vec<usize> {
        let open = self.open.clone();
        let mut path = open.clone();
        match self.node_at_mut(&open) {
            Some(parent) => {
                path.push(parent.children.len());
                parent.children.push(node);
            }
            None => {
                path = vec![self.roots.len()];
                self.roots.push(node);
            }
        }
        path
    }
}

impl<'a> NodeEmitter<'a> for TreeEmitter<'a> {
    fn open(&mut self, kind: NodeKind, range: Range<usize>) {
        let path = self.push(TreeNode::new(kind, range, None));
        self.open = path.clone();
        self.last = path;
    }

    fn item(&mut self, kind: NodeKind, range: Range<usize>, value: Value<'a>) {
        let path = self.push(TreeNode::new(kind, range, Some(value)));
        self.last = path;
    }

    fn label(&mut self, text: &str) {
        let last = self.last.clone();
        if let Some(node) = self.node_at_mut(&last) {
            node.label.push_str(text);
        }
    }

    fn set_end(&mut self, end: usize) {
        let open = self.open.clone();
        if let Some(node) = self.node_at_mut(&open) {
            node.range.end = end;
        }
    }

    fn close(&mut self) {
        if !self.open.is_empty() {
            self.last = self.open.clone();
            self.open.pop();
        }
    }
}
