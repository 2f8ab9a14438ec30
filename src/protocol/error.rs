//! Defines the decoder error type.

use thiserror::Error;

/// An error from the bounds-checked buffer layer.
///
/// Dissector entry points never surface these to the host; per the framing
/// rules every failure is converted into an info-column diagnostic plus a
/// drained cursor. The type is public for callers that drive
/// [`Buffer`](super::cursor::Buffer) reads directly.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// A read ran past the captured portion of the buffer.
    #[error("read of {needed} bytes at offset {offset} exceeds captured length {captured}")]
    Truncated {
        /// Absolute offset the read started at.
        offset: usize,
        /// Number of bytes the read required.
        needed: usize,
        /// Captured length of the buffer.
        captured: usize,
    },
}
