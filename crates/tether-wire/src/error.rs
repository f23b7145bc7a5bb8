//! Wire serialization error types.

/// Errors produced while sizing, decoding or encoding a component.
///
/// Every variant is an ordinary outcome for untrusted input except
/// [`InvalidSchema`](WireError::InvalidSchema), which flags a component
/// definition that can never be processed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// The stream ended before the field was complete.
    #[error("stream truncated: needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes the field required.
        needed: usize,
        /// Bytes left in the stream.
        available: usize,
    },

    /// A decoded element count fell outside the field's constraint.
    #[error("element count {count} outside [{min}, {max}]")]
    CountOutOfRange {
        /// Count found on the wire.
        count: usize,
        /// Minimum allowed count.
        min: usize,
        /// Maximum allowed count (`usize::MAX` when unbounded).
        max: usize,
    },

    /// A value to encode is longer or shorter than its field allows.
    #[error("length {len} does not fit [{min}, {max}]")]
    CapacityExceeded {
        /// Element count of the value.
        len: usize,
        /// Minimum allowed count.
        min: usize,
        /// Maximum allowed count (`usize::MAX` when unbounded).
        max: usize,
    },

    /// A scalar does not fit its declared bit width.
    #[error("value {value} does not fit in {bits} bits")]
    ValueOutOfRange {
        /// The offending value.
        value: u64,
        /// Declared width.
        bits: u32,
    },

    /// A string field held invalid UTF-8.
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,

    /// A bool field held something other than 0 or 1.
    #[error("invalid bool byte {0:#04x}")]
    InvalidBool(u8),

    /// An optional field was flagged present while holding no value.
    #[error("optional field flagged present but has no value")]
    MissingOptional,

    /// The packet tag did not match the expected packet type.
    #[error("packet tag {found:#010x} does not match {expected:#010x}")]
    TagMismatch {
        /// Tag of the packet type being decoded.
        expected: u32,
        /// Tag found in the buffer.
        found: u32,
    },

    /// The component declares a size option its field kind cannot use.
    #[error("invalid schema: {0}")]
    InvalidSchema(&'static str),
}
