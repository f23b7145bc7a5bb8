//! The [`Stream`] and [`Component`] traits that every schema is written against.

use crate::{SizeOption, WireError};

// ---------------------------------------------------------------------------
// Mode
// ---------------------------------------------------------------------------

/// Which pass a [`Stream`] implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Count minimum and maximum wire size without real data.
    Bounds,
    /// Read field values from a byte buffer.
    Decode,
    /// Write field values to a byte buffer.
    Encode,
}

// ---------------------------------------------------------------------------
// WireInt
// ---------------------------------------------------------------------------

/// Fixed-width integers the framework can put on the wire.
pub trait WireInt: Copy + Default {
    /// Width in bytes.
    const SIZE: usize;

    /// Zero-extended (or two's-complement reinterpreted) value.
    fn to_bits(self) -> u64;

    /// Inverse of [`to_bits`](WireInt::to_bits), truncating to the width.
    fn from_bits(bits: u64) -> Self;

    /// Width in bits.
    fn bit_count() -> u32 {
        (Self::SIZE * 8) as u32
    }
}

macro_rules! impl_wire_int {
    ($($ty:ty => $unsigned:ty),* $(,)?) => {
        $(
            impl WireInt for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn to_bits(self) -> u64 {
                    self as $unsigned as u64
                }

                fn from_bits(bits: u64) -> Self {
                    bits as $unsigned as $ty
                }
            }

            impl Component for $ty {
                fn process<S: Stream>(&mut self, stream: &mut S) -> Result<(), WireError> {
                    stream.int(self)
                }
            }
        )*
    };
}

impl_wire_int! {
    u8 => u8,
    u16 => u16,
    u32 => u32,
    u64 => u64,
    i8 => u8,
    i16 => u16,
    i32 => u32,
    i64 => u64,
}

impl Component for bool {
    fn process<S: Stream>(&mut self, stream: &mut S) -> Result<(), WireError> {
        stream.boolean(self)
    }
}

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

/// One processing pass over a component schema.
///
/// Each method takes the field value by `&mut` so the same schema code can
/// read it (encode), overwrite it (decode) or ignore it (bounds).
pub trait Stream {
    /// The pass this stream implements.
    fn mode(&self) -> Mode;

    /// Little-endian integer at its natural width.
    fn int<T: WireInt>(&mut self, value: &mut T) -> Result<(), WireError>;

    /// Big-endian integer at its natural width.
    fn int_be<T: WireInt>(&mut self, value: &mut T) -> Result<(), WireError>;

    /// Integer stored in [`SizeOption::Bits`] bits, rounded up to whole bytes.
    fn bits<T: WireInt>(&mut self, value: &mut T, size: SizeOption) -> Result<(), WireError>;

    /// Single-byte boolean, `0` or `1`.
    fn boolean(&mut self, value: &mut bool) -> Result<(), WireError>;

    /// Byte span sized by an area option.
    fn bytes(&mut self, value: &mut Vec<u8>, size: SizeOption) -> Result<(), WireError>;

    /// UTF-8 string sized in bytes by an area option.
    fn string(&mut self, value: &mut String, size: SizeOption) -> Result<(), WireError>;

    /// Sequence of components sized in elements by an area option.
    fn array<T: Component + Default>(
        &mut self,
        value: &mut Vec<T>,
        size: SizeOption,
    ) -> Result<(), WireError>;

    /// Conditional component whose presence earlier fields decided.
    ///
    /// Bounds mode ignores `present` and counts the field as `0..=max`.
    fn optional<T: Component + Default>(
        &mut self,
        present: bool,
        value: &mut Option<T>,
    ) -> Result<(), WireError>;
}

// ---------------------------------------------------------------------------
// Component
// ---------------------------------------------------------------------------

/// An ordered, fixed sequence of fields.
///
/// `process` must visit the same fields in the same order in every mode and
/// must depend on nothing but the field values.
pub trait Component {
    /// Walk every field against `stream`.
    fn process<S: Stream>(&mut self, stream: &mut S) -> Result<(), WireError>;
}
