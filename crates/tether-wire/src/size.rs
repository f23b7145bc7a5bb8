//! Size options: how a field's wire length is determined.

use crate::WireError;

// ---------------------------------------------------------------------------
// Prefix
// ---------------------------------------------------------------------------

/// Width of an explicit little-endian length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefix {
    /// One byte.
    U8,
    /// Two bytes.
    U16,
    /// Four bytes.
    U32,
}

impl Prefix {
    /// Number of bytes the prefix occupies.
    pub const fn width(self) -> usize {
        match self {
            Prefix::U8 => 1,
            Prefix::U16 => 2,
            Prefix::U32 => 4,
        }
    }

    /// Largest count the prefix can express.
    pub const fn max_count(self) -> usize {
        match self {
            Prefix::U8 => u8::MAX as usize,
            Prefix::U16 => u16::MAX as usize,
            Prefix::U32 => u32::MAX as usize,
        }
    }

    /// The narrowest prefix able to express `max`.
    pub const fn fitting(max: usize) -> Self {
        if max <= u8::MAX as usize {
            Prefix::U8
        } else if max <= u16::MAX as usize {
            Prefix::U16
        } else {
            Prefix::U32
        }
    }
}

// ---------------------------------------------------------------------------
// SizeOption
// ---------------------------------------------------------------------------

/// How the wire size of a field is determined.
///
/// `Bits` applies to scalars only; the other variants apply to area fields
/// (byte spans, strings and arrays), where counts are element counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeOption {
    /// Scalar stored in `n` bits, rounded up to whole bytes on the wire.
    Bits(u32),
    /// Exactly this many elements, no prefix.
    Fixed(usize),
    /// Explicit length prefix followed by `min..=max` elements.
    Prefixed {
        /// Width of the count prefix.
        prefix: Prefix,
        /// Minimum element count.
        min: usize,
        /// Maximum element count.
        max: usize,
    },
    /// Everything left in the packet, no prefix.
    Remainder {
        /// Minimum element count.
        min: usize,
        /// Maximum element count, `None` for unbounded.
        max: Option<usize>,
    },
}

impl SizeOption {
    /// A scalar `n` bits wide.
    pub const fn bits(n: u32) -> Self {
        SizeOption::Bits(n)
    }

    /// Exactly `n` elements.
    pub const fn fixed(n: usize) -> Self {
        SizeOption::Fixed(n)
    }

    /// `min..=max` elements behind the narrowest prefix that fits `max`.
    pub const fn area(min: usize, max: usize) -> Self {
        SizeOption::Prefixed {
            prefix: Prefix::fitting(max),
            min,
            max,
        }
    }

    /// `min..=max` elements behind an explicitly chosen prefix.
    pub const fn prefixed(prefix: Prefix, min: usize, max: usize) -> Self {
        SizeOption::Prefixed { prefix, min, max }
    }

    /// Rest of the stream, unconstrained.
    pub const fn rest() -> Self {
        SizeOption::Remainder { min: 0, max: None }
    }

    /// Rest of the stream, constrained to `min..=max` elements.
    pub const fn rest_between(min: usize, max: usize) -> Self {
        SizeOption::Remainder {
            min,
            max: Some(max),
        }
    }

    /// Element-count range of an area option, validating the option itself.
    pub(crate) fn count_range(self) -> Result<(usize, usize), WireError> {
        match self {
            SizeOption::Bits(_) => Err(WireError::InvalidSchema(
                "bit-width size option on an area field",
            )),
            SizeOption::Fixed(n) => Ok((n, n)),
            SizeOption::Prefixed { prefix, min, max } => {
                if min > max {
                    Err(WireError::InvalidSchema("area minimum exceeds maximum"))
                } else if max > prefix.max_count() {
                    Err(WireError::InvalidSchema("area maximum exceeds its prefix"))
                } else {
                    Ok((min, max))
                }
            }
            SizeOption::Remainder { min, max } => match max {
                Some(max) if min > max => {
                    Err(WireError::InvalidSchema("area minimum exceeds maximum"))
                }
                Some(max) => Ok((min, max)),
                None => Ok((min, usize::MAX)),
            },
        }
    }

    /// Bit width of a scalar option, validated against the scalar's width.
    pub(crate) fn bit_width(self, scalar_bits: u32) -> Result<u32, WireError> {
        match self {
            SizeOption::Bits(n) if n == 0 || n > scalar_bits => Err(WireError::InvalidSchema(
                "bit width outside the scalar's range",
            )),
            SizeOption::Bits(n) => Ok(n),
            _ => Err(WireError::InvalidSchema("area size option on a scalar field")),
        }
    }

    /// Checks `count` against the option, producing the error a reader reports.
    pub(crate) fn check_decoded(self, count: usize) -> Result<(), WireError> {
        let (min, max) = self.count_range()?;
        if count < min || count > max {
            return Err(WireError::CountOutOfRange { count, min, max });
        }
        Ok(())
    }

    /// Checks `len` against the option, producing the error a writer reports.
    pub(crate) fn check_encoded(self, len: usize) -> Result<(), WireError> {
        let (min, max) = self.count_range()?;
        if len < min || len > max {
            return Err(WireError::CapacityExceeded { len, min, max });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_area_picks_smallest_prefix() {
        assert_eq!(
            SizeOption::area(1, 128),
            SizeOption::prefixed(Prefix::U8, 1, 128)
        );
        assert_eq!(
            SizeOption::area(1, 512),
            SizeOption::prefixed(Prefix::U16, 1, 512)
        );
        assert_eq!(
            SizeOption::area(0, 131_072),
            SizeOption::prefixed(Prefix::U32, 0, 131_072)
        );
        assert_eq!(Prefix::fitting(255), Prefix::U8);
        assert_eq!(Prefix::fitting(256), Prefix::U16);
    }

    #[test]
    fn test_invalid_area_options_rejected() {
        assert!(SizeOption::Bits(8).count_range().is_err());
        assert!(SizeOption::prefixed(Prefix::U8, 0, 300).count_range().is_err());
        assert!(SizeOption::area(10, 5).count_range().is_err());
        assert!(SizeOption::rest_between(4, 2).count_range().is_err());
    }

    #[test]
    fn test_bit_width_validation() {
        assert_eq!(SizeOption::bits(10).bit_width(16), Ok(10));
        assert!(SizeOption::bits(17).bit_width(16).is_err());
        assert!(SizeOption::bits(0).bit_width(32).is_err());
        assert!(SizeOption::rest().bit_width(32).is_err());
    }

    #[test]
    fn test_rest_is_unbounded() {
        assert_eq!(SizeOption::rest().count_range(), Ok((0, usize::MAX)));
        assert!(SizeOption::rest().check_decoded(1 << 20).is_ok());
        assert_eq!(
            SizeOption::rest_between(1, 4).check_decoded(0),
            Err(WireError::CountOutOfRange {
                count: 0,
                min: 1,
                max: 4
            })
        );
    }
}
