//! One-call helpers over the three streams.

use crate::{Bounds, BoundsCounter, Component, Reader, WireError, Writer};

/// Size bounds of `C`, computed from a default instance.
///
/// Fails only when the schema itself is invalid.
pub fn bounds<C: Component + Default>() -> Result<Bounds, WireError> {
    let mut counter = BoundsCounter::new();
    C::default().process(&mut counter)?;
    Ok(counter.finish())
}

/// Decode a `C` from the start of `buf`.
///
/// Trailing bytes are left unread; callers that need a strict fit check
/// [`bounds`] first, as the dispatcher does.
pub fn decode<C: Component + Default>(buf: &[u8]) -> Result<C, WireError> {
    let mut component = C::default();
    component.process(&mut Reader::new(buf))?;
    Ok(component)
}

/// Encode `component` into a fresh buffer.
pub fn encode<C: Component>(component: &mut C) -> Result<Vec<u8>, WireError> {
    let mut writer = Writer::new();
    component.process(&mut writer)?;
    Ok(writer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SizeOption, Stream};

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Nested {
        value: u32,
    }

    impl Component for Nested {
        fn process<S: Stream>(&mut self, s: &mut S) -> Result<(), WireError> {
            s.int(&mut self.value)
        }
    }

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Everything {
        small: u8,
        word: u16,
        flag: bool,
        ten_bits: u16,
        name: String,
        blob: Vec<u8>,
        nested: Nested,
        list: Vec<Nested>,
        tail: Vec<u8>,
    }

    impl Component for Everything {
        fn process<S: Stream>(&mut self, s: &mut S) -> Result<(), WireError> {
            s.int(&mut self.small)?;
            s.int(&mut self.word)?;
            s.boolean(&mut self.flag)?;
            s.bits(&mut self.ten_bits, SizeOption::bits(10))?;
            s.string(&mut self.name, SizeOption::area(0, 3))?;
            s.bytes(&mut self.blob, SizeOption::fixed(4))?;
            self.nested.process(s)?;
            s.array(&mut self.list, SizeOption::area(0, 2))?;
            s.bytes(&mut self.tail, SizeOption::rest_between(128, 2048))
        }
    }

    #[derive(Debug, Default, Clone, PartialEq)]
    struct OpenTail {
        kind: u8,
        tail: Vec<u8>,
    }

    impl Component for OpenTail {
        fn process<S: Stream>(&mut self, s: &mut S) -> Result<(), WireError> {
            s.int(&mut self.kind)?;
            s.bytes(&mut self.tail, SizeOption::rest())
        }
    }

    /// Voice-gateway style message with big-endian integers.
    #[derive(Debug, Default, Clone, PartialEq)]
    struct VoiceFrame {
        kind: u16,
        length: u32,
        data: Vec<u8>,
    }

    impl Component for VoiceFrame {
        fn process<S: Stream>(&mut self, s: &mut S) -> Result<(), WireError> {
            s.int_be(&mut self.kind)?;
            s.int_be(&mut self.length)?;
            s.bytes(&mut self.data, SizeOption::rest_between(0, 8192))
        }
    }

    fn sample() -> Everything {
        Everything {
            small: 7,
            word: 0x1234,
            flag: true,
            ten_bits: 1000,
            name: "abc".into(),
            blob: vec![1, 2, 3, 4],
            nested: Nested { value: 0xdead_beef },
            list: vec![Nested { value: 1 }, Nested { value: 2 }],
            tail: vec![0x5a; 200],
        }
    }

    #[test]
    fn test_bounds_fold_constraints() {
        let b = bounds::<Everything>().unwrap();
        // 1 + 2 + 1 + 2 + (1 + 0..3) + 4 + 4 + (1 + 0..8) + 128..2048
        assert_eq!(b.min, 1 + 2 + 1 + 2 + 1 + 4 + 4 + 1 + 128);
        assert_eq!(b.max, 1 + 2 + 1 + 2 + 4 + 4 + 4 + 9 + 2048);
    }

    #[test]
    fn test_unconstrained_tail_is_unbounded() {
        let b = bounds::<OpenTail>().unwrap();
        assert_eq!(b.min, 1);
        assert!(b.is_unbounded());
        assert!(b.contains(1 << 30));
    }

    #[test]
    fn test_nested_u32_is_four_le_bytes() {
        let mut nested = Nested { value: 0x0403_0201 };
        assert_eq!(encode(&mut nested).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_encode_is_stable_after_decode() {
        let mut original = sample();
        let first = encode(&mut original).unwrap();
        let mut decoded: Everything = decode(&first).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(encode(&mut decoded).unwrap(), first);
    }

    #[test]
    fn test_big_endian_fields() {
        let mut frame = VoiceFrame {
            kind: 0x0102,
            length: 3,
            data: vec![9, 9, 9],
        };
        let bytes = encode(&mut frame).unwrap();
        assert_eq!(&bytes[..6], &[0x01, 0x02, 0x00, 0x00, 0x00, 0x03]);
        let b = bounds::<VoiceFrame>().unwrap();
        assert_eq!((b.min, b.max), (6, 6 + 8192));
        assert_eq!(decode::<VoiceFrame>(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_short_buffers_fail_without_panicking() {
        let bytes = encode(&mut sample()).unwrap();
        let min = bounds::<Everything>().unwrap().min as usize;
        for len in 0..min {
            assert!(decode::<Everything>(&bytes[..len]).is_err(), "len {len}");
        }
    }

    #[test]
    fn test_oversized_tail_rejected() {
        let mut value = sample();
        value.tail = vec![0; 2049];
        assert!(matches!(
            encode(&mut value),
            Err(WireError::CapacityExceeded { len: 2049, .. })
        ));
    }

    #[test]
    fn test_encode_never_truncates_strings() {
        let mut value = sample();
        value.name = "abcd".into();
        assert!(matches!(
            encode(&mut value),
            Err(WireError::CapacityExceeded { len: 4, max: 3, .. })
        ));
    }

    #[test]
    fn test_prefix_over_constraint_fails_decode() {
        let mut bytes = encode(&mut sample()).unwrap();
        // string prefix sits after u8 + u16 + bool + 2-byte bit field
        bytes[6] = 4;
        assert!(matches!(
            decode::<Everything>(&bytes),
            Err(WireError::CountOutOfRange { count: 4, .. })
        ));
    }

    #[test]
    fn test_bit_field_range_enforced() {
        let mut value = sample();
        value.ten_bits = 1024;
        assert_eq!(
            encode(&mut value),
            Err(WireError::ValueOutOfRange {
                value: 1024,
                bits: 10
            })
        );
    }

    #[test]
    fn test_invalid_bool_rejected() {
        let mut bytes = encode(&mut sample()).unwrap();
        bytes[3] = 2;
        assert_eq!(decode::<Everything>(&bytes), Err(WireError::InvalidBool(2)));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut bytes = encode(&mut sample()).unwrap();
        bytes[7] = 0xff;
        assert_eq!(decode::<Everything>(&bytes), Err(WireError::InvalidUtf8));
    }

    #[test]
    fn test_schema_misuse_detected_by_bounds() {
        #[derive(Default)]
        struct Broken {
            data: Vec<u8>,
        }
        impl Component for Broken {
            fn process<S: Stream>(&mut self, s: &mut S) -> Result<(), WireError> {
                s.bytes(&mut self.data, SizeOption::bits(8))
            }
        }
        assert!(matches!(
            bounds::<Broken>(),
            Err(WireError::InvalidSchema(_))
        ));
    }

    #[test]
    fn test_rest_array_reads_until_end() {
        #[derive(Debug, Default, PartialEq)]
        struct Ids {
            ids: Vec<u16>,
        }
        impl Component for Ids {
            fn process<S: Stream>(&mut self, s: &mut S) -> Result<(), WireError> {
                s.array(&mut self.ids, SizeOption::rest_between(0, 3))
            }
        }
        let decoded: Ids = decode(&[1, 0, 2, 0, 3, 0]).unwrap();
        assert_eq!(decoded.ids, vec![1, 2, 3]);
        assert!(decode::<Ids>(&[1, 0, 2, 0, 3, 0, 4, 0]).is_err());
        // A dangling half element is a truncation.
        assert!(decode::<Ids>(&[1, 0, 2]).is_err());
    }
}
