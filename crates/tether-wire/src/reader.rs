//! Decode mode.

use crate::{Component, Mode, Prefix, SizeOption, Stream, WireError, WireInt};

/// [`Stream`] that overwrites field values with data read from a buffer.
///
/// Reads never go past the end of the buffer; running short yields
/// [`WireError::Truncated`].
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Read from the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn offset(&self) -> usize {
        self.pos
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if n > self.remaining() {
            return Err(WireError::Truncated {
                needed: n,
                available: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_le(&mut self, width: usize) -> Result<u64, WireError> {
        let bytes = self.take(width)?;
        Ok(bytes
            .iter()
            .rev()
            .fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
    }

    /// Resolves the element count of an area field from the option and the stream.
    fn area_count(&mut self, size: SizeOption) -> Result<usize, WireError> {
        let count = match size {
            SizeOption::Fixed(n) => n,
            SizeOption::Prefixed { prefix, .. } => self.read_prefix(prefix)?,
            SizeOption::Remainder { .. } => self.remaining(),
            SizeOption::Bits(_) => {
                return Err(WireError::InvalidSchema(
                    "bit-width size option on an area field",
                ));
            }
        };
        size.check_decoded(count)?;
        Ok(count)
    }

    fn read_prefix(&mut self, prefix: Prefix) -> Result<usize, WireError> {
        Ok(self.read_le(prefix.width())? as usize)
    }
}

impl Stream for Reader<'_> {
    fn mode(&self) -> Mode {
        Mode::Decode
    }

    fn int<T: WireInt>(&mut self, value: &mut T) -> Result<(), WireError> {
        *value = T::from_bits(self.read_le(T::SIZE)?);
        Ok(())
    }

    fn int_be<T: WireInt>(&mut self, value: &mut T) -> Result<(), WireError> {
        let bytes = self.take(T::SIZE)?;
        *value = T::from_bits(bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b)));
        Ok(())
    }

    fn bits<T: WireInt>(&mut self, value: &mut T, size: SizeOption) -> Result<(), WireError> {
        let bits = size.bit_width(T::bit_count())?;
        let raw = self.read_le(bits.div_ceil(8) as usize)?;
        if bits < 64 && raw >> bits != 0 {
            return Err(WireError::ValueOutOfRange { value: raw, bits });
        }
        *value = T::from_bits(raw);
        Ok(())
    }

    fn boolean(&mut self, value: &mut bool) -> Result<(), WireError> {
        match self.take(1)?[0] {
            0 => *value = false,
            1 => *value = true,
            other => return Err(WireError::InvalidBool(other)),
        }
        Ok(())
    }

    fn bytes(&mut self, value: &mut Vec<u8>, size: SizeOption) -> Result<(), WireError> {
        let count = self.area_count(size)?;
        *value = self.take(count)?.to_vec();
        Ok(())
    }

    fn string(&mut self, value: &mut String, size: SizeOption) -> Result<(), WireError> {
        let count = self.area_count(size)?;
        let bytes = self.take(count)?;
        *value = std::str::from_utf8(bytes)
            .map_err(|_| WireError::InvalidUtf8)?
            .to_owned();
        Ok(())
    }

    fn array<T: Component + Default>(
        &mut self,
        value: &mut Vec<T>,
        size: SizeOption,
    ) -> Result<(), WireError> {
        value.clear();
        if let SizeOption::Remainder { .. } = size {
            let (min, max) = size.count_range()?;
            while self.remaining() > 0 {
                if value.len() == max {
                    return Err(WireError::CountOutOfRange {
                        count: value.len() + 1,
                        min,
                        max,
                    });
                }
                let start = self.pos;
                let mut element = T::default();
                element.process(self)?;
                if self.pos == start {
                    return Err(WireError::InvalidSchema(
                        "zero-sized element in a rest-of-stream array",
                    ));
                }
                value.push(element);
            }
            return size.check_decoded(value.len());
        }

        let count = self.area_count(size)?;
        for _ in 0..count {
            let mut element = T::default();
            element.process(self)?;
            value.push(element);
        }
        Ok(())
    }

    fn optional<T: Component + Default>(
        &mut self,
        present: bool,
        value: &mut Option<T>,
    ) -> Result<(), WireError> {
        if !present {
            *value = None;
            return Ok(());
        }
        let mut inner = T::default();
        inner.process(self)?;
        *value = Some(inner);
        Ok(())
    }
}
