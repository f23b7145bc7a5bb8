//! Encode mode.

use crate::{Component, Mode, SizeOption, Stream, WireError, WireInt};

/// [`Stream`] that appends field values to a growable buffer.
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    /// Start with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consume the writer, returning the encoded bytes.
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    fn write_le(&mut self, value: u64, width: usize) {
        self.buf.extend_from_slice(&value.to_le_bytes()[..width]);
    }

    /// Validates `len` and writes whatever prefix the option calls for.
    fn area_header(&mut self, len: usize, size: SizeOption) -> Result<(), WireError> {
        size.check_encoded(len)?;
        if let SizeOption::Prefixed { prefix, .. } = size {
            self.write_le(len as u64, prefix.width());
        }
        Ok(())
    }
}

impl Stream for Writer {
    fn mode(&self) -> Mode {
        Mode::Encode
    }

    fn int<T: WireInt>(&mut self, value: &mut T) -> Result<(), WireError> {
        self.write_le(value.to_bits(), T::SIZE);
        Ok(())
    }

    fn int_be<T: WireInt>(&mut self, value: &mut T) -> Result<(), WireError> {
        let bytes = value.to_bits().to_be_bytes();
        self.buf.extend_from_slice(&bytes[8 - T::SIZE..]);
        Ok(())
    }

    fn bits<T: WireInt>(&mut self, value: &mut T, size: SizeOption) -> Result<(), WireError> {
        let bits = size.bit_width(T::bit_count())?;
        let raw = value.to_bits();
        if bits < 64 && raw >> bits != 0 {
            return Err(WireError::ValueOutOfRange { value: raw, bits });
        }
        self.write_le(raw, bits.div_ceil(8) as usize);
        Ok(())
    }

    fn boolean(&mut self, value: &mut bool) -> Result<(), WireError> {
        self.buf.push(u8::from(*value));
        Ok(())
    }

    fn bytes(&mut self, value: &mut Vec<u8>, size: SizeOption) -> Result<(), WireError> {
        self.area_header(value.len(), size)?;
        self.buf.extend_from_slice(value);
        Ok(())
    }

    fn string(&mut self, value: &mut String, size: SizeOption) -> Result<(), WireError> {
        self.area_header(value.len(), size)?;
        self.buf.extend_from_slice(value.as_bytes());
        Ok(())
    }

    fn array<T: Component + Default>(
        &mut self,
        value: &mut Vec<T>,
        size: SizeOption,
    ) -> Result<(), WireError> {
        self.area_header(value.len(), size)?;
        for element in value.iter_mut() {
            element.process(self)?;
        }
        Ok(())
    }

    fn optional<T: Component + Default>(
        &mut self,
        present: bool,
        value: &mut Option<T>,
    ) -> Result<(), WireError> {
        match (present, value) {
            (true, Some(inner)) => inner.process(self),
            (true, None) => Err(WireError::MissingOptional),
            (false, _) => Ok(()),
        }
    }
}
