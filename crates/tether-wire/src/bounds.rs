//! Bounds mode: computes the byte range a valid component can occupy.

use crate::{Component, Mode, SizeOption, Stream, WireError, WireInt};

/// Inclusive range of valid wire sizes for a component.
///
/// `max == u64::MAX` means the component ends in an unconstrained
/// rest-of-stream field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    /// Smallest valid encoding in bytes.
    pub min: u64,
    /// Largest valid encoding in bytes.
    pub max: u64,
}

impl Bounds {
    /// Whether no finite maximum exists.
    pub fn is_unbounded(&self) -> bool {
        self.max == u64::MAX
    }

    /// Whether a buffer of `len` bytes may hold a valid instance.
    pub fn contains(&self, len: usize) -> bool {
        let len = len as u64;
        len >= self.min && len <= self.max
    }
}

/// [`Stream`] that folds a schema into a [`Bounds`] without touching values.
#[derive(Debug, Default)]
pub struct BoundsCounter {
    min: u64,
    max: u64,
}

impl BoundsCounter {
    /// Start counting from zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// The accumulated range.
    pub fn finish(&self) -> Bounds {
        Bounds {
            min: self.min,
            max: self.max,
        }
    }

    fn add(&mut self, min: u64, max: u64) {
        self.min = self.min.saturating_add(min);
        self.max = self.max.saturating_add(max);
    }

    /// Adds an area of `min..=max` elements of `elem` bytes each, plus any prefix.
    fn add_area(&mut self, size: SizeOption, elem: Bounds) -> Result<(), WireError> {
        let (min, max) = size.count_range()?;
        let prefix = match size {
            SizeOption::Prefixed { prefix, .. } => prefix.width() as u64,
            _ => 0,
        };
        let max_bytes = if max == usize::MAX {
            u64::MAX
        } else {
            (max as u64).saturating_mul(elem.max)
        };
        self.add(
            prefix.saturating_add((min as u64).saturating_mul(elem.min)),
            prefix.saturating_add(max_bytes),
        );
        Ok(())
    }
}

fn element_bounds<T: Component + Default>() -> Result<Bounds, WireError> {
    let mut counter = BoundsCounter::new();
    T::default().process(&mut counter)?;
    Ok(counter.finish())
}

const BYTE: Bounds = Bounds { min: 1, max: 1 };

impl Stream for BoundsCounter {
    fn mode(&self) -> Mode {
        Mode::Bounds
    }

    fn int<T: WireInt>(&mut self, _value: &mut T) -> Result<(), WireError> {
        self.add(T::SIZE as u64, T::SIZE as u64);
        Ok(())
    }

    fn int_be<T: WireInt>(&mut self, value: &mut T) -> Result<(), WireError> {
        self.int(value)
    }

    fn bits<T: WireInt>(&mut self, _value: &mut T, size: SizeOption) -> Result<(), WireError> {
        let bytes = size.bit_width(T::bit_count())?.div_ceil(8) as u64;
        self.add(bytes, bytes);
        Ok(())
    }

    fn boolean(&mut self, _value: &mut bool) -> Result<(), WireError> {
        self.add(1, 1);
        Ok(())
    }

    fn bytes(&mut self, _value: &mut Vec<u8>, size: SizeOption) -> Result<(), WireError> {
        self.add_area(size, BYTE)
    }

    fn string(&mut self, _value: &mut String, size: SizeOption) -> Result<(), WireError> {
        self.add_area(size, BYTE)
    }

    fn array<T: Component + Default>(
        &mut self,
        _value: &mut Vec<T>,
        size: SizeOption,
    ) -> Result<(), WireError> {
        self.add_area(size, element_bounds::<T>()?)
    }

    fn optional<T: Component + Default>(
        &mut self,
        _present: bool,
        _value: &mut Option<T>,
    ) -> Result<(), WireError> {
        let inner = element_bounds::<T>()?;
        self.add(0, inner.max);
        Ok(())
    }
}
