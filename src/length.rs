//! Accumulated source extents: bytes, characters, and a row/column point.

use std::ops::{Add, AddAssign, Mul};

use crate::point::Point;

/// The distance covered by a range of source text, tracked in every metric
/// the parser cares about. Positions on the stack accumulate lengths
/// left-to-right.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Length {
    pub bytes: u32,
    pub chars: u32,
    pub extent: Point,
}

impl Length {
    pub const ZERO: Length = Length {
        bytes: 0,
        chars: 0,
        extent: Point::ZERO,
    };

    #[inline]
    pub const fn new(bytes: u32, chars: u32, rows: u32, columns: u32) -> Length {
        Length {
            bytes,
            chars,
            extent: Point::new(rows, columns),
        }
    }
}

impl Add for Length {
    type Output = Length;

    #[inline]
    fn add(self, rhs: Length) -> Length {
        Length {
            bytes: self.bytes + rhs.bytes,
            chars: self.chars + rhs.chars,
            extent: self.extent + rhs.extent,
        }
    }
}

impl AddAssign for Length {
    #[inline]
    fn add_assign(&mut self, rhs: Length) {
        *self = *self + rhs;
    }
}

impl Mul<u32> for Length {
    type Output = Length;

    /// Scales every component, as if the same extent repeated on one line.
    #[inline]
    fn mul(self, factor: u32) -> Length {
        Length {
            bytes: self.bytes * factor,
            chars: self.chars * factor,
            extent: self.extent * factor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_accumulates_every_component() {
        let sum = Length::new(2, 3, 0, 3) + Length::new(4, 4, 1, 2);
        assert_eq!(sum, Length::new(6, 7, 1, 2));
    }

    #[test]
    fn scaling_matches_repeated_addition() {
        let len = Length::new(2, 3, 0, 3);
        assert_eq!(len * 3, len + len + len);
    }
}
