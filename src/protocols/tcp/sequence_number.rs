// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

// TCP sequence number (RFC 793, Section 3.3).
//
// The sequence number space wraps around at 2^32, so all arithmetic must be
// performed modulo 2^32 and comparisons are only meaningful between numbers
// less than half the space apart. Wrapping them in their own type keeps the
// modular arithmetic in one place.

use ::std::{
    cmp::Ordering,
    fmt,
};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct SeqNumber(u32);

impl From<SeqNumber> for u32 {
    #[inline]
    fn from(n: SeqNumber) -> u32 {
        n.0
    }
}

impl From<u32> for SeqNumber {
    #[inline]
    fn from(n: u32) -> Self {
        SeqNumber(n)
    }
}

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl ::std::ops::Add for SeqNumber {
    type Output = SeqNumber;

    #[inline]
    fn add(self, other: SeqNumber) -> SeqNumber {
        SeqNumber(self.0.wrapping_add(other.0))
    }
}

impl ::std::ops::Sub for SeqNumber {
    type Output = SeqNumber;

    #[inline]
    fn sub(self, other: SeqNumber) -> SeqNumber {
        SeqNumber(self.0.wrapping_sub(other.0))
    }
}

// Sequence numbers have no total order (the space is circular), so `Ord` is
// deliberately not implemented. The comparison below interprets the wrapped
// difference as a signed quantity, which is correct whenever the two numbers
// are within 2^31 of each other.
impl PartialOrd for SeqNumber {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some((self.0.wrapping_sub(other.0) as i32).cmp(&0))
    }
}

#[cfg(test)]
mod tests {
    use super::SeqNumber;
    use ::anyhow::Result;

    #[test]
    fn comparisons_respect_wraparound() -> Result<()> {
        let small: SeqNumber = SeqNumber::from(16);
        let large: SeqNumber = SeqNumber::from(0xffff_fff0);

        // Within a window, ordering matches the integers.
        crate::ensure_eq!(small < SeqNumber::from(17), true);
        crate::ensure_eq!(SeqNumber::from(17) > small, true);

        // Across the wrap point, 0xfffffff0 is "before" 16.
        crate::ensure_eq!(large < small, true);
        crate::ensure_eq!(small > large, true);

        // Addition wraps.
        crate::ensure_eq!(large + SeqNumber::from(0x20), SeqNumber::from(0x10));
        crate::ensure_eq!(small - SeqNumber::from(0x20), SeqNumber::from(0xffff_fff0));
        Ok(())
    }

    #[test]
    fn difference_converts_to_byte_counts() -> Result<()> {
        let una: SeqNumber = SeqNumber::from(0xffff_ff00);
        let nxt: SeqNumber = una + SeqNumber::from(0x200);
        crate::ensure_eq!(u32::from(nxt - una), 0x200);
        Ok(())
    }
}
