//! Participation bitmask of a quorum certificate
//!
//! One bit per validator index of the active set; bit `i` is set when
//! validator `i` contributed its signature to the aggregate.

use crate::ValidatorIndex;
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub struct ValidatorBitmask {
    bits: Vec<u8>,
    num_validators: usize,
}

impl ValidatorBitmask {
    /// Empty bitmask sized for `num_validators`
    pub fn new(num_validators: usize) -> Self {
        Self {
            bits: vec![0u8; num_validators.div_ceil(8)],
            num_validators,
        }
    }

    /// Bitmask with exactly the given indices set; out-of-range indices are ignored
    pub fn from_indices(num_validators: usize, indices: impl IntoIterator<Item = usize>) -> Self {
        let mut mask = Self::new(num_validators);
        for index in indices {
            mask.set(index);
        }
        mask
    }

    pub fn set(&mut self, index: ValidatorIndex) {
        if index < self.num_validators {
            self.bits[index / 8] |= 1 << (index % 8);
        }
    }

    pub fn clear(&mut self, index: ValidatorIndex) {
        if index < self.num_validators {
            self.bits[index / 8] &= !(1 << (index % 8));
        }
    }

    /// Flip a single bit
    pub fn toggle(&mut self, index: ValidatorIndex) {
        if index < self.num_validators {
            self.bits[index / 8] ^= 1 << (index % 8);
        }
    }

    pub fn is_set(&self, index: ValidatorIndex) -> bool {
        if index >= self.num_validators {
            return false;
        }
        self.bits
            .get(index / 8)
            .is_some_and(|byte| (byte >> (index % 8)) & 1 == 1)
    }

    /// Number of participating validators
    pub fn count_ones(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Size of the validator set this bitmask was built for
    pub fn num_validators(&self) -> usize {
        self.num_validators
    }

    /// Indices of participating validators in ascending order
    pub fn set_indices(&self) -> impl Iterator<Item = ValidatorIndex> + '_ {
        (0..self.num_validators).filter(|&i| self.is_set(i))
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    /// Byte length matches the declared size and no bit beyond it is set.
    /// Bitmasks decoded from the wire must pass this before use.
    pub fn is_well_formed(&self) -> bool {
        if self.bits.len() != self.num_validators.div_ceil(8) {
            return false;
        }
        let tail = self.num_validators % 8;
        match self.bits.last() {
            Some(last) if tail != 0 => last >> tail == 0,
            _ => true,
        }
    }
}

/// Renders as a bit string, index 0 first (`1101` = validators 0, 1 and 3)
impl fmt::Display for ValidatorBitmask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for index in 0..self.num_validators {
            f.write_str(if self.is_set(index) { "1" } else { "0" })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmask_basic() {
        let mut mask = ValidatorBitmask::new(10);
        assert!(mask.is_empty());

        mask.set(0);
        mask.set(5);
        mask.set(9);
        mask.set(10); // out of range, ignored

        assert!(mask.is_set(0));
        assert!(mask.is_set(9));
        assert!(!mask.is_set(1));
        assert!(!mask.is_set(10));
        assert_eq!(mask.count_ones(), 3);
        assert!(mask.is_well_formed());

        mask.clear(5);
        assert_eq!(mask.set_indices().collect::<Vec<_>>(), vec![0, 9]);
    }

    #[test]
    fn test_display_bit_string() {
        let mask = ValidatorBitmask::from_indices(4, [0, 2, 3]);
        assert_eq!(mask.to_string(), "1011");

        let full = ValidatorBitmask::from_indices(4, 0..4);
        assert_eq!(full.to_string(), "1111");
    }

    #[test]
    fn test_toggle() {
        let mut mask = ValidatorBitmask::from_indices(4, [0, 2, 3]);
        mask.toggle(1);
        assert_eq!(mask.to_string(), "1111");
        mask.toggle(1);
        assert_eq!(mask.to_string(), "1011");
    }

    #[test]
    fn test_malformed_bitmask() {
        let stray = ValidatorBitmask {
            bits: vec![0b0001_0000],
            num_validators: 4,
        };
        assert!(!stray.is_well_formed());

        let short = ValidatorBitmask {
            bits: vec![],
            num_validators: 4,
        };
        assert!(!short.is_well_formed());
    }
}
