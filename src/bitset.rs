// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Growable ROWID bitset
///
/// Used for deletion tombstones and for masking expunged rows during
/// searches. Unlike a bloom filter this is exact.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RowIdSet {
    words: Vec<u64>,
    len: u32,
}

impl RowIdSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rowids in the set.
    #[must_use]
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Returns `true` if no rowid is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sets the bit for `rowid`, returning whether it was newly set.
    pub fn set(&mut self, rowid: u32) -> bool {
        let word = (rowid / 64) as usize;
        let bit = 1u64 << (rowid % 64);

        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }

        #[allow(clippy::indexing_slicing)]
        let slot = &mut self.words[word];

        if *slot & bit == 0 {
            *slot |= bit;
            self.len += 1;
            true
        } else {
            false
        }
    }

    /// Clears the bit for `rowid`, returning whether it was set.
    pub fn unset(&mut self, rowid: u32) -> bool {
        let word = (rowid / 64) as usize;
        let bit = 1u64 << (rowid % 64);

        match self.words.get_mut(word) {
            Some(slot) if *slot & bit != 0 => {
                *slot &= !bit;
                self.len -= 1;
                true
            }
            _ => false,
        }
    }

    /// Returns whether `rowid` is in the set.
    #[must_use]
    pub fn test(&self, rowid: u32) -> bool {
        let word = (rowid / 64) as usize;
        let bit = 1u64 << (rowid % 64);
        self.words.get(word).is_some_and(|w| w & bit != 0)
    }

    /// Adds every rowid of `other` to this set.
    pub fn union_with(&mut self, other: &Self) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (slot, w) in self.words.iter_mut().zip(other.words.iter()) {
            *slot |= w;
        }
        self.len = self.words.iter().map(|w| w.count_ones()).sum();
    }

    /// Empties the set.
    pub fn clear(&mut self) {
        self.words.clear();
        self.len = 0;
    }

    /// Iterates set rowids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().enumerate().flat_map(|(i, w)| {
            let w = *w;
            (0u32..64).filter(move |bit| w & (1u64 << bit) != 0).map(
                move |bit| {
                    #[allow(clippy::cast_possible_truncation)]
                    let base = (i * 64) as u32;
                    base + bit
                },
            )
        })
    }
}

impl Encode for RowIdSet {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        // NOTE: Word counts are bounded by the 32-bit rowid space
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32::<LittleEndian>(self.words.len() as u32)?;

        for w in &self.words {
            writer.write_u64::<LittleEndian>(*w)?;
        }
        Ok(())
    }
}

impl Decode for RowIdSet {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let word_count = reader.read_u32::<LittleEndian>()? as usize;

        let mut words = Vec::with_capacity(word_count);
        for _ in 0..word_count {
            words.push(reader.read_u64::<LittleEndian>()?);
        }

        let len = words.iter().map(|w| w.count_ones()).sum();
        Ok(Self { words, len })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn set_test_unset() {
        let mut set = RowIdSet::new();
        assert!(!set.test(5));

        assert!(set.set(5));
        assert!(!set.set(5));
        assert!(set.test(5));
        assert_eq!(1, set.len());

        assert!(set.set(1_000_000));
        assert_eq!(2, set.len());

        assert!(set.unset(5));
        assert!(!set.unset(5));
        assert!(!set.test(5));
        assert_eq!(1, set.len());
    }

    #[test]
    fn iter_ascending() {
        let mut set = RowIdSet::new();
        for rowid in [70, 3, 64, 0, 500] {
            set.set(rowid);
        }
        assert_eq!(vec![0, 3, 64, 70, 500], set.iter().collect::<Vec<_>>());
    }

    #[test]
    fn union() {
        let mut a = RowIdSet::new();
        a.set(1);
        a.set(2);

        let mut b = RowIdSet::new();
        b.set(2);
        b.set(400);

        a.union_with(&b);
        assert_eq!(vec![1, 2, 400], a.iter().collect::<Vec<_>>());
        assert_eq!(3, a.len());
    }

    #[test]
    fn roundtrip() -> crate::Result<()> {
        let mut set = RowIdSet::new();
        set.set(9);
        set.set(99);
        set.set(999);

        let bytes = set.encode_into_vec();
        let decoded = RowIdSet::decode_from(&mut &bytes[..])?;
        assert_eq!(set, decoded);

        Ok(())
    }
}
