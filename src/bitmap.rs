// Copyright 2026 The SparseCache Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! A fixed-size bit vector with run-find operations and an exact binary serialization.
//!
//! The engine uses two kinds of bitmaps: the parent entry's children map, one bit per potential
//! child index, and each child's allocation map, one bit per data block. Both are persisted
//! verbatim inside the owning entry's metadata stream, so the serialized form (little-endian
//! `u32` words) must round-trip byte for byte.

use std::io::Result;

use crate::utils::div_round_up;

const BITS_PER_WORD: usize = 32;

/// Bit vector backed by `u32` words, serialized as little-endian words.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Bitmap {
    num_bits: usize,
    map: Vec<u32>,
}

impl Bitmap {
    /// Create a bitmap with `num_bits` bits, all clear.
    pub fn new(num_bits: usize) -> Self {
        let words = div_round_up(num_bits as u64, BITS_PER_WORD as u64) as usize;
        Self {
            num_bits,
            map: vec![0u32; words],
        }
    }

    /// Deserialize a bitmap from little-endian `u32` words.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() % 4 != 0 {
            return Err(einval!(format!(
                "bitmap size {} is not a multiple of the word size",
                buf.len()
            )));
        }

        let map = buf
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect::<Vec<u32>>();

        Ok(Self {
            num_bits: map.len() * BITS_PER_WORD,
            map,
        })
    }

    /// Serialize the bitmap as little-endian `u32` words.
    pub fn as_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.map.len() * 4);
        for word in self.map.iter() {
            buf.extend_from_slice(&word.to_le_bytes());
        }
        buf
    }

    /// Number of bits tracked by the bitmap.
    pub fn num_bits(&self) -> usize {
        self.num_bits
    }

    /// Serialized size in bytes.
    pub fn byte_size(&self) -> usize {
        self.map.len() * 4
    }

    /// Get the bit at `index`. Out-of-range indexes read as clear.
    pub fn get(&self, index: usize) -> bool {
        if index >= self.num_bits {
            return false;
        }
        self.map[index / BITS_PER_WORD] & (1u32 << (index % BITS_PER_WORD)) != 0
    }

    /// Set or clear the bit at `index`.
    pub fn set(&mut self, index: usize, value: bool) {
        debug_assert!(index < self.num_bits);
        if index >= self.num_bits {
            return;
        }
        let mask = 1u32 << (index % BITS_PER_WORD);
        if value {
            self.map[index / BITS_PER_WORD] |= mask;
        } else {
            self.map[index / BITS_PER_WORD] &= !mask;
        }
    }

    /// Set or clear all bits in `[start, end)`.
    pub fn set_range(&mut self, start: usize, end: usize, value: bool) {
        let end = end.min(self.num_bits);
        let mut i = start;
        while i < end {
            if i % BITS_PER_WORD == 0 && end - i >= BITS_PER_WORD {
                self.map[i / BITS_PER_WORD] = if value { u32::MAX } else { 0 };
                i += BITS_PER_WORD;
            } else {
                self.set(i, value);
                i += 1;
            }
        }
    }

    /// Find the first bit in `[start, limit)` matching `value`, skipping whole words where
    /// possible.
    pub fn find_next_bit(&self, start: usize, limit: usize, value: bool) -> Option<usize> {
        let limit = limit.min(self.num_bits);
        let mut i = start;
        while i < limit {
            let word_idx = i / BITS_PER_WORD;
            let mut word = self.map[word_idx];
            if !value {
                word = !word;
            }
            word &= u32::MAX << (i % BITS_PER_WORD);
            if word != 0 {
                let bit = word_idx * BITS_PER_WORD + word.trailing_zeros() as usize;
                return if bit < limit { Some(bit) } else { None };
            }
            i = (word_idx + 1) * BITS_PER_WORD;
        }

        None
    }

    /// Length of the run of bits matching `value` starting exactly at `start`, bounded by
    /// `limit`. Returns 0 when the bit at `start` does not match.
    pub fn run_length(&self, start: usize, limit: usize, value: bool) -> usize {
        let limit = limit.min(self.num_bits);
        if start >= limit {
            return 0;
        }
        match self.find_next_bit(start, limit, !value) {
            Some(next) => next - start,
            None => limit - start,
        }
    }

    /// Index of the highest set bit, if any.
    pub fn find_last_set(&self) -> Option<usize> {
        for (w, word) in self.map.iter().enumerate().rev() {
            if *word != 0 {
                return Some(w * BITS_PER_WORD + (31 - word.leading_zeros() as usize));
            }
        }

        None
    }

    /// Grow or shrink the bitmap to `num_bits`, preserving existing bits in range.
    pub fn resize(&mut self, num_bits: usize) {
        let words = div_round_up(num_bits as u64, BITS_PER_WORD as u64) as usize;
        self.map.resize(words, 0);
        self.num_bits = num_bits;
        if num_bits % BITS_PER_WORD != 0 {
            if let Some(last) = self.map.last_mut() {
                *last &= (1u32 << (num_bits % BITS_PER_WORD)) - 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_set() {
        let mut map = Bitmap::new(100);
        assert_eq!(map.num_bits(), 100);
        assert_eq!(map.byte_size(), 16);
        assert!(!map.get(0));
        assert!(!map.get(99));
        assert!(!map.get(1000));

        map.set(0, true);
        map.set(33, true);
        map.set(99, true);
        assert!(map.get(0));
        assert!(map.get(33));
        assert!(map.get(99));
        assert!(!map.get(1));

        map.set(33, false);
        assert!(!map.get(33));
    }

    #[test]
    fn test_set_range() {
        let mut map = Bitmap::new(256);
        map.set_range(10, 100, true);
        assert!(!map.get(9));
        for i in 10..100 {
            assert!(map.get(i));
        }
        assert!(!map.get(100));

        map.set_range(30, 40, false);
        assert!(map.get(29));
        assert!(!map.get(30));
        assert!(!map.get(39));
        assert!(map.get(40));

        // end is clamped to the bitmap size
        map.set_range(250, 1000, true);
        assert!(map.get(255));
    }

    #[test]
    fn test_find_next_bit() {
        let mut map = Bitmap::new(256);
        assert_eq!(map.find_next_bit(0, 256, true), None);
        assert_eq!(map.find_next_bit(0, 256, false), Some(0));

        map.set_range(64, 128, true);
        assert_eq!(map.find_next_bit(0, 256, true), Some(64));
        assert_eq!(map.find_next_bit(64, 256, false), Some(128));
        assert_eq!(map.find_next_bit(70, 100, false), None);
        assert_eq!(map.find_next_bit(200, 256, true), None);
        // limit is exclusive
        assert_eq!(map.find_next_bit(0, 64, true), None);
    }

    #[test]
    fn test_run_length() {
        let mut map = Bitmap::new(256);
        map.set_range(10, 50, true);
        assert_eq!(map.run_length(10, 256, true), 40);
        assert_eq!(map.run_length(20, 256, true), 30);
        assert_eq!(map.run_length(10, 30, true), 20);
        assert_eq!(map.run_length(9, 256, true), 0);
        assert_eq!(map.run_length(50, 256, false), 206);
        assert_eq!(map.run_length(300, 400, true), 0);
    }

    #[test]
    fn test_find_last_set() {
        let mut map = Bitmap::new(256);
        assert_eq!(map.find_last_set(), None);
        map.set(0, true);
        assert_eq!(map.find_last_set(), Some(0));
        map.set(77, true);
        assert_eq!(map.find_last_set(), Some(77));
        map.set(255, true);
        assert_eq!(map.find_last_set(), Some(255));
    }

    #[test]
    fn test_serialize() {
        let mut map = Bitmap::new(96);
        map.set(0, true);
        map.set(40, true);
        map.set(95, true);

        let bytes = map.as_bytes();
        assert_eq!(bytes.len(), 12);
        let restored = Bitmap::from_bytes(&bytes).unwrap();
        assert_eq!(restored.num_bits(), 96);
        assert!(restored.get(0));
        assert!(restored.get(40));
        assert!(restored.get(95));
        assert_eq!(restored.as_bytes(), bytes);

        Bitmap::from_bytes(&bytes[..5]).unwrap_err();
    }

    #[test]
    fn test_resize() {
        let mut map = Bitmap::new(40);
        map.set_range(0, 40, true);
        map.resize(16);
        assert_eq!(map.num_bits(), 16);
        // bits past the new size must not survive a later grow
        map.resize(40);
        assert!(map.get(15));
        assert!(!map.get(16));
        assert!(!map.get(39));
    }
}
