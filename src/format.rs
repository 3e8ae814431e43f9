// Copyright 2026 The SparseCache Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Persisted binary layouts for sparse entry metadata.
//!
//! Both the parent entry and every child entry store a [SparseData] record in their metadata
//! stream. For the parent the bitmap is the children map and the extent slots are unused; for a
//! child the bitmap is the block allocation map and the extent slots track up to two
//! partially-populated blocks, so unaligned writes stay readable without inflating a partial
//! block to a whole populated one.
//!
//! All integers are encoded little-endian. Layouts must round-trip exactly; caches persisted by
//! one build have to stay readable by the next.

use std::io::Result;

use crate::bitmap::Bitmap;

/// Magic number of sparse entry metadata, ASCII hex of string "SPAR".
pub const SPARSE_MAGIC: u32 = 0x5350_4152;
/// Serialized size of a [SparseHeader].
pub const SPARSE_HEADER_SIZE: usize = 20;
/// Serialized size of a [PartialExtent].
pub const PARTIAL_EXTENT_SIZE: usize = 12;
/// Number of partial-block extent slots tracked per entry.
pub const PARTIAL_EXTENT_COUNT: usize = 2;
/// Serialized size of a [SparseData] without its bitmap.
pub const SPARSE_DATA_FIXED_SIZE: usize =
    SPARSE_HEADER_SIZE + PARTIAL_EXTENT_COUNT * PARTIAL_EXTENT_SIZE;

/// Fixed header shared by the parent entry and all of its children.
///
/// `signature` is generated once when the sparse entry is created and copied into every child;
/// a child whose stored signature differs from its parent's is stale or foreign and gets doomed
/// on open. `last_block_len` is the number of valid bytes in the entry's highest populated
/// block, used to compute data length without scanning payload bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SparseHeader {
    pub signature: i64,
    pub magic: u32,
    pub parent_key_len: i32,
    pub last_block_len: i32,
}

impl SparseHeader {
    /// Create a header for a freshly created sparse entry.
    pub fn new(signature: i64, parent_key_len: i32) -> Self {
        Self {
            signature,
            magic: SPARSE_MAGIC,
            parent_key_len,
            last_block_len: 0,
        }
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.signature.to_le_bytes());
        buf.extend_from_slice(&self.magic.to_le_bytes());
        buf.extend_from_slice(&self.parent_key_len.to_le_bytes());
        buf.extend_from_slice(&self.last_block_len.to_le_bytes());
    }

    /// Decode a header from the start of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < SPARSE_HEADER_SIZE {
            return Err(einval!(format!("sparse header too short: {}", buf.len())));
        }

        Ok(Self {
            signature: i64::from_le_bytes(buf[0..8].try_into().unwrap()),
            magic: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            parent_key_len: i32::from_le_bytes(buf[12..16].try_into().unwrap()),
            last_block_len: i32::from_le_bytes(buf[16..20].try_into().unwrap()),
        })
    }
}

/// A partially populated block: bytes `[start, end)` of block `block` hold valid data.
///
/// `block == -1` marks an unused slot. Blocks recorded here are never also set in the
/// allocation bitmap; once an extent grows to cover its whole block it is promoted to a bitmap
/// bit and the slot is released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartialExtent {
    pub block: i32,
    pub start: i32,
    pub end: i32,
}

impl Default for PartialExtent {
    fn default() -> Self {
        Self {
            block: -1,
            start: 0,
            end: 0,
        }
    }
}

impl PartialExtent {
    /// Whether the slot holds a valid extent.
    pub fn is_used(&self) -> bool {
        self.block >= 0
    }

    /// Release the slot.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.block.to_le_bytes());
        buf.extend_from_slice(&self.start.to_le_bytes());
        buf.extend_from_slice(&self.end.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < PARTIAL_EXTENT_SIZE {
            return Err(einval!(format!("partial extent too short: {}", buf.len())));
        }

        let extent = Self {
            block: i32::from_le_bytes(buf[0..4].try_into().unwrap()),
            start: i32::from_le_bytes(buf[4..8].try_into().unwrap()),
            end: i32::from_le_bytes(buf[8..12].try_into().unwrap()),
        };
        if extent.is_used() && (extent.start < 0 || extent.end <= extent.start) {
            return Err(einval!(format!("invalid partial extent {:?}", extent)));
        }

        Ok(extent)
    }
}

/// The full metadata record persisted in an entry's metadata stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SparseData {
    pub header: SparseHeader,
    pub extents: [PartialExtent; PARTIAL_EXTENT_COUNT],
    pub bitmap: Bitmap,
}

impl SparseData {
    /// Create a record with a clear bitmap of `num_bits` bits.
    pub fn new(header: SparseHeader, num_bits: usize) -> Self {
        Self {
            header,
            extents: Default::default(),
            bitmap: Bitmap::new(num_bits),
        }
    }

    /// Serialize the record.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SPARSE_DATA_FIXED_SIZE + self.bitmap.byte_size());
        self.header.encode_into(&mut buf);
        for extent in self.extents.iter() {
            extent.encode_into(&mut buf);
        }
        buf.extend_from_slice(&self.bitmap.as_bytes());
        buf
    }

    /// Deserialize a record. The bitmap takes all bytes following the fixed fields, so the
    /// decoded bit count is rounded up to a whole word; callers knowing the exact count should
    /// resize afterwards.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < SPARSE_DATA_FIXED_SIZE {
            return Err(einval!(format!(
                "sparse metadata record too short: {}",
                buf.len()
            )));
        }

        let header = SparseHeader::decode(buf)?;
        let mut extents: [PartialExtent; PARTIAL_EXTENT_COUNT] = Default::default();
        for (i, extent) in extents.iter_mut().enumerate() {
            *extent = PartialExtent::decode(&buf[SPARSE_HEADER_SIZE + i * PARTIAL_EXTENT_SIZE..])?;
        }
        let bitmap = Bitmap::from_bytes(&buf[SPARSE_DATA_FIXED_SIZE..])?;

        Ok(Self {
            header,
            extents,
            bitmap,
        })
    }

    /// Serialized size of a record with a bitmap of `num_bits` bits.
    pub fn encoded_size(num_bits: usize) -> usize {
        SPARSE_DATA_FIXED_SIZE + Bitmap::new(num_bits).byte_size()
    }
}
