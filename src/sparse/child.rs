// Copyright 2026 The SparseCache Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Per-child bookkeeping for sparse entries.
//!
//! A child covers one fixed-size span of the parent's logical address space. Its metadata
//! record tracks which blocks of the span hold valid payload bytes: whole blocks in the
//! allocation bitmap, plus up to two partially populated blocks in the extent slots. The
//! bookkeeping is updated after every successful write and consulted by reads and availability
//! queries, so payload bytes never have to be scanned.

use std::sync::Arc;

use crate::backend::CacheEntry;
use crate::format::{PartialExtent, SparseData, SparseHeader, SPARSE_MAGIC};
use crate::utils::div_round_up;
use crate::SparseCacheConfig;

/// Derive the cache key of child `index` from its parent's key.
///
/// The key is deterministic so a child can always be reopened by deriving the key again; no
/// child index is persisted anywhere else.
pub(crate) fn child_key(parent_key: &str, index: u32) -> String {
    format!("range:{}:{:08x}", parent_key, index)
}

/// An open child entry together with its decoded metadata.
pub(crate) struct ChildState {
    pub index: u32,
    pub entry: Arc<dyn CacheEntry>,
    pub data: SparseData,
    block_size: u32,
    blocks: u32,
}

impl ChildState {
    /// State for a freshly created child, inheriting the parent's signature.
    pub fn new(
        index: u32,
        entry: Arc<dyn CacheEntry>,
        config: &SparseCacheConfig,
        parent: &SparseHeader,
    ) -> Self {
        let blocks = config.blocks_per_child();
        let header = SparseHeader::new(parent.signature, parent.parent_key_len);
        Self {
            index,
            entry,
            data: SparseData::new(header, blocks as usize),
            block_size: config.block_size,
            blocks,
        }
    }

    /// Decode and verify a child's metadata record. Returns `None` when the record is corrupt,
    /// stale or does not match the parent; such a child must be doomed and treated as absent.
    pub fn from_meta(
        index: u32,
        entry: Arc<dyn CacheEntry>,
        buf: &[u8],
        config: &SparseCacheConfig,
        parent: &SparseHeader,
    ) -> Option<Self> {
        let mut data = SparseData::decode(buf).ok()?;
        let blocks = config.blocks_per_child();
        if data.header.magic != SPARSE_MAGIC
            || data.header.signature != parent.signature
            || data.header.parent_key_len != parent.parent_key_len
            || data.header.last_block_len < 0
            || data.header.last_block_len as u32 > config.block_size
            || data.bitmap.num_bits() < blocks as usize
        {
            return None;
        }
        for extent in data.extents.iter() {
            if extent.is_used()
                && (extent.block as u32 >= blocks || extent.end as u32 > config.block_size)
            {
                return None;
            }
        }
        data.bitmap.resize(blocks as usize);

        Some(Self {
            index,
            entry,
            data,
            block_size: config.block_size,
            blocks,
        })
    }

    /// Record that bytes `[offset, offset + len)` of this child now hold valid data. Whole
    /// blocks go into the allocation bitmap; unaligned head and tail pieces go into the
    /// partial-extent slots.
    pub fn update_range(&mut self, offset: u32, len: u32) {
        if len == 0 {
            return;
        }
        let bs = self.block_size;
        let end = offset + len;
        debug_assert!(end <= self.blocks * bs);

        let first_block = offset / bs;
        let last_block = (end - 1) / bs;

        let first_full = div_round_up(offset as u64, bs as u64) as u32;
        let last_full = end / bs;
        if first_full < last_full {
            self.data
                .bitmap
                .set_range(first_full as usize, last_full as usize, true);
            for extent in self.data.extents.iter_mut() {
                if extent.is_used()
                    && (extent.block as u32) >= first_full
                    && (extent.block as u32) < last_full
                {
                    extent.clear();
                }
            }
        }

        if first_block == last_block {
            if offset % bs != 0 || end % bs != 0 {
                self.add_extent(first_block, offset - first_block * bs, end - first_block * bs);
            }
        } else {
            if offset % bs != 0 {
                self.add_extent(first_block, offset - first_block * bs, bs);
            }
            if end % bs != 0 {
                self.add_extent(last_block, 0, end - last_block * bs);
            }
        }

        self.refresh_last_block_len();
    }

    /// First populated byte at or after `pos` and the contiguous populated run from there,
    /// as `(start, len)`. `len` is 0 when nothing is populated at or after `pos`.
    pub fn available_from(&self, pos: u32) -> (u32, u32) {
        let bs = self.block_size;
        let span = self.blocks * bs;
        if pos >= span {
            return (pos, 0);
        }

        let start = match self.first_populated(pos) {
            Some(s) => s,
            None => return (pos, 0),
        };

        let mut cur = start;
        while cur < span {
            let block = cur / bs;
            if self.data.bitmap.get(block as usize) {
                cur = (block + 1) * bs;
                continue;
            }
            if let Some(extent) = self.extent_for(block) {
                let base = block * bs;
                let (es, ee) = (base + extent.start as u32, base + extent.end as u32);
                if cur >= es && cur < ee {
                    cur = ee;
                    if (extent.end as u32) < bs {
                        break;
                    }
                    continue;
                }
            }
            break;
        }

        (start, cur - start)
    }

    /// Length of the child's valid data, end of the highest populated byte: the highest
    /// populated block plus the persisted `last_block_len` bytes valid inside it.
    pub fn data_len(&self) -> u32 {
        let mut last: Option<u32> = self.data.bitmap.find_last_set().map(|b| b as u32);
        for extent in self.data.extents.iter() {
            if extent.is_used() && last.map_or(true, |block| extent.block as u32 > block) {
                last = Some(extent.block as u32);
            }
        }
        match last {
            Some(block) => block * self.block_size + self.data.header.last_block_len as u32,
            None => 0,
        }
    }

    fn extent_for(&self, block: u32) -> Option<&PartialExtent> {
        self.data
            .extents
            .iter()
            .find(|e| e.is_used() && e.block as u32 == block)
    }

    fn first_populated(&self, pos: u32) -> Option<u32> {
        let bs = self.block_size;
        let first_block = pos / bs;

        if self.data.bitmap.get(first_block as usize) {
            return Some(pos);
        }
        let mut candidate: Option<u32> = None;
        if let Some(extent) = self.extent_for(first_block) {
            let base = first_block * bs;
            let (es, ee) = (base + extent.start as u32, base + extent.end as u32);
            if pos >= es && pos < ee {
                return Some(pos);
            }
            if pos < es {
                candidate = Some(es);
            }
        }
        if let Some(block) =
            self.data
                .bitmap
                .find_next_bit(first_block as usize + 1, self.blocks as usize, true)
        {
            let v = block as u32 * bs;
            candidate = Some(candidate.map_or(v, |c| c.min(v)));
        }
        for extent in self.data.extents.iter() {
            if extent.is_used() && extent.block as u32 > first_block {
                let v = extent.block as u32 * bs + extent.start as u32;
                candidate = Some(candidate.map_or(v, |c| c.min(v)));
            }
        }
        candidate
    }

    fn add_extent(&mut self, block: u32, start: u32, end: u32) {
        debug_assert!(start < end && end <= self.block_size);
        if self.data.bitmap.get(block as usize) {
            return;
        }

        for i in 0..self.data.extents.len() {
            let slot = self.data.extents[i];
            if slot.is_used() && slot.block as u32 == block {
                let (ns, ne) = if start <= slot.end as u32 && slot.start as u32 <= end {
                    ((slot.start as u32).min(start), (slot.end as u32).max(end))
                } else {
                    // disjoint rewrite of the same block; keep the newest range
                    (start, end)
                };
                if ns == 0 && ne == self.block_size {
                    self.data.extents[i].clear();
                    self.data.bitmap.set(block as usize, true);
                } else {
                    self.data.extents[i] = PartialExtent {
                        block: block as i32,
                        start: ns as i32,
                        end: ne as i32,
                    };
                }
                return;
            }
        }

        let extent = PartialExtent {
            block: block as i32,
            start: start as i32,
            end: end as i32,
        };
        if let Some(slot) = self.data.extents.iter_mut().find(|s| !s.is_used()) {
            *slot = extent;
            return;
        }
        // both slots taken; recycle the older one
        self.data.extents[0] = self.data.extents[1];
        self.data.extents[1] = extent;
    }

    fn refresh_last_block_len(&mut self) {
        let mut best: Option<(u32, u32)> = self
            .data
            .bitmap
            .find_last_set()
            .map(|block| (block as u32, self.block_size));
        for extent in self.data.extents.iter() {
            if extent.is_used()
                && best.map_or(true, |(block, _)| extent.block as u32 > block)
            {
                best = Some((extent.block as u32, extent.end as u32));
            }
        }
        self.data.header.last_block_len = best.map_or(0, |(_, len)| len as i32);
    }
}
