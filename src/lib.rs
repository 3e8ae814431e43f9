// Copyright 2026 The SparseCache Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Sparse entry storage engine for chunked disk caches.
//!
//! A sparse cache entry is a logical byte range with potentially large unwritten holes. Instead
//! of storing it as one contiguous blob, the engine partitions the logical address space into
//! fixed-size spans and stores each populated span in its own conventional cache entry, called a
//! child entry. A parent entry keeps a bitmap of which children exist, and every child keeps a
//! bitmap of which fixed-size blocks inside it hold valid bytes. Reads, writes and availability
//! queries against the logical range are translated into per-child operations, so child
//! boundaries are invisible to callers.
//!
//! The crate provides:
//! - [SparseControl](sparse/struct.SparseControl.html): the engine bound to one parent entry,
//!   orchestrating child entry I/O.
//! - [CacheBackend](backend/trait.CacheBackend.html)/[CacheEntry](backend/trait.CacheEntry.html):
//!   the contract the engine consumes from the surrounding cache, with an in-memory and a
//!   file-backed implementation.
//! - [Bitmap](bitmap/struct.Bitmap.html): a bit vector with run-find operations and an exact
//!   binary serialization.
//! - [format](format/index.html): the persisted header layouts shared by parent and children.
//!
//! The engine itself never spawns tasks or threads. All methods are async and complete on the
//! caller's task; cancellation is cooperative between child operations.

#[macro_use]
extern crate log;
#[macro_use]
extern crate serde;

#[macro_use]
pub mod error;

pub mod backend;
pub mod bitmap;
pub mod format;
pub mod sparse;
pub mod utils;

pub use sparse::SparseControl;

use std::io::Result;

/// Default size in bytes of one allocation block, the minimum range tracked as populated.
pub const DEFAULT_BLOCK_SIZE: u32 = 0x400;
/// Default size in bytes of the logical span covered by one child entry.
pub const DEFAULT_CHILD_SIZE: u32 = 0x10_0000;
/// Upper bound on `child_size / block_size`, which caps a child's allocation bitmap.
pub const MAX_BLOCKS_PER_CHILD: u32 = 0x1_0000;
/// Upper bound on the child index, which caps the logical size of a sparse entry.
pub const MAX_CHILD_INDEX: u64 = 0x0FFF_FFFF;

fn default_block_size() -> u32 {
    DEFAULT_BLOCK_SIZE
}

fn default_child_size() -> u32 {
    DEFAULT_CHILD_SIZE
}

/// Geometry of a sparse entry: block granularity and per-child span.
///
/// The configuration is fixed when a sparse entry is created and must not change for its
/// lifetime, otherwise persisted bitmaps no longer line up with the data they describe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct SparseCacheConfig {
    /// Size in bytes of one allocation block.
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    /// Size in bytes of the logical span covered by one child entry.
    #[serde(default = "default_child_size")]
    pub child_size: u32,
}

impl Default for SparseCacheConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            child_size: DEFAULT_CHILD_SIZE,
        }
    }
}

impl SparseCacheConfig {
    /// Validate the configured geometry.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(einval!(format!(
                "invalid sparse cache block size {}",
                self.block_size
            )));
        }
        if self.child_size == 0 || !self.child_size.is_power_of_two() {
            return Err(einval!(format!(
                "invalid sparse cache child size {}",
                self.child_size
            )));
        }
        if self.child_size < self.block_size {
            return Err(einval!(format!(
                "child size {} is smaller than block size {}",
                self.child_size, self.block_size
            )));
        }
        if self.child_size / self.block_size > MAX_BLOCKS_PER_CHILD {
            return Err(einval!(format!(
                "child size {} needs more than {} blocks",
                self.child_size, MAX_BLOCKS_PER_CHILD
            )));
        }

        Ok(())
    }

    /// Number of allocation blocks covered by one child entry.
    pub fn blocks_per_child(&self) -> u32 {
        self.child_size / self.block_size
    }
}
