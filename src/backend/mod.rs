// Copyright 2026 The SparseCache Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The cache backend contract consumed by the sparse engine.
//!
//! The engine does not implement a full disk cache. It consumes a conventional entry store
//! through the [CacheBackend] and [CacheEntry] traits: entries are keyed by strings, hold a
//! small fixed number of independent byte streams, and support offset-addressed reads and
//! writes. Two implementations ship with the crate:
//! - [MemBackend](memory/struct.MemBackend.html): entries kept in memory, mainly for tests and
//!   embedders that manage persistence themselves.
//! - [FileCacheBackend](filecache/struct.FileCacheBackend.html): one file per entry stream under
//!   a cache directory.
//!
//! The backend must serialize concurrent access to a given key; the engine itself never issues
//! overlapping operations against one entry.

use std::io::Result;
use std::sync::Arc;

use async_trait::async_trait;

pub mod filecache;
pub mod memory;

pub use filecache::FileCacheBackend;
pub use memory::MemBackend;

/// Stream index holding an entry's metadata (sparse headers and bitmaps).
pub const META_STREAM: u32 = 0;
/// Stream index holding an entry's payload data.
pub const DATA_STREAM: u32 = 1;
/// Number of streams per entry.
pub const STREAM_COUNT: usize = 2;

/// An open cache entry with independently addressed byte streams.
#[async_trait]
pub trait CacheEntry: Send + Sync {
    /// The key the entry was opened or created with.
    fn key(&self) -> &str;

    /// Current size in bytes of `stream`. Synchronous by contract; backends keep sizes cheap to
    /// query.
    fn get_data_size(&self, stream: u32) -> usize;

    /// Read up to `buf.len()` bytes from `stream` at `offset`. Reads past the end of the stream
    /// return short counts, down to zero.
    async fn read_data(&self, stream: u32, offset: usize, buf: &mut [u8]) -> Result<usize>;

    /// Write `buf` to `stream` at `offset`, growing the stream and zero-filling any gap. With
    /// `truncate` the stream is cut to exactly `offset + buf.len()` bytes afterwards.
    async fn write_data(&self, stream: u32, offset: usize, buf: &[u8], truncate: bool)
        -> Result<usize>;
}

/// An entry store addressed by string keys.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Open an existing entry. Fails with `ENOENT` when the key is unknown.
    async fn open_entry(&self, key: &str) -> Result<Arc<dyn CacheEntry>>;

    /// Create a new entry. Fails with `EEXIST` when the key already exists.
    async fn create_entry(&self, key: &str) -> Result<Arc<dyn CacheEntry>>;

    /// Remove an entry and its data. Removing an unknown key is not an error.
    async fn doom_entry(&self, key: &str) -> Result<()>;
}
