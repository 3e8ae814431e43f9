// Copyright 2026 The SparseCache Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The sparse entry engine.
//!
//! A [SparseControl] is bound to one parent cache entry and owns the mapping from the entry's
//! logical byte range onto fixed-span child entries. Every operation walks the children
//! overlapping the requested range in ascending index order, clamps the range to each child's
//! span, performs the per-child I/O, and aggregates the result. Children are opened lazily per
//! operation and verified against the parent's signature; a child failing verification is
//! doomed and treated as never written, so corruption of one child stays invisible except as a
//! hole in the data.
//!
//! At most one operation may be in flight per instance; a second one fails with `EALREADY`
//! instead of queuing. Cancellation is cooperative: [SparseControl::cancel] stops the in-flight
//! operation between children and the operation returns its partial result.

use std::io::{ErrorKind, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{Mutex, Notify};

use crate::backend::{CacheBackend, CacheEntry, DATA_STREAM, META_STREAM};
use crate::format::{SparseData, SparseHeader, SPARSE_DATA_FIXED_SIZE, SPARSE_MAGIC};
use crate::utils::{alloc_buf, div_round_up};
use crate::{SparseCacheConfig, MAX_CHILD_INDEX};

mod child;

use child::{child_key, ChildState};

/// Children-map growth granularity in bits.
const CHILDREN_MAP_GROWTH: u64 = 64;

/// In-memory state of one sparse entry: the persisted parent record (header plus children map)
/// and the derived logical length.
struct SparseState {
    data: SparseData,
    logical_len: u64,
}

/// Controller for one sparse cache entry.
///
/// Created with [SparseControl::new], which either lays out a fresh sparse entry or validates
/// and loads an existing one. All I/O methods are async and complete on the caller's task.
pub struct SparseControl {
    backend: Arc<dyn CacheBackend>,
    entry: Arc<dyn CacheEntry>,
    config: SparseCacheConfig,
    state: Mutex<SparseState>,
    busy: AtomicBool,
    abort: AtomicBool,
    idle: Notify,
}

/// Releases the single-operation slot and wakes `ready_to_use` waiters.
struct OpGuard<'a>(&'a SparseControl);

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        self.0.busy.store(false, Ordering::Release);
        self.0.idle.notify_waiters();
    }
}

fn generate_signature() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i64,
        Err(_) => 1,
    }
}

impl SparseControl {
    /// Bind a controller to `entry`, creating the sparse layout when the entry's metadata
    /// stream is empty, otherwise validating and loading it. An entry carrying regular payload
    /// data, a bad magic number or a mismatched key length fails with `EINVAL`.
    pub async fn new(
        backend: Arc<dyn CacheBackend>,
        entry: Arc<dyn CacheEntry>,
        config: SparseCacheConfig,
    ) -> Result<Self> {
        config.validate()?;
        let key_len = entry.key().len();
        if key_len == 0 || key_len > i32::MAX as usize {
            return Err(einval!(format!("invalid entry key length {}", key_len)));
        }
        if entry.get_data_size(DATA_STREAM) != 0 {
            return Err(einval!(format!(
                "entry {} holds regular data and cannot be used as sparse",
                entry.key()
            )));
        }

        let meta_size = entry.get_data_size(META_STREAM);
        let (data, existing) = if meta_size == 0 {
            let header = SparseHeader::new(generate_signature(), key_len as i32);
            let data = SparseData::new(header, CHILDREN_MAP_GROWTH as usize);
            (data, false)
        } else {
            if meta_size < SPARSE_DATA_FIXED_SIZE {
                return Err(einval!(format!(
                    "entry {} has undersized sparse metadata: {} bytes",
                    entry.key(),
                    meta_size
                )));
            }
            let mut buf = alloc_buf(meta_size);
            let count = entry.read_data(META_STREAM, 0, &mut buf).await?;
            if count != meta_size {
                return Err(einval!(format!(
                    "short read of sparse metadata: {} out of {} bytes",
                    count, meta_size
                )));
            }
            let data = SparseData::decode(&buf)?;
            if data.header.magic != SPARSE_MAGIC {
                return Err(einval!(format!(
                    "entry {} has invalid sparse magic {:#x}",
                    entry.key(),
                    data.header.magic
                )));
            }
            if data.header.parent_key_len != key_len as i32 {
                return Err(einval!(format!(
                    "entry {} has mismatched key length in sparse metadata",
                    entry.key()
                )));
            }
            (data, true)
        };

        let ctrl = Self {
            backend,
            entry,
            config,
            state: Mutex::new(SparseState {
                data,
                logical_len: 0,
            }),
            busy: AtomicBool::new(false),
            abort: AtomicBool::new(false),
            idle: Notify::new(),
        };

        {
            let mut state = ctrl.state.lock().await;
            if existing {
                ctrl.recover_logical_len(&mut state).await?;
            } else {
                ctrl.write_parent_meta(&state).await?;
            }
        }

        Ok(ctrl)
    }

    /// Best-effort check whether `entry` already carries a sparse layout, without any I/O
    /// beyond the entry's size getters.
    pub fn could_be_sparse(entry: &dyn CacheEntry) -> bool {
        entry.get_data_size(DATA_STREAM) == 0
            && entry.get_data_size(META_STREAM) >= SPARSE_DATA_FIXED_SIZE
    }

    /// Current logical length: one past the highest byte ever written.
    pub async fn len(&self) -> u64 {
        self.state.lock().await.logical_len
    }

    /// Read from the logical range starting at `offset` into `buf`, returning the number of
    /// bytes read. The read stops at the first hole, so a return shorter than `buf.len()`
    /// means the remainder of the range is unpopulated (or the operation was cancelled).
    pub async fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let _op = self.begin_op()?;
        let mut state = self.state.lock().await;
        self.do_read(&mut state, offset, buf).await
    }

    /// Write `buf` at logical `offset`, creating children on demand. Returns the number of
    /// bytes written, which is `buf.len()` unless the operation was cancelled part way.
    pub async fn write(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        let _op = self.begin_op()?;
        let mut state = self.state.lock().await;
        self.do_write(&mut state, offset, buf).await
    }

    /// Find the first populated run within `[offset, offset + len)`. Returns `(start, avail)`
    /// where `start` is the absolute offset of the run and `avail` its length clipped to the
    /// queried range; `avail` is 0 when the whole range is a hole. Consults only bitmap and
    /// extent bookkeeping, never payload bytes.
    pub async fn get_available_range(&self, offset: u64, len: u64) -> Result<(u64, u64)> {
        let _op = self.begin_op()?;
        let mut state = self.state.lock().await;
        self.do_get_available_range(&mut state, offset, len).await
    }

    /// Request cancellation of the in-flight operation. The currently dispatched child
    /// completes; no further children are touched. No-op when idle.
    pub fn cancel(&self) {
        self.abort.store(true, Ordering::Release);
    }

    /// Resolve once no operation is in flight. Returns immediately when idle.
    pub async fn ready_to_use(&self) -> Result<()> {
        loop {
            if !self.busy.load(Ordering::Acquire) {
                return Ok(());
            }
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.busy.load(Ordering::Acquire) {
                return Ok(());
            }
            notified.await;
        }
    }

    /// Remove every child entry recorded in `entry`'s children map and truncate its sparse
    /// metadata. Used when the whole sparse entry is discarded. A non-sparse entry is left
    /// untouched.
    pub async fn delete_children(backend: &dyn CacheBackend, entry: &dyn CacheEntry) -> Result<()> {
        let meta_size = entry.get_data_size(META_STREAM);
        if meta_size < SPARSE_DATA_FIXED_SIZE {
            return Ok(());
        }
        let mut buf = alloc_buf(meta_size);
        let count = entry.read_data(META_STREAM, 0, &mut buf).await?;
        if count != meta_size {
            return Err(einval!("short read of sparse metadata"));
        }
        let data = match SparseData::decode(&buf) {
            Ok(data) if data.header.magic == SPARSE_MAGIC => data,
            _ => return Ok(()),
        };

        let num_bits = data.bitmap.num_bits();
        let mut index = 0;
        while let Some(i) = data.bitmap.find_next_bit(index, num_bits, true) {
            backend.doom_entry(&child_key(entry.key(), i as u32)).await?;
            index = i + 1;
        }
        entry.write_data(META_STREAM, 0, &[], true).await?;

        Ok(())
    }

    fn begin_op(&self) -> Result<OpGuard<'_>> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ealready!(format!(
                "sparse entry {} already has an operation in flight",
                self.entry.key()
            )));
        }
        self.abort.store(false, Ordering::Release);

        Ok(OpGuard(self))
    }

    fn aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    /// Validate a logical range and return its exclusive end.
    fn range_end(&self, offset: u64, len: u64) -> Result<u64> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| einval!("sparse range overflows"))?;
        if end > 0 && (end - 1) / self.config.child_size as u64 > MAX_CHILD_INDEX {
            return Err(einval!(format!(
                "sparse range [{}, {}) exceeds the maximum entry size",
                offset, end
            )));
        }
        Ok(end)
    }

    async fn do_read(&self, state: &mut SparseState, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.range_end(offset, buf.len() as u64)?;
        let child_size = self.config.child_size as u64;
        let mut done = 0;

        while done < buf.len() {
            if self.aborted() {
                trace!("sparse read on {} cancelled at {}", self.entry.key(), done);
                break;
            }
            let pos = offset + done as u64;
            let index = (pos / child_size) as u32;
            let child_offset = (pos % child_size) as u32;

            let child = match self.open_child(state, index).await? {
                Some(c) => c,
                None => break,
            };
            let (start, avail) = child.available_from(child_offset);
            if start != child_offset || avail == 0 {
                break;
            }
            let want = (buf.len() - done).min(avail as usize);
            let count = child
                .entry
                .read_data(DATA_STREAM, child_offset as usize, &mut buf[done..done + want])
                .await?;
            done += count;
            if count < want {
                break;
            }
        }

        Ok(done)
    }

    async fn do_write(&self, state: &mut SparseState, offset: u64, buf: &[u8]) -> Result<usize> {
        self.range_end(offset, buf.len() as u64)?;
        let child_size = self.config.child_size as u64;
        let mut done = 0;

        while done < buf.len() {
            if self.aborted() {
                trace!("sparse write on {} cancelled at {}", self.entry.key(), done);
                break;
            }
            let pos = offset + done as u64;
            let index = (pos / child_size) as u32;
            let child_offset = (pos % child_size) as u32;
            let want = (buf.len() - done).min((child_size - child_offset as u64) as usize);

            let mut child = match self.open_child(state, index).await? {
                Some(c) => c,
                None => self.create_child(state, index).await?,
            };
            let count = child
                .entry
                .write_data(
                    DATA_STREAM,
                    child_offset as usize,
                    &buf[done..done + want],
                    false,
                )
                .await?;
            child.update_range(child_offset, count as u32);
            self.write_child_meta(&child).await?;
            done += count;
            state.logical_len = state.logical_len.max(pos + count as u64);
            if count < want {
                bail_eio!(
                    "short write to child {} of {}: {} out of {} bytes",
                    child.index,
                    self.entry.key(),
                    count,
                    want
                );
            }
        }

        Ok(done)
    }

    async fn do_get_available_range(
        &self,
        state: &mut SparseState,
        offset: u64,
        len: u64,
    ) -> Result<(u64, u64)> {
        let end = self.range_end(offset, len)?;
        let child_size = self.config.child_size as u64;
        let mut pos = offset;
        let mut found: Option<u64> = None;
        let mut run_end = 0u64;

        while pos < end {
            if self.aborted() {
                break;
            }
            let index = (pos / child_size) as u32;
            if index as usize >= state.data.bitmap.num_bits() {
                break;
            }
            let child_offset = (pos % child_size) as u32;

            let child = match self.open_child(state, index).await? {
                Some(c) => c,
                None => {
                    if found.is_some() {
                        break;
                    }
                    pos = (index as u64 + 1) * child_size;
                    continue;
                }
            };
            let (start, avail) = child.available_from(child_offset);
            if avail == 0 {
                if found.is_some() {
                    break;
                }
                pos = (index as u64 + 1) * child_size;
                continue;
            }
            let abs_start = index as u64 * child_size + start as u64;
            if abs_start >= end {
                break;
            }
            if found.is_some() && abs_start != pos {
                break;
            }
            if found.is_none() {
                found = Some(abs_start);
            }
            run_end = abs_start + avail as u64;
            if run_end < (index as u64 + 1) * child_size {
                // the run ends inside this child, no way to continue past the gap
                break;
            }
            pos = run_end;
        }

        match found {
            Some(start) => Ok((start, run_end.min(end) - start)),
            None => Ok((offset, 0)),
        }
    }

    /// Recompute the logical length from the highest surviving child. Corrupt or vanished
    /// children encountered on the way are healed as in normal operation.
    async fn recover_logical_len(&self, state: &mut SparseState) -> Result<()> {
        loop {
            let index = match state.data.bitmap.find_last_set() {
                Some(i) => i as u32,
                None => {
                    state.logical_len = 0;
                    return Ok(());
                }
            };
            if let Some(child) = self.open_child(state, index).await? {
                state.logical_len =
                    index as u64 * self.config.child_size as u64 + child.data_len() as u64;
                return Ok(());
            }
            // open_child cleared the child's bit, try the next lower one
        }
    }

    /// Open and verify child `index`. `Ok(None)` means the child is absent, either because it
    /// was never created or because it failed verification and was doomed.
    async fn open_child(&self, state: &mut SparseState, index: u32) -> Result<Option<ChildState>> {
        if !state.data.bitmap.get(index as usize) {
            return Ok(None);
        }

        let key = child_key(self.entry.key(), index);
        let entry = match self.backend.open_entry(&key).await {
            Ok(e) => e,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("child entry {} vanished, clearing its children-map bit", key);
                state.data.bitmap.set(index as usize, false);
                self.write_parent_meta(state).await?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let expected = SparseData::encoded_size(self.config.blocks_per_child() as usize);
        let meta_size = entry.get_data_size(META_STREAM);
        if meta_size != expected {
            return self.kill_child(state, index, &key).await.map(|_| None);
        }
        let mut buf = alloc_buf(meta_size);
        let count = entry.read_data(META_STREAM, 0, &mut buf).await?;
        if count != meta_size {
            return self.kill_child(state, index, &key).await.map(|_| None);
        }

        match ChildState::from_meta(index, entry, &buf, &self.config, &state.data.header) {
            Some(child) => Ok(Some(child)),
            None => self.kill_child(state, index, &key).await.map(|_| None),
        }
    }

    /// Create child `index`, set its children-map bit and persist the parent record.
    async fn create_child(&self, state: &mut SparseState, index: u32) -> Result<ChildState> {
        let key = child_key(self.entry.key(), index);
        let entry = match self.backend.create_entry(&key).await {
            Ok(e) => e,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                // leftover whose children-map bit was lost; replace it
                warn!("replacing stale child entry {}", key);
                self.backend.doom_entry(&key).await?;
                self.backend.create_entry(&key).await?
            }
            Err(e) => return Err(e),
        };

        let child = ChildState::new(index, entry, &self.config, &state.data.header);
        self.write_child_meta(&child).await?;

        if index as usize >= state.data.bitmap.num_bits() {
            let bits = div_round_up(index as u64 + 1, CHILDREN_MAP_GROWTH) * CHILDREN_MAP_GROWTH;
            state.data.bitmap.resize(bits as usize);
        }
        state.data.bitmap.set(index as usize, true);
        self.write_parent_meta(state).await?;

        Ok(child)
    }

    /// Doom a child that failed verification, clear its bit and persist the parent record.
    async fn kill_child(&self, state: &mut SparseState, index: u32, key: &str) -> Result<()> {
        warn!(
            "dooming corrupt child entry {} of sparse entry {}",
            key,
            self.entry.key()
        );
        self.backend.doom_entry(key).await?;
        state.data.bitmap.set(index as usize, false);
        self.write_parent_meta(state).await
    }

    async fn write_parent_meta(&self, state: &SparseState) -> Result<()> {
        self.entry
            .write_data(META_STREAM, 0, &state.data.encode(), true)
            .await
            .map(|_| ())
    }

    async fn write_child_meta(&self, child: &ChildState) -> Result<()> {
        trace!(
            "persisting metadata of child {} of {}",
            child.index,
            self.entry.key()
        );
        child
            .entry
            .write_data(META_STREAM, 0, &child.data.encode(), true)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemBackend;

    async fn new_control(key: &str) -> (Arc<MemBackend>, SparseControl) {
        let backend = Arc::new(MemBackend::new());
        let entry = backend.create_entry(key).await.unwrap();
        let ctrl = SparseControl::new(
            backend.clone(),
            entry,
            SparseCacheConfig::default(),
        )
        .await
        .unwrap();
        (backend, ctrl)
    }

    #[tokio::test]
    async fn test_init_creates_layout() {
        let (backend, _ctrl) = new_control("entry1").await;
        let entry = backend.open_entry("entry1").await.unwrap();
        assert!(SparseControl::could_be_sparse(entry.as_ref()));
        assert!(entry.get_data_size(META_STREAM) >= SPARSE_DATA_FIXED_SIZE);
    }

    #[tokio::test]
    async fn test_init_rejects_regular_entry() {
        let backend = Arc::new(MemBackend::new());
        let entry = backend.create_entry("entry1").await.unwrap();
        entry
            .write_data(DATA_STREAM, 0, b"payload", false)
            .await
            .unwrap();
        assert!(!SparseControl::could_be_sparse(entry.as_ref()));
        assert!(
            SparseControl::new(backend, entry, SparseCacheConfig::default())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_init_rejects_corrupt_magic() {
        let backend = Arc::new(MemBackend::new());
        {
            let entry = backend.create_entry("entry1").await.unwrap();
            SparseControl::new(backend.clone(), entry, SparseCacheConfig::default())
                .await
                .unwrap();
        }

        let entry = backend.open_entry("entry1").await.unwrap();
        entry
            .write_data(META_STREAM, 8, &[0xde, 0xad, 0xbe, 0xef], false)
            .await
            .unwrap();
        let err = SparseControl::new(backend, entry, SparseCacheConfig::default())
            .await
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }

    #[tokio::test]
    async fn test_reopen_preserves_state() {
        let backend = Arc::new(MemBackend::new());
        {
            let entry = backend.create_entry("entry1").await.unwrap();
            let ctrl = SparseControl::new(backend.clone(), entry, SparseCacheConfig::default())
                .await
                .unwrap();
            ctrl.write(100000, &[0xcd; 4096]).await.unwrap();
            assert_eq!(ctrl.len().await, 104096);
        }

        let entry = backend.open_entry("entry1").await.unwrap();
        let ctrl = SparseControl::new(backend, entry, SparseCacheConfig::default())
            .await
            .unwrap();
        assert_eq!(ctrl.len().await, 104096);
        let mut buf = [0u8; 4096];
        assert_eq!(ctrl.read(100000, &mut buf).await.unwrap(), 4096);
        assert!(buf.iter().all(|b| *b == 0xcd));
    }

    const DEFAULT_CHILD_SIZE_U64: u64 = crate::DEFAULT_CHILD_SIZE as u64;

    #[tokio::test]
    async fn test_range_validation() {
        let (_backend, ctrl) = new_control("entry1").await;
        let mut buf = [0u8; 4];
        ctrl.read(u64::MAX - 1, &mut buf).await.unwrap_err();
        let err = ctrl
            .write((MAX_CHILD_INDEX + 1) * DEFAULT_CHILD_SIZE_U64, &buf)
            .await
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }

    #[tokio::test]
    async fn test_zero_length_ops() {
        let (backend, ctrl) = new_control("entry1").await;
        assert_eq!(ctrl.write(4096, &[]).await.unwrap(), 0);
        // an empty write creates no children and does not extend the entry
        assert_eq!(ctrl.len().await, 0);
        assert_eq!(backend.entry_count(), 1);

        let mut buf = [0u8; 0];
        assert_eq!(ctrl.read(0, &mut buf).await.unwrap(), 0);
        assert_eq!(ctrl.get_available_range(4096, 0).await.unwrap(), (4096, 0));
    }

    #[tokio::test]
    async fn test_ready_to_use_idle() {
        let (_backend, ctrl) = new_control("entry1").await;
        ctrl.ready_to_use().await.unwrap();
        // cancel when idle is a no-op for the next operation
        ctrl.cancel();
        assert_eq!(ctrl.write(0, &[1u8; 100]).await.unwrap(), 100);
    }
}
