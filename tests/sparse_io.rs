// Copyright 2026 The SparseCache Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests of the sparse engine against the in-memory and file backends.

use std::io::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use vmm_sys_util::tempdir::TempDir;

use sparse_cache::backend::{
    CacheBackend, CacheEntry, FileCacheBackend, MemBackend, DATA_STREAM, META_STREAM,
};
use sparse_cache::{SparseCacheConfig, SparseControl};

/// Small children keep multi-child scenarios cheap.
fn small_config() -> SparseCacheConfig {
    SparseCacheConfig {
        block_size: 1024,
        child_size: 65536,
    }
}

async fn new_sparse(
    backend: &Arc<MemBackend>,
    key: &str,
    config: SparseCacheConfig,
) -> SparseControl {
    let entry = backend.create_entry(key).await.unwrap();
    SparseControl::new(backend.clone(), entry, config)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_roundtrip_aligned() {
    let backend = Arc::new(MemBackend::new());
    let ctrl = new_sparse(&backend, "entry1", small_config()).await;

    let data = vec![0xabu8; 8192];
    assert_eq!(ctrl.write(4096, &data).await.unwrap(), 8192);
    assert_eq!(ctrl.len().await, 4096 + 8192);

    let mut buf = vec![0u8; 8192];
    assert_eq!(ctrl.read(4096, &mut buf).await.unwrap(), 8192);
    assert_eq!(buf, data);
}

#[tokio::test]
async fn test_roundtrip_unaligned() {
    let backend = Arc::new(MemBackend::new());
    let ctrl = new_sparse(&backend, "entry1", small_config()).await;

    // unaligned to both the block size and the child span
    let data: Vec<u8> = (0..70001u32).map(|i| i as u8).collect();
    assert_eq!(ctrl.write(333, &data).await.unwrap(), data.len());

    let mut buf = vec![0u8; data.len()];
    assert_eq!(ctrl.read(333, &mut buf).await.unwrap(), data.len());
    assert_eq!(buf, data);

    // a sub-range in the middle reads back too
    let mut buf = vec![0u8; 100];
    assert_eq!(ctrl.read(40000, &mut buf).await.unwrap(), 100);
    assert_eq!(buf, data[40000 - 333..40000 - 333 + 100]);
}

#[tokio::test]
async fn test_hole_semantics() {
    let backend = Arc::new(MemBackend::new());
    let ctrl = new_sparse(&backend, "entry1", small_config()).await;
    ctrl.write(0, &[0xab; 4096]).await.unwrap();

    // reading at a never-written offset is an immediate hole
    let mut buf = vec![0u8; 512];
    assert_eq!(ctrl.read(4096, &mut buf).await.unwrap(), 0);
    assert_eq!(ctrl.read(1 << 20, &mut buf).await.unwrap(), 0);

    // a read over a gap returns exactly the populated prefix
    let mut buf = vec![0u8; 8192];
    assert_eq!(ctrl.read(0, &mut buf).await.unwrap(), 4096);
    assert_eq!(ctrl.read(1024, &mut buf).await.unwrap(), 3072);
}

#[tokio::test]
async fn test_cross_child_write() {
    let backend = Arc::new(MemBackend::new());
    let config = small_config();
    let ctrl = new_sparse(&backend, "entry1", config).await;

    // spans children 0 and 1 with unaligned edges
    let data: Vec<u8> = (0..2000u32).map(|i| (i * 7) as u8).collect();
    assert_eq!(ctrl.write(65000, &data).await.unwrap(), 2000);
    assert!(backend.contains("range:entry1:00000000"));
    assert!(backend.contains("range:entry1:00000001"));

    let mut buf = vec![0u8; 2000];
    assert_eq!(ctrl.read(65000, &mut buf).await.unwrap(), 2000);
    assert_eq!(buf, data);

    assert_eq!(
        ctrl.get_available_range(65000, 2000).await.unwrap(),
        (65000, 2000)
    );

    // a write covering three children reads back as one region
    let data = vec![0x5au8; 3 * 65536];
    assert_eq!(ctrl.write(512, &data).await.unwrap(), data.len());
    let mut buf = vec![0u8; data.len()];
    assert_eq!(ctrl.read(512, &mut buf).await.unwrap(), data.len());
    assert_eq!(buf, data);
}

#[tokio::test]
async fn test_get_available_range() {
    let backend = Arc::new(MemBackend::new());
    let ctrl = new_sparse(&backend, "entry1", small_config()).await;
    ctrl.write(0, &[0xab; 4096]).await.unwrap();
    ctrl.write(100000, &[0xcd; 4096]).await.unwrap();

    assert_eq!(ctrl.get_available_range(0, 4096).await.unwrap(), (0, 4096));
    // clipped to the queried range
    assert_eq!(ctrl.get_available_range(0, 1000).await.unwrap(), (0, 1000));
    assert_eq!(
        ctrl.get_available_range(1000, 10000).await.unwrap(),
        (1000, 3096)
    );
    // leading holes are skipped up to the next populated run
    assert_eq!(
        ctrl.get_available_range(4096, 1 << 20).await.unwrap(),
        (100000, 4096)
    );
    // a pure hole reports zero available bytes
    assert_eq!(ctrl.get_available_range(4096, 95904).await.unwrap().1, 0);
    assert_eq!(
        ctrl.get_available_range(200000, 1 << 20).await.unwrap().1,
        0
    );

    // idempotent without intervening writes
    let first = ctrl.get_available_range(0, 1 << 20).await.unwrap();
    let second = ctrl.get_available_range(0, 1 << 20).await.unwrap();
    assert_eq!(first, second);
}

/// The write/read/availability scenario from the engine's original design discussion.
#[tokio::test]
async fn test_two_region_scenario() {
    let backend = Arc::new(MemBackend::new());
    let ctrl = new_sparse(&backend, "entry1", small_config()).await;

    ctrl.write(0, &[0xab; 4096]).await.unwrap();
    // lands in the second child
    ctrl.write(100000, &[0xcd; 4096]).await.unwrap();

    let mut buf = vec![0u8; 4096];
    assert_eq!(ctrl.read(0, &mut buf).await.unwrap(), 4096);
    assert!(buf.iter().all(|b| *b == 0xab));
    assert_eq!(ctrl.read(100000, &mut buf).await.unwrap(), 4096);
    assert!(buf.iter().all(|b| *b == 0xcd));

    assert_eq!(ctrl.get_available_range(4096, 95904).await.unwrap().1, 0);
}

#[tokio::test]
async fn test_corruption_isolation() {
    let backend = Arc::new(MemBackend::new());
    let ctrl = new_sparse(&backend, "entry1", small_config()).await;
    ctrl.write(0, &[0x11; 4096]).await.unwrap();
    ctrl.write(70000, &[0x22; 4096]).await.unwrap();

    // clobber the first child's magic number
    let child = backend.open_entry("range:entry1:00000000").await.unwrap();
    child
        .write_data(META_STREAM, 8, &[0, 0, 0, 0], false)
        .await
        .unwrap();

    // the corrupt child reads as a hole and gets doomed
    let mut buf = vec![0u8; 4096];
    assert_eq!(ctrl.read(0, &mut buf).await.unwrap(), 0);
    assert!(!backend.contains("range:entry1:00000000"));

    // its sibling is unaffected
    assert_eq!(ctrl.read(70000, &mut buf).await.unwrap(), 4096);
    assert!(buf.iter().all(|b| *b == 0x22));

    // the healed range can be written again
    assert_eq!(ctrl.write(0, &[0x33; 4096]).await.unwrap(), 4096);
    assert_eq!(ctrl.read(0, &mut buf).await.unwrap(), 4096);
    assert!(buf.iter().all(|b| *b == 0x33));
}

#[tokio::test]
async fn test_delete_children() {
    let backend = Arc::new(MemBackend::new());
    let entry = backend.create_entry("entry1").await.unwrap();
    let ctrl = SparseControl::new(backend.clone(), entry.clone(), small_config())
        .await
        .unwrap();
    ctrl.write(0, &vec![1u8; 3 * 65536]).await.unwrap();
    assert_eq!(backend.entry_count(), 4);

    SparseControl::delete_children(backend.as_ref(), entry.as_ref())
        .await
        .unwrap();
    assert_eq!(backend.entry_count(), 1);
    assert!(backend.contains("entry1"));
    assert!(!SparseControl::could_be_sparse(entry.as_ref()));
}

/// Test double pausing the first payload read of a chosen entry until released.
struct Gate {
    target: String,
    armed: AtomicBool,
    entered: Semaphore,
    release: Semaphore,
}

impl Gate {
    fn new(target: &str) -> Arc<Self> {
        Arc::new(Self {
            target: target.to_string(),
            armed: AtomicBool::new(false),
            entered: Semaphore::new(0),
            release: Semaphore::new(0),
        })
    }

    async fn pause_point(&self, key: &str, stream: u32) {
        if stream == DATA_STREAM
            && key == self.target
            && self.armed.swap(false, Ordering::SeqCst)
        {
            self.entered.add_permits(1);
            let _permit = self.release.acquire().await.unwrap();
        }
    }
}

struct GateEntry {
    inner: Arc<dyn CacheEntry>,
    gate: Arc<Gate>,
}

#[async_trait]
impl CacheEntry for GateEntry {
    fn key(&self) -> &str {
        self.inner.key()
    }

    fn get_data_size(&self, stream: u32) -> usize {
        self.inner.get_data_size(stream)
    }

    async fn read_data(&self, stream: u32, offset: usize, buf: &mut [u8]) -> Result<usize> {
        self.gate.pause_point(self.inner.key(), stream).await;
        self.inner.read_data(stream, offset, buf).await
    }

    async fn write_data(
        &self,
        stream: u32,
        offset: usize,
        buf: &[u8],
        truncate: bool,
    ) -> Result<usize> {
        self.inner.write_data(stream, offset, buf, truncate).await
    }
}

struct GateBackend {
    inner: MemBackend,
    gate: Arc<Gate>,
}

#[async_trait]
impl CacheBackend for GateBackend {
    async fn open_entry(&self, key: &str) -> Result<Arc<dyn CacheEntry>> {
        let inner = self.inner.open_entry(key).await?;
        Ok(Arc::new(GateEntry {
            inner,
            gate: self.gate.clone(),
        }))
    }

    async fn create_entry(&self, key: &str) -> Result<Arc<dyn CacheEntry>> {
        let inner = self.inner.create_entry(key).await?;
        Ok(Arc::new(GateEntry {
            inner,
            gate: self.gate.clone(),
        }))
    }

    async fn doom_entry(&self, key: &str) -> Result<()> {
        self.inner.doom_entry(key).await
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancellation() {
    let gate = Gate::new("range:entry1:00000000");
    let backend = Arc::new(GateBackend {
        inner: MemBackend::new(),
        gate: gate.clone(),
    });
    let entry = backend.create_entry("entry1").await.unwrap();
    let ctrl = Arc::new(
        SparseControl::new(backend.clone(), entry, small_config())
            .await
            .unwrap(),
    );
    // three children worth of data
    ctrl.write(0, &vec![0x77u8; 3 * 65536]).await.unwrap();

    gate.armed.store(true, Ordering::SeqCst);
    let reader = ctrl.clone();
    let handle = tokio::spawn(async move {
        let mut buf = vec![0u8; 3 * 65536];
        reader.read(0, &mut buf).await
    });

    // wait until the first child's payload read is in flight
    let _entered = gate.entered.acquire().await.unwrap();

    // a second operation is rejected while one is pending
    let err = ctrl.write(0, &[0u8; 16]).await.unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EALREADY));

    // ready_to_use blocks while the read is pending
    tokio::time::timeout(Duration::from_millis(20), ctrl.ready_to_use())
        .await
        .unwrap_err();

    // cancel, then let the dispatched child complete
    ctrl.cancel();
    gate.release.add_permits(1);

    // only the first child was read; later children were never touched
    let done = handle.await.unwrap().unwrap();
    assert_eq!(done, 65536);

    ctrl.ready_to_use().await.unwrap();
    let mut buf = vec![0u8; 3 * 65536];
    assert_eq!(ctrl.read(0, &mut buf).await.unwrap(), buf.len());
    assert!(buf.iter().all(|b| *b == 0x77));
}

#[tokio::test]
async fn test_file_backend_end_to_end() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(FileCacheBackend::new(dir.as_path()).unwrap());

    let data: Vec<u8> = (0..100000u32).map(|i| (i * 3) as u8).collect();
    {
        let entry = backend.create_entry("entry1").await.unwrap();
        let ctrl = SparseControl::new(backend.clone(), entry, small_config())
            .await
            .unwrap();
        ctrl.write(1234, &data).await.unwrap();
    }

    // a new controller over the same files sees the persisted state
    let entry = backend.open_entry("entry1").await.unwrap();
    assert!(SparseControl::could_be_sparse(entry.as_ref()));
    let ctrl = SparseControl::new(backend.clone(), entry, small_config())
        .await
        .unwrap();
    assert_eq!(ctrl.len().await, 1234 + data.len() as u64);

    let mut buf = vec![0u8; data.len()];
    assert_eq!(ctrl.read(1234, &mut buf).await.unwrap(), data.len());
    assert_eq!(buf, data);
    assert_eq!(ctrl.read(0, &mut buf[..100]).await.unwrap(), 0);
}
