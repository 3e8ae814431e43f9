// Copyright 2026 The SparseCache Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! A file-backed implementation of the cache backend contract.
//!
//! Every entry stream maps to one file under the cache directory, named by the hex encoding of
//! the entry key plus a per-stream suffix, so arbitrary key bytes stay filesystem-safe and an
//! entry can always be reopened by deriving its file names again.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Result};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use super::{CacheBackend, CacheEntry, STREAM_COUNT};

/// File name suffixes per entry stream, `$hex_key.meta` and `$hex_key.data`.
const STREAM_SUFFIX: [&str; STREAM_COUNT] = ["meta", "data"];

/// A cache entry stored as one file per stream.
pub struct FileCacheEntry {
    key: String,
    files: [File; STREAM_COUNT],
}

impl FileCacheEntry {
    fn stream_file(&self, stream: u32) -> Result<&File> {
        self.files
            .get(stream as usize)
            .ok_or_else(|| einval!(format!("invalid entry stream index {}", stream)))
    }
}

#[async_trait]
impl CacheEntry for FileCacheEntry {
    fn key(&self) -> &str {
        &self.key
    }

    fn get_data_size(&self, stream: u32) -> usize {
        match self.stream_file(stream) {
            Ok(file) => file.metadata().map(|m| m.len() as usize).unwrap_or(0),
            Err(_) => 0,
        }
    }

    async fn read_data(&self, stream: u32, offset: usize, buf: &mut [u8]) -> Result<usize> {
        let file = self.stream_file(stream)?;
        let mut done = 0;
        while done < buf.len() {
            match file.read_at(&mut buf[done..], (offset + done) as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(done)
    }

    async fn write_data(
        &self,
        stream: u32,
        offset: usize,
        buf: &[u8],
        truncate: bool,
    ) -> Result<usize> {
        let file = self.stream_file(stream)?;
        file.write_all_at(buf, offset as u64)?;
        if truncate {
            file.set_len((offset + buf.len()) as u64)?;
        }

        Ok(buf.len())
    }
}

/// An entry store keeping each entry stream in its own file under a cache directory.
pub struct FileCacheBackend {
    work_dir: PathBuf,
}

impl FileCacheBackend {
    /// Create a backend rooted at `work_dir`, creating the directory when needed.
    pub fn new<P: AsRef<Path>>(work_dir: P) -> Result<Self> {
        std::fs::create_dir_all(work_dir.as_ref())?;
        Ok(Self {
            work_dir: work_dir.as_ref().to_path_buf(),
        })
    }

    fn stream_path(&self, key: &str, stream: usize) -> PathBuf {
        self.work_dir
            .join(format!("{}.{}", hex::encode(key), STREAM_SUFFIX[stream]))
    }

    fn open_files(&self, key: &str, create: bool) -> Result<[File; STREAM_COUNT]> {
        let meta = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(self.stream_path(key, 0))?;
        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(self.stream_path(key, 1))?;

        Ok([meta, data])
    }
}

#[async_trait]
impl CacheBackend for FileCacheBackend {
    async fn open_entry(&self, key: &str) -> Result<Arc<dyn CacheEntry>> {
        let files = self.open_files(key, false).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                enoent!(format!("no cache entry with key {}", key))
            } else {
                e
            }
        })?;

        Ok(Arc::new(FileCacheEntry {
            key: key.to_string(),
            files,
        }))
    }

    async fn create_entry(&self, key: &str) -> Result<Arc<dyn CacheEntry>> {
        if self.stream_path(key, 0).exists() {
            return Err(eexist!(format!("cache entry {} already exists", key)));
        }
        let files = self.open_files(key, true)?;

        Ok(Arc::new(FileCacheEntry {
            key: key.to_string(),
            files,
        }))
    }

    async fn doom_entry(&self, key: &str) -> Result<()> {
        for stream in 0..STREAM_COUNT {
            match std::fs::remove_file(self.stream_path(key, stream)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }
}
