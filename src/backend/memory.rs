// Copyright 2026 The SparseCache Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! An in-memory implementation of the cache backend contract.

use std::collections::HashMap;
use std::io::Result;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{CacheBackend, CacheEntry, STREAM_COUNT};

/// A cache entry whose streams live in plain byte vectors.
pub struct MemEntry {
    key: String,
    streams: Mutex<[Vec<u8>; STREAM_COUNT]>,
}

impl MemEntry {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            streams: Mutex::new(Default::default()),
        }
    }

    fn validate_stream(&self, stream: u32) -> Result<usize> {
        let stream = stream as usize;
        if stream >= STREAM_COUNT {
            return Err(einval!(format!("invalid entry stream index {}", stream)));
        }
        Ok(stream)
    }
}

#[async_trait]
impl CacheEntry for MemEntry {
    fn key(&self) -> &str {
        &self.key
    }

    fn get_data_size(&self, stream: u32) -> usize {
        let streams = self.streams.lock().unwrap();
        match self.validate_stream(stream) {
            Ok(s) => streams[s].len(),
            Err(_) => 0,
        }
    }

    async fn read_data(&self, stream: u32, offset: usize, buf: &mut [u8]) -> Result<usize> {
        let stream = self.validate_stream(stream)?;
        let streams = self.streams.lock().unwrap();
        let data = &streams[stream];
        if offset >= data.len() {
            return Ok(0);
        }
        let count = buf.len().min(data.len() - offset);
        buf[..count].copy_from_slice(&data[offset..offset + count]);

        Ok(count)
    }

    async fn write_data(
        &self,
        stream: u32,
        offset: usize,
        buf: &[u8],
        truncate: bool,
    ) -> Result<usize> {
        let stream = self.validate_stream(stream)?;
        let mut streams = self.streams.lock().unwrap();
        let data = &mut streams[stream];
        let end = offset
            .checked_add(buf.len())
            .ok_or_else(|| einval!("entry write range overflows"))?;
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        if truncate {
            data.truncate(end);
        }

        Ok(buf.len())
    }
}

/// An entry store backed by a map of byte vectors, used for tests and embedders that handle
/// persistence on their own.
#[derive(Default)]
pub struct MemBackend {
    entries: Mutex<HashMap<String, Arc<MemEntry>>>,
}

impl MemBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn entry_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether an entry with `key` exists.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }
}

#[async_trait]
impl CacheBackend for MemBackend {
    async fn open_entry(&self, key: &str) -> Result<Arc<dyn CacheEntry>> {
        let entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(e) => Ok(e.clone() as Arc<dyn CacheEntry>),
            None => Err(enoent!(format!("no cache entry with key {}", key))),
        }
    }

    async fn create_entry(&self, key: &str) -> Result<Arc<dyn CacheEntry>> {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(key) {
            return Err(eexist!(format!("cache entry {} already exists", key)));
        }
        let entry = Arc::new(MemEntry::new(key));
        entries.insert(key.to_string(), entry.clone());

        Ok(entry as Arc<dyn CacheEntry>)
    }

    async fn doom_entry(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}
