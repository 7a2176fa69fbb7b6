//! Hash index: maps a bounded-length key to a record slot
//!
//! `HashIndex` is the contract the store composes against. `MmapHashIndex`
//! is the persistent implementation: separate chaining over a mapped file,
//! with one node per record slot. Node `i` holds the key bound to slot `i`,
//! so reverse lookup (slot → key) is a single read.
//!
//! Bucket choice is `crc32c(key) % bucket_count`, stable across processes
//! and restarts.

use std::path::Path;

use hashbrown::HashSet;

use crate::error::{Field, SlotError, SlotResult};
use crate::format::{
    read_i32, read_u16, read_u32, write_i32, write_u16, write_u32, IndexHeader, HEADER_SIZE,
    IDX_OFF_ENTRY_COUNT, NIL, NODE_OFF_KEY, NODE_OFF_KEY_LEN, NODE_OFF_NEXT, NODE_OFF_USED,
};
use crate::mapping::{read_prefix, MappedFile};

/// Occupancy and chain-shape figures of one index.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct IndexStats {
    /// Keys currently bound
    pub entries: u32,
    /// Number of chain heads
    pub bucket_count: u32,
    /// Buckets with at least one key
    pub used_buckets: u32,
    /// Longest chain
    pub max_chain_len: u32,
    /// Mean chain length over used buckets
    pub avg_chain_len: f64,
}

impl IndexStats {
    /// Fraction of buckets holding at least one key.
    pub fn utilization(&self) -> f64 {
        if self.bucket_count == 0 {
            return 0.0;
        }
        self.used_buckets as f64 / self.bucket_count as f64
    }
}

/// Key → slot index consumed by the store.
pub trait HashIndex: Send + Sync {
    /// Which key field this index serves.
    fn field(&self) -> Field;

    /// Bind `key` to `slot`. Fails with `KeyExists` if `key` is already bound.
    fn insert(&mut self, key: &[u8], slot: u32) -> SlotResult<()>;

    fn get(&self, key: &[u8]) -> Option<u32>;

    /// Unbind `key`, returning the slot it pointed at.
    fn remove(&mut self, key: &[u8]) -> SlotResult<u32>;

    /// Reverse lookup: the key currently bound to `slot`.
    fn find_key_by_slot(&self, slot: u32) -> Option<Vec<u8>>;

    fn clear(&mut self);

    fn len(&self) -> u32;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn stats(&self) -> IndexStats;

    /// Structural check of the persisted index.
    fn validate_integrity(&self) -> bool;

    fn flush(&self) -> SlotResult<()>;
}

/// Persistent chained hash index over a mapped file.
pub struct MmapHashIndex {
    file: MappedFile,
    field: Field,
    geometry: IndexHeader,
    node_size: usize,
    nodes_offset: usize,
}

impl MmapHashIndex {
    /// Open or create the index file at `path` for `capacity` record slots.
    ///
    /// An existing file must have been created with the same geometry.
    pub fn open(
        path: &Path,
        field: Field,
        bucket_count: u32,
        capacity: u32,
        field_len: u32,
    ) -> SlotResult<Self> {
        let wanted = IndexHeader { bucket_count, capacity, field_len, entry_count: 0 };

        match read_prefix(path, HEADER_SIZE)? {
            Some(buf) if IndexHeader::is_formatted(&buf) => {
                let found = IndexHeader::decode(&buf).map_err(|(offset, reason)| {
                    SlotError::Corrupted { path: path.to_path_buf(), offset, reason }
                })?;
                let checks = [
                    ("hash_bucket_count", found.bucket_count, bucket_count),
                    ("max_record_count", found.capacity, capacity),
                    ("field_len", found.field_len, field_len),
                ];
                if let Some((name, persisted, configured)) = checks.into_iter().find(|(_, a, b)| a != b) {
                    return Err(SlotError::HeaderMismatch {
                        path: path.to_path_buf(),
                        field: name,
                        persisted: persisted as u64,
                        configured: configured as u64,
                    });
                }
                let file = MappedFile::open(path, wanted.file_size())?;
                tracing::debug!(path = %path.display(), %field, entries = found.entry_count, "reopened index");
                Ok(Self::from_parts(file, field, wanted))
            }
            _ => Self::create(path, field, bucket_count, capacity, field_len),
        }
    }

    /// Create the index file at `path` empty, resizing and reformatting
    /// whatever file was there before regardless of its geometry.
    pub fn create(
        path: &Path,
        field: Field,
        bucket_count: u32,
        capacity: u32,
        field_len: u32,
    ) -> SlotResult<Self> {
        let geometry = IndexHeader { bucket_count, capacity, field_len, entry_count: 0 };
        let file = MappedFile::create(path, geometry.file_size())?;
        let mut index = Self::from_parts(file, field, geometry);
        index.format();
        tracing::info!(path = %path.display(), %field, bucket_count, capacity, "created index");
        Ok(index)
    }

    fn from_parts(file: MappedFile, field: Field, geometry: IndexHeader) -> Self {
        Self {
            node_size: IndexHeader::node_size(geometry.field_len),
            nodes_offset: geometry.nodes_offset(),
            file,
            field,
            geometry,
        }
    }

    fn format(&mut self) {
        let header = IndexHeader { entry_count: 0, ..self.geometry };
        self.file.bytes_mut()[..HEADER_SIZE].copy_from_slice(&header.encode());
        for bucket in 0..self.geometry.bucket_count {
            self.set_head(bucket, NIL);
        }
        for slot in 0..self.geometry.capacity {
            let off = self.node_offset(slot);
            let buf = self.file.bytes_mut();
            buf[off + NODE_OFF_USED] = 0;
            write_i32(buf, off + NODE_OFF_NEXT, NIL);
        }
    }

    #[inline]
    fn bucket_of(&self, key: &[u8]) -> u32 {
        crc32c::crc32c(key) % self.geometry.bucket_count
    }

    #[inline]
    fn head_offset(bucket: u32) -> usize {
        HEADER_SIZE + bucket as usize * 4
    }

    fn head(&self, bucket: u32) -> i32 {
        read_i32(self.file.bytes(), Self::head_offset(bucket))
    }

    fn set_head(&mut self, bucket: u32, slot: i32) {
        write_i32(self.file.bytes_mut(), Self::head_offset(bucket), slot);
    }

    #[inline]
    fn node_offset(&self, slot: u32) -> usize {
        self.nodes_offset + slot as usize * self.node_size
    }

    #[inline]
    fn in_bounds(&self, link: i32) -> bool {
        link >= 0 && (link as u32) < self.geometry.capacity
    }

    fn node_used(&self, slot: u32) -> bool {
        self.file.bytes()[self.node_offset(slot) + NODE_OFF_USED] != 0
    }

    fn node_next(&self, slot: u32) -> i32 {
        read_i32(self.file.bytes(), self.node_offset(slot) + NODE_OFF_NEXT)
    }

    fn set_node_next(&mut self, slot: u32, next: i32) {
        let off = self.node_offset(slot) + NODE_OFF_NEXT;
        write_i32(self.file.bytes_mut(), off, next);
    }

    fn node_key(&self, slot: u32) -> &[u8] {
        let off = self.node_offset(slot);
        let buf = self.file.bytes();
        let len = (read_u16(buf, off + NODE_OFF_KEY_LEN) as usize).min(self.geometry.field_len as usize);
        &buf[off + NODE_OFF_KEY..off + NODE_OFF_KEY + len]
    }

    fn set_entry_count(&mut self, count: u32) {
        write_u32(self.file.bytes_mut(), IDX_OFF_ENTRY_COUNT, count);
    }

    fn key_fits(&self, key: &[u8]) -> bool {
        !key.is_empty() && key.len() < self.geometry.field_len as usize
    }

    /// Detach `slot` from the chain of `bucket` and mark its node unused.
    fn unlink(&mut self, bucket: u32, slot: u32) {
        let mut prev = NIL;
        let mut cursor = self.head(bucket);
        let mut steps = 0u32;

        while cursor != NIL && self.in_bounds(cursor) && steps <= self.geometry.capacity {
            if cursor as u32 == slot {
                let next = self.node_next(slot);
                if prev == NIL {
                    self.set_head(bucket, next);
                } else {
                    self.set_node_next(prev as u32, next);
                }
                break;
            }
            prev = cursor;
            cursor = self.node_next(cursor as u32);
            steps += 1;
        }

        let off = self.node_offset(slot);
        self.file.bytes_mut()[off + NODE_OFF_USED] = 0;
        self.set_node_next(slot, NIL);
        let count = self.len().saturating_sub(1);
        self.set_entry_count(count);
    }

    fn check(&self) -> Result<(), String> {
        let header = IndexHeader::decode(&self.file.bytes()[..HEADER_SIZE]).map_err(|(_, r)| r)?;
        let persisted = IndexHeader { entry_count: 0, ..header };
        if persisted != self.geometry {
            return Err("header geometry changed under the mapping".into());
        }

        let capacity = self.geometry.capacity;
        let mut visited = vec![false; capacity as usize];
        let mut keys: HashSet<&[u8]> = HashSet::new();
        let mut reached = 0u32;

        for bucket in 0..self.geometry.bucket_count {
            let mut cursor = self.head(bucket);
            while cursor != NIL {
                if !self.in_bounds(cursor) {
                    return Err(format!("bucket {} links to out-of-range node {}", bucket, cursor));
                }
                let slot = cursor as u32;
                if visited[slot as usize] {
                    return Err(format!("node {} reached twice (cycle or shared tail)", slot));
                }
                visited[slot as usize] = true;
                if !self.node_used(slot) {
                    return Err(format!("unused node {} linked from bucket {}", slot, bucket));
                }
                let key = self.node_key(slot);
                if !self.key_fits(key) {
                    return Err(format!("node {} has invalid key length {}", slot, key.len()));
                }
                if self.bucket_of(key) != bucket {
                    return Err(format!("node {} is chained in the wrong bucket {}", slot, bucket));
                }
                if !keys.insert(key) {
                    return Err(format!("duplicate key at node {}", slot));
                }
                reached += 1;
                cursor = self.node_next(slot);
            }
        }

        let used = (0..capacity).filter(|&s| self.node_used(s)).count() as u32;
        if reached != header.entry_count || used != header.entry_count {
            return Err(format!(
                "header counts {} entries, {} reachable, {} nodes in use",
                header.entry_count, reached, used
            ));
        }
        Ok(())
    }
}

impl HashIndex for MmapHashIndex {
    fn field(&self) -> Field {
        self.field
    }

    fn insert(&mut self, key: &[u8], slot: u32) -> SlotResult<()> {
        if !self.key_fits(key) {
            return Err(SlotError::invalid(format!(
                "{} key length {} outside [1, {})", self.field, key.len(), self.geometry.field_len
            )));
        }
        if slot >= self.geometry.capacity {
            return Err(SlotError::invalid(format!(
                "slot {} out of range [0, {})", slot, self.geometry.capacity
            )));
        }
        if self.get(key).is_some() {
            return Err(SlotError::KeyExists { field: self.field, key: key.to_vec() });
        }

        if self.node_used(slot) {
            // A binding survived the deletion of its record; the slot is
            // being reused, so that binding is dangling.
            let stale = self.node_key(slot).to_vec();
            tracing::warn!(
                field = %self.field,
                slot,
                key = %String::from_utf8_lossy(&stale),
                "dropping stale binding for reused slot"
            );
            let bucket = self.bucket_of(&stale);
            self.unlink(bucket, slot);
        }

        let bucket = self.bucket_of(key);
        let head = self.head(bucket);
        let off = self.node_offset(slot);
        let field_len = self.geometry.field_len as usize;
        let buf = self.file.bytes_mut();
        buf[off + NODE_OFF_USED] = 1;
        write_u16(buf, off + NODE_OFF_KEY_LEN, key.len() as u16);
        write_i32(buf, off + NODE_OFF_NEXT, head);
        let key_area = &mut buf[off + NODE_OFF_KEY..off + NODE_OFF_KEY + field_len];
        key_area.fill(0);
        key_area[..key.len()].copy_from_slice(key);

        self.set_head(bucket, slot as i32);
        let count = self.len() + 1;
        self.set_entry_count(count);
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Option<u32> {
        if !self.key_fits(key) {
            return None;
        }
        let mut cursor = self.head(self.bucket_of(key));
        let mut steps = 0u32;
        while cursor != NIL && self.in_bounds(cursor) && steps <= self.geometry.capacity {
            let slot = cursor as u32;
            if self.node_key(slot) == key {
                return Some(slot);
            }
            cursor = self.node_next(slot);
            steps += 1;
        }
        None
    }

    fn remove(&mut self, key: &[u8]) -> SlotResult<u32> {
        let slot = self.get(key).ok_or_else(|| SlotError::KeyNotFound {
            field: self.field,
            key: key.to_vec(),
        })?;
        let bucket = self.bucket_of(key);
        self.unlink(bucket, slot);
        Ok(slot)
    }

    fn find_key_by_slot(&self, slot: u32) -> Option<Vec<u8>> {
        if slot >= self.geometry.capacity || !self.node_used(slot) {
            return None;
        }
        Some(self.node_key(slot).to_vec())
    }

    fn clear(&mut self) {
        self.format();
        tracing::info!(path = %self.file.path().display(), field = %self.field, "cleared index");
    }

    fn len(&self) -> u32 {
        read_u32(self.file.bytes(), IDX_OFF_ENTRY_COUNT)
    }

    fn stats(&self) -> IndexStats {
        let mut used_buckets = 0u32;
        let mut max_chain_len = 0u32;
        let mut chained = 0u64;

        for bucket in 0..self.geometry.bucket_count {
            let mut len = 0u32;
            let mut cursor = self.head(bucket);
            while cursor != NIL && self.in_bounds(cursor) && len <= self.geometry.capacity {
                len += 1;
                cursor = self.node_next(cursor as u32);
            }
            if len > 0 {
                used_buckets += 1;
                chained += len as u64;
                max_chain_len = max_chain_len.max(len);
            }
        }

        IndexStats {
            entries: self.len(),
            bucket_count: self.geometry.bucket_count,
            used_buckets,
            max_chain_len,
            avg_chain_len: if used_buckets == 0 { 0.0 } else { chained as f64 / used_buckets as f64 },
        }
    }

    fn validate_integrity(&self) -> bool {
        match self.check() {
            Ok(()) => true,
            Err(reason) => {
                tracing::warn!(path = %self.file.path().display(), field = %self.field, %reason, "index integrity check failed");
                false
            }
        }
    }

    fn flush(&self) -> SlotResult<()> {
        self.file.flush()
    }
}
