//! Record arena: fixed-size value slots inside one mapped file
//!
//! The free list is threaded through the slots themselves as `i32` links
//! (`-1` terminates) with its head in the file header. Links are indexes,
//! not pointers, so the list is valid in every process that maps the file
//! and survives restarts untouched.
//!
//! The arena does not lock. Callers mutate it only while holding the store's
//! write lock.

use std::path::Path;

use crate::config::ReopenPolicy;
use crate::error::{SlotError, SlotResult};
use crate::format::{
    read_i32, read_u32, write_i32, write_u32, Geometry, RecordsHeader, HEADER_SIZE, NIL,
    OFF_FIRST_FREE, OFF_RECORD_COUNT, SLOT_HEADER_SIZE, SLOT_OFF_LEN, SLOT_OFF_NEXT,
    SLOT_OFF_OCCUPIED,
};
use crate::mapping::{read_prefix, MappedFile};

/// Fixed-capacity slot allocator over the records file.
pub struct RecordArena {
    file: MappedFile,
    geometry: Geometry,
    entry_size: usize,
}

impl RecordArena {
    /// Open the records file at `path`, creating and formatting it when it
    /// is absent or all-zero. Returns the arena and whether it was created.
    pub fn open(path: &Path, configured: Geometry, policy: ReopenPolicy) -> SlotResult<(Self, bool)> {
        match read_prefix(path, HEADER_SIZE)? {
            Some(buf) if RecordsHeader::is_formatted(&buf) => {
                let header = RecordsHeader::decode(&buf).map_err(|(offset, reason)| {
                    SlotError::Corrupted { path: path.to_path_buf(), offset, reason }
                })?;
                let geometry = reconcile(path, header.geometry, configured, policy)?;
                let file = MappedFile::open(path, header.total_storage_size)?;

                tracing::info!(
                    path = %path.display(),
                    capacity = geometry.max_record_count,
                    live = header.record_count,
                    "reopened records file"
                );
                Ok((Self::from_parts(file, geometry), false))
            }
            _ => {
                let file = MappedFile::create(path, configured.total_storage_size())?;
                let mut arena = Self::from_parts(file, configured);
                arena.format();

                tracing::info!(
                    path = %path.display(),
                    capacity = configured.max_record_count,
                    record_size = configured.max_record_size,
                    bytes = configured.total_storage_size(),
                    "created records file"
                );
                Ok((arena, true))
            }
        }
    }

    fn from_parts(file: MappedFile, geometry: Geometry) -> Self {
        Self { entry_size: geometry.entry_size(), file, geometry }
    }

    /// Write a fresh header and chain every slot into the free list in
    /// ascending order.
    fn format(&mut self) {
        let header = RecordsHeader::new(self.geometry);
        self.file.bytes_mut()[..HEADER_SIZE].copy_from_slice(&header.encode());

        let capacity = self.geometry.max_record_count;
        for slot in 0..capacity {
            let next = if slot + 1 < capacity { (slot + 1) as i32 } else { NIL };
            let off = self.slot_offset(slot);
            let buf = self.file.bytes_mut();
            buf[off + SLOT_OFF_OCCUPIED] = 0;
            write_i32(buf, off + SLOT_OFF_NEXT, next);
            write_u32(buf, off + SLOT_OFF_LEN, 0);
        }
    }

    #[inline]
    fn slot_offset(&self, slot: u32) -> usize {
        HEADER_SIZE + slot as usize * self.entry_size
    }

    #[inline]
    fn in_bounds(&self, slot: u32) -> bool {
        slot < self.geometry.max_record_count
    }

    fn first_free(&self) -> i32 {
        read_i32(self.file.bytes(), OFF_FIRST_FREE)
    }

    fn set_first_free(&mut self, slot: i32) {
        write_i32(self.file.bytes_mut(), OFF_FIRST_FREE, slot);
    }

    fn set_used_count(&mut self, count: u32) {
        write_u32(self.file.bytes_mut(), OFF_RECORD_COUNT, count);
    }

    fn next_free(&self, slot: u32) -> i32 {
        read_i32(self.file.bytes(), self.slot_offset(slot) + SLOT_OFF_NEXT)
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn capacity(&self) -> u32 {
        self.geometry.max_record_count
    }

    /// Live record count, read from the shared header.
    pub fn used_count(&self) -> u32 {
        read_u32(self.file.bytes(), OFF_RECORD_COUNT)
    }

    pub fn free_count(&self) -> u32 {
        self.capacity().saturating_sub(self.used_count())
    }

    /// Pop the head of the free list and mark it occupied.
    ///
    /// Stale value bytes are left in place; the caller overwrites them.
    pub fn allocate(&mut self) -> SlotResult<u32> {
        let head = self.first_free();
        if head == NIL {
            return Err(SlotError::NoSpace { capacity: self.capacity() });
        }
        if head < 0 || !self.in_bounds(head as u32) {
            return Err(self.corrupted(OFF_FIRST_FREE, format!("free list head {} out of range", head)));
        }

        let slot = head as u32;
        let off = self.slot_offset(slot);
        if self.is_occupied(slot) {
            return Err(self.corrupted(off, format!("free list head {} is occupied", slot)));
        }

        let next = self.next_free(slot);
        let used = self.used_count();
        let buf = self.file.bytes_mut();
        buf[off + SLOT_OFF_OCCUPIED] = 1;
        write_i32(buf, off + SLOT_OFF_NEXT, NIL);
        write_u32(buf, off + SLOT_OFF_LEN, 0);
        self.set_first_free(next);
        self.set_used_count(used + 1);
        Ok(slot)
    }

    /// Return `slot` to the head of the free list.
    ///
    /// With `scrub` the value bytes are zeroed; otherwise they stay readable
    /// through positional access until the slot is reused.
    pub fn free(&mut self, slot: u32, scrub: bool) -> SlotResult<()> {
        if !self.in_bounds(slot) {
            return Err(SlotError::invalid(format!(
                "slot {} out of range [0, {})", slot, self.capacity()
            )));
        }
        if !self.is_occupied(slot) {
            return Err(SlotError::invalid(format!("slot {} is already free", slot)));
        }

        let off = self.slot_offset(slot);
        let head = self.first_free();
        let used = self.used_count();
        let value_len = self.geometry.max_record_size as usize;
        let buf = self.file.bytes_mut();
        buf[off + SLOT_OFF_OCCUPIED] = 0;
        write_i32(buf, off + SLOT_OFF_NEXT, head);
        if scrub {
            write_u32(buf, off + SLOT_OFF_LEN, 0);
            let start = off + SLOT_HEADER_SIZE;
            buf[start..start + value_len].fill(0);
        }
        self.set_first_free(slot as i32);
        self.set_used_count(used.saturating_sub(1));
        Ok(())
    }

    pub fn is_occupied(&self, slot: u32) -> bool {
        self.in_bounds(slot) && self.file.bytes()[self.slot_offset(slot) + SLOT_OFF_OCCUPIED] != 0
    }

    /// Value bytes of `slot` (its recorded length), or `None` out of range.
    pub fn get(&self, slot: u32) -> Option<&[u8]> {
        if !self.in_bounds(slot) {
            return None;
        }
        let off = self.slot_offset(slot);
        let buf = self.file.bytes();
        let len = (read_u32(buf, off + SLOT_OFF_LEN) as usize).min(self.geometry.max_record_size as usize);
        let start = off + SLOT_HEADER_SIZE;
        Some(&buf[start..start + len])
    }

    /// Writable view of the first `len` value bytes of `slot`, recording
    /// `len` as the slot's length.
    pub fn get_mut(&mut self, slot: u32, len: usize) -> Option<&mut [u8]> {
        if !self.in_bounds(slot) || len > self.geometry.max_record_size as usize {
            return None;
        }
        let off = self.slot_offset(slot);
        let buf = self.file.bytes_mut();
        write_u32(buf, off + SLOT_OFF_LEN, len as u32);
        let start = off + SLOT_HEADER_SIZE;
        Some(&mut buf[start..start + len])
    }

    /// Reset the header and rebuild the full free list. Invalidates every slot.
    pub fn clear(&mut self) {
        self.format();
        tracing::info!(path = %self.file.path().display(), "cleared records file");
    }

    /// Walk the free list and cross-check it against slot occupancy and the
    /// header counters.
    pub fn verify(&self) -> SlotResult<()> {
        let capacity = self.capacity();
        let mut on_free_list = vec![false; capacity as usize];
        let mut free_len = 0u32;
        let mut cursor = self.first_free();

        while cursor != NIL {
            if cursor < 0 || !self.in_bounds(cursor as u32) {
                return Err(self.corrupted(OFF_FIRST_FREE, format!("free list link {} out of range", cursor)));
            }
            let slot = cursor as u32;
            if on_free_list[slot as usize] {
                return Err(self.corrupted(self.slot_offset(slot), format!("free list cycle at slot {}", slot)));
            }
            if self.is_occupied(slot) {
                return Err(self.corrupted(self.slot_offset(slot), format!("occupied slot {} on free list", slot)));
            }
            on_free_list[slot as usize] = true;
            free_len += 1;
            cursor = self.next_free(slot);
        }

        let occupied = (0..capacity).filter(|&s| self.is_occupied(s)).count() as u32;
        if occupied != self.used_count() {
            return Err(self.corrupted(OFF_RECORD_COUNT, format!(
                "header counts {} live records, {} slots are occupied", self.used_count(), occupied
            )));
        }
        if free_len + occupied != capacity {
            return Err(self.corrupted(OFF_FIRST_FREE, format!(
                "{} free + {} occupied slots do not cover capacity {}", free_len, occupied, capacity
            )));
        }
        Ok(())
    }

    pub fn flush(&self) -> SlotResult<()> {
        self.file.flush()
    }

    fn corrupted(&self, offset: usize, reason: String) -> SlotError {
        SlotError::Corrupted { path: self.file.path().to_path_buf(), offset: offset as u64, reason }
    }
}

/// Pick the geometry to run with when a formatted file is reopened.
pub(crate) fn reconcile(
    path: &Path,
    persisted: Geometry,
    configured: Geometry,
    policy: ReopenPolicy,
) -> SlotResult<Geometry> {
    match (persisted.first_mismatch(&configured), policy) {
        (None, _) => Ok(persisted),
        (Some((field, on_disk, wanted)), ReopenPolicy::Verify) => Err(SlotError::HeaderMismatch {
            path: path.to_path_buf(),
            field,
            persisted: on_disk,
            configured: wanted,
        }),
        (Some((field, on_disk, wanted)), ReopenPolicy::TrustFile) => {
            tracing::warn!(
                path = %path.display(),
                field,
                persisted = on_disk,
                configured = wanted,
                "configuration differs from records header, using persisted geometry"
            );
            Ok(persisted)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn geometry(count: u32) -> Geometry {
        Geometry {
            max_record_count: count,
            max_record_size: 8,
            hash_bucket_count: 16,
            primary_field_len: 16,
            secondary_field_len: 0,
            lock_enabled: false,
        }
    }

    fn test_arena(count: u32) -> (RecordArena, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t_records.dat");
        let (arena, created) = RecordArena::open(&path, geometry(count), ReopenPolicy::Verify).unwrap();
        assert!(created);
        (arena, dir)
    }

    #[test]
    fn test_fresh_arena_all_free() {
        let (arena, _dir) = test_arena(4);
        assert_eq!(arena.capacity(), 4);
        assert_eq!(arena.used_count(), 0);
        assert_eq!(arena.free_count(), 4);
        arena.verify().unwrap();
    }

    #[test]
    fn test_allocate_in_ascending_order_until_exhausted() {
        let (mut arena, _dir) = test_arena(3);
        assert_eq!(arena.allocate().unwrap(), 0);
        assert_eq!(arena.allocate().unwrap(), 1);
        assert_eq!(arena.allocate().unwrap(), 2);
        assert!(matches!(arena.allocate(), Err(SlotError::NoSpace { capacity: 3 })));
        assert_eq!(arena.free_count(), 0);
        arena.verify().unwrap();
    }

    #[test]
    fn test_free_pushes_to_head() {
        let (mut arena, _dir) = test_arena(4);
        for _ in 0..3 {
            arena.allocate().unwrap();
        }
        arena.free(1, false).unwrap();
        assert_eq!(arena.used_count(), 2);
        assert_eq!(arena.allocate().unwrap(), 1);
        assert_eq!(arena.allocate().unwrap(), 3);
        arena.verify().unwrap();
    }

    #[test]
    fn test_free_rejects_out_of_range_and_double_free() {
        let (mut arena, _dir) = test_arena(2);
        let slot = arena.allocate().unwrap();
        assert!(matches!(arena.free(2, false), Err(SlotError::InvalidParameter { .. })));
        arena.free(slot, false).unwrap();
        assert!(matches!(arena.free(slot, false), Err(SlotError::InvalidParameter { .. })));
        assert_eq!(arena.used_count(), 0);
    }

    #[test]
    fn test_value_roundtrip_and_bounds() {
        let (mut arena, _dir) = test_arena(2);
        let slot = arena.allocate().unwrap();
        arena.get_mut(slot, 5).unwrap().copy_from_slice(b"hello");
        assert_eq!(arena.get(slot).unwrap(), b"hello");
        assert!(arena.get(2).is_none());
        assert!(arena.get_mut(slot, 9).is_none());
    }

    #[test]
    fn test_free_keeps_stale_bytes_unless_scrubbed() {
        let (mut arena, _dir) = test_arena(2);
        let a = arena.allocate().unwrap();
        let b = arena.allocate().unwrap();
        arena.get_mut(a, 3).unwrap().copy_from_slice(b"old");
        arena.get_mut(b, 3).unwrap().copy_from_slice(b"sec");

        arena.free(a, false).unwrap();
        assert_eq!(arena.get(a).unwrap(), b"old");

        arena.free(b, true).unwrap();
        assert!(arena.get(b).unwrap().is_empty());
    }

    #[test]
    fn test_clear_rebuilds_free_list() {
        let (mut arena, _dir) = test_arena(3);
        arena.allocate().unwrap();
        arena.allocate().unwrap();
        arena.clear();
        assert_eq!(arena.used_count(), 0);
        assert_eq!(arena.free_count(), 3);
        assert_eq!(arena.allocate().unwrap(), 0);
        arena.verify().unwrap();
    }

    #[test]
    fn test_reopen_keeps_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t_records.dat");
        {
            let (mut arena, _) = RecordArena::open(&path, geometry(4), ReopenPolicy::Verify).unwrap();
            let slot = arena.allocate().unwrap();
            arena.get_mut(slot, 2).unwrap().copy_from_slice(b"ok");
        }
        let (arena, created) = RecordArena::open(&path, geometry(4), ReopenPolicy::Verify).unwrap();
        assert!(!created);
        assert_eq!(arena.used_count(), 1);
        assert_eq!(arena.get(0).unwrap(), b"ok");
        arena.verify().unwrap();
    }

    #[test]
    fn test_reopen_policy() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t_records.dat");
        drop(RecordArena::open(&path, geometry(4), ReopenPolicy::Verify).unwrap());

        let result = RecordArena::open(&path, geometry(8), ReopenPolicy::Verify);
        assert!(matches!(
            result,
            Err(SlotError::HeaderMismatch { field: "max_record_count", persisted: 4, configured: 8, .. })
        ));

        let (arena, _) = RecordArena::open(&path, geometry(8), ReopenPolicy::TrustFile).unwrap();
        assert_eq!(arena.capacity(), 4);
    }

    #[test]
    fn test_corrupted_header_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t_records.dat");
        drop(RecordArena::open(&path, geometry(4), ReopenPolicy::Verify).unwrap());

        let mut data = std::fs::read(&path).unwrap();
        data[16] ^= 0xFF; // max_record_size, covered by the geometry checksum
        std::fs::write(&path, data).unwrap();

        assert!(matches!(
            RecordArena::open(&path, geometry(4), ReopenPolicy::TrustFile),
            Err(SlotError::Corrupted { .. })
        ));
    }

    #[test]
    fn test_verify_detects_free_list_cycle() {
        let (mut arena, _dir) = test_arena(3);
        // Point slot 1 back at slot 0
        let off = arena.slot_offset(1) + SLOT_OFF_NEXT;
        write_i32(arena.file.bytes_mut(), off, 0);
        assert!(matches!(arena.verify(), Err(SlotError::Corrupted { .. })));
    }
}
