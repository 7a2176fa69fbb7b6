//! Store: the key-value contract over the record arena and its indexes
//!
//! `SlotStore` composes one `RecordArena` with a primary and an optional
//! secondary `HashIndex` behind a single process-shared reader-writer lock.
//!
//! **Writes** (`put`, `add_record`, `del`, `clear`) hold the write lock for
//! their whole duration. A compound write that fails part-way undoes every
//! step it already made before returning, so callers see all or nothing.
//!
//! **Reads** (`get`, `get_by_seq`) hold the read lock for as long as the
//! returned view lives. Holding a view and then writing through the same
//! handle on the same thread deadlocks; drop or copy the view first.

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

use crate::arena::RecordArena;
use crate::config::Config;
use crate::error::{Field, SlotError, SlotResult};
use crate::format::{Geometry, RecordsHeader, HEADER_SIZE};
use crate::index::{HashIndex, MmapHashIndex};
use crate::inspect::{inspect, StoreInfo};
use crate::lock::{LockFile, ProcessRwLock, ReadGuard, WriteGuard};
use crate::mapping::read_prefix;
use crate::stats::StoreStatistics;

/// Lifecycle of a store handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    Uninitialized,
    Initializing,
    Ready,
}

/// Everything guarded by the store lock.
struct Tables {
    arena: RecordArena,
    primary: Box<dyn HashIndex>,
    secondary: Option<Box<dyn HashIndex>>,
}

impl Tables {
    fn index(&self, field: Field) -> Option<&dyn HashIndex> {
        match field {
            Field::Primary => Some(&*self.primary),
            Field::Secondary => self.secondary.as_deref(),
        }
    }

    /// Resolve `key` to an occupied slot.
    fn lookup(&self, field: Field, key: &[u8]) -> Option<u32> {
        let slot = self.index(field)?.get(key)?;
        if self.arena.is_occupied(slot) {
            Some(slot)
        } else {
            tracing::warn!(%field, slot, "index points at a free slot, treating key as absent");
            None
        }
    }

    /// Unbind `key` if it points at a free slot.
    ///
    /// Such bindings are left behind by a writer that died mid-delete or by
    /// a failed best-effort secondary cleanup.
    fn unbind_dangling(&mut self, field: Field, key: &[u8]) -> SlotResult<()> {
        let index = match field {
            Field::Primary => &mut self.primary,
            Field::Secondary => match self.secondary.as_mut() {
                Some(index) => index,
                None => return Ok(()),
            },
        };
        if let Some(slot) = index.get(key).filter(|&slot| !self.arena.is_occupied(slot)) {
            tracing::warn!(%field, slot, "dropping binding to a free slot");
            index.remove(key)?;
        }
        Ok(())
    }

    /// Allocate a slot, fill `len` bytes of it, then bind both keys.
    /// Any failure rolls back the steps already taken.
    fn insert(
        &mut self,
        pkey: &[u8],
        skey: Option<&[u8]>,
        len: usize,
        fill: impl FnOnce(&mut [u8]),
        scrub: bool,
    ) -> SlotResult<u32> {
        self.unbind_dangling(Field::Primary, pkey)?;
        if self.primary.get(pkey).is_some() {
            return Err(SlotError::KeyExists { field: Field::Primary, key: pkey.to_vec() });
        }
        if let Some(skey) = skey {
            self.unbind_dangling(Field::Secondary, skey)?;
        }

        let slot = self.arena.allocate()?;
        match self.arena.get_mut(slot, len) {
            Some(buf) => fill(buf),
            None => {
                release_slot(&mut self.arena, slot, scrub);
                return Err(SlotError::invalid(format!("record size {} exceeds slot capacity", len)));
            }
        }

        if let Err(e) = self.primary.insert(pkey, slot) {
            release_slot(&mut self.arena, slot, scrub);
            return Err(e);
        }

        if let (Some(skey), Some(secondary)) = (skey, self.secondary.as_mut()) {
            if let Err(e) = secondary.insert(skey, slot) {
                if let Err(undo) = self.primary.remove(pkey) {
                    tracing::error!(slot, error = %undo, "rollback could not unbind primary key");
                }
                release_slot(&mut self.arena, slot, scrub);
                return Err(e);
            }
        }

        Ok(slot)
    }

    /// Unbind `pkey` and its secondary key, then free the slot.
    ///
    /// A primary binding to a free slot is dropped and reported as
    /// `KeyNotFound`. Secondary cleanup is best effort: if the secondary key
    /// cannot be found or removed the delete still completes and the miss
    /// is logged.
    fn remove(&mut self, pkey: &[u8], scrub: bool) -> SlotResult<u32> {
        self.unbind_dangling(Field::Primary, pkey)?;
        let slot = self.primary.remove(pkey)?;

        if let Some(secondary) = self.secondary.as_mut() {
            match secondary.find_key_by_slot(slot) {
                Some(skey) => {
                    if let Err(e) = secondary.remove(&skey) {
                        tracing::warn!(slot, error = %e, "secondary key removal failed, continuing delete");
                    }
                }
                None => {
                    tracing::warn!(slot, "no secondary key bound to deleted record");
                }
            }
        }

        self.arena.free(slot, scrub)?;
        Ok(slot)
    }

    fn clear(&mut self) {
        self.primary.clear();
        if let Some(secondary) = self.secondary.as_mut() {
            secondary.clear();
        }
        self.arena.clear();
    }

    fn statistics(&self) -> StoreStatistics {
        StoreStatistics::new(
            self.arena.capacity(),
            self.arena.used_count(),
            self.primary.stats(),
            self.secondary.as_ref().map(|s| s.stats()),
        )
    }
}

fn release_slot(arena: &mut RecordArena, slot: u32, scrub: bool) {
    if let Err(e) = arena.free(slot, scrub) {
        tracing::error!(slot, error = %e, "rollback could not free slot");
    }
}

/// Whether an existing records file at `path` was created with locking.
/// Unreadable or unformatted files count as unlocked; opening them reports
/// the real problem.
fn persisted_lock_enabled(path: &Path) -> bool {
    match read_prefix(path, HEADER_SIZE) {
        Ok(Some(buf)) if RecordsHeader::is_formatted(&buf) => {
            RecordsHeader::decode(&buf).map_or(false, |header| header.geometry.lock_enabled)
        }
        _ => false,
    }
}

/// Open the index at `path`, or create it empty alongside a new records
/// file. Bindings in an index that outlived its records file are
/// meaningless, whatever geometry it was built with.
fn open_index(
    path: &Path,
    field: Field,
    g: &Geometry,
    field_len: u32,
    fresh: bool,
) -> SlotResult<Box<dyn HashIndex>> {
    let index = if fresh {
        if path.exists() {
            tracing::warn!(path = %path.display(), %field, "replacing index left over from a previous records file");
        }
        MmapHashIndex::create(path, field, g.hash_bucket_count, g.max_record_count, field_len)?
    } else {
        MmapHashIndex::open(path, field, g.hash_bucket_count, g.max_record_count, field_len)?
    };
    Ok(Box::new(index))
}

/// Read-only view of one slot's value bytes. Holds the read lock until dropped.
pub struct RecordRef<'a> {
    guard: ReadGuard<'a, Tables>,
    slot: u32,
}

impl RecordRef<'_> {
    /// 1-based position of the slot in the arena.
    pub fn seq(&self) -> u32 {
        self.slot + 1
    }

    pub fn is_occupied(&self) -> bool {
        self.guard.arena.is_occupied(self.slot)
    }

    pub fn bytes(&self) -> &[u8] {
        self.guard.arena.get(self.slot).unwrap_or(&[])
    }
}

impl Deref for RecordRef<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.bytes()
    }
}

impl std::fmt::Debug for RecordRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordRef")
            .field("seq", &self.seq())
            .field("occupied", &self.is_occupied())
            .field("len", &self.bytes().len())
            .finish()
    }
}

/// Writable view of a slot reserved by `add_record`. Holds the write lock
/// until dropped.
pub struct RecordMut<'a> {
    guard: WriteGuard<'a, Tables>,
    slot: u32,
    len: usize,
}

impl RecordMut<'_> {
    pub fn seq(&self) -> u32 {
        self.slot + 1
    }
}

impl Deref for RecordMut<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.guard.arena.get(self.slot).unwrap_or(&[])
    }
}

impl DerefMut for RecordMut<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        let (slot, len) = (self.slot, self.len);
        self.guard.arena.get_mut(slot, len).unwrap_or_default()
    }
}

/// Process-shared fixed-slot key-value store.
pub struct SlotStore {
    config: Config,
    state: StoreState,
    /// Effective geometry, known once initialized
    geometry: Option<Geometry>,
    shared: Option<ProcessRwLock<Tables>>,
}

impl SlotStore {
    /// Create an uninitialized handle. No file is touched until `initialize`.
    pub fn new(config: Config) -> Self {
        Self { config, state: StoreState::Uninitialized, geometry: None, shared: None }
    }

    /// Open or create the backing files and join the store.
    ///
    /// Creation and reopening run under the exclusive file lock. On failure
    /// every file mapped so far is unmapped and the handle stays
    /// `Uninitialized`.
    pub fn initialize(&mut self) -> SlotResult<()> {
        if self.state == StoreState::Ready {
            return Ok(());
        }
        self.config.validate().map_err(SlotError::invalid)?;

        self.state = StoreState::Initializing;
        match self.open_tables() {
            Ok((shared, geometry)) => {
                self.shared = Some(shared);
                self.geometry = Some(geometry);
                self.state = StoreState::Ready;
                tracing::info!(name = %self.config.name, dir = %self.config.data_dir.display(), "store ready");
                Ok(())
            }
            Err(e) => {
                self.state = StoreState::Uninitialized;
                tracing::error!(name = %self.config.name, error = %e, "store initialization failed");
                Err(e)
            }
        }
    }

    fn open_tables(&self) -> SlotResult<(ProcessRwLock<Tables>, Geometry)> {
        let config = &self.config;
        // A store created with locking is locked for every handle that joins it
        let mut locked = config.lock_enabled || persisted_lock_enabled(&config.records_path());

        loop {
            let lock_file = if locked {
                Some(LockFile::open(&config.lock_path())?)
            } else {
                None
            };
            let exclusive = match &lock_file {
                Some(file) => Some(file.exclusive()?),
                None => None,
            };

            let (arena, created) = RecordArena::open(
                &config.records_path(),
                Geometry::from_config(config),
                config.reopen_policy,
            )?;
            let g = arena.geometry();
            if g.lock_enabled && !locked {
                // Another process created the store with locking after the header was read
                locked = true;
                continue;
            }

            let primary = open_index(&config.primary_index_path(), Field::Primary, &g, g.primary_field_len, created)?;
            let secondary = if g.secondary_field_len > 0 {
                Some(open_index(&config.secondary_index_path(), Field::Secondary, &g, g.secondary_field_len, created)?)
            } else {
                None
            };

            drop(exclusive);
            let tables = Tables { arena, primary, secondary };
            return Ok((ProcessRwLock::new(tables, lock_file), g));
        }
    }

    pub fn state(&self) -> StoreState {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn records_path(&self) -> PathBuf {
        self.config.records_path()
    }

    /// Effective geometry (persisted geometry when reopened with `TrustFile`).
    pub fn geometry(&self) -> SlotResult<Geometry> {
        self.geometry.ok_or(SlotError::NotInitialized)
    }

    /// Read the persisted header of a records file without joining the store.
    pub fn inspect(records_path: &Path) -> SlotResult<StoreInfo> {
        inspect(records_path)
    }

    fn shared(&self) -> SlotResult<&ProcessRwLock<Tables>> {
        match (&self.shared, self.state) {
            (Some(shared), StoreState::Ready) => Ok(shared),
            _ => Err(SlotError::NotInitialized),
        }
    }

    /// Check key lengths against the field widths. Returns the secondary
    /// key to bind, `None` when secondary indexing is off.
    fn validate_keys<'k>(&self, pkey: &[u8], skey: Option<&'k [u8]>) -> SlotResult<Option<&'k [u8]>> {
        let g = self.geometry()?;
        if pkey.is_empty() || pkey.len() >= g.primary_field_len as usize {
            return Err(SlotError::invalid(format!(
                "primary key length {} outside [1, {})", pkey.len(), g.primary_field_len
            )));
        }
        if g.secondary_field_len == 0 {
            return Ok(None);
        }
        match skey {
            Some(k) if !k.is_empty() && k.len() < g.secondary_field_len as usize => Ok(Some(k)),
            Some(k) => Err(SlotError::invalid(format!(
                "secondary key length {} outside [1, {})", k.len(), g.secondary_field_len
            ))),
            None => Err(SlotError::invalid("secondary key required when secondary indexing is enabled")),
        }
    }

    fn validate_size(&self, size: usize) -> SlotResult<()> {
        let g = self.geometry()?;
        if size == 0 || size > g.max_record_size as usize {
            return Err(SlotError::invalid(format!(
                "record size {} outside [1, {}]", size, g.max_record_size
            )));
        }
        Ok(())
    }

    /// Insert a new record. Never overwrites: an existing primary key fails
    /// with `KeyExists`.
    pub fn put(&self, pkey: &[u8], skey: Option<&[u8]>, value: &[u8]) -> SlotResult<()> {
        let shared = self.shared()?;
        let skey = self.validate_keys(pkey, skey)?;
        self.validate_size(value.len())?;

        let mut guard = shared.write()?;
        let slot = guard.insert(pkey, skey, value.len(), |buf| buf.copy_from_slice(value), self.config.scrub_on_free)?;
        tracing::debug!(slot, size = value.len(), "put record");
        Ok(())
    }

    /// Reserve `size` bytes for a new record and return a writable view of
    /// them. The reserved bytes start zeroed; the write lock is held until
    /// the view is dropped.
    pub fn add_record(&self, pkey: &[u8], skey: Option<&[u8]>, size: usize) -> SlotResult<RecordMut<'_>> {
        let shared = self.shared()?;
        let skey = self.validate_keys(pkey, skey)?;
        self.validate_size(size)?;

        let mut guard = shared.write()?;
        let slot = guard.insert(pkey, skey, size, |buf| buf.fill(0), self.config.scrub_on_free)?;
        tracing::debug!(slot, size, "reserved record");
        Ok(RecordMut { guard, slot, len: size })
    }

    /// Look up `key` in the index of `field`. A missing key, or a secondary
    /// lookup without a secondary index, yields `None`.
    pub fn get(&self, field: Field, key: &[u8]) -> SlotResult<Option<RecordRef<'_>>> {
        let guard = self.shared()?.read()?;
        match guard.lookup(field, key) {
            Some(slot) => Ok(Some(RecordRef { guard, slot })),
            None => Ok(None),
        }
    }

    /// Owned copy of the value bound to `key`.
    pub fn get_copy(&self, field: Field, key: &[u8]) -> SlotResult<Option<Vec<u8>>> {
        Ok(self.get(field, key)?.map(|record| record.bytes().to_vec()))
    }

    /// Raw positional read of slot `seq` (1-based), occupied or not.
    pub fn get_by_seq(&self, seq: u32) -> SlotResult<RecordRef<'_>> {
        let shared = self.shared()?;
        let capacity = self.geometry()?.max_record_count;
        if seq == 0 || seq > capacity {
            return Err(SlotError::invalid(format!("sequence {} outside [1, {}]", seq, capacity)));
        }
        let guard = shared.read()?;
        Ok(RecordRef { guard, slot: seq - 1 })
    }

    pub fn contains_key(&self, field: Field, key: &[u8]) -> SlotResult<bool> {
        Ok(self.shared()?.read()?.lookup(field, key).is_some())
    }

    /// Delete the record bound to `pkey`, unbinding its secondary key too.
    pub fn del(&self, pkey: &[u8]) -> SlotResult<()> {
        let mut guard = self.shared()?.write()?;
        let slot = guard.remove(pkey, self.config.scrub_on_free)?;
        tracing::debug!(slot, "deleted record");
        Ok(())
    }

    /// Drop every record and binding. Never implicit: the files may be
    /// shared with other processes that still expect their contents.
    pub fn clear(&self) -> SlotResult<()> {
        let mut guard = self.shared()?.write()?;
        guard.clear();
        tracing::info!(name = %self.config.name, "store cleared");
        Ok(())
    }

    /// Live record count.
    pub fn len(&self) -> SlotResult<u32> {
        Ok(self.shared()?.read()?.arena.used_count())
    }

    pub fn is_empty(&self) -> SlotResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn get_statistics(&self) -> SlotResult<StoreStatistics> {
        Ok(self.shared()?.read()?.statistics())
    }

    /// True iff every index passes its own integrity check.
    pub fn validate_integrity(&self) -> bool {
        let Ok(shared) = self.shared() else { return false };
        let Ok(guard) = shared.read() else { return false };
        guard.primary.validate_integrity()
            && guard.secondary.as_ref().map_or(true, |s| s.validate_integrity())
    }

    /// Walk the arena free list and cross-check slot occupancy.
    pub fn verify_arena(&self) -> SlotResult<()> {
        self.shared()?.read()?.arena.verify()
    }

    /// Visit every occupied slot with its primary key, in slot order.
    /// Returns the number of records visited.
    pub fn for_each_record<F>(&self, mut f: F) -> SlotResult<usize>
    where
        F: FnMut(u32, &[u8], &[u8]),
    {
        let guard = self.shared()?.read()?;
        let mut visited = 0;
        for slot in 0..guard.arena.capacity() {
            if !guard.arena.is_occupied(slot) {
                continue;
            }
            if let (Some(pkey), Some(value)) = (guard.primary.find_key_by_slot(slot), guard.arena.get(slot)) {
                f(slot + 1, &pkey, value);
                visited += 1;
            }
        }
        Ok(visited)
    }

    /// Durably flush the records file and every index file.
    pub fn sync(&self) -> SlotResult<()> {
        let guard = self.shared()?.read()?;
        guard.arena.flush()?;
        guard.primary.flush()?;
        if let Some(secondary) = &guard.secondary {
            secondary.flush()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for SlotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotStore")
            .field("name", &self.config.name)
            .field("data_dir", &self.config.data_dir)
            .field("state", &self.state)
            .finish()
    }
}
