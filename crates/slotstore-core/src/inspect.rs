//! Read-only view of a records file header
//!
//! Maps just the header, never the slots, and takes no lock. The live
//! count it reports is a snapshot and may be stale by the time it is read.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{SlotError, SlotResult};
use crate::format::{Geometry, RecordsHeader, HEADER_SIZE, NIL};
use crate::mapping::map_header;

/// What the header of a records file says about the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreInfo {
    pub path: PathBuf,
    pub version: u16,
    pub geometry: Geometry,
    pub total_storage_size: u64,
    /// Head of the free list, `None` when the arena is full
    pub first_free: Option<u32>,
    pub live_records: u32,
    pub free_records: u32,
}

/// Decode the header of the records file at `path`.
///
/// Fails with `Corrupted` when the magic, version, checksum or declared
/// size do not hold up, and with `Io` when the file cannot be opened.
pub fn inspect(path: &Path) -> SlotResult<StoreInfo> {
    let map = map_header(path, HEADER_SIZE)?;
    let header = RecordsHeader::decode(&map[..]).map_err(|(offset, reason)| SlotError::Corrupted {
        path: path.to_path_buf(),
        offset,
        reason,
    })?;

    let capacity = header.geometry.max_record_count;
    Ok(StoreInfo {
        path: path.to_path_buf(),
        version: header.version,
        geometry: header.geometry,
        total_storage_size: header.total_storage_size,
        first_free: if header.first_free == NIL { None } else { Some(header.first_free as u32) },
        live_records: header.record_count,
        free_records: capacity.saturating_sub(header.record_count),
    })
}

impl fmt::Display for StoreInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let g = &self.geometry;
        writeln!(f, "file               {}", self.path.display())?;
        writeln!(f, "format version     {}", self.version)?;
        writeln!(f, "max record count   {}", g.max_record_count)?;
        writeln!(f, "max record size    {}", g.max_record_size)?;
        writeln!(f, "hash buckets       {}", g.hash_bucket_count)?;
        writeln!(f, "primary field len  {}", g.primary_field_len)?;
        writeln!(f, "secondary field    {}", match g.secondary_field_len {
            0 => "disabled".to_string(),
            n => n.to_string(),
        })?;
        writeln!(f, "process lock       {}", if g.lock_enabled { "enabled" } else { "disabled" })?;
        writeln!(f, "storage bytes      {}", self.total_storage_size)?;
        writeln!(f, "live records       {}", self.live_records)?;
        writeln!(f, "free records       {}", self.free_records)?;
        match self.first_free {
            Some(slot) => writeln!(f, "free list head     slot {}", slot),
            None => writeln!(f, "free list head     none (full)"),
        }
    }
}
