//! Configuration for a SlotStore instance
//!
//! A configuration fixes the geometry of the backing files (slot count,
//! slot size, bucket count, key widths) and where they live. Geometry is
//! persisted in the records header on creation and never changes afterwards.

use std::path::{Path, PathBuf};

/// Subdirectory of `data_dir` holding every backing file of a store
pub const DATA_SUBDIR: &str = "data";

/// Upper bound on the value capacity of a single slot (16MB)
pub const MAX_RECORD_SIZE_LIMIT: u32 = 16 * 1024 * 1024;

/// Upper bound on a key field width, including the terminator byte
pub const MAX_FIELD_LEN: u32 = 1024;

/// What to do when an existing records file disagrees with the configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReopenPolicy {
    /// Reject the reopen with `SlotError::HeaderMismatch`
    Verify,
    /// Adopt the persisted geometry and ignore the configured one
    TrustFile,
}

/// SlotStore configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory under which the `data/` subdirectory is created
    pub data_dir: PathBuf,
    /// Base name shared by the records, index and lock files
    pub name: String,
    /// Number of record slots in the arena
    pub max_record_count: u32,
    /// Value capacity of each slot in bytes
    pub max_record_size: u32,
    /// Number of chain heads in each hash index
    pub hash_bucket_count: u32,
    /// Width of the primary key field; keys must be strictly shorter
    pub primary_field_len: u32,
    /// Width of the secondary key field; 0 disables secondary indexing
    pub secondary_field_len: u32,
    /// Serialize access across processes with the shared file lock
    pub lock_enabled: bool,
    /// Zero value bytes when a slot is freed
    pub scrub_on_free: bool,
    /// Reopen behaviour when the persisted header disagrees
    pub reopen_policy: ReopenPolicy,
    /// Log verbosity (`error`, `warn`, `info`, `debug`, `trace`)
    pub log_level: String,
}

impl Config {
    /// Default geometry rooted at `data_dir` with base name `name`.
    pub fn new<P: AsRef<Path>>(data_dir: P, name: &str) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            name: name.to_string(),
            max_record_count: 10_000,
            max_record_size: 1024,
            hash_bucket_count: 16_384,
            primary_field_len: 64,
            secondary_field_len: 0,
            lock_enabled: true,
            scrub_on_free: false,
            reopen_policy: ReopenPolicy::Verify,
            log_level: "info".to_string(),
        }
    }

    /// Directory holding the backing files.
    pub fn storage_dir(&self) -> PathBuf {
        self.data_dir.join(DATA_SUBDIR)
    }

    /// `<data_dir>/data/<name>_records.dat`
    pub fn records_path(&self) -> PathBuf {
        self.storage_dir().join(format!("{}_records.dat", self.name))
    }

    /// `<data_dir>/data/<name>_primary`
    pub fn primary_index_path(&self) -> PathBuf {
        self.storage_dir().join(format!("{}_primary", self.name))
    }

    /// `<data_dir>/data/<name>_secondary`
    pub fn secondary_index_path(&self) -> PathBuf {
        self.storage_dir().join(format!("{}_secondary", self.name))
    }

    /// `<data_dir>/data/<name>.lock`
    pub fn lock_path(&self) -> PathBuf {
        self.storage_dir().join(format!("{}.lock", self.name))
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("name must not be empty".into());
        }
        if self.name.contains(['/', '\\']) {
            return Err("name must not contain path separators".into());
        }
        // Slot indexes travel as i32 links with -1 as terminator
        if self.max_record_count == 0 || self.max_record_count > i32::MAX as u32 {
            return Err("max_record_count must be in [1, i32::MAX]".into());
        }
        if self.max_record_size == 0 || self.max_record_size > MAX_RECORD_SIZE_LIMIT {
            return Err("max_record_size must be in [1, 16MB]".into());
        }
        if self.hash_bucket_count == 0 || self.hash_bucket_count > i32::MAX as u32 {
            return Err("hash_bucket_count must be in [1, i32::MAX]".into());
        }
        if self.primary_field_len < 2 || self.primary_field_len > MAX_FIELD_LEN {
            return Err("primary_field_len must be in [2, 1024]".into());
        }
        if self.secondary_field_len == 1 || self.secondary_field_len > MAX_FIELD_LEN {
            return Err("secondary_field_len must be 0 or in [2, 1024]".into());
        }
        if !matches!(self.log_level.as_str(), "error" | "warn" | "info" | "debug" | "trace") {
            return Err("log_level must be one of error, warn, info, debug, trace".into());
        }
        Ok(())
    }
}
