//! SlotStore Core — Process-Shared Record Store over Mapped Files
//!
//! A fixed-capacity key-value store whose records, free list and hash
//! indexes all live in memory-mapped files, so any number of processes can
//! attach to the same store and see each other's writes directly.
//!
//! # Architecture
//!
//! - **Record arena**: one file of equally sized slots; free slots are
//!   chained through the slots themselves
//! - **Indexes**: a primary and an optional secondary chained hash table,
//!   each mapping a key to a slot number
//! - **Locking**: one reader-writer lock per store, spanning threads and
//!   processes; compound writes roll back on failure
//! - **Self-describing files**: the records header carries the geometry, so
//!   a reopen can verify or adopt it

pub mod arena;
pub mod config;
pub mod error;
pub mod format;
pub mod index;
pub mod inspect;
pub mod lock;
pub mod mapping;
pub mod platform_durability;
pub mod stats;
pub mod store;

// Re-export key types for convenience
pub use config::{Config, ReopenPolicy};
pub use error::{Field, SlotError, SlotResult};
pub use format::Geometry;
pub use index::{HashIndex, IndexStats, MmapHashIndex};
pub use inspect::{inspect, StoreInfo};
pub use stats::StoreStatistics;
pub use store::{RecordMut, RecordRef, SlotStore, StoreState};
