//! Aggregate statistics of a store

use std::fmt;

use crate::index::IndexStats;

/// Point-in-time snapshot taken under the read lock.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreStatistics {
    /// Slot capacity of the arena
    pub total_records: u32,
    /// Occupied slots
    pub used_records: u32,
    /// Slots on the free list
    pub free_records: u32,
    /// used / total
    pub utilization: f64,
    pub primary: IndexStats,
    /// Present when secondary indexing is configured
    pub secondary: Option<IndexStats>,
}

impl StoreStatistics {
    pub(crate) fn new(total: u32, used: u32, primary: IndexStats, secondary: Option<IndexStats>) -> Self {
        Self {
            total_records: total,
            used_records: used,
            free_records: total.saturating_sub(used),
            utilization: if total == 0 { 0.0 } else { used as f64 / total as f64 },
            primary,
            secondary,
        }
    }
}

fn write_index(f: &mut fmt::Formatter<'_>, name: &str, stats: &IndexStats) -> fmt::Result {
    writeln!(
        f,
        "{:<10} entries={} buckets={}/{} ({:.1}%) max_chain={} avg_chain={:.2}",
        name,
        stats.entries,
        stats.used_buckets,
        stats.bucket_count,
        stats.utilization() * 100.0,
        stats.max_chain_len,
        stats.avg_chain_len,
    )
}

impl fmt::Display for StoreStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "records    total={} used={} free={} ({:.1}% used)",
            self.total_records,
            self.used_records,
            self.free_records,
            self.utilization * 100.0,
        )?;
        write_index(f, "primary", &self.primary)?;
        if let Some(secondary) = &self.secondary {
            write_index(f, "secondary", secondary)?;
        }
        Ok(())
    }
}
