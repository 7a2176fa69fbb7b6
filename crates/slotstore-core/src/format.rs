//! Binary layout of SlotStore backing files
//!
//! Every multi-byte field is little-endian at a fixed offset, so a store
//! written on one platform reopens unchanged on another.
//!
//! Records file:
//! ```text
//! [0..64)    RecordsHeader
//! [64..)     max_record_count × entry, entry = 16-byte slot header + value area
//! ```
//!
//! Index file:
//! ```text
//! [0..64)    IndexHeader
//! [64..)     bucket_count × i32 chain heads (padded to 8)
//! [..)       capacity × node, node i = key bound to record slot i
//! ```

use crate::config::Config;

/// Magic bytes of a records file: "SLTR"
pub const RECORDS_MAGIC: [u8; 4] = *b"SLTR";

/// Magic bytes of an index file: "SLTI"
pub const INDEX_MAGIC: [u8; 4] = *b"SLTI";

/// On-disk format version
pub const FORMAT_VERSION: u16 = 1;

/// Size of both file headers in bytes
pub const HEADER_SIZE: usize = 64;

/// Size of the per-slot header preceding the value bytes
pub const SLOT_HEADER_SIZE: usize = 16;

/// Terminator for free-list and chain links
pub const NIL: i32 = -1;

// Records header offsets
//   [0..4]   magic:               [u8;4]
//   [4..6]   version:             u16
//   [6..8]   reserved
//   [8..12]  first_free:          i32   (-1 = none)
//   [12..16] max_record_count:    u32
//   [16..20] max_record_size:     u32
//   [20..24] hash_bucket_count:   u32
//   [24..32] total_storage_size:  u64
//   [32..36] primary_field_len:   u32
//   [36..40] secondary_field_len: u32
//   [40]     lock_enabled:        u8
//   [41..44] reserved
//   [44..48] record_count:        u32
//   [48..52] geometry_crc:        u32   CRC32C of [12..44)
//   [52..64] reserved
const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
pub(crate) const OFF_FIRST_FREE: usize = 8;
const OFF_MAX_RECORD_COUNT: usize = 12;
const OFF_MAX_RECORD_SIZE: usize = 16;
const OFF_BUCKET_COUNT: usize = 20;
const OFF_TOTAL_SIZE: usize = 24;
const OFF_PRIMARY_LEN: usize = 32;
const OFF_SECONDARY_LEN: usize = 36;
const OFF_LOCK_ENABLED: usize = 40;
pub(crate) const OFF_RECORD_COUNT: usize = 44;
const OFF_GEOMETRY_CRC: usize = 48;
const GEOMETRY_RANGE: std::ops::Range<usize> = 12..44;

// Slot header offsets
//   [0]      occupied:  u8
//   [1..4]   reserved
//   [4..8]   next_free: i32
//   [8..12]  value_len: u32
//   [12..16] reserved
pub(crate) const SLOT_OFF_OCCUPIED: usize = 0;
pub(crate) const SLOT_OFF_NEXT: usize = 4;
pub(crate) const SLOT_OFF_LEN: usize = 8;

// Index header offsets
//   [0..4]   magic:        [u8;4]
//   [4..6]   version:      u16
//   [8..12]  bucket_count: u32
//   [12..16] capacity:     u32
//   [16..20] field_len:    u32
//   [20..24] entry_count:  u32
//   [24..28] geometry_crc: u32   CRC32C of [8..20)
const IDX_OFF_BUCKET_COUNT: usize = 8;
const IDX_OFF_CAPACITY: usize = 12;
const IDX_OFF_FIELD_LEN: usize = 16;
pub(crate) const IDX_OFF_ENTRY_COUNT: usize = 20;
const IDX_OFF_GEOMETRY_CRC: usize = 24;
const IDX_GEOMETRY_RANGE: std::ops::Range<usize> = 8..20;

// Index node offsets
//   [0]      used:    u8
//   [1]      reserved
//   [2..4]   key_len: u16
//   [4..8]   next:    i32
//   [8..]    key bytes (field_len, padded to 8)
pub(crate) const NODE_OFF_USED: usize = 0;
pub(crate) const NODE_OFF_KEY_LEN: usize = 2;
pub(crate) const NODE_OFF_NEXT: usize = 4;
pub(crate) const NODE_OFF_KEY: usize = 8;

#[inline]
pub(crate) fn align8(n: usize) -> usize {
    (n + 7) & !7
}

#[inline]
pub(crate) fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

#[inline]
pub(crate) fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

#[inline]
pub(crate) fn read_i32(buf: &[u8], off: usize) -> i32 {
    i32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

#[inline]
pub(crate) fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

#[inline]
pub(crate) fn write_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

#[inline]
pub(crate) fn write_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

#[inline]
pub(crate) fn write_i32(buf: &mut [u8], off: usize, v: i32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

#[inline]
pub(crate) fn write_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

/// Immutable shape of a store, fixed when the records file is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub max_record_count: u32,
    pub max_record_size: u32,
    pub hash_bucket_count: u32,
    pub primary_field_len: u32,
    pub secondary_field_len: u32,
    pub lock_enabled: bool,
}

impl Geometry {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_record_count: config.max_record_count,
            max_record_size: config.max_record_size,
            hash_bucket_count: config.hash_bucket_count,
            primary_field_len: config.primary_field_len,
            secondary_field_len: config.secondary_field_len,
            lock_enabled: config.lock_enabled,
        }
    }

    /// Bytes occupied by one slot: header plus value area padded to 8.
    pub fn entry_size(&self) -> usize {
        SLOT_HEADER_SIZE + align8(self.max_record_size as usize)
    }

    /// Exact size of the records file.
    pub fn total_storage_size(&self) -> u64 {
        HEADER_SIZE as u64 + self.max_record_count as u64 * self.entry_size() as u64
    }

    /// First field that differs from `other`, as (name, self, other).
    pub fn first_mismatch(&self, other: &Geometry) -> Option<(&'static str, u64, u64)> {
        let fields = [
            ("max_record_count", self.max_record_count as u64, other.max_record_count as u64),
            ("max_record_size", self.max_record_size as u64, other.max_record_size as u64),
            ("hash_bucket_count", self.hash_bucket_count as u64, other.hash_bucket_count as u64),
            ("primary_field_len", self.primary_field_len as u64, other.primary_field_len as u64),
            ("secondary_field_len", self.secondary_field_len as u64, other.secondary_field_len as u64),
            ("lock_enabled", self.lock_enabled as u64, other.lock_enabled as u64),
        ];
        fields.into_iter().find(|(_, a, b)| a != b)
    }
}

/// Decoded records file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordsHeader {
    pub version: u16,
    pub first_free: i32,
    pub geometry: Geometry,
    pub total_storage_size: u64,
    pub record_count: u32,
    pub checksum: u32,
}

impl RecordsHeader {
    /// Header of a freshly formatted file: every slot free, chained from 0.
    pub fn new(geometry: Geometry) -> Self {
        let mut header = Self {
            version: FORMAT_VERSION,
            first_free: 0,
            geometry,
            total_storage_size: geometry.total_storage_size(),
            record_count: 0,
            checksum: 0,
        };
        header.checksum = crc32c::crc32c(&header.encode()[GEOMETRY_RANGE]);
        header
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        let g = &self.geometry;
        buf[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&RECORDS_MAGIC);
        write_u16(&mut buf, OFF_VERSION, self.version);
        write_i32(&mut buf, OFF_FIRST_FREE, self.first_free);
        write_u32(&mut buf, OFF_MAX_RECORD_COUNT, g.max_record_count);
        write_u32(&mut buf, OFF_MAX_RECORD_SIZE, g.max_record_size);
        write_u32(&mut buf, OFF_BUCKET_COUNT, g.hash_bucket_count);
        write_u64(&mut buf, OFF_TOTAL_SIZE, self.total_storage_size);
        write_u32(&mut buf, OFF_PRIMARY_LEN, g.primary_field_len);
        write_u32(&mut buf, OFF_SECONDARY_LEN, g.secondary_field_len);
        buf[OFF_LOCK_ENABLED] = g.lock_enabled as u8;
        write_u32(&mut buf, OFF_RECORD_COUNT, self.record_count);
        write_u32(&mut buf, OFF_GEOMETRY_CRC, self.checksum);
        buf
    }

    /// A nonzero slot count marks a file that has already been formatted.
    pub fn is_formatted(buf: &[u8]) -> bool {
        buf.len() >= HEADER_SIZE && read_u32(buf, OFF_MAX_RECORD_COUNT) != 0
    }

    /// Parse and validate a header. Errors carry (offset, reason).
    pub fn decode(buf: &[u8]) -> Result<Self, (u64, String)> {
        if buf.len() < HEADER_SIZE {
            return Err((0, format!("header too short: {} bytes, need {}", buf.len(), HEADER_SIZE)));
        }
        if buf[OFF_MAGIC..OFF_MAGIC + 4] != RECORDS_MAGIC {
            return Err((OFF_MAGIC as u64, format!(
                "bad magic {:02x}{:02x}{:02x}{:02x}", buf[0], buf[1], buf[2], buf[3]
            )));
        }
        let version = read_u16(buf, OFF_VERSION);
        if version != FORMAT_VERSION {
            return Err((OFF_VERSION as u64, format!("unsupported format version {}", version)));
        }
        let checksum = read_u32(buf, OFF_GEOMETRY_CRC);
        let computed = crc32c::crc32c(&buf[GEOMETRY_RANGE]);
        if checksum != computed {
            return Err((OFF_GEOMETRY_CRC as u64, format!(
                "geometry checksum mismatch: expected 0x{:08x}, got 0x{:08x}", checksum, computed
            )));
        }

        let geometry = Geometry {
            max_record_count: read_u32(buf, OFF_MAX_RECORD_COUNT),
            max_record_size: read_u32(buf, OFF_MAX_RECORD_SIZE),
            hash_bucket_count: read_u32(buf, OFF_BUCKET_COUNT),
            primary_field_len: read_u32(buf, OFF_PRIMARY_LEN),
            secondary_field_len: read_u32(buf, OFF_SECONDARY_LEN),
            lock_enabled: buf[OFF_LOCK_ENABLED] != 0,
        };
        let total_storage_size = read_u64(buf, OFF_TOTAL_SIZE);
        if total_storage_size != geometry.total_storage_size() {
            return Err((OFF_TOTAL_SIZE as u64, format!(
                "total size {} does not match geometry ({} expected)",
                total_storage_size, geometry.total_storage_size()
            )));
        }

        Ok(Self {
            version,
            first_free: read_i32(buf, OFF_FIRST_FREE),
            geometry,
            total_storage_size,
            record_count: read_u32(buf, OFF_RECORD_COUNT),
            checksum,
        })
    }
}

/// Decoded index file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexHeader {
    pub bucket_count: u32,
    pub capacity: u32,
    pub field_len: u32,
    pub entry_count: u32,
}

impl IndexHeader {
    pub fn node_size(field_len: u32) -> usize {
        NODE_OFF_KEY + align8(field_len as usize)
    }

    /// Offset of the first node, after the padded bucket array.
    pub fn nodes_offset(&self) -> usize {
        HEADER_SIZE + align8(self.bucket_count as usize * 4)
    }

    pub fn file_size(&self) -> u64 {
        self.nodes_offset() as u64 + self.capacity as u64 * Self::node_size(self.field_len) as u64
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&INDEX_MAGIC);
        write_u16(&mut buf, 4, FORMAT_VERSION);
        write_u32(&mut buf, IDX_OFF_BUCKET_COUNT, self.bucket_count);
        write_u32(&mut buf, IDX_OFF_CAPACITY, self.capacity);
        write_u32(&mut buf, IDX_OFF_FIELD_LEN, self.field_len);
        write_u32(&mut buf, IDX_OFF_ENTRY_COUNT, self.entry_count);
        let crc = crc32c::crc32c(&buf[IDX_GEOMETRY_RANGE]);
        write_u32(&mut buf, IDX_OFF_GEOMETRY_CRC, crc);
        buf
    }

    pub fn is_formatted(buf: &[u8]) -> bool {
        buf.len() >= HEADER_SIZE && read_u32(buf, IDX_OFF_CAPACITY) != 0
    }

    /// Parse and validate an index header. Errors carry (offset, reason).
    pub fn decode(buf: &[u8]) -> Result<Self, (u64, String)> {
        if buf.len() < HEADER_SIZE {
            return Err((0, format!("header too short: {} bytes, need {}", buf.len(), HEADER_SIZE)));
        }
        if buf[0..4] != INDEX_MAGIC {
            return Err((0, "bad index magic".to_string()));
        }
        let version = read_u16(buf, 4);
        if version != FORMAT_VERSION {
            return Err((4, format!("unsupported format version {}", version)));
        }
        let checksum = read_u32(buf, IDX_OFF_GEOMETRY_CRC);
        let computed = crc32c::crc32c(&buf[IDX_GEOMETRY_RANGE]);
        if checksum != computed {
            return Err((IDX_OFF_GEOMETRY_CRC as u64, format!(
                "geometry checksum mismatch: expected 0x{:08x}, got 0x{:08x}", checksum, computed
            )));
        }
        Ok(Self {
            bucket_count: read_u32(buf, IDX_OFF_BUCKET_COUNT),
            capacity: read_u32(buf, IDX_OFF_CAPACITY),
            field_len: read_u32(buf, IDX_OFF_FIELD_LEN),
            entry_count: read_u32(buf, IDX_OFF_ENTRY_COUNT),
        })
    }
}
