//! Scoped memory mappings over SlotStore backing files
//!
//! A `MappedFile` owns both the file handle and its writable shared mapping.
//! Dropping it unmaps, so a failure anywhere during store initialization
//! releases every mapping created so far.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::error::{SlotError, SlotResult};
use crate::platform_durability::flush_mapping;

/// A backing file mapped read-write and shared with every other process
/// that maps it.
pub struct MappedFile {
    map: MmapMut,
    file: File,
    path: PathBuf,
}

impl MappedFile {
    /// Create the file if absent and size it to exactly `len` bytes.
    ///
    /// Any previous content is kept up to `len` and zero-extended past it;
    /// callers format the mapping afterwards.
    pub fn create(path: &Path, len: u64) -> SlotResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SlotError::io(parent, e, "Failed to create storage directory"))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| SlotError::io(path, e, "Failed to open backing file"))?;

        file.set_len(len)
            .map_err(|e| SlotError::io(path, e, "Failed to size backing file"))?;

        let map = Self::map(&file, path)?;
        Ok(Self { map, file, path: path.to_path_buf() })
    }

    /// Open an already formatted file whose size must equal `expected_len`.
    pub fn open(path: &Path, expected_len: u64) -> SlotResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| SlotError::io(path, e, "Failed to open backing file"))?;

        let actual = file.metadata()
            .map_err(|e| SlotError::io(path, e, "Failed to stat backing file"))?
            .len();
        if actual != expected_len {
            return Err(SlotError::Corrupted {
                path: path.to_path_buf(),
                offset: actual,
                reason: format!("file is {} bytes, header describes {}", actual, expected_len),
            });
        }

        let map = Self::map(&file, path)?;
        Ok(Self { map, file, path: path.to_path_buf() })
    }

    fn map(file: &File, path: &Path) -> SlotResult<MmapMut> {
        // SAFETY: other processes mutate this file only while holding the
        // store's exclusive lock, and nothing truncates a formatted file.
        unsafe { MmapMut::map_mut(file) }.map_err(|e| SlotError::Mapping {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.map
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.map
    }

    /// Durably write back all dirty pages.
    pub fn flush(&self) -> SlotResult<()> {
        flush_mapping(&self.map, &self.file)
            .map_err(|e| SlotError::io(&self.path, e, "Failed to flush mapping"))
    }
}

/// Read up to `n` leading bytes of `path`, or `None` if the file does not exist.
pub fn read_prefix(path: &Path, n: usize) -> SlotResult<Option<Vec<u8>>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(SlotError::io(path, e, "Failed to open backing file")),
    };

    let mut buf = Vec::with_capacity(n);
    file.take(n as u64)
        .read_to_end(&mut buf)
        .map_err(|e| SlotError::io(path, e, "Failed to read file header"))?;
    Ok(Some(buf))
}

/// Map only the first `n` bytes of `path`, read-only.
pub fn map_header(path: &Path, n: usize) -> SlotResult<Mmap> {
    let file = File::open(path)
        .map_err(|e| SlotError::io(path, e, "Failed to open records file"))?;

    let len = file.metadata()
        .map_err(|e| SlotError::io(path, e, "Failed to stat records file"))?
        .len();
    if len < n as u64 {
        return Err(SlotError::Corrupted {
            path: path.to_path_buf(),
            offset: len,
            reason: format!("file is {} bytes, smaller than the {}-byte header", len, n),
        });
    }

    // SAFETY: read-only view of the header; writers only touch it under the store lock.
    unsafe { MmapOptions::new().len(n).map(&file) }.map_err(|e| SlotError::Mapping {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_sizes_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("file.dat");

        let mapped = MappedFile::create(&path, 1000).unwrap();
        assert_eq!(mapped.len(), 1000);
        assert!(mapped.bytes().iter().all(|&b| b == 0));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 1000);
    }

    #[test]
    fn test_writes_visible_to_second_mapping() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("shared.dat");

        let mut first = MappedFile::create(&path, 128).unwrap();
        let second = MappedFile::open(&path, 128).unwrap();

        first.bytes_mut()[10] = 0xAB;
        assert_eq!(second.bytes()[10], 0xAB);
    }

    #[test]
    fn test_open_rejects_wrong_size() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("short.dat");
        std::fs::write(&path, [0u8; 10]).unwrap();

        assert!(matches!(MappedFile::open(&path, 64), Err(SlotError::Corrupted { .. })));
    }

    #[test]
    fn test_read_prefix_missing_file() {
        let tmp = TempDir::new().unwrap();
        assert!(read_prefix(&tmp.path().join("absent"), 64).unwrap().is_none());
    }

    #[test]
    fn test_read_prefix_short_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tiny");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(read_prefix(&path, 64).unwrap().unwrap(), b"abc");
    }

    #[test]
    fn test_map_header_rejects_small_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tiny");
        std::fs::write(&path, b"abc").unwrap();
        assert!(matches!(map_header(&path, 64), Err(SlotError::Corrupted { .. })));
    }
}
