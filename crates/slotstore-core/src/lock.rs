//! Process-shared reader-writer lock
//!
//! Two layers:
//! - an in-process `parking_lot::RwLock` serializes threads that share one
//!   store handle and hands out `&T` / `&mut T`;
//! - an advisory `flock` on `<name>.lock` serializes handles, whether they
//!   live in this process or another one.
//!
//! Acquisition order is always local lock first, file lock second. `flock`
//! belongs to the open file description, so all readers of one handle share
//! a single shared file lock; it is taken by the first reader and dropped
//! by the last.
//!
//! The kernel releases a `flock` when its holder exits, so a crashed writer
//! never leaves the store locked. Whatever that writer had half-applied
//! stays half-applied.

use std::fs::{File, OpenOptions};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{SlotError, SlotResult};

/// Handle on the lock file shared by every process attached to a store.
pub struct LockFile {
    file: File,
    path: PathBuf,
    /// Readers of this handle currently covered by the shared file lock
    readers: Mutex<usize>,
}

impl LockFile {
    /// Open (creating if needed) the lock file at `path`.
    pub fn open(path: &Path) -> SlotResult<Self> {
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
            .map_err(|e| lock_error(path, e, "Failed to open lock file"))?;

        Ok(Self { file, path: path.to_path_buf(), readers: Mutex::new(0) })
    }

    /// Block until this handle holds the exclusive file lock; released on drop.
    ///
    /// Used while files are created or reopened, before any `ProcessRwLock`
    /// exists.
    pub fn exclusive(&self) -> SlotResult<ExclusiveFileGuard<'_>> {
        self.lock_exclusive()?;
        Ok(ExclusiveFileGuard { lock: self })
    }

    fn lock_exclusive(&self) -> SlotResult<()> {
        FileExt::lock_exclusive(&self.file)
            .map_err(|e| lock_error(&self.path, e, "Failed to take exclusive lock"))
    }

    fn acquire_shared(&self) -> SlotResult<()> {
        let mut readers = self.readers.lock();
        if *readers == 0 {
            FileExt::lock_shared(&self.file)
                .map_err(|e| lock_error(&self.path, e, "Failed to take shared lock"))?;
        }
        *readers += 1;
        Ok(())
    }

    fn release_shared(&self) {
        let mut readers = self.readers.lock();
        *readers -= 1;
        if *readers == 0 {
            self.unlock();
        }
    }

    fn unlock(&self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::error!(path = %self.path.display(), error = %e, "failed to release store lock");
        }
    }
}

fn lock_error(path: &Path, err: std::io::Error, what: &str) -> SlotError {
    SlotError::Lock {
        path: path.to_path_buf(),
        kind: err.kind(),
        message: format!("{}: {}", what, err),
    }
}

/// Exclusive file lock held for the lifetime of the guard.
pub struct ExclusiveFileGuard<'a> {
    lock: &'a LockFile,
}

impl Drop for ExclusiveFileGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Reader-writer lock whose exclusion extends across processes.
pub struct ProcessRwLock<T> {
    local: RwLock<T>,
    /// `None` when cross-process locking is disabled
    file: Option<LockFile>,
}

impl<T> ProcessRwLock<T> {
    pub fn new(value: T, file: Option<LockFile>) -> Self {
        Self { local: RwLock::new(value), file }
    }

    /// Block until a read lock is held. Readers run concurrently with each
    /// other and never with a writer, in any process.
    pub fn read(&self) -> SlotResult<ReadGuard<'_, T>> {
        let local = self.local.read();
        if let Some(file) = &self.file {
            file.acquire_shared()?;
        }
        Ok(ReadGuard { local, file: self.file.as_ref() })
    }

    /// Block until the write lock is held, excluding every reader and writer.
    pub fn write(&self) -> SlotResult<WriteGuard<'_, T>> {
        let local = self.local.write();
        if let Some(file) = &self.file {
            file.lock_exclusive()?;
        }
        Ok(WriteGuard { local, file: self.file.as_ref() })
    }
}

pub struct ReadGuard<'a, T> {
    local: RwLockReadGuard<'a, T>,
    file: Option<&'a LockFile>,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.local
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(file) = self.file {
            file.release_shared();
        }
    }
}

pub struct WriteGuard<'a, T> {
    local: RwLockWriteGuard<'a, T>,
    file: Option<&'a LockFile>,
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.local
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.local
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(file) = self.file {
            file.unlock();
        }
    }
}
