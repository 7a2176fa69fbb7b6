//! Durable flush of a mapped region to its backing file
//!
//! `msync` alone hands dirty pages to the OS; on some platforms the device
//! cache still has to be flushed explicitly before the bytes survive power
//! loss. `flush_mapping` does both in the right order.

use std::fs::File;
use std::io;

use memmap2::MmapMut;

/// Write back every dirty page of `map`, then push `file` through the
/// platform's strongest sync primitive.
///
/// Blocks for the duration of the I/O; callers hold the store lock, so
/// other processes wait as well.
pub fn flush_mapping(map: &MmapMut, file: &File) -> io::Result<()> {
    map.flush()?;
    sync_file(file)
}

/// Platform behaviors:
/// - Linux: fdatasync() - data without metadata, mtime is irrelevant here
/// - macOS/iOS: fcntl(F_FULLFSYNC) - plain fsync stops at the drive cache
/// - Windows: FlushFileBuffers()
/// - Other: File::sync_data()
fn sync_file(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the descriptor comes from a live `File` borrowed for the call.
        let rc = unsafe { libc::fdatasync(file.as_raw_fd()) };
        if rc == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the descriptor comes from a live `File` borrowed for the call.
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_FULLFSYNC) };
        if rc == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::FlushFileBuffers;
        // SAFETY: the handle comes from a live `File` borrowed for the call.
        let ok = unsafe { FlushFileBuffers(file.as_raw_handle() as *mut _) };
        if ok != 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios", target_os = "windows")))]
    {
        file.sync_data()
    }
}
