#![allow(unsafe_code)]

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::types::{Result, StoreError};

/// Exclusive advisory lock held on an open store file.
///
/// Acquisition never waits: contention means another process (or another
/// open handle) owns the store, which is fatal at startup.
pub struct FileLock {
    file: Arc<File>,
    path: PathBuf,
}

impl FileLock {
    /// Attempts to take an exclusive lock on `file` without blocking.
    pub fn try_acquire(file: Arc<File>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        match lock_exclusive_nonblocking(&file) {
            Ok(true) => {
                debug!(path = %path.display(), "store.file_lock.acquired");
                Ok(Self { file, path })
            }
            Ok(false) => Err(StoreError::StoreLocked(path)),
            Err(err) => Err(StoreError::from(err)),
        }
    }

    /// Path of the locked file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(_err) = unlock(&self.file) {
            #[cfg(debug_assertions)]
            eprintln!("failed to unlock {}: {:?}", self.path.display(), _err);
        }
    }
}

/// Process-wide read/write lock guarding a data source's commits.
///
/// Commits and log rotation hold the write side; readers take recursive read
/// guards so a reader may re-enter while already holding one.
#[derive(Default)]
pub struct DataSourceLock {
    inner: RwLock<()>,
}

impl DataSourceLock {
    /// Creates an unlocked data source lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires a shared read guard.
    pub fn read(&self) -> RwLockReadGuard<'_, ()> {
        self.inner.read_recursive()
    }

    /// Acquires the exclusive write guard, blocking until readers drain.
    pub fn write(&self) -> RwLockWriteGuard<'_, ()> {
        self.inner.write()
    }

    /// True while some thread holds the write guard.
    pub fn is_write_locked(&self) -> bool {
        self.inner.is_locked_exclusive()
    }
}

fn lock_exclusive_nonblocking(file: &Arc<File>) -> io::Result<bool> {
    #[cfg(unix)]
    {
        unix::lock_file(file)
    }
    #[cfg(windows)]
    {
        windows::lock_file(file)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = file;
        Err(io::Error::new(
            io::ErrorKind::Other,
            "file locking unsupported on this platform",
        ))
    }
}

fn unlock(file: &Arc<File>) -> io::Result<()> {
    #[cfg(unix)]
    {
        unix::unlock_file(file)
    }
    #[cfg(windows)]
    {
        windows::unlock_file(file)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = file;
        Ok(())
    }
}

#[cfg(unix)]
mod unix {
    use super::*;
    use std::os::unix::io::AsRawFd;

    pub fn lock_file(file: &Arc<File>) -> io::Result<bool> {
        let fd = file.as_raw_fd();
        loop {
            let res = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
            if res == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(code) if code == libc::EWOULDBLOCK || code == libc::EAGAIN => {
                    return Ok(false)
                }
                _ => return Err(err),
            }
        }
    }

    pub fn unlock_file(file: &Arc<File>) -> io::Result<()> {
        let fd = file.as_raw_fd();
        let res = unsafe { libc::flock(fd, libc::LOCK_UN) };
        if res == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::*;
    use std::mem::zeroed;
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::ERROR_LOCK_VIOLATION;
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, UnlockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    pub fn lock_file(file: &Arc<File>) -> io::Result<bool> {
        unsafe {
            let handle = file.as_raw_handle();
            let mut overlapped: OVERLAPPED = zeroed();
            let flags = LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY;
            let res = LockFileEx(handle as isize, flags, 0, u32::MAX, u32::MAX, &mut overlapped);
            if res != 0 {
                Ok(true)
            } else {
                let err = io::Error::last_os_error();
                if matches!(err.raw_os_error(), Some(code) if code == ERROR_LOCK_VIOLATION as i32) {
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }

    pub fn unlock_file(file: &Arc<File>) -> io::Result<()> {
        unsafe {
            let handle = file.as_raw_handle();
            let mut overlapped: OVERLAPPED = zeroed();
            let res = UnlockFileEx(handle as isize, 0, u32::MAX, u32::MAX, &mut overlapped);
            if res != 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        }
    }
}
