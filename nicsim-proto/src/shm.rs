//! File-backed shared memory pool.
//!
//! The listener creates the file, truncates it to the pool size and maps it
//! shared; queue slot arrays are then carved from it sequentially. The
//! connecter maps an fd received via `SCM_RIGHTS` during the handshake.

use std::fs::OpenOptions;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use nix::libc;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::unistd::ftruncate;
use tracing::debug;

use crate::{Error, Result};

pub struct ShmPool {
    path: Option<PathBuf>,
    file: OwnedFd,
    base: NonNull<libc::c_void>,
    size: usize,
    pos: usize,
}

// Safety: the mapping is only touched through methods taking &self/&mut self;
// cross-process access is mediated by the per-slot ownership octet.
unsafe impl Send for ShmPool {}

impl ShmPool {
    /// Create, size and map a new pool file, zero-filled.
    pub fn create(path: &Path, size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        ftruncate(&file, size as libc::off_t)?;

        let base = unsafe {
            mmap(
                None,
                NonZeroUsize::new(size).ok_or(Error::PoolExhausted)?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED | MapFlags::MAP_POPULATE,
                &file,
                0,
            )?
        };
        unsafe { std::ptr::write_bytes(base.as_ptr() as *mut u8, 0, size) };

        debug!(path = %path.display(), size, "created shm pool");
        Ok(ShmPool {
            path: Some(path.to_path_buf()),
            file: OwnedFd::from(file),
            base,
            size,
            pos: 0,
        })
    }

    /// Map an existing pool from a received file descriptor.
    pub fn map_fd(fd: OwnedFd) -> Result<Self> {
        let stat = nix::sys::stat::fstat(fd.as_fd())?;
        let size = stat.st_size as usize;

        let base = unsafe {
            mmap(
                None,
                NonZeroUsize::new(size).ok_or(Error::PoolExhausted)?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )?
        };

        debug!(size, "mapped shm pool from fd");
        Ok(ShmPool {
            path: None,
            file: fd,
            base,
            size,
            pos: 0,
        })
    }

    /// Map an existing pool by path (mainly for tests).
    pub fn map_path(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::map_fd(OwnedFd::from(file))
    }

    /// Carve `n * entry_size` bytes for a slot array, returning its pool offset.
    pub fn carve(&mut self, n: usize, entry_size: usize) -> Result<usize> {
        let len = n * entry_size;
        if self.pos + len > self.size {
            return Err(Error::PoolExhausted);
        }
        let off = self.pos;
        self.pos += len;
        Ok(off)
    }

    /// Pointer to the slot array starting at `offset`.
    ///
    /// The caller must keep accesses within the mapping; offsets come from
    /// `carve` or from the peer's intro, both bounded by the pool size.
    pub fn at(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset < self.size);
        unsafe { (self.base.as_ptr() as *mut u8).add(offset) }
    }

    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Remove the backing file. The mapping stays usable.
    pub fn unlink(&self) -> Result<()> {
        if let Some(ref path) = self.path {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

impl Drop for ShmPool {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.base, self.size);
        }
    }
}
