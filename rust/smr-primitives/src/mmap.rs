//! File-backed shared mappings.
//!
//! Used both for whole provider regions shared between processes and for
//! the one-shot files that carry payloads too large for the inject pool.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::Region;

/// A `MAP_SHARED` mapping of a file.
pub struct MmapRegion {
    ptr: *mut u8,
    len: usize,
    /// Kept open for the lifetime of the mapping.
    #[allow(dead_code)]
    file: File,
    path: PathBuf,
    /// Unlink the file on drop.
    owns_file: bool,
}

impl MmapRegion {
    /// Create (or truncate) the file at `path`, size it to `size` bytes and
    /// map it. The file is created 0600 and is removed when this mapping is
    /// dropped unless ownership is released.
    pub fn create(path: &Path, size: usize) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "size must be > 0",
            ));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
        file.set_len(size as u64)?;

        let ptr = map_shared(&file, size)?;
        Ok(Self {
            ptr,
            len: size,
            file,
            path: path.to_path_buf(),
            owns_file: true,
        })
    }

    /// Map an existing file at its current size.
    pub fn attach(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len() as usize;
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "mapped file is empty",
            ));
        }
        let ptr = map_shared(&file, size)?;
        Ok(Self {
            ptr,
            len: size,
            file,
            path: path.to_path_buf(),
            owns_file: false,
        })
    }

    /// Map an existing file that must hold at least `len` bytes, mapping
    /// exactly `len`.
    pub fn attach_len(path: &Path, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "len must be > 0",
            ));
        }
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len() as usize;
        if size < len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                std::format!("mapped file holds {size} bytes, expected {len}"),
            ));
        }
        let ptr = map_shared(&file, len)?;
        Ok(Self {
            ptr,
            len,
            file,
            path: path.to_path_buf(),
            owns_file: false,
        })
    }

    #[inline]
    pub fn region(&self) -> Region {
        // SAFETY: the mapping is valid for the lifetime of MmapRegion
        unsafe { Region::from_raw(self.ptr, self.len) }
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the file on disk after this mapping is dropped.
    pub fn release_ownership(&mut self) {
        self.owns_file = false;
    }
}

fn map_shared(file: &File, len: usize) -> io::Result<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(ptr as *mut u8)
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
        if self.owns_file {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}

/// Unlink `path`, treating a missing file as success.
pub fn remove_if_exists(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
