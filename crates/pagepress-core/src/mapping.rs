//! File mappings and page-granularity usage advice.
//!
//! Wraps a shared read-only `mmap` of a file (or a private anonymous
//! region) together with the open file descriptor, so callers can touch
//! pages either through the mapping or through the file API, and can advise
//! the kernel about the intended access pattern of page ranges.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;

use rand::RngCore;

use crate::error::{Error, Result};
use crate::sys;

/// Block size used when filling the eviction file with random bytes.
const RANDOM_FILL_BLOCK: usize = 1024 * 1024;

/// Usage advice for a page range, forwarded to `madvise` and, when a file
/// descriptor is present, `posix_fadvise`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advice {
    Normal,
    Random,
    Sequential,
    WillNeed,
    DontNeed,
}

impl Advice {
    fn madvise(self) -> libc::c_int {
        match self {
            Advice::Normal => libc::MADV_NORMAL,
            Advice::Random => libc::MADV_RANDOM,
            Advice::Sequential => libc::MADV_SEQUENTIAL,
            Advice::WillNeed => libc::MADV_WILLNEED,
            Advice::DontNeed => libc::MADV_DONTNEED,
        }
    }

    fn fadvise(self) -> libc::c_int {
        match self {
            Advice::Normal => libc::POSIX_FADV_NORMAL,
            Advice::Random => libc::POSIX_FADV_RANDOM,
            Advice::Sequential => libc::POSIX_FADV_SEQUENTIAL,
            Advice::WillNeed => libc::POSIX_FADV_WILLNEED,
            Advice::DontNeed => libc::POSIX_FADV_DONTNEED,
        }
    }
}

/// A mapped file (shared, read-only) or anonymous region.
///
/// Keeps both the mapping and the file descriptor alive so residency
/// queries and both page-touch flavours work for the whole lifetime.
pub struct FileMapping {
    addr: *mut u8,
    size: usize,
    size_pages: usize,
    file: Option<File>,
}

// The mapping is shared and read-only (anonymous regions are written only
// through `touch_page`, one byte at a time, with no aliasing guarantees
// required). Concurrent access from worker threads is the point.
unsafe impl Send for FileMapping {}
unsafe impl Sync for FileMapping {}

impl FileMapping {
    /// Map `path` shared read-only. Opens with `O_NOATIME` when permitted so
    /// scanning does not perturb access times.
    pub fn map_file(path: &Path) -> Result<Self> {
        let file = match OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NOATIME)
            .open(path)
        {
            Ok(f) => f,
            // O_NOATIME is only allowed for the file owner.
            Err(e) if e.raw_os_error() == Some(libc::EPERM) => {
                File::open(path).map_err(|e| Error::io(path, e))?
            }
            Err(e) => return Err(Error::io(path, e)),
        };

        let size = file.metadata().map_err(|e| Error::io(path, e))?.len() as usize;
        if size == 0 {
            return Err(Error::io(
                path,
                io::Error::new(io::ErrorKind::InvalidInput, "empty file"),
            ));
        }

        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::io(path, io::Error::last_os_error()));
        }

        let page = sys::page_size();
        Ok(Self {
            addr: addr as *mut u8,
            size,
            size_pages: size.div_ceil(page),
            file: Some(file),
        })
    }

    /// Map a private anonymous region of `size` bytes without reserving
    /// backing store.
    pub fn map_anon(size: usize) -> Result<Self> {
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::Sys(io::Error::last_os_error()));
        }

        let page = sys::page_size();
        Ok(Self {
            addr: addr as *mut u8,
            size,
            size_pages: size.div_ceil(page),
            file: None,
        })
    }

    /// Mapping size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Mapping size in pages (last page may be partial).
    pub fn size_pages(&self) -> usize {
        self.size_pages
    }

    pub(crate) fn addr(&self) -> *mut u8 {
        self.addr
    }

    pub(crate) fn file(&self) -> Option<&File> {
        self.file.as_ref()
    }

    /// Advise the kernel about the usage of a byte range. `len == 0` means
    /// the rest of the mapping. The range is clamped to the mapping.
    pub fn advise(&self, offset: usize, len: usize, advice: Advice) -> io::Result<()> {
        if offset >= self.size {
            return Ok(());
        }
        let len = if len == 0 {
            self.size - offset
        } else {
            len.min(self.size - offset)
        };

        let ret = unsafe {
            libc::madvise(
                self.addr.add(offset) as *mut libc::c_void,
                len,
                advice.madvise(),
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }

        if let Some(file) = &self.file {
            let err = unsafe {
                libc::posix_fadvise(
                    file.as_raw_fd(),
                    offset as libc::off_t,
                    len as libc::off_t,
                    advice.fadvise(),
                )
            };
            if err != 0 {
                return Err(io::Error::from_raw_os_error(err));
            }
        }
        Ok(())
    }

    /// Touch a page by dereferencing the mapping.
    pub fn touch_page(&self, page: usize) {
        debug_assert!(page < self.size_pages);
        unsafe {
            std::ptr::read_volatile(self.addr.add(page * sys::page_size()));
        }
    }

    /// Touch a page through the file API: two 1-byte reads, which exercises
    /// the kernel's access heuristics harder than a single fault.
    pub fn read_page_twice(&self, page: usize) -> io::Result<()> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "anonymous mapping"))?;
        let offset = (page * sys::page_size()) as u64;
        let mut byte = [0u8; 1];
        file.read_at(&mut byte, offset)?;
        file.read_at(&mut byte, offset)?;
        Ok(())
    }
}

impl Drop for FileMapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.addr as *mut libc::c_void, self.size);
        }
    }
}

/// Create `path` as a file of at least `size` random bytes.
///
/// Idempotent: an existing file that is already large enough is reused.
/// The content is dense random data so the kernel cannot deduplicate or
/// compress the pages away.
pub fn create_random_file(path: &Path, size: usize) -> Result<()> {
    if let Ok(meta) = std::fs::metadata(path) {
        if meta.is_file() && meta.len() as usize >= size {
            return Ok(());
        }
    }

    // Refuse up front if the filesystem cannot hold the file.
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let dir = dir.unwrap_or(Path::new("."));
    let free = free_disk_space(dir)?;
    if free < size as u64 {
        return Err(Error::io(
            path,
            io::Error::new(io::ErrorKind::StorageFull, "not enough free disk space"),
        ));
    }

    let file = File::create(path).map_err(|e| Error::io(path, e))?;
    let mut rng = rand::rng();
    let mut block = vec![0u8; RANDOM_FILL_BLOCK];
    let mut written = 0usize;
    while written < size {
        rng.fill_bytes(&mut block);
        let chunk = RANDOM_FILL_BLOCK.min(size - written);
        file.write_all_at(&block[..chunk], written as u64)
            .map_err(|e| Error::io(path, e))?;
        written += chunk;
    }
    file.sync_all().map_err(|e| Error::io(path, e))?;
    Ok(())
}

fn free_disk_space(dir: &Path) -> Result<u64> {
    use std::os::unix::ffi::OsStrExt;
    let cstr = std::ffi::CString::new(dir.as_os_str().as_bytes())
        .map_err(|_| Error::Environment("path contains NUL".into()))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(cstr.as_ptr(), &mut stat) } != 0 {
        return Err(Error::io(dir, io::Error::last_os_error()));
    }
    Ok(stat.f_bsize as u64 * stat.f_bavail as u64)
}
