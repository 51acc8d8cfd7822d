//! Page-cache residency sampling.
//!
//! Answers, per file page, "is this page currently cached in RAM?". The
//! source of that answer is chosen once at startup and never changed
//! mid-run; all call sites dispatch through [`CacheSampler`].
//!
//! Sources are best-effort consistent with the OS page cache. Callers must
//! tolerate stale readings; a failed query is a sampling error.

use std::io;
use std::os::fd::AsRawFd;
use std::time::Instant;

use crate::error::{Error, Result};
use crate::mapping::FileMapping;
use crate::sys;

/// Access latency below this threshold classifies a page as cached for the
/// [`CacheSampler::AccessTiming`] source.
pub const DISK_ACCESS_THRESHOLD_NS: u64 = 1_000;

/// How residency is queried. Selected once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheSampler {
    /// `mincore(2)` on the shared mapping. Ground truth on Linux.
    #[default]
    Mincore,
    /// Non-blocking 1-byte `preadv2(RWF_NOWAIT)` per page; `EAGAIN` means
    /// the page is not resident.
    PreadNowait,
    /// Read one byte and classify by latency against
    /// [`DISK_ACCESS_THRESHOLD_NS`]. Destructive: the probe itself caches
    /// the page.
    AccessTiming,
}

impl CacheSampler {
    /// Residency of `len_pages` pages starting at page `offset_pages`.
    /// Bit 0 of each returned byte is set iff the page is cached.
    pub fn status_range(
        self,
        mapping: &FileMapping,
        offset_pages: usize,
        len_pages: usize,
    ) -> Result<Vec<u8>> {
        let size_pages = mapping.size_pages();
        if offset_pages > size_pages || len_pages > size_pages - offset_pages {
            return Err(Error::Sampling(io::Error::new(
                io::ErrorKind::InvalidInput,
                "page range outside mapping",
            )));
        }
        if len_pages == 0 {
            return Ok(Vec::new());
        }

        match self {
            CacheSampler::Mincore => mincore_range(mapping, offset_pages, len_pages),
            CacheSampler::PreadNowait => {
                let mut status = vec![0u8; len_pages];
                for (i, byte) in status.iter_mut().enumerate() {
                    *byte = pread_nowait_page(mapping, offset_pages + i)?;
                }
                Ok(status)
            }
            CacheSampler::AccessTiming => {
                let mut status = vec![0u8; len_pages];
                for (i, byte) in status.iter_mut().enumerate() {
                    *byte = timing_page(mapping, offset_pages + i)?;
                }
                Ok(status)
            }
        }
    }

    /// Residency of a single page.
    pub fn status_page(self, mapping: &FileMapping, offset_pages: usize) -> Result<u8> {
        Ok(self.status_range(mapping, offset_pages, 1)?[0])
    }
}

/// Number of cached pages in a status vector.
pub fn count_cached(status: &[u8]) -> usize {
    status.iter().filter(|&&s| s & 1 == 1).count()
}

fn mincore_range(mapping: &FileMapping, offset_pages: usize, len_pages: usize) -> Result<Vec<u8>> {
    let page = sys::page_size();
    let offset = offset_pages * page;
    // The mapping covers the exact file size; clamp the last partial page.
    let len = (len_pages * page).min(mapping.size() - offset);

    let mut status = vec![0u8; len_pages];
    let ret = unsafe {
        libc::mincore(
            mapping.addr().add(offset) as *mut libc::c_void,
            len,
            status.as_mut_ptr() as *mut libc::c_uchar,
        )
    };
    if ret != 0 {
        return Err(Error::Sampling(io::Error::last_os_error()));
    }
    Ok(status)
}

fn pread_nowait_page(mapping: &FileMapping, page: usize) -> Result<u8> {
    let file = mapping.file().ok_or_else(|| {
        Error::Sampling(io::Error::new(
            io::ErrorKind::Unsupported,
            "preadv2 source needs a file-backed mapping",
        ))
    })?;

    let mut byte: u8 = 0;
    let iov = libc::iovec {
        iov_base: &mut byte as *mut u8 as *mut libc::c_void,
        iov_len: 1,
    };
    let offset = (page * sys::page_size()) as libc::off_t;
    loop {
        let ret = unsafe { libc::preadv2(file.as_raw_fd(), &iov, 1, offset, libc::RWF_NOWAIT) };
        if ret >= 1 {
            return Ok(1);
        }
        if ret == 0 {
            // Read past EOF within the mapped range: nothing cached there.
            return Ok(0);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) => return Ok(0),
            Some(libc::EINTR) => continue,
            _ => return Err(Error::Sampling(err)),
        }
    }
}

fn timing_page(mapping: &FileMapping, page: usize) -> Result<u8> {
    use std::os::unix::fs::FileExt;

    let file = mapping.file().ok_or_else(|| {
        Error::Sampling(io::Error::new(
            io::ErrorKind::Unsupported,
            "access-timing source needs a file-backed mapping",
        ))
    })?;
    let mut byte = [0u8; 1];
    let t0 = Instant::now();
    file.read_at(&mut byte, (page * sys::page_size()) as u64)
        .map_err(Error::Sampling)?;
    let elapsed = t0.elapsed().as_nanos() as u64;
    Ok(u8::from(elapsed < DISK_ACCESS_THRESHOLD_NS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn mapped_scratch(pages: usize) -> (tempfile::TempDir, FileMapping) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scratch");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&vec![7u8; pages * sys::page_size()]).unwrap();
        f.sync_all().unwrap();
        let m = FileMapping::map_file(&path).unwrap();
        (dir, m)
    }

    #[test]
    fn mincore_reports_touched_pages_as_cached() {
        let (_dir, m) = mapped_scratch(4);
        m.touch_page(2);
        let status = CacheSampler::Mincore.status_range(&m, 0, 4).unwrap();
        assert_eq!(status.len(), 4);
        assert_eq!(status[2] & 1, 1);
    }

    #[test]
    fn status_page_matches_status_range() {
        let (_dir, m) = mapped_scratch(3);
        m.touch_page(1);
        let range = CacheSampler::Mincore.status_range(&m, 0, 3).unwrap();
        for p in 0..3 {
            let single = CacheSampler::Mincore.status_page(&m, p).unwrap();
            assert_eq!(single & 1, range[p] & 1);
        }
    }

    #[test]
    fn out_of_bounds_range_is_a_sampling_error() {
        let (_dir, m) = mapped_scratch(2);
        assert!(CacheSampler::Mincore.status_range(&m, 1, 2).is_err());
        assert!(CacheSampler::Mincore.status_range(&m, 3, 1).is_err());
    }

    #[test]
    fn pread_nowait_sees_written_pages() {
        let (_dir, m) = mapped_scratch(2);
        // Freshly written file contents are in the page cache.
        let status = CacheSampler::PreadNowait.status_range(&m, 0, 2).unwrap();
        assert_eq!(status.len(), 2);
    }

    #[test]
    fn count_cached_counts_low_bits_only() {
        assert_eq!(count_cached(&[0, 1, 2, 3, 0xFF, 0]), 3);
        assert_eq!(count_cached(&[]), 0);
    }
}
