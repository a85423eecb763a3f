//! # Owned Memory Mappings
//!
//! ## Purpose
//!
//! This module owns every memory-mapped region used by the crate: the pinned frame
//! pool buffer and the four kernel-shared rings. Owning the mapping in one type keeps
//! the `munmap` in a single place and lets teardown release regions in a chosen order.
//!
//! ## How it works
//!
//! `OwnedMmap` wraps a raw pointer and a length. `mmap` creates an anonymous,
//! page-aligned region (optionally huge-page backed) for the frame pool, `mmap_shared`
//! maps a region of a socket descriptor at a kernel page offset for a ring. `Drop`
//! unmaps; `unmap` does the same eagerly and reports the failure instead of logging it.
//! A null pointer marks a non-owning view, which is never unmapped.
//!
//! ## Main components
//!
//! - `OwnedMmap`: owner of a mapped region.
//! - `get_hugepage_info()`: parses `/proc/meminfo` to decide on huge page backing.

use std::fs::File;
use std::io::{BufRead as _, BufReader};
use std::os::fd::RawFd;
use std::{io, ptr};

const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// A memory-mapped region, unmapped when dropped.
pub struct OwnedMmap(
    /// Start of the mapped area; null for a non-owning view.
    pub *mut libc::c_void,
    /// Size of the mapped area in bytes.
    pub usize,
);

// The region is plain memory owned by this value; moving it to another thread is sound.
unsafe impl Send for OwnedMmap {}

impl OwnedMmap {
    /// A view that owns nothing and is never unmapped.
    pub(crate) fn unowned() -> Self {
        OwnedMmap(ptr::null_mut(), 0)
    }

    /// Allocates an anonymous, private, page-aligned region of at least `size` bytes.
    ///
    /// With `huge_page == None` huge pages are used when `/proc/meminfo` reports free
    /// 2 MiB pages.
    pub fn mmap(size: usize, huge_page: Option<bool>) -> io::Result<Self> {
        let huge_tlb = match huge_page {
            Some(yes) => yes,
            None => {
                let info = get_hugepage_info()?;
                matches!((info.free, info.size_kb), (Some(x), Some(2048)) if x > 0)
            }
        };
        let page_size = if huge_tlb {
            HUGE_PAGE_SIZE
        } else {
            unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
        };
        let aligned_size = size
            .checked_add(page_size - 1)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "mapping size overflows"))?
            & !(page_size - 1);
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                aligned_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE
                    | libc::MAP_ANONYMOUS
                    | if huge_tlb {
                        libc::MAP_HUGETLB | libc::MAP_HUGE_2MB
                    } else {
                        0
                    },
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        log::debug!("mapped {aligned_size} bytes (huge pages: {huge_tlb})");
        Ok(OwnedMmap(ptr, aligned_size))
    }

    /// Maps `size` bytes of `fd` at page offset `offset` with `MAP_SHARED | MAP_POPULATE`.
    pub fn mmap_shared(fd: RawFd, size: usize, offset: libc::off_t) -> io::Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                fd,
                offset,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(OwnedMmap(ptr, size))
    }

    pub fn as_void_ptr(&self) -> *mut libc::c_void {
        self.0
    }

    pub fn as_u8_ptr(&self) -> *mut u8 {
        self.0 as *mut u8
    }

    pub fn len(&self) -> usize {
        self.1
    }

    pub fn is_empty(&self) -> bool {
        self.1 == 0
    }

    /// Unmaps the region now, returning the `munmap` error if there is one.
    pub fn unmap(mut self) -> io::Result<()> {
        let res = self.release();
        // already released; keep Drop from trying again
        self.0 = ptr::null_mut();
        res
    }

    fn release(&mut self) -> io::Result<()> {
        if self.0.is_null() || self.0 == libc::MAP_FAILED {
            return Ok(());
        }
        if unsafe { libc::munmap(self.0, self.1) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for OwnedMmap {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::error!("Failed to unmap memory: {e}");
        }
    }
}

/// Huge page configuration of the system.
#[derive(Debug, Default)]
pub struct HugePageInfo {
    /// Size of a huge page in kilobytes.
    pub size_kb: Option<u64>,
    /// Total number of huge pages configured.
    pub total: Option<u64>,
    /// Number of free huge pages.
    pub free: Option<u64>,
}

/// Reads `Hugepagesize`, `HugePages_Total` and `HugePages_Free` from `/proc/meminfo`.
pub fn get_hugepage_info() -> io::Result<HugePageInfo> {
    let reader = BufReader::new(File::open("/proc/meminfo")?);
    let mut info = HugePageInfo::default();
    for line in reader.lines() {
        let line = line?;
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().trim_end_matches(" kB");
        match key.trim() {
            "Hugepagesize" => info.size_kb = Some(value.parse().map_err(io::Error::other)?),
            "HugePages_Total" => info.total = Some(value.parse().map_err(io::Error::other)?),
            "HugePages_Free" => info.free = Some(value.parse().map_err(io::Error::other)?),
            _ => {}
        }
    }
    Ok(info)
}
