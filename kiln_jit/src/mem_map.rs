//! Page-granular memory mappings.
//!
//! Thin RAII layer over `mmap`/`mprotect`/`munmap`. Every executable byte the
//! cache hands out, and every container the loader maps, lives in a
//! [`MemMap`].
//!
//! # Safety
//! Mapping memory is inherently unsafe. This module keeps the raw syscalls in
//! one place; callers still have to uphold aliasing rules for what they write
//! through the returned pointers.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::ptr::{self, NonNull};
use std::sync::OnceLock;

use bitflags::bitflags;

use crate::error::RegionError;

bitflags! {
    /// Page protection bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;

        const RW = Self::READ.bits() | Self::WRITE.bits();
        const RX = Self::READ.bits() | Self::EXEC.bits();
    }
}

impl Protection {
    fn to_prot(self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.contains(Protection::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(Protection::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if self.contains(Protection::EXEC) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

/// OS page size, queried once.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size <= 0 { 4096 } else { size as usize }
    })
}

/// Round `value` up to a multiple of `align` (a power of two).
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Round `value` down to a multiple of `align` (a power of two).
#[inline]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

// =============================================================================
// MemMap
// =============================================================================

/// A page-aligned mapping.
///
/// Owning maps unmap their range on drop. Views created with one of the
/// `*_fixed` constructors replace pages inside a range owned by someone else
/// and never unmap.
#[derive(Debug)]
pub struct MemMap {
    ptr: NonNull<u8>,
    len: usize,
    owned: bool,
}

// SAFETY: a MemMap is a plain address range; synchronising access to the
// bytes is the owner's job.
unsafe impl Send for MemMap {}
unsafe impl Sync for MemMap {}

impl MemMap {
    /// Map `len` bytes of zeroed anonymous memory.
    ///
    /// Shared anonymous memory stays shared with forked children.
    pub fn anonymous(len: usize, prot: Protection, shared: bool) -> Result<Self, RegionError> {
        let flags = libc::MAP_ANONYMOUS | if shared { libc::MAP_SHARED } else { libc::MAP_PRIVATE };
        // SAFETY: a null hint lets the kernel choose the address.
        unsafe { Self::map_raw(ptr::null_mut(), len, prot, flags, -1, 0, true) }
    }

    /// Reserve address space without committing memory.
    pub fn reserve(len: usize) -> Result<Self, RegionError> {
        let flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_NORESERVE;
        // SAFETY: a null hint lets the kernel choose the address.
        unsafe {
            Self::map_raw(
                ptr::null_mut(),
                len,
                Protection::empty(),
                flags,
                -1,
                0,
                true,
            )
        }
    }

    /// Map `len` bytes of `fd` starting at `offset`.
    pub fn map_fd(
        fd: BorrowedFd<'_>,
        offset: u64,
        len: usize,
        prot: Protection,
        shared: bool,
    ) -> Result<Self, RegionError> {
        let flags = if shared { libc::MAP_SHARED } else { libc::MAP_PRIVATE };
        // SAFETY: a null hint lets the kernel choose the address.
        unsafe {
            Self::map_raw(
                ptr::null_mut(),
                len,
                prot,
                flags,
                fd.as_raw_fd(),
                offset as libc::off_t,
                true,
            )
        }
    }

    /// Map `len` bytes of `fd` at exactly `addr`, replacing what was there.
    ///
    /// # Safety
    /// `addr..addr + len` must be page aligned and lie inside a mapping the
    /// caller owns and nobody else references.
    pub unsafe fn map_fd_fixed(
        addr: *mut u8,
        fd: BorrowedFd<'_>,
        offset: u64,
        len: usize,
        prot: Protection,
        shared: bool,
    ) -> Result<Self, RegionError> {
        let flags = libc::MAP_FIXED | if shared { libc::MAP_SHARED } else { libc::MAP_PRIVATE };
        unsafe {
            Self::map_raw(
                addr,
                len,
                prot,
                flags,
                fd.as_raw_fd(),
                offset as libc::off_t,
                false,
            )
        }
    }

    /// Map zeroed anonymous memory at exactly `addr`.
    ///
    /// # Safety
    /// Same as [`MemMap::map_fd_fixed`].
    pub unsafe fn anonymous_fixed(
        addr: *mut u8,
        len: usize,
        prot: Protection,
        shared: bool,
    ) -> Result<Self, RegionError> {
        let flags = libc::MAP_ANONYMOUS
            | libc::MAP_FIXED
            | if shared { libc::MAP_SHARED } else { libc::MAP_PRIVATE };
        unsafe { Self::map_raw(addr, len, prot, flags, -1, 0, false) }
    }

    /// Wrap an existing range without taking ownership.
    ///
    /// # Safety
    /// The range must stay mapped for as long as the view is used.
    pub unsafe fn view(begin: *mut u8, len: usize) -> Option<Self> {
        Some(Self {
            ptr: NonNull::new(begin)?,
            len,
            owned: false,
        })
    }

    unsafe fn map_raw(
        addr: *mut u8,
        len: usize,
        prot: Protection,
        flags: libc::c_int,
        fd: libc::c_int,
        offset: libc::off_t,
        owned: bool,
    ) -> Result<Self, RegionError> {
        if len == 0 {
            return Err(RegionError::InvalidSize(len));
        }
        let len = align_up(len, page_size());
        // SAFETY: arguments are forwarded from callers that uphold the
        // fixed-address contract; non-fixed calls cannot clobber memory.
        let raw = unsafe { libc::mmap(addr.cast(), len, prot.to_prot(), flags, fd, offset) };
        if raw == libc::MAP_FAILED {
            return Err(RegionError::MapFailed {
                size: len,
                source: io::Error::last_os_error(),
            });
        }
        let ptr = NonNull::new(raw.cast::<u8>()).ok_or(RegionError::MapFailed {
            size: len,
            source: io::Error::from(io::ErrorKind::AddrNotAvailable),
        })?;
        Ok(Self { ptr, len, owned })
    }

    /// First byte of the mapping.
    #[inline]
    pub fn begin(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// One past the last byte of the mapping.
    #[inline]
    pub fn end(&self) -> *mut u8 {
        // SAFETY: len bytes starting at ptr are mapped.
        unsafe { self.ptr.as_ptr().add(self.len) }
    }

    /// Mapped length (page aligned).
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; mappings are never empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `addr` lies inside the mapping.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        let begin = self.begin() as usize;
        addr >= begin && addr < begin + self.len
    }

    /// Change the protection of the whole mapping.
    pub fn protect(&self, prot: Protection) -> Result<(), RegionError> {
        protect_range(self.begin() as usize, self.len, prot)
    }

    /// Tell the kernel it may drop the pages backing `offset..offset + len`.
    ///
    /// Anonymous private pages read back as zero afterwards.
    pub fn advise_dontneed(&self, offset: usize, len: usize) {
        debug_assert!(offset + len <= self.len);
        // SAFETY: the range is inside this mapping.
        let rc = unsafe {
            libc::madvise(
                self.begin().add(offset).cast(),
                len,
                libc::MADV_DONTNEED,
            )
        };
        if rc != 0 {
            tracing::debug!(
                error = %io::Error::last_os_error(),
                offset,
                len,
                "madvise(DONTNEED) failed"
            );
        }
    }
}

impl Drop for MemMap {
    fn drop(&mut self) {
        if self.owned {
            // SAFETY: we own the range and nobody can reference it anymore.
            unsafe {
                libc::munmap(self.ptr.as_ptr().cast(), self.len);
            }
        }
    }
}

/// Change protection of an arbitrary page-aligned range.
pub fn protect_range(addr: usize, len: usize, prot: Protection) -> Result<(), RegionError> {
    let begin = align_down(addr, page_size());
    let size = align_up(addr + len, page_size()) - begin;
    // SAFETY: mprotect only changes permissions; callers pass ranges they own.
    let rc = unsafe { libc::mprotect(begin as *mut libc::c_void, size, prot.to_prot()) };
    if rc != 0 {
        return Err(RegionError::ProtectFailed {
            addr: begin,
            size,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}
