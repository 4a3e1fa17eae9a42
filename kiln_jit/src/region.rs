//! Executable memory region of the code cache.
//!
//! # Layout
//!
//! ```text
//!            one reserved window (max_capacity bytes)
//! ┌──────────────────────────────┬──────────────────────────────┐
//! │ exec (RX)                    │ data (RW)                    │
//! │ headers + machine code       │ root tables, stack maps,     │
//! │                              │ profiling records, zygote map│
//! └──────────────────────────────┴──────────────────────────────┘
//!        ▲
//!        │ same pages (memfd)
//! ┌──────┴───────────────────────┐
//! │ alias (RW), private to us    │
//! └──────────────────────────────┘
//! ```
//!
//! Code and data live in one window so that every code-to-data offset fits in
//! 32 bits. Code is never written through `exec`: with a dual view writes go
//! through the RW alias, otherwise the touched pages are re-protected for the
//! duration of the write by a [`ScopedCodeWrite`].
//!
//! The usable part of each half grows by doubling up to the configured
//! maximum; the rest of the window stays reserved but untouched.

use std::io;
use std::os::fd::{AsFd, FromRawFd, OwnedFd};
use std::ptr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::RegionError;
use crate::mem_map::{MemMap, Protection, align_down, align_up, page_size, protect_range};

/// Options used to create a [`MemoryRegion`].
#[derive(Debug, Clone, Copy)]
pub struct RegionOptions {
    /// Usable bytes (code + data) at creation.
    pub initial_capacity: usize,
    /// Usable bytes the region may grow to; also the reserved window size.
    pub max_capacity: usize,
    /// Try to set up an RW alias of the code pages.
    pub dual_view: bool,
    /// Map everything shared so forked children inherit the pages.
    pub shared: bool,
    /// Never hand freed pages back to the kernel.
    pub lazy_release_bug: bool,
}

// =============================================================================
// MemoryRegion
// =============================================================================

/// A code arena and a data arena carved out of one reserved window.
#[derive(Debug)]
pub struct MemoryRegion {
    window: MemMap,
    exec: MemMap,
    data: MemMap,
    /// RW view of the `exec` pages, present with a dual view.
    alias: Option<MemMap>,
    /// Backing file of the dual view.
    backing: Option<OwnedFd>,
    capacity: AtomicUsize,
    max_capacity: usize,
    shared: bool,
    lazy_release_bug: bool,
    read_only: AtomicBool,
}

impl MemoryRegion {
    /// Reserve the window and map both arenas.
    pub fn new(options: RegionOptions) -> Result<Self, RegionError> {
        let granule = 2 * page_size();
        if options.max_capacity == 0
            || options.max_capacity % granule != 0
            || options.initial_capacity > options.max_capacity
        {
            return Err(RegionError::InvalidSize(options.max_capacity));
        }
        let half = options.max_capacity / 2;
        let window = MemMap::reserve(options.max_capacity)?;
        let exec_begin = window.begin();
        // SAFETY: the second half lies inside the window we just reserved.
        let data_begin = unsafe { exec_begin.add(half) };

        let mut backing = None;
        let mut alias = None;
        let exec = if options.dual_view {
            match create_backing_file(half) {
                Ok(fd) => {
                    // SAFETY: `exec_begin..+half` is ours and unused.
                    let exec = unsafe {
                        MemMap::map_fd_fixed(exec_begin, fd.as_fd(), 0, half, Protection::RX, true)
                    }?;
                    alias = Some(MemMap::map_fd(fd.as_fd(), 0, half, Protection::RW, true)?);
                    backing = Some(fd);
                    exec
                }
                Err(err) => {
                    tracing::info!(error = %err, "dual view unavailable, using re-protection");
                    // SAFETY: as above.
                    unsafe { MemMap::anonymous_fixed(exec_begin, half, Protection::RX, options.shared) }?
                }
            }
        } else {
            // SAFETY: as above.
            unsafe { MemMap::anonymous_fixed(exec_begin, half, Protection::RX, options.shared) }?
        };
        // SAFETY: as above.
        let data =
            unsafe { MemMap::anonymous_fixed(data_begin, half, Protection::RW, options.shared) }?;

        tracing::debug!(
            exec = ?exec.begin(),
            data = ?data.begin(),
            capacity = options.initial_capacity,
            max_capacity = options.max_capacity,
            dual_view = alias.is_some(),
            shared = options.shared,
            "created code cache region"
        );

        Ok(Self {
            window,
            exec,
            data,
            alias,
            backing,
            capacity: AtomicUsize::new(options.initial_capacity),
            max_capacity: options.max_capacity,
            shared: options.shared,
            lazy_release_bug: options.lazy_release_bug,
            read_only: AtomicBool::new(false),
        })
    }

    // =========================================================================
    // Geometry
    // =========================================================================

    #[inline]
    pub fn exec_begin(&self) -> usize {
        self.exec.begin() as usize
    }

    #[inline]
    pub fn data_begin(&self) -> usize {
        self.data.begin() as usize
    }

    /// Reserved bytes per arena.
    #[inline]
    pub fn arena_size(&self) -> usize {
        self.exec.len()
    }

    /// Current usable bytes, code and data together.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Current usable bytes of the code arena.
    #[inline]
    pub fn code_capacity(&self) -> usize {
        self.capacity() / 2
    }

    /// Current usable bytes of the data arena.
    #[inline]
    pub fn data_capacity(&self) -> usize {
        self.capacity() / 2
    }

    #[inline]
    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// Whether children forked from this process share the pages.
    #[inline]
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Whether the region was frozen by [`MemoryRegion::protect_read_only`].
    #[inline]
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    #[inline]
    pub fn has_dual_view(&self) -> bool {
        self.alias.is_some()
    }

    #[inline]
    pub fn in_exec(&self, addr: usize) -> bool {
        self.exec.contains(addr)
    }

    #[inline]
    pub fn in_data(&self, addr: usize) -> bool {
        self.data.contains(addr)
    }

    #[inline]
    pub fn own_space(&self, addr: usize) -> bool {
        self.window.contains(addr)
    }

    /// Double the usable size, capped at the maximum.
    ///
    /// Returns false when the region is already at its maximum.
    pub fn increase_capacity(&self) -> bool {
        let current = self.capacity();
        if current >= self.max_capacity {
            return false;
        }
        let granule = 2 * page_size();
        let next = (current.max(granule) * 2).min(self.max_capacity);
        self.capacity.store(next, Ordering::Release);
        tracing::info!(from = current, to = next, "increased code cache capacity");
        true
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Copy `bytes` to the code arena at `dst` without flushing.
    ///
    /// # Panics
    /// Panics when the pages cannot be re-protected; the process cannot
    /// continue with half-written code.
    pub fn write_code(&self, dst: usize, bytes: &[u8]) {
        assert!(
            self.in_exec(dst) && self.in_exec(dst + bytes.len().max(1) - 1),
            "code write outside the exec arena"
        );
        assert!(!self.is_read_only(), "code write into a frozen region");
        match &self.alias {
            Some(alias) => {
                let offset = dst - self.exec_begin();
                // SAFETY: the alias maps the same pages as `exec`, and the
                // destination range is inside it.
                unsafe {
                    ptr::copy_nonoverlapping(bytes.as_ptr(), alias.begin().add(offset), bytes.len());
                }
            }
            None => {
                let _guard = ScopedCodeWrite::new(dst, bytes.len());
                // SAFETY: the guard made the range writable.
                unsafe {
                    ptr::copy_nonoverlapping(bytes.as_ptr(), dst as *mut u8, bytes.len());
                }
            }
        }
    }

    /// Copy `bytes` to the code arena and make them visible to every core.
    pub fn commit_code(&self, dst: usize, bytes: &[u8]) {
        self.write_code(dst, bytes);
        flush_instruction_cache(dst, bytes.len());
    }

    /// Copy `bytes` to the data arena at `dst`.
    pub fn write_data(&self, dst: usize, bytes: &[u8]) {
        assert!(
            self.in_data(dst) && self.in_data(dst + bytes.len().max(1) - 1),
            "data write outside the data arena"
        );
        assert!(!self.is_read_only(), "data write into a frozen region");
        // SAFETY: the data arena is RW and the range is inside it.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), dst as *mut u8, bytes.len());
        }
    }

    /// Hand `addr..addr + len` back to the kernel.
    ///
    /// The range must be page aligned and unused. Shared regions and kernels
    /// with the lazy release bug keep their pages.
    pub fn release_pages(&self, addr: usize, len: usize) -> bool {
        if self.shared || self.lazy_release_bug || len == 0 {
            return false;
        }
        debug_assert_eq!(addr % page_size(), 0);
        debug_assert_eq!(len % page_size(), 0);
        if self.in_data(addr) {
            self.data.advise_dontneed(addr - self.data_begin(), len);
            return true;
        }
        debug_assert!(self.in_exec(addr));
        match &self.backing {
            Some(fd) => punch_hole(fd, (addr - self.exec_begin()) as u64, len),
            None => {
                self.exec.advise_dontneed(addr - self.exec_begin(), len);
                true
            }
        }
    }

    /// Freeze the region: after a fork the child must never write into
    /// memory it shares with its parent.
    ///
    /// # Panics
    /// Panics when the kernel refuses the protection change.
    pub fn protect_read_only(&self) {
        if self.read_only.swap(true, Ordering::AcqRel) {
            return;
        }
        let result = self.data.protect(Protection::READ).and_then(|()| match &self.alias {
            Some(alias) => alias.protect(Protection::READ),
            None => Ok(()),
        });
        if let Err(err) = result {
            panic!("failed to freeze inherited code cache region: {err}");
        }
    }
}

// =============================================================================
// ScopedCodeWrite
// =============================================================================

/// RAII guard that makes code pages writable and restores RX on drop.
///
/// Only used without a dual view. The pages stay executable while writable so
/// that other threads running code on the same pages are not disturbed.
pub struct ScopedCodeWrite {
    begin: usize,
    len: usize,
}

impl ScopedCodeWrite {
    /// # Panics
    /// Panics when the pages cannot be re-protected.
    pub fn new(addr: usize, len: usize) -> Self {
        let begin = align_down(addr, page_size());
        let len = align_up(addr + len, page_size()) - begin;
        if let Err(err) = protect_range(begin, len, Protection::RW | Protection::EXEC) {
            panic!("failed to make code writable: {err}");
        }
        Self { begin, len }
    }
}

impl Drop for ScopedCodeWrite {
    fn drop(&mut self) {
        if let Err(err) = protect_range(self.begin, self.len, Protection::RX) {
            panic!("failed to restore code protection: {err}");
        }
    }
}

// =============================================================================
// Platform helpers
// =============================================================================

#[cfg(target_os = "linux")]
fn create_backing_file(len: usize) -> Result<OwnedFd, RegionError> {
    // SAFETY: the name is a valid C string; flags are constants.
    let raw = unsafe { libc::memfd_create(c"kiln-jit-cache".as_ptr(), libc::MFD_CLOEXEC) };
    if raw < 0 {
        return Err(RegionError::DualView(io::Error::last_os_error()));
    }
    // SAFETY: memfd_create returned a fresh descriptor we now own.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    // SAFETY: fd is valid.
    if unsafe { libc::ftruncate(raw, len as libc::off_t) } != 0 {
        return Err(RegionError::DualView(io::Error::last_os_error()));
    }
    Ok(fd)
}

#[cfg(not(target_os = "linux"))]
fn create_backing_file(_len: usize) -> Result<OwnedFd, RegionError> {
    Err(RegionError::DualView(io::Error::from(io::ErrorKind::Unsupported)))
}

#[cfg(target_os = "linux")]
fn punch_hole(fd: &OwnedFd, offset: u64, len: usize) -> bool {
    use std::os::fd::AsRawFd;
    // SAFETY: fd is a valid memfd and the range lies inside the file.
    let rc = unsafe {
        libc::fallocate(
            fd.as_raw_fd(),
            libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
            offset as libc::off_t,
            len as libc::off_t,
        )
    };
    if rc != 0 {
        tracing::debug!(error = %io::Error::last_os_error(), offset, len, "hole punching failed");
    }
    rc == 0
}

#[cfg(not(target_os = "linux"))]
fn punch_hole(_fd: &OwnedFd, _offset: u64, _len: usize) -> bool {
    false
}

const MEMBARRIER_CMD_PRIVATE_EXPEDITED_SYNC_CORE: libc::c_int = 1 << 5;
const MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED_SYNC_CORE: libc::c_int = 1 << 6;

#[cfg(target_os = "linux")]
fn membarrier_sync_core() -> bool {
    static REGISTERED: OnceLock<bool> = OnceLock::new();
    let registered = *REGISTERED.get_or_init(|| {
        // SAFETY: membarrier registration has no memory-safety preconditions.
        unsafe {
            libc::syscall(
                libc::SYS_membarrier,
                MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED_SYNC_CORE,
                0,
            ) == 0
        }
    });
    // SAFETY: as above.
    registered
        && unsafe {
            libc::syscall(libc::SYS_membarrier, MEMBARRIER_CMD_PRIVATE_EXPEDITED_SYNC_CORE, 0) == 0
        }
}

#[cfg(not(target_os = "linux"))]
fn membarrier_sync_core() -> bool {
    let _ = (
        MEMBARRIER_CMD_PRIVATE_EXPEDITED_SYNC_CORE,
        MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED_SYNC_CORE,
    );
    false
}

#[cfg(target_arch = "aarch64")]
unsafe extern "C" {
    fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
}

/// Flush the data cache for `addr..addr + len` and synchronise the
/// instruction pipelines of every core running this process.
pub fn flush_instruction_cache(addr: usize, len: usize) {
    #[cfg(target_arch = "aarch64")]
    // SAFETY: the range is mapped; __clear_cache only performs cache
    // maintenance.
    unsafe {
        __clear_cache(addr as *mut libc::c_char, (addr + len) as *mut libc::c_char);
    }
    #[cfg(not(target_arch = "aarch64"))]
    let _ = (addr, len);

    if !membarrier_sync_core() {
        std::sync::atomic::fence(Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(dual_view: bool) -> RegionOptions {
        RegionOptions {
            initial_capacity: 16 * page_size(),
            max_capacity: 64 * page_size(),
            dual_view,
            shared: false,
            lazy_release_bug: false,
        }
    }

    #[test]
    fn test_region_layout() {
        let region = MemoryRegion::new(options(true)).unwrap();
        assert_eq!(region.arena_size(), 32 * page_size());
        assert_eq!(region.data_begin() - region.exec_begin(), region.arena_size());
        assert!(region.in_exec(region.exec_begin()));
        assert!(!region.in_exec(region.data_begin()));
        assert!(region.in_data(region.data_begin()));
        assert!(region.own_space(region.data_begin()));
    }

    #[test]
    fn test_commit_code_through_alias() {
        let region = MemoryRegion::new(options(true)).unwrap();
        let dst = region.exec_begin() + 64;
        region.commit_code(dst, &[0xC3, 0x90, 0x90]);
        let written = unsafe { std::slice::from_raw_parts(dst as *const u8, 3) };
        assert_eq!(written, &[0xC3, 0x90, 0x90]);
    }

    #[test]
    fn test_commit_code_with_reprotection() {
        let region = MemoryRegion::new(options(false)).unwrap();
        assert!(!region.has_dual_view());
        let dst = region.exec_begin() + page_size() - 2;
        region.commit_code(dst, &[1, 2, 3, 4]);
        let written = unsafe { std::slice::from_raw_parts(dst as *const u8, 4) };
        assert_eq!(written, &[1, 2, 3, 4]);
    }

    #[test]
    fn test_increase_capacity_doubles_until_max() {
        let region = MemoryRegion::new(options(true)).unwrap();
        assert!(region.increase_capacity());
        assert_eq!(region.capacity(), 32 * page_size());
        assert!(region.increase_capacity());
        assert_eq!(region.capacity(), 64 * page_size());
        assert!(!region.increase_capacity());
    }

    #[test]
    fn test_release_pages_zeroes_data() {
        let region = MemoryRegion::new(options(true)).unwrap();
        let dst = region.data_begin();
        region.write_data(dst, &[9; 16]);
        assert!(region.release_pages(dst, page_size()));
        assert_eq!(unsafe { *(dst as *const u8) }, 0);
    }

    #[test]
    fn test_lazy_release_bug_keeps_pages() {
        let region = MemoryRegion::new(RegionOptions {
            lazy_release_bug: true,
            ..options(true)
        })
        .unwrap();
        assert!(!region.release_pages(region.data_begin(), page_size()));
    }

    #[test]
    fn test_protect_read_only_is_idempotent() {
        let region = MemoryRegion::new(options(true)).unwrap();
        region.protect_read_only();
        region.protect_read_only();
        assert!(region.is_read_only());
    }
}
