//! Compiled blob layout.
//!
//! Every blob in the code arena starts with a [`BlobHeader`]; the entry point
//! is the first byte after it. The side table in the data arena holds the
//! blob's GC roots, stack map and debug info:
//!
//! ```text
//! code arena                         data arena
//! ┌────────────┬──────────────┐      ┌─────┬───────┬─────────────┬─────┬──────────┬─────┬───────┐
//! │ BlobHeader │ machine code │      │ pad │ count │ roots[count]│ len │ stackmap │ len │ debug │
//! └────────────┴──────────────┘      └─────┴───────┴─────────────┴─────┴──────────┴─────┴───────┘
//!  ▲            ▲ entry                              ▲
//!  │            └── header.side_table ───────────────┘ (count is read as roots[-1])
//! ```

use std::mem::size_of;

use bitflags::bitflags;

use crate::host::ObjectRef;
use crate::mem_map::align_up;
use crate::region::MemoryRegion;

/// Alignment of blob allocations and granularity of the live bitmap.
pub const CODE_ALIGNMENT: usize = 16;

/// Bytes between the start of a blob allocation and its entry point.
pub const HEADER_SIZE: usize = align_up(size_of::<BlobHeader>(), CODE_ALIGNMENT);

/// Bytes in front of `roots[0]` in a side table.
const ROOTS_PREFIX: usize = 8;

bitflags! {
    /// Properties of a compiled blob.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BlobFlags: u32 {
        const BASELINE = 1 << 0;
        const OPTIMIZED = 1 << 1;
        const OSR = 1 << 2;
        const JNI_STUB = 1 << 3;
    }
}

/// How a blob was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum CompilationKind {
    Baseline = 0,
    Optimized = 1,
    /// Entered at a loop header from an interpreter frame.
    Osr = 2,
}

impl CompilationKind {
    pub fn flags(self) -> BlobFlags {
        match self {
            CompilationKind::Baseline => BlobFlags::BASELINE,
            CompilationKind::Optimized => BlobFlags::OPTIMIZED,
            CompilationKind::Osr => BlobFlags::OSR,
        }
    }
}

// =============================================================================
// BlobHeader
// =============================================================================

/// Fixed-size header in front of every blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct BlobHeader {
    /// Address of `roots[0]` in the data arena, or 0.
    pub side_table: usize,
    pub code_size: u32,
    pub flags: u32,
}

impl BlobHeader {
    pub fn new(side_table: usize, code_size: u32, flags: BlobFlags) -> Self {
        Self {
            side_table,
            code_size,
            flags: flags.bits(),
        }
    }

    #[inline]
    pub fn flags(&self) -> BlobFlags {
        BlobFlags::from_bits_truncate(self.flags)
    }

    #[inline]
    pub fn is_optimized(&self) -> bool {
        self.flags().contains(BlobFlags::OPTIMIZED)
    }

    /// Native bytes of the header.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..8].copy_from_slice(&(self.side_table as u64).to_ne_bytes());
        out[8..12].copy_from_slice(&self.code_size.to_ne_bytes());
        out[12..16].copy_from_slice(&self.flags.to_ne_bytes());
        out
    }

    /// Read the header in front of `entry`.
    ///
    /// # Safety
    /// `entry` must be the entry point of a committed blob that has not been
    /// freed.
    #[inline]
    pub unsafe fn read(entry: usize) -> BlobHeader {
        // SAFETY: the caller guarantees a header precedes `entry`.
        unsafe { ((entry - HEADER_SIZE) as *const BlobHeader).read() }
    }
}

/// Allocation start of the blob whose entry is `entry`.
#[inline]
pub const fn allocation_of(entry: usize) -> usize {
    entry - HEADER_SIZE
}

/// Entry point of the blob allocated at `allocation`.
#[inline]
pub const fn entry_of(allocation: usize) -> usize {
    allocation + HEADER_SIZE
}

/// Copied-out description of a blob, as returned by PC lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobInfo {
    pub entry: usize,
    pub code_size: u32,
    pub flags: BlobFlags,
    /// Owning method; unknown for shared stubs.
    pub method: Option<crate::host::MethodHandle>,
}

impl BlobInfo {
    /// Whether `pc` falls inside the blob's code.
    #[inline]
    pub fn contains(&self, pc: usize) -> bool {
        pc >= self.entry && pc < self.entry + self.code_size as usize
    }
}

// =============================================================================
// Side tables
// =============================================================================

/// Bytes needed for a side table with `n_roots` roots and `payload` bytes of
/// stack map plus debug info. Zero when there is nothing to store.
pub const fn side_table_size(n_roots: usize, payload: usize) -> usize {
    if n_roots == 0 && payload == 0 {
        return 0;
    }
    side_table_overhead(n_roots) + payload
}

/// Fixed part of a side table: prefix, roots and the two length words.
pub const fn side_table_overhead(n_roots: usize) -> usize {
    ROOTS_PREFIX + n_roots * size_of::<ObjectRef>() + 4 + 4
}

/// Address of `roots[0]` for a side table allocated at `data`.
#[inline]
pub const fn roots_of(data: usize) -> usize {
    data + ROOTS_PREFIX
}

/// Allocation start of the side table whose roots begin at `side_table`.
#[inline]
pub const fn side_table_allocation(side_table: usize) -> usize {
    side_table - ROOTS_PREFIX
}

/// Write a side table at `data` and return the address of `roots[0]`.
pub fn write_side_table(
    region: &MemoryRegion,
    data: usize,
    roots: &[ObjectRef],
    stack_map: &[u8],
    debug_info: &[u8],
) -> usize {
    let mut bytes = Vec::with_capacity(side_table_size(roots.len(), stack_map.len() + debug_info.len()));
    bytes.extend_from_slice(&0u32.to_ne_bytes());
    bytes.extend_from_slice(&(roots.len() as u32).to_ne_bytes());
    for root in roots {
        bytes.extend_from_slice(&root.addr().to_ne_bytes());
    }
    bytes.extend_from_slice(&(stack_map.len() as u32).to_ne_bytes());
    bytes.extend_from_slice(stack_map);
    bytes.extend_from_slice(&(debug_info.len() as u32).to_ne_bytes());
    bytes.extend_from_slice(debug_info);
    region.write_data(data, &bytes);
    roots_of(data)
}

/// Number of roots of the side table at `side_table`.
///
/// # Safety
/// `side_table` must come from [`write_side_table`] and not have been freed.
#[inline]
pub unsafe fn root_count(side_table: usize) -> usize {
    // SAFETY: the count sits right in front of roots[0].
    unsafe { ((side_table - 4) as *const u32).read() as usize }
}

/// Roots of the side table at `side_table`.
///
/// # Safety
/// As for [`root_count`]; additionally no other reference to the roots may be
/// live, which holds while the caller owns the index lock for writing or the
/// world is stopped.
pub unsafe fn roots_mut<'a>(side_table: usize) -> &'a mut [ObjectRef] {
    // SAFETY: ObjectRef is repr(transparent) over usize and the side table
    // stores `count` of them starting at an 8-aligned address.
    unsafe {
        let count = root_count(side_table);
        std::slice::from_raw_parts_mut(side_table as *mut ObjectRef, count)
    }
}

/// Stack map bytes of the side table at `side_table`.
///
/// # Safety
/// As for [`root_count`].
pub unsafe fn stack_map<'a>(side_table: usize) -> &'a [u8] {
    // SAFETY: layout as written by write_side_table.
    unsafe {
        let at = side_table + root_count(side_table) * size_of::<ObjectRef>();
        let len = (at as *const u32).read_unaligned() as usize;
        std::slice::from_raw_parts((at + 4) as *const u8, len)
    }
}

/// Debug info bytes of the side table at `side_table`.
///
/// # Safety
/// As for [`root_count`].
pub unsafe fn debug_info<'a>(side_table: usize) -> &'a [u8] {
    // SAFETY: layout as written by write_side_table.
    unsafe {
        let map = stack_map(side_table);
        let at = map.as_ptr() as usize + map.len();
        let len = (at as *const u32).read_unaligned() as usize;
        std::slice::from_raw_parts((at + 4) as *const u8, len)
    }
}
