//! Patching of the boot-image relocation section (`.data.img.rel.ro`).
//!
//! The section holds 32-bit offsets into the boot image (and, after
//! `oatdataimgrelroappimage`, into the app image). Loading adds the
//! current image bases to every slot. The pages are read-only except
//! while a patch is being applied:
//!
//! 1. **Protection Change**: mark the section writable
//! 2. **Patch**: add the delta to every slot
//! 3. **Protection Restore**: mark the section read-only again

use kiln_jit::RegionError;
use kiln_jit::mem_map::{Protection, protect_range};

use crate::error::{LoadError, Result};

const SLOT_SIZE: usize = size_of::<u32>();

/// Bounds of the relocation section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelRo {
    begin: usize,
    app_image: usize,
    end: usize,
}

impl RelRo {
    /// Validate `begin ≤ app_image ≤ end`, all 4-byte aligned.
    pub fn new(begin: usize, app_image: usize, end: usize) -> Result<Self> {
        for (what, value) in [
            ("rel.ro begin", begin),
            ("rel.ro app image", app_image),
            ("rel.ro end", end),
        ] {
            if value % SLOT_SIZE != 0 {
                return Err(LoadError::Misaligned {
                    what,
                    value,
                    alignment: SLOT_SIZE,
                });
            }
        }
        if !(begin <= app_image && app_image <= end) {
            return Err(LoadError::layout(format!(
                "rel.ro bounds out of order: {begin:#x} / {app_image:#x} / {end:#x}"
            )));
        }
        Ok(Self {
            begin,
            app_image,
            end,
        })
    }

    pub fn empty() -> Self {
        Self {
            begin: 0,
            app_image: 0,
            end: 0,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    pub fn begin(&self) -> usize {
        self.begin
    }

    /// First app-image slot.
    pub fn app_image(&self) -> usize {
        self.app_image
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn boot_slots(&self) -> usize {
        (self.app_image - self.begin) / SLOT_SIZE
    }

    pub fn app_slots(&self) -> usize {
        (self.end - self.app_image) / SLOT_SIZE
    }

    /// Add the image bases to every slot.
    ///
    /// # Safety
    /// The section must be mapped, owned by the caller and not read
    /// concurrently.
    pub unsafe fn relocate(&self, boot_image_begin: u32, app_image_begin: u32) -> Result<()> {
        // SAFETY: forwarded to the caller.
        unsafe { self.apply(boot_image_begin, app_image_begin) }
    }

    /// Move the boot-image slots from `old_begin` to `new_begin` after the
    /// boot image was replaced.
    ///
    /// # Safety
    /// Same as [`RelRo::relocate`].
    pub unsafe fn relocate_again(&self, old_begin: u32, new_begin: u32) -> Result<()> {
        // SAFETY: forwarded to the caller.
        unsafe { self.apply(new_begin.wrapping_sub(old_begin), 0) }
    }

    unsafe fn apply(&self, boot_delta: u32, app_delta: u32) -> Result<()> {
        if self.is_empty() || (boot_delta == 0 && app_delta == 0) {
            return Ok(());
        }
        let len = self.end - self.begin;
        protect_range(self.begin, len, Protection::RW)?;
        for (start, end, delta) in [
            (self.begin, self.app_image, boot_delta),
            (self.app_image, self.end, app_delta),
        ] {
            let count = (end - start) / SLOT_SIZE;
            // SAFETY: the caller owns the section; it is writable now and
            // 4-byte aligned by construction.
            let slots = unsafe { std::slice::from_raw_parts_mut(start as *mut u32, count) };
            for slot in slots {
                *slot = slot.wrapping_add(delta);
            }
        }
        protect_range(self.begin, len, Protection::READ).unwrap_or_else(|e: RegionError| {
            panic!("failed to restore rel.ro protection: {e}")
        });
        tracing::debug!(
            begin = format_args!("{:#x}", self.begin),
            boot_slots = self.boot_slots(),
            app_slots = self.app_slots(),
            boot_delta,
            app_delta,
            "relocated rel.ro"
        );
        Ok(())
    }
}
