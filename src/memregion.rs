//! Memory Region Controller.
//!
//! Reserves the shared virtual address range and changes its page
//! protection on demand. This module owns no locks; callers (the page
//! directory's per-page locks, taken by the coherence engine) serialize
//! access; see `directory` and `engine`.

use region::{Allocation, Protection};

use crate::config::PAGE_SIZE;
use crate::error::{Error, Result};

/// The access mode a page (or, during `reserve`, the whole region) can be
/// protected with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// No mapping visible; any access faults.
    None,
    /// Shared read access.
    Read,
    /// Exclusive write access, implemented as read+write.
    Write,
}

impl AccessMode {
    const fn to_protection(self) -> Protection {
        match self {
            Self::None => Protection::NONE,
            Self::Read => Protection::READ,
            Self::Write => Protection::READ_WRITE,
        }
    }
}

/// Owns the single anonymous mapping backing the shared region and exposes
/// page-granularity protection changes and raw byte access over it.
pub struct MemoryRegion {
    allocation: Allocation,
    base: usize,
    size: usize,
}

// SAFETY: the allocation is private anonymous memory; `Allocation` is not
// `Sync` only because `region` is conservative about concurrent protection
// changes on some platforms, but this crate already serializes every access
// through the page directory's per-page locks before touching the region.
unsafe impl Sync for MemoryRegion {}

impl MemoryRegion {
    /// Reserves an anonymous private mapping of `size` bytes (rounded down
    /// to a multiple of [`PAGE_SIZE`]) starting at `base`, initially
    /// protected with [`AccessMode::None`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::OsMap`] if the reservation fails (e.g. the address
    /// range is already in use).
    pub fn reserve(base: usize, size: usize) -> Result<Self> {
        let size = size - (size % PAGE_SIZE);

        // SAFETY: `base` and `size` describe a fresh, page-aligned range
        // that this call is about to exclusively own; `alloc_at` performs
        // the equivalent of `mmap(base, size, PROT_NONE, MAP_FIXED | ...)`.
        let allocation = unsafe {
            region::alloc_at(base as *const (), size, Protection::NONE)
                .map_err(|e| Error::OsMap(e.to_string()))?
        };

        Ok(Self {
            allocation,
            base,
            size,
        })
    }

    /// Test-only constructor: reserves `size` bytes of real backing memory
    /// at whatever address the OS chooses, but pins `logical_base` as the
    /// region's reported [`Self::base`]. This lets two independently
    /// allocated test regions (simulating two separate nodes' memory
    /// within one test process) share the single fixed address scheme the
    /// wire protocol assumes, without the two actually aliasing the same
    /// virtual memory the way `reserve`'s `MAP_FIXED` semantics would if
    /// called twice with the same `base` in one process.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OsMap`] if the allocation fails.
    #[cfg(test)]
    pub(crate) fn reserve_for_test(logical_base: usize, size: usize) -> Result<Self> {
        let size = size - (size % PAGE_SIZE);
        let allocation = region::alloc(size, Protection::NONE).map_err(|e| Error::OsMap(e.to_string()))?;
        Ok(Self {
            allocation,
            base: logical_base,
            size,
        })
    }

    /// The base address of the region.
    #[must_use]
    pub const fn base(&self) -> usize {
        self.base
    }

    /// The size of the region in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// `true` if `addr` falls within `[base, base + size)`.
    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.size
    }

    /// Aligns `addr` down to the start of its containing page.
    #[must_use]
    pub const fn page_align_down(addr: usize) -> usize {
        addr - (addr % PAGE_SIZE)
    }

    /// Changes the protection of `count` contiguous pages starting at the
    /// page-aligned `page_addr` to `mode`. `page_addr` is silently aligned
    /// down.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OsProt`] on OS rejection.
    pub fn set_mode(&self, page_addr: usize, count: usize, mode: AccessMode) -> Result<()> {
        let aligned = Self::page_align_down(page_addr);
        let len = count * PAGE_SIZE;

        // SAFETY: `aligned..aligned+len` is contained in `self.base..self.base+self.size`
        // by construction of every caller in this crate (the directory never hands out
        // an address outside the region), and the protection values are valid for mprotect.
        unsafe {
            region::protect(aligned as *const (), len, mode.to_protection())
                .map_err(|e| Error::OsProt(e.to_string()))?;
        }

        Ok(())
    }

    /// Returns the current raw bytes of the page starting at `page_addr`
    /// (aligned down). The caller must hold sufficient local access (READ
    /// or WRITE) before calling; this is not checked here, matching the
    /// controller's "no locks, no validation" contract; the coherence
    /// engine enforces mode transitions before ever calling this.
    #[must_use]
    pub fn read_page(&self, page_addr: usize) -> [u8; PAGE_SIZE] {
        let aligned = Self::page_align_down(page_addr);
        let offset = aligned - self.base;
        let mut buf = [0_u8; PAGE_SIZE];

        // SAFETY: `offset..offset+PAGE_SIZE` is within the mapping, and the
        // caller has already arranged at least READ access for this page.
        unsafe {
            let src = self.allocation.as_ptr::<u8>().add(offset);
            std::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), PAGE_SIZE);
        }

        buf
    }

    /// Temporarily elevates the page to WRITE, copies `bytes` in, then
    /// restores `restore_mode`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OsProt`] if either protection change fails.
    pub fn write_page(
        &self,
        page_addr: usize,
        bytes: &[u8; PAGE_SIZE],
        restore_mode: AccessMode,
    ) -> Result<()> {
        let aligned = Self::page_align_down(page_addr);
        let offset = aligned - self.base;

        self.set_mode(aligned, 1, AccessMode::Write)?;

        // SAFETY: the page was just set to WRITE above, and `offset` is
        // within the mapping. `Allocation::as_ptr` only requires `&self`;
        // we cast away the const-ness here because the controller
        // deliberately has no `&mut` story of its own; callers serialize
        // writes through the page directory's locks instead.
        unsafe {
            let dst = self.allocation.as_ptr::<u8>().add(offset).cast_mut();
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, PAGE_SIZE);
        }

        self.set_mode(aligned, 1, restore_mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Picks an address unlikely to collide with the test binary's other
    /// mappings; good enough for a single-threaded reservation test.
    fn test_base() -> usize {
        // Let the OS choose by reserving with `alloc`, then immediately
        // drop it and reserve again at the same address with `reserve`.
        // This keeps the test independent of any fixed address being free.
        let probe = region::alloc(2 * PAGE_SIZE, Protection::NONE).expect("probe alloc");
        probe.as_ptr::<u8>() as usize
    }

    #[test]
    fn reserve_rounds_size_down_to_page_multiple() {
        let base = test_base();
        let region = MemoryRegion::reserve(base, PAGE_SIZE + 1).expect("reserve");
        assert_eq!(region.size(), PAGE_SIZE);
    }

    #[test]
    fn write_then_read_round_trips() {
        let base = test_base();
        let region = MemoryRegion::reserve(base, PAGE_SIZE).expect("reserve");

        let mut bytes = [0_u8; PAGE_SIZE];
        bytes[0] = 0xEF;
        bytes[1] = 0xBE;
        bytes[2] = 0xAD;
        bytes[3] = 0xDE;

        region
            .write_page(base, &bytes, AccessMode::Read)
            .expect("write_page");

        let got = region.read_page(base);
        assert_eq!(got, bytes);
    }

    #[test]
    fn contains_respects_bounds() {
        let base = test_base();
        let region = MemoryRegion::reserve(base, PAGE_SIZE).expect("reserve");
        assert!(region.contains(base));
        assert!(region.contains(base + PAGE_SIZE - 1));
        assert!(!region.contains(base + PAGE_SIZE));
        assert!(!region.contains(base.wrapping_sub(1)));
    }
}
