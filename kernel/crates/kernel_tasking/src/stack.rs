//! Guarded task stacks.
//!
//! Every stack is bracketed by one unmapped sentinel page below and one
//! above, so both overflow and underflow fault instead of silently
//! corrupting neighboring allocations.

use thiserror::Error;

use crate::mm::{PAGE_SIZE, VirtualMemoryArea, VmaRegion};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StackAllocationError {
    #[error("out of memory for stack")]
    OutOfMemory,
}

#[derive(Debug)]
pub struct GuardedStack {
    region: VmaRegion,
    usable_pages: usize,
    user: bool,
}

impl GuardedStack {
    /// Allocates a stack of `pages` usable pages plus the two guard pages.
    pub fn allocate(
        vma: &VirtualMemoryArea,
        pages: usize,
        user: bool,
    ) -> Result<Self, StackAllocationError> {
        let region = vma
            .request_pages(pages + 2, user)
            .ok_or(StackAllocationError::OutOfMemory)?;

        // The sentinel pages stay unmapped.
        let address_space = vma.address_space();
        address_space.unmap(region.virt, 1);
        address_space.unmap(region.virt + ((pages + 1) * PAGE_SIZE) as u64, 1);

        Ok(Self {
            region,
            usable_pages: pages,
            user,
        })
    }

    /// Virtual address one past the highest usable byte.
    #[must_use]
    pub fn top(&self) -> u64 {
        self.region.virt + ((1 + self.usable_pages) * PAGE_SIZE) as u64
    }

    /// Virtual address of the lowest usable byte.
    #[must_use]
    pub fn bottom(&self) -> u64 {
        self.region.virt + PAGE_SIZE as u64
    }

    #[must_use]
    pub fn usable_bytes(&self) -> usize {
        self.usable_pages * PAGE_SIZE
    }

    /// Guard page ranges, `(low, high)`, as virtual base addresses.
    #[must_use]
    pub fn guards(&self) -> (u64, u64) {
        (
            self.region.virt,
            self.region.virt + ((1 + self.usable_pages) * PAGE_SIZE) as u64,
        )
    }

    #[must_use]
    pub fn is_user(&self) -> bool {
        self.user
    }

    /// Kernel-visible view of the usable stack.
    ///
    /// # Safety
    /// The caller must be the only writer for the lifetime of the slice.
    #[must_use]
    pub unsafe fn as_mut_slice(&self) -> &'static mut [u8] {
        // SAFETY: the usable range lies inside the region by construction.
        unsafe {
            core::slice::from_raw_parts_mut(
                self.region.ptr.as_ptr().add(PAGE_SIZE),
                self.usable_bytes(),
            )
        }
    }

    /// Bytes charged to the owning task, guard pages included.
    #[must_use]
    pub fn size(&self) -> usize {
        self.region.len()
    }

    pub fn release(&self, vma: &VirtualMemoryArea) {
        vma.release(&self.region);
    }
}
