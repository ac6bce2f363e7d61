//! Memory collaborators.
//!
//! The tasking core never touches page tables itself. Address spaces and the
//! page supply are reached through the traits below; per-process allocations
//! are tracked by a [`VirtualMemoryArea`] so that process destruction can
//! release everything a process ever requested.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;

use bitflags::bitflags;
use log::warn;
use spin::Mutex;
use thiserror::Error;

pub const PAGE_SIZE: usize = 4096;

/// Pages needed to back `bytes`.
#[must_use]
pub const fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u8 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("region is already mapped")]
    AlreadyMapped,
    #[error("region is not mapped")]
    NotMapped,
}

/// Owner of a hardware page-table hierarchy. The kernel implements this over
/// its real page tables; dropping the last handle of an owned hierarchy frees
/// the root table.
pub trait AddressSpaceHandle: Send + Sync {
    /// The physical root, as loaded into CR3 (or TTBR0).
    fn root(&self) -> u64;

    /// Forks a new address space sharing the kernel mappings.
    fn fork(&self) -> Result<Arc<dyn AddressSpaceHandle>, MapError>;

    fn map(&self, virt: u64, phys: u64, pages: usize, flags: MapFlags) -> Result<(), MapError>;

    fn unmap(&self, virt: u64, pages: usize);

    fn protect(&self, virt: u64, pages: usize, flags: MapFlags) -> Result<(), MapError>;
}

/// A kernel-visible block of physical pages.
#[derive(Debug, Clone, Copy)]
pub struct PageBlock {
    /// Kernel-visible mapping of the block.
    pub ptr: NonNull<u8>,
    /// Physical base address.
    pub phys: u64,
    pub pages: usize,
}

// SAFETY: the pointer refers to kernel-global memory, not to anything
// CPU-local; blocks move between CPUs under the owner's locking.
unsafe impl Send for PageBlock {}
// SAFETY: see above.
unsafe impl Sync for PageBlock {}

/// Page supply for stacks, TLS images and per-thread blocks.
pub trait TaskMemory: Send + Sync {
    fn request_pages(&self, pages: usize) -> Option<PageBlock>;
    fn free_pages(&self, block: PageBlock);
}

/// One tracked allocation of a process.
#[derive(Debug, Clone, Copy)]
pub struct VmaRegion {
    pub ptr: NonNull<u8>,
    pub phys: u64,
    /// Where the region is visible in the owning address space.
    pub virt: u64,
    pub pages: usize,
}

// SAFETY: same reasoning as `PageBlock`.
unsafe impl Send for VmaRegion {}
// SAFETY: same reasoning as `PageBlock`.
unsafe impl Sync for VmaRegion {}

impl VmaRegion {
    #[must_use]
    pub fn len(&self) -> usize {
        self.pages * PAGE_SIZE
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages == 0
    }

    /// Kernel-visible view of the whole region.
    ///
    /// # Safety
    /// The caller must be the only writer for the lifetime of the slice.
    #[must_use]
    pub unsafe fn as_mut_slice(&self) -> &'static mut [u8] {
        // SAFETY: per the function contract; the block spans `len` bytes.
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len()) }
    }
}

/// Tracks every allocation made on behalf of one process and maps it into the
/// process's address space.
pub struct VirtualMemoryArea {
    memory: Arc<dyn TaskMemory>,
    address_space: Arc<dyn AddressSpaceHandle>,
    regions: Mutex<Vec<VmaRegion>>,
}

impl VirtualMemoryArea {
    #[must_use]
    pub fn new(memory: Arc<dyn TaskMemory>, address_space: Arc<dyn AddressSpaceHandle>) -> Self {
        Self {
            memory,
            address_space,
            regions: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn address_space(&self) -> &Arc<dyn AddressSpaceHandle> {
        &self.address_space
    }

    /// Allocates `pages` pages and maps them into the owning address space at
    /// the kernel-visible address.
    pub fn request_pages(&self, pages: usize, user: bool) -> Option<VmaRegion> {
        let block = self.memory.request_pages(pages)?;
        let virt = block.ptr.as_ptr() as u64;

        let mut flags = MapFlags::PRESENT | MapFlags::WRITABLE;
        if user {
            flags |= MapFlags::USER;
        }
        if let Err(err) = self.address_space.map(virt, block.phys, pages, flags) {
            warn!("failed to map {pages} pages at {virt:#x}: {err}");
            self.memory.free_pages(block);
            return None;
        }

        let region = VmaRegion {
            ptr: block.ptr,
            phys: block.phys,
            virt,
            pages,
        };
        self.regions.lock().push(region);
        Some(region)
    }

    /// Unmaps and frees one region. Unknown regions are ignored, so teardown
    /// paths can release in any order.
    pub fn release(&self, region: &VmaRegion) {
        let mut regions = self.regions.lock();
        let Some(pos) = regions.iter().position(|r| r.virt == region.virt) else {
            return;
        };
        let region = regions.remove(pos);
        drop(regions);

        self.address_space.unmap(region.virt, region.pages);
        self.memory.free_pages(PageBlock {
            ptr: region.ptr,
            phys: region.phys,
            pages: region.pages,
        });
    }

    /// Releases everything still tracked.
    pub fn release_all(&self) {
        let regions = core::mem::take(&mut *self.regions.lock());
        for region in regions {
            self.address_space.unmap(region.virt, region.pages);
            self.memory.free_pages(PageBlock {
                ptr: region.ptr,
                phys: region.phys,
                pages: region.pages,
            });
        }
    }

    /// Total bytes currently allocated through this VMA.
    #[must_use]
    pub fn allocated_size(&self) -> usize {
        self.regions.lock().iter().map(VmaRegion::len).sum()
    }
}

impl Drop for VirtualMemoryArea {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// Program-break tracker over a process's address space.
#[derive(Debug, Default)]
pub struct ProgramBreak {
    inner: Mutex<BreakState>,
}

#[derive(Debug, Default, Clone, Copy)]
struct BreakState {
    base: u64,
    current: u64,
}

impl ProgramBreak {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_base(&self, base: u64) {
        let mut inner = self.inner.lock();
        inner.base = base;
        inner.current = base;
    }

    #[must_use]
    pub fn current(&self) -> u64 {
        self.inner.lock().current
    }

    /// Moves the break, backing growth with fresh pages from `vma`.
    /// `brk(0)` is a query.
    pub fn brk(&self, vma: &VirtualMemoryArea, address: u64) -> u64 {
        let mut inner = self.inner.lock();
        if address == 0 {
            return inner.current;
        }
        if address > inner.current {
            let grow = (address - inner.current) as usize;
            if vma.request_pages(pages_for(grow), true).is_none() {
                warn!("program break growth of {grow:#x} bytes failed");
                return inner.current;
            }
        }
        inner.current = address.max(inner.base);
        inner.current
    }
}
