//! The kernel heap: the free-list block allocator over physical pages,
//! doubling as the global allocator.

use core::alloc::{GlobalAlloc, Layout};

use kernel_heap::{BlockAllocator, CorruptionPolicy, PageProvider, PAGE_SIZE};
use log::info;
use x86_64::instructions::interrupts::without_interrupts;

use crate::arch::cpu;
use crate::mem::phys::{phys_to_virt, PhysicalMemory};

/// Checksum failures take the kernel down instead of limping on corrupted
/// metadata.
const CORRUPTION_POLICY: CorruptionPolicy = CorruptionPolicy::Halt;

pub struct PhysPageProvider;

// SAFETY: pages come from the physical allocator and are exclusively owned
// until freed; the direct map makes them kernel-writable.
unsafe impl PageProvider for PhysPageProvider {
    fn request_pages(&self, count: usize) -> *mut u8 {
        match PhysicalMemory::allocate_pages(count) {
            Some(base) => phys_to_virt(base),
            None => core::ptr::null_mut(),
        }
    }

    fn free_pages(&self, addr: *mut u8, count: usize) {
        let phys = addr as u64 - crate::limine::hhdm_offset();
        PhysicalMemory::free_pages(phys, count);
    }
}

struct KernelHeap {
    blocks: BlockAllocator<PhysPageProvider>,
}

#[global_allocator]
static ALLOCATOR: KernelHeap = KernelHeap {
    blocks: BlockAllocator::new(PhysPageProvider, CORRUPTION_POLICY),
};

// SAFETY: the block allocator hands out exclusive, payload-sized regions;
// payloads are page-aligned, satisfying any layout up to page alignment.
// Interrupts are held off across the allocator lock because interrupt
// handlers allocate too.
unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > PAGE_SIZE {
            return core::ptr::null_mut();
        }
        without_interrupts(|| self.blocks.alloc(layout.size()))
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        without_interrupts(|| self.blocks.free(ptr));
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        // Payloads are zeroed on allocation already.
        // SAFETY: same contract as `alloc`.
        unsafe { self.alloc(layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > PAGE_SIZE {
            return core::ptr::null_mut();
        }
        without_interrupts(|| self.blocks.realloc(ptr, new_size))
    }
}

/// Direct access to the block allocator for callers that want the C-style
/// surface (drivers, diagnostics).
pub fn allocator() -> &'static BlockAllocator<PhysPageProvider> {
    &ALLOCATOR.blocks
}

pub fn init() {
    let smap = cpu::smap_active();
    ALLOCATOR.blocks.set_smap_active(smap);
    info!("heap initialized, SMAP {}", if smap { "on" } else { "off" });
}
