//! Hardware page-table ownership.
//!
//! The kernel address space wraps the page tables the bootloader handed
//! over; process address spaces are forked from it, sharing the higher half.
//! Everything goes through an `OffsetPageTable` over the higher-half direct
//! map.

use alloc::sync::Arc;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering::Relaxed;

use conquer_once::spin::OnceCell;
use kernel_tasking::mm::{AddressSpaceHandle, MapError, MapFlags};
use log::info;
use spin::Mutex;
use x86_64::registers::control::Cr3;
use x86_64::structures::paging::mapper::MapToError;
use x86_64::structures::paging::{
    FrameAllocator, Mapper, OffsetPageTable, Page, PageTable, PageTableFlags, PhysFrame, Size4KiB,
};
use x86_64::{PhysAddr, VirtAddr};

use crate::limine::hhdm_offset;
use crate::mem::phys::{phys_to_virt, PhysicalMemory, PAGE_SIZE};

static KERNEL_ADDRESS_SPACE: OnceCell<Arc<AddressSpace>> = OnceCell::uninit();

/// Bump window for uncached MMIO mappings (LAPIC, IOAPIC).
static MMIO_WINDOW: AtomicU64 = AtomicU64::new(0xFFFF_9F00_0000_0000);

struct RegionFrameAllocator;

unsafe impl FrameAllocator<Size4KiB> for RegionFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        let frame = PhysicalMemory::allocate_frame()?;
        // Fresh page-table frames must start out zeroed.
        // SAFETY: the frame was just allocated and is ours.
        unsafe {
            core::ptr::write_bytes(phys_to_virt(frame.start_address().as_u64()), 0, PAGE_SIZE);
        }
        Some(frame)
    }
}

pub struct AddressSpace {
    root: u64,
    owned: bool,
    mapper: Mutex<OffsetPageTable<'static>>,
}

// SAFETY: the mapper only dereferences page-table frames through the direct
// map, which is global; all mutation is behind the mutex.
unsafe impl Send for AddressSpace {}
// SAFETY: see above.
unsafe impl Sync for AddressSpace {}

pub fn init() {
    let root = Cr3::read().0.start_address().as_u64();

    // Pre-populate every higher-half PML4 slot so kernel mappings created
    // later (heap growth, MMIO windows) are visible in forked address spaces
    // without propagation.
    // SAFETY: the root table is live and we are the only CPU this early.
    unsafe {
        let table = &mut *phys_to_virt(root).cast::<PageTable>();
        for entry in table.iter_mut().skip(256) {
            if entry.is_unused() {
                let frame = PhysicalMemory::allocate_frame()
                    .expect("should have memory for kernel page tables");
                core::ptr::write_bytes(
                    phys_to_virt(frame.start_address().as_u64()),
                    0,
                    PAGE_SIZE,
                );
                entry.set_frame(
                    frame,
                    PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
                );
            }
        }
    }

    KERNEL_ADDRESS_SPACE.init_once(|| {
        // SAFETY: `root` is the live kernel page-table root.
        Arc::new(unsafe { AddressSpace::from_root(root, false) })
    });
    info!("kernel address space at {root:#x}");
}

impl AddressSpace {
    /// # Safety
    /// `root` must be the physical address of a valid PML4.
    unsafe fn from_root(root: u64, owned: bool) -> Self {
        // SAFETY: per the function contract; the direct map covers the root.
        let mapper = unsafe {
            OffsetPageTable::new(
                &mut *phys_to_virt(root).cast::<PageTable>(),
                VirtAddr::new(hhdm_offset()),
            )
        };
        Self {
            root,
            owned,
            mapper: Mutex::new(mapper),
        }
    }

    pub fn kernel() -> &'static Arc<AddressSpace> {
        KERNEL_ADDRESS_SPACE
            .get()
            .expect("address space not initialized")
    }

    #[must_use]
    pub fn root(&self) -> u64 {
        self.root
    }

    fn map_page(
        &self,
        virt: u64,
        phys: u64,
        flags: PageTableFlags,
    ) -> Result<(), MapError> {
        let page = Page::<Size4KiB>::containing_address(VirtAddr::new(virt));
        let frame = PhysFrame::containing_address(PhysAddr::new(phys));
        let mut mapper = self.mapper.lock();
        // SAFETY: the caller supplies an unused virtual page and a frame it
        // owns.
        let flush = unsafe { mapper.map_to(page, frame, flags, &mut RegionFrameAllocator) };
        match flush {
            Ok(flush) => {
                flush.flush();
                Ok(())
            }
            Err(MapToError::FrameAllocationFailed) => Err(MapError::OutOfMemory),
            Err(_) => Err(MapError::AlreadyMapped),
        }
    }

    fn unmap_page(&self, virt: u64) {
        let page = Page::<Size4KiB>::containing_address(VirtAddr::new(virt));
        if let Ok((_frame, flush)) = self.mapper.lock().unmap(page) {
            flush.flush();
        }
    }

    /// Maps one page of device registers uncached and returns its virtual
    /// address.
    pub fn map_mmio(&self, phys: u64) -> u64 {
        let virt = MMIO_WINDOW.fetch_add(PAGE_SIZE as u64, Relaxed);
        self.map_page(
            virt,
            phys & !(PAGE_SIZE as u64 - 1),
            PageTableFlags::PRESENT
                | PageTableFlags::WRITABLE
                | PageTableFlags::NO_CACHE
                | PageTableFlags::NO_EXECUTE,
        )
        .expect("should be able to map MMIO window");
        virt | (phys & (PAGE_SIZE as u64 - 1))
    }
}

fn translate_flags(flags: MapFlags) -> PageTableFlags {
    let mut out = PageTableFlags::empty();
    if flags.contains(MapFlags::PRESENT) {
        out |= PageTableFlags::PRESENT;
    }
    if flags.contains(MapFlags::WRITABLE) {
        out |= PageTableFlags::WRITABLE;
    }
    if flags.contains(MapFlags::USER) {
        out |= PageTableFlags::USER_ACCESSIBLE;
    }
    out
}

impl AddressSpaceHandle for AddressSpace {
    fn root(&self) -> u64 {
        self.root
    }

    fn fork(&self) -> Result<Arc<dyn AddressSpaceHandle>, MapError> {
        let kernel_root = Self::kernel().root;
        let frame = PhysicalMemory::allocate_frame().ok_or(MapError::OutOfMemory)?;
        let new_root = frame.start_address().as_u64();

        // Share the kernel half, leave the user half empty.
        // SAFETY: both tables are reachable through the direct map; the new
        // frame is exclusively ours.
        unsafe {
            let src = &*phys_to_virt(kernel_root).cast::<PageTable>();
            let dst = &mut *phys_to_virt(new_root).cast::<PageTable>();
            dst.zero();
            for i in 256..512 {
                dst[i] = src[i].clone();
            }
        }

        // SAFETY: the new root was just initialized.
        Ok(Arc::new(unsafe { Self::from_root(new_root, true) }))
    }

    fn map(&self, virt: u64, phys: u64, pages: usize, flags: MapFlags) -> Result<(), MapError> {
        let flags = translate_flags(flags);
        for page in 0..pages {
            let offset = (page * PAGE_SIZE) as u64;
            self.map_page(virt + offset, phys + offset, flags)?;
        }
        Ok(())
    }

    fn unmap(&self, virt: u64, pages: usize) {
        for page in 0..pages {
            self.unmap_page(virt + (page * PAGE_SIZE) as u64);
        }
    }

    fn protect(&self, virt: u64, pages: usize, flags: MapFlags) -> Result<(), MapError> {
        let flags = translate_flags(flags);
        let mut mapper = self.mapper.lock();
        for page in 0..pages {
            let page =
                Page::<Size4KiB>::containing_address(VirtAddr::new(virt + (page * PAGE_SIZE) as u64));
            // SAFETY: only flag bits change; the mapping itself stays.
            match unsafe { mapper.update_flags(page, flags) } {
                Ok(flush) => flush.flush(),
                Err(_) => return Err(MapError::NotMapped),
            }
        }
        Ok(())
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }

        // Free the user-half intermediate tables, then the root itself.
        // Mapped leaf frames belong to the owning process's VMA, which
        // releases them separately.
        // SAFETY: nothing runs on this address space anymore; the process
        // holding the last handle is being destroyed.
        unsafe {
            free_table_recursive(self.root, 4);
        }
    }
}

/// # Safety
/// `table_phys` must point at a page-table level exclusively owned by the
/// dropped address space.
unsafe fn free_table_recursive(table_phys: u64, level: u8) {
    // SAFETY: per the function contract.
    let table = unsafe { &*phys_to_virt(table_phys).cast::<PageTable>() };
    let entries = if level == 4 { 0..256 } else { 0..512 };
    if level > 1 {
        for i in entries {
            let entry = &table[i];
            if entry.is_unused() || entry.flags().contains(PageTableFlags::HUGE_PAGE) {
                continue;
            }
            // SAFETY: the child table belongs to this hierarchy.
            unsafe { free_table_recursive(entry.addr().as_u64(), level - 1) };
        }
    }
    PhysicalMemory::free_pages(table_phys, 1);
}
