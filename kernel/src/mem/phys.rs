//! Physical page supply over the Limine memory map.
//!
//! A first-fit region list; callers get contiguous runs of 4 KiB pages,
//! kernel-visible through the higher-half direct map.

use alloc::vec::Vec;

use conquer_once::spin::OnceCell;
use limine::memory_map::EntryType;
use log::info;
use spin::Mutex;
use x86_64::structures::paging::PhysFrame;
use x86_64::PhysAddr;

use crate::limine::{hhdm_offset, MEMORY_MAP_REQUEST};

pub const PAGE_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy)]
struct Region {
    base: u64,
    pages: usize,
}

static REGIONS: OnceCell<Mutex<Vec<Region>>> = OnceCell::uninit();

/// Boot-stage region storage: the heap needs physical pages before the
/// region `Vec` can allocate, so the first regions live in a fixed array.
static EARLY_REGIONS: Mutex<([Option<Region>; 64], bool)> = Mutex::new(([None; 64], false));

pub struct PhysicalMemory;

impl PhysicalMemory {
    /// Collects the usable memory-map entries. Runs before the heap exists,
    /// so the regions land in the early fixed-size table.
    pub fn init() {
        let response = MEMORY_MAP_REQUEST
            .get_response()
            .expect("should have a memory map response");

        let mut early = EARLY_REGIONS.lock();
        let mut slot = 0;
        let mut total_pages = 0usize;
        for entry in response.entries() {
            if entry.entry_type != EntryType::USABLE || entry.length == 0 {
                continue;
            }
            if slot == early.0.len() {
                break;
            }
            let pages = entry.length as usize / PAGE_SIZE;
            early.0[slot] = Some(Region {
                base: entry.base,
                pages,
            });
            slot += 1;
            total_pages += pages;
        }
        early.1 = true;

        info!(
            "physical memory: {} usable regions, {} MiB",
            slot,
            total_pages * PAGE_SIZE / 1024 / 1024
        );
    }

    /// Moves the early regions into heap storage; called once the heap is
    /// serving.
    pub fn init_stage2() {
        let mut early = EARLY_REGIONS.lock();
        let regions: Vec<Region> = early.0.iter().flatten().copied().collect();
        early.0 = [None; 64];
        early.1 = false;
        REGIONS.init_once(|| Mutex::new(regions));
    }

    #[must_use]
    pub fn is_initialized() -> bool {
        REGIONS.get().is_some() || EARLY_REGIONS.lock().1
    }

    /// Allocates `count` physically contiguous pages. Interrupt handlers
    /// allocate through here too, so the region lock is taken with
    /// interrupts off.
    pub fn allocate_pages(count: usize) -> Option<u64> {
        if count == 0 {
            return None;
        }

        x86_64::instructions::interrupts::without_interrupts(|| {
            if let Some(regions) = REGIONS.get() {
                return Self::take(&mut regions.lock(), count);
            }

            // Early path: carve from the fixed table.
            let mut early = EARLY_REGIONS.lock();
            for slot in early.0.iter_mut() {
                let Some(region) = slot else { continue };
                if region.pages < count {
                    continue;
                }
                let base = region.base;
                region.base += (count * PAGE_SIZE) as u64;
                region.pages -= count;
                if region.pages == 0 {
                    *slot = None;
                }
                return Some(base);
            }
            None
        })
    }

    fn take(regions: &mut Vec<Region>, count: usize) -> Option<u64> {
        let pos = regions.iter().position(|r| r.pages >= count)?;
        let region = &mut regions[pos];
        let base = region.base;
        region.base += (count * PAGE_SIZE) as u64;
        region.pages -= count;
        if region.pages == 0 {
            regions.swap_remove(pos);
        }
        Some(base)
    }

    /// Returns `count` pages starting at `base`.
    pub fn free_pages(base: u64, count: usize) {
        if count == 0 {
            return;
        }
        x86_64::instructions::interrupts::without_interrupts(|| {
            if let Some(regions) = REGIONS.get() {
                regions.lock().push(Region { base, pages: count });
                return;
            }
            let mut early = EARLY_REGIONS.lock();
            for slot in early.0.iter_mut() {
                if slot.is_none() {
                    *slot = Some(Region { base, pages: count });
                    return;
                }
            }
        });
    }

    pub fn allocate_frame() -> Option<PhysFrame> {
        Self::allocate_pages(1)
            .map(|base| PhysFrame::containing_address(PhysAddr::new(base)))
    }

    pub fn deallocate_frame(frame: PhysFrame) {
        Self::free_pages(frame.start_address().as_u64(), 1);
    }
}

/// Kernel-visible view of a physical address through the direct map.
#[must_use]
pub fn phys_to_virt(phys: u64) -> *mut u8 {
    (phys + hhdm_offset()) as *mut u8
}
