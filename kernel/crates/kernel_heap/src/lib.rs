//! Page-backed free-list heap allocator.
//!
//! Every live allocation is described by a [`Block`] carrying a checksum so
//! that stray writes into allocator metadata are caught on the next walk.
//! Block metadata is allocated page-granular straight from the page provider;
//! the allocator never allocates from itself while servicing a request.
//!
//! When a request arrives from a user-mode crossing on x86, Supervisor-Mode
//! Access Prevention is opened for the duration of the operation through a
//! scoped guard (`stac` on entry, `clac` on every exit path).

#![no_std]

#[cfg(test)]
extern crate alloc;

use core::ptr;
use core::sync::atomic::AtomicBool;
use core::sync::atomic::Ordering::Relaxed;

use log::{error, warn};
use spin::Mutex;
use thiserror::Error;

pub const PAGE_SIZE: usize = 4096;

/// Written into every block header; a mismatch on a walk means the heap has
/// been corrupted.
pub const BLOCK_CHECKSUM: u32 = 0xA110C;

/// Supplier of 4 KiB physical pages, mapped so the kernel can write them.
///
/// # Safety
/// `request_pages` must return a page-aligned region of `count` pages that is
/// exclusively owned by the caller and stays valid until handed back through
/// `free_pages`, or null when no memory is available.
pub unsafe trait PageProvider: Send + Sync {
    fn request_pages(&self, count: usize) -> *mut u8;
    fn free_pages(&self, addr: *mut u8, count: usize);
}

/// What to do when a block fails its checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptionPolicy {
    /// Log the corrupt block and skip it; the kernel limps on.
    Report,
    /// Spin forever; a debugger gets a stable picture of the damage.
    Halt,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeapError {
    #[error("block {0:#x} failed its checksum")]
    Corrupt(usize),
    #[error("block list contains a cycle")]
    Cyclic,
}

/// Pages needed to back `bytes` of payload.
const fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}

#[repr(C)]
struct Block {
    address: *mut u8,
    checksum: u32,
    size: usize,
    next: *mut Block,
    prev: *mut Block,
    is_free: bool,
}

impl Block {
    fn check(&self) -> bool {
        self.checksum == BLOCK_CHECKSUM
    }
}

struct BlockList {
    head: *mut Block,
}

// SAFETY: the raw block pointers are only ever touched under the allocator's
// lock.
unsafe impl Send for BlockList {}

pub struct BlockAllocator<P: PageProvider> {
    provider: P,
    policy: CorruptionPolicy,
    smap_active: AtomicBool,
    list: Mutex<BlockList>,
}

impl<P: PageProvider> BlockAllocator<P> {
    pub const fn new(provider: P, policy: CorruptionPolicy) -> Self {
        Self {
            provider,
            policy,
            smap_active: AtomicBool::new(false),
            list: Mutex::new(BlockList {
                head: ptr::null_mut(),
            }),
        }
    }

    /// Marks SMAP as active; from now on every operation runs inside a
    /// `stac`/`clac` window.
    pub fn set_smap_active(&self, active: bool) {
        self.smap_active.store(active, Relaxed);
    }

    /// Allocates a new block with a zeroed payload of `size` bytes. Returns
    /// null if the page provider is exhausted.
    fn new_block(&self, size: usize) -> *mut Block {
        let header = self
            .provider
            .request_pages(pages_for(size_of::<Block>()))
            .cast::<Block>();
        if header.is_null() {
            return ptr::null_mut();
        }

        let payload = self.provider.request_pages(pages_for(size + 1));
        if payload.is_null() {
            self.provider
                .free_pages(header.cast(), pages_for(size_of::<Block>()));
            return ptr::null_mut();
        }

        // SAFETY: `payload` spans at least `size` bytes by the provider
        // contract, and `header` is exclusively ours.
        unsafe {
            ptr::write_bytes(payload, 0, size);
            header.write(Block {
                address: payload,
                checksum: BLOCK_CHECKSUM,
                size,
                next: ptr::null_mut(),
                prev: ptr::null_mut(),
                is_free: false,
            });
        }
        header
    }

    /// Releases a block's payload and metadata pages.
    ///
    /// # Safety
    /// `block` must be a live block created by `new_block` and unlinked from
    /// the list.
    unsafe fn release_block(&self, block: *mut Block) {
        // SAFETY: per the function contract.
        unsafe {
            let size = (*block).size;
            self.provider.free_pages((*block).address, pages_for(size + 1));
            self.provider
                .free_pages(block.cast(), pages_for(size_of::<Block>()));
        }
    }

    /// Reports a corrupt block and applies the corruption policy.
    fn on_corruption(&self, block: *mut Block) {
        // SAFETY: the block is reachable from the list; even corrupt, its
        // header memory is still mapped.
        let found = unsafe { (*block).checksum };
        error!(
            "heap block {:#x} has an invalid checksum ({found:#x} != {BLOCK_CHECKSUM:#x})",
            block as usize
        );
        if self.policy == CorruptionPolicy::Halt {
            loop {
                core::hint::spin_loop();
            }
        }
    }

    pub fn alloc(&self, size: usize) -> *mut u8 {
        if size == 0 {
            warn!("attempted to allocate 0 bytes");
            return ptr::null_mut();
        }

        let _smap = SmapGuard::enter(self.smap_active.load(Relaxed));
        let mut list = self.list.lock();

        if list.head.is_null() {
            let head = self.new_block(size);
            if head.is_null() {
                return ptr::null_mut();
            }
            list.head = head;
            // SAFETY: freshly constructed block.
            return unsafe { (*head).address };
        }

        let mut current = list.head;
        while !current.is_null() {
            // SAFETY: blocks reachable from the head are live; corruption is
            // checked before any field other than the checksum is trusted.
            unsafe {
                if !(*current).check() {
                    self.on_corruption(current);
                } else if (*current).is_free && (*current).size >= size {
                    (*current).is_free = false;
                    ptr::write_bytes((*current).address, 0, size);
                    return (*current).address;
                }
                current = (*current).next;
            }
        }

        // No fit; append a fresh block at the tail.
        let block = self.new_block(size);
        if block.is_null() {
            return ptr::null_mut();
        }

        let mut tail = list.head;
        // SAFETY: the list was walked above without corruption fatal enough
        // to halt; tail chasing only follows `next` pointers.
        unsafe {
            while !(*tail).next.is_null() {
                tail = (*tail).next;
            }
            (*tail).next = block;
            (*block).prev = tail;
            (*block).address
        }
    }

    pub fn free(&self, address: *mut u8) {
        if address.is_null() {
            warn!("attempted to free a null pointer");
            return;
        }

        let _smap = SmapGuard::enter(self.smap_active.load(Relaxed));
        let list = self.list.lock();

        let mut current = list.head;
        while !current.is_null() {
            // SAFETY: see `alloc`.
            unsafe {
                if !(*current).check() {
                    self.on_corruption(current);
                } else if (*current).address == address {
                    if (*current).is_free {
                        warn!("attempted to free an already freed pointer");
                        return;
                    }
                    (*current).is_free = true;
                    return;
                }
                current = (*current).next;
            }
        }

        error!("attempted to free invalid address {:#x}", address as usize);
    }

    pub fn calloc(&self, blocks: usize, size: usize) -> *mut u8 {
        if blocks == 0 || size == 0 {
            warn!("attempted to allocate 0 bytes");
            return ptr::null_mut();
        }
        self.alloc(blocks * size)
    }

    /// Allocate-copy-free reallocation. An in-place resize would need block
    /// coalescing, which `arrange` does not implement.
    pub fn realloc(&self, address: *mut u8, size: usize) -> *mut u8 {
        if address.is_null() {
            return self.alloc(size);
        }
        if size == 0 {
            self.free(address);
            return ptr::null_mut();
        }

        let old_size = match self.size_of(address) {
            Some(s) => s,
            None => {
                error!(
                    "attempted to realloc invalid address {:#x}",
                    address as usize
                );
                return ptr::null_mut();
            }
        };

        let new = self.alloc(size);
        if new.is_null() {
            return ptr::null_mut();
        }
        // SAFETY: both regions are live payloads of at least
        // `min(old_size, size)` bytes and cannot overlap.
        unsafe {
            ptr::copy_nonoverlapping(address, new, old_size.min(size));
        }
        self.free(address);
        new
    }

    /// Coalescing of adjacent free blocks.
    pub fn arrange(&self) {
        error!("arrange() is not implemented yet");
    }

    /// Payload size of a live allocation, or `None` for unknown addresses.
    pub fn size_of(&self, address: *mut u8) -> Option<usize> {
        let list = self.list.lock();
        let mut current = list.head;
        while !current.is_null() {
            // SAFETY: see `alloc`.
            unsafe {
                if (*current).check() && (*current).address == address && !(*current).is_free {
                    return Some((*current).size);
                }
                current = (*current).next;
            }
        }
        None
    }

    /// Walks the whole list verifying checksums and the absence of cycles.
    /// Returns the number of blocks.
    pub fn verify(&self) -> Result<usize, HeapError> {
        let list = self.list.lock();
        let mut slow = list.head;
        let mut fast = list.head;
        let mut count = 0usize;

        while !slow.is_null() {
            // SAFETY: blocks reachable from the head are live headers.
            unsafe {
                if !(*slow).check() {
                    return Err(HeapError::Corrupt(slow as usize));
                }
                count += 1;
                slow = (*slow).next;

                // Floyd cycle detection: advance `fast` two steps.
                for _ in 0..2 {
                    if fast.is_null() {
                        break;
                    }
                    fast = (*fast).next;
                }
                if !slow.is_null() && slow == fast {
                    return Err(HeapError::Cyclic);
                }
            }
        }
        Ok(count)
    }
}

impl<P: PageProvider> Drop for BlockAllocator<P> {
    fn drop(&mut self) {
        let mut current = self.list.get_mut().head;
        while !current.is_null() {
            // SAFETY: blocks reachable from the head are live and owned by
            // the allocator; each is released exactly once.
            unsafe {
                let next = (*current).next;
                self.release_block(current);
                current = next;
            }
        }
        self.list.get_mut().head = ptr::null_mut();
    }
}

/// Scoped SMAP window. Opens supervisor access to user pages on construction
/// and closes it again when dropped, so every early return restores the
/// protection.
struct SmapGuard {
    active: bool,
}

impl SmapGuard {
    fn enter(active: bool) -> Self {
        if active {
            #[cfg(target_arch = "x86_64")]
            // SAFETY: `stac` only flips RFLAGS.AC; the caller verified SMAP
            // is supported and active.
            unsafe {
                core::arch::asm!("stac", options(nomem, nostack));
            }
        }
        Self { active }
    }
}

impl Drop for SmapGuard {
    fn drop(&mut self) {
        if self.active {
            #[cfg(target_arch = "x86_64")]
            // SAFETY: closing the window opened in `enter`.
            unsafe {
                core::arch::asm!("clac", options(nomem, nostack));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::alloc::{Layout, alloc_zeroed, dealloc};
    use alloc::vec::Vec;
    use core::sync::atomic::Ordering::Relaxed;

    use spin::Mutex;

    use super::*;

    #[derive(Default)]
    struct MockProvider {
        live: Mutex<Vec<(usize, usize)>>,
        exhausted: AtomicBool,
    }

    impl MockProvider {
        fn new() -> Self {
            Self::default()
        }

        fn outstanding(&self) -> usize {
            self.live.lock().len()
        }
    }

    // SAFETY: backed by the host allocator with page-aligned layouts.
    unsafe impl PageProvider for &MockProvider {
        fn request_pages(&self, count: usize) -> *mut u8 {
            if self.exhausted.load(Relaxed) {
                return ptr::null_mut();
            }
            let layout = Layout::from_size_align(count * PAGE_SIZE, PAGE_SIZE).unwrap();
            // SAFETY: non-zero layout.
            let ptr = unsafe { alloc_zeroed(layout) };
            self.live.lock().push((ptr as usize, count));
            ptr
        }

        fn free_pages(&self, addr: *mut u8, count: usize) {
            let mut live = self.live.lock();
            let pos = live
                .iter()
                .position(|&(a, c)| a == addr as usize && c == count)
                .expect("freeing pages that were never allocated");
            live.remove(pos);
            let layout = Layout::from_size_align(count * PAGE_SIZE, PAGE_SIZE).unwrap();
            // SAFETY: allocated with the identical layout above.
            unsafe { dealloc(addr, layout) };
        }
    }

    fn allocator(provider: &MockProvider) -> BlockAllocator<&MockProvider> {
        BlockAllocator::new(provider, CorruptionPolicy::Report)
    }

    #[test]
    fn zero_size_allocation_returns_null() {
        let provider = MockProvider::new();
        let heap = allocator(&provider);
        assert!(heap.alloc(0).is_null());
        assert_eq!(provider.outstanding(), 0);
    }

    #[test]
    fn roundtrip_zeroes_on_reuse() {
        let provider = MockProvider::new();
        let heap = allocator(&provider);

        let p = heap.alloc(1024);
        assert!(!p.is_null());
        // SAFETY: 1024-byte payload.
        unsafe { ptr::write_bytes(p, 0xAB, 1024) };
        heap.free(p);

        let q = heap.alloc(1024);
        assert!(!q.is_null());
        // SAFETY: freshly allocated payload.
        let first = unsafe { q.read() };
        assert_eq!(first, 0, "reused payload must be zeroed");
    }

    #[test]
    fn free_block_is_reused() {
        let provider = MockProvider::new();
        let heap = allocator(&provider);

        let p = heap.alloc(64);
        heap.free(p);
        let q = heap.alloc(64);
        assert_eq!(p, q);
        assert_eq!(heap.verify().unwrap(), 1);
    }

    #[test]
    fn double_free_warns_and_continues() {
        let provider = MockProvider::new();
        let heap = allocator(&provider);

        let p = heap.alloc(16);
        heap.free(p);
        heap.free(p);

        let q = heap.alloc(16);
        assert!(!q.is_null());
    }

    #[test]
    fn free_of_null_and_unknown_addresses_is_harmless() {
        let provider = MockProvider::new();
        let heap = allocator(&provider);
        heap.free(ptr::null_mut());
        heap.free(0xDEAD_0000 as *mut u8);
        assert!(!heap.alloc(8).is_null());
    }

    #[test]
    fn distinct_allocations_do_not_overlap() {
        let provider = MockProvider::new();
        let heap = allocator(&provider);

        let a = heap.alloc(100);
        let b = heap.alloc(100);
        // SAFETY: both payloads are at least 100 bytes.
        unsafe {
            ptr::write_bytes(a, 0x11, 100);
            ptr::write_bytes(b, 0x22, 100);
            assert_eq!(a.read(), 0x11);
            assert_eq!(b.read(), 0x22);
        }
        assert_eq!(heap.verify().unwrap(), 2);
    }

    #[test]
    fn calloc_rejects_zero_arguments() {
        let provider = MockProvider::new();
        let heap = allocator(&provider);
        assert!(heap.calloc(0, 8).is_null());
        assert!(heap.calloc(8, 0).is_null());
        assert!(!heap.calloc(4, 8).is_null());
    }

    #[test]
    fn realloc_preserves_contents() {
        let provider = MockProvider::new();
        let heap = allocator(&provider);

        let p = heap.alloc(32);
        // SAFETY: 32-byte payload.
        unsafe { ptr::copy_nonoverlapping(b"heap contents under test".as_ptr(), p, 24) };

        let q = heap.realloc(p, 4096);
        assert!(!q.is_null());
        // SAFETY: the first 24 bytes were copied over.
        let copied = unsafe { core::slice::from_raw_parts(q, 24) };
        assert_eq!(copied, b"heap contents under test");
    }

    #[test]
    fn realloc_null_allocates_and_zero_frees() {
        let provider = MockProvider::new();
        let heap = allocator(&provider);

        let p = heap.realloc(ptr::null_mut(), 16);
        assert!(!p.is_null());
        assert!(heap.realloc(p, 0).is_null());
        // The block is free again; the next allocation reuses it.
        assert_eq!(heap.alloc(16), p);
    }

    #[test]
    fn provider_exhaustion_surfaces_as_null() {
        let provider = MockProvider::new();
        let heap = allocator(&provider);
        provider.exhausted.store(true, Relaxed);
        assert!(heap.alloc(32).is_null());
    }

    #[test]
    fn all_reachable_blocks_carry_the_checksum() {
        let provider = MockProvider::new();
        let heap = allocator(&provider);
        let mut ptrs = Vec::new();
        for i in 1..=8usize {
            ptrs.push(heap.alloc(i * 100));
        }
        for p in ptrs.iter().step_by(2) {
            heap.free(*p);
        }
        assert_eq!(heap.verify().unwrap(), 8);
    }

    #[test]
    fn drop_returns_every_page_to_the_provider() {
        let provider = MockProvider::new();
        {
            let heap = allocator(&provider);
            let p = heap.alloc(PAGE_SIZE * 3);
            heap.alloc(17);
            heap.free(p);
            assert!(provider.outstanding() > 0);
        }
        assert_eq!(provider.outstanding(), 0);
    }
}
