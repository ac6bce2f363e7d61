//! Thread-local storage layout.
//!
//! Processes carry a TLS template taken from their executable image; each
//! thread gets a private, guard-paged copy with the ABI self-pointer placed
//! just past the image, so the first user instruction can load `fs:0` (or
//! `gs:0`) and find the address of the slot itself.

use core::ptr;

use crate::mm::{PAGE_SIZE, VirtualMemoryArea, VmaRegion, pages_for};

/// Per-process TLS template. `image` is the kernel-visible address of the
/// initialized data; `fsize` of the `size` bytes are backed by the file, the
/// rest is zero-filled BSS.
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsTemplate {
    pub image: u64,
    pub vbase: u64,
    pub size: usize,
    pub fsize: usize,
}

impl TlsTemplate {
    #[must_use]
    pub fn is_present(&self) -> bool {
        self.image != 0
    }
}

/// One thread's private TLS block.
#[derive(Debug, Clone, Copy)]
pub struct ThreadTls {
    region: VmaRegion,
    /// Kernel-visible base of the image copy.
    pub pbase: u64,
    /// Base of the image in the owning address space.
    pub vbase: u64,
    pub size: usize,
    pub fsize: usize,
    /// Value for the fs/gs base: the self-pointer slot just past the image.
    pub pointer: u64,
}

impl ThreadTls {
    /// Copies the template into a fresh guard-paged allocation.
    pub fn for_thread(
        vma: &VirtualMemoryArea,
        template: &TlsTemplate,
        user: bool,
    ) -> Option<Self> {
        if !template.is_present() {
            return None;
        }

        let full_size = size_of::<usize>() + template.size;
        let pages = 1 + pages_for(full_size) + 1;
        let region = vma.request_pages(pages, user)?;

        let address_space = vma.address_space();
        address_space.unmap(region.virt, 1);
        address_space.unmap(region.virt + ((pages - 1) * PAGE_SIZE) as u64, 1);

        let base = region.ptr.as_ptr().wrapping_add(PAGE_SIZE);
        let vbase = region.virt + PAGE_SIZE as u64;
        // SAFETY: the usable range spans `full_size` bytes past the guard
        // page, and the template image is kernel-visible per its contract.
        unsafe {
            ptr::copy_nonoverlapping(template.image as *const u8, base, template.fsize);
            ptr::write_bytes(base.add(template.fsize), 0, template.size - template.fsize);

            // ABI self-pointer just past the image.
            let slot = base.add(template.size).cast::<u64>();
            slot.write(vbase + template.size as u64);
        }

        Some(Self {
            region,
            pbase: base as u64,
            vbase,
            size: template.size,
            fsize: template.fsize,
            pointer: vbase + template.size as u64,
        })
    }

    pub fn release(&self, vma: &VirtualMemoryArea) {
        vma.release(&self.region);
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use super::*;
    use crate::testing::{MockAddressSpace, MockMemory};

    #[test]
    fn thread_tls_copies_image_and_plants_self_pointer() {
        let memory = Arc::new(MockMemory::new());
        let aspace = MockAddressSpace::new_arc();
        let vma = VirtualMemoryArea::new(memory, aspace.clone());

        let image = [0xC3u8; 24];
        let template = TlsTemplate {
            image: image.as_ptr() as u64,
            vbase: 0,
            size: 64,
            fsize: 24,
        };

        let tls = ThreadTls::for_thread(&vma, &template, true).unwrap();

        // SAFETY: the mock memory block is live and exclusively ours.
        unsafe {
            let base = tls.pbase as *const u8;
            for i in 0..24 {
                assert_eq!(base.add(i).read(), 0xC3);
            }
            for i in 24..64 {
                assert_eq!(base.add(i).read(), 0, "BSS must be zero-filled");
            }
            // fs:0 (the slot the fs base points at) holds its own address.
            let slot = base.add(64).cast::<u64>();
            assert_eq!(slot.read(), tls.vbase + 64);
            assert_eq!(tls.pointer, tls.vbase + 64);
        }

        // Guard pages unmapped on both sides of the image.
        assert!(aspace.is_unmapped(tls.vbase - PAGE_SIZE as u64));
        let high_guard = tls.vbase + (pages_for(64 + 8) * PAGE_SIZE) as u64;
        assert!(aspace.is_unmapped(high_guard));
    }

    #[test]
    fn absent_template_yields_no_tls() {
        let memory = Arc::new(MockMemory::new());
        let aspace = MockAddressSpace::new_arc();
        let vma = VirtualMemoryArea::new(memory, aspace);
        assert!(ThreadTls::for_thread(&vma, &TlsTemplate::default(), true).is_none());
    }
}
