//! Per-CPU execution context, reachable through `KernelGsBase`.

use alloc::sync::Arc;

use kernel_tasking::process::Process;
use kernel_tasking::thread::Thread;
use spin::{Mutex, RwLock};
use x86_64::registers::model_specific::KernelGsBase;
use x86_64::structures::gdt::GlobalDescriptorTable;
use x86_64::structures::idt::InterruptDescriptorTable;
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

use crate::arch::cpu;
use crate::arch::gdt::Selectors;
use crate::mcore::lapic::Lapic;

/// Sanity word verified on every context load; catches a clobbered
/// `KernelGsBase` before it can be followed anywhere.
const CPU_DATA_CHECKSUM: u32 = 0xC0DE_CA4E;

pub struct ExecutionContext {
    checksum: u32,
    cpu_id: usize,
    lapic_id: usize,

    lapic: Mutex<Lapic>,

    _gdt: &'static GlobalDescriptorTable,
    sel: Selectors,
    _idt: &'static InterruptDescriptorTable,
    tss: Mutex<&'static mut TaskStateSegment>,

    current_process: RwLock<Option<Arc<Process>>>,
    current_thread: RwLock<Option<Arc<Thread>>>,
}

impl ExecutionContext {
    pub fn new(
        cpu_id: usize,
        lapic_id: usize,
        gdt: &'static GlobalDescriptorTable,
        sel: Selectors,
        idt: &'static InterruptDescriptorTable,
        tss: &'static mut TaskStateSegment,
        lapic: Lapic,
    ) -> Self {
        Self {
            checksum: CPU_DATA_CHECKSUM,
            cpu_id,
            lapic_id,
            lapic: Mutex::new(lapic),
            _gdt: gdt,
            sel,
            _idt: idt,
            tss: Mutex::new(tss),
            current_process: RwLock::new(None),
            current_thread: RwLock::new(None),
        }
    }

    /// Publishes this context as the calling CPU's.
    pub fn install(self) -> &'static Self {
        let ctx = alloc::boxed::Box::leak(alloc::boxed::Box::new(self));
        KernelGsBase::write(VirtAddr::from_ptr(core::ptr::from_ref(ctx)));
        ctx
    }

    #[must_use]
    pub fn try_load() -> Option<&'static Self> {
        let ptr = KernelGsBase::read();
        if ptr.is_null() {
            return None;
        }
        // SAFETY: a non-null KernelGsBase was written by `install` and points
        // at a leaked, 'static context.
        let ctx: &'static Self = unsafe { &*ptr.as_ptr() };
        if ctx.checksum != CPU_DATA_CHECKSUM {
            log::error!(
                "cpu context checksum mismatch ({:#x} != {:#x})",
                ctx.checksum,
                CPU_DATA_CHECKSUM
            );
            cpu::stop();
        }
        Some(ctx)
    }

    /// # Panics
    /// Panics if no execution context has been installed on this CPU yet.
    #[must_use]
    pub fn load() -> &'static Self {
        Self::try_load().expect("could not load cpu context")
    }

    #[must_use]
    pub fn cpu_id(&self) -> usize {
        self.cpu_id
    }

    #[must_use]
    pub fn lapic_id(&self) -> usize {
        self.lapic_id
    }

    #[must_use]
    pub fn lapic(&self) -> &Mutex<Lapic> {
        &self.lapic
    }

    #[must_use]
    pub fn selectors(&self) -> &Selectors {
        &self.sel
    }

    /// Points RSP0 at the stack the CPU switches to on a privilege change.
    pub fn set_tss_rsp0(&self, rsp0: u64) {
        self.tss.lock().privilege_stack_table[0] = VirtAddr::new(rsp0);
    }

    #[must_use]
    pub fn current_process(&self) -> Option<Arc<Process>> {
        self.current_process.read().clone()
    }

    #[must_use]
    pub fn current_thread(&self) -> Option<Arc<Thread>> {
        self.current_thread.read().clone()
    }

    pub fn set_current(&self, process: Arc<Process>, thread: Arc<Thread>) {
        *self.current_process.write() = Some(process);
        *self.current_thread.write() = Some(thread);
    }
}
