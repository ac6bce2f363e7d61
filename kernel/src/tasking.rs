//! Bindings between the tasking core and this machine: platform facts,
//! page supply, `/proc` hooks and the global task manager.

use alloc::sync::Arc;
use core::ptr::NonNull;

use conquer_once::spin::OnceCell;
use kernel_tasking::mm::{PageBlock, TaskMemory};
use kernel_tasking::platform::{MsrBases, Platform, ProcFs, SelectorSet};
use kernel_tasking::process::Pid;
use kernel_tasking::state::TaskState;
use kernel_tasking::TaskManager;
use log::debug;
use x86_64::registers::model_specific::{FsBase, GsBase, KernelGsBase};

use crate::arch::cpu;
use crate::mcore::context::ExecutionContext;
use crate::mem::address_space::AddressSpace;
use crate::mem::phys::{phys_to_virt, PhysicalMemory};
use crate::sched;

static TASKING: OnceCell<Arc<TaskManager>> = OnceCell::uninit();

/// Rough TSC ticks per millisecond; sleep granularity only.
const TSC_TICKS_PER_MS: u64 = 1_000_000;

pub fn init(entry_point: u64) {
    let manager = TaskManager::new(
        Arc::new(KernelPlatform),
        Arc::new(KernelTaskMemory),
        AddressSpace::kernel().clone(),
        Arc::new(KernelProcFs),
        sched::scheduler().clone(),
        entry_point,
    );
    sched::scheduler().attach_manager(manager.clone());
    TASKING.init_once(|| manager);
}

/// # Panics
/// Panics before `init` ran.
pub fn tasking() -> &'static Arc<TaskManager> {
    TASKING.get().expect("tasking not initialized")
}

pub fn try_tasking() -> Option<&'static Arc<TaskManager>> {
    TASKING.get()
}

/// Return target of kernel threads: marks the current thread terminated and
/// parks until the scheduler moves on.
pub extern "C" fn thread_exit() -> ! {
    let ctx = ExecutionContext::load();
    if let Some(thread) = ctx.current_thread() {
        debug!(
            "thread {:?} ({}) exited with code {:#x}",
            thread.name(),
            thread.id(),
            thread.exit_code()
        );
        thread.set_state(TaskState::Terminated);
    }
    cpu::interrupts(cpu::InterruptsOp::Enable);
    loop {
        cpu::halt(false);
    }
}

struct KernelPlatform;

impl Platform for KernelPlatform {
    fn selectors(&self) -> SelectorSet {
        let sel = *ExecutionContext::load().selectors();
        SelectorSet {
            kernel_code: sel.kernel_code.0,
            kernel_data: sel.kernel_data.0,
            user_code: sel.user_code.0,
            user_data: sel.user_data.0,
        }
    }

    fn thread_exit_trampoline(&self) -> u64 {
        thread_exit as usize as u64
    }

    fn msr_bases(&self) -> MsrBases {
        MsrBases {
            gs: GsBase::read().as_u64(),
            fs: FsBase::read().as_u64(),
            shadow_gs: KernelGsBase::read().as_u64(),
        }
    }

    fn counter(&self) -> u64 {
        cpu::counter()
    }

    fn ticks_per_millisecond(&self) -> u64 {
        TSC_TICKS_PER_MS
    }

    fn interrupts_enabled(&self) -> bool {
        cpu::interrupts(cpu::InterruptsOp::Check)
    }

    fn enable_interrupts(&self) {
        cpu::interrupts(cpu::InterruptsOp::Enable);
    }
}

struct KernelTaskMemory;

impl TaskMemory for KernelTaskMemory {
    fn request_pages(&self, pages: usize) -> Option<PageBlock> {
        let phys = PhysicalMemory::allocate_pages(pages)?;
        let ptr = NonNull::new(phys_to_virt(phys))?;
        Some(PageBlock { ptr, phys, pages })
    }

    fn free_pages(&self, block: PageBlock) {
        PhysicalMemory::free_pages(block.phys, block.pages);
    }
}

/// `/proc` integration point. The process tree is published to the VFS by
/// the filesystem layer; the tasking core only reports the events.
struct KernelProcFs;

impl ProcFs for KernelProcFs {
    fn create_process_dir(&self, pid: Pid) {
        debug!("procfs: create /proc/{pid}");
    }

    fn remove_process_dir(&self, pid: Pid) {
        debug!("procfs: remove /proc/{pid}");
    }

    fn set_cwd_link(&self, pid: Pid, target: &str) {
        debug!("procfs: /proc/{pid}/cwd -> {target}");
    }

    fn set_exe_link(&self, pid: Pid, target: &str) {
        debug!("procfs: /proc/{pid}/exe -> {target}");
    }
}
