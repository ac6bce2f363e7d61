#![no_std]
#![no_main]
#![cfg_attr(target_arch = "x86_64", feature(abi_x86_interrupt))]
extern crate alloc;

use ::log::info;

#[cfg(target_arch = "x86_64")]
mod acpi;
#[cfg(target_arch = "x86_64")]
pub mod apic;
pub mod arch;
pub mod config;
#[cfg(target_arch = "x86_64")]
pub mod driver;
#[cfg(target_arch = "x86_64")]
pub mod interrupts;
#[cfg(target_arch = "x86_64")]
pub mod limine;
#[cfg(target_arch = "x86_64")]
mod log;
#[cfg(target_arch = "x86_64")]
pub mod mcore;
#[cfg(target_arch = "x86_64")]
pub mod mem;
#[cfg(target_arch = "x86_64")]
pub mod sched;
#[cfg(target_arch = "x86_64")]
mod serial;
#[cfg(target_arch = "x86_64")]
pub mod tasking;

// Provide a dummy allocator for targets without a memory manager yet.
#[cfg(not(target_arch = "x86_64"))]
#[global_allocator]
static ALLOCATOR: DummyAllocator = DummyAllocator;

#[cfg(not(target_arch = "x86_64"))]
struct DummyAllocator;

#[cfg(not(target_arch = "x86_64"))]
unsafe impl core::alloc::GlobalAlloc for DummyAllocator {
    unsafe fn alloc(&self, _layout: core::alloc::Layout) -> *mut u8 {
        core::ptr::null_mut()
    }
    unsafe fn dealloc(&self, _ptr: *mut u8, _layout: core::alloc::Layout) {}
}

/// Brings the kernel up. `entry_point` is where the kernel main thread
/// continues once the scheduler takes over.
#[cfg(target_arch = "x86_64")]
pub fn init(entry_point: u64) {
    log::init();
    info!("logging initialized");

    config::init(config::KernelConfig::default());

    mem::init();
    acpi::init();
    apic::init();
    sched::init();
    mcore::init();

    info!("initializing tasking...");
    tasking::init(entry_point);

    info!("arming ACPI events...");
    acpi::events::init();

    info!("starting scheduler...");
    use kernel_tasking::sched::Scheduler;
    sched::scheduler().start();

    info!("kernel initialized");
}

/// Enters the panic lock: scheduling stops everywhere, every other core is
/// halted, and this core is parked by the caller.
#[cfg(target_arch = "x86_64")]
pub fn enter_panic_lock() {
    use crate::mcore::context::ExecutionContext;

    if let Some(manager) = tasking::try_tasking() {
        manager.panic();
    }
    if let Some(ctx) = ExecutionContext::try_load() {
        ctx.lapic().lock().halt_other_cores();
    }
}
