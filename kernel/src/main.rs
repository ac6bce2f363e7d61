#![no_std]
#![no_main]
extern crate alloc;

use core::panic::PanicInfo;

#[cfg(target_arch = "x86_64")]
use kernel::limine::BASE_REVISION;
#[cfg(target_arch = "x86_64")]
use kernel::mcore;
use log::{error, info};
#[cfg(target_arch = "x86_64")]
use x86_64::instructions::hlt;

#[cfg(not(target_arch = "x86_64"))]
fn hlt() {}

#[cfg(target_arch = "x86_64")]
#[unsafe(export_name = "kernel_main")]
unsafe extern "C" fn main() -> ! {
    assert!(BASE_REVISION.is_supported());

    kernel::init(kernel_thread_main as usize as u64);

    // The scheduler tick carries execution over into the kernel main
    // thread; this boot context becomes idle.
    mcore::turn_idle()
}

/// Continuation of the kernel inside the tasking world.
#[cfg(target_arch = "x86_64")]
extern "C" fn kernel_thread_main() {
    info!("kernel main thread running");

    // Nothing else to do yet; stay alive for the shutdown path and yield
    // the CPU to whoever has work.
    use kernel_tasking::sched::Scheduler;
    loop {
        kernel::sched::scheduler().yield_now();
        hlt();
    }
}

#[cfg(not(target_arch = "x86_64"))]
#[unsafe(export_name = "kernel_main")]
unsafe extern "C" fn main() -> ! {
    loop {
        hlt();
    }
}

#[panic_handler]
#[cfg(not(test))]
fn rust_panic(info: &PanicInfo) -> ! {
    handle_panic(info);
    loop {
        hlt();
    }
}

#[cfg(not(test))]
fn handle_panic(info: &PanicInfo) {
    #[cfg(target_arch = "x86_64")]
    kernel::enter_panic_lock();

    let location = info.location().unwrap();
    error!(
        "kernel panicked at {}:{}:{}:",
        location.file(),
        location.line(),
        location.column(),
    );
    error!("{}", info.message());
}
