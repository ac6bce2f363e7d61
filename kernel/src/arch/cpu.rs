//! Thin CPU capability: interrupt-flag control, idling, page-table root
//! swapping, the monotone tick counter and FPU state save/restore.

use core::arch::asm;
use core::arch::x86_64::{_fxrstor, _fxsave, _rdtsc};

use x86_64::instructions::interrupts;
use x86_64::instructions::{hlt, nop};
use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::PhysFrame;
use x86_64::PhysAddr;

use kernel_tasking::thread::FxArea;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptsOp {
    /// Report whether interrupts are enabled.
    Check,
    Enable,
    Disable,
}

/// Queries or flips the interrupt flag. Returns the enable state after the
/// operation; `Check` leaves it untouched. Enable/disable compile down to
/// `sti`/`cli`, which the compiler may not reorder across adjacent memory
/// accesses.
pub fn interrupts(op: InterruptsOp) -> bool {
    match op {
        InterruptsOp::Check => interrupts::are_enabled(),
        InterruptsOp::Enable => {
            interrupts::enable();
            true
        }
        InterruptsOp::Disable => {
            interrupts::disable();
            false
        }
    }
}

/// Spin-loop hint.
pub fn pause() {
    core::hint::spin_loop();
}

/// Waits for the next interrupt; with `forever`, keeps waiting.
pub fn halt(forever: bool) {
    if forever {
        loop {
            hlt();
        }
    }
    hlt();
}

/// Halts this core for good, interrupts off.
pub fn stop() -> ! {
    loop {
        interrupts::disable();
        hlt();
        nop();
    }
}

/// Reads the active page-table root, optionally swapping in a new one.
/// Returns the root that was active before the call.
pub fn page_table(new_root: Option<u64>) -> u64 {
    let (frame, flags) = Cr3::read();
    let previous = frame.start_address().as_u64();
    if let Some(root) = new_root {
        if root != previous {
            // SAFETY: the caller hands us a valid page-table root; switching
            // CR3 is the point of this function.
            unsafe {
                Cr3::write(
                    PhysFrame::containing_address(PhysAddr::new(root)),
                    Cr3Flags::empty(),
                );
            }
        }
        let _ = flags;
    }
    previous
}

/// Monotonically non-decreasing tick, read from the time-stamp counter.
pub fn counter() -> u64 {
    // SAFETY: rdtsc has no side effects.
    unsafe { _rdtsc() }
}

/// Saves the FPU/SSE state into `area`.
pub fn fpu_save(area: &mut FxArea) {
    // SAFETY: the area is 512 bytes and 16-byte aligned by its type.
    unsafe { _fxsave(area.as_mut_ptr()) };
}

/// Restores the FPU/SSE state from `area`.
pub fn fpu_restore(area: &FxArea) {
    // SAFETY: the area is 512 bytes, 16-byte aligned, and was written by
    // `fxsave`.
    unsafe { _fxrstor(area.as_ptr()) };
}

/// Clears CR0.TS so FPU instructions do not fault.
pub fn clear_task_switched() {
    // SAFETY: clts only clears the task-switched flag.
    unsafe { asm!("clts", options(nomem, nostack)) };
}

/// True when the CPU supports and the kernel has enabled SMAP.
pub fn smap_active() -> bool {
    use x86_64::registers::control::{Cr4, Cr4Flags};

    let supported = raw_cpuid::CpuId::new()
        .get_extended_feature_info()
        .is_some_and(|f| f.has_smap());
    supported && Cr4::read().contains(Cr4Flags::SUPERVISOR_MODE_ACCESS_PREVENTION)
}

/// True when the CPU supports x2APIC mode.
pub fn x2apic_supported() -> bool {
    raw_cpuid::CpuId::new()
        .get_feature_info()
        .is_some_and(|f| f.has_x2apic())
}
