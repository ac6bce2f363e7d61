//! The interrupt core: owns the registered-events set, routes every trap to
//! at most one handler and enforces end-of-interrupt.
//!
//! Vector space: 0-31 are CPU exceptions (handled in `arch::idt`), 32-47 the
//! legacy IRQ mapping, 48-223 device IRQs. IRQ16 (vector 48) carries the
//! scheduler tick, IRQ31 (vector 63) the halt-this-core IPI.

use core::ffi::c_void;
use core::ptr::NonNull;

use alloc::sync::Arc;

use kernel_events::{EventRegistry, InterruptHandler, IrqCallback};
use kernel_tasking::frame::{SchedulerFrame, TrapFrame};
use log::{error, warn};
use spin::Mutex;

use crate::arch::cpu;
use crate::mcore::context::ExecutionContext;
use crate::mem::address_space::AddressSpace;

/// Vector of IRQ0.
pub const IRQ_BASE: u8 = 32;
/// IRQ carrying the scheduler tick.
pub const SCHEDULER_IRQ: u8 = 16;
/// IRQ carrying the halt-this-core IPI.
pub const HALT_CORE_IRQ: u8 = 31;
/// Highest routable IRQ.
pub const MAX_IRQ: u8 = 223;

pub const SCHEDULER_VECTOR: u8 = IRQ_BASE + SCHEDULER_IRQ;
pub const HALT_CORE_VECTOR: u8 = IRQ_BASE + HALT_CORE_IRQ;
pub const SPURIOUS_VECTOR: u8 = 0xFF;

static EVENTS: Mutex<EventRegistry<TrapFrame>> = Mutex::new(EventRegistry::new());

/// Mutates the registry with interrupts off: dispatch takes the same lock
/// from interrupt context, and a tick landing on a held lock would spin this
/// CPU forever.
fn with_events<R>(f: impl FnOnce(&mut EventRegistry<TrapFrame>) -> R) -> R {
    x86_64::instructions::interrupts::without_interrupts(|| f(&mut EVENTS.lock()))
}

/// Registers a C-style callback for `irq`. Duplicates are permitted (and
/// logged). `critical` entries survive [`remove_all`].
pub fn add_callback(irq: u8, func: IrqCallback, context: Option<NonNull<c_void>>, critical: bool) {
    with_events(|events| events.add_callback(irq, func, context, critical));
}

/// Registers a handler object for `irq`.
pub fn add_handler(irq: u8, handler: Arc<dyn InterruptHandler<TrapFrame>>, critical: bool) {
    with_events(|events| events.add_handler(irq, handler, critical));
}

/// Removes all non-critical events on `irq`.
pub fn remove_irq(irq: u8) {
    with_events(|events| events.remove_irq(irq));
}

/// Removes all non-critical registrations of `func`.
pub fn remove_callback(func: IrqCallback) {
    with_events(|events| events.remove_callback(func));
}

/// Removes the non-critical registration of `func` on `irq`.
pub fn remove_callback_on(irq: u8, func: IrqCallback) {
    with_events(|events| events.remove_callback_on(irq, func));
}

/// Removes all non-critical registrations of a handler object.
pub fn remove_handler(handler: &Arc<dyn InterruptHandler<TrapFrame>>) {
    with_events(|events| events.remove_handler(handler));
}

/// Removes every non-critical event; used on kernel shutdown. Critical
/// entries (the SCI handler, the scheduler tick) stay armed.
pub fn remove_all() {
    with_events(EventRegistry::remove_all);
}

/// Scoped acquisition of the kernel page table: entered before any kernel
/// data is touched, restores the interrupted root on every exit path.
struct KernelPageTableScope {
    previous: u64,
}

impl KernelPageTableScope {
    fn enter() -> Self {
        let kernel_root = AddressSpace::kernel().root();
        let previous = cpu::page_table(Some(kernel_root));
        Self { previous }
    }
}

impl Drop for KernelPageTableScope {
    fn drop(&mut self) {
        cpu::page_table(Some(self.previous));
    }
}

/// Entry point of the device-vector stubs.
pub(crate) extern "sysv64" fn irq_entry(frame: *mut TrapFrame) {
    // SAFETY: the stub passes a pointer to the frame it just assembled on
    // this CPU's stack.
    main_handler(unsafe { &mut *frame });
}

/// Routes one interrupt: find the first matching event, bump its priority,
/// invoke it, EOI.
pub fn main_handler(frame: &mut TrapFrame) {
    let _kernel_pt = KernelPageTableScope::enter();

    if frame.vector == u64::from(HALT_CORE_VECTOR) {
        cpu::stop();
    }
    debug_assert!(frame.vector <= u64::from(IRQ_BASE + MAX_IRQ));

    match frame.irq(IRQ_BASE) {
        Some(irq) => {
            // Resolve under the lock, invoke outside it: a handler may
            // (de)register events itself.
            let target = EVENTS.lock().resolve(irq);
            match target {
                Some(target) => target.invoke(frame),
                None => warn!("IRQ{irq} is not registered"),
            }
        }
        None => warn!("vector {} below the IRQ base", frame.vector),
    }

    end_of_interrupt();
}

/// Entry point of the scheduler-vector stub.
pub(crate) extern "sysv64" fn scheduler_entry(frame: *mut SchedulerFrame) {
    // SAFETY: the scheduler stub passes the frame it just assembled.
    scheduler_handler(unsafe { &mut *frame });
}

/// Scheduler-tick dispatch: structurally the same as [`main_handler`], but
/// exclusive to the scheduler vector and carrying the page-table roots.
pub fn scheduler_handler(frame: &mut SchedulerFrame) {
    let _kernel_pt = KernelPageTableScope::enter();

    debug_assert_eq!(frame.trap.vector, u64::from(SCHEDULER_VECTOR));

    let target = EVENTS.lock().resolve(SCHEDULER_IRQ);
    match target {
        Some(target) => {
            // The tick handler recovers the full SchedulerFrame; see
            // `sched::SchedulerTick`.
            target.invoke(&mut frame.trap);
        }
        None => {
            warn!("scheduler interrupt is not registered");
            frame.ppt = frame.opt;
        }
    }

    end_of_interrupt();
}

/// Signals end-of-interrupt on this CPU's Local APIC. A missing LAPIC at
/// this point is a kernel bug.
pub fn end_of_interrupt() {
    match ExecutionContext::try_load() {
        Some(ctx) => ctx.lapic().lock().eoi(),
        None => error!("EOI with no execution context; kernel bug"),
    }
}
