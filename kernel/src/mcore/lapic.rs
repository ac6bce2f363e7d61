//! Per-CPU Local APIC driver.
//!
//! Built on the `x2apic` crate for bring-up and the periodic scheduler
//! timer; raw register access is kept for the operations the crate does not
//! expose (ICR with delivery wait, one-shot timer reprogramming).

use core::ops::{Deref, DerefMut};

use x2apic::lapic::{xapic_base, LocalApicBuilder, TimerDivide, TimerMode};

use crate::arch::cpu;
use crate::arch::idt::LAPIC_ERR_VECTOR;
use crate::interrupts::{HALT_CORE_VECTOR, SCHEDULER_VECTOR, SPURIOUS_VECTOR};
use crate::mem::address_space::AddressSpace;

/// LAPIC timer ticks per millisecond at divide-by-16.
///
/// The scheduler tick below runs at roughly 10 ms; deriving the one-shot
/// scale from the same constant keeps both in the same unit.
const TIMER_TICKS_PER_MS: u64 = 31_250;

/// Scheduler tick interval in timer ticks (~10 ms).
const TIMER_PERIOD: u32 = 312_500;

mod reg {
    pub const EOI: u32 = 0xB0;
    pub const ICR_LOW: u32 = 0x300;
    pub const ICR_HIGH: u32 = 0x310;
    pub const LVT_TIMER: u32 = 0x320;
    pub const TIMER_INITIAL: u32 = 0x380;
    pub const TIMER_DIVIDE: u32 = 0x3E0;
}

/// ICR delivery status bit: idle (0) vs send pending (1).
const ICR_SEND_PENDING: u32 = 1 << 12;
const ICR_LEVEL_ASSERT: u32 = 1 << 14;
/// Message types (bits 8..=10).
const ICR_MT_INIT: u32 = 0b101 << 8;
const ICR_MT_STARTUP: u32 = 0b110 << 8;
/// Destination shorthands (bits 18..=19).
const ICR_DSH_SELF: u32 = 0b01 << 18;
const ICR_DSH_ALL_EXCLUDING_SELF: u32 = 0b11 << 18;

pub struct Lapic {
    inner: x2apic::lapic::LocalApic,
    /// Kernel-visible MMIO window.
    base: u64,
    apic_base: u64,
    x2apic_supported: bool,
}

impl Deref for Lapic {
    type Target = x2apic::lapic::LocalApic;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for Lapic {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

pub fn init() -> Lapic {
    // SAFETY: reading the APIC base MSR during bring-up is safe; the
    // bootloader left the APIC in its default state.
    let apic_base = unsafe { xapic_base() };
    let base = AddressSpace::kernel().map_mmio(apic_base);

    let mut lapic = LocalApicBuilder::new()
        .timer_vector(SCHEDULER_VECTOR as usize)
        .error_vector(LAPIC_ERR_VECTOR as usize)
        .spurious_vector(SPURIOUS_VECTOR as usize)
        .set_xapic_base(base)
        .timer_mode(TimerMode::Periodic)
        .timer_initial(TIMER_PERIOD)
        .timer_divide(TimerDivide::Div16)
        .build()
        .expect("should be able to build lapic");

    // SAFETY: the LAPIC was configured above.
    unsafe {
        lapic.enable();
    }

    Lapic {
        inner: lapic,
        base,
        apic_base,
        x2apic_supported: cpu::x2apic_supported(),
    }
}

impl Lapic {
    #[must_use]
    pub fn apic_base(&self) -> u64 {
        self.apic_base
    }

    #[must_use]
    pub fn x2apic_supported(&self) -> bool {
        self.x2apic_supported
    }

    /// Raw register read on the LAPIC MMIO window.
    #[must_use]
    pub fn read(&self, register: u32) -> u32 {
        // SAFETY: the window was mapped uncached at init; register offsets
        // come from the constants above.
        unsafe { ((self.base + u64::from(register)) as *const u32).read_volatile() }
    }

    /// Raw register write on the LAPIC MMIO window.
    pub fn write(&self, register: u32, value: u32) {
        // SAFETY: see `read`.
        unsafe { ((self.base + u64::from(register)) as *mut u32).write_volatile(value) };
    }

    /// Signals end-of-interrupt.
    pub fn eoi(&self) {
        self.write(reg::EOI, 0);
    }

    /// Writes the interrupt command register and busy-waits until the
    /// delivery status returns to idle.
    pub fn icr(&self, value: u64) {
        self.write(reg::ICR_HIGH, (value >> 32) as u32);
        self.write(reg::ICR_LOW, value as u32);
        while self.read(reg::ICR_LOW) & ICR_SEND_PENDING != 0 {
            cpu::pause();
        }
    }

    /// INIT IPI, used by SMP boot.
    pub fn send_init_ipi(&self, lapic_id: u32) {
        self.icr(u64::from(lapic_id) << 56 | u64::from(ICR_MT_INIT | ICR_LEVEL_ASSERT));
    }

    /// STARTUP IPI pointing the target at `startup_address` (page-aligned,
    /// below 1 MiB).
    pub fn send_startup_ipi(&self, lapic_id: u32, startup_address: u64) {
        let vector = (startup_address >> 12) & 0xFF;
        self.icr(u64::from(lapic_id) << 56 | u64::from(ICR_MT_STARTUP) | vector);
    }

    /// Fixed IPI to this CPU.
    pub fn send_self(&self, vector: u8) {
        self.icr(u64::from(ICR_DSH_SELF) | u64::from(vector));
    }

    /// Fixed IPI to every other CPU.
    pub fn send_all_excluding_self(&self, vector: u8) {
        self.icr(u64::from(ICR_DSH_ALL_EXCLUDING_SELF) | u64::from(vector));
    }

    /// Halts every other core; used from the panic path.
    pub fn halt_other_cores(&self) {
        self.send_all_excluding_self(HALT_CORE_VECTOR);
    }

    /// Programs the timer to fire once on `vector` after `milliseconds`.
    pub fn one_shot(&self, vector: u8, milliseconds: u64) {
        self.write(reg::TIMER_DIVIDE, 0b011); // divide by 16
        self.write(reg::LVT_TIMER, u32::from(vector)); // one-shot, unmasked
        let ticks = (milliseconds * TIMER_TICKS_PER_MS).min(u64::from(u32::MAX)) as u32;
        self.write(reg::TIMER_INITIAL, ticks);
    }

    /// Restores the periodic scheduler tick after a one-shot.
    pub fn restart_periodic(&self) {
        self.write(reg::TIMER_DIVIDE, 0b011);
        self.write(
            reg::LVT_TIMER,
            u32::from(SCHEDULER_VECTOR) | (0b01 << 17), // periodic
        );
        self.write(reg::TIMER_INITIAL, TIMER_PERIOD);
    }
}
