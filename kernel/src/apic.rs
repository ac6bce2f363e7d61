//! IOAPIC programming and legacy-IRQ routing.

use alloc::vec::Vec;

use acpi::platform::interrupt::{Polarity, TriggerMode};
use acpi::{InterruptModel, PlatformInfo};
use conquer_once::spin::OnceCell;
use log::{debug, info};
use spin::Mutex;
use x2apic::ioapic::{IoApic as RawIoApic, IrqFlags, IrqMode, RedirectionTableEntry};
use x86_64::instructions::port::Port;

use crate::acpi::acpi_tables;
use crate::interrupts::IRQ_BASE;
use crate::mem::address_space::AddressSpace;

static IO_APIC: OnceCell<Mutex<IoApic>> = OnceCell::uninit();

/// ISA-IRQ overrides from the MADT: (isa irq, global system interrupt,
/// polarity, trigger mode).
static SOURCE_OVERRIDES: OnceCell<Vec<(u8, u32, Polarity, TriggerMode)>> = OnceCell::uninit();

pub fn io_apic() -> &'static Mutex<IoApic> {
    IO_APIC.get().expect("IOAPIC not initialized")
}

pub struct IoApic {
    /// Kernel-visible MMIO window.
    base: u64,
    inner: RawIoApic,
}

impl IoApic {
    /// Raw IOAPIC register read through the index/data window.
    #[must_use]
    pub fn io_read(&mut self, register: u32) -> u32 {
        // SAFETY: the window was mapped uncached at init; the IOAPIC
        // index/data pair sits at offsets 0 and 0x10.
        unsafe {
            (self.base as *mut u32).write_volatile(register);
            ((self.base + 0x10) as *const u32).read_volatile()
        }
    }

    /// Raw IOAPIC register write through the index/data window.
    pub fn io_write(&mut self, register: u32, value: u32) {
        // SAFETY: see `io_read`.
        unsafe {
            (self.base as *mut u32).write_volatile(register);
            ((self.base + 0x10) as *mut u32).write_volatile(value);
        }
    }

    /// Highest redirection entry index supported by this IOAPIC.
    pub fn max_redirect(&mut self) -> u32 {
        (self.io_read(0x01) >> 16) & 0xFF
    }
}

pub fn init() {
    disable_8259();

    let acpi_tables = acpi_tables();
    let acpi_tables = acpi_tables.lock();

    let Ok(platform_info) = PlatformInfo::new(&acpi_tables) else {
        panic!("failed to get platform info");
    };
    let InterruptModel::Apic(apic) = platform_info.interrupt_model else {
        panic!("unsupported interrupt model");
    };

    SOURCE_OVERRIDES.init_once(|| {
        apic.interrupt_source_overrides
            .iter()
            .map(|iso| {
                (
                    iso.isa_source,
                    iso.global_system_interrupt,
                    iso.polarity,
                    iso.trigger_mode,
                )
            })
            .collect()
    });

    let io_apics = apic.io_apics;
    assert_eq!(
        io_apics.len(),
        1,
        "only exactly one IOAPIC is supported for now"
    );

    let io_apic = io_apics.last().unwrap();
    let base = AddressSpace::kernel().map_mmio(u64::from(io_apic.address));

    // SAFETY: the IOAPIC registers were just mapped at `base`; the vector
    // offset keeps redirections clear of the exception range.
    let inner = unsafe {
        let mut raw = RawIoApic::new(base);
        raw.init(IRQ_BASE);
        raw
    };

    IO_APIC.init_once(|| Mutex::new(IoApic { base, inner }));
    info!("IOAPIC at {:#x} initialized", io_apic.address);
}

/// Translates an ISA IRQ through the MADT source overrides: the global
/// system interrupt it is wired to plus the redirection flags.
fn translate_irq(irq: u8) -> (u8, IrqFlags) {
    let overrides = SOURCE_OVERRIDES.get().expect("IOAPIC not initialized");
    for (isa, gsi, polarity, trigger) in overrides {
        if *isa != irq {
            continue;
        }
        let mut flags = IrqFlags::empty();
        if matches!(polarity, Polarity::ActiveLow) {
            flags |= IrqFlags::LOW_ACTIVE;
        }
        if matches!(trigger, TriggerMode::Level) {
            flags |= IrqFlags::LEVEL_TRIGGERED;
        }
        return (*gsi as u8, flags);
    }
    (irq, IrqFlags::empty())
}

/// Routes one legacy IRQ through the IOAPIC to the CPU with `lapic_id`.
/// `enabled` unmasks or masks the entry.
pub fn redirect_irq(lapic_id: u8, irq: u8, enabled: bool) {
    let (gsi, flags) = translate_irq(irq);

    let mut entry = RedirectionTableEntry::default();
    entry.set_mode(IrqMode::Fixed);
    entry.set_flags(flags);
    entry.set_vector(IRQ_BASE + irq);
    entry.set_dest(lapic_id);

    let mut io_apic = io_apic().lock();
    // SAFETY: the entry routes to a vector backed by an installed stub.
    unsafe {
        io_apic.inner.set_table_entry(gsi, entry);
        if enabled {
            io_apic.inner.enable_irq(gsi);
        } else {
            io_apic.inner.disable_irq(gsi);
        }
    }
    debug!("redirected IRQ{irq} (gsi {gsi}) to lapic {lapic_id}, enabled: {enabled}");
}

/// Installs all legacy IRQs on a single target CPU.
pub fn redirect_irqs(lapic_id: u8) {
    for irq in 0..16 {
        redirect_irq(lapic_id, irq, true);
    }
}

#[allow(clippy::similar_names)]
fn disable_8259() {
    // Remap and fully mask the legacy PIC pair so only the APIC delivers.
    // SAFETY: standard 8259 initialization sequence on its well-known ports;
    // port 0x80 writes provide the required IO delay.
    unsafe {
        let mut cmd_8259a = Port::<u8>::new(0x20);
        let mut data_8259a = Port::<u8>::new(0x21);
        let mut cmd_8259b = Port::<u8>::new(0xa0);
        let mut data_8259b = Port::<u8>::new(0xa1);

        let mut spin_port = Port::<u8>::new(0x80);
        let mut spin = || spin_port.write(0);

        cmd_8259a.write(0x11);
        cmd_8259b.write(0x11);
        spin();

        data_8259a.write(0xf8);
        data_8259b.write(0xff);
        spin();

        data_8259a.write(0b100);
        spin();

        data_8259b.write(0b10);
        spin();

        data_8259a.write(0x1);
        data_8259b.write(0x1);
        spin();

        data_8259a.write(u8::MAX);
        data_8259b.write(u8::MAX);
    };
}
