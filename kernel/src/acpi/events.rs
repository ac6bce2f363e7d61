//! SCI event bridge: turns ACPI PM1 event bits into kernel actions.

use alloc::sync::Arc;

use kernel_events::InterruptHandler;
use kernel_tasking::frame::TrapFrame;
use kernel_tasking::thread::ThreadSpec;
use log::{debug, error, info, warn};
use x86_64::instructions::port::Port;

use crate::acpi::power::{self, PowerInfo};
use crate::arch::cpu;
use crate::{apic, interrupts, tasking};

pub const ACPI_TIMER: u16 = 0x0001;
pub const ACPI_BUSMASTER: u16 = 0x0010;
pub const ACPI_GLOBAL: u16 = 0x0020;
pub const ACPI_POWER_BUTTON: u16 = 0x0100;
pub const ACPI_SLEEP_BUTTON: u16 = 0x0200;
pub const ACPI_RTC_ALARM: u16 = 0x0400;
pub const ACPI_PCIE_WAKE: u16 = 0x4000;
pub const ACPI_WAKE: u16 = 0x8000;

const RECOGNIZED: u16 = ACPI_BUSMASTER
    | ACPI_GLOBAL
    | ACPI_POWER_BUTTON
    | ACPI_SLEEP_BUTTON
    | ACPI_RTC_ALARM
    | ACPI_PCIE_WAKE
    | ACPI_WAKE;

/// Arms the SCI vector. The handler is critical: it survives the interrupt
/// core's bulk teardown so the power button works to the very end.
pub fn init() {
    let Some(power) = power::info() else {
        warn!("no ACPI power information; SCI not armed");
        return;
    };

    let sci_irq = u8::try_from(power.sci_interrupt).expect("SCI interrupt fits an IRQ");
    interrupts::add_handler(sci_irq, Arc::new(SciHandler), true);

    if power.shutdown_supported {
        enable_events(power);
    }

    apic::redirect_irq(0, sci_irq, true);
    info!("SCI armed on IRQ{sci_irq}");
}

/// Unmasks the recognized PM1 events and acknowledges anything pending.
fn enable_events(power: &PowerInfo) {
    // The enable registers sit halfway into each event block.
    let enable_offset = u16::from(power.pm1_event_length / 2);

    // SAFETY: port IO on the register blocks the FADT describes.
    unsafe {
        if power.pm1a_event_block != 0 {
            Port::<u16>::new(power.pm1a_event_block as u16 + enable_offset).write(RECOGNIZED);
        }
        if power.pm1b_event_block != 0 {
            Port::<u16>::new(power.pm1b_event_block as u16 + enable_offset).write(RECOGNIZED);
        }

        if power.pm1a_event_block != 0 {
            let mut port = Port::<u16>::new(power.pm1a_event_block as u16);
            let pending = port.read();
            port.write(pending);
        }
        if power.pm1b_event_block != 0 {
            let mut port = Port::<u16>::new(power.pm1b_event_block as u16);
            let pending = port.read();
            port.write(pending);
        }
    }
}

struct SciHandler;

impl InterruptHandler<TrapFrame> for SciHandler {
    fn on_interrupt_received(&self, _frame: &mut TrapFrame) {
        debug!("SCI triggered");
        let Some(power) = power::info() else {
            return;
        };

        // Read both event registers and acknowledge by writing the bits
        // back.
        let event = {
            let mut a = 0u16;
            let mut b = 0u16;
            // SAFETY: port IO on the FADT-described event blocks.
            unsafe {
                if power.pm1a_event_block != 0 {
                    let mut port = Port::<u16>::new(power.pm1a_event_block as u16);
                    a = port.read();
                    port.write(a);
                }
                if power.pm1b_event_block != 0 {
                    let mut port = Port::<u16>::new(power.pm1b_event_block as u16);
                    b = port.read();
                    port.write(b);
                }
            }
            a | b
        };

        if event & ACPI_BUSMASTER != 0 {
            debug!("ACPI busmaster event");
        } else if event & ACPI_GLOBAL != 0 {
            debug!("ACPI global event");
        } else if event & ACPI_POWER_BUTTON != 0 {
            handle_power_button();
        } else if event & ACPI_SLEEP_BUTTON != 0 {
            debug!("ACPI sleep button");
        } else if event & ACPI_RTC_ALARM != 0 {
            debug!("ACPI RTC alarm");
        } else if event & ACPI_PCIE_WAKE != 0 {
            debug!("ACPI PCIe wake");
        } else if event & ACPI_WAKE != 0 {
            debug!("ACPI wake");
        } else if event & ACPI_TIMER != 0 {
            debug!("ACPI timer");
        } else {
            error!("ACPI unknown event {event:#x}");
        }
    }
}

fn handle_power_button() {
    // In the panic lock there is no tasking left to ask; power off here.
    if tasking::try_tasking().is_none_or(|manager| manager.is_panic()) {
        power::shutdown();
        cpu::stop();
    }

    let manager = tasking::tasking();
    let kernel = manager.kernel_process().clone();
    match manager.create_thread(&kernel, &ThreadSpec::kernel(shutdown_main as usize as u64)) {
        Ok(thread) => {
            thread.rename("Shutdown");
        }
        Err(err) => {
            // No task context to speak of; shut down directly.
            error!("failed to spawn the shutdown thread ({err}); shutting down now");
            power::shutdown();
        }
    }
}

/// Body of the "Shutdown" kernel thread.
extern "C" fn shutdown_main() {
    info!("shutting down");
    let manager = tasking::tasking();
    manager.signal_shutdown();
    interrupts::remove_all();
    power::shutdown();
    cpu::stop();
}
