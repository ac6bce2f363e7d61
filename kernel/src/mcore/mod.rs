//! Multi-core bring-up: per-CPU GDT/IDT/TSS, LAPIC, execution context.

use alloc::boxed::Box;
use core::sync::atomic::Ordering::{Acquire, Release};

use log::{info, trace};
use x86_64::instructions::hlt;
use x86_64::instructions::segmentation::{Segment, CS, DS, SS};
use x86_64::instructions::tables::load_tss;
use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::PhysFrame;
use x86_64::PhysAddr;

use crate::arch::gdt::create_gdt_and_tss;
use crate::arch::idt::create_idt;
use crate::config;
use crate::limine::MP_REQUEST;
use crate::mcore::context::ExecutionContext;

pub mod context;
pub mod lapic;

pub fn init() {
    // SAFETY: the mutable MP response is only touched here, before the APs
    // are released.
    let resp = unsafe {
        #[allow(static_mut_refs)]
        MP_REQUEST.get_response_mut()
    }
    .expect("should have an MP response");

    let cr3_val = {
        let (frame, flags) = Cr3::read();
        frame.start_address().as_u64() | flags.bits()
    };

    // Hand every CPU the kernel page-table root through the `extra` field.
    resp.cpus().iter().for_each(|cpu| {
        cpu.extra.store(cr3_val, Release);
    });

    resp.cpus().iter().skip(1).for_each(|cpu| {
        cpu.goto_address.write(cpu_init_and_idle);
    });

    // SAFETY: the bootstrap CPU struct comes from Limine.
    unsafe { cpu_init_and_return(resp.cpus()[0]) };
}

/// # Safety
/// Must run exactly once per CPU, with the CPU struct provided by Limine.
unsafe extern "C" fn cpu_init_and_return(cpu: &limine::mp::Cpu) {
    let cpu_arg = cpu.extra.load(Acquire);
    trace!("booting cpu {} with page table {:#x}", cpu.id, cpu_arg);

    // SAFETY: the BSP published its CR3 value in `extra`; loading it puts
    // this CPU into the shared kernel address space.
    unsafe {
        let flags = Cr3Flags::from_bits_truncate(cpu_arg);
        Cr3::write(PhysFrame::containing_address(PhysAddr::new(cpu_arg)), flags);
    }

    let (gdt, sel, tss) = create_gdt_and_tss();
    let gdt = Box::leak(Box::new(gdt));
    gdt.load();
    // SAFETY: the GDT was just loaded; the selectors index into it.
    unsafe {
        CS::set_reg(sel.kernel_code);
        DS::set_reg(sel.kernel_data);
        SS::set_reg(sel.kernel_data);
        load_tss(sel.tss);
    }

    let idt = Box::leak(Box::new(create_idt()));
    idt.load();

    let lapic = lapic::init();
    let lapic_id = cpu.lapic_id as usize;

    let ctx = ExecutionContext::new(cpu.id as usize, lapic_id, gdt, sel, idt, tss, lapic)
        .install();

    // One chosen core receives the redirected legacy IRQs.
    if ctx.cpu_id() == config::get().ioapic_interrupt_core as usize {
        crate::apic::redirect_irqs(u8::try_from(lapic_id).expect("lapic id fits a redirect"));
    }

    info!("cpu {} initialized", ctx.cpu_id());
    x86_64::instructions::interrupts::enable();
}

/// AP entry: initialize, then idle until the scheduler takes over.
unsafe extern "C" fn cpu_init_and_idle(cpu: &limine::mp::Cpu) -> ! {
    // SAFETY: per-CPU initialization with the Limine-provided struct.
    unsafe { cpu_init_and_return(cpu) };
    turn_idle()
}

/// Parks the calling CPU; the scheduler tick lifts it out of `hlt`.
pub fn turn_idle() -> ! {
    loop {
        hlt();
    }
}
