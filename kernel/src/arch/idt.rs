//! Interrupt descriptor table and low-level entry stubs.
//!
//! Exceptions get typed handlers that capture a full [`ExceptionFrame`]
//! (control and debug registers included). Every device vector gets a naked
//! stub that assembles a [`TrapFrame`] and hands it to the interrupt core;
//! the scheduler vector gets a dedicated stub that additionally carries the
//! page-table roots of a [`SchedulerFrame`] and loads the published root on
//! the way out.

use core::arch::naked_asm;

use kernel_abi::KILL_CRASH;
use kernel_tasking::frame::{
    ControlRegisters, DebugRegisters, ExceptionFrame, SavedSegments, TrapFrame,
};
use kernel_tasking::state::TaskState;
use log::{error, warn};
use x86_64::registers::control::{Cr0, Cr2, Cr3, Cr4};
use x86_64::registers::segmentation::{Segment, DS, ES, FS, GS};
use x86_64::structures::idt::{
    InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode,
};
use x86_64::VirtAddr;

use crate::arch::{cpu, gdt};
use crate::interrupts::{self, SCHEDULER_VECTOR, SPURIOUS_VECTOR};
use crate::mcore::context::ExecutionContext;

/// Generic device-vector stub: builds a `TrapFrame` on the stack and calls
/// into the interrupt core. Register push order mirrors `GPRegisters`.
#[unsafe(naked)]
unsafe extern "sysv64" fn irq_stub<const VECTOR: u8>() {
    naked_asm!(
        "push 0",
        "push {vector}",
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "call {dispatch}",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "add rsp, 16",
        "iretq",
        vector = const VECTOR,
        dispatch = sym interrupts::irq_entry,
    );
}

/// Scheduler-vector stub: a `TrapFrame` plus the two page-table roots of a
/// `SchedulerFrame`. The root published in `ppt` by the tick handler is
/// loaded before returning, so the next task resumes in its own address
/// space.
#[unsafe(naked)]
unsafe extern "sysv64" fn scheduler_stub() {
    naked_asm!(
        "push 0",
        "push {vector}",
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rax, cr3",
        "push rax", // opt: the root active at preemption
        "push rax", // ppt: pre-published as unchanged
        "mov rdi, rsp",
        "call {dispatch}",
        "pop rax", // ppt, possibly rewritten by the tick handler
        "mov rcx, cr3",
        "cmp rax, rcx",
        "je 2f",
        "mov cr3, rax",
        "2:",
        "add rsp, 8", // discard opt
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "add rsp, 16",
        "iretq",
        vector = const SCHEDULER_VECTOR,
        dispatch = sym interrupts::scheduler_entry,
    );
}

macro_rules! install_irq_stubs {
    ($idt:ident, $($vector:literal),* $(,)?) => {
        $(
            // SAFETY: the stub follows the interrupt calling convention and
            // never returns through a normal call.
            unsafe {
                $idt[$vector].set_handler_addr(VirtAddr::new(irq_stub::<$vector> as usize as u64));
            }
        )*
    };
}

pub fn create_idt() -> InterruptDescriptorTable {
    let mut idt = InterruptDescriptorTable::new();

    // SAFETY: the IST indices were reserved in the GDT's TSS.
    unsafe {
        idt.double_fault
            .set_handler_fn(double_fault_handler)
            .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        idt.page_fault
            .set_handler_fn(page_fault_handler)
            .set_stack_index(gdt::PAGE_FAULT_IST_INDEX);
    }

    idt.debug.set_handler_fn(debug_handler);
    idt.breakpoint.set_handler_fn(breakpoint_handler);
    idt.device_not_available
        .set_handler_fn(device_not_available_handler);
    idt.general_protection_fault
        .set_handler_fn(general_protection_fault_handler);
    idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
    idt.invalid_tss.set_handler_fn(invalid_tss_handler);
    idt.segment_not_present
        .set_handler_fn(segment_not_present_handler);
    idt.stack_segment_fault
        .set_handler_fn(stack_segment_fault_handler);

    // SAFETY: dedicated naked stub for the scheduler tick.
    unsafe {
        idt[SCHEDULER_VECTOR].set_handler_addr(VirtAddr::new(scheduler_stub as usize as u64));
    }
    idt[LAPIC_ERR_VECTOR].set_handler_fn(lapic_err_interrupt_handler);
    idt[SPURIOUS_VECTOR].set_handler_fn(spurious_interrupt_handler);

    install_irq_stubs!(
        idt,
        32, 33, 34, 35, 36, 37, 38, 39, 40, 41, 42, 43,
        44, 45, 46, 47, 50, 51, 52, 53, 54, 55, 56, 57,
        58, 59, 60, 61, 62, 63, 64, 65, 66, 67, 68, 69,
        70, 71, 72, 73, 74, 75, 76, 77, 78, 79, 80, 81,
        82, 83, 84, 85, 86, 87, 88, 89, 90, 91, 92, 93,
        94, 95, 96, 97, 98, 99, 100, 101, 102, 103, 104, 105,
        106, 107, 108, 109, 110, 111, 112, 113, 114, 115, 116, 117,
        118, 119, 120, 121, 122, 123, 124, 125, 126, 127, 128, 129,
        130, 131, 132, 133, 134, 135, 136, 137, 138, 139, 140, 141,
        142, 143, 144, 145, 146, 147, 148, 149, 150, 151, 152, 153,
        154, 155, 156, 157, 158, 159, 160, 161, 162, 163, 164, 165,
        166, 167, 168, 169, 170, 171, 172, 173, 174, 175, 176, 177,
        178, 179, 180, 181, 182, 183, 184, 185, 186, 187, 188, 189,
        190, 191, 192, 193, 194, 195, 196, 197, 198, 199, 200, 201,
        202, 203, 204, 205, 206, 207, 208, 209, 210, 211, 212, 213,
        214, 215, 216, 217, 218, 219, 220, 221, 222, 223,
    );

    idt
}

/// LAPIC error vector, kept clear of the device-IRQ stubs.
pub const LAPIC_ERR_VECTOR: u8 = 0x31;

fn read_cr8() -> u64 {
    let value: u64;
    // SAFETY: reading CR8 has no side effects.
    unsafe {
        core::arch::asm!("mov {}, cr8", out(reg) value, options(nomem, nostack));
    }
    value
}

macro_rules! read_dr {
    ($name:ident, $reg:literal) => {
        fn $name() -> u64 {
            let value: u64;
            // SAFETY: reading a debug register has no side effects.
            unsafe {
                core::arch::asm!(
                    concat!("mov {}, ", $reg),
                    out(reg) value,
                    options(nomem, nostack)
                );
            }
            value
        }
    };
}

read_dr!(read_dr0, "dr0");
read_dr!(read_dr1, "dr1");
read_dr!(read_dr2, "dr2");
read_dr!(read_dr3, "dr3");
read_dr!(read_dr6, "dr6");
read_dr!(read_dr7, "dr7");

/// Captures everything a fault report needs beyond the hardware frame.
fn capture_exception_frame(
    stack_frame: &InterruptStackFrame,
    vector: u64,
    error_code: u64,
) -> ExceptionFrame {
    let mut trap = TrapFrame::default();
    trap.vector = vector;
    trap.error_code = error_code;
    trap.iret.rip = stack_frame.instruction_pointer.as_u64();
    trap.iret.cs = stack_frame.code_segment.0.into();
    trap.iret.rflags = stack_frame.cpu_flags.bits();
    trap.iret.rsp = stack_frame.stack_pointer.as_u64();
    trap.iret.ss = stack_frame.stack_segment.0.into();

    ExceptionFrame {
        control: ControlRegisters {
            cr0: Cr0::read_raw(),
            cr2: Cr2::read_raw(),
            cr3: Cr3::read().0.start_address().as_u64(),
            cr4: Cr4::read_raw(),
            cr8: read_cr8(),
        },
        debug: DebugRegisters {
            dr0: read_dr0(),
            dr1: read_dr1(),
            dr2: read_dr2(),
            dr3: read_dr3(),
            dr6: read_dr6(),
            dr7: read_dr7(),
        },
        segments: SavedSegments {
            gs: GS::get_reg().0.into(),
            fs: FS::get_reg().0.into(),
            es: ES::get_reg().0.into(),
            ds: DS::get_reg().0.into(),
        },
        trap,
    }
}

extern "x86-interrupt" fn double_fault_handler(stack_frame: InterruptStackFrame, error: u64) -> ! {
    let frame = capture_exception_frame(&stack_frame, 8, error);
    panic!("EXCEPTION: DOUBLE FAULT\n{frame:#x?}");
}

extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    let frame = capture_exception_frame(&stack_frame, 13, error_code);
    panic!(
        "EXCEPTION: GENERAL PROTECTION FAULT\nerror code: {error_code:#X} ({}[{}], external: {})\n{frame:#x?}",
        match (error_code >> 1) & 0b11 {
            0 => "GDT",
            2 => "LDT",
            _ => "IDT",
        },
        (error_code >> 3) & ((1 << 14) - 1),
        (error_code & 1) > 0
    );
}

extern "x86-interrupt" fn invalid_opcode_handler(stack_frame: InterruptStackFrame) {
    let frame = capture_exception_frame(&stack_frame, 6, 0);
    panic!("EXCEPTION: INVALID OPCODE\n{frame:#x?}");
}

extern "x86-interrupt" fn invalid_tss_handler(stack_frame: InterruptStackFrame, error_code: u64) {
    let frame = capture_exception_frame(&stack_frame, 10, error_code);
    panic!("EXCEPTION: INVALID TSS\nerror code: {error_code:#X}\n{frame:#x?}");
}

extern "x86-interrupt" fn segment_not_present_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    let frame = capture_exception_frame(&stack_frame, 11, error_code);
    panic!("EXCEPTION: SEGMENT NOT PRESENT\nerror code: {error_code:#X}\n{frame:#x?}");
}

extern "x86-interrupt" fn stack_segment_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    let frame = capture_exception_frame(&stack_frame, 12, error_code);
    panic!("EXCEPTION: STACK SEGMENT FAULT\nerror code: {error_code:#X}\n{frame:#x?}");
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    let accessed = Cr2::read().ok();

    if let (Some(addr), Some(ctx)) = (accessed, ExecutionContext::try_load()) {
        if let Some(thread) = ctx.current_thread() {
            let guard_hit = thread.stack().lock().as_ref().is_some_and(|stack| {
                let (low, high) = stack.guards();
                let addr = addr.as_u64();
                (addr >= low && addr < stack.bottom()) || (addr >= high && addr < high + 0x1000)
            });

            if guard_hit {
                error!(
                    "STACK OVERFLOW in thread {:?} ({}), terminating",
                    thread.name(),
                    thread.id()
                );
                thread.set_exit_code(KILL_CRASH);
                thread.set_state(TaskState::Zombie);
                cpu::interrupts(cpu::InterruptsOp::Enable);
                cpu::halt(true);
            }
        }
    }

    let frame = capture_exception_frame(&stack_frame, 14, error_code.bits());
    panic!(
        "EXCEPTION: PAGE FAULT\naccessed address: {accessed:?}\nerror code: {error_code:#?}\n{frame:#x?}"
    );
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    warn!("BREAKPOINT:\n{stack_frame:#?}");
}

extern "x86-interrupt" fn debug_handler(stack_frame: InterruptStackFrame) {
    warn!("DEBUG:\n{stack_frame:#?}");
    warn!("DR6: {:#x}", read_dr6());
    warn!("DR7: {:#x}", read_dr7());
}

extern "x86-interrupt" fn device_not_available_handler(_stack_frame: InterruptStackFrame) {
    cpu::clear_task_switched();

    let ctx = ExecutionContext::load();
    if let Some(thread) = ctx.current_thread() {
        cpu::fpu_restore(&thread.fx_area().lock());
    }
}

extern "x86-interrupt" fn lapic_err_interrupt_handler(stack_frame: InterruptStackFrame) {
    panic!("EXCEPTION: LAPIC ERROR\n{stack_frame:#?}");
}

extern "x86-interrupt" fn spurious_interrupt_handler(_stack_frame: InterruptStackFrame) {
    warn!("spurious interrupt");
}