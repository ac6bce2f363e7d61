//! Saved register frames.
//!
//! These records are written by the low-level interrupt stubs and must
//! round-trip through save/restore bit-exact, so every shape is `repr(C)`
//! with an explicitly spelled-out field order. Three architectures carry a
//! trap frame: x86-64 (the primary target), x86-32 and aarch64.

use bitflags::bitflags;

bitflags! {
    /// The rflags bits the tasking core cares about.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RFlags: u64 {
        const CARRY = 1 << 0;
        /// Bit 1 reads as one on every x86.
        const ALWAYS_ONE = 1 << 1;
        const INTERRUPT = 1 << 9;
        /// Alignment check / SMAP access bit. Kept clear for new threads.
        const ALIGNMENT_CHECK = 1 << 18;
        /// CPUID detection bit.
        const ID = 1 << 21;
    }
}

/// General-purpose registers in the order the interrupt stubs push them.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GPRegisters {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
}

/// What the CPU pushes on interrupt entry (after an optional error code).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterruptReturn {
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// Full x86-64 trap frame as assembled by the interrupt stubs.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub regs: GPRegisters,
    /// Faulting vector as pushed by the stub.
    pub vector: u64,
    /// Hardware error code, zero when the vector carries none.
    pub error_code: u64,
    pub iret: InterruptReturn,
}

impl TrapFrame {
    /// IRQ number relative to the IRQ base, or `None` below the base.
    #[must_use]
    pub fn irq(&self, irq_base: u8) -> Option<u8> {
        let vector = u8::try_from(self.vector).ok()?;
        vector.checked_sub(irq_base)
    }
}

/// Trap frame seen by the scheduler tick: two page-table roots are prepended
/// so the handler can atomically switch address spaces on context switch.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerFrame {
    /// Page-table root to load when returning from the tick.
    pub ppt: u64,
    /// Page-table root that was active at preemption.
    pub opt: u64,
    pub trap: TrapFrame,
}

/// Control registers captured for faults.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlRegisters {
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
}

/// Debug registers captured for faults.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugRegisters {
    pub dr0: u64,
    pub dr1: u64,
    pub dr2: u64,
    pub dr3: u64,
    pub dr6: u64,
    pub dr7: u64,
}

/// Segment selectors live at fault time.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SavedSegments {
    pub gs: u64,
    pub fs: u64,
    pub es: u64,
    pub ds: u64,
}

/// Everything captured for a CPU exception.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ExceptionFrame {
    pub control: ControlRegisters,
    pub debug: DebugRegisters,
    pub segments: SavedSegments,
    pub trap: TrapFrame,
}

/// x86-32 trap frame: `pusha` order, then vector/error code, then the
/// hardware frame including the user stack for privilege transitions.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct X86TrapFrame {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub vector: u32,
    pub error_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub user_esp: u32,
    pub ss: u32,
}

/// aarch64 trap frame: x0-x30, stack pointer, exception link register,
/// saved program status, syndrome and fault address.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Aarch64TrapFrame {
    pub x: [u64; 31],
    pub sp: u64,
    pub elr: u64,
    pub spsr: u64,
    pub esr: u64,
    pub far: u64,
}

impl Default for Aarch64TrapFrame {
    fn default() -> Self {
        Self {
            x: [0; 31],
            sp: 0,
            elr: 0,
            spsr: 0,
            esr: 0,
            far: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_shapes_are_bit_exact() {
        assert_eq!(size_of::<GPRegisters>(), 15 * 8);
        assert_eq!(size_of::<TrapFrame>(), (15 + 2 + 5) * 8);
        assert_eq!(size_of::<SchedulerFrame>(), size_of::<TrapFrame>() + 16);
        assert_eq!(
            size_of::<ExceptionFrame>(),
            size_of::<TrapFrame>() + (5 + 6 + 4) * 8
        );
        assert_eq!(size_of::<X86TrapFrame>(), 15 * 4);
        assert_eq!(size_of::<Aarch64TrapFrame>(), 36 * 8);
    }

    #[test]
    fn scheduler_frame_prepends_the_roots() {
        let frame = SchedulerFrame {
            ppt: 0x1000,
            opt: 0x2000,
            ..Default::default()
        };
        let base = core::ptr::from_ref(&frame) as usize;
        assert_eq!(core::ptr::from_ref(&frame.ppt) as usize, base);
        assert_eq!(core::ptr::from_ref(&frame.opt) as usize, base + 8);
        assert_eq!(core::ptr::from_ref(&frame.trap) as usize, base + 16);
    }

    #[test]
    fn irq_is_base_relative() {
        let mut frame = TrapFrame::default();
        frame.vector = 48;
        assert_eq!(frame.irq(32), Some(16));
        frame.vector = 31;
        assert_eq!(frame.irq(32), None);
    }

    #[test]
    fn trap_frame_roundtrips() {
        let mut frame = TrapFrame::default();
        frame.regs.rdi = 0xDEAD_BEEF;
        frame.vector = 0x21;
        frame.iret.rip = 0xFFFF_8000_0000_1234;
        let copy = frame;
        assert_eq!(copy, frame);
    }
}
