#[cfg(target_arch = "x86_64")]
pub mod cpu;

#[cfg(target_arch = "x86_64")]
pub mod gdt;

#[cfg(target_arch = "x86_64")]
pub mod idt;
