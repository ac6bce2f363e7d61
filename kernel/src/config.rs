//! Boot-time kernel configuration.

use conquer_once::spin::OnceCell;

static CONFIG: OnceCell<KernelConfig> = OnceCell::uninit();

#[derive(Debug, Clone, Copy)]
pub struct KernelConfig {
    /// CPU that receives the redirected legacy IRQs.
    pub ioapic_interrupt_core: u32,
    /// Spawn user processes with Linux compatibility by default.
    pub linux_subsystem: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            ioapic_interrupt_core: 0,
            linux_subsystem: false,
        }
    }
}

pub fn init(config: KernelConfig) {
    CONFIG.init_once(|| config);
}

pub fn get() -> KernelConfig {
    CONFIG.get().copied().unwrap_or_default()
}
