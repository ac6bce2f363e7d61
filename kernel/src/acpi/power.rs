//! Fixed-feature power management: DSDT `_S5_` discovery, shutdown, reboot.

use acpi::fadt::Fadt;
use conquer_once::spin::OnceCell;
use log::{error, info, trace, warn};
use x86_64::instructions::port::Port;

use crate::arch::cpu;
use crate::limine::hhdm_offset;

const SLP_EN: u16 = 1 << 13;
const SCI_EN: u16 = 1;

const GAS_MMIO: u8 = 0;
const GAS_IO: u8 = 1;
const GAS_PCI: u8 = 2;

/// Bounded wait for SCI_EN after poking the SMI command port.
const ACPI_ENABLE_TIMEOUT: u32 = 3000;

#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
struct GenericAddressRaw {
    address_space: u8,
    bit_width: u8,
    bit_offset: u8,
    access_size: u8,
    address: u64,
}

/// The FADT laid out as the firmware wrote it. Only the fields the power
/// path consumes are named; everything else is padding to keep the offsets
/// honest.
#[allow(dead_code)]
#[repr(C, packed)]
struct FadtRaw {
    header: [u8; 36],
    firmware_ctrl: u32,
    dsdt: u32,
    _reserved: u8,
    preferred_pm_profile: u8,
    sci_interrupt: u16,
    smi_command_port: u32,
    acpi_enable: u8,
    acpi_disable: u8,
    s4bios_req: u8,
    pstate_control: u8,
    pm1a_event_block: u32,
    pm1b_event_block: u32,
    pm1a_control_block: u32,
    pm1b_control_block: u32,
    pm2_control_block: u32,
    pm_timer_block: u32,
    gpe0_block: u32,
    gpe1_block: u32,
    pm1_event_length: u8,
    pm1_control_length: u8,
    pm2_control_length: u8,
    pm_timer_length: u8,
    gpe0_length: u8,
    gpe1_length: u8,
    gpe1_base: u8,
    cstate_control: u8,
    worst_c2_latency: u16,
    worst_c3_latency: u16,
    flush_size: u16,
    flush_stride: u16,
    duty_offset: u8,
    duty_width: u8,
    day_alarm: u8,
    month_alarm: u8,
    century: u8,
    boot_architecture_flags: u16,
    _reserved2: u8,
    flags: u32,
    reset_reg: GenericAddressRaw,
    reset_value: u8,
    _reserved3: [u8; 3],
    x_firmware_control: u64,
    x_dsdt: u64,
}

/// Everything the SCI path and the shutdown/reboot routines consume.
#[derive(Debug, Clone, Copy)]
pub struct PowerInfo {
    pub sci_interrupt: u16,
    pub pm1a_event_block: u32,
    pub pm1b_event_block: u32,
    pub pm1_event_length: u8,
    pub pm1a_control_block: u32,
    pub pm1b_control_block: u32,
    pub pm1_control_length: u8,
    smi_command_port: u32,
    acpi_enable: u8,
    acpi_disable: u8,
    slp_typa: u16,
    slp_typb: u16,
    reset_reg: GenericAddressRaw,
    reset_value: u8,
    pub shutdown_supported: bool,
}

static POWER_INFO: OnceCell<PowerInfo> = OnceCell::uninit();

pub fn info() -> Option<&'static PowerInfo> {
    POWER_INFO.get()
}

fn is_canonical(address: u64) -> bool {
    address <= 0x0000_7FFF_FFFF_FFFF || address >= 0xFFFF_8000_0000_0000
}

pub(super) fn init() {
    let tables = super::acpi_tables().lock();
    let Ok(fadt) = tables.find_table::<Fadt>() else {
        warn!("no FADT; ACPI power management unavailable");
        return;
    };

    // The raw layout gives us the legacy fields the acpi crate abstracts
    // away.
    // SAFETY: the mapping covers the whole table and FadtRaw mirrors the
    // fixed ACPI layout.
    let fadt: &Fadt = &fadt;
    let raw: &FadtRaw = unsafe { &*core::ptr::from_ref::<Fadt>(fadt).cast::<FadtRaw>() };

    let mut power = PowerInfo {
        sci_interrupt: raw.sci_interrupt,
        pm1a_event_block: raw.pm1a_event_block,
        pm1b_event_block: raw.pm1b_event_block,
        pm1_event_length: raw.pm1_event_length,
        pm1a_control_block: raw.pm1a_control_block,
        pm1b_control_block: raw.pm1b_control_block,
        pm1_control_length: raw.pm1_control_length,
        smi_command_port: raw.smi_command_port,
        acpi_enable: raw.acpi_enable,
        acpi_disable: raw.acpi_disable,
        slp_typa: 0,
        slp_typb: 0,
        reset_reg: raw.reset_reg,
        reset_value: raw.reset_value,
        shutdown_supported: false,
    };

    let dsdt_address = if raw.x_dsdt != 0 && is_canonical(raw.x_dsdt) {
        raw.x_dsdt
    } else {
        u64::from(raw.dsdt)
    };

    match parse_s5(dsdt_address) {
        Some((typa, typb)) => {
            power.slp_typa = typa;
            power.slp_typb = typb;
            power.shutdown_supported = true;
            info!("ACPI shutdown is supported");
        }
        None => warn!("failed to parse _S5_; ACPI shutdown unsupported"),
    }

    POWER_INFO.init_once(|| power);
}

/// Walks the DSDT payload for the `_S5_` package and extracts the two sleep
/// type values. The byte-walk reproduces the firmware encodings seen in the
/// wild: a `0x08` name-op prefix (optionally preceding a `\` namespace
/// escape), a `0x12` package start, and optional `0x0A` byte prefixes before
/// each value.
fn parse_s5(dsdt_phys: u64) -> Option<(u16, u16)> {
    if dsdt_phys == 0 {
        return None;
    }

    let base = (dsdt_phys + hhdm_offset()) as *const u8;
    // SAFETY: the direct map covers the table; the header length field tells
    // us how far the payload extends.
    let length = unsafe { base.add(4).cast::<u32>().read_unaligned() } as usize;
    if length <= 36 {
        return None;
    }
    // SAFETY: `length` bytes starting at `base` are the mapped table.
    let table = unsafe { core::slice::from_raw_parts(base, length) };

    let offset = (36..length.checked_sub(8)?).find(|&i| &table[i..i + 4] == b"_S5_")?;

    let name_op = table[offset - 1] == 0x08
        || (offset >= 2 && table[offset - 2] == 0x08 && table[offset - 1] == b'\\');
    if !name_op || table[offset + 4] != 0x12 {
        return None;
    }

    let mut cursor = offset + 5;
    // Skip the PkgLength encoding (its top two bits give the extra bytes)
    // and the element count.
    cursor += ((table[cursor] as usize & 0xC0) >> 6) + 2;

    if table[cursor] == 0x0A {
        cursor += 1;
    }
    let slp_typa = u16::from(table[cursor]) << 10;
    cursor += 1;

    if table[cursor] == 0x0A {
        cursor += 1;
    }
    let slp_typb = u16::from(table[cursor]) << 10;

    trace!("_S5_: SLP_TYPa={slp_typa:#x} SLP_TYPb={slp_typb:#x}");
    Some((slp_typa, slp_typb))
}

/// Powers the machine off through PM1a/PM1b, enabling ACPI first when the
/// firmware left it disabled.
pub fn shutdown() {
    trace!("shutting down");
    let Some(power) = info().filter(|p| p.shutdown_supported) else {
        error!("ACPI shutdown not supported");
        return;
    };

    let mut pm1a_cnt = Port::<u16>::new(power.pm1a_control_block as u16);

    // SAFETY: port IO on the register blocks the FADT describes.
    unsafe {
        if pm1a_cnt.read() & SCI_EN == 0 {
            info!("ACPI was disabled, enabling");
            if power.smi_command_port == 0 || power.acpi_enable == 0 {
                error!("ACPI shutdown not supported");
                return;
            }

            Port::<u8>::new(power.smi_command_port as u16).write(power.acpi_enable);

            let mut timeout = ACPI_ENABLE_TIMEOUT;
            while pm1a_cnt.read() & SCI_EN == 0 && timeout > 0 {
                timeout -= 1;
            }
            if timeout == 0 {
                error!("ACPI shutdown not supported");
                return;
            }

            if power.pm1b_control_block != 0 {
                let mut pm1b_cnt = Port::<u16>::new(power.pm1b_control_block as u16);
                let mut timeout = ACPI_ENABLE_TIMEOUT;
                while pm1b_cnt.read() & SCI_EN == 0 && timeout > 0 {
                    timeout -= 1;
                }
            }
        }

        pm1a_cnt.write(power.slp_typa | SLP_EN);
        if power.pm1b_control_block != 0 {
            Port::<u16>::new(power.pm1b_control_block as u16).write(power.slp_typb | SLP_EN);
        }
    }
}

/// Resets the machine through the FADT reset register.
pub fn reboot() {
    trace!("rebooting");
    let Some(power) = info() else {
        error!("no power information; cannot reboot");
        return;
    };

    let reset = power.reset_reg;
    match reset.address_space {
        GAS_MMIO => {
            let address = reset.address;
            // SAFETY: the firmware declared this MMIO byte as the reset
            // register.
            unsafe {
                ((address + hhdm_offset()) as *mut u8).write_volatile(power.reset_value);
            }
        }
        GAS_IO => {
            // SAFETY: the firmware declared this IO port as the reset
            // register.
            unsafe {
                Port::<u8>::new(reset.address as u16).write(power.reset_value);
            }
        }
        GAS_PCI => {
            error!("PCI reset register not supported");
            return;
        }
        space => {
            error!("unknown reset register address space: {space}");
            return;
        }
    }

    // The write should not return; if it does, park the core.
    cpu::stop();
}
