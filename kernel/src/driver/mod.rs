//! The driver-host contract: the kernel-side API loaded drivers program
//! against. Interrupt registration forwards into the interrupt core; memory
//! comes straight from the physical allocator; PS/2 access wraps the
//! controller ports with bounded ACK waits.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::ffi::c_void;
use core::ptr::NonNull;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering::Relaxed;

use kernel_abi::{Errno, EINVAL, ENOMEM, ETIMEDOUT};
use kernel_events::IrqCallback;
use log::{debug, trace, warn};
use spin::Mutex;
use x86_64::instructions::port::Port;

use crate::arch::cpu;
use crate::interrupts;
use crate::mem::phys::{phys_to_virt, PhysicalMemory};
use crate::{limine, tasking};

pub type DriverId = u32;
pub type DeviceId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Input,
    Block,
    Network,
    Audio,
    Misc,
}

/// Operations a device exposes to the kernel. Unset entries are rejected at
/// call time.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceOps {
    pub read: Option<unsafe extern "C" fn(*mut c_void, usize) -> isize>,
    pub write: Option<unsafe extern "C" fn(*const c_void, usize) -> isize>,
    pub ioctl: Option<unsafe extern "C" fn(u64, *mut c_void) -> isize>,
}

#[derive(Debug, Clone, Copy)]
pub struct BlockDeviceDescriptor {
    pub block_size: usize,
    pub block_count: u64,
    pub ops: DeviceOps,
}

/// A keyboard/mouse report as drivers deliver it.
#[derive(Debug, Clone, Copy)]
pub struct InputReport {
    pub device: DeviceId,
    pub code: u16,
    pub value: i32,
}

struct Device {
    driver: DriverId,
    device_type: DeviceType,
    ops: DeviceOps,
    block: Option<BlockDeviceDescriptor>,
}

struct HostState {
    devices: BTreeMap<DeviceId, Device>,
    allocations: Vec<(DriverId, u64, usize)>,
    input_events: Vec<InputReport>,
}

static HOST: Mutex<HostState> = Mutex::new(HostState {
    devices: BTreeMap::new(),
    allocations: Vec::new(),
    input_events: Vec::new(),
});

static NEXT_DEVICE_ID: AtomicU32 = AtomicU32::new(1);

/// Takes the host registry lock with interrupts off; input events arrive
/// from interrupt context through the same lock.
fn with_host<R>(f: impl FnOnce(&mut HostState) -> R) -> R {
    x86_64::instructions::interrupts::without_interrupts(|| f(&mut HOST.lock()))
}

/// Registers `callback` for `irq` on behalf of a driver.
pub fn register_interrupt_handler(
    driver: DriverId,
    irq: u8,
    callback: IrqCallback,
) -> Result<(), Errno> {
    if irq > interrupts::MAX_IRQ {
        return Err(EINVAL);
    }
    trace!("driver {driver}: registering handler for IRQ{irq}");
    interrupts::add_callback(irq, callback, None, false);
    Ok(())
}

/// Drops every registration of `callback` for this driver.
pub fn unregister_all_interrupt_handlers(driver: DriverId, callback: IrqCallback) {
    trace!("driver {driver}: unregistering handlers");
    interrupts::remove_callback(callback);
}

pub fn register_device(driver: DriverId, device_type: DeviceType, ops: DeviceOps) -> DeviceId {
    let id = NEXT_DEVICE_ID.fetch_add(1, Relaxed);
    with_host(|host| {
        host.devices.insert(
            id,
            Device {
                driver,
                device_type,
                ops,
                block: None,
            },
        );
    });
    debug!("driver {driver}: registered {device_type:?} device {id}");
    id
}

pub fn register_block_device(driver: DriverId, descriptor: BlockDeviceDescriptor) -> DeviceId {
    let id = NEXT_DEVICE_ID.fetch_add(1, Relaxed);
    with_host(|host| {
        host.devices.insert(
            id,
            Device {
                driver,
                device_type: DeviceType::Block,
                ops: descriptor.ops,
                block: Some(descriptor),
            },
        );
    });
    debug!(
        "driver {driver}: registered block device {id} ({} x {} bytes)",
        descriptor.block_count, descriptor.block_size
    );
    id
}

pub fn unregister_devices(driver: DriverId) {
    with_host(|host| host.devices.retain(|_, dev| dev.driver != driver));
}

pub fn device_ops(device: DeviceId) -> Option<DeviceOps> {
    with_host(|host| host.devices.get(&device).map(|d| d.ops))
}

pub fn device_type(device: DeviceId) -> Option<DeviceType> {
    with_host(|host| host.devices.get(&device).map(|d| d.device_type))
}

pub fn block_device(device: DeviceId) -> Option<BlockDeviceDescriptor> {
    with_host(|host| host.devices.get(&device).and_then(|d| d.block))
}

/// Hands a driver `pages` kernel-visible pages.
pub fn allocate_memory(driver: DriverId, pages: usize) -> Result<NonNull<u8>, Errno> {
    if pages == 0 {
        return Err(EINVAL);
    }
    let phys = PhysicalMemory::allocate_pages(pages).ok_or(ENOMEM)?;
    with_host(|host| host.allocations.push((driver, phys, pages)));
    Ok(NonNull::new(phys_to_virt(phys)).expect("direct map never yields null"))
}

pub fn free_memory(driver: DriverId, ptr: NonNull<u8>, pages: usize) -> Result<(), Errno> {
    let phys = ptr.as_ptr() as u64 - limine::hhdm_offset();
    with_host(|host| {
        let pos = host
            .allocations
            .iter()
            .position(|&(d, p, n)| d == driver && p == phys && n == pages)
            .ok_or(EINVAL)?;
        host.allocations.remove(pos);
        Ok(())
    })?;
    PhysicalMemory::free_pages(phys, pages);
    Ok(())
}

/// Voluntary preemption on behalf of a driver.
pub fn driver_yield(_driver: DriverId) {
    if let Some(manager) = tasking::try_tasking() {
        manager.yield_now();
    }
}

/// Interrupt-disabled critical section. The cookie carries the previous
/// interrupt state back to `leave_critical_section`.
#[must_use]
pub fn enter_critical_section(_driver: DriverId) -> u64 {
    let was_enabled = cpu::interrupts(cpu::InterruptsOp::Check);
    cpu::interrupts(cpu::InterruptsOp::Disable);
    u64::from(was_enabled)
}

pub fn leave_critical_section(_driver: DriverId, cookie: u64) {
    if cookie != 0 {
        cpu::interrupts(cpu::InterruptsOp::Enable);
    }
}

const PS2_DATA: u16 = 0x60;
const PS2_STATUS: u16 = 0x64;
const PS2_COMMAND: u16 = 0x64;

const PS2_OUTPUT_FULL: u8 = 1 << 0;
const PS2_INPUT_FULL: u8 = 1 << 1;
const PS2_ACK: u8 = 0xFA;

/// Bounded wait iterations for controller ready/ACK.
const PS2_TIMEOUT: u32 = 100_000;

pub fn ps2_read_data() -> u8 {
    // SAFETY: standard 8042 data port.
    unsafe { Port::<u8>::new(PS2_DATA).read() }
}

fn ps2_wait_input_clear() -> Result<(), Errno> {
    let mut status = Port::<u8>::new(PS2_STATUS);
    for _ in 0..PS2_TIMEOUT {
        // SAFETY: standard 8042 status port.
        if unsafe { status.read() } & PS2_INPUT_FULL == 0 {
            return Ok(());
        }
        cpu::pause();
    }
    Err(ETIMEDOUT)
}

fn ps2_wait_output_full() -> Result<(), Errno> {
    let mut status = Port::<u8>::new(PS2_STATUS);
    for _ in 0..PS2_TIMEOUT {
        // SAFETY: standard 8042 status port.
        if unsafe { status.read() } & PS2_OUTPUT_FULL != 0 {
            return Ok(());
        }
        cpu::pause();
    }
    Err(ETIMEDOUT)
}

pub fn ps2_write_data(value: u8) -> Result<(), Errno> {
    ps2_wait_input_clear()?;
    // SAFETY: standard 8042 data port.
    unsafe { Port::<u8>::new(PS2_DATA).write(value) };
    Ok(())
}

pub fn ps2_write_command(value: u8) -> Result<(), Errno> {
    ps2_wait_input_clear()?;
    // SAFETY: standard 8042 command port.
    unsafe { Port::<u8>::new(PS2_COMMAND).write(value) };
    Ok(())
}

/// Writes a data byte and waits for the device to acknowledge it.
pub fn ps2_write_data_ack(value: u8) -> Result<(), Errno> {
    ps2_write_data(value)?;
    ps2_wait_output_full()?;
    let response = ps2_read_data();
    if response == PS2_ACK {
        Ok(())
    } else {
        warn!("PS/2 device answered {response:#x} instead of ACK");
        Err(ETIMEDOUT)
    }
}

/// Writes a command byte and waits for the device to acknowledge it.
pub fn ps2_write_command_ack(value: u8) -> Result<(), Errno> {
    ps2_write_command(value)?;
    ps2_wait_output_full()?;
    let response = ps2_read_data();
    if response == PS2_ACK {
        Ok(())
    } else {
        warn!("PS/2 controller answered {response:#x} instead of ACK");
        Err(ETIMEDOUT)
    }
}

/// Queues an input event for the input subsystem to drain.
pub fn report_input_event(driver: DriverId, report: &InputReport) {
    trace!(
        "driver {driver}: input event code {:#x} value {}",
        report.code, report.value
    );
    with_host(|host| {
        // Old events are shed before the queue grows without bound.
        if host.input_events.len() >= 1024 {
            host.input_events.remove(0);
        }
        host.input_events.push(*report);
    });
}

/// Drains the queued input events.
pub fn take_input_events() -> Vec<InputReport> {
    with_host(|host| core::mem::take(&mut host.input_events))
}
