//! ACPI table access.

use core::ptr::NonNull;

use acpi::{AcpiHandler, AcpiTables, PhysicalMapping};
use conquer_once::spin::OnceCell;
use spin::Mutex;

use crate::limine::{hhdm_offset, RSDP_REQUEST};

pub mod events;
pub mod power;

static ACPI_TABLES: OnceCell<Mutex<AcpiTables<AcpiHandlerImpl>>> = OnceCell::uninit();

pub fn acpi_tables() -> &'static Mutex<AcpiTables<AcpiHandlerImpl>> {
    ACPI_TABLES
        .get()
        .expect("ACPI tables should be initialized")
}

pub fn init() {
    ACPI_TABLES.init_once(|| {
        let rsdp = RSDP_REQUEST.get_response().unwrap().address();
        // SAFETY: the RSDP address comes from the bootloader, which
        // guarantees it points at a valid RSDP structure.
        let tables = unsafe { AcpiTables::from_rsdp(AcpiHandlerImpl, rsdp as usize) }
            .expect("should be able to get ACPI tables from rsdp");
        Mutex::new(tables)
    });

    power::init();
}

/// All physical memory is already visible through the higher-half direct
/// map, so "mapping" an ACPI region is an offset computation.
#[derive(Debug, Copy, Clone)]
pub struct AcpiHandlerImpl;

impl AcpiHandler for AcpiHandlerImpl {
    // SAFETY-contract note: the acpi crate hands us addresses taken from the
    // tables themselves; the direct map covers them.
    unsafe fn map_physical_region<T>(
        &self,
        physical_address: usize,
        size: usize,
    ) -> PhysicalMapping<Self, T> {
        let virt = physical_address as u64 + hhdm_offset();
        // SAFETY: the direct map covers all physical memory reported by the
        // bootloader; ACPI tables live inside it.
        unsafe {
            PhysicalMapping::new(
                physical_address,
                NonNull::new(virt as *mut T).expect("ACPI table must not map to null"),
                size,
                size,
                Self,
            )
        }
    }

    fn unmap_physical_region<T>(_region: &PhysicalMapping<Self, T>) {
        // Direct-map view; nothing to unmap.
    }
}
