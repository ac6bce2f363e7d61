pub mod address_space;
pub mod heap;
pub mod phys;

pub fn init() {
    phys::PhysicalMemory::init();
    address_space::init();
    heap::init();
    phys::PhysicalMemory::init_stage2();
}
