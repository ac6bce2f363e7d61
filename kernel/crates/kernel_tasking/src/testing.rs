//! Shared test doubles for the collaborator traits.

use alloc::alloc::{Layout, alloc_zeroed, dealloc};
use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize};
use core::sync::atomic::Ordering::Relaxed;

use spin::Mutex;

use crate::mm::{
    AddressSpaceHandle, MapError, MapFlags, PAGE_SIZE, PageBlock, TaskMemory,
};
use crate::platform::{MsrBases, Platform, ProcFs, SelectorSet};
use crate::process::{Pid, Process};
use crate::sched::Scheduler;
use crate::thread::Thread;

pub struct MockMemory {
    live: Mutex<Vec<(usize, usize)>>,
}

impl MockMemory {
    pub fn new() -> Self {
        Self {
            live: Mutex::new(Vec::new()),
        }
    }
}

impl TaskMemory for MockMemory {
    fn request_pages(&self, pages: usize) -> Option<PageBlock> {
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: non-zero layout.
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) })?;
        self.live.lock().push((ptr.as_ptr() as usize, pages));
        Some(PageBlock {
            ptr,
            phys: ptr.as_ptr() as u64,
            pages,
        })
    }

    fn free_pages(&self, block: PageBlock) {
        let mut live = self.live.lock();
        let pos = live
            .iter()
            .position(|&(a, p)| a == block.ptr.as_ptr() as usize && p == block.pages)
            .expect("freeing pages that were never allocated");
        live.remove(pos);
        let layout = Layout::from_size_align(block.pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: allocated with the identical layout in `request_pages`.
        unsafe { dealloc(block.ptr.as_ptr(), layout) };
    }
}

static NEXT_ROOT: AtomicU64 = AtomicU64::new(0x1000);

pub struct MockAddressSpace {
    root: u64,
    mapped: Mutex<BTreeSet<u64>>,
}

impl MockAddressSpace {
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self {
            root: NEXT_ROOT.fetch_add(0x1000, Relaxed),
            mapped: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn is_unmapped(&self, virt: u64) -> bool {
        !self.mapped.lock().contains(&(virt & !(PAGE_SIZE as u64 - 1)))
    }
}

impl AddressSpaceHandle for MockAddressSpace {
    fn root(&self) -> u64 {
        self.root
    }

    fn fork(&self) -> Result<Arc<dyn AddressSpaceHandle>, MapError> {
        Ok(Self::new_arc())
    }

    fn map(&self, virt: u64, _phys: u64, pages: usize, _flags: MapFlags) -> Result<(), MapError> {
        let mut mapped = self.mapped.lock();
        for page in 0..pages {
            mapped.insert(virt + (page * PAGE_SIZE) as u64);
        }
        Ok(())
    }

    fn unmap(&self, virt: u64, pages: usize) {
        let mut mapped = self.mapped.lock();
        for page in 0..pages {
            mapped.remove(&(virt + (page * PAGE_SIZE) as u64));
        }
    }

    fn protect(&self, _virt: u64, _pages: usize, _flags: MapFlags) -> Result<(), MapError> {
        Ok(())
    }
}

pub struct MockPlatform {
    counter: AtomicU64,
}

impl MockPlatform {
    pub const TRAMPOLINE: u64 = 0xFFFF_FFFF_DEAD_0000;

    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self {
            counter: AtomicU64::new(1),
        })
    }
}

impl Platform for MockPlatform {
    fn selectors(&self) -> SelectorSet {
        SelectorSet {
            kernel_code: 0x08,
            kernel_data: 0x10,
            user_code: 0x1B,
            user_data: 0x23,
        }
    }

    fn thread_exit_trampoline(&self) -> u64 {
        Self::TRAMPOLINE
    }

    fn msr_bases(&self) -> MsrBases {
        MsrBases {
            gs: 0x1110,
            fs: 0x2220,
            shadow_gs: 0x3330,
        }
    }

    fn counter(&self) -> u64 {
        self.counter.fetch_add(1, Relaxed)
    }

    fn interrupts_enabled(&self) -> bool {
        true
    }

    fn enable_interrupts(&self) {}
}

#[derive(Default)]
pub struct RecordingProcFs {
    pub dirs: Mutex<BTreeSet<Pid>>,
    pub cwd_links: Mutex<Vec<(Pid, alloc::string::String)>>,
    pub exe_links: Mutex<Vec<(Pid, alloc::string::String)>>,
}

impl RecordingProcFs {
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl ProcFs for RecordingProcFs {
    fn create_process_dir(&self, pid: Pid) {
        self.dirs.lock().insert(pid);
    }

    fn remove_process_dir(&self, pid: Pid) {
        self.dirs.lock().remove(&pid);
    }

    fn set_cwd_link(&self, pid: Pid, target: &str) {
        self.cwd_links.lock().push((pid, target.into()));
    }

    fn set_exe_link(&self, pid: Pid, target: &str) {
        self.exe_links.lock().push((pid, target.into()));
    }
}

#[derive(Default)]
pub struct TestScheduler {
    processes: Mutex<Vec<Arc<Process>>>,
    current: Mutex<Option<(Arc<Process>, Arc<Thread>)>>,
    pub yields: AtomicUsize,
    pub idle_started: AtomicBool,
    stopped: AtomicBool,
}

impl TestScheduler {
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_current(&self, process: Arc<Process>, thread: Arc<Thread>) {
        *self.current.lock() = Some((process, thread));
    }
}

impl Scheduler for TestScheduler {
    fn push_process(&self, process: Arc<Process>) {
        self.processes.lock().push(process);
    }

    fn pop_process(&self, process: &Arc<Process>) {
        self.processes.lock().retain(|p| !Arc::ptr_eq(p, process));
    }

    fn current_process(&self) -> Option<Arc<Process>> {
        self.current.lock().as_ref().map(|(p, _)| p.clone())
    }

    fn current_thread(&self) -> Option<Arc<Thread>> {
        self.current.lock().as_ref().map(|(_, t)| t.clone())
    }

    fn process_by_id(&self, id: Pid) -> Option<Arc<Process>> {
        self.processes.lock().iter().find(|p| p.id() == id).cloned()
    }

    fn processes(&self) -> Vec<Arc<Process>> {
        self.processes.lock().clone()
    }

    fn yield_now(&self) {
        self.yields.fetch_add(1, Relaxed);
    }

    fn start(&self) {}

    fn start_idle_process(&self) {
        self.idle_started.store(true, Relaxed);
    }

    fn stop(&self) {
        self.stopped.store(true, Relaxed);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Relaxed)
    }
}

/// Fully mocked task manager plus handles to the mocks.
pub struct TestRig {
    pub manager: Arc<crate::TaskManager>,
    pub scheduler: Arc<TestScheduler>,
    pub procfs: Arc<RecordingProcFs>,
    pub platform: Arc<MockPlatform>,
}

pub const KERNEL_ENTRY: u64 = 0xFFFF_8000_0010_0000;

pub fn rig() -> TestRig {
    let scheduler = TestScheduler::new_arc();
    let procfs = RecordingProcFs::new_arc();
    let platform = MockPlatform::new_arc();
    let manager = crate::TaskManager::new(
        platform.clone(),
        Arc::new(MockMemory::new()),
        MockAddressSpace::new_arc(),
        procfs.clone(),
        scheduler.clone(),
        KERNEL_ENTRY,
    );
    TestRig {
        manager,
        scheduler,
        procfs,
        platform,
    }
}
