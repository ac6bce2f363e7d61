//! Threads: the unit of scheduling.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize};
use core::sync::atomic::Ordering::Relaxed;

use kernel_abi::{Errno, KILL_CRASH, Signal};
use log::{debug, trace};
use spin::{Mutex, RwLock};
use thiserror::Error;

use crate::frame::{RFlags, TrapFrame};
use crate::mm::{VirtualMemoryArea, VmaRegion, pages_for};
use crate::platform::Platform;
use crate::process::{Process, TaskSecurity};
use crate::signal::SignalSet;
use crate::stack::{GuardedStack, StackAllocationError};
use crate::state::{
    AtomicTaskState, ExecutionMode, TaskArchitecture, TaskCompatibility, TaskState,
};
use crate::tls::ThreadTls;
use crate::ustack::{AuxEntry, build_sysv_stack};

pub type Tid = u64;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ThreadCreateError {
    #[error(transparent)]
    Stack(#[from] StackAllocationError),
    #[error("out of memory for thread bookkeeping")]
    OutOfMemory,
}

/// Everything `create_thread` needs to know about the new thread.
#[derive(Clone, Copy)]
pub struct ThreadSpec<'a> {
    pub entry_point: u64,
    pub argv: &'a [&'a str],
    pub envp: &'a [&'a str],
    pub auxv: &'a [AuxEntry],
    pub architecture: TaskArchitecture,
    pub compatibility: TaskCompatibility,
    /// Defer scheduling: the thread is created `Waiting` instead of `Ready`.
    pub not_ready: bool,
}

impl<'a> ThreadSpec<'a> {
    #[must_use]
    pub fn kernel(entry_point: u64) -> Self {
        Self {
            entry_point,
            argv: &[],
            envp: &[],
            auxv: &[],
            architecture: TaskArchitecture::X86_64,
            compatibility: TaskCompatibility::Native,
            not_ready: false,
        }
    }
}

/// Per-thread block reachable through the shadow gs base; the syscall entry
/// stub switches to the syscall stack through it.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct GsThreadBlock {
    pub syscall_stack: u64,
    pub syscall_stack_base: u64,
    pub temp_stack: u64,
    pub syscall_stack_pages: u64,
    pub thread: u64,
}

/// 512-byte `fxsave` area, 16-byte aligned as the instruction demands.
#[repr(C, align(16))]
pub struct FxArea {
    data: [u8; 512],
}

impl FxArea {
    const FCW: u16 = 0b0000_0011_0011_1111;
    const MXCSR: u32 = 0b0001_1111_1000_0000;
    const MXCSR_MASK: u32 = 0b1111_1111_1011_1111;

    #[must_use]
    pub fn new() -> Self {
        let mut data = [0u8; 512];
        data[0..2].copy_from_slice(&Self::FCW.to_le_bytes());
        data[24..28].copy_from_slice(&Self::MXCSR.to_le_bytes());
        data[28..32].copy_from_slice(&Self::MXCSR_MASK.to_le_bytes());
        Self { data }
    }

    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    #[must_use]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }
}

impl Default for FxArea {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Thread {
    id: Tid,
    process: Weak<Process>,
    name: RwLock<String>,
    entry_point: u64,

    registers: Mutex<TrapFrame>,
    stack: Mutex<Option<GuardedStack>>,
    syscall_stack: Mutex<Option<VmaRegion>>,
    gs_block: Mutex<Option<VmaRegion>>,
    tls: Mutex<Option<ThreadTls>>,
    fx_area: Mutex<Box<FxArea>>,

    gs_base: AtomicU64,
    fs_base: AtomicU64,
    shadow_gs_base: AtomicU64,

    pending_signals: SignalSet,
    security: RwLock<TaskSecurity>,
    architecture: TaskArchitecture,
    compatibility: TaskCompatibility,
    linux_tgid: Option<Tid>,

    state: AtomicTaskState,
    exit_code: AtomicI32,
    sleep_until: AtomicU64,
    spawn_time: u64,
    allocated_memory: AtomicUsize,
}

impl Thread {
    /// Builds a thread inside `parent`. The caller (the task manager) holds
    /// the tasking lock, registers the thread with the parent and patches the
    /// gs block with the thread pointer.
    pub(crate) fn create(
        parent: &Arc<Process>,
        spec: &ThreadSpec<'_>,
        platform: &dyn Platform,
        stack_pages: usize,
        syscall_stack_pages: usize,
    ) -> Result<Arc<Self>, ThreadCreateError> {
        let id = parent.id() + parent.thread_count() as Tid;
        let vma = parent.vma();
        let mut security = *parent.security().read();
        let selectors = platform.selectors();

        let mut regs = TrapFrame::default();
        regs.iret.rip = spec.entry_point;
        regs.iret.rflags =
            (RFlags::ALWAYS_ONE | RFlags::INTERRUPT | RFlags::ID).bits();

        let mut gs_base = 0u64;
        let mut fs_base = 0u64;
        let mut shadow_gs_base = 0u64;
        let mut syscall_stack = None;
        let mut gs_block = None;

        let stack = match security.execution_mode {
            ExecutionMode::Kernel => {
                security.is_critical = true;
                let stack = GuardedStack::allocate(vma, stack_pages, false)?;

                let msr = platform.msr_bases();
                gs_base = msr.gs;
                fs_base = msr.fs;
                shadow_gs_base = msr.shadow_gs;

                regs.iret.cs = u64::from(selectors.kernel_code);
                regs.iret.ss = u64::from(selectors.kernel_data);

                // Seed the top of the stack with the exit trampoline so a
                // plain `ret` from the entry point terminates the thread.
                let trampoline = platform.thread_exit_trampoline();
                // SAFETY: the stack was just allocated and nobody else can
                // see it yet.
                let slice = unsafe { stack.as_mut_slice() };
                let top = slice.len() - 8;
                slice[top..].copy_from_slice(&trampoline.to_ne_bytes());
                regs.iret.rsp = stack.top() - 8;

                stack
            }
            ExecutionMode::User => {
                let stack = GuardedStack::allocate(vma, stack_pages, true)?;

                let gst = vma
                    .request_pages(pages_for(size_of::<GsThreadBlock>()), true)
                    .ok_or(ThreadCreateError::OutOfMemory)?;
                let ssb = vma
                    .request_pages(syscall_stack_pages, true)
                    .ok_or(ThreadCreateError::OutOfMemory)?;

                let block = GsThreadBlock {
                    syscall_stack: ssb.virt + ssb.len() as u64 - 0x10,
                    syscall_stack_base: ssb.virt,
                    temp_stack: 0,
                    syscall_stack_pages: syscall_stack_pages as u64,
                    thread: 0,
                };
                // SAFETY: the gs block pages were just allocated for this
                // write.
                unsafe { gst.ptr.cast::<GsThreadBlock>().write(block) };
                debug!(
                    "new syscall stack at {:#x} (base {:#x}), gs block at {:#x}",
                    block.syscall_stack, block.syscall_stack_base, gst.virt
                );

                regs.iret.cs = u64::from(selectors.user_code);
                regs.iret.ss = u64::from(selectors.user_data);

                // SAFETY: fresh stack, exclusively ours until the thread is
                // visible.
                let slice = unsafe { stack.as_mut_slice() };
                let built =
                    build_sysv_stack(slice, stack.top(), spec.argv, spec.envp, spec.auxv);
                regs.iret.rsp = built.stack_pointer;

                if spec.compatibility == TaskCompatibility::Native {
                    regs.regs.rdi = built.argc;
                    regs.regs.rsi = built.argv;
                    regs.regs.rcx = built.envc;
                    regs.regs.rdx = built.envp;
                }

                shadow_gs_base = gst.virt;
                syscall_stack = Some(ssb);
                gs_block = Some(gst);

                stack
            }
        };

        let tls = parent.tls_template().and_then(|template| {
            ThreadTls::for_thread(
                vma,
                &template,
                security.execution_mode == ExecutionMode::User,
            )
        });
        if let Some(tls) = &tls {
            gs_base = tls.pointer;
            fs_base = tls.pointer;
        }

        let linux_tgid = (spec.compatibility == TaskCompatibility::Linux).then(|| {
            parent
                .threads()
                .first()
                .and_then(|t| t.linux_tgid)
                .unwrap_or_else(|| parent.id())
        });

        let name = parent.name();
        let allocated = size_of::<Self>() + name.len() + 1 + size_of::<GuardedStack>();
        let state = if spec.not_ready {
            TaskState::Waiting
        } else {
            TaskState::Ready
        };

        let thread = Arc::new(Self {
            id,
            process: Arc::downgrade(parent),
            name: RwLock::new(name),
            entry_point: spec.entry_point,
            registers: Mutex::new(regs),
            stack: Mutex::new(Some(stack)),
            syscall_stack: Mutex::new(syscall_stack),
            gs_block: Mutex::new(gs_block),
            tls: Mutex::new(tls),
            fx_area: Mutex::new(Box::new(FxArea::new())),
            gs_base: AtomicU64::new(gs_base),
            fs_base: AtomicU64::new(fs_base),
            shadow_gs_base: AtomicU64::new(shadow_gs_base),
            pending_signals: SignalSet::default(),
            security: RwLock::new(security),
            architecture: spec.architecture,
            compatibility: spec.compatibility,
            linux_tgid,
            state: AtomicTaskState::new(state),
            exit_code: AtomicI32::new(KILL_CRASH),
            sleep_until: AtomicU64::new(0),
            spawn_time: platform.counter(),
            allocated_memory: AtomicUsize::new(allocated),
        });

        // Back-pointer for the syscall entry stub.
        if let Some(gst) = thread.gs_block.lock().as_ref() {
            // SAFETY: the block was initialized above and is still exclusive.
            unsafe {
                let ptr = gst.ptr.cast::<GsThreadBlock>().as_ptr();
                (*ptr).thread = Arc::as_ptr(&thread) as u64;
            }
        }

        Ok(thread)
    }

    #[must_use]
    pub fn id(&self) -> Tid {
        self.id
    }

    #[must_use]
    pub fn process(&self) -> Option<Arc<Process>> {
        self.process.upgrade()
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    /// # Panics
    /// Panics on an empty name; thread names are never empty.
    pub fn rename(&self, name: &str) {
        assert!(!name.is_empty());
        trace!("renaming thread {:?} to {name:?}", self.name());
        let mut guard = self.name.write();
        self.allocated_memory.fetch_sub(guard.len() + 1, Relaxed);
        self.allocated_memory.fetch_add(name.len() + 1, Relaxed);
        *guard = String::from(name);
    }

    #[must_use]
    pub fn entry_point(&self) -> u64 {
        self.entry_point
    }

    #[must_use]
    pub fn registers(&self) -> &Mutex<TrapFrame> {
        &self.registers
    }

    /// Seeds the first six SysV argument registers, optionally retargeting
    /// the instruction pointer.
    pub fn sysv_abi_call(&self, args: [u64; 6], function: Option<u64>) {
        let mut regs = self.registers.lock();
        regs.regs.rdi = args[0];
        regs.regs.rsi = args[1];
        regs.regs.rdx = args[2];
        regs.regs.rcx = args[3];
        regs.regs.r8 = args[4];
        regs.regs.r9 = args[5];
        if let Some(function) = function {
            regs.iret.rip = function;
        }
    }

    #[must_use]
    pub fn stack(&self) -> &Mutex<Option<GuardedStack>> {
        &self.stack
    }

    #[must_use]
    pub fn syscall_stack(&self) -> &Mutex<Option<VmaRegion>> {
        &self.syscall_stack
    }

    #[must_use]
    pub fn tls(&self) -> &Mutex<Option<ThreadTls>> {
        &self.tls
    }

    #[must_use]
    pub fn fx_area(&self) -> &Mutex<Box<FxArea>> {
        &self.fx_area
    }

    #[must_use]
    pub fn gs_base(&self) -> u64 {
        self.gs_base.load(Relaxed)
    }

    #[must_use]
    pub fn fs_base(&self) -> u64 {
        self.fs_base.load(Relaxed)
    }

    #[must_use]
    pub fn shadow_gs_base(&self) -> u64 {
        self.shadow_gs_base.load(Relaxed)
    }

    #[must_use]
    pub fn pending_signals(&self) -> &SignalSet {
        &self.pending_signals
    }

    pub fn send_signal(&self, signal: Signal) -> Result<(), Errno> {
        if let Some(process) = self.process() {
            process.signals().read().disposition(signal)?;
        }
        self.pending_signals.raise(signal)
    }

    #[must_use]
    pub fn security(&self) -> &RwLock<TaskSecurity> {
        &self.security
    }

    pub fn set_critical(&self, critical: bool) {
        self.security.write().is_critical = critical;
        if let Some(process) = self.process()
            && process.thread_count() == 1
        {
            process.security().write().is_critical = critical;
        }
    }

    #[must_use]
    pub fn architecture(&self) -> TaskArchitecture {
        self.architecture
    }

    #[must_use]
    pub fn compatibility(&self) -> TaskCompatibility {
        self.compatibility
    }

    #[must_use]
    pub fn linux_tgid(&self) -> Option<Tid> {
        self.linux_tgid
    }

    #[must_use]
    pub fn state(&self) -> TaskState {
        self.state.load()
    }

    /// Sets the thread state; the sole thread of a process mirrors the state
    /// onto the process.
    pub fn set_state(&self, state: TaskState) {
        self.state.store(state);
        if let Some(process) = self.process()
            && process.thread_count() == 1
        {
            process.set_state_raw(state);
        }
    }

    pub(crate) fn set_state_raw(&self, state: TaskState) {
        self.state.store(state);
    }

    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Relaxed)
    }

    pub fn set_exit_code(&self, code: i32) {
        self.exit_code.store(code, Relaxed);
        if let Some(process) = self.process()
            && process.thread_count() == 1
        {
            process.set_exit_code_raw(code);
        }
    }

    pub(crate) fn set_exit_code_raw(&self, code: i32) {
        self.exit_code.store(code, Relaxed);
    }

    pub fn set_sleep_until(&self, target: u64) {
        self.sleep_until.store(target, Relaxed);
    }

    #[must_use]
    pub fn sleep_until(&self) -> u64 {
        self.sleep_until.load(Relaxed)
    }

    #[must_use]
    pub fn spawn_time(&self) -> u64 {
        self.spawn_time
    }

    /// Bytes attributable to this thread.
    #[must_use]
    pub fn size(&self) -> usize {
        let mut total = self.allocated_memory.load(Relaxed);
        if let Some(stack) = self.stack.lock().as_ref() {
            total += stack.size();
        }
        total
    }

    /// Releases every owned allocation back to the process VMA. Called after
    /// the thread has been detached from its parent.
    pub(crate) fn release_resources(&self, vma: &VirtualMemoryArea) {
        if let Some(stack) = self.stack.lock().take() {
            stack.release(vma);
        }
        if let Some(region) = self.syscall_stack.lock().take() {
            vma.release(&region);
        }
        if let Some(region) = self.gs_block.lock().take() {
            vma.release(&region);
        }
        if let Some(tls) = self.tls.lock().take() {
            tls.release(vma);
        }
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &*self.name.read())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use super::*;
    use crate::state::TaskState;
    use crate::testing::{MockPlatform, rig};
    use crate::tls::TlsTemplate;

    fn user_process(rig: &crate::testing::TestRig) -> Arc<Process> {
        let kernel = rig.manager.kernel_process().clone();
        rig.manager
            .create_process(Some(&kernel), "user", ExecutionMode::User, false, 100, 100)
            .unwrap()
    }

    #[test]
    fn thread_ids_derive_from_the_process_id() {
        let rig = rig();
        let process = user_process(&rig);
        let pid = process.id();

        let spec = ThreadSpec::kernel(0x40_0000);
        let t0 = rig.manager.create_thread(&process, &spec).unwrap();
        let t1 = rig.manager.create_thread(&process, &spec).unwrap();
        let t2 = rig.manager.create_thread(&process, &spec).unwrap();

        assert_eq!(t0.id(), pid);
        assert_eq!(t1.id(), pid + 1);
        assert_eq!(t2.id(), pid + 2);
        // Stable and unique for the lifetime of the threads.
        assert_eq!(process.thread(pid + 1).unwrap().id(), t1.id());
        assert!(!Arc::ptr_eq(&t0, &t1));
    }

    #[test]
    fn first_thread_readies_a_waiting_process() {
        let rig = rig();
        let process = user_process(&rig);
        assert_eq!(process.state(), TaskState::Waiting);

        let thread = rig
            .manager
            .create_thread(&process, &ThreadSpec::kernel(0x40_0000))
            .unwrap();
        assert_eq!(process.state(), TaskState::Ready);
        assert_eq!(thread.state(), TaskState::Ready);
    }

    #[test]
    fn deferred_threads_stay_waiting() {
        let rig = rig();
        let process = user_process(&rig);
        let spec = ThreadSpec {
            not_ready: true,
            ..ThreadSpec::kernel(0x40_0000)
        };
        let thread = rig.manager.create_thread(&process, &spec).unwrap();
        assert_eq!(thread.state(), TaskState::Waiting);
        assert_eq!(process.state(), TaskState::Waiting);
    }

    #[test]
    fn kernel_threads_return_into_the_exit_trampoline() {
        let rig = rig();
        let kernel = rig.manager.kernel_process().clone();
        let thread = rig
            .manager
            .create_thread(&kernel, &ThreadSpec::kernel(0xFFFF_8000_0020_0000))
            .unwrap();

        let regs = thread.registers().lock();
        assert_eq!(regs.iret.rip, 0xFFFF_8000_0020_0000);
        assert_eq!(regs.iret.cs, 0x08);
        assert_eq!(regs.iret.ss, 0x10);
        let rflags = RFlags::from_bits_truncate(regs.iret.rflags);
        assert!(rflags.contains(RFlags::ALWAYS_ONE | RFlags::INTERRUPT));
        assert!(!rflags.contains(RFlags::ALIGNMENT_CHECK));

        let stack_guard = thread.stack().lock();
        let stack = stack_guard.as_ref().unwrap();
        assert_eq!(regs.iret.rsp, stack.top() - 8);
        // SAFETY: the stack is live and this test is its only user.
        let slice = unsafe { stack.as_mut_slice() };
        let seeded = u64::from_ne_bytes(slice[slice.len() - 8..].try_into().unwrap());
        assert_eq!(seeded, MockPlatform::TRAMPOLINE);

        // Kernel threads inherit the creating CPU's machine-specific bases.
        assert_eq!(thread.gs_base(), 0x1110);
        assert_eq!(thread.fs_base(), 0x2220);
        assert_eq!(thread.shadow_gs_base(), 0x3330);
        assert!(thread.security().read().is_critical);
    }

    #[test]
    fn user_threads_get_stack_syscall_stack_and_gs_block() {
        let rig = rig();
        let process = user_process(&rig);
        let spec = ThreadSpec {
            argv: &["hello", "world"],
            envp: &["X=1"],
            ..ThreadSpec::kernel(0x40_0000)
        };
        let thread = rig.manager.create_thread(&process, &spec).unwrap();

        let regs = thread.registers().lock();
        assert_eq!(regs.iret.cs, 0x1B);
        assert_eq!(regs.iret.ss, 0x23);
        assert_eq!(regs.iret.rsp % 16, 0);

        // Native compatibility pre-seeds (argc, argv, envc, envp).
        assert_eq!(regs.regs.rdi, 2);
        assert_eq!(regs.regs.rsi, regs.iret.rsp + 8);
        assert_eq!(regs.regs.rcx, 1);
        assert_eq!(regs.regs.rdx, regs.iret.rsp + 8 + 16 + 8);

        // The syscall stack is distinct from the user stack.
        let stack_guard = thread.stack().lock();
        let stack = stack_guard.as_ref().unwrap();
        let syscall_guard = thread.syscall_stack().lock();
        let syscall = syscall_guard.as_ref().unwrap();
        assert!(syscall.virt != stack.bottom());
        assert!(
            syscall.virt + syscall.len() as u64 <= stack.bottom()
                || syscall.virt >= stack.top()
        );

        // The gs block points back at the thread and at the syscall stack.
        let gs_guard = thread.gs_block.lock();
        let gst = gs_guard.as_ref().unwrap();
        // SAFETY: block is live mock memory.
        let block = unsafe { gst.ptr.cast::<GsThreadBlock>().as_ref() };
        assert_eq!(block.syscall_stack_base, syscall.virt);
        assert_eq!(block.syscall_stack, syscall.virt + syscall.len() as u64 - 0x10);
        assert_eq!(block.thread, Arc::as_ptr(&thread) as u64);
        assert_eq!(thread.shadow_gs_base(), gst.virt);
    }

    #[test]
    fn stacks_are_guarded_above_and_below() {
        let rig = rig();
        let process = user_process(&rig);
        let thread = rig
            .manager
            .create_thread(&process, &ThreadSpec::kernel(0x40_0000))
            .unwrap();

        let stack_guard = thread.stack().lock();
        let stack = stack_guard.as_ref().unwrap();
        let (low, high) = stack.guards();
        assert_eq!(low + crate::mm::PAGE_SIZE as u64, stack.bottom());
        assert_eq!(high, stack.top());
    }

    #[test]
    fn tls_template_is_instantiated_per_thread() {
        let rig = rig();
        let process = user_process(&rig);
        let image = [0x5Au8; 16];
        process.set_tls_template(TlsTemplate {
            image: image.as_ptr() as u64,
            vbase: 0,
            size: 32,
            fsize: 16,
        });

        let thread = rig
            .manager
            .create_thread(&process, &ThreadSpec::kernel(0x40_0000))
            .unwrap();

        let tls_guard = thread.tls().lock();
        let tls = tls_guard.as_ref().unwrap();
        assert_eq!(thread.fs_base(), tls.pointer);
        assert_eq!(thread.gs_base(), tls.pointer);
        // SAFETY: mock TLS pages are live.
        let slot = unsafe { ((tls.pbase + 32) as *const u64).read() };
        assert_eq!(slot, tls.pointer);
    }

    #[test]
    fn single_thread_state_changes_mirror_to_the_process() {
        let rig = rig();
        let process = user_process(&rig);
        let thread = rig
            .manager
            .create_thread(&process, &ThreadSpec::kernel(0x40_0000))
            .unwrap();

        for state in [
            TaskState::Running,
            TaskState::Sleeping,
            TaskState::Blocked,
            TaskState::Zombie,
        ] {
            thread.set_state(state);
            assert_eq!(process.state(), state);
        }

        thread.set_exit_code(7);
        assert_eq!(process.exit_code(), 7);

        // A second thread breaks the mirror.
        let other = rig
            .manager
            .create_thread(&process, &ThreadSpec::kernel(0x41_0000))
            .unwrap();
        other.set_state(TaskState::Stopped);
        assert_ne!(process.state(), TaskState::Stopped);
    }

    #[test]
    fn sysv_abi_call_seeds_argument_registers() {
        let rig = rig();
        let kernel = rig.manager.kernel_process().clone();
        let thread = rig
            .manager
            .create_thread(&kernel, &ThreadSpec::kernel(0x1000))
            .unwrap();

        thread.sysv_abi_call([1, 2, 3, 4, 5, 6], Some(0x9000));
        let regs = thread.registers().lock();
        assert_eq!(regs.regs.rdi, 1);
        assert_eq!(regs.regs.rsi, 2);
        assert_eq!(regs.regs.rdx, 3);
        assert_eq!(regs.regs.rcx, 4);
        assert_eq!(regs.regs.r8, 5);
        assert_eq!(regs.regs.r9, 6);
        assert_eq!(regs.iret.rip, 0x9000);
    }

    #[test]
    fn fx_area_is_aligned_and_seeded() {
        let fx = FxArea::new();
        assert_eq!(fx.as_ptr() as usize % 16, 0);
        assert_eq!(fx.data[0], 0x3F);
        assert_eq!(fx.data[1], 0x03);
        assert_eq!(&fx.data[24..28], &0x1F80u32.to_le_bytes());
    }
}
