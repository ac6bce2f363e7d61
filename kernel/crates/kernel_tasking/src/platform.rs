//! Platform collaborator: the per-machine facts the tasking core needs.

use alloc::sync::Arc;

use crate::process::Pid;

/// Segment selectors new register frames are seeded with.
#[derive(Debug, Clone, Copy)]
pub struct SelectorSet {
    pub kernel_code: u16,
    pub kernel_data: u16,
    pub user_code: u16,
    pub user_data: u16,
}

/// Current machine-specific register bases, inherited by kernel threads.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsrBases {
    pub gs: u64,
    pub fs: u64,
    pub shadow_gs: u64,
}

pub trait Platform: Send + Sync {
    fn selectors(&self) -> SelectorSet;

    /// Address a kernel thread returns to when its entry point returns; the
    /// trampoline terminates the thread.
    fn thread_exit_trampoline(&self) -> u64;

    /// Live gs/fs/shadow-gs bases of the creating CPU.
    fn msr_bases(&self) -> MsrBases;

    /// Monotonically non-decreasing tick counter.
    fn counter(&self) -> u64;

    fn ticks_per_millisecond(&self) -> u64 {
        1
    }

    fn interrupts_enabled(&self) -> bool;

    fn enable_interrupts(&self);
}

/// `/proc` integration: every process owns `/proc/<pid>/` with `cwd` and
/// `exe` links.
pub trait ProcFs: Send + Sync {
    fn create_process_dir(&self, pid: Pid);
    fn remove_process_dir(&self, pid: Pid);
    fn set_cwd_link(&self, pid: Pid, target: &str);
    fn set_exe_link(&self, pid: Pid, target: &str);
}

/// `/proc` hook for kernels booted without a VFS, and for tests that do not
/// care about the tree.
pub struct NullProcFs;

impl ProcFs for NullProcFs {
    fn create_process_dir(&self, _pid: Pid) {}
    fn remove_process_dir(&self, _pid: Pid) {}
    fn set_cwd_link(&self, _pid: Pid, _target: &str) {}
    fn set_exe_link(&self, _pid: Pid, _target: &str) {}
}

pub type PlatformRef = Arc<dyn Platform>;
