//! Scheduler contract.
//!
//! The tasking core is policy-free: one scheduler implementation sits behind
//! this trait (the kernel's round-robin), and everything else — process
//! creation, waits, shutdown — talks to it through these operations.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::process::{Pid, Process};
use crate::thread::{Thread, Tid};

pub trait Scheduler: Send + Sync {
    /// Makes a process eligible for scheduling.
    fn push_process(&self, process: Arc<Process>);

    /// Removes a process from scheduling; it will never run again.
    fn pop_process(&self, process: &Arc<Process>);

    /// The process running on the calling CPU.
    fn current_process(&self) -> Option<Arc<Process>>;

    /// The thread running on the calling CPU.
    fn current_thread(&self) -> Option<Arc<Thread>>;

    fn process_by_id(&self, id: Pid) -> Option<Arc<Process>>;

    fn thread_by_id(&self, id: Tid, parent: &Arc<Process>) -> Option<Arc<Thread>> {
        parent.thread(id)
    }

    /// Snapshot of every scheduled process.
    fn processes(&self) -> Vec<Arc<Process>>;

    /// Voluntary preemption.
    fn yield_now(&self);

    /// Begins periodic scheduler ticks; returns once ticks are running.
    fn start(&self);

    /// Creates the kernel idle thread(s).
    fn start_idle_process(&self);

    /// Halts all future scheduling; set on kernel panic.
    fn stop(&self);

    fn is_stopped(&self) -> bool;
}
