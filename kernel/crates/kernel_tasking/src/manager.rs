//! The task manager: pid allocation, process/thread lifecycle, waits.

use alloc::string::ToString;
use alloc::sync::{Arc, Weak};
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering::Relaxed;

use kernel_abi::SIGTERM;
use log::{debug, error, trace};
use spin::{Mutex, Once};
use thiserror::Error;

use crate::mm::{AddressSpaceHandle, MapError, TaskMemory, VirtualMemoryArea};
use crate::platform::{Platform, ProcFs};
use crate::process::{Credentials, Pid, Process, TaskSecurity};
use crate::sched::Scheduler;
use crate::signal::SignalTable;
use crate::state::{ExecutionMode, TaskState};
use crate::thread::{Thread, ThreadCreateError, ThreadSpec};

/// Usable pages per kernel or user stack.
pub const STACK_PAGES: usize = 16;
/// Usable pages per syscall stack.
pub const SYSCALL_STACK_PAGES: usize = 16;

#[derive(Debug, Error)]
pub enum CreateProcessError {
    #[error("process name must not be empty")]
    EmptyName,
    #[error("failed to fork address space: {0}")]
    AddressSpace(#[from] MapError),
}

pub struct TaskManager {
    platform: Arc<dyn Platform>,
    memory: Arc<dyn TaskMemory>,
    kernel_address_space: Arc<dyn AddressSpaceHandle>,
    procfs: Arc<dyn ProcFs>,
    scheduler: Arc<dyn Scheduler>,
    next_pid: AtomicU64,
    lock: Mutex<()>,
    kernel_process: Once<Arc<Process>>,
}

impl TaskManager {
    /// Builds the manager and its kernel process, spawns the initial kernel
    /// thread at `entry_point` and brings up the idle process.
    pub fn new(
        platform: Arc<dyn Platform>,
        memory: Arc<dyn TaskMemory>,
        kernel_address_space: Arc<dyn AddressSpaceHandle>,
        procfs: Arc<dyn ProcFs>,
        scheduler: Arc<dyn Scheduler>,
        entry_point: u64,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            platform,
            memory,
            kernel_address_space,
            procfs,
            scheduler,
            next_pid: AtomicU64::new(0),
            lock: Mutex::new(()),
            kernel_process: Once::new(),
        });

        let kernel_process = manager
            .create_process(None, "Kernel", ExecutionMode::Kernel, true, 0, 0)
            .expect("kernel process creation cannot fail");
        manager.kernel_process.call_once(|| kernel_process.clone());

        let main_thread = manager
            .create_thread(&kernel_process, &ThreadSpec::kernel(entry_point))
            .expect("kernel main thread creation cannot fail");
        main_thread.rename("Main Thread");
        debug!(
            "created kernel process {:?} and thread {:?}",
            kernel_process.name(),
            main_thread.name()
        );

        if !manager.platform.interrupts_enabled() {
            error!("interrupts are not enabled");
            manager.platform.enable_interrupts();
        }

        manager.scheduler.start_idle_process();
        trace!("tasking is ready");
        manager
    }

    #[must_use]
    pub fn kernel_process(&self) -> &Arc<Process> {
        self.kernel_process.get().expect("tasking is initialized")
    }

    #[must_use]
    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    #[must_use]
    pub fn current_process(&self) -> Option<Arc<Process>> {
        self.scheduler.current_process()
    }

    #[must_use]
    pub fn current_thread(&self) -> Option<Arc<Thread>> {
        self.scheduler.current_thread()
    }

    #[must_use]
    pub fn process_by_id(&self, id: Pid) -> Option<Arc<Process>> {
        self.scheduler.process_by_id(id)
    }

    /// Creates a process. A `parent` of `None` defaults to the current
    /// process; `uid`/`gid` of `u16::MAX` inherit from the parent.
    pub fn create_process(
        self: &Arc<Self>,
        parent: Option<&Arc<Process>>,
        name: &str,
        execution_mode: ExecutionMode,
        use_kernel_page_table: bool,
        mut uid: u16,
        mut gid: u16,
    ) -> Result<Arc<Process>, CreateProcessError> {
        if name.is_empty() {
            return Err(CreateProcessError::EmptyName);
        }

        let _guard = self.lock.lock();
        let parent = parent
            .cloned()
            .or_else(|| self.scheduler.current_process());

        if let Some(parent) = &parent
            && uid == u16::MAX
            && gid == u16::MAX
        {
            let security = parent.security().read();
            uid = security.real.uid;
            gid = security.real.gid;
            debug!(
                "inherited uid {uid} and gid {gid} from parent process {:?}",
                parent.name()
            );
        }

        let security = TaskSecurity {
            real: Credentials { uid, gid },
            effective: Credentials { uid, gid },
            execution_mode,
            is_critical: execution_mode == ExecutionMode::Kernel,
        };

        let (address_space, owns_address_space) = if use_kernel_page_table {
            (self.kernel_address_space.clone(), false)
        } else {
            (self.kernel_address_space.fork()?, true)
        };

        let signals = parent
            .as_ref()
            .map_or_else(SignalTable::default, |p| p.signals().read().clone());

        let pid = self.next_pid.fetch_add(1, Relaxed);
        let vma = Arc::new(VirtualMemoryArea::new(
            self.memory.clone(),
            address_space.clone(),
        ));

        let process = Process::new(
            pid,
            name.to_string(),
            parent.as_ref().map_or_else(Weak::new, Arc::downgrade),
            address_space,
            owns_address_space,
            vma,
            security,
            signals,
            self.procfs.clone(),
            self.platform.counter(),
        );

        debug!(
            "created {:?} process {name:?} ({pid}), parent {:?}",
            execution_mode,
            parent.as_ref().map(|p| p.id())
        );

        if let Some(parent) = parent {
            parent.add_child(process.clone());
        }
        self.scheduler.push_process(process.clone());
        Ok(process)
    }

    /// Creates a thread inside `parent` (the current process when `None`).
    pub fn create_thread(
        self: &Arc<Self>,
        parent: &Arc<Process>,
        spec: &ThreadSpec<'_>,
    ) -> Result<Arc<Thread>, ThreadCreateError> {
        let _guard = self.lock.lock();

        let first_thread = parent.thread_count() == 0;
        let thread = Thread::create(
            parent,
            spec,
            &*self.platform,
            STACK_PAGES,
            SYSCALL_STACK_PAGES,
        )?;
        parent.add_thread(thread.clone());

        if first_thread {
            parent.set_abi(spec.architecture, spec.compatibility);
            if parent.state() == TaskState::Waiting && !spec.not_ready {
                parent.set_state(TaskState::Ready);
                debug!("setting process {:?} to ready", parent.name());
            }
        }

        debug!(
            "created thread {:?} ({}) in process {:?} ({})",
            thread.name(),
            thread.id(),
            parent.name(),
            parent.id()
        );
        Ok(thread)
    }

    /// Destroys a thread: detaches it from its parent, then frees its stacks.
    pub fn destroy_thread(&self, thread: &Arc<Thread>) {
        let _guard = self.lock.lock();
        self.destroy_thread_locked(thread);
    }

    fn destroy_thread_locked(&self, thread: &Arc<Thread>) {
        let Some(process) = thread.process() else {
            return;
        };
        process.remove_thread(thread);
        thread.release_resources(process.vma());
        debug!("thread {:?} ({}) destroyed", thread.name(), thread.id());
    }

    /// Destroys a process and, cascading, all of its children and threads.
    pub fn destroy_process(&self, process: &Arc<Process>) {
        let _guard = self.lock.lock();
        self.destroy_process_locked(process);
    }

    fn destroy_process_locked(&self, process: &Arc<Process>) {
        trace!("destroying process {:?} ({})", process.name(), process.id());

        // Out of the scheduler first so nothing dispatches into a
        // half-destroyed process.
        self.scheduler.pop_process(process);

        process.vma().release_all();
        process.file_descriptors().write().clear();

        for child in process.take_children() {
            child.clear_parent();
            self.destroy_process_locked(&child);
        }

        for thread in process.take_threads() {
            thread.release_resources(process.vma());
        }

        process.procfs().remove_process_dir(process.id());

        if let Some(parent) = process.parent() {
            parent.remove_child(process);
        }
        process.clear_parent();
    }

    /// Puts the current thread to sleep for at least `milliseconds`.
    pub fn sleep(&self, milliseconds: u64) {
        let Some(thread) = self.scheduler.current_thread() else {
            return;
        };

        thread.set_state(TaskState::Sleeping);
        let target = self.platform.counter()
            + milliseconds * self.platform.ticks_per_millisecond();
        thread.set_sleep_until(target);

        self.scheduler.yield_now();
    }

    pub fn wait_for_process_state(&self, process: &Arc<Process>, state: TaskState) {
        if process.state() == TaskState::Unknown {
            return;
        }
        while process.state() != state {
            self.scheduler.yield_now();
        }
    }

    pub fn wait_for_thread_state(&self, thread: &Arc<Thread>, state: TaskState) {
        if thread.state() == TaskState::Unknown {
            return;
        }
        while thread.state() != state {
            self.scheduler.yield_now();
        }
    }

    /// Blocks until the process reaches a terminal state.
    pub fn wait_for_process(&self, process: &Arc<Process>) {
        if process.state() == TaskState::Unknown {
            return;
        }
        while !process.state().is_terminal() {
            self.scheduler.yield_now();
        }
    }

    pub fn wait_for_thread(&self, thread: &Arc<Thread>) {
        if thread.state() == TaskState::Unknown {
            return;
        }
        while !thread.state().is_terminal() {
            self.scheduler.yield_now();
        }
    }

    /// Asks every live process except the caller's to terminate.
    pub fn signal_shutdown(&self) {
        let current = self.scheduler.current_process();
        for process in self.scheduler.processes() {
            if process.state().is_terminal() {
                continue;
            }
            if let Some(current) = &current
                && Arc::ptr_eq(current, &process)
            {
                continue;
            }
            debug!(
                "sending SIGTERM to process {:?} ({})",
                process.name(),
                process.id()
            );
            let _ = process.send_signal(SIGTERM);
        }
    }

    /// Enters the panic lock: no further scheduling happens anywhere.
    pub fn panic(&self) {
        self.scheduler.stop();
    }

    #[must_use]
    pub fn is_panic(&self) -> bool {
        self.scheduler.is_stopped()
    }

    pub fn yield_now(&self) {
        self.scheduler.yield_now();
    }
}

#[cfg(test)]
mod tests {
    use kernel_abi::{KILL_CRASH, SIGTERM};

    use super::*;
    use crate::testing::rig;

    #[test]
    fn bringup_creates_the_kernel_process() {
        let rig = rig();
        let kernel = rig.manager.kernel_process();

        assert_eq!(kernel.id(), 0);
        assert_eq!(kernel.name(), "Kernel");
        assert!(kernel.security().read().is_critical);
        assert_eq!(kernel.thread_count(), 1);
        assert_eq!(kernel.threads()[0].name(), "Main Thread");
        assert!(rig.scheduler.idle_started.load(Relaxed));
        assert!(rig.procfs.dirs.lock().contains(&0));
    }

    #[test]
    fn pids_increment_and_proc_dirs_appear() {
        let rig = rig();
        let kernel = rig.manager.kernel_process().clone();
        let a = rig
            .manager
            .create_process(Some(&kernel), "a", ExecutionMode::User, false, 100, 100)
            .unwrap();
        let b = rig
            .manager
            .create_process(Some(&kernel), "b", ExecutionMode::User, false, 100, 100)
            .unwrap();

        assert_eq!(a.id(), 1);
        assert_eq!(b.id(), 2);
        assert!(rig.procfs.dirs.lock().contains(&1));
        assert!(rig.procfs.dirs.lock().contains(&2));
        assert!(rig.scheduler.process_by_id(2).is_some());
    }

    #[test]
    fn max_uid_gid_inherit_from_the_parent() {
        let rig = rig();
        let kernel = rig.manager.kernel_process().clone();
        let parent = rig
            .manager
            .create_process(Some(&kernel), "parent", ExecutionMode::User, false, 500, 600)
            .unwrap();
        let child = rig
            .manager
            .create_process(
                Some(&parent),
                "child",
                ExecutionMode::User,
                false,
                u16::MAX,
                u16::MAX,
            )
            .unwrap();

        let security = child.security().read();
        assert_eq!(security.real.uid, 500);
        assert_eq!(security.real.gid, 600);
        assert_eq!(security.effective.uid, 500);
    }

    #[test]
    fn empty_names_are_rejected() {
        let rig = rig();
        let kernel = rig.manager.kernel_process().clone();
        assert!(matches!(
            rig.manager
                .create_process(Some(&kernel), "", ExecutionMode::User, false, 0, 0),
            Err(CreateProcessError::EmptyName)
        ));
    }

    #[test]
    fn fresh_processes_use_a_forked_address_space() {
        let rig = rig();
        let kernel = rig.manager.kernel_process().clone();
        let user = rig
            .manager
            .create_process(Some(&kernel), "user", ExecutionMode::User, false, 0, 0)
            .unwrap();

        assert!(user.owns_address_space());
        assert_ne!(
            user.address_space().root(),
            kernel.address_space().root()
        );
        assert!(!kernel.owns_address_space());
    }

    #[test]
    fn exit_codes_start_as_kill_crash() {
        let rig = rig();
        let kernel = rig.manager.kernel_process();
        assert_eq!(kernel.exit_code(), KILL_CRASH);
        assert_eq!(kernel.threads()[0].exit_code(), KILL_CRASH);
    }

    #[test]
    fn destroying_a_process_cascades_to_descendants() {
        let rig = rig();
        let kernel = rig.manager.kernel_process().clone();
        let parent = rig
            .manager
            .create_process(Some(&kernel), "parent", ExecutionMode::User, false, 0, 0)
            .unwrap();
        let child = rig
            .manager
            .create_process(Some(&parent), "child", ExecutionMode::User, false, 0, 0)
            .unwrap();
        let grandchild = rig
            .manager
            .create_process(Some(&child), "grandchild", ExecutionMode::User, false, 0, 0)
            .unwrap();
        rig.manager
            .create_thread(&parent, &ThreadSpec::kernel(0x1000))
            .unwrap();

        rig.manager.destroy_process(&parent);

        // No leaked descendants reachable in the process list afterwards.
        let survivors = rig.scheduler.processes();
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].id(), kernel.id());
        assert!(rig.scheduler.process_by_id(parent.id()).is_none());
        assert!(rig.scheduler.process_by_id(child.id()).is_none());
        assert!(rig.scheduler.process_by_id(grandchild.id()).is_none());

        assert_eq!(parent.thread_count(), 0);
        assert!(parent.children().is_empty());
        assert!(grandchild.parent().is_none());
        assert!(!rig.procfs.dirs.lock().contains(&parent.id()));
        assert!(!rig.procfs.dirs.lock().contains(&grandchild.id()));
        assert!(kernel.children().is_empty());
    }

    #[test]
    fn destroying_a_thread_detaches_it_first() {
        let rig = rig();
        let kernel = rig.manager.kernel_process().clone();
        let thread = rig
            .manager
            .create_thread(&kernel, &ThreadSpec::kernel(0x2000))
            .unwrap();
        assert_eq!(kernel.thread_count(), 2);

        rig.manager.destroy_thread(&thread);
        assert_eq!(kernel.thread_count(), 1);
        assert!(thread.stack().lock().is_none());
    }

    #[test]
    fn sleep_records_the_target_and_yields() {
        let rig = rig();
        let kernel = rig.manager.kernel_process().clone();
        let thread = kernel.threads()[0].clone();
        rig.scheduler.set_current(kernel, thread.clone());

        let before = rig.platform.counter();
        rig.manager.sleep(50);

        assert_eq!(thread.state(), TaskState::Sleeping);
        assert!(thread.sleep_until() > before + 49);
        assert!(rig.scheduler.yields.load(Relaxed) > 0);
    }

    #[test]
    fn waits_return_once_the_state_is_reached() {
        let rig = rig();
        let kernel = rig.manager.kernel_process().clone();
        let thread = kernel.threads()[0].clone();

        thread.set_state(TaskState::Zombie);
        rig.manager.wait_for_thread(&thread);
        rig.manager.wait_for_thread_state(&thread, TaskState::Zombie);
        rig.manager.wait_for_process(&kernel);
    }

    #[test]
    fn signal_shutdown_terms_everyone_else() {
        let rig = rig();
        let kernel = rig.manager.kernel_process().clone();
        let other = rig
            .manager
            .create_process(Some(&kernel), "other", ExecutionMode::User, false, 0, 0)
            .unwrap();
        let other_thread = rig
            .manager
            .create_thread(&other, &ThreadSpec::kernel(0x3000))
            .unwrap();
        let kernel_thread = kernel.threads()[0].clone();
        rig.scheduler.set_current(kernel.clone(), kernel_thread.clone());

        rig.manager.signal_shutdown();

        assert!(other_thread.pending_signals().is_pending(SIGTERM));
        assert!(!kernel_thread.pending_signals().is_pending(SIGTERM));
    }

    #[test]
    fn panic_stops_the_scheduler() {
        let rig = rig();
        assert!(!rig.manager.is_panic());
        rig.manager.panic();
        assert!(rig.manager.is_panic());
    }
}
