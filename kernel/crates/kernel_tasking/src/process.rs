//! Processes: address-space owners and containers of threads.

use alloc::string::{String, ToString};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, AtomicUsize};
use core::sync::atomic::Ordering::Relaxed;

use kernel_abi::{Errno, KILL_CRASH, Signal};
use log::{trace, warn};
use spin::RwLock;

use crate::fd::FileDescriptorTable;
use crate::mm::{AddressSpaceHandle, ProgramBreak, VirtualMemoryArea};
use crate::platform::ProcFs;
use crate::signal::SignalTable;
use crate::state::{AtomicTaskState, ExecutionMode, TaskArchitecture, TaskCompatibility, TaskState};
use crate::thread::{Thread, Tid};
use crate::tls::TlsTemplate;

pub type Pid = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u16,
    pub gid: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct TaskSecurity {
    pub real: Credentials,
    pub effective: Credentials,
    pub execution_mode: ExecutionMode,
    pub is_critical: bool,
}

/// Bookkeeping filled in by the first thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskInfo {
    pub architecture: Option<TaskArchitecture>,
    pub compatibility: Option<TaskCompatibility>,
    pub spawn_time: u64,
}

pub struct Process {
    id: Pid,
    name: RwLock<String>,
    parent: RwLock<Weak<Process>>,
    children: RwLock<Vec<Arc<Process>>>,
    threads: RwLock<Vec<Arc<Thread>>>,

    address_space: Arc<dyn AddressSpaceHandle>,
    owns_address_space: bool,
    vma: Arc<VirtualMemoryArea>,
    program_break: ProgramBreak,

    security: RwLock<TaskSecurity>,
    signals: RwLock<SignalTable>,
    file_descriptors: RwLock<FileDescriptorTable>,
    tls_template: RwLock<Option<TlsTemplate>>,

    cwd: RwLock<String>,
    executable: RwLock<Option<String>>,
    procfs: Arc<dyn ProcFs>,

    state: AtomicTaskState,
    exit_code: AtomicI32,
    info: RwLock<TaskInfo>,
    allocated_memory: AtomicUsize,
}

impl Process {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: Pid,
        name: String,
        parent: Weak<Process>,
        address_space: Arc<dyn AddressSpaceHandle>,
        owns_address_space: bool,
        vma: Arc<VirtualMemoryArea>,
        security: TaskSecurity,
        signals: SignalTable,
        procfs: Arc<dyn ProcFs>,
        spawn_time: u64,
    ) -> Arc<Self> {
        let allocated = size_of::<Self>() + name.len() + 1;
        let process = Arc::new(Self {
            id,
            name: RwLock::new(name),
            parent: RwLock::new(parent),
            children: RwLock::new(Vec::new()),
            threads: RwLock::new(Vec::new()),
            address_space,
            owns_address_space,
            vma,
            program_break: ProgramBreak::new(),
            security: RwLock::new(security),
            signals: RwLock::new(signals),
            file_descriptors: RwLock::new(FileDescriptorTable::new()),
            tls_template: RwLock::new(None),
            cwd: RwLock::new("/".to_string()),
            executable: RwLock::new(None),
            procfs,
            state: AtomicTaskState::new(TaskState::Waiting),
            exit_code: AtomicI32::new(KILL_CRASH),
            info: RwLock::new(TaskInfo {
                spawn_time,
                ..TaskInfo::default()
            }),
            allocated_memory: AtomicUsize::new(allocated),
        });
        process.procfs.create_process_dir(id);
        process
    }

    #[must_use]
    pub fn id(&self) -> Pid {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    /// # Panics
    /// Panics on an empty name; process names are never empty.
    pub fn rename(&self, name: &str) {
        assert!(!name.is_empty());
        trace!("renaming process {:?} to {name:?}", self.name());
        let mut guard = self.name.write();
        self.allocated_memory
            .fetch_sub(guard.len() + 1, Relaxed);
        self.allocated_memory.fetch_add(name.len() + 1, Relaxed);
        *guard = name.to_string();
    }

    #[must_use]
    pub fn parent(&self) -> Option<Arc<Process>> {
        self.parent.read().upgrade()
    }

    pub(crate) fn clear_parent(&self) {
        *self.parent.write() = Weak::new();
    }

    #[must_use]
    pub fn children(&self) -> Vec<Arc<Process>> {
        self.children.read().clone()
    }

    pub(crate) fn add_child(&self, child: Arc<Process>) {
        self.children.write().push(child);
    }

    pub(crate) fn remove_child(&self, child: &Arc<Process>) {
        self.children
            .write()
            .retain(|c| !Arc::ptr_eq(c, child));
    }

    pub(crate) fn take_children(&self) -> Vec<Arc<Process>> {
        core::mem::take(&mut *self.children.write())
    }

    #[must_use]
    pub fn threads(&self) -> Vec<Arc<Thread>> {
        self.threads.read().clone()
    }

    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.threads.read().len()
    }

    #[must_use]
    pub fn thread(&self, id: Tid) -> Option<Arc<Thread>> {
        self.threads.read().iter().find(|t| t.id() == id).cloned()
    }

    pub(crate) fn add_thread(&self, thread: Arc<Thread>) {
        self.threads.write().push(thread);
    }

    pub(crate) fn remove_thread(&self, thread: &Arc<Thread>) {
        self.threads
            .write()
            .retain(|t| !Arc::ptr_eq(t, thread));
    }

    pub(crate) fn take_threads(&self) -> Vec<Arc<Thread>> {
        core::mem::take(&mut *self.threads.write())
    }

    #[must_use]
    pub fn address_space(&self) -> &Arc<dyn AddressSpaceHandle> {
        &self.address_space
    }

    #[must_use]
    pub fn owns_address_space(&self) -> bool {
        self.owns_address_space
    }

    #[must_use]
    pub fn vma(&self) -> &Arc<VirtualMemoryArea> {
        &self.vma
    }

    #[must_use]
    pub fn program_break(&self) -> &ProgramBreak {
        &self.program_break
    }

    #[must_use]
    pub fn security(&self) -> &RwLock<TaskSecurity> {
        &self.security
    }

    #[must_use]
    pub fn signals(&self) -> &RwLock<SignalTable> {
        &self.signals
    }

    #[must_use]
    pub fn file_descriptors(&self) -> &RwLock<FileDescriptorTable> {
        &self.file_descriptors
    }

    #[must_use]
    pub fn tls_template(&self) -> Option<TlsTemplate> {
        *self.tls_template.read()
    }

    pub fn set_tls_template(&self, template: TlsTemplate) {
        *self.tls_template.write() = Some(template);
    }

    #[must_use]
    pub fn info(&self) -> TaskInfo {
        *self.info.read()
    }

    pub(crate) fn set_abi(&self, arch: TaskArchitecture, compat: TaskCompatibility) {
        let mut info = self.info.write();
        info.architecture = Some(arch);
        info.compatibility = Some(compat);
    }

    #[must_use]
    pub fn state(&self) -> TaskState {
        self.state.load()
    }

    /// Sets the process state; a single-threaded process mirrors the state
    /// onto its thread.
    pub fn set_state(&self, state: TaskState) {
        self.state.store(state);
        let threads = self.threads.read();
        if threads.len() == 1 {
            threads[0].set_state_raw(state);
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
        let threads = self.threads.read();
        if threads.len() == 1 {
            threads[0].set_exit_code_raw(code);
        }
    }

    pub(crate) fn set_exit_code_raw(&self, code: i32) {
        self.exit_code.store(code, Relaxed);
    }

    /// Delivers `signal` to the process by marking it pending on every
    /// thread.
    pub fn send_signal(&self, signal: Signal) -> Result<(), Errno> {
        // Validate against the disposition table first so an invalid number
        // fails before any thread is touched.
        self.signals.read().disposition(signal)?;
        for thread in self.threads.read().iter() {
            thread.pending_signals().raise(signal)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn working_directory(&self) -> String {
        self.cwd.read().clone()
    }

    pub fn set_working_directory(&self, path: &str) {
        trace!("setting working directory of process {} to {path}", self.id);
        *self.cwd.write() = path.to_string();
        self.procfs.set_cwd_link(self.id, path);
    }

    #[must_use]
    pub fn executable(&self) -> Option<String> {
        self.executable.read().clone()
    }

    pub fn set_executable(&self, path: &str) {
        trace!("setting exe of process {} to {path}", self.id);
        *self.executable.write() = Some(path.to_string());
        self.procfs.set_exe_link(self.id, path);
    }

    pub(crate) fn charge_memory(&self, bytes: usize) {
        self.allocated_memory.fetch_add(bytes, Relaxed);
    }

    /// Cumulative allocation across the process itself, its VMA, its threads
    /// and its children.
    #[must_use]
    pub fn size(&self) -> usize {
        let mut total = self.allocated_memory.load(Relaxed);
        total += self.vma.allocated_size();
        for thread in self.threads.read().iter() {
            total += thread.size();
        }
        for child in self.children.read().iter() {
            total += child.size();
        }
        total
    }

    pub(crate) fn procfs(&self) -> &Arc<dyn ProcFs> {
        &self.procfs
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if !self.threads.get_mut().is_empty() || !self.children.get_mut().is_empty() {
            warn!(
                "process {} dropped with live threads or children",
                self.id
            );
        }
    }
}

impl core::fmt::Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("name", &*self.name.read())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use kernel_abi::SIGTERM;

    use super::*;
    use crate::testing::rig;
    use crate::thread::ThreadSpec;

    #[test]
    fn rename_and_links_go_through_procfs() {
        let rig = rig();
        let kernel = rig.manager.kernel_process().clone();
        let process = rig
            .manager
            .create_process(Some(&kernel), "init", ExecutionMode::User, false, 0, 0)
            .unwrap();

        process.rename("renamed");
        assert_eq!(process.name(), "renamed");

        process.set_working_directory("/home");
        process.set_executable("/bin/init");
        assert_eq!(process.working_directory(), "/home");
        assert_eq!(process.executable().as_deref(), Some("/bin/init"));
        assert!(
            rig.procfs
                .cwd_links
                .lock()
                .contains(&(process.id(), "/home".into()))
        );
        assert!(
            rig.procfs
                .exe_links
                .lock()
                .contains(&(process.id(), "/bin/init".into()))
        );
    }

    #[test]
    fn process_state_mirrors_onto_a_sole_thread() {
        let rig = rig();
        let kernel = rig.manager.kernel_process().clone();
        let thread = kernel.threads()[0].clone();

        kernel.set_state(TaskState::Stopped);
        assert_eq!(thread.state(), TaskState::Stopped);
        kernel.set_exit_code(3);
        assert_eq!(thread.exit_code(), 3);
    }

    #[test]
    fn size_accumulates_vma_threads_and_children() {
        let rig = rig();
        let kernel = rig.manager.kernel_process().clone();
        let base = kernel.size();

        let child = rig
            .manager
            .create_process(Some(&kernel), "child", ExecutionMode::User, false, 0, 0)
            .unwrap();
        rig.manager
            .create_thread(&child, &ThreadSpec::kernel(0x1000))
            .unwrap();

        assert!(child.size() > 0);
        assert!(kernel.size() >= base + child.size());
    }

    #[test]
    fn signals_validate_before_delivery() {
        let rig = rig();
        let kernel = rig.manager.kernel_process().clone();
        assert!(kernel.send_signal(0).is_err());
        assert!(kernel.send_signal(SIGTERM).is_ok());
        assert!(kernel.threads()[0].pending_signals().is_pending(SIGTERM));
    }

    #[test]
    fn file_descriptor_table_is_owned_by_the_process() {
        let rig = rig();
        let kernel = rig.manager.kernel_process().clone();
        let fd = kernel.file_descriptors().write().open("/dev/console", 0);
        assert_eq!(fd, 0);
        assert_eq!(kernel.file_descriptors().read().len(), 1);
    }
}
