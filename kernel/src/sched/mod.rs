//! Round-robin scheduler.
//!
//! One instance serves the whole machine. Its tick handler is registered as
//! a critical event on the scheduler IRQ and receives a [`SchedulerFrame`];
//! switching tasks means swapping the saved register frame and publishing
//! the next process's page-table root in `frame.ppt`.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::arch::asm;
use core::sync::atomic::{AtomicBool, AtomicUsize};
use core::sync::atomic::Ordering::Relaxed;

use conquer_once::spin::OnceCell;
use kernel_events::InterruptHandler;
use kernel_tasking::frame::{SchedulerFrame, TrapFrame};
use kernel_tasking::process::{Pid, Process};
use kernel_tasking::sched::Scheduler;
use kernel_tasking::state::{ExecutionMode, TaskState};
use kernel_tasking::thread::{Thread, ThreadSpec};
use kernel_tasking::TaskManager;
use log::{debug, info};
use spin::{Once, RwLock};
use x86_64::registers::model_specific::FsBase;
use x86_64::VirtAddr;

use crate::arch::cpu;
use crate::interrupts::{self, SCHEDULER_IRQ, SCHEDULER_VECTOR};
use crate::mcore::context::ExecutionContext;

static SCHEDULER: OnceCell<Arc<RoundRobin>> = OnceCell::uninit();

pub fn init() {
    SCHEDULER.init_once(|| Arc::new(RoundRobin::new()));
}

/// # Panics
/// Panics before `init` ran.
pub fn scheduler() -> &'static Arc<RoundRobin> {
    SCHEDULER.get().expect("scheduler not initialized")
}

pub struct RoundRobin {
    processes: RwLock<Vec<Arc<Process>>>,
    cursor: AtomicUsize,
    started: AtomicBool,
    stopped: AtomicBool,
    idle_pending: AtomicBool,
    manager: Once<Arc<TaskManager>>,
}

impl RoundRobin {
    fn new() -> Self {
        Self {
            processes: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            idle_pending: AtomicBool::new(false),
            manager: Once::new(),
        }
    }

    /// Wires up the task manager after it has been constructed (the manager
    /// itself is built around this scheduler).
    pub fn attach_manager(self: &Arc<Self>, manager: Arc<TaskManager>) {
        self.manager.call_once(|| manager);
        if self.idle_pending.swap(false, Relaxed) {
            self.spawn_idle();
        }
    }

    fn spawn_idle(&self) {
        let manager = self.manager.get().expect("manager attached");
        let kernel = manager.kernel_process().clone();
        let idle = manager
            .create_thread(&kernel, &ThreadSpec::kernel(idle_main as usize as u64))
            .expect("should be able to create the idle thread");
        idle.rename("Idle");
        debug!("idle thread created");
    }

    /// One scheduler tick. Saves the preempted context, wakes expired
    /// sleepers, picks the next ready thread and installs it in the frame.
    fn tick(&self, frame: &mut SchedulerFrame) {
        if self.stopped.load(Relaxed) {
            return;
        }

        let ctx = ExecutionContext::load();

        self.wake_sleepers();

        let next = self.pick_next();

        if let Some(current) = ctx.current_thread() {
            *current.registers().lock() = frame.trap;
            cpu::fpu_save(&mut current.fx_area().lock());
            if next.is_some() && current.state() == TaskState::Running {
                current.set_state(TaskState::Ready);
            }
        }

        let Some((process, thread)) = next else {
            // Nothing else to run; resume the interrupted context.
            return;
        };

        frame.trap = *thread.registers().lock();
        frame.ppt = process.address_space().root();

        if thread.fs_base() != 0 {
            FsBase::write(VirtAddr::new(thread.fs_base()));
        }
        cpu::fpu_restore(&thread.fx_area().lock());

        // On a privilege change the CPU needs a kernel stack to land on.
        let rsp0 = if process.security().read().execution_mode == ExecutionMode::User {
            thread
                .syscall_stack()
                .lock()
                .as_ref()
                .map(|region| region.virt + region.len() as u64 - 0x10)
        } else {
            thread.stack().lock().as_ref().map(|stack| stack.top())
        };
        if let Some(rsp0) = rsp0 {
            ctx.set_tss_rsp0(rsp0);
        }

        thread.set_state(TaskState::Running);
        ctx.set_current(process, thread);
    }

    fn wake_sleepers(&self) {
        let now = cpu::counter();
        for process in self.processes.read().iter() {
            for thread in process.threads() {
                if thread.state() == TaskState::Sleeping && thread.sleep_until() <= now {
                    thread.set_state(TaskState::Ready);
                }
            }
        }
    }

    fn pick_next(&self) -> Option<(Arc<Process>, Arc<Thread>)> {
        let processes = self.processes.read();
        if processes.is_empty() {
            return None;
        }

        let start = self.cursor.fetch_add(1, Relaxed);
        for offset in 0..processes.len() {
            let process = &processes[(start + offset) % processes.len()];
            if process.state().is_terminal() {
                continue;
            }
            for thread in process.threads() {
                if thread.state() == TaskState::Ready {
                    return Some((process.clone(), thread));
                }
            }
        }
        None
    }
}

impl Scheduler for RoundRobin {
    fn push_process(&self, process: Arc<Process>) {
        // The tick handler walks this list; holding the write lock with
        // interrupts on would deadlock against a tick on this CPU.
        x86_64::instructions::interrupts::without_interrupts(|| {
            self.processes.write().push(process);
        });
    }

    fn pop_process(&self, process: &Arc<Process>) {
        x86_64::instructions::interrupts::without_interrupts(|| {
            self.processes
                .write()
                .retain(|p| !Arc::ptr_eq(p, process));
        });
    }

    fn current_process(&self) -> Option<Arc<Process>> {
        ExecutionContext::try_load().and_then(ExecutionContext::current_process)
    }

    fn current_thread(&self) -> Option<Arc<Thread>> {
        ExecutionContext::try_load().and_then(ExecutionContext::current_thread)
    }

    fn process_by_id(&self, id: Pid) -> Option<Arc<Process>> {
        self.processes
            .read()
            .iter()
            .find(|p| p.id() == id)
            .cloned()
    }

    fn processes(&self) -> Vec<Arc<Process>> {
        self.processes.read().clone()
    }

    fn yield_now(&self) {
        if !self.started.load(Relaxed) || self.stopped.load(Relaxed) {
            return;
        }
        // A software interrupt on the scheduler vector reschedules
        // synchronously.
        // SAFETY: the vector is backed by the scheduler stub.
        unsafe {
            asm!("int {vector}", vector = const SCHEDULER_VECTOR);
        }
    }

    fn start(&self) {
        let tick = Arc::new(SchedulerTick {
            scheduler: scheduler().clone(),
        });
        interrupts::add_handler(SCHEDULER_IRQ, tick, true);
        self.started.store(true, Relaxed);
        info!("scheduler ticks running");
    }

    fn start_idle_process(&self) {
        if self.manager.get().is_some() {
            self.spawn_idle();
        } else {
            self.idle_pending.store(true, Relaxed);
        }
    }

    fn stop(&self) {
        self.stopped.store(true, Relaxed);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Relaxed)
    }
}

/// The registered tick handler.
struct SchedulerTick {
    scheduler: Arc<RoundRobin>,
}

impl InterruptHandler<TrapFrame> for SchedulerTick {
    fn on_interrupt_received(&self, frame: &mut TrapFrame) {
        // The scheduler IRQ is dispatched exclusively by the scheduler stub,
        // whose frame embeds this TrapFrame 16 bytes into a SchedulerFrame.
        // SAFETY: see above; the containing frame lives on the interrupt
        // stack of this CPU.
        let frame = unsafe {
            &mut *core::ptr::from_mut(frame)
                .byte_sub(core::mem::offset_of!(SchedulerFrame, trap))
                .cast::<SchedulerFrame>()
        };
        self.scheduler.tick(frame);
    }
}

/// The idle thread: wait for work, forever.
extern "C" fn idle_main() -> ! {
    loop {
        cpu::halt(false);
    }
}
