//! Scheduler-visible task state machine.

use core::sync::atomic::AtomicU8;
use core::sync::atomic::Ordering::{Acquire, Release};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Unknown = 0,
    Ready,
    Running,
    Sleeping,
    Blocked,
    Stopped,
    Waiting,
    CoreDump,
    Zombie,
    Terminated,
    Frozen,
}

impl TaskState {
    /// States a task never leaves.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Zombie | Self::CoreDump)
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Ready,
            2 => Self::Running,
            3 => Self::Sleeping,
            4 => Self::Blocked,
            5 => Self::Stopped,
            6 => Self::Waiting,
            7 => Self::CoreDump,
            8 => Self::Zombie,
            9 => Self::Terminated,
            10 => Self::Frozen,
            _ => Self::Unknown,
        }
    }
}

/// Lock-free cell for a [`TaskState`], readable from interrupt context.
#[derive(Debug)]
pub struct AtomicTaskState(AtomicU8);

impl AtomicTaskState {
    #[must_use]
    pub const fn new(state: TaskState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> TaskState {
        TaskState::from_raw(self.0.load(Acquire))
    }

    pub fn store(&self, state: TaskState) {
        self.0.store(state as u8, Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Kernel,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskArchitecture {
    X86_32,
    X86_64,
    Aarch64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCompatibility {
    Native,
    Linux,
    Windows,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_roundtrip() {
        let cell = AtomicTaskState::new(TaskState::Waiting);
        assert_eq!(cell.load(), TaskState::Waiting);
        cell.store(TaskState::Zombie);
        assert_eq!(cell.load(), TaskState::Zombie);
        assert!(cell.load().is_terminal());
        assert!(!TaskState::Running.is_terminal());
    }
}
