//! Sentinel exit codes.

/// Exit code of a process that was terminated because of an unhandled fault.
///
/// Threads are created with this code so that a crash before the first
/// explicit exit is still reported correctly.
pub const KILL_CRASH: i32 = 0xDEAD;

/// Exit code of a process terminated by an explicit kill request.
pub const KILL_BY_SIGNAL: i32 = 0x5160;

/// Exit code of a process that exited normally through the scheduler.
pub const KILL_OK: i32 = 0;
