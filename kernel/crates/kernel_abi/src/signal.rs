//! POSIX-compatible signal numbering and per-signal default dispositions.
//!
//! Standard signals occupy 1..=31, real-time signals 32..=64.

pub type Signal = u8;

pub const SIGHUP: Signal = 1;
pub const SIGINT: Signal = 2;
pub const SIGQUIT: Signal = 3;
pub const SIGILL: Signal = 4;
pub const SIGTRAP: Signal = 5;
pub const SIGABRT: Signal = 6;
pub const SIGBUS: Signal = 7;
pub const SIGFPE: Signal = 8;
pub const SIGKILL: Signal = 9;
pub const SIGUSR1: Signal = 10;
pub const SIGSEGV: Signal = 11;
pub const SIGUSR2: Signal = 12;
pub const SIGPIPE: Signal = 13;
pub const SIGALRM: Signal = 14;
pub const SIGTERM: Signal = 15;
pub const SIGSTKFLT: Signal = 16;
pub const SIGCHLD: Signal = 17;
pub const SIGCONT: Signal = 18;
pub const SIGSTOP: Signal = 19;
pub const SIGTSTP: Signal = 20;
pub const SIGTTIN: Signal = 21;
pub const SIGTTOU: Signal = 22;
pub const SIGURG: Signal = 23;
pub const SIGXCPU: Signal = 24;
pub const SIGXFSZ: Signal = 25;
pub const SIGVTALRM: Signal = 26;
pub const SIGPROF: Signal = 27;
pub const SIGWINCH: Signal = 28;
pub const SIGPOLL: Signal = 29;
pub const SIGPWR: Signal = 30;
pub const SIGSYS: Signal = 31;

pub const SIGRTMIN: Signal = 32;
pub const SIGRTMAX: Signal = 64;

/// Number of valid signals (1..=64).
pub const NSIG: usize = 64;

/// What the kernel does with a delivered signal when the process has not
/// installed its own handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalDisposition {
    /// Terminate the process.
    Term,
    /// Ignore the signal.
    Ign,
    /// Continue a stopped process.
    Cont,
    /// Stop the process.
    Stop,
    /// Terminate and dump core.
    Core,
}

/// Default disposition for `signal`, following POSIX.1-2008 defaults.
/// Out-of-range signal numbers are ignored.
#[must_use]
pub fn default_disposition(signal: Signal) -> SignalDisposition {
    use SignalDisposition::{Cont, Core, Ign, Stop, Term};
    match signal {
        SIGHUP | SIGINT | SIGKILL | SIGUSR1 | SIGUSR2 | SIGPIPE | SIGALRM | SIGTERM
        | SIGSTKFLT | SIGVTALRM | SIGPROF | SIGPOLL | SIGPWR => Term,
        SIGQUIT | SIGILL | SIGTRAP | SIGABRT | SIGBUS | SIGFPE | SIGSEGV | SIGXCPU | SIGXFSZ
        | SIGSYS => Core,
        SIGCHLD | SIGURG | SIGWINCH => Ign,
        SIGCONT => Cont,
        SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => Stop,
        SIGRTMIN..=SIGRTMAX => Term,
        _ => Ign,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_defaults() {
        assert_eq!(default_disposition(SIGKILL), SignalDisposition::Term);
        assert_eq!(default_disposition(SIGSEGV), SignalDisposition::Core);
        assert_eq!(default_disposition(SIGCHLD), SignalDisposition::Ign);
        assert_eq!(default_disposition(SIGSTOP), SignalDisposition::Stop);
        assert_eq!(default_disposition(SIGCONT), SignalDisposition::Cont);
    }

    #[test]
    fn realtime_defaults_to_term() {
        for sig in SIGRTMIN..=SIGRTMAX {
            assert_eq!(default_disposition(sig), SignalDisposition::Term);
        }
    }
}
