//! Per-process signal dispositions and per-thread pending sets.

use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};

use kernel_abi::{EINVAL, Errno, NSIG, Signal, SignalDisposition, default_disposition};

/// Per-process signal → action table, inherited across process creation.
#[derive(Debug, Clone)]
pub struct SignalTable {
    actions: [SignalDisposition; NSIG],
}

impl Default for SignalTable {
    fn default() -> Self {
        let mut actions = [SignalDisposition::Ign; NSIG];
        let mut signal = 1u8;
        while usize::from(signal) <= NSIG {
            actions[usize::from(signal) - 1] = default_disposition(signal);
            signal += 1;
        }
        Self { actions }
    }
}

impl SignalTable {
    pub fn disposition(&self, signal: Signal) -> Result<SignalDisposition, Errno> {
        if signal == 0 || usize::from(signal) > NSIG {
            return Err(EINVAL);
        }
        Ok(self.actions[usize::from(signal) - 1])
    }

    pub fn set_disposition(
        &mut self,
        signal: Signal,
        action: SignalDisposition,
    ) -> Result<(), Errno> {
        if signal == 0 || usize::from(signal) > NSIG {
            return Err(EINVAL);
        }
        self.actions[usize::from(signal) - 1] = action;
        Ok(())
    }
}

/// Pending-signal bitmask of one thread. Bit n-1 carries signal n.
#[derive(Debug, Default)]
pub struct SignalSet(AtomicU64);

impl SignalSet {
    pub fn raise(&self, signal: Signal) -> Result<(), Errno> {
        if signal == 0 || usize::from(signal) > NSIG {
            return Err(EINVAL);
        }
        self.0.fetch_or(1 << (signal - 1), AcqRel);
        Ok(())
    }

    /// Takes the lowest pending signal, if any.
    pub fn take(&self) -> Option<Signal> {
        let mut current = self.0.load(Acquire);
        loop {
            if current == 0 {
                return None;
            }
            let signal = current.trailing_zeros() as u8 + 1;
            match self.0.compare_exchange(
                current,
                current & !(1 << (signal - 1)),
                AcqRel,
                Acquire,
            ) {
                Ok(_) => return Some(signal),
                Err(seen) => current = seen,
            }
        }
    }

    #[must_use]
    pub fn is_pending(&self, signal: Signal) -> bool {
        signal != 0
            && usize::from(signal) <= NSIG
            && self.0.load(Relaxed) & (1 << (signal - 1)) != 0
    }
}

#[cfg(test)]
mod tests {
    use kernel_abi::{SIGCHLD, SIGKILL, SIGTERM};

    use super::*;

    #[test]
    fn table_starts_with_posix_defaults() {
        let table = SignalTable::default();
        assert_eq!(table.disposition(SIGKILL), Ok(SignalDisposition::Term));
        assert_eq!(table.disposition(SIGCHLD), Ok(SignalDisposition::Ign));
        assert_eq!(table.disposition(0), Err(EINVAL));
        assert_eq!(table.disposition(65), Err(EINVAL));
    }

    #[test]
    fn set_disposition_is_sticky_and_cloned() {
        let mut table = SignalTable::default();
        table
            .set_disposition(SIGTERM, SignalDisposition::Ign)
            .unwrap();
        let inherited = table.clone();
        assert_eq!(inherited.disposition(SIGTERM), Ok(SignalDisposition::Ign));
    }

    #[test]
    fn pending_set_raises_and_takes_in_order() {
        let set = SignalSet::default();
        set.raise(SIGTERM).unwrap();
        set.raise(SIGKILL).unwrap();
        assert!(set.is_pending(SIGTERM));
        assert_eq!(set.take(), Some(SIGKILL));
        assert_eq!(set.take(), Some(SIGTERM));
        assert_eq!(set.take(), None);
        assert_eq!(set.raise(0), Err(EINVAL));
    }
}
