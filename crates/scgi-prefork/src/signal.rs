//! Restart flag raised by SIGHUP.
//!
//! The handler only stores into an atomic. The accept loop checks the flag
//! once per cycle, so a restart never preempts a dispatch in progress.
//!
//! The handler is installed without `SA_RESTART`, which makes a blocked
//! `accept(2)` return `EINTR` and lets the flag be seen right away instead
//! of at the next connection.

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use scgi_core::error::{Result, ScgiError};

use std::sync::atomic::{AtomicBool, Ordering};

static RESTART_PENDING: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sighup(_sig: libc::c_int) {
    RESTART_PENDING.store(true, Ordering::SeqCst);
}

/// Raise the process-wide restart flag, as SIGHUP would.
pub fn request_restart() {
    RESTART_PENDING.store(true, Ordering::SeqCst);
}

/// Handle on a restart flag.
#[derive(Debug, Clone, Copy)]
pub struct RestartSignal {
    flag: &'static AtomicBool,
}

impl RestartSignal {
    /// Install the SIGHUP handler and return a handle on the flag it sets.
    pub fn install() -> Result<Self> {
        let action = SigAction::new(
            SigHandler::Handler(on_sighup),
            SaFlags::empty(),
            SigSet::empty(),
        );
        // Safety: the handler only touches an atomic.
        unsafe { sigaction(Signal::SIGHUP, &action) }
            .map_err(|e| ScgiError::from_errno(e as i32))?;
        Ok(Self::global())
    }

    /// Handle on the process-wide flag, without touching signal dispositions.
    pub fn global() -> Self {
        Self { flag: &RESTART_PENDING }
    }

    /// A private flag no signal can reach; restarts come only from `request`.
    pub fn detached() -> Self {
        Self { flag: Box::leak(Box::new(AtomicBool::new(false))) }
    }

    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_pending(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Clear the flag, returning whether it was set.
    pub fn take(&self) -> bool {
        self.flag.swap(false, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serial;
    use nix::sys::signal::raise;

    #[test]
    fn test_detached_flag() {
        let restart = RestartSignal::detached();
        assert!(!restart.is_pending());
        restart.request();
        assert!(restart.is_pending());
        assert!(restart.take());
        assert!(!restart.take());
    }

    #[test]
    fn test_detached_ignores_global_requests() {
        let _guard = serial();
        let restart = RestartSignal::detached();
        request_restart();
        assert!(!restart.is_pending());
        assert!(RestartSignal::global().take());
    }

    #[test]
    fn test_sighup_sets_flag() {
        let _guard = serial();
        let restart = RestartSignal::install().unwrap();
        restart.take();

        raise(Signal::SIGHUP).unwrap();
        assert!(restart.take());
        assert!(!restart.is_pending());
    }
}
