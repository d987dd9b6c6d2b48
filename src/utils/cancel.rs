use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

use crate::errors::Fault;

// The process-wide cancellation flag. Signal handlers are inherently global,
// so the token is a cheap handle over this static; everything else in the
// pipeline receives the token explicitly.
static CANCEL_SIGNO: AtomicI32 = AtomicI32::new(0);

extern "C" fn on_signal(signo: libc::c_int) {
    CANCEL_SIGNO.store(signo, Ordering::SeqCst);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CancelToken;

impl CancelToken {
    pub fn new() -> Self {
        Self
    }

    /// Install SIGINT/SIGTERM handlers that flip the flag. Call once, from
    /// `main`, before the pipeline starts.
    pub fn install_handlers(&self) -> Result<()> {
        let sa = SigAction::new(
            SigHandler::Handler(on_signal),
            SaFlags::empty(),
            SigSet::empty(),
        );
        unsafe {
            sigaction(Signal::SIGINT, &sa)?;
            sigaction(Signal::SIGTERM, &sa)?;
        }
        Ok(())
    }

    #[inline]
    pub fn signo(&self) -> Option<i32> {
        match CANCEL_SIGNO.load(Ordering::SeqCst) {
            0 => None,
            n => Some(n),
        }
    }

    #[inline]
    pub fn is_canceled(&self) -> bool {
        self.signo().is_some()
    }

    /// Error out with `Fault::Canceled` if a signal arrived.
    pub fn check(&self) -> Result<()> {
        match self.signo() {
            None => Ok(()),
            Some(signo) => Err(Fault::Canceled { signo }.into()),
        }
    }

    /// Cancellable sleep: returns early with `Fault::Canceled` when the
    /// flag flips mid-wait.
    pub fn sleep(&self, dur: Duration) -> Result<()> {
        const TICK: Duration = Duration::from_millis(50);
        let deadline = Instant::now() + dur;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep(TICK.min(deadline - now));
        }
    }

    #[cfg(test)]
    pub fn trigger(signo: i32) {
        CANCEL_SIGNO.store(signo, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn clear() {
        CANCEL_SIGNO.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The flag is process-global, so everything lives in one test to avoid
    // cross-test interference under the parallel test runner.
    #[test]
    fn cancel_flag_roundtrip() {
        CancelToken::clear();
        let tok = CancelToken::new();
        assert!(tok.check().is_ok());

        CancelToken::trigger(15);
        let err = tok.check().unwrap_err();
        assert_eq!(crate::errors::exit_code_for(&err), 143);
        CancelToken::clear();

        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(80));
            CancelToken::trigger(2);
        });

        let start = Instant::now();
        let res = tok.sleep(Duration::from_secs(30));
        t.join().unwrap();

        assert!(res.is_err());
        assert!(start.elapsed() < Duration::from_secs(5));
        CancelToken::clear();
    }
}
