//! Ctrl-C handling.
//!
//! Rather than running arbitrary code in a signal handler, `SIGINT` is blocked
//! and a dedicated thread waits for it with `sigwait`, then stops whichever
//! session is registered. Children start with an empty signal mask, as
//! `std::process::Command` resets it before exec, so they still receive the
//! terminal's interrupt themselves.

use diagnostics_ipc::StopHandle;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

#[derive(Default)]
struct Shared {
    interrupted: AtomicBool,
    session: parking_lot::Mutex<Option<StopHandle>>,
}

/// The shared interrupt state, cheap to clone
#[derive(Clone, Default)]
pub struct Interrupt {
    inner: Arc<Shared>,
}

impl Interrupt {
    /// Blocks `SIGINT` for the calling thread, and every thread it spawns
    /// afterwards, and starts the thread that waits for it.
    ///
    /// This must be called before any other threads are spawned, otherwise
    /// the signal can be delivered to one of them instead.
    pub fn install() -> std::io::Result<Self> {
        let set = block_sigint()?;
        let interrupt = Self::default();

        let waiter = interrupt.clone();
        std::thread::Builder::new()
            .name("sigint".to_owned())
            .spawn(move || waiter.wait_loop(set))?;

        Ok(interrupt)
    }

    /// Set once the first interrupt arrives
    #[inline]
    pub fn flag(&self) -> &AtomicBool {
        &self.inner.interrupted
    }

    #[inline]
    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::Acquire)
    }

    /// Sets the session that an interrupt stops. If an interrupt already
    /// arrived the session is stopped immediately.
    pub fn register(&self, handle: StopHandle) {
        let mut session = self.inner.session.lock();
        if self.is_interrupted() {
            handle.stop();
        }
        *session = Some(handle);
    }

    /// Acts as if `SIGINT` was received, returns false if an interrupt had
    /// already been received
    pub fn trigger(&self) -> bool {
        if self.inner.interrupted.swap(true, Ordering::AcqRel) {
            return false;
        }

        let session = self.inner.session.lock().clone();
        if let Some(handle) = session {
            handle.stop();
        }

        true
    }

    fn wait_loop(self, set: libc::sigset_t) {
        loop {
            match wait_for(&set) {
                Ok(_) => {
                    if self.trigger() {
                        log::info!("interrupted, stopping the trace session");
                    } else {
                        log::debug!("ignoring repeated interrupt");
                    }
                }
                Err(err) => {
                    log::error!("failed to wait for SIGINT: {err}");
                    return;
                }
            }
        }
    }
}

#[allow(unsafe_code)]
fn block_sigint() -> std::io::Result<libc::sigset_t> {
    // SAFETY: the set is initialized by sigemptyset before use
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGINT);

        match libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) {
            0 => Ok(set),
            err => Err(std::io::Error::from_raw_os_error(err)),
        }
    }
}

#[allow(unsafe_code)]
fn wait_for(set: &libc::sigset_t) -> std::io::Result<i32> {
    let mut signal = 0;
    // SAFETY: both pointers are valid for the duration of the call
    match unsafe { libc::sigwait(set, &mut signal) } {
        0 => Ok(signal),
        err => Err(std::io::Error::from_raw_os_error(err)),
    }
}

#[cfg(test)]
mod test {
    use super::Interrupt;

    #[test]
    fn only_first_counts() {
        let interrupt = Interrupt::default();
        assert!(!interrupt.is_interrupted());
        assert!(interrupt.trigger());
        assert!(interrupt.is_interrupted());
        assert!(!interrupt.trigger());
    }
}
