//! Termination signal watcher.
//!
//! SIGINT, SIGTERM and SIGHUP are blocked in the calling thread (and in every
//! thread it spawns afterwards) and collected by a dedicated thread with
//! `sigwait(2)`. The callback therefore runs in ordinary thread context and
//! may lock, log and spawn commands, none of which is allowed inside an
//! asynchronous signal handler. Child processes start with an empty signal
//! mask, so the wrapped tools still see the signals normally.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::cleanup::TrapSignal;

static WATCHER_SET: AtomicBool = AtomicBool::new(false);

/// Spawns the watcher thread; `on_signal` gets the first termination signal.
///
/// Returns `Ok(false)` if a watcher is already running in this process.
pub fn watch(on_signal: impl FnOnce(TrapSignal) + Send + 'static) -> io::Result<bool> {
    if WATCHER_SET.swap(true, Ordering::SeqCst) {
        return Ok(false);
    }

    let mask = termination_mask();
    // SAFETY: `mask` is initialised; the old mask is not requested. Threads
    // spawned from here on inherit the blocked set.
    let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut()) };
    if rc != 0 {
        WATCHER_SET.store(false, Ordering::SeqCst);
        return Err(io::Error::from_raw_os_error(rc));
    }

    std::thread::Builder::new()
        .name("signal".into())
        .spawn(move || {
            let signal = wait_for_signal(&mask);
            on_signal(signal);
        })?;
    Ok(true)
}

fn termination_mask() -> libc::sigset_t {
    // SAFETY: an all-zero sigset_t is valid storage and sigemptyset
    // initialises it before any sigaddset.
    unsafe {
        let mut mask: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut mask);
        for signo in TrapSignal::ALL.iter().filter_map(|s| s.signo()) {
            libc::sigaddset(&mut mask, signo);
        }
        mask
    }
}

fn wait_for_signal(mask: &libc::sigset_t) -> TrapSignal {
    loop {
        let mut signo: libc::c_int = 0;
        // SAFETY: both pointers refer to live, initialised locals.
        let rc = unsafe { libc::sigwait(mask, &mut signo) };
        if rc == 0 {
            if let Some(signal) = TrapSignal::from_signo(signo) {
                return signal;
            }
        }
    }
}
