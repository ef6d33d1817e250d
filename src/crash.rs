//! Fatal-signal reporter (unix).
//!
//! On SIGSEGV the handler logs the signal and a captured backtrace at
//! `severe` through the pipeline, flushes the queue so the final events
//! reach the sinks, then chains to the previously installed handler or
//! exits. None of this is async-signal-safe in the strict sense; a crashing
//! process has little left to lose and the events immediately before the
//! crash are exactly the ones worth saving.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::level::Level;
use crate::logger::logger;
use crate::splitter::LineSplitter;

static INSTALLED: AtomicBool = AtomicBool::new(false);
static OLD_HANDLER: AtomicUsize = AtomicUsize::new(libc::SIG_DFL as usize);

/// Install the SIGSEGV hook, remembering the previous disposition.
pub(crate) fn install() {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }
    let action: extern "C" fn(libc::c_int) = handle_signal;
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = action as usize;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        let mut old: libc::sigaction = std::mem::zeroed();
        if libc::sigaction(libc::SIGSEGV, &sa, &mut old) == 0 {
            OLD_HANDLER.store(old.sa_sigaction, Ordering::SeqCst);
        } else {
            tracing::warn!("could not install the SIGSEGV handler");
        }
    }
}

extern "C" fn handle_signal(signal: libc::c_int) {
    let sys = logger().register_subsystem("logger");
    logger().log(Level::Severe, sys, format!("SIGNAL {signal} received."));

    let trace = format!("{:?}", backtrace::Backtrace::new());
    {
        let mut splitter =
            LineSplitter::new(|line: &str| logger().log(Level::Severe, sys, line));
        splitter.feed(&trace);
    }

    logger().flush(Duration::from_secs(5));

    let old = OLD_HANDLER.load(Ordering::SeqCst);
    if old == libc::SIG_DFL as usize || old == libc::SIG_IGN as usize {
        unsafe { libc::_exit(1) }
    }
    let previous: extern "C" fn(libc::c_int) = unsafe { std::mem::transmute(old) };
    previous(signal);
}
