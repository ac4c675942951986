// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 nio-udp contributors

//! Native thread identity and the signal used to kick a thread out of a
//! blocking `recvfrom`/`sendto`.
//!
//! The interrupt signal gets a no-op handler installed without `SA_RESTART`,
//! so a blocked syscall on the signalled thread returns `EINTR`. The channel's
//! retry loop then re-checks whether it is still open.

use std::io;
use std::sync::Once;

static INSTALL: Once = Once::new();

/// Signal used to interrupt blocked I/O threads.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn interrupt_signal() -> libc::c_int {
    libc::SIGRTMAX() - 2
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn interrupt_signal() -> libc::c_int {
    libc::SIGIO
}

extern "C" fn on_interrupt(_sig: libc::c_int) {}

fn install_handler() {
    INSTALL.call_once(|| {
        // SAFETY:
        // - sigaction is a plain C struct; all-zero is a valid starting value
        // - the handler is an `extern "C"` function that does nothing, so it is
        //   async-signal-safe
        // - sa_flags deliberately omits SA_RESTART so blocking calls see EINTR
        let ret = unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_interrupt as extern "C" fn(libc::c_int) as libc::sighandler_t;
            action.sa_flags = 0;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(interrupt_signal(), &action, std::ptr::null_mut())
        };
        if ret != 0 {
            log::warn!(
                "[SYS] failed to install interrupt signal handler: {}",
                io::Error::last_os_error()
            );
        } else {
            log::debug!("[SYS] interrupt handler installed for signal {}", interrupt_signal());
        }
    });
}

/// Opaque identity of an OS thread that may be blocked in a socket call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NativeThread(libc::pthread_t);

impl NativeThread {
    /// Identity of the calling thread.
    pub(crate) fn current() -> Self {
        install_handler();
        // SAFETY: pthread_self has no preconditions and cannot fail.
        NativeThread(unsafe { libc::pthread_self() })
    }

    /// Deliver the interrupt signal to this thread.
    ///
    /// Harmless when the thread is not blocked: the handler does nothing.
    pub(crate) fn signal(self) {
        // SAFETY:
        // - the identity was taken from pthread_self() on a thread that is still
        //   running: channel slots are cleared (under the state lock) before the
        //   owning operation returns, and signals are only sent under that lock
        // - the handler was installed in current() before any identity escaped
        let ret = unsafe { libc::pthread_kill(self.0, interrupt_signal()) };
        if ret != 0 {
            log::debug!(
                "[SYS] pthread_kill failed: {}",
                io::Error::from_raw_os_error(ret)
            );
        }
    }
}
