//! Signal handler wrapping.
//!
//! User handlers installed through `signal()` or `sigaction()` are replaced
//! by one of two trampolines; the real handler pointer lives in a
//! process-wide table indexed by signal number. The trampolines consult the
//! thread's danger-zone depth: inside a zone the signal is only recorded in
//! the per-thread bitmap and re-raised when the zone is left, so interceptor
//! critical sections never observe a user handler mid-flight.
//!
//! The table is written under the global lock at installation time and read
//! without it from the trampolines (a relaxed atomic load of one word).

use core::sync::atomic::{AtomicUsize, Ordering};
use libc::{c_int, c_void, siginfo_t};

use crate::intercept::insert_debug_msg;
use crate::tls::IC_TLS;

/// Highest signal number we can wrap; the delayed-signal bitmap is a u64.
pub const MAX_SIGNUM: usize = 64;

/// Original handler pointers, 1-based by signal number. Values are whatever
/// the application passed: a function pointer, `SIG_DFL` (0) or `SIG_IGN`
/// (1).
static ORIG_HANDLERS: [AtomicUsize; MAX_SIGNUM + 1] =
    [const { AtomicUsize::new(0) }; MAX_SIGNUM + 1];

/// Whether to install our wrapper for the given signal. Invalid numbers are
/// passed through so the original function can produce its usual error.
pub fn signal_is_wrappable(signum: c_int) -> bool {
    signum >= 1 && signum <= libc::SIGRTMAX().min(MAX_SIGNUM as c_int)
}

pub fn get_orig_handler(signum: c_int) -> usize {
    ORIG_HANDLERS[signum as usize].load(Ordering::Relaxed)
}

/// Store the user's handler. Caller holds the global lock.
pub fn set_orig_handler(signum: c_int, handler: usize) {
    ORIG_HANDLERS[signum as usize].store(handler, Ordering::Relaxed);
}

fn delay(signum: c_int) {
    insert_debug_msg("signal arrived in danger zone, delaying");
    IC_TLS.with(|t| {
        t.delayed_signals_bitmap
            .set(t.delayed_signals_bitmap.get() | 1u64 << (signum - 1))
    });
}

/// Installed instead of handlers registered without `SA_SIGINFO`.
pub extern "C" fn wrapper_signal_handler_1arg(signum: c_int) {
    let in_zone = IC_TLS.with(|t| t.signal_danger_zone_depth.get() > 0);
    if in_zone {
        delay(signum);
        return;
    }

    IC_TLS.with(|t| {
        t.signal_handler_running_depth
            .set(t.signal_handler_running_depth.get() + 1)
    });

    let handler = get_orig_handler(signum);
    if handler > 1 {
        let f: extern "C" fn(c_int) = unsafe { core::mem::transmute(handler) };
        f(signum);
    }

    IC_TLS.with(|t| {
        t.signal_handler_running_depth
            .set(t.signal_handler_running_depth.get() - 1)
    });
}

/// Installed instead of handlers registered with `SA_SIGINFO`.
pub extern "C" fn wrapper_signal_handler_3arg(
    signum: c_int,
    info: *mut siginfo_t,
    ucontext: *mut c_void,
) {
    let in_zone = IC_TLS.with(|t| t.signal_danger_zone_depth.get() > 0);
    if in_zone {
        // The siginfo of a delayed signal is lost; the re-raise generates a
        // fresh one.
        delay(signum);
        return;
    }

    IC_TLS.with(|t| {
        t.signal_handler_running_depth
            .set(t.signal_handler_running_depth.get() + 1)
    });

    let handler = get_orig_handler(signum);
    if handler > 1 {
        let f: extern "C" fn(c_int, *mut siginfo_t, *mut c_void) =
            unsafe { core::mem::transmute(handler) };
        f(signum, info, ucontext);
    }

    IC_TLS.with(|t| {
        t.signal_handler_running_depth
            .set(t.signal_handler_running_depth.get() - 1)
    });
}

/// Re-raise, in ascending signal-number order, every signal delayed on this
/// thread. Runs when the outermost danger zone is left.
pub fn raise_delayed_signals() {
    for signum in 1..=MAX_SIGNUM as c_int {
        let pending = IC_TLS.with(|t| {
            let bit = 1u64 << (signum - 1);
            let map = t.delayed_signals_bitmap.get();
            if map & bit != 0 {
                t.delayed_signals_bitmap.set(map & !bit);
                true
            } else {
                false
            }
        });
        if pending {
            insert_debug_msg("raising delayed signal");
            unsafe { libc::raise(signum) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls;
    use std::sync::atomic::AtomicU32;

    static USR1_HITS: AtomicU32 = AtomicU32::new(0);
    static USR2_HITS: AtomicU32 = AtomicU32::new(0);

    extern "C" fn count_usr1(_signum: c_int) {
        USR1_HITS.fetch_add(1, Ordering::SeqCst);
    }

    extern "C" fn count_usr2(_signum: c_int) {
        USR2_HITS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn wrappable_range_excludes_invalid_numbers() {
        assert!(!signal_is_wrappable(0));
        assert!(!signal_is_wrappable(-3));
        assert!(signal_is_wrappable(libc::SIGUSR1));
        assert!(!signal_is_wrappable(libc::SIGRTMAX() + 1));
    }

    #[test]
    fn handler_runs_outside_danger_zone() {
        set_orig_handler(libc::SIGUSR1, count_usr1 as usize);
        wrapper_signal_handler_1arg(libc::SIGUSR1);
        assert_eq!(USR1_HITS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_is_deferred_inside_danger_zone() {
        set_orig_handler(libc::SIGUSR2, count_usr2 as usize);

        tls::danger_zone_enter();
        wrapper_signal_handler_1arg(libc::SIGUSR2);
        assert_eq!(USR2_HITS.load(Ordering::SeqCst), 0, "deferred, not run");
        let bit = 1u64 << (libc::SIGUSR2 - 1);
        IC_TLS.with(|t| assert!(t.delayed_signals_bitmap.get() & bit != 0));

        // Leaving the zone re-raises SIGUSR2. The harness's disposition for
        // it is default (terminate), so route the delivery through our
        // trampoline first.
        unsafe {
            let mut act: libc::sigaction = core::mem::zeroed();
            act.sa_sigaction = wrapper_signal_handler_1arg as usize;
            libc::sigemptyset(&mut act.sa_mask);
            libc::sigaction(libc::SIGUSR2, &act, core::ptr::null_mut());
        }
        tls::danger_zone_leave();
        assert_eq!(USR2_HITS.load(Ordering::SeqCst), 1);
        IC_TLS.with(|t| assert_eq!(t.delayed_signals_bitmap.get() & bit, 0));
    }

    #[test]
    fn sig_dfl_and_sig_ign_are_not_called_through() {
        set_orig_handler(libc::SIGWINCH, 0);
        wrapper_signal_handler_1arg(libc::SIGWINCH);
        set_orig_handler(libc::SIGWINCH, 1);
        wrapper_signal_handler_1arg(libc::SIGWINCH);
    }
}
