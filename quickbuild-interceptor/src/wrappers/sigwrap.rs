//! signal() and sigaction() interception.
//!
//! The user's handler goes into the process-wide table and one of our
//! trampolines is installed in its place. Queries (and the old-handler out
//! parameters) are rewritten so the application sees its own handler, never
//! the trampoline address. Nothing is reported to the supervisor.

use libc::{c_int, sighandler_t};

use crate::orig::fns::*;
use crate::signals::{
    get_orig_handler, set_orig_handler, signal_is_wrappable, wrapper_signal_handler_1arg,
    wrapper_signal_handler_3arg,
};
use crate::wrappers::{
    errno, grab_global_lock, insert_begin_marker, insert_end_marker, intercepting,
    release_global_lock, set_errno,
};

#[no_mangle]
pub unsafe extern "C" fn signal(signum: c_int, handler: sighandler_t) -> sighandler_t {
    let i_am_intercepting = intercepting();
    insert_begin_marker("signal");

    let mut i_locked = false;
    if i_am_intercepting {
        grab_global_lock(&mut i_locked, "signal");
    }

    let ret;
    if i_am_intercepting && signal_is_wrappable(signum) {
        let old_orig = get_orig_handler(signum);
        let trampoline = wrapper_signal_handler_1arg as usize as sighandler_t;
        let new_handler = if handler == libc::SIG_IGN || handler == libc::SIG_DFL {
            handler
        } else {
            trampoline
        };
        set_orig_handler(signum, handler as usize);
        let r = orig_signal(signum, new_handler);
        if r == libc::SIG_ERR {
            set_orig_handler(signum, old_orig);
            ret = libc::SIG_ERR;
        } else if r == trampoline {
            // Report the handler the application installed, not ours.
            ret = old_orig as sighandler_t;
        } else {
            ret = r;
        }
    } else {
        ret = orig_signal(signum, handler);
    }
    let saved_errno = errno();

    insert_end_marker("signal");
    if i_locked {
        release_global_lock();
    }
    set_errno(saved_errno);
    ret
}

#[no_mangle]
pub unsafe extern "C" fn sigaction(
    signum: c_int,
    act: *const libc::sigaction,
    oldact: *mut libc::sigaction,
) -> c_int {
    let i_am_intercepting = intercepting();
    insert_begin_marker("sigaction");

    let mut i_locked = false;
    if i_am_intercepting {
        grab_global_lock(&mut i_locked, "sigaction");
    }

    let ret;
    if i_am_intercepting && signal_is_wrappable(signum) {
        let old_orig = get_orig_handler(signum);
        let tramp_1arg = wrapper_signal_handler_1arg as usize;
        let tramp_3arg = wrapper_signal_handler_3arg as usize;

        let mut wrapped: libc::sigaction = core::mem::zeroed();
        let act_ptr: *const libc::sigaction = if act.is_null() {
            act
        } else {
            wrapped = *act;
            let user_handler = (*act).sa_sigaction;
            set_orig_handler(signum, user_handler);
            if user_handler != libc::SIG_IGN && user_handler != libc::SIG_DFL {
                wrapped.sa_sigaction = if (*act).sa_flags & libc::SA_SIGINFO != 0 {
                    tramp_3arg
                } else {
                    tramp_1arg
                };
            }
            &wrapped
        };

        ret = orig_sigaction(signum, act_ptr, oldact);

        if ret == 0 {
            if !oldact.is_null()
                && ((*oldact).sa_sigaction == tramp_1arg
                    || (*oldact).sa_sigaction == tramp_3arg)
            {
                (*oldact).sa_sigaction = old_orig;
            }
        } else if !act.is_null() {
            // The kernel rejected the installation; undo our table update.
            set_orig_handler(signum, old_orig);
        }
    } else {
        ret = orig_sigaction(signum, act, oldact);
    }
    let saved_errno = errno();

    insert_end_marker("sigaction");
    if i_locked {
        release_global_lock();
    }
    set_errno(saved_errno);
    ret
}
