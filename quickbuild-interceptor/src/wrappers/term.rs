//! The exit path.
//!
//! `exit()` runs the registered atexit/on_exit handlers, among them ours,
//! which reports the status and resource usage; the wrapper only has to
//! drop the global lock first, because exit handlers may call intercepted
//! functions. The `_exit` family skips the handlers, so those wrappers
//! report directly before the original runs.

use libc::c_int;

use crate::intercept::{handle_exit, insert_end_marker};
use crate::lock::IC_GLOBAL_LOCK;
use crate::orig::fns::*;
use crate::tls;

unsafe fn release_lock_for_exit() {
    tls::danger_zone_enter();
    let held = tls::IC_TLS.with(|t| t.has_global_lock.get());
    if held {
        IC_GLOBAL_LOCK.unlock();
        tls::IC_TLS.with(|t| {
            t.has_global_lock.set(false);
            t.intercept_on.set(core::ptr::null());
        });
    }
    tls::danger_zone_leave();
}

#[no_mangle]
pub unsafe extern "C" fn exit(status: c_int) -> ! {
    release_lock_for_exit();
    insert_end_marker("exit");
    // Runs the atexit/on_exit chain, which includes our status reporter.
    orig_exit(status);
    libc::abort()
}

#[no_mangle]
pub unsafe extern "C" fn _exit(status: c_int) -> ! {
    release_lock_for_exit();
    handle_exit(status);
    insert_end_marker("_exit");
    orig__exit(status);
    libc::abort()
}

#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "C" fn _Exit(status: c_int) -> ! {
    release_lock_for_exit();
    handle_exit(status);
    insert_end_marker("_Exit");
    orig__Exit(status);
    libc::abort()
}

#[no_mangle]
pub unsafe extern "C" fn quick_exit(status: c_int) -> ! {
    release_lock_for_exit();
    handle_exit(status);
    insert_end_marker("quick_exit");
    orig_quick_exit(status);
    libc::abort()
}
