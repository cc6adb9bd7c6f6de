//! dlopen() interception.
//!
//! The request and outcome are reported, together with the loaded image's
//! path as the link map records it. The path may still be relative; the
//! supervisor canonicalizes. A dlinfo() failure after a successful dlopen()
//! is absorbed silently, at the cost of a stale dlerror() string should the
//! application poll it.

use std::ffi::CStr;

use libc::{c_char, c_int, c_void};
use quickbuild_shared::wire;

use crate::intercept::send_msg_shmq;
use crate::orig::fns::*;
use crate::tls;
use crate::wrappers::{
    errno, grab_global_lock, insert_begin_marker, insert_end_marker, intercepting,
    release_global_lock, set_errno,
};

/// The leading fields of glibc's `struct link_map`; all we need is
/// `l_name`.
#[repr(C)]
#[allow(dead_code)]
struct LinkMap {
    l_addr: usize,
    l_name: *mut c_char,
    l_ld: *mut c_void,
    l_next: *mut c_void,
    l_prev: *mut c_void,
}

#[no_mangle]
pub unsafe extern "C" fn dlopen(filename: *const c_char, flags: c_int) -> *mut c_void {
    let i_am_intercepting = intercepting();
    insert_begin_marker("dlopen");

    let mut i_locked = false;
    if i_am_intercepting {
        grab_global_lock(&mut i_locked, "dlopen");
    }

    // Constructors of the loaded library may call intercepted functions on
    // this thread; the lock-ownership flag lets them re-enter.
    tls::IC_TLS.with(|t| t.libc_nesting_depth.set(t.libc_nesting_depth.get() + 1));
    let ret = orig_dlopen(filename, flags);
    let saved_errno = errno();
    tls::IC_TLS.with(|t| t.libc_nesting_depth.set(t.libc_nesting_depth.get() - 1));

    if i_am_intercepting {
        let success = !ret.is_null();
        let mut msg = wire::dlopen::Builder::new();
        if !filename.is_null() {
            msg.set_filename(CStr::from_ptr(filename).to_bytes());
        }
        if success {
            let mut map: *mut LinkMap = core::ptr::null_mut();
            if libc::dlinfo(
                ret,
                libc::RTLD_DI_LINKMAP,
                &mut map as *mut *mut LinkMap as *mut c_void,
            ) == 0
                && !map.is_null()
                && !(*map).l_name.is_null()
            {
                let name = CStr::from_ptr((*map).l_name).to_bytes();
                if !name.is_empty() {
                    msg.set_absolute_filename(name);
                }
            }
        }
        msg.set_error(!success);
        send_msg_shmq(&msg);
    }

    insert_end_marker("dlopen");
    if i_locked {
        release_global_lock();
    }
    set_errno(saved_errno);
    ret
}
