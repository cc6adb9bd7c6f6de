//! The exec() family.
//!
//! Every variant converges on one `exec` message carrying file-or-fd, argv,
//! the fixed-up environment, the $PATH (or `_CS_PATH` fallback) for the *p*
//! variants, and the CPU time consumed since the previous exec. The message
//! is ack'd before the real call so the supervisor's bookkeeping is in
//! place before the child's own handshake can race it. If the exec returns,
//! a matching `exec_failed` follows, also ack'd, so a terminating child is
//! never mistaken for a successfully exec'd static binary.

use std::ffi::CStr;

use libc::{c_char, c_int};
use quickbuild_shared::fbb::{CStrArray, StrArraySource};
use quickbuild_shared::wire;

use crate::intercept::{self, send_msg_shmq_and_ack};
use crate::orig::fns::*;
use crate::envfix;
use crate::wrappers::{
    errno, grab_global_lock, insert_begin_marker, insert_end_marker, intercepting,
    release_global_lock, set_errno,
};

#[derive(Clone, Copy)]
enum Target {
    Path(*const c_char),
    Fd(c_int),
}

enum Variant {
    Execve,
    Execvpe,
    Fexecve,
}

unsafe fn exec_common(
    name: &'static str,
    target: Target,
    argv: *const *const c_char,
    envp: *const *const c_char,
    with_p: bool,
    variant: Variant,
) -> c_int {
    let i_am_intercepting = intercepting();
    let mut saved_errno = errno();
    insert_begin_marker(name);

    let mut i_locked = false;
    if i_am_intercepting {
        grab_global_lock(&mut i_locked, name);
    }

    let spec = intercept::fixup_spec();
    let fixed_env = if i_am_intercepting && envfix::env_needs_fixup(envp, &spec) {
        Some(envfix::env_fixup(envp, &spec))
    } else {
        None
    };
    let env_used: *const *const c_char =
        fixed_env.as_ref().map(|f| f.as_ptr()).unwrap_or(envp);

    if i_am_intercepting {
        // Keep the $PATH fallback buffer alive until the message is sent.
        let mut confstr_buf = [0u8; 4096];

        let mut msg = wire::exec::Builder::new();
        match target {
            Target::Path(p) if !p.is_null() => {
                msg.set_file(CStr::from_ptr(p).to_bytes());
            }
            Target::Path(_) => {}
            Target::Fd(fd) => msg.set_fd(fd),
        }
        msg.set_arg(StrArraySource::CArray(CStrArray::new(argv)));
        msg.set_env(StrArraySource::CArray(CStrArray::new(env_used)));

        if with_p {
            msg.set_with_p(true);
            let path_env = libc::getenv(b"PATH\0".as_ptr() as *const c_char);
            if !path_env.is_null() {
                msg.set_path(CStr::from_ptr(path_env).to_bytes());
            } else {
                // Fall back the way execvp does, per confstr(3).
                let n = libc::confstr(
                    libc::_CS_PATH,
                    confstr_buf.as_mut_ptr() as *mut c_char,
                    confstr_buf.len(),
                );
                if n > 0 && n as usize <= confstr_buf.len() {
                    msg.set_path(&confstr_buf[..n as usize - 1]);
                }
            }
        }

        let (utime_u, stime_u) = intercept::rusage_since_exec();
        intercept::reset_rusage();
        msg.set_utime_u(utime_u);
        msg.set_stime_u(stime_u);

        send_msg_shmq_and_ack(&msg);
    }

    set_errno(saved_errno);
    let ret = match variant {
        Variant::Execve => match target {
            Target::Path(p) => orig_execve(p, argv, env_used),
            Target::Fd(_) => unreachable!(),
        },
        Variant::Execvpe => match target {
            Target::Path(p) => orig_execvpe(p, argv, env_used),
            Target::Fd(_) => unreachable!(),
        },
        Variant::Fexecve => match target {
            Target::Fd(fd) => orig_fexecve(fd, argv, env_used),
            Target::Path(_) => unreachable!(),
        },
    };
    saved_errno = errno();

    if i_am_intercepting {
        // The exec came back, so it failed; say so before anything else can
        // be attributed to this process image.
        let mut msg = wire::exec_failed::Builder::new();
        msg.set_error_no(saved_errno);
        send_msg_shmq_and_ack(&msg);
    }

    insert_end_marker(name);
    if i_locked {
        release_global_lock();
    }
    set_errno(saved_errno);
    ret
}

#[no_mangle]
pub unsafe extern "C" fn execv(path: *const c_char, argv: *const *const c_char) -> c_int {
    let envp = envfix::environ_ptr();
    exec_common("execv", Target::Path(path), argv, envp, false, Variant::Execve)
}

#[no_mangle]
pub unsafe extern "C" fn execve(
    path: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> c_int {
    exec_common("execve", Target::Path(path), argv, envp, false, Variant::Execve)
}

#[no_mangle]
pub unsafe extern "C" fn execvp(file: *const c_char, argv: *const *const c_char) -> c_int {
    let envp = envfix::environ_ptr();
    exec_common("execvp", Target::Path(file), argv, envp, true, Variant::Execvpe)
}

#[no_mangle]
pub unsafe extern "C" fn execvpe(
    file: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> c_int {
    exec_common(
        "execvpe",
        Target::Path(file),
        argv,
        envp,
        true,
        Variant::Execvpe,
    )
}

#[no_mangle]
pub unsafe extern "C" fn fexecve(
    fd: c_int,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> c_int {
    exec_common("fexecve", Target::Fd(fd), argv, envp, false, Variant::Fexecve)
}
