//! Process-creating wrappers: fork/vfork/clone, the posix_spawn family,
//! system(), popen() and pclose().
//!
//! The system/popen lock serializes all of these so the supervisor never
//! has two child-creating events from one process in flight at a time.

use core::cell::UnsafeCell;
use std::ffi::CStr;

use libc::{c_char, c_int, c_void, mode_t, pid_t, posix_spawn_file_actions_t,
    posix_spawnattr_t, FILE};
use quickbuild_shared::fbb::{CStrArray, StrArraySource};
use quickbuild_shared::wire;

use crate::intercept::{
    self, send_msg_shmq, send_msg_shmq_and_ack, send_msg_socket, system_popen_lock,
    system_popen_unlock,
};
use crate::orig::fns::*;
use crate::wrappers::pipes::{popen_type_to_flags, recv_popen_fd};
use crate::wrappers::{
    conn_fd, errno, grab_global_lock, insert_begin_marker, insert_end_marker, intercepting,
    release_global_lock, set_errno, should_send,
};
use crate::{envfix, fdstate, psfa, tls};

// ---------------------------------------------------------------------------
// fork / vfork / clone

unsafe fn fork_common(name: &'static str) -> pid_t {
    let i_am_intercepting = intercepting();
    let mut saved_errno = errno();
    insert_begin_marker(name);

    let mut i_locked = false;
    if i_am_intercepting {
        grab_global_lock(&mut i_locked, name);
    }

    // Make sure the child cannot receive a signal until it has built up its
    // own connection to the supervisor.
    let mut block_all: libc::sigset_t = core::mem::zeroed();
    let mut orig_mask: libc::sigset_t = core::mem::zeroed();
    libc::sigfillset(&mut block_all);
    libc::pthread_sigmask(libc::SIG_SETMASK, &block_all, &mut orig_mask);

    tls::IC_TLS.with(|t| t.libc_nesting_depth.set(t.libc_nesting_depth.get() + 1));
    set_errno(saved_errno);
    let ret = orig_fork();
    saved_errno = errno();
    tls::IC_TLS.with(|t| t.libc_nesting_depth.set(t.libc_nesting_depth.get() - 1));

    if ret == 0 {
        // Child: the at-fork child handler already re-established
        // everything, including the lock this flag refers to.
        i_locked = false;
    } else if ret > 0 && i_am_intercepting {
        let mut msg = wire::fork_parent::Builder::new();
        msg.set_pid(ret);
        send_msg_shmq(&msg);
    }

    libc::pthread_sigmask(libc::SIG_SETMASK, &orig_mask, core::ptr::null_mut());

    insert_end_marker(name);
    if i_locked {
        release_global_lock();
    }
    set_errno(saved_errno);
    ret
}

#[no_mangle]
pub unsafe extern "C" fn fork() -> pid_t {
    fork_common("fork")
}

/// vfork's shared-address-space semantics don't mix with the child-side
/// handshake; a full fork behaves identically for well-formed programs.
#[no_mangle]
pub unsafe extern "C" fn vfork() -> pid_t {
    fork_common("vfork")
}

struct CloneTrampolineArg {
    f: unsafe extern "C" fn(*mut c_void) -> c_int,
    arg: *mut c_void,
}

/// Runs as the clone child's start function: perform the child-side
/// handshake before the user's function sees control. The argument lives on
/// the parent's stack, which CLONE_VFORK keeps alive until we exec or exit.
unsafe extern "C" fn clone_trampoline(raw: *mut c_void) -> c_int {
    let t = &*(raw as *const CloneTrampolineArg);
    intercept::atfork_child_handler();
    (t.f)(t.arg)
}

#[no_mangle]
pub unsafe extern "C" fn clone(
    f: unsafe extern "C" fn(*mut c_void) -> c_int,
    stack: *mut c_void,
    flags: c_int,
    arg: *mut c_void,
    parent_tid: *mut pid_t,
    tls_area: *mut c_void,
    child_tid: *mut pid_t,
) -> c_int {
    let i_am_intercepting = intercepting();
    insert_begin_marker("clone");

    // Other flag combinations produce a child we cannot hand-shake safely;
    // those run uninstrumented and the supervisor treats the process tree
    // conservatively.
    let intercepted_clone =
        i_am_intercepting && flags == (libc::CLONE_VFORK | libc::SIGCHLD as c_int);

    let mut trampoline_arg = CloneTrampolineArg { f, arg };
    let passed_fn: unsafe extern "C" fn(*mut c_void) -> c_int = if intercepted_clone {
        clone_trampoline
    } else {
        f
    };
    let passed_arg: *mut c_void = if intercepted_clone {
        &mut trampoline_arg as *mut CloneTrampolineArg as *mut c_void
    } else {
        arg
    };

    // The real clone is variadic; pass every possible trailing argument,
    // the callee reads only the ones its flags select.
    static ORIG_CLONE: core::sync::atomic::AtomicUsize = core::sync::atomic::AtomicUsize::new(0);
    let p = crate::orig::resolve(&ORIG_CLONE, b"clone\0");
    let orig: unsafe extern "C" fn(
        unsafe extern "C" fn(*mut c_void) -> c_int,
        *mut c_void,
        c_int,
        *mut c_void,
        ...
    ) -> c_int = core::mem::transmute(p);

    let ret = orig(passed_fn, stack, flags, passed_arg, parent_tid, tls_area, child_tid);
    let saved_errno = errno();

    if intercepted_clone && ret > 0 {
        let mut i_locked = false;
        grab_global_lock(&mut i_locked, "clone");
        let mut msg = wire::fork_parent::Builder::new();
        msg.set_pid(ret);
        send_msg_shmq(&msg);
        if i_locked {
            release_global_lock();
        }
    }

    insert_end_marker("clone");
    set_errno(saved_errno);
    ret
}

// ---------------------------------------------------------------------------
// posix_spawn family

type SpawnFn = unsafe fn(
    *mut pid_t,
    *const c_char,
    *const posix_spawn_file_actions_t,
    *const posix_spawnattr_t,
    *const *const c_char,
    *const *const c_char,
) -> c_int;

unsafe fn posix_spawn_common(
    name: &'static str,
    is_spawnp: bool,
    pid: *mut pid_t,
    file: *const c_char,
    file_actions: *const posix_spawn_file_actions_t,
    attrp: *const posix_spawnattr_t,
    argv: *const *const c_char,
    envp: *const *const c_char,
    call: SpawnFn,
) -> c_int {
    let i_am_intercepting = intercepting();
    let saved_errno = errno();
    insert_begin_marker(name);

    // Fix up the environment the child will see.
    let spec = intercept::fixup_spec();
    let fixed_env = if i_am_intercepting && envfix::env_needs_fixup(envp, &spec) {
        Some(envfix::env_fixup(envp, &spec))
    } else {
        None
    };
    let env_used: *const *const c_char =
        fixed_env.as_ref().map(|f| f.as_ptr()).unwrap_or(envp);

    let mut i_locked = false;
    if i_am_intercepting {
        system_popen_lock();
        grab_global_lock(&mut i_locked, name);

        let actions = if file_actions.is_null() {
            None
        } else {
            psfa::psfa_actions(file_actions)
        };
        let action_refs: Vec<&[u8]> = actions
            .as_ref()
            .map(|a| a.iter().map(|v| &v[..]).collect())
            .unwrap_or_default();

        let mut msg = wire::posix_spawn::Builder::new();
        if !file.is_null() {
            msg.set_file(CStr::from_ptr(file).to_bytes());
        }
        msg.set_arg(StrArraySource::CArray(CStrArray::new(argv)));
        msg.set_env(StrArraySource::CArray(CStrArray::new(env_used)));
        msg.set_file_actions(StrArraySource::Slices(&action_refs));
        msg.set_is_spawnp(is_spawnp);
        send_msg_shmq_and_ack(&msg);
    }

    // posix_spawn reports errors in the return value, not errno.
    let mut tmp_pid: pid_t = 0;
    let pid_ptr = if pid.is_null() { &mut tmp_pid } else { pid };
    set_errno(saved_errno);
    let ret = call(pid_ptr, file, file_actions, attrp, argv, env_used);
    let saved_errno = errno();
    let success = ret == 0;

    if i_am_intercepting {
        if success {
            let mut msg = wire::posix_spawn_parent::Builder::new();
            msg.set_pid(*pid_ptr);
            msg.set_arg(StrArraySource::CArray(CStrArray::new(argv)));
            send_msg_shmq_and_ack(&msg);
        } else {
            // The supervisor has an outstanding expecting-a-child state, so
            // this counterpart is mandatory even for EINTR-class failures.
            let mut msg = wire::posix_spawn_failed::Builder::new();
            msg.set_arg(StrArraySource::CArray(CStrArray::new(argv)));
            msg.set_error_no(ret);
            send_msg_shmq_and_ack(&msg);
        }
        system_popen_unlock();
    }

    insert_end_marker(name);
    if i_locked {
        release_global_lock();
    }
    set_errno(saved_errno);
    ret
}

#[no_mangle]
pub unsafe extern "C" fn posix_spawn(
    pid: *mut pid_t,
    path: *const c_char,
    file_actions: *const posix_spawn_file_actions_t,
    attrp: *const posix_spawnattr_t,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> c_int {
    posix_spawn_common(
        "posix_spawn",
        false,
        pid,
        path,
        file_actions,
        attrp,
        argv,
        envp,
        |a, b, c, d, e, f| unsafe { orig_posix_spawn(a, b, c, d, e, f) },
    )
}

#[no_mangle]
pub unsafe extern "C" fn posix_spawnp(
    pid: *mut pid_t,
    file: *const c_char,
    file_actions: *const posix_spawn_file_actions_t,
    attrp: *const posix_spawnattr_t,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> c_int {
    posix_spawn_common(
        "posix_spawnp",
        true,
        pid,
        file,
        file_actions,
        attrp,
        argv,
        envp,
        |a, b, c, d, e, f| unsafe { orig_posix_spawnp(a, b, c, d, e, f) },
    )
}

macro_rules! psfa_wrapper {
    ( $name:ident, $record:expr, ( $( $arg:ident : $ty:ty ),* ) ) => {
        ::paste::paste! {
            #[no_mangle]
            pub unsafe extern "C" fn $name(
                file_actions: *mut posix_spawn_file_actions_t,
                $( $arg : $ty ),*
            ) -> c_int {
                let i_am_intercepting = intercepting();
                let ret = [<orig_ $name>](file_actions, $( $arg ),* );
                if i_am_intercepting && ret == 0 {
                    let mut i_locked = false;
                    grab_global_lock(&mut i_locked, stringify!($name));
                    let record: unsafe fn(*const posix_spawn_file_actions_t, $( $ty ),* ) =
                        $record;
                    record(file_actions, $( $arg ),* );
                    if i_locked {
                        release_global_lock();
                    }
                }
                ret
            }
        }
    };
}

psfa_wrapper!(posix_spawn_file_actions_init, |p| unsafe { psfa::psfa_init(p) }, ());
psfa_wrapper!(posix_spawn_file_actions_destroy, |p| unsafe { psfa::psfa_destroy(p) }, ());
psfa_wrapper!(
    posix_spawn_file_actions_addopen,
    |p, fd, path, flags, mode| unsafe { psfa::psfa_addopen(p, fd, path, flags, mode) },
    (fd: c_int, path: *const c_char, flags: c_int, mode: mode_t)
);
psfa_wrapper!(
    posix_spawn_file_actions_addclose,
    |p, fd| unsafe { psfa::psfa_addclose(p, fd) },
    (fd: c_int)
);
psfa_wrapper!(
    posix_spawn_file_actions_adddup2,
    |p, oldfd, newfd| unsafe { psfa::psfa_adddup2(p, oldfd, newfd) },
    (oldfd: c_int, newfd: c_int)
);

// ---------------------------------------------------------------------------
// system / popen / pclose

/// The set of FILE* streams a successful popen() returned, so pclose() can
/// tell them apart from fclose() targets. Guarded by the global lock.
struct StreamSet(UnsafeCell<Vec<usize>>);
unsafe impl Sync for StreamSet {}
static POPENED_STREAMS: StreamSet = StreamSet(UnsafeCell::new(Vec::new()));

unsafe fn popened_insert(stream: *mut FILE) {
    (*POPENED_STREAMS.0.get()).push(stream as usize);
}

unsafe fn popened_remove(stream: *mut FILE) -> bool {
    let set = &mut *POPENED_STREAMS.0.get();
    if let Some(idx) = set.iter().position(|s| *s == stream as usize) {
        set.swap_remove(idx);
        true
    } else {
        false
    }
}

/// Swap the global environment for a fixed-up copy around a call that
/// spawns through the shell.
struct EnvironSwap {
    fixed: Option<envfix::FixedEnv>,
    saved: *mut *mut c_char,
}

impl EnvironSwap {
    unsafe fn fix() -> EnvironSwap {
        let spec = intercept::fixup_spec();
        let env = envfix::environ_ptr();
        if envfix::env_needs_fixup(env, &spec) {
            let fixed = envfix::env_fixup(env, &spec);
            let saved = envfix::swap_environ(fixed.as_ptr());
            EnvironSwap {
                fixed: Some(fixed),
                saved,
            }
        } else {
            EnvironSwap {
                fixed: None,
                saved: core::ptr::null_mut(),
            }
        }
    }

    unsafe fn restore(self) {
        if self.fixed.is_some() {
            envfix::restore_environ(self.saved);
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn system(cmd: *const c_char) -> c_int {
    let i_am_intercepting = intercepting();
    if cmd.is_null() || !i_am_intercepting {
        // The NULL form only asks whether a shell is available.
        return orig_system(cmd);
    }
    insert_begin_marker("system");

    system_popen_lock();
    {
        let mut i_locked = false;
        grab_global_lock(&mut i_locked, "system");
        let mut msg = wire::system::Builder::new();
        msg.set_cmd(CStr::from_ptr(cmd).to_bytes());
        send_msg_shmq_and_ack(&msg);
        if i_locked {
            release_global_lock();
        }
    }

    let swap = EnvironSwap::fix();
    let ret = orig_system(cmd);
    let saved_errno = errno();
    swap.restore();

    {
        let mut i_locked = false;
        grab_global_lock(&mut i_locked, "system");
        let mut msg = wire::system_ret::Builder::new();
        msg.set_cmd(CStr::from_ptr(cmd).to_bytes());
        msg.set_ret(ret);
        if ret == -1 {
            msg.set_error_no(saved_errno);
        }
        send_msg_shmq_and_ack(&msg);
        if i_locked {
            release_global_lock();
        }
    }
    system_popen_unlock();

    insert_end_marker("system");
    set_errno(saved_errno);
    ret
}

#[no_mangle]
pub unsafe extern "C" fn popen(cmd: *const c_char, mode: *const c_char) -> *mut FILE {
    let i_am_intercepting = intercepting();
    if !i_am_intercepting || cmd.is_null() {
        return orig_popen(cmd, mode);
    }
    insert_begin_marker("popen");

    let type_flags = popen_type_to_flags(mode);

    system_popen_lock();
    {
        let mut i_locked = false;
        grab_global_lock(&mut i_locked, "popen");
        let mut msg = wire::popen::Builder::new();
        msg.set_cmd(CStr::from_ptr(cmd).to_bytes());
        msg.set_type_flags(type_flags);
        send_msg_shmq_and_ack(&msg);
        if i_locked {
            release_global_lock();
        }
    }

    let swap = EnvironSwap::fix();
    let ret = orig_popen(cmd, mode);
    let saved_errno = errno();
    swap.restore();
    let success = !ret.is_null();

    {
        let mut i_locked = false;
        grab_global_lock(&mut i_locked, "popen");
        if success {
            popened_insert(ret);

            // The stream's backing fd is looped through the supervisor:
            // receive the replacement endpoint and install it in place.
            tls::danger_zone_enter();
            let ret_fileno = libc::fileno(ret);
            let mut msg = wire::popen_parent::Builder::new();
            msg.set_fd(ret_fileno);
            send_msg_socket(&msg);

            let ancillary_fd = recv_popen_fd();
            tls::danger_zone_leave();

            // ret_fileno is still open, so the transferred fd landed on a
            // different number.
            if orig_dup3(ancillary_fd, ret_fileno, type_flags & libc::O_CLOEXEC) != ret_fileno {
                intercept::fb_abort("dup3 on the popened fd failed");
            }
            orig_close(ancillary_fd);
            fdstate::clear_notify(ret_fileno);
            fdstate::mark_pipe(ret_fileno);
        } else {
            let mut msg = wire::popen_failed::Builder::new();
            msg.set_error_no(saved_errno);
            send_msg_shmq_and_ack(&msg);
        }
        if i_locked {
            release_global_lock();
        }
    }
    system_popen_unlock();

    insert_end_marker("popen");
    set_errno(saved_errno);
    ret
}

#[no_mangle]
pub unsafe extern "C" fn pclose(stream: *mut FILE) -> c_int {
    let i_am_intercepting = intercepting();
    if !i_am_intercepting || stream.is_null() {
        return orig_pclose(stream);
    }
    insert_begin_marker("pclose");

    // fileno() after the pclose() would read freed memory.
    let fd = libc::fileno(stream);

    system_popen_lock();
    {
        let mut i_locked = false;
        grab_global_lock(&mut i_locked, "pclose");
        if popened_remove(stream) {
            // Report the closure before the real pclose(): the supervisor
            // must see the pipe go away before we block in wait4 on the
            // child it is still feeding.
            intercept::send_barrier_if_queue_nonempty();
            let mut msg = wire::close::Builder::new();
            msg.set_fd(fd);
            send_msg_socket(&msg);
            fdstate::reset_fd(fd);
        }
        if i_locked {
            release_global_lock();
        }
    }

    let ret = orig_pclose(stream);
    let saved_errno = errno();
    system_popen_unlock();

    insert_end_marker("pclose");
    set_errno(saved_errno);
    ret
}

// ---------------------------------------------------------------------------
// chdir / fchdir

#[no_mangle]
pub unsafe extern "C" fn chdir(path: *const c_char) -> c_int {
    let i_am_intercepting = intercepting();
    let ret = orig_chdir(path);
    let saved_errno = errno();
    if i_am_intercepting && should_send(ret == 0, saved_errno) && !path.is_null() {
        let mut call = Vec::with_capacity(64);
        call.extend_from_slice(b"chdir ");
        call.extend_from_slice(CStr::from_ptr(path).to_bytes());
        let mut i_locked = false;
        grab_global_lock(&mut i_locked, "chdir");
        let mut msg = wire::gen_call::Builder::new();
        msg.set_call(&call[..]);
        if ret != 0 {
            msg.set_error_no(saved_errno);
        }
        send_msg_shmq(&msg);
        if i_locked {
            release_global_lock();
        }
    }
    set_errno(saved_errno);
    ret
}

#[no_mangle]
pub unsafe extern "C" fn fchdir(fd: c_int) -> c_int {
    if fd == conn_fd() {
        set_errno(libc::EBADF);
        return -1;
    }
    let i_am_intercepting = intercepting();
    let ret = orig_fchdir(fd);
    let saved_errno = errno();
    if i_am_intercepting && should_send(ret == 0, saved_errno) {
        let mut i_locked = false;
        grab_global_lock(&mut i_locked, "fchdir");
        let mut msg = wire::gen_call::Builder::new();
        msg.set_call("fchdir");
        if ret != 0 {
            msg.set_error_no(saved_errno);
        }
        send_msg_shmq(&msg);
        if i_locked {
            release_global_lock();
        }
    }
    set_errno(saved_errno);
    ret
}
