//! File descriptor wrappers: the open family, close variants, dup variants,
//! reads/writes/seeks on inherited fds, fcntl/ioctl, readlink.

use std::ffi::CStr;

use libc::{c_char, c_int, c_long, c_uint, c_ulong, c_void, mode_t, off_t, size_t, ssize_t, FILE};
use quickbuild_shared::wire;

use crate::fdstate;
use crate::intercept::{
    self, is_path_at_system_locations, send_msg_shmq, send_msg_shmq_and_ack,
    send_msg_socket_and_ack,
};
use crate::orig::fns::*;
use crate::wrappers::{
    conn_fd, errno, grab_global_lock, insert_begin_marker, insert_end_marker, intercepting,
    release_global_lock, set_errno, should_send,
};

// ---------------------------------------------------------------------------
// open family

/// Send the advisory pre-open hint for reads outside the system locations,
/// so the supervisor can consult its cache before the kernel call settles.
unsafe fn maybe_send_pre_open(dirfd: c_int, pathname: *const c_char, flags: c_int) -> bool {
    if pathname.is_null() {
        return false;
    }
    if flags & libc::O_ACCMODE != libc::O_RDONLY || flags & libc::O_CREAT != 0 {
        return false;
    }
    let path = CStr::from_ptr(pathname).to_bytes();
    if is_path_at_system_locations(path) {
        return false;
    }
    let mut msg = wire::pre_open::Builder::new();
    if dirfd != libc::AT_FDCWD {
        msg.set_dirfd(dirfd);
    }
    msg.set_pathname(path);
    send_msg_shmq(&msg);
    true
}

unsafe fn open_common<F>(
    name: &'static str,
    dirfd: c_int,
    pathname: *const c_char,
    flags: c_int,
    mode: mode_t,
    call: F,
) -> c_int
where
    F: FnOnce() -> c_int,
{
    let i_am_intercepting = intercepting();
    let mut saved_errno = errno();
    insert_begin_marker(name);

    let mut i_locked = false;
    if i_am_intercepting {
        grab_global_lock(&mut i_locked, name);
    }

    let pre_open_sent = i_am_intercepting && maybe_send_pre_open(dirfd, pathname, flags);

    set_errno(saved_errno);
    let ret = call();
    saved_errno = errno();
    let success = ret >= 0;

    if i_am_intercepting {
        if success {
            // Our own fd, not an inherited one: no first-use reports.
            fdstate::clear_notify(ret);
        }
        if should_send(success, saved_errno) && !pathname.is_null() {
            let path = CStr::from_ptr(pathname).to_bytes();
            let mut msg = wire::open::Builder::new();
            if dirfd != libc::AT_FDCWD {
                msg.set_dirfd(dirfd);
            }
            msg.set_pathname(path);
            msg.set_flags(flags);
            if flags & libc::O_CREAT != 0 || flags & libc::O_TMPFILE == libc::O_TMPFILE {
                msg.set_mode(mode as u32);
            }
            if success {
                msg.set_ret(ret);
            } else {
                msg.set_error_no(saved_errno);
            }
            msg.set_pre_open_sent(pre_open_sent);
            // Opens under the declared system locations don't block on an
            // ack.
            if success && !is_path_at_system_locations(path) {
                send_msg_shmq_and_ack(&msg);
            } else {
                send_msg_shmq(&msg);
            }
        }
    }

    insert_end_marker(name);
    if i_locked {
        release_global_lock();
    }
    set_errno(saved_errno);
    ret
}

#[no_mangle]
pub unsafe extern "C" fn open(pathname: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    open_common("open", libc::AT_FDCWD, pathname, flags, mode, || unsafe {
        orig_open(pathname, flags, mode)
    })
}

#[no_mangle]
pub unsafe extern "C" fn open64(pathname: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    open_common("open64", libc::AT_FDCWD, pathname, flags, mode, || unsafe {
        orig_open(pathname, flags | libc::O_LARGEFILE, mode)
    })
}

#[no_mangle]
pub unsafe extern "C" fn openat(
    dirfd: c_int,
    pathname: *const c_char,
    flags: c_int,
    mode: mode_t,
) -> c_int {
    open_common("openat", dirfd, pathname, flags, mode, || unsafe {
        orig_openat(dirfd, pathname, flags, mode)
    })
}

#[no_mangle]
pub unsafe extern "C" fn openat64(
    dirfd: c_int,
    pathname: *const c_char,
    flags: c_int,
    mode: mode_t,
) -> c_int {
    open_common("openat64", dirfd, pathname, flags | libc::O_LARGEFILE, mode, || unsafe {
        orig_openat(dirfd, pathname, flags | libc::O_LARGEFILE, mode)
    })
}

#[no_mangle]
pub unsafe extern "C" fn creat(pathname: *const c_char, mode: mode_t) -> c_int {
    let flags = libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC;
    open_common("creat", libc::AT_FDCWD, pathname, flags, mode, || unsafe {
        orig_creat(pathname, mode)
    })
}

#[no_mangle]
pub unsafe extern "C" fn creat64(pathname: *const c_char, mode: mode_t) -> c_int {
    let flags = libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC | libc::O_LARGEFILE;
    open_common("creat64", libc::AT_FDCWD, pathname, flags, mode, || unsafe {
        orig_creat(pathname, mode)
    })
}

// ---------------------------------------------------------------------------
// close family

#[no_mangle]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    if fd == conn_fd() {
        set_errno(libc::EBADF);
        return -1;
    }
    let i_am_intercepting = intercepting();
    let mut saved_errno = errno();
    insert_begin_marker("close");

    let mut i_locked = false;
    if i_am_intercepting {
        grab_global_lock(&mut i_locked, "close");
    }

    let was_pipe = i_am_intercepting && fdstate::is_pipe(fd);

    set_errno(saved_errno);
    let ret = orig_close(fd);
    saved_errno = errno();
    let success = ret == 0;

    if i_am_intercepting {
        fdstate::reset_fd(fd);
        if should_send(success, saved_errno) {
            let mut msg = wire::close::Builder::new();
            msg.set_fd(fd);
            if !success {
                msg.set_error_no(saved_errno);
            }
            if was_pipe {
                // Closing a pipe endpoint changes the supervisor's watched
                // fd set, so it must arrive on the socket, after everything
                // already queued.
                intercept::send_barrier_if_queue_nonempty();
                send_msg_socket_and_ack(&msg);
            } else {
                send_msg_shmq(&msg);
            }
        }
    }

    insert_end_marker("close");
    if i_locked {
        release_global_lock();
    }
    set_errno(saved_errno);
    ret
}

#[no_mangle]
pub unsafe extern "C" fn close_range(first: c_uint, last: c_uint, flags: c_int) -> c_int {
    // Not in libc's public headers everywhere; value per linux uapi.
    const CLOSE_RANGE_CLOEXEC: c_int = 1 << 2;

    let i_am_intercepting = intercepting();
    let mut saved_errno = errno();
    insert_begin_marker("close_range");

    let mut i_locked = false;
    if i_am_intercepting {
        grab_global_lock(&mut i_locked, "close_range");
    }

    if i_am_intercepting && flags & CLOSE_RANGE_CLOEXEC == 0 {
        fdstate::reset_range(first, last);
    }

    // The connection fd must survive; leave a hole in the range around it.
    let sv = conn_fd() as c_uint;
    set_errno(saved_errno);
    let ret = if first > sv || last < sv {
        orig_close_range(first, last, flags)
    } else if first == sv && last == sv {
        0
    } else if first == sv {
        orig_close_range(first + 1, last, flags)
    } else if last == sv {
        orig_close_range(first, last - 1, flags)
    } else {
        let ret1 = orig_close_range(first, sv - 1, flags);
        let ret2 = orig_close_range(sv + 1, last, flags);
        if ret1 == 0 && ret2 == 0 {
            0
        } else {
            -1
        }
    };
    saved_errno = errno();
    let success = ret == 0;

    if i_am_intercepting && should_send(success, saved_errno) {
        let mut msg = wire::close_range::Builder::new();
        msg.set_first(first);
        msg.set_last(last);
        msg.set_flags(flags);
        if !success {
            msg.set_error_no(saved_errno);
        }
        send_msg_shmq(&msg);
    }

    insert_end_marker("close_range");
    if i_locked {
        release_global_lock();
    }
    set_errno(saved_errno);
    ret
}

#[no_mangle]
pub unsafe extern "C" fn closefrom(lowfd: c_int) {
    let i_am_intercepting = intercepting();
    let saved_errno = errno();
    insert_begin_marker("closefrom");

    let mut i_locked = false;
    if i_am_intercepting {
        grab_global_lock(&mut i_locked, "closefrom");
        fdstate::reset_from(lowfd);
    }

    let sv = conn_fd();
    if lowfd > sv {
        orig_closefrom(lowfd);
    } else if lowfd == sv {
        orig_closefrom(lowfd + 1);
    } else {
        orig_close_range(lowfd as c_uint, (sv - 1) as c_uint, 0);
        orig_closefrom(sv + 1);
    }

    if i_am_intercepting {
        let mut msg = wire::close_range::Builder::new();
        msg.set_first(lowfd.max(0) as u32);
        msg.set_last(u32::MAX);
        msg.set_flags(0);
        send_msg_shmq(&msg);
    }

    insert_end_marker("closefrom");
    if i_locked {
        release_global_lock();
    }
    set_errno(saved_errno);
}

// ---------------------------------------------------------------------------
// dup family

#[no_mangle]
pub unsafe extern "C" fn dup(oldfd: c_int) -> c_int {
    if oldfd == conn_fd() {
        set_errno(libc::EBADF);
        return -1;
    }
    let i_am_intercepting = intercepting();
    let mut saved_errno = errno();
    insert_begin_marker("dup");

    let mut i_locked = false;
    if i_am_intercepting {
        grab_global_lock(&mut i_locked, "dup");
    }

    set_errno(saved_errno);
    let ret = orig_dup(oldfd);
    saved_errno = errno();
    let success = ret >= 0;

    if i_am_intercepting {
        if success {
            fdstate::copy_state(ret, oldfd);
        }
        if should_send(success, saved_errno) {
            let mut msg = wire::dup3::Builder::new();
            msg.set_oldfd(oldfd);
            msg.set_newfd(if success { ret } else { -1 });
            if success {
                msg.set_ret(ret);
            } else {
                msg.set_error_no(saved_errno);
            }
            send_msg_shmq(&msg);
        }
    }

    insert_end_marker("dup");
    if i_locked {
        release_global_lock();
    }
    set_errno(saved_errno);
    ret
}

unsafe fn dup2_common(name: &'static str, oldfd: c_int, newfd: c_int, flags: c_int, dup3_form: bool) -> c_int {
    // Only oldfd gets the standard guard; newfd aimed at the connection fd
    // has dedicated handling below.
    if oldfd == conn_fd() {
        set_errno(libc::EBADF);
        return -1;
    }
    let i_am_intercepting = intercepting();
    let mut saved_errno = errno();
    insert_begin_marker(name);

    let mut i_locked = false;
    if i_am_intercepting {
        grab_global_lock(&mut i_locked, name);
    }

    let conn_was = conn_fd();
    let redirecting = newfd == conn_was && conn_was >= 0;
    let mut sv_conn_new = -1;
    if redirecting {
        // Move the supervisor connection elsewhere so the application gets
        // the fd number it asked for.
        sv_conn_new = orig_dup(conn_was);
        if sv_conn_new < 0 {
            if i_locked {
                release_global_lock();
            }
            set_errno(libc::EBADF);
            return -1;
        }
        // dup() does not copy the close-on-exec flag.
        orig_fcntl(sv_conn_new, libc::F_SETFD, libc::FD_CLOEXEC as c_long);
    }

    set_errno(saved_errno);
    let ret = if dup3_form {
        orig_dup3(oldfd, newfd, flags)
    } else {
        orig_dup2(oldfd, newfd)
    };
    saved_errno = errno();
    let success = ret != -1;

    if redirecting {
        if success {
            // The dup closed the old connection fd as a side effect.
            intercept::FB_SV_CONN.store(sv_conn_new, core::sync::atomic::Ordering::Relaxed);
        } else {
            orig_close(sv_conn_new);
        }
    }

    if i_am_intercepting {
        if success {
            fdstate::copy_state(newfd, oldfd);
        }
        if should_send(success, saved_errno) {
            let mut msg = wire::dup3::Builder::new();
            msg.set_oldfd(oldfd);
            msg.set_newfd(newfd);
            if dup3_form {
                msg.set_flags(flags);
            }
            if success {
                msg.set_ret(ret);
            } else {
                msg.set_error_no(saved_errno);
            }
            send_msg_shmq(&msg);
        }
    }

    insert_end_marker(name);
    if i_locked {
        release_global_lock();
    }
    set_errno(saved_errno);
    ret
}

#[no_mangle]
pub unsafe extern "C" fn dup2(oldfd: c_int, newfd: c_int) -> c_int {
    dup2_common("dup2", oldfd, newfd, 0, false)
}

#[no_mangle]
pub unsafe extern "C" fn dup3(oldfd: c_int, newfd: c_int, flags: c_int) -> c_int {
    dup2_common("dup3", oldfd, newfd, flags, true)
}

// ---------------------------------------------------------------------------
// reads, writes, seeks on inherited fds

unsafe fn report_read(fd: c_int, is_pread: bool, success: bool, err: c_int) {
    if fdstate::notify_on_read(fd, is_pread) && should_send(success, err) {
        let mut i_locked = false;
        grab_global_lock(&mut i_locked, "read");
        let mut msg = wire::read_from_inherited::Builder::new();
        msg.set_fd(fd);
        msg.set_is_pread(is_pread);
        send_msg_shmq(&msg);
        fdstate::set_read_reported(fd, is_pread);
        if i_locked {
            release_global_lock();
        }
    }
}

unsafe fn report_write(fd: c_int, is_pwrite: bool, success: bool, err: c_int) {
    if fdstate::notify_on_write(fd, is_pwrite) && should_send(success, err) {
        let mut i_locked = false;
        grab_global_lock(&mut i_locked, "write");
        let mut msg = wire::write_to_inherited::Builder::new();
        msg.set_fd(fd);
        msg.set_is_pwrite(is_pwrite);
        send_msg_shmq(&msg);
        fdstate::set_write_reported(fd, is_pwrite);
        if i_locked {
            release_global_lock();
        }
    }
}

unsafe fn report_seek(fd: c_int, modify_offset: bool, success: bool, err: c_int) {
    if fdstate::notify_on_seek(fd, modify_offset) && should_send(success, err) {
        let mut i_locked = false;
        grab_global_lock(&mut i_locked, "seek");
        let mut msg = wire::seek_in_inherited::Builder::new();
        msg.set_fd(fd);
        msg.set_modify_offset(modify_offset);
        send_msg_shmq(&msg);
        fdstate::set_seek_reported(fd, modify_offset);
        if i_locked {
            release_global_lock();
        }
    }
}

macro_rules! rw_wrapper {
    ( $name:ident, $report:ident, $is_p:expr,
      ( $( $arg:ident : $ty:ty ),* ) ) => {
        ::paste::paste! {
            #[no_mangle]
            pub unsafe extern "C" fn $name(fd: c_int, $( $arg : $ty ),* ) -> ssize_t {
                if fd == conn_fd() {
                    set_errno(libc::EBADF);
                    return -1;
                }
                let i_am_intercepting = intercepting();
                let ret = [<orig_ $name>](fd, $( $arg ),* );
                let saved_errno = errno();
                if i_am_intercepting {
                    $report(fd, $is_p, ret >= 0, saved_errno);
                }
                set_errno(saved_errno);
                ret
            }
        }
    };
}

rw_wrapper!(read, report_read, false, (buf: *mut c_void, count: size_t));
rw_wrapper!(pread, report_read, true, (buf: *mut c_void, count: size_t, offset: off_t));
rw_wrapper!(readv, report_read, false, (iov: *const libc::iovec, iovcnt: c_int));
rw_wrapper!(preadv, report_read, true, (iov: *const libc::iovec, iovcnt: c_int, offset: off_t));
rw_wrapper!(write, report_write, false, (buf: *const c_void, count: size_t));
rw_wrapper!(pwrite, report_write, true, (buf: *const c_void, count: size_t, offset: off_t));
rw_wrapper!(writev, report_write, false, (iov: *const libc::iovec, iovcnt: c_int));
rw_wrapper!(pwritev, report_write, true, (iov: *const libc::iovec, iovcnt: c_int, offset: off_t));

#[no_mangle]
pub unsafe extern "C" fn recvmsg(fd: c_int, msg: *mut libc::msghdr, flags: c_int) -> ssize_t {
    if fd == conn_fd() {
        set_errno(libc::EBADF);
        return -1;
    }
    let i_am_intercepting = intercepting();
    let ret = orig_recvmsg(fd, msg, flags);
    let saved_errno = errno();
    if i_am_intercepting {
        report_read(fd, false, ret >= 0, saved_errno);
        if ret >= 0 && !msg.is_null() {
            report_scm_rights(&*msg, flags);
        }
    }
    set_errno(saved_errno);
    ret
}

/// A message can carry several SCM_RIGHTS ancillary blocks (though the
/// kernel tends to flatten them); one report goes out per block, listing
/// all its fds.
unsafe fn report_scm_rights(msg: &libc::msghdr, flags: c_int) {
    let mut cmsg = libc::CMSG_FIRSTHDR(msg);
    while !cmsg.is_null() {
        if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
            let data_len = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
            let num_fds = data_len / core::mem::size_of::<c_int>();
            if num_fds > 0 {
                let fds = core::slice::from_raw_parts(
                    libc::CMSG_DATA(cmsg) as *const c_int,
                    num_fds,
                );
                let mut report = wire::recvmsg_scm_rights::Builder::new();
                report.set_cloexec(flags & libc::MSG_CMSG_CLOEXEC != 0);
                report.set_fds(fds);
                let mut i_locked = false;
                grab_global_lock(&mut i_locked, "recvmsg");
                send_msg_shmq(&report);
                if i_locked {
                    release_global_lock();
                }
            }
        }
        cmsg = libc::CMSG_NXTHDR(msg as *const libc::msghdr as *mut libc::msghdr, cmsg);
    }
}

#[no_mangle]
pub unsafe extern "C" fn lseek(fd: c_int, offset: off_t, whence: c_int) -> off_t {
    if fd == conn_fd() {
        set_errno(libc::EBADF);
        return -1;
    }
    let i_am_intercepting = intercepting();
    let ret = orig_lseek(fd, offset, whence);
    let saved_errno = errno();
    if i_am_intercepting {
        let modify_offset = offset != 0 || whence != libc::SEEK_CUR;
        report_seek(fd, modify_offset, ret != -1, saved_errno);
    }
    set_errno(saved_errno);
    ret
}

#[no_mangle]
pub unsafe extern "C" fn lseek64(fd: c_int, offset: off_t, whence: c_int) -> off_t {
    lseek(fd, offset, whence)
}

#[no_mangle]
pub unsafe extern "C" fn fseek(stream: *mut FILE, offset: c_long, whence: c_int) -> c_int {
    let i_am_intercepting = intercepting();
    let fd = if stream.is_null() { -1 } else { libc::fileno(stream) };
    let ret = orig_fseek(stream, offset, whence);
    let saved_errno = errno();
    if i_am_intercepting && fd >= 0 {
        report_seek(fd, true, ret == 0, saved_errno);
    }
    set_errno(saved_errno);
    ret
}

#[no_mangle]
pub unsafe extern "C" fn fseeko(stream: *mut FILE, offset: off_t, whence: c_int) -> c_int {
    let i_am_intercepting = intercepting();
    let fd = if stream.is_null() { -1 } else { libc::fileno(stream) };
    let ret = orig_fseeko(stream, offset, whence);
    let saved_errno = errno();
    if i_am_intercepting && fd >= 0 {
        report_seek(fd, true, ret == 0, saved_errno);
    }
    set_errno(saved_errno);
    ret
}

#[no_mangle]
pub unsafe extern "C" fn ftell(stream: *mut FILE) -> c_long {
    let i_am_intercepting = intercepting();
    let fd = if stream.is_null() { -1 } else { libc::fileno(stream) };
    let ret = orig_ftell(stream);
    let saved_errno = errno();
    if i_am_intercepting && fd >= 0 {
        report_seek(fd, false, ret != -1, saved_errno);
    }
    set_errno(saved_errno);
    ret
}

#[no_mangle]
pub unsafe extern "C" fn ftello(stream: *mut FILE) -> off_t {
    let i_am_intercepting = intercepting();
    let fd = if stream.is_null() { -1 } else { libc::fileno(stream) };
    let ret = orig_ftello(stream);
    let saved_errno = errno();
    if i_am_intercepting && fd >= 0 {
        report_seek(fd, false, ret != -1, saved_errno);
    }
    set_errno(saved_errno);
    ret
}

// ---------------------------------------------------------------------------
// fcntl / ioctl

#[no_mangle]
pub unsafe extern "C" fn fcntl(fd: c_int, cmd: c_int, arg: c_long) -> c_int {
    if fd == conn_fd() {
        set_errno(libc::EBADF);
        return -1;
    }
    let i_am_intercepting = intercepting();
    let mut saved_errno = errno();
    insert_begin_marker("fcntl");

    // Only commands that change behavior the supervisor can observe get
    // reported; the rest are advisory noise.
    let (to_send, send_ret, has_int_arg) = match cmd {
        libc::F_SETFD => (true, false, true),
        libc::F_DUPFD | libc::F_DUPFD_CLOEXEC => (true, true, true),
        _ => (false, false, false),
    };

    let mut i_locked = false;
    if i_am_intercepting && to_send {
        grab_global_lock(&mut i_locked, "fcntl");
    }

    set_errno(saved_errno);
    let ret = orig_fcntl(fd, cmd, arg);
    saved_errno = errno();
    let success = ret != -1;

    if i_am_intercepting {
        if success && (cmd == libc::F_DUPFD || cmd == libc::F_DUPFD_CLOEXEC) {
            fdstate::copy_state(ret, fd);
        }
        if to_send && should_send(success, saved_errno) {
            let mut msg = wire::fcntl::Builder::new();
            msg.set_fd(fd);
            msg.set_cmd(cmd);
            if has_int_arg {
                msg.set_arg(arg as c_int);
            }
            if success {
                if send_ret {
                    msg.set_ret(ret);
                }
            } else {
                msg.set_error_no(saved_errno);
            }
            send_msg_shmq(&msg);
        }
    }

    insert_end_marker("fcntl");
    if i_locked {
        release_global_lock();
    }
    set_errno(saved_errno);
    ret
}

#[no_mangle]
pub unsafe extern "C" fn fcntl64(fd: c_int, cmd: c_int, arg: c_long) -> c_int {
    fcntl(fd, cmd, arg)
}

#[no_mangle]
pub unsafe extern "C" fn ioctl(fd: c_int, request: c_ulong, argp: *mut c_void) -> c_int {
    if fd == conn_fd() {
        set_errno(libc::EBADF);
        return -1;
    }
    let i_am_intercepting = intercepting();
    let mut saved_errno = errno();

    let to_send = request == libc::FIOCLEX || request == libc::FIONCLEX;

    let mut i_locked = false;
    if i_am_intercepting && to_send {
        grab_global_lock(&mut i_locked, "ioctl");
    }

    set_errno(saved_errno);
    let ret = orig_ioctl(fd, request, argp);
    saved_errno = errno();
    let success = ret != -1;

    if i_am_intercepting && to_send && should_send(success, saved_errno) {
        let mut msg = wire::ioctl::Builder::new();
        msg.set_fd(fd);
        msg.set_cmd(request as u64);
        if success {
            msg.set_ret(ret);
        } else {
            msg.set_error_no(saved_errno);
        }
        send_msg_shmq(&msg);
    }

    if i_locked {
        release_global_lock();
    }
    set_errno(saved_errno);
    ret
}

// ---------------------------------------------------------------------------
// readlink

unsafe fn readlink_common<F>(
    name: &'static str,
    dirfd: c_int,
    pathname: *const c_char,
    buf: *mut c_char,
    bufsiz: size_t,
    call: F,
) -> ssize_t
where
    F: FnOnce() -> ssize_t,
{
    let i_am_intercepting = intercepting();
    let mut saved_errno = errno();
    insert_begin_marker(name);

    let mut i_locked = false;
    if i_am_intercepting {
        grab_global_lock(&mut i_locked, name);
    }

    set_errno(saved_errno);
    let ret = call();
    saved_errno = errno();
    let success = ret >= 0;

    if i_am_intercepting && should_send(success, saved_errno) && !pathname.is_null() {
        let mut msg = wire::readlink::Builder::new();
        if dirfd != libc::AT_FDCWD {
            msg.set_dirfd(dirfd);
        }
        msg.set_pathname(CStr::from_ptr(pathname).to_bytes());
        // The resolved target is a raw string, not to be path-resolved.
        let mut target = [0u8; 4096];
        if success && (ret as usize) <= bufsiz {
            let len = (ret as usize).min(target.len());
            core::ptr::copy_nonoverlapping(buf as *const u8, target.as_mut_ptr(), len);
            msg.set_ret_target(&target[..len]);
        }
        if !success {
            msg.set_error_no(saved_errno);
        }
        send_msg_shmq(&msg);
    }

    insert_end_marker(name);
    if i_locked {
        release_global_lock();
    }
    set_errno(saved_errno);
    ret
}

#[no_mangle]
pub unsafe extern "C" fn readlink(
    pathname: *const c_char,
    buf: *mut c_char,
    bufsiz: size_t,
) -> ssize_t {
    readlink_common("readlink", libc::AT_FDCWD, pathname, buf, bufsiz, || unsafe {
        orig_readlink(pathname, buf, bufsiz)
    })
}

#[no_mangle]
pub unsafe extern "C" fn readlinkat(
    dirfd: c_int,
    pathname: *const c_char,
    buf: *mut c_char,
    bufsiz: size_t,
) -> ssize_t {
    readlink_common("readlinkat", dirfd, pathname, buf, bufsiz, || unsafe {
        orig_readlinkat(dirfd, pathname, buf, bufsiz)
    })
}
