//! pipe()/pipe2() interception.
//!
//! Instead of creating the pipe locally, the interceptor asks the
//! supervisor to create it, and receives the two endpoint fds as SCM_RIGHTS
//! ancillary data. The supervisor keeps the middle of the pipe, which lets
//! it observe (and fingerprint) everything the build writes into it.

use libc::{c_char, c_int, c_void};
use quickbuild_shared::frame;
use quickbuild_shared::wire;

use crate::intercept::{fb_abort, send_msg_socket};
use crate::orig::fns::*;
use crate::wrappers::{
    conn_fd, errno, grab_global_lock, insert_begin_marker, insert_end_marker, intercepting,
    release_global_lock, set_errno,
};
use crate::{fdstate, tls};

/// Receive the `pipe_created` reply: the frame header arrives as a plain
/// read, the payload via recvmsg with room for two ancillary fds.
unsafe fn recv_pipe_created(flags: c_int) -> Result<[c_int; 2], c_int> {
    let conn = conn_fd();
    let (payload_len, _ack) = match frame::recv_frame_header(conn) {
        Ok(h) => h,
        Err(_) => fb_abort("supervisor connection lost"),
    };

    let mut payload = [0u8; 256];
    if payload_len as usize > payload.len() {
        fb_abort("oversized pipe_created reply");
    }

    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr() as *mut c_void,
        iov_len: payload_len as usize,
    };
    // Taken from cmsg(3): the buffer is wrapped in a union-equivalent to
    // keep it aligned for cmsghdr.
    let mut cbuf = [0u64; 8];
    let mut msgh: libc::msghdr = core::mem::zeroed();
    msgh.msg_iov = &mut iov;
    msgh.msg_iovlen = 1;
    msgh.msg_control = cbuf.as_mut_ptr() as *mut c_void;
    msgh.msg_controllen = core::mem::size_of_val(&cbuf);

    let recv_flags = if flags & libc::O_CLOEXEC != 0 {
        libc::MSG_CMSG_CLOEXEC
    } else {
        0
    };
    let mut received;
    loop {
        received = orig_recvmsg(conn, &mut msgh, recv_flags);
        if received >= 0 || errno() != libc::EINTR {
            break;
        }
    }
    if received != payload_len as isize {
        fb_abort("short pipe_created reply");
    }

    let view = wire::pipe_created::View::from_bytes(&payload[..payload_len as usize]);
    if view.has_error_no() {
        return Err(view.error_no());
    }

    let cmsg = libc::CMSG_FIRSTHDR(&msgh);
    if cmsg.is_null()
        || (*cmsg).cmsg_level != libc::SOL_SOCKET
        || (*cmsg).cmsg_type != libc::SCM_RIGHTS
        || (*cmsg).cmsg_len != libc::CMSG_LEN(2 * core::mem::size_of::<c_int>() as u32) as usize
    {
        // fds missing, probably the per-process fd limit was hit while
        // transferring.
        return Err(libc::EMFILE);
    }
    let mut fds: [c_int; 2] = [0; 2];
    core::ptr::copy_nonoverlapping(
        libc::CMSG_DATA(cmsg) as *const c_int,
        fds.as_mut_ptr(),
        2,
    );
    Ok(fds)
}

unsafe fn pipe_common(name: &'static str, pipefd: *mut c_int, flags: c_int) -> c_int {
    if pipefd.is_null() {
        set_errno(libc::EFAULT);
        return -1;
    }
    let i_am_intercepting = intercepting();
    let mut saved_errno = errno();
    insert_begin_marker(name);

    let mut i_locked = false;
    if i_am_intercepting {
        grab_global_lock(&mut i_locked, name);
    }

    let ret;
    if i_am_intercepting {
        // No signal between sending pipe_request and consuming its reply.
        tls::danger_zone_enter();

        let mut req = wire::pipe_request::Builder::new();
        if flags != 0 {
            req.set_flags(flags);
        }
        if frame::send_frame(conn_fd(), &req, 0).is_err() {
            fb_abort("supervisor connection lost");
        }

        match recv_pipe_created(flags) {
            Ok(fds) => {
                *pipefd = fds[0];
                *pipefd.add(1) = fds[1];
                ret = 0;
            }
            Err(e) => {
                saved_errno = e;
                ret = -1;
            }
        }
        tls::danger_zone_leave();

        if ret == 0 {
            for i in 0..2 {
                let fd = *pipefd.add(i);
                fdstate::clear_notify(fd);
                fdstate::mark_pipe(fd);
            }
            // Tell the supervisor which local fd numbers the endpoints
            // landed on.
            let mut msg = wire::pipe_fds::Builder::new();
            msg.set_fd0(*pipefd);
            msg.set_fd1(*pipefd.add(1));
            send_msg_socket(&msg);
        }
    } else {
        set_errno(saved_errno);
        ret = orig_pipe2(pipefd, flags);
        saved_errno = errno();
    }

    insert_end_marker(name);
    if i_locked {
        release_global_lock();
    }
    set_errno(saved_errno);
    ret
}

#[no_mangle]
pub unsafe extern "C" fn pipe(pipefd: *mut c_int) -> c_int {
    pipe_common("pipe", pipefd, 0)
}

#[no_mangle]
pub unsafe extern "C" fn pipe2(pipefd: *mut c_int, flags: c_int) -> c_int {
    pipe_common("pipe2", pipefd, flags)
}

/// Receive the `popen_fd` reply carrying exactly one substitute fd.
pub(super) unsafe fn recv_popen_fd() -> c_int {
    let conn = conn_fd();
    let (payload_len, _ack) = match frame::recv_frame_header(conn) {
        Ok(h) => h,
        Err(_) => fb_abort("supervisor connection lost"),
    };

    let mut payload = [0u8; 64];
    if payload_len as usize > payload.len() {
        fb_abort("oversized popen_fd reply");
    }
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr() as *mut c_void,
        iov_len: payload_len as usize,
    };
    let mut cbuf = [0u64; 4];
    let mut msgh: libc::msghdr = core::mem::zeroed();
    msgh.msg_iov = &mut iov;
    msgh.msg_iovlen = 1;
    msgh.msg_control = cbuf.as_mut_ptr() as *mut c_void;
    msgh.msg_controllen = core::mem::size_of_val(&cbuf);

    let mut received;
    loop {
        received = orig_recvmsg(conn, &mut msgh, 0);
        if received >= 0 || errno() != libc::EINTR {
            break;
        }
    }
    if received != payload_len as isize {
        fb_abort("short popen_fd reply");
    }
    let _ = wire::popen_fd::View::from_bytes(&payload[..payload_len as usize]);

    let cmsg = libc::CMSG_FIRSTHDR(&msgh);
    if cmsg.is_null()
        || (*cmsg).cmsg_level != libc::SOL_SOCKET
        || (*cmsg).cmsg_type != libc::SCM_RIGHTS
        || (*cmsg).cmsg_len != libc::CMSG_LEN(core::mem::size_of::<c_int>() as u32) as usize
    {
        fb_abort("popen_fd reply without the fd");
    }
    let mut fd: c_int = -1;
    core::ptr::copy_nonoverlapping(libc::CMSG_DATA(cmsg) as *const c_int, &mut fd, 1);
    fd
}

/// Translate a popen()/fopen() type string into open() flags.
pub(super) unsafe fn popen_type_to_flags(mode: *const c_char) -> c_int {
    if mode.is_null() {
        return -1;
    }
    let bytes = core::ffi::CStr::from_ptr(mode).to_bytes();
    let mut flags = match bytes.first() {
        Some(b'r') => {
            if bytes.get(1) == Some(&b'+') {
                libc::O_RDWR
            } else {
                libc::O_RDONLY
            }
        }
        Some(b'w') => {
            if bytes.get(1) == Some(&b'+') {
                libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC
            } else {
                libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC
            }
        }
        Some(b'a') => {
            if bytes.get(1) == Some(&b'+') {
                libc::O_RDWR | libc::O_CREAT | libc::O_APPEND
            } else {
                libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND
            }
        }
        _ => return -1,
    };
    if bytes.contains(&b'e') {
        flags |= libc::O_CLOEXEC;
    }
    flags
}
