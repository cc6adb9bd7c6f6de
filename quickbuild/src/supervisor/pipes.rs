//! Intercepted pipe plumbing.
//!
//! When a build process asks for a pipe, the supervisor creates two real
//! pipes and keeps the middle: data written at the application's write end
//! flows through the supervisor (where it is recorded) and out the
//! application's read end. The application's two fds travel back as
//! SCM_RIGHTS ancillary data.

use std::cell::RefCell;
use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::rc::Rc;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;

use super::sink::EventSink;

pub struct InterceptedPipe {
    /// Goes to the application as `pipefd[0]`.
    pub app_read: OwnedFd,
    /// Goes to the application as `pipefd[1]`.
    pub app_write: OwnedFd,
    /// Supervisor's view of what the application writes.
    pub sv_read: pipe::Receiver,
    /// Supervisor's path to the application's readers.
    pub sv_write: pipe::Sender,
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_retain(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

/// Create an intercepted pipe pair. `request_flags` are the application's
/// pipe2() flags: the status flags are applied to its endpoints here;
/// O_CLOEXEC is the receiving side's business (MSG_CMSG_CLOEXEC).
pub fn create_intercepted_pipe(request_flags: i32) -> io::Result<InterceptedPipe> {
    let (a_read, a_write) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
    let (b_read, b_write) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;

    let status_flags =
        OFlag::from_bits_retain(request_flags) & (OFlag::O_NONBLOCK | OFlag::O_DIRECT);
    if !status_flags.is_empty() {
        let cur = OFlag::from_bits_retain(fcntl(&a_read, FcntlArg::F_GETFL)?);
        fcntl(&a_read, FcntlArg::F_SETFL(cur | status_flags))?;
        let cur = OFlag::from_bits_retain(fcntl(&b_write, FcntlArg::F_GETFL)?);
        fcntl(&b_write, FcntlArg::F_SETFL(cur | status_flags))?;
    }

    set_nonblocking(&b_read)?;
    set_nonblocking(&a_write)?;
    let sv_read = pipe::Receiver::from_owned_fd(b_read)?;
    let sv_write = pipe::Sender::from_owned_fd(a_write)?;

    Ok(InterceptedPipe {
        app_read: a_read,
        app_write: b_write,
        sv_read,
        sv_write,
    })
}

/// Create the supervisor-fed half of a popen() stream. Returns the fd to
/// hand to the application plus our end. `app_reads` reflects the popen
/// type: `r` means the application reads.
pub fn create_popen_pipe(app_reads: bool) -> io::Result<(OwnedFd, PopenHalf)> {
    let (read_end, write_end) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
    if app_reads {
        set_nonblocking(&write_end)?;
        Ok((read_end, PopenHalf::Sender(pipe::Sender::from_owned_fd(write_end)?)))
    } else {
        set_nonblocking(&read_end)?;
        Ok((write_end, PopenHalf::Receiver(pipe::Receiver::from_owned_fd(read_end)?)))
    }
}

pub enum PopenHalf {
    Sender(pipe::Sender),
    Receiver(pipe::Receiver),
}

/// Ferry traffic from the application's write end to its read end,
/// recording every chunk. Ends when the writers close (EOF) or the readers
/// go away (EPIPE-class write error).
pub async fn ferry(
    pid: i32,
    fd0: i32,
    mut sv_read: pipe::Receiver,
    mut sv_write: pipe::Sender,
    sink: Rc<RefCell<dyn EventSink>>,
) {
    let mut buf = [0u8; 8192];
    loop {
        let n = match sv_read.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        sink.borrow_mut().on_pipe_data(pid, fd0, &buf[..n]);
        if sv_write.write_all(&buf[..n]).await.is_err() {
            break;
        }
    }
    tracing::trace!(pid, fd0, "pipe ferry finished");
}

/// Spawn the ferry on the current-thread runtime.
pub fn spawn_ferry(pid: i32, fd0: i32, p: InterceptedPipe, sink: Rc<RefCell<dyn EventSink>>) {
    let InterceptedPipe {
        sv_read, sv_write, ..
    } = p;
    tokio::task::spawn_local(ferry(pid, fd0, sv_read, sv_write, sink));
}

/// Raw fds of the application's two endpoints, in pipefd order.
pub fn app_fds(p: &InterceptedPipe) -> [i32; 2] {
    [p.app_read.as_raw_fd(), p.app_write.as_raw_fd()]
}
