//! Per-connection handling: handshake, socket frames, shmq draining,
//! acks and fd-carrying replies.

use std::cell::RefCell;
use std::io;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::time::Duration;

use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
use quickbuild_shared::fbb::{put_u32, FbbBuilder};
use quickbuild_shared::frame::FRAME_HEADER_SIZE;
use quickbuild_shared::{shmq, wire};
use std::ffi::CString;
use std::io::IoSlice;
use tokio::io::Interest;
use tokio::net::UnixStream;

use super::pipes;
use super::sink::{EventSink, PopenEndpoint};

/// How often the shmq is polled when the socket is quiet. The queue has no
/// doorbell of its own; a barrier ack waits at most this long.
const SHMQ_POLL_INTERVAL: Duration = Duration::from_millis(1);

struct Conn {
    stream: UnixStream,
    sink: Rc<RefCell<dyn EventSink>>,
    pid: i32,
    queue: Option<shmq::Reader>,
    /// Receive buffer; frames are cut out of the front.
    inbuf: Vec<u8>,
    /// type_flags of the popen whose popen_parent we are waiting for.
    pending_popen_flags: Option<i32>,
}

pub async fn handle_connection(stream: UnixStream, sink: Rc<RefCell<dyn EventSink>>) {
    let mut conn = Conn {
        stream,
        sink,
        pid: 0,
        queue: None,
        inbuf: Vec::with_capacity(4096),
        pending_popen_flags: None,
    };
    if let Err(err) = conn.run().await {
        tracing::debug!(pid = conn.pid, %err, "connection closed with error");
    }
    conn.drain_shmq();
    conn.sink.borrow_mut().on_disconnect(conn.pid);
}

impl Conn {
    async fn run(&mut self) -> io::Result<()> {
        let mut poll = tokio::time::interval(SHMQ_POLL_INTERVAL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                ready = self.stream.ready(Interest::READABLE) => {
                    ready?;
                    // Everything already queued on the shmq happened before
                    // whatever the socket now carries.
                    self.drain_shmq();
                    if !self.read_some()? {
                        return Ok(());
                    }
                    while let Some((ack_id, payload)) = self.pop_frame() {
                        self.dispatch_socket(ack_id, payload).await?;
                    }
                }
                _ = poll.tick() => {
                    self.drain_shmq();
                }
            }
        }
    }

    /// Nonblocking read into the buffer. Returns false on EOF.
    fn read_some(&mut self) -> io::Result<bool> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.try_read(&mut chunk) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    self.inbuf.extend_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        return Ok(true);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(e) => return Err(e),
            }
        }
    }

    /// Cut one complete frame off the front of the buffer.
    fn pop_frame(&mut self) -> Option<(u32, Vec<u8>)> {
        if self.inbuf.len() < FRAME_HEADER_SIZE {
            return None;
        }
        let len = u32::from_ne_bytes(self.inbuf[0..4].try_into().unwrap()) as usize;
        let ack = u32::from_ne_bytes(self.inbuf[4..8].try_into().unwrap());
        if self.inbuf.len() < FRAME_HEADER_SIZE + len {
            return None;
        }
        let payload = self.inbuf[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + len].to_vec();
        self.inbuf.drain(..FRAME_HEADER_SIZE + len);
        Some((ack, payload))
    }

    // -- sending ----------------------------------------------------------

    /// Blocking-ish write of a whole buffer on the nonblocking socket. Used
    /// from sync context (shmq acks); the peer is blocked waiting for us,
    /// so the buffer drains quickly.
    fn write_all_sync(&self, mut bytes: &[u8]) -> io::Result<()> {
        let fd = self.stream.as_raw_fd();
        while !bytes.is_empty() {
            let n = unsafe {
                libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len())
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(libc::EAGAIN) => {
                        std::thread::yield_now();
                        continue;
                    }
                    _ => return Err(err),
                }
            }
            bytes = &bytes[n as usize..];
        }
        Ok(())
    }

    fn send_ack_sync(&self, ack_id: u32) -> io::Result<()> {
        let mut hdr = [0u8; FRAME_HEADER_SIZE];
        put_u32(&mut hdr, 4, ack_id);
        self.write_all_sync(&hdr)
    }

    async fn write_all(&self, mut bytes: &[u8]) -> io::Result<()> {
        while !bytes.is_empty() {
            self.stream.writable().await?;
            match self.stream.try_write(bytes) {
                Ok(n) => bytes = &bytes[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Send a framed message, optionally with fds as ancillary data. The
    /// header goes out as plain bytes; the ancillary data rides the payload
    /// so the interceptor's recvmsg of the body picks it up.
    async fn send_msg(
        &self,
        msg: &dyn FbbBuilder,
        ack_id: u32,
        fds: &[i32],
    ) -> io::Result<()> {
        let len = msg.measure();
        let mut buf = vec![0u8; FRAME_HEADER_SIZE + len];
        put_u32(&mut buf, 0, len as u32);
        put_u32(&mut buf, 4, ack_id);
        msg.serialize_into(&mut buf[FRAME_HEADER_SIZE..]);

        if fds.is_empty() {
            return self.write_all(&buf).await;
        }

        self.write_all(&buf[..FRAME_HEADER_SIZE]).await?;
        let payload = &buf[FRAME_HEADER_SIZE..];
        loop {
            self.stream.writable().await?;
            let res = self.stream.try_io(Interest::WRITABLE, || {
                let iov = [IoSlice::new(payload)];
                let cmsg = [ControlMessage::ScmRights(fds)];
                sendmsg::<()>(
                    self.stream.as_raw_fd(),
                    &iov,
                    &cmsg,
                    MsgFlags::empty(),
                    None,
                )
                .map_err(|e| io::Error::from_raw_os_error(e as i32))
            });
            match res {
                Ok(n) => {
                    if n != payload.len() {
                        return Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "short sendmsg for fd-carrying reply",
                        ));
                    }
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }

    // -- dispatch ---------------------------------------------------------

    fn attach_shmq(&mut self, name: &[u8]) {
        match CString::new(name.to_vec()) {
            Ok(cname) => match shmq::Reader::attach(&cname) {
                Ok(reader) => self.queue = Some(reader),
                Err(err) => {
                    tracing::error!(pid = self.pid, %err, "cannot attach shmq");
                }
            },
            Err(_) => tracing::error!(pid = self.pid, "shmq name with NUL"),
        }
    }

    async fn dispatch_socket(&mut self, ack_id: u32, payload: Vec<u8>) -> io::Result<()> {
        if payload.is_empty() {
            // A bare tick; nothing to do.
            return Ok(());
        }
        let Some(msg) = wire::AnyView::parse(&payload) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unknown message tag",
            ));
        };

        match &msg {
            wire::AnyView::ScprocQuery(q) => {
                self.pid = q.pid();
                if let Some(name) = q.shmq_name() {
                    self.attach_shmq(name);
                }
                let decision = self.sink.borrow_mut().decide_scproc(q);
                let mut resp = wire::scproc_resp::Builder::new();
                resp.set_shortcut(decision.shortcut.is_some());
                if let Some(status) = decision.shortcut {
                    resp.set_exit_status(status);
                }
                if decision.debug_flags != 0 {
                    resp.set_debug_flags(decision.debug_flags);
                }
                self.send_msg(&resp, ack_id, &[]).await?;
                return Ok(());
            }
            wire::AnyView::ForkChild(f) => {
                self.pid = f.pid();
                if let Some(name) = f.shmq_name() {
                    self.attach_shmq(name);
                }
            }
            wire::AnyView::PipeRequest(req) => {
                let flags = req.flags_or(0);
                match pipes::create_intercepted_pipe(flags) {
                    Ok(pipe) => {
                        let fds = pipes::app_fds(&pipe);
                        let created = wire::pipe_created::Builder::new();
                        self.send_msg(&created, ack_id, &fds).await?;
                        // fd0 in the *application* becomes known via the
                        // upcoming pipe_fds message; until then key the
                        // ferry by our own read-end number.
                        pipes::spawn_ferry(self.pid, fds[0], pipe, self.sink.clone());
                    }
                    Err(err) => {
                        let mut created = wire::pipe_created::Builder::new();
                        created.set_error_no(err.raw_os_error().unwrap_or(libc::EMFILE));
                        self.send_msg(&created, ack_id, &[]).await?;
                    }
                }
                self.sink.borrow_mut().on_message(self.pid, &msg);
                return Ok(());
            }
            wire::AnyView::Popen(p) => {
                self.pending_popen_flags = Some(p.type_flags());
            }
            wire::AnyView::PopenParent(p) => {
                let type_flags = self.pending_popen_flags.take().unwrap_or(0);
                let app_reads = type_flags & libc::O_ACCMODE == libc::O_RDONLY;
                match pipes::create_popen_pipe(app_reads) {
                    Ok((app_fd, half)) => {
                        let reply = wire::popen_fd::Builder::new();
                        self.send_msg(&reply, ack_id, &[app_fd.as_raw_fd()]).await?;
                        let endpoint = match half {
                            pipes::PopenHalf::Sender(s) => PopenEndpoint::Feed(s),
                            pipes::PopenHalf::Receiver(r) => PopenEndpoint::Consume(r),
                        };
                        self.sink
                            .borrow_mut()
                            .on_popen_endpoint(self.pid, p.fd(), endpoint);
                    }
                    Err(err) => {
                        tracing::error!(pid = self.pid, %err, "cannot create popen pipe");
                        return Err(err);
                    }
                }
                self.sink.borrow_mut().on_message(self.pid, &msg);
                return Ok(());
            }
            _ => {}
        }

        self.sink.borrow_mut().on_message(self.pid, &msg);
        if ack_id != 0 {
            self.send_msg_empty(ack_id).await?;
        }
        Ok(())
    }

    async fn send_msg_empty(&self, ack_id: u32) -> io::Result<()> {
        let mut hdr = [0u8; FRAME_HEADER_SIZE];
        put_u32(&mut hdr, 4, ack_id);
        self.write_all(&hdr).await
    }

    /// Drain the shared-memory queue until it is empty. Runs synchronously:
    /// the only replies it produces are bare acks.
    fn drain_shmq(&mut self) {
        loop {
            let Some(queue) = self.queue.as_mut() else { return };
            let ack_id = match queue.peek_tail() {
                Ok(Some((ack_id, body))) => {
                    match wire::AnyView::parse(body) {
                        Some(msg) => {
                            // The fd-carrying popen reply needs the type
                            // flags announced here.
                            if let wire::AnyView::Popen(p) = &msg {
                                self.pending_popen_flags = Some(p.type_flags());
                            }
                            self.sink.borrow_mut().on_message(self.pid, &msg);
                        }
                        None => {
                            tracing::error!(pid = self.pid, "malformed shmq message");
                        }
                    }
                    ack_id
                }
                Ok(None) => return,
                Err(err) => {
                    tracing::error!(pid = self.pid, %err, "shmq read failure");
                    self.queue = None;
                    return;
                }
            };
            if let Some(queue) = self.queue.as_mut() {
                queue.discard_tail();
            }
            if ack_id != 0 {
                if let Err(err) = self.send_ack_sync(ack_id) {
                    tracing::debug!(pid = self.pid, %err, "ack send failed");
                }
            }
        }
    }
}
