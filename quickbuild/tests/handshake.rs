//! End-to-end tests of the supervisor loop against a hand-driven client
//! playing the interceptor's part: handshake, shmq traffic with acks,
//! barriers, socket-ordered closes, and fd-passing replies.

use std::cell::RefCell;
use std::io::IoSliceMut;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};
use quickbuild::supervisor::sink::{EventSink, PopenEndpoint, ScprocDecision};
use quickbuild::Supervisor;
use quickbuild_shared::fbb::StrArraySource;
use quickbuild_shared::{frame, shmq, wire};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;

// ============================================================================
// TEST FIXTURES
// ============================================================================

#[derive(Default)]
struct Recorded {
    messages: Vec<String>,
    pipe_data: Vec<u8>,
}

struct RecordingSink {
    recorded: Arc<Mutex<Recorded>>,
    shortcut: Option<i32>,
    popen_endpoint: Rc<RefCell<Option<PopenEndpoint>>>,
}

impl EventSink for RecordingSink {
    fn decide_scproc(&mut self, query: &wire::scproc_query::View<'_>) -> ScprocDecision {
        self.recorded
            .lock()
            .unwrap()
            .messages
            .push(format!("scproc_query:{}", query.pid()));
        ScprocDecision {
            shortcut: self.shortcut,
            debug_flags: 0,
        }
    }

    fn on_message(&mut self, _pid: i32, msg: &wire::AnyView<'_>) {
        self.recorded
            .lock()
            .unwrap()
            .messages
            .push(msg.name().to_string());
    }

    fn on_pipe_data(&mut self, _pid: i32, _fd0: i32, data: &[u8]) {
        self.recorded.lock().unwrap().pipe_data.extend_from_slice(data);
    }

    fn on_popen_endpoint(&mut self, _pid: i32, _fd: i32, endpoint: PopenEndpoint) {
        *self.popen_endpoint.borrow_mut() = Some(endpoint);
    }

    fn on_disconnect(&mut self, _pid: i32) {
        self.recorded
            .lock()
            .unwrap()
            .messages
            .push("disconnect".to_string());
    }
}

struct TestContext {
    _temp_dir: TempDir,
    supervisor: Supervisor,
    recorded: Arc<Mutex<Recorded>>,
    popen_endpoint: Rc<RefCell<Option<PopenEndpoint>>>,
    socket_path: std::path::PathBuf,
}

fn context(shortcut: Option<i32>) -> TestContext {
    let temp_dir = TempDir::new().expect("temp dir");
    let prefix = temp_dir.path().join("sock");
    let recorded = Arc::new(Mutex::new(Recorded::default()));
    let popen_endpoint = Rc::new(RefCell::new(None));
    let sink = Rc::new(RefCell::new(RecordingSink {
        recorded: recorded.clone(),
        shortcut,
        popen_endpoint: popen_endpoint.clone(),
    }));
    let supervisor = Supervisor::bind(&prefix, sink).expect("bind supervisor");
    let socket_path = supervisor.socket_path().to_path_buf();
    TestContext {
        _temp_dir: temp_dir,
        supervisor,
        recorded,
        popen_endpoint,
        socket_path,
    }
}

fn unique_shmq_name() -> String {
    static SEQ: AtomicU32 = AtomicU32::new(0);
    format!(
        "/qb-test-{}-{}",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

/// Create this fake process's queue and introduce it to the supervisor.
/// Returns the socket and the queue writer.
fn client_handshake(socket_path: &std::path::Path, pid: i32) -> (UnixStream, shmq::Writer) {
    let shmq_name = unique_shmq_name();
    let cname = std::ffi::CString::new(shmq_name.clone()).unwrap();
    let writer = shmq::Writer::create(&cname).expect("create shmq");

    let stream = UnixStream::connect(socket_path).expect("connect");
    let fd = stream.as_raw_fd();

    let mut query = wire::scproc_query::Builder::new();
    query.set_pid(pid);
    query.set_ppid(1);
    query.set_cwd("/work");
    query.set_arg(StrArraySource::Strs(&["cc", "-c", "x.c"]));
    query.set_env_var(StrArraySource::Strs(&["PATH=/usr/bin"]));
    query.set_libs(StrArraySource::Strs(&[]));
    query.set_shmq_name(shmq_name.as_bytes());
    frame::send_frame(fd, &query, 1).unwrap();

    (stream, writer)
}

fn shmq_send(writer: &mut shmq::Writer, msg: &dyn quickbuild_shared::fbb::FbbBuilder, ack: u32) {
    let len = msg.measure();
    let span = writer.new_message(ack, len).unwrap();
    msg.serialize_into(span);
    writer.add_message();
}

fn expect_ack(fd: RawFd, expected: u32) {
    let (len, ack) = frame::recv_frame_header(fd).unwrap();
    assert_eq!(len, 0, "expected a bare ack");
    assert_eq!(ack, expected);
}

/// Receive a frame whose payload carries SCM_RIGHTS fds: header first, then
/// the payload via recvmsg.
fn recv_frame_with_fds(fd: RawFd, max_fds: usize) -> (Vec<u8>, Vec<OwnedFd>) {
    let (payload_len, _ack) = frame::recv_frame_header(fd).unwrap();
    let mut payload = vec![0u8; payload_len as usize];
    let mut iov = [IoSliceMut::new(&mut payload)];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 8]);
    let msg = recvmsg::<()>(fd, &mut iov, Some(&mut cmsg_buffer), MsgFlags::empty()).unwrap();
    assert_eq!(msg.bytes, payload_len as usize);
    let mut fds = Vec::new();
    for cmsg in msg.cmsgs().unwrap() {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            for raw in received {
                fds.push(unsafe { OwnedFd::from_raw_fd(raw) });
            }
        }
    }
    assert!(fds.len() <= max_fds);
    (payload, fds)
}

async fn run_with_client<F>(ctx: &TestContext, client: F)
where
    F: FnOnce(std::path::PathBuf) + Send + 'static,
{
    let path = ctx.socket_path.clone();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let sup = &ctx.supervisor;
            tokio::select! {
                _ = sup.run() => panic!("supervisor loop ended"),
                res = tokio::task::spawn_blocking(move || client(path)) => {
                    res.expect("client panicked");
                    // Let the disconnect path run.
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                }
            }
        })
        .await;
}

// ============================================================================
// HANDSHAKE AND EVENT STREAM
// ============================================================================

#[tokio::test]
async fn handshake_then_shmq_and_socket_traffic() {
    let ctx = context(None);

    run_with_client(&ctx, |path| {
        let (stream, mut writer) = client_handshake(&path, 4242);
        let fd = stream.as_raw_fd();

        // scproc_resp comes back with our ack id and no shortcut.
        let resp = frame::recv_frame(fd).unwrap();
        assert_eq!(resp.ack_id, 1);
        let resp = wire::scproc_resp::View::from_bytes(resp.payload());
        assert!(!resp.shortcut());

        // A hot-path message with an ack: the supervisor finds it on the
        // queue and acks on the socket.
        let mut open = wire::open::Builder::new();
        open.set_pathname("/work/x.c");
        open.set_flags(libc::O_RDONLY);
        open.set_ret(7);
        open.set_pre_open_sent(false);
        shmq_send(&mut writer, &open, 2);
        expect_ack(fd, 2);

        // A barrier, then an ordering-sensitive close on the socket.
        let barrier = wire::barrier::Builder::new();
        shmq_send(&mut writer, &barrier, 3);
        expect_ack(fd, 3);

        let mut close = wire::close::Builder::new();
        close.set_fd(7);
        frame::send_frame(fd, &close, 4).unwrap();
        expect_ack(fd, 4);
    })
    .await;

    let recorded = ctx.recorded.lock().unwrap();
    assert!(recorded.messages.contains(&"scproc_query:4242".to_string()));
    let open_pos = recorded
        .messages
        .iter()
        .position(|m| m == "open")
        .expect("open observed");
    let close_pos = recorded
        .messages
        .iter()
        .position(|m| m == "close")
        .expect("close observed");
    assert!(open_pos < close_pos, "shmq message ordered before the close");
    assert!(recorded.messages.contains(&"disconnect".to_string()));
}

#[tokio::test]
async fn shortcut_decision_reaches_the_interceptor() {
    let ctx = context(Some(42));

    run_with_client(&ctx, |path| {
        let (stream, _writer) = client_handshake(&path, 77);
        let resp = frame::recv_frame(stream.as_raw_fd()).unwrap();
        let resp = wire::scproc_resp::View::from_bytes(resp.payload());
        assert!(resp.shortcut());
        assert!(resp.has_exit_status());
        assert_eq!(resp.exit_status(), 42);
    })
    .await;
}

// ============================================================================
// PIPE INTERCEPTION
// ============================================================================

#[tokio::test]
async fn pipe_request_yields_working_intercepted_pipe() {
    let ctx = context(None);

    run_with_client(&ctx, |path| {
        let (stream, _writer) = client_handshake(&path, 100);
        let fd = stream.as_raw_fd();
        let _resp = frame::recv_frame(fd).unwrap();

        let mut req = wire::pipe_request::Builder::new();
        req.set_flags(0);
        frame::send_frame(fd, &req, 0).unwrap();

        let (payload, fds) = recv_frame_with_fds(fd, 2);
        let created = wire::pipe_created::View::from_bytes(&payload);
        assert!(!created.has_error_no());
        assert_eq!(fds.len(), 2, "two pipe endpoints expected");

        // Data written at the write end comes out of the read end, having
        // passed through (and been recorded by) the supervisor.
        use std::io::{Read, Write};
        let payload_bytes = b"compiler output line\n";
        let mut write_end = std::fs::File::from(fds[1].try_clone().unwrap());
        write_end.write_all(payload_bytes).unwrap();
        let mut read_end = std::fs::File::from(fds[0].try_clone().unwrap());
        let mut back = [0u8; 64];
        let n = read_end.read(&mut back).unwrap();
        assert_eq!(&back[..n], payload_bytes);
    })
    .await;

    let recorded = ctx.recorded.lock().unwrap();
    assert_eq!(recorded.pipe_data, b"compiler output line\n");
    assert!(recorded.messages.contains(&"pipe_request".to_string()));
}

// ============================================================================
// POPEN FD REPLY
// ============================================================================

#[tokio::test]
async fn popen_reply_carries_a_supervisor_fed_fd() {
    let ctx = context(None);
    let endpoint_cell = ctx.popen_endpoint.clone();
    let path = ctx.socket_path.clone();

    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let sup = &ctx.supervisor;
            let client = tokio::task::spawn_blocking(move || {
                let (stream, mut writer) = client_handshake(&path, 200);
                let fd = stream.as_raw_fd();
                let _resp = frame::recv_frame(fd).unwrap();

                // Announce the popen (read mode), then ask for the
                // substitute fd.
                let mut popen = wire::popen::Builder::new();
                popen.set_cmd("ls -l");
                popen.set_type_flags(libc::O_RDONLY);
                shmq_send(&mut writer, &popen, 5);
                expect_ack(fd, 5);

                let mut parent = wire::popen_parent::Builder::new();
                parent.set_fd(9);
                frame::send_frame(fd, &parent, 0).unwrap();

                let (payload, fds) = recv_frame_with_fds(fd, 1);
                let _view = wire::popen_fd::View::from_bytes(&payload);
                assert_eq!(fds.len(), 1);

                // The supervisor feeds the stream; we are the reader.
                use std::io::Read;
                let mut reader = std::fs::File::from(fds[0].try_clone().unwrap());
                let mut buf = [0u8; 16];
                let n = reader.read(&mut buf).unwrap();
                assert_eq!(&buf[..n], b"cached out\n");
            });

            tokio::select! {
                _ = sup.run() => panic!("supervisor loop ended"),
                _ = async {
                    // Wait for the endpoint to show up, then feed it.
                    loop {
                        let sender = endpoint_cell.borrow_mut().take();
                        if let Some(PopenEndpoint::Feed(mut s)) = sender {
                            s.write_all(b"cached out\n").await.unwrap();
                            break;
                        }
                        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                    }
                    // Keep serving until the client is done.
                    std::future::pending::<()>().await;
                } => unreachable!(),
                res = client => res.expect("client"),
            }
        })
        .await;
}
