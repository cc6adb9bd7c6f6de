//! The seam between the supervisor loop and the fingerprint/cache engine.

use quickbuild_shared::wire;
use tokio::net::unix::pipe;

/// The answer to a process's handshake.
#[derive(Debug, Clone, Default)]
pub struct ScprocDecision {
    /// `Some(exit_status)` short-circuits the process: it exits with this
    /// status instead of running.
    pub shortcut: Option<i32>,
    /// Debug flags granted to the interceptor.
    pub debug_flags: i32,
}

/// The supervisor's end of a popen()'d stream, to be wired to the command's
/// other half by the process-tree engine.
pub enum PopenEndpoint {
    /// The application reads; the engine feeds data in.
    Feed(pipe::Sender),
    /// The application writes; the engine consumes.
    Consume(pipe::Receiver),
}

/// Consumer of the observation stream. The default implementation only
/// logs; the cache engine supplies the real one.
pub trait EventSink {
    /// Answer a process's handshake.
    fn decide_scproc(&mut self, query: &wire::scproc_query::View<'_>) -> ScprocDecision;

    /// One message from a process, in that process's channel order.
    fn on_message(&mut self, pid: i32, msg: &wire::AnyView<'_>);

    /// Data observed flowing through an intercepted pipe. `fd0` is the read
    /// end's fd number in the creating process.
    fn on_pipe_data(&mut self, pid: i32, fd0: i32, data: &[u8]);

    /// The supervisor-side endpoint of a popen()'d stream.
    fn on_popen_endpoint(&mut self, pid: i32, fd: i32, endpoint: PopenEndpoint);

    /// The process's connection went away.
    fn on_disconnect(&mut self, pid: i32);
}

/// Sink that traces everything and never shortcuts.
#[derive(Default)]
pub struct LoggingSink;

impl EventSink for LoggingSink {
    fn decide_scproc(&mut self, query: &wire::scproc_query::View<'_>) -> ScprocDecision {
        let arg: Vec<String> = query
            .arg_iter()
            .map(|a| String::from_utf8_lossy(a).into_owned())
            .collect();
        tracing::info!(
            pid = query.pid(),
            ppid = query.ppid(),
            cwd = %String::from_utf8_lossy(query.cwd()),
            ?arg,
            "process handshake"
        );
        ScprocDecision::default()
    }

    fn on_message(&mut self, pid: i32, msg: &wire::AnyView<'_>) {
        tracing::debug!(pid, msg = msg.name(), "intercepted call");
    }

    fn on_pipe_data(&mut self, pid: i32, fd0: i32, data: &[u8]) {
        tracing::trace!(pid, fd0, len = data.len(), "pipe traffic");
    }

    fn on_popen_endpoint(&mut self, pid: i32, fd: i32, endpoint: PopenEndpoint) {
        let dir = match endpoint {
            PopenEndpoint::Feed(_) => "feed",
            PopenEndpoint::Consume(_) => "consume",
        };
        tracing::debug!(pid, fd, dir, "popen endpoint");
    }

    fn on_disconnect(&mut self, pid: i32) {
        tracing::debug!(pid, "process disconnected");
    }
}
