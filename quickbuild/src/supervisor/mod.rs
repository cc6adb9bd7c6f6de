//! The supervisor event loop.
//!
//! Single-threaded cooperative over the kernel's readiness multiplexer: a
//! current-thread tokio runtime with local tasks. One task per connection,
//! plus one ferry task per intercepted pipe.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tokio::net::UnixListener;

use quickbuild_shared::errors::{QbError, QbResult};

pub mod conn;
pub mod pipes;
pub mod sink;

use sink::EventSink;

pub struct Supervisor {
    listener: UnixListener,
    socket_path: PathBuf,
    sink: Rc<RefCell<dyn EventSink>>,
}

impl Supervisor {
    /// Bind the supervisor socket. `prefix` is the value handed to the
    /// interceptor in `FB_SOCKET`; the actual socket is `prefix` + `"0"`.
    pub fn bind(prefix: &Path, sink: Rc<RefCell<dyn EventSink>>) -> QbResult<Supervisor> {
        let mut name = prefix.as_os_str().to_os_string();
        name.push("0");
        let socket_path = PathBuf::from(name);
        let listener = UnixListener::bind(&socket_path).map_err(|e| {
            QbError::Supervisor(format!(
                "cannot bind {}: {}",
                socket_path.display(),
                e
            ))
        })?;
        tracing::debug!(path = %socket_path.display(), "supervisor socket bound");
        Ok(Supervisor {
            listener,
            socket_path,
            sink,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept interceptor connections forever, spawning one local task per
    /// process. Run inside a `LocalSet`; select against the build root's
    /// exit to terminate.
    pub async fn run(&self) -> QbResult<()> {
        loop {
            let (stream, _addr) = self
                .listener
                .accept()
                .await
                .map_err(|e| QbError::Supervisor(format!("accept failed: {}", e)))?;
            tracing::trace!("interceptor connected");
            tokio::task::spawn_local(conn::handle_connection(stream, self.sink.clone()));
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}
