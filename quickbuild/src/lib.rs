//! Quickbuild supervisor library.
//!
//! The supervisor accepts one connection per intercepted process, performs
//! the `scproc_query`/`scproc_resp` handshake, then keeps draining the
//! process's two channels: the control socket (ordering-sensitive and
//! fd-carrying messages) and the shared-memory queue (everything else). The
//! resulting event stream is handed to an [`EventSink`], the seam where the
//! fingerprinting/cache engine plugs in.

pub mod launch;
pub mod supervisor;

pub use launch::{launch_build, LaunchSpec};
pub use supervisor::sink::{EventSink, LoggingSink, ScprocDecision};
pub use supervisor::Supervisor;

pub use quickbuild_shared::errors::{QbError, QbResult};
