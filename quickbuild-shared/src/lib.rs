//! Protocol pieces shared by the Quickbuild supervisor and the preloaded
//! interceptor library: the FBB message codec, the frame format used on the
//! control socket, the shared-memory message queue, and the environment
//! variable names both halves agree on.
//!
//! Everything here has to be usable from inside an intercepted process, which
//! rules out allocation and locking on the paths that can run under a signal
//! handler. The codec builders borrow caller-owned data and serialize into
//! caller-provided buffers; the queue writer works on a raw shared mapping.

pub mod env;
pub mod errors;
pub mod fbb;
pub mod frame;
pub mod shmq;
pub mod wire;

pub use errors::{QbError, QbResult};
