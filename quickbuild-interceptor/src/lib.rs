//! The Quickbuild interceptor: a `cdylib` preloaded into every process of an
//! observed build.
//!
//! The exported wrapper symbols shadow the libc entry points of interest.
//! Each wrapper consults the per-process state tables, calls the original
//! function (resolved once via `dlsym(RTLD_NEXT)`), and reports the call to
//! the supervisor over the shared-memory queue or the control socket.
//!
//! Everything in here has to tolerate arbitrary signal delivery, survive
//! `fork()` in both halves of the connection, and avoid allocation and
//! locking on the paths reachable from a signal handler. The only locks are
//! two word-sized spinlocks that the at-fork child handler can safely
//! re-initialize.

#![allow(clippy::missing_safety_doc)]

pub mod envfix;
pub mod fdstate;
pub mod intercept;
pub mod lock;
pub mod orig;
pub mod psfa;
pub mod signals;
pub mod tls;

#[cfg(not(test))]
mod wrappers;

/// Run the interceptor's initialization as early as the dynamic loader
/// allows. Initialization is also triggered lazily from the first
/// intercepted call, whichever comes first.
#[cfg(not(test))]
#[used]
#[link_section = ".init_array"]
static IC_CTOR: extern "C" fn() = {
    extern "C" fn ctor() {
        crate::intercept::ic_load();
    }
    ctor
};
