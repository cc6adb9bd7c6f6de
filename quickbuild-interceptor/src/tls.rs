//! Per-thread interception state.
//!
//! All fields are const-initialized `Cell`s so first access from any thread,
//! including inside a signal handler, does not allocate.

use core::cell::Cell;

pub struct IcTls {
    /// Name of the outermost intercepted call, as a debugging breadcrumb.
    pub intercept_on: Cell<*const u8>,
    /// Depth of the signal danger zone. While non-zero, asynchronous
    /// signals are recorded in `delayed_signals_bitmap` instead of running
    /// the user handler.
    pub signal_danger_zone_depth: Cell<i32>,
    /// Whether this thread holds [`IC_GLOBAL_LOCK`](crate::lock::IC_GLOBAL_LOCK).
    pub has_global_lock: Cell<bool>,
    /// Nesting depth of user signal handlers currently running.
    pub signal_handler_running_depth: Cell<i32>,
    /// Depth of intentional libc re-entry (e.g. the fork wrapper calling
    /// the real fork).
    pub libc_nesting_depth: Cell<i32>,
    /// One bit per signal number (1-based) delayed inside a danger zone.
    pub delayed_signals_bitmap: Cell<u64>,
}

thread_local! {
    pub static IC_TLS: IcTls = const {
        IcTls {
            intercept_on: Cell::new(core::ptr::null()),
            signal_danger_zone_depth: Cell::new(0),
            has_global_lock: Cell::new(false),
            signal_handler_running_depth: Cell::new(0),
            libc_nesting_depth: Cell::new(0),
            delayed_signals_bitmap: Cell::new(0),
        }
    };
}

/// Enter a region in which asynchronous signal delivery is deferred.
#[inline]
pub fn danger_zone_enter() {
    IC_TLS.with(|t| {
        t.signal_danger_zone_depth
            .set(t.signal_danger_zone_depth.get() + 1)
    });
}

/// Leave the danger zone; on the outermost exit, re-raise any signals that
/// arrived inside it.
#[inline]
pub fn danger_zone_leave() {
    let raise = IC_TLS.with(|t| {
        let depth = t.signal_danger_zone_depth.get() - 1;
        t.signal_danger_zone_depth.set(depth);
        debug_assert!(depth >= 0);
        depth == 0 && t.delayed_signals_bitmap.get() != 0
    });
    if raise {
        crate::signals::raise_delayed_signals();
    }
}

#[inline]
pub fn in_danger_zone() -> bool {
    IC_TLS.with(|t| t.signal_danger_zone_depth.get() > 0)
}

/// Reset every per-thread flag. Called by the at-fork child handler on the
/// only surviving thread.
pub fn reset_after_fork() {
    IC_TLS.with(|t| {
        t.intercept_on.set(core::ptr::null());
        t.signal_danger_zone_depth.set(0);
        t.has_global_lock.set(false);
        t.signal_handler_running_depth.set(0);
        t.libc_nesting_depth.set(0);
        t.delayed_signals_bitmap.set(0);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn danger_zone_nests() {
        danger_zone_enter();
        danger_zone_enter();
        assert!(in_danger_zone());
        danger_zone_leave();
        assert!(in_danger_zone());
        danger_zone_leave();
        assert!(!in_danger_zone());
    }

    #[test]
    fn reset_after_fork_clears_everything() {
        IC_TLS.with(|t| {
            t.has_global_lock.set(true);
            t.delayed_signals_bitmap.set(0b1010);
            t.libc_nesting_depth.set(2);
        });
        reset_after_fork();
        IC_TLS.with(|t| {
            assert!(!t.has_global_lock.get());
            assert_eq!(t.delayed_signals_bitmap.get(), 0);
            assert_eq!(t.libc_nesting_depth.get(), 0);
        });
    }
}
