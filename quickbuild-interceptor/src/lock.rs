//! The interceptor's process-wide locks.
//!
//! These are word-sized atomic spinlocks rather than pthread mutexes: they
//! are async-signal-safe to take where the protocol allows it, and the
//! at-fork child handler can re-initialize them with a plain store. The
//! pre-fork holder, if any, does not exist in the child, so re-initializing
//! (not unlocking) is the correct move there.

use core::sync::atomic::{AtomicBool, Ordering};

pub struct IcLock {
    locked: AtomicBool,
}

impl IcLock {
    pub const fn new() -> IcLock {
        IcLock {
            locked: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            unsafe { libc::sched_yield() };
        }
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Forcibly return the lock to the unlocked state. Only valid when no
    /// other thread can hold it, i.e. in the at-fork child handler.
    pub fn reinit(&self) {
        self.locked.store(false, Ordering::SeqCst);
    }
}

impl Default for IcLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializes critical interceptor actions: per-fd state updates, the
/// posix_spawn file-actions pool, the popened-stream set, socket writes and
/// ack receipt.
pub static IC_GLOBAL_LOCK: IcLock = IcLock::new();

/// Serializes system(), popen(), pclose() and the posix_spawn family, so
/// the supervisor sees at most one child-creating event in flight per
/// process.
pub static IC_SYSTEM_POPEN_LOCK: IcLock = IcLock::new();

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn lock_excludes_concurrent_critical_sections() {
        let lock = Arc::new(IcLock::new());
        let counter = Arc::new(AtomicU32::new(0));
        let mut handles = vec![];

        for _ in 0..4 {
            let lock = lock.clone();
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    lock.lock();
                    let v = counter.load(Ordering::SeqCst);
                    counter.store(v + 1, Ordering::SeqCst);
                    lock.unlock();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 4000);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = IcLock::new();
        lock.lock();
        assert!(!lock.try_lock());
        lock.unlock();
        assert!(lock.try_lock());
        lock.unlock();
    }

    #[test]
    fn reinit_recovers_a_lock_orphaned_by_fork() {
        let lock = IcLock::new();
        lock.lock();
        // The holder is gone after fork(); the child re-initializes.
        lock.reinit();
        assert!(lock.try_lock());
        lock.unlock();
    }
}
