//! The dense per-fd state table.
//!
//! One byte of flags per file descriptor up to a fixed cap; descriptors
//! beyond the cap behave as if permanently in the default state. The
//! `NOTIFY_*` bits mean "the next operation of this kind on this fd must be
//! reported": they start set (every fd present at startup is inherited),
//! are cleared once reported or when the process itself creates the fd, and
//! are set again when the fd is closed so an unseen reuse of the number is
//! reported like a fresh inherited fd.
//!
//! The table is written under the global lock; reads are relaxed atomics so
//! the fast no-report checks stay lock-free.

use core::sync::atomic::{AtomicU8, Ordering};
use libc::c_int;

pub const IC_FD_STATES_SIZE: usize = 4096;

pub const NOTIFY_READ: u8 = 1 << 0;
pub const NOTIFY_PREAD: u8 = 1 << 1;
pub const NOTIFY_WRITE: u8 = 1 << 2;
pub const NOTIFY_PWRITE: u8 = 1 << 3;
pub const NOTIFY_SEEK: u8 = 1 << 4;
pub const NOTIFY_TELL: u8 = 1 << 5;
/// The fd is an endpoint of a supervisor-intercepted pipe (from pipe2() or
/// popen()); its close has to travel on the socket, behind a barrier.
pub const PIPE_END: u8 = 1 << 6;

const NOTIFY_ALL: u8 =
    NOTIFY_READ | NOTIFY_PREAD | NOTIFY_WRITE | NOTIFY_PWRITE | NOTIFY_SEEK | NOTIFY_TELL;

static FD_STATES: [AtomicU8; IC_FD_STATES_SIZE] =
    [const { AtomicU8::new(NOTIFY_ALL) }; IC_FD_STATES_SIZE];

fn slot(fd: c_int) -> Option<&'static AtomicU8> {
    if fd >= 0 && (fd as usize) < IC_FD_STATES_SIZE {
        Some(&FD_STATES[fd as usize])
    } else {
        None
    }
}

fn has_bit(fd: c_int, bit: u8) -> bool {
    match slot(fd) {
        Some(s) => s.load(Ordering::Relaxed) & bit != 0,
        // Out-of-table fds always notify, and the clear is a no-op.
        None => true,
    }
}

fn clear_bits(fd: c_int, bits: u8) {
    if let Some(s) = slot(fd) {
        s.fetch_and(!bits, Ordering::Relaxed);
    }
}

fn set_bits(fd: c_int, bits: u8) {
    if let Some(s) = slot(fd) {
        s.fetch_or(bits, Ordering::Relaxed);
    }
}

pub fn notify_on_read(fd: c_int, is_pread: bool) -> bool {
    has_bit(fd, if is_pread { NOTIFY_PREAD } else { NOTIFY_READ })
}

pub fn set_read_reported(fd: c_int, is_pread: bool) {
    clear_bits(fd, if is_pread { NOTIFY_PREAD } else { NOTIFY_READ });
}

pub fn notify_on_write(fd: c_int, is_pwrite: bool) -> bool {
    has_bit(fd, if is_pwrite { NOTIFY_PWRITE } else { NOTIFY_WRITE })
}

pub fn set_write_reported(fd: c_int, is_pwrite: bool) {
    clear_bits(fd, if is_pwrite { NOTIFY_PWRITE } else { NOTIFY_WRITE });
}

/// `modify_offset` distinguishes a real seek from a position query (ftell,
/// SEEK_CUR with offset 0 is still a seek as far as reporting goes).
pub fn notify_on_seek(fd: c_int, modify_offset: bool) -> bool {
    has_bit(fd, if modify_offset { NOTIFY_SEEK } else { NOTIFY_TELL })
}

pub fn set_seek_reported(fd: c_int, modify_offset: bool) {
    // A real seek covers future position queries too.
    clear_bits(
        fd,
        if modify_offset {
            NOTIFY_SEEK | NOTIFY_TELL
        } else {
            NOTIFY_TELL
        },
    );
}

/// The process opened (or received through an intercepted channel) this fd
/// itself; nothing about it needs first-use notifications.
pub fn clear_notify(fd: c_int) {
    if let Some(s) = slot(fd) {
        s.store(0, Ordering::Relaxed);
    }
}

/// The fd was closed. A later reuse of the number that we do not observe
/// must be reported like an inherited fd again.
pub fn reset_fd(fd: c_int) {
    if let Some(s) = slot(fd) {
        s.store(NOTIFY_ALL, Ordering::Relaxed);
    }
}

pub fn reset_range(first: u32, last: u32) {
    let hi = core::cmp::min(last as usize, IC_FD_STATES_SIZE - 1);
    let mut fd = first as usize;
    while fd <= hi {
        FD_STATES[fd].store(NOTIFY_ALL, Ordering::Relaxed);
        fd += 1;
    }
}

pub fn reset_from(lowfd: c_int) {
    if lowfd < 0 {
        return;
    }
    reset_range(lowfd as u32, u32::MAX);
}

pub fn copy_state(to_fd: c_int, from_fd: c_int) {
    if let (Some(to), Some(from)) = (slot(to_fd), slot(from_fd)) {
        to.store(from.load(Ordering::Relaxed), Ordering::Relaxed);
    }
}

pub fn mark_pipe(fd: c_int) {
    set_bits(fd, PIPE_END);
}

pub fn is_pipe(fd: c_int) -> bool {
    match slot(fd) {
        Some(s) => s.load(Ordering::Relaxed) & PIPE_END != 0,
        None => false,
    }
}

/// After fork every fd is, from the supervisor's point of view, inherited
/// by a fresh process: re-arm the notifications. Pipe endpoints stay pipe
/// endpoints.
pub fn reset_all_for_fork() {
    for s in FD_STATES.iter() {
        s.fetch_or(NOTIFY_ALL, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, MutexGuard};

    // The table is process-global and reset_all_for_fork touches every
    // slot, so tests are serialized and each uses a distinct fd range.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    fn serial() -> MutexGuard<'static, ()> {
        TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[test]
    fn first_read_notifies_then_stays_quiet() {
        let _guard = serial();
        let fd = 100;
        reset_fd(fd);
        assert!(notify_on_read(fd, false));
        set_read_reported(fd, false);
        assert!(!notify_on_read(fd, false));
        // pread is tracked separately.
        assert!(notify_on_read(fd, true));
        set_read_reported(fd, true);
        assert!(!notify_on_read(fd, true));
    }

    #[test]
    fn close_rearms_notifications() {
        let _guard = serial();
        let fd = 110;
        reset_fd(fd);
        set_read_reported(fd, false);
        set_write_reported(fd, false);
        assert!(!notify_on_read(fd, false));
        reset_fd(fd);
        assert!(notify_on_read(fd, false));
        assert!(notify_on_write(fd, false));
    }

    #[test]
    fn own_open_clears_all_notifications() {
        let _guard = serial();
        let fd = 120;
        reset_fd(fd);
        clear_notify(fd);
        assert!(!notify_on_read(fd, false));
        assert!(!notify_on_write(fd, true));
        assert!(!notify_on_seek(fd, true));
    }

    #[test]
    fn dup2_copies_state_between_slots() {
        let _guard = serial();
        let (from, to) = (130, 131);
        reset_fd(from);
        set_read_reported(from, false);
        mark_pipe(from);
        reset_fd(to);

        copy_state(to, from);
        assert!(!notify_on_read(to, false));
        assert!(notify_on_write(to, false));
        assert!(is_pipe(to));
    }

    #[test]
    fn seek_reporting_covers_tell() {
        let _guard = serial();
        let fd = 140;
        reset_fd(fd);
        assert!(notify_on_seek(fd, false));
        set_seek_reported(fd, true);
        assert!(!notify_on_seek(fd, true));
        assert!(!notify_on_seek(fd, false));

        reset_fd(fd);
        // A bare tell does not cover later real seeks.
        set_seek_reported(fd, false);
        assert!(!notify_on_seek(fd, false));
        assert!(notify_on_seek(fd, true));
    }

    #[test]
    fn range_reset_clears_pipe_flags_too() {
        let _guard = serial();
        let fd = 150;
        clear_notify(fd);
        mark_pipe(fd);
        reset_range(150, 155);
        assert!(!is_pipe(fd));
        assert!(notify_on_read(fd, false));
    }

    #[test]
    fn out_of_table_fds_always_notify() {
        let _guard = serial();
        let fd = IC_FD_STATES_SIZE as c_int + 5;
        assert!(notify_on_read(fd, false));
        set_read_reported(fd, false);
        assert!(notify_on_read(fd, false));
        assert!(!is_pipe(fd));
    }

    #[test]
    fn fork_reset_keeps_pipe_bits() {
        let _guard = serial();
        let fd = 160;
        clear_notify(fd);
        mark_pipe(fd);
        reset_all_for_fork();
        assert!(notify_on_read(fd, false));
        assert!(is_pipe(fd));
    }
}
