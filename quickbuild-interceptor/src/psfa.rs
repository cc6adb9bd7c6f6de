//! Shadow bookkeeping for `posix_spawn_file_actions_t`.
//!
//! The opaque libc type is mutated by a sequence of adder calls before
//! `posix_spawn()` consumes it. We mirror each mutation into a side table
//! keyed by the actions pointer, as serialized action descriptors:
//! `o <fd> <flags> <mode> <path>`, `c <fd>`, `d <oldfd> <newfd>`.
//!
//! Every function here must be called with the global lock held; the pool
//! is a plain `Vec` behind that lock.

use core::cell::UnsafeCell;
use std::io::Write;

use libc::{c_char, c_int, mode_t, posix_spawn_file_actions_t};

struct PsfaEntry {
    key: usize,
    actions: Vec<Vec<u8>>,
}

struct Pool(UnsafeCell<Vec<PsfaEntry>>);

// Guarded by IC_GLOBAL_LOCK; see the module docs.
unsafe impl Sync for Pool {}

static POOL: Pool = Pool(UnsafeCell::new(Vec::new()));

unsafe fn pool() -> &'static mut Vec<PsfaEntry> {
    &mut *POOL.0.get()
}

fn key(p: *const posix_spawn_file_actions_t) -> usize {
    p as usize
}

/// Bookkeeping after a successful `posix_spawn_file_actions_init()`: a new
/// empty entry. An existing entry for the same pointer is from a leaked
/// earlier object and is discarded.
pub unsafe fn psfa_init(p: *const posix_spawn_file_actions_t) {
    psfa_destroy(p);
    pool().push(PsfaEntry {
        key: key(p),
        actions: Vec::new(),
    });
}

/// Bookkeeping after a successful `posix_spawn_file_actions_destroy()`.
pub unsafe fn psfa_destroy(p: *const posix_spawn_file_actions_t) {
    let pool = pool();
    if let Some(idx) = pool.iter().position(|e| e.key == key(p)) {
        // Keep the pool dense; order among entries does not matter.
        pool.swap_remove(idx);
    }
}

fn find(p: *const posix_spawn_file_actions_t) -> Option<&'static mut PsfaEntry> {
    unsafe { pool() }.iter_mut().find(|e| e.key == key(p))
}

/// Record an addopen: `o <fd> <flags> <mode> <path>`.
pub unsafe fn psfa_addopen(
    p: *const posix_spawn_file_actions_t,
    fd: c_int,
    path: *const c_char,
    flags: c_int,
    mode: mode_t,
) {
    let Some(entry) = find(p) else { return };
    let path = core::ffi::CStr::from_ptr(path).to_bytes();
    let mut s = Vec::with_capacity(path.len() + 32);
    write!(s, "o {} {} {} ", fd, flags, mode).unwrap();
    s.extend_from_slice(path);
    entry.actions.push(s);
}

/// Record an addclose: `c <fd>`.
pub unsafe fn psfa_addclose(p: *const posix_spawn_file_actions_t, fd: c_int) {
    let Some(entry) = find(p) else { return };
    let mut s = Vec::with_capacity(16);
    write!(s, "c {}", fd).unwrap();
    entry.actions.push(s);
}

/// Record an adddup2: `d <oldfd> <newfd>`.
pub unsafe fn psfa_adddup2(p: *const posix_spawn_file_actions_t, oldfd: c_int, newfd: c_int) {
    let Some(entry) = find(p) else { return };
    let mut s = Vec::with_capacity(24);
    write!(s, "d {} {}", oldfd, newfd).unwrap();
    entry.actions.push(s);
}

/// The recorded descriptors for an actions object, in registration order.
/// Cloned so the caller can release the lock before serializing.
pub unsafe fn psfa_actions(p: *const posix_spawn_file_actions_t) -> Option<Vec<Vec<u8>>> {
    find(p).map(|e| e.actions.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // The pool expects the caller to hold the interceptor's global lock;
    // in tests a plain mutex stands in for it.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    fn fake_actions() -> Box<posix_spawn_file_actions_t> {
        Box::new(unsafe { core::mem::zeroed() })
    }

    #[test]
    fn records_actions_in_order() {
        let _guard = TEST_LOCK.lock().unwrap();
        let fa = fake_actions();
        let p: *const posix_spawn_file_actions_t = &*fa;
        unsafe {
            psfa_init(p);
            psfa_addopen(p, 3, c"/tmp/x".as_ptr(), libc::O_WRONLY | libc::O_CREAT, 0o600);
            psfa_addclose(p, 4);
            psfa_adddup2(p, 5, 6);

            let actions = psfa_actions(p).unwrap();
            assert_eq!(actions.len(), 3);
            let open_desc = format!(
                "o 3 {} {} /tmp/x",
                libc::O_WRONLY | libc::O_CREAT,
                0o600
            );
            assert_eq!(actions[0], open_desc.as_bytes());
            assert_eq!(actions[1], b"c 4");
            assert_eq!(actions[2], b"d 5 6");

            psfa_destroy(p);
            assert!(psfa_actions(p).is_none());
        }
    }

    #[test]
    fn reinit_discards_previous_recording() {
        let _guard = TEST_LOCK.lock().unwrap();
        let fa = fake_actions();
        let p: *const posix_spawn_file_actions_t = &*fa;
        unsafe {
            psfa_init(p);
            psfa_addclose(p, 9);
            psfa_init(p);
            assert_eq!(psfa_actions(p).unwrap().len(), 0);
            psfa_destroy(p);
        }
    }

    #[test]
    fn adders_without_init_are_ignored() {
        let _guard = TEST_LOCK.lock().unwrap();
        let fa = fake_actions();
        let p: *const posix_spawn_file_actions_t = &*fa;
        unsafe {
            psfa_addclose(p, 1);
            assert!(psfa_actions(p).is_none());
        }
    }
}
